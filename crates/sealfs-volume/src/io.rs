//! Positional I/O helpers and backing-error translation

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use sealfs_core::SealfsError;

/// Read until `buf` is full or EOF. Returns the number of bytes read.
///
/// `EINTR` is retried; every other error is returned.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Map a backing-store error onto the volume error for plaintext `path`.
pub fn backing_error(err: io::Error, path: &str) -> SealfsError {
    match err.kind() {
        io::ErrorKind::NotFound => return SealfsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => return SealfsError::AlreadyExists(path.to_string()),
        _ => {}
    }
    match err.raw_os_error() {
        Some(libc::ENOTDIR) => SealfsError::NotADirectory(path.to_string()),
        Some(libc::EISDIR) => SealfsError::IsADirectory(path.to_string()),
        Some(libc::ENOTEMPTY) => SealfsError::DirectoryNotEmpty(path.to_string()),
        Some(libc::ENAMETOOLONG) => SealfsError::NameTooLong {
            len: path.len(),
            limit: libc::PATH_MAX as usize,
        },
        _ => SealfsError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn read_full_at_stops_at_eof() {
        let f = tempfile().unwrap();
        f.write_all_at(b"hello world", 0).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(read_full_at(&f, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(read_full_at(&f, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn backing_errors_keep_plaintext_path() {
        let err = backing_error(io::Error::from(io::ErrorKind::NotFound), "docs/a.txt");
        assert!(matches!(err, SealfsError::NotFound(p) if p == "docs/a.txt"));

        let err = backing_error(io::Error::from_raw_os_error(libc::ENOTEMPTY), "d");
        assert!(matches!(err, SealfsError::DirectoryNotEmpty(_)));

        let err = backing_error(io::Error::from_raw_os_error(libc::ENOSPC), "d");
        assert!(matches!(err, SealfsError::Io(_)));
    }
}
