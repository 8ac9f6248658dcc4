use thiserror::Error;

pub type SealfsResult<T> = Result<T, SealfsError>;

#[derive(Debug, Error)]
pub enum SealfsError {
    /// Passphrase or raw key failed to unwrap the volume key.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A backing file's header is short, unknown, or disagrees with the volume.
    #[error("corrupt file header: {0}")]
    CorruptHeader(String),

    /// Block tag mismatch. The decrypted payload is never returned.
    #[error("integrity check failed for block {block}")]
    Integrity { block: u64 },

    /// Encoded name did not decode, or a plaintext name cannot be encoded.
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("name too long: {len} bytes encoded (limit {limit})")]
    NameTooLong { len: usize, limit: usize },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("volume not initialized: {0}")]
    NotInitialized(String),

    #[error("volume already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("volume is unmounted")]
    Unmounted,

    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SealfsError {
    /// True for failures that come from key, tag, or header verification.
    ///
    /// These are never retried and never downgraded to empty results.
    pub fn is_crypto_failure(&self) -> bool {
        matches!(
            self,
            SealfsError::Authentication(_)
                | SealfsError::CorruptHeader(_)
                | SealfsError::Integrity { .. }
                | SealfsError::InvalidName(_)
                | SealfsError::Crypto(_)
        )
    }

    /// POSIX errno an OS adaptor should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            SealfsError::Authentication(_) => libc::EACCES,
            SealfsError::CorruptHeader(_)
            | SealfsError::Integrity { .. }
            | SealfsError::Crypto(_) => libc::EIO,
            SealfsError::InvalidName(_) => libc::EINVAL,
            SealfsError::NameTooLong { .. } => libc::ENAMETOOLONG,
            SealfsError::UnsupportedOperation(_) => libc::EPERM,
            SealfsError::NotInitialized(_) | SealfsError::NotFound(_) => libc::ENOENT,
            SealfsError::AlreadyInitialized(_) | SealfsError::AlreadyExists(_) => libc::EEXIST,
            SealfsError::NotADirectory(_) => libc::ENOTDIR,
            SealfsError::IsADirectory(_) => libc::EISDIR,
            SealfsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            SealfsError::Unmounted => libc::ENODEV,
            SealfsError::Config(_) => libc::EINVAL,
            SealfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_failures_are_distinguishable_from_io() {
        assert!(SealfsError::Integrity { block: 3 }.is_crypto_failure());
        assert!(SealfsError::CorruptHeader("short".into()).is_crypto_failure());
        assert!(SealfsError::Authentication("bad".into()).is_crypto_failure());
        let io = SealfsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(!io.is_crypto_failure());
        assert_eq!(io.errno(), libc::ENOSPC);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(SealfsError::Integrity { block: 0 }.errno(), libc::EIO);
        assert_eq!(
            SealfsError::UnsupportedOperation("link".into()).errno(),
            libc::EPERM
        );
        assert_eq!(SealfsError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(
            SealfsError::NameTooLong { len: 300, limit: 255 }.errno(),
            libc::ENAMETOOLONG
        );
    }
}
