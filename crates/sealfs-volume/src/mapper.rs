//! Directory/inode mapper: plaintext paths to encoded backing paths.
//!
//! A plaintext path `a/b/c` maps to `<root>/E(a, ctx_root)/E(b, ctx_a)/E(c, ctx_b)`
//! where `ctx_x` is the name context stored in directory `x`. Contexts travel
//! with their directory, so a directory rename never re-encodes descendants.

use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use sealfs_core::{FileKind, IvPolicy, NameContextMode, SealfsError, SealfsResult};
use sealfs_crypto::{validate_name, DirContext, DIR_CONTEXT_SIZE};

use crate::control::{DIRIV_FILE, RESERVED_PREFIX};
use crate::file::CryptFile;
use crate::header::{binding_mask, SeedMask};
use crate::io::backing_error;
use crate::volume::{MountedKeys, Volume};

/// One decoded directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    /// Backing (encoded) name
    pub encoded: String,
}

/// Result of [`Volume::readdir`]
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub entries: Vec<DirEntry>,
    /// Backing names that did not decode under this directory's context
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub kind: FileKind,
    /// Logical size for files, target length for symlinks
    pub size: u64,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    /// Permission bits
    pub mode: u32,
    pub nlink: u64,
}

/// A resolved non-root entry
struct Located {
    parent_ctx: DirContext,
    name: String,
    backing: PathBuf,
    plain: String,
}

/// Split a plaintext path into validated segments. Empty segments are
/// ignored, so `/a//b/` is `a/b`.
fn split_path(path: &str) -> SealfsResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments {
        validate_name(segment)?;
    }
    Ok(segments)
}

fn file_kind(ft: fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

/// Read the name context of backing directory `dir`.
pub(crate) fn read_dir_context(dir: &Path, mode: NameContextMode, plain: &str) -> SealfsResult<DirContext> {
    if mode == NameContextMode::Global {
        return Ok(DirContext::zero());
    }
    match fs::read(dir.join(DIRIV_FILE)) {
        Ok(bytes) => <[u8; DIR_CONTEXT_SIZE]>::try_from(bytes.as_slice())
            .map(DirContext::from_bytes)
            .map_err(|_| {
                SealfsError::CorruptHeader(format!("{plain}: directory context has {} bytes", bytes.len()))
            }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::symlink_metadata(dir) {
            Ok(meta) if meta.is_dir() => Err(SealfsError::CorruptHeader(format!(
                "{plain}: directory context missing"
            ))),
            Ok(_) => Err(SealfsError::NotADirectory(plain.to_string())),
            Err(_) => Err(SealfsError::NotFound(plain.to_string())),
        },
        Err(e) => Err(backing_error(e, plain)),
    }
}

pub(crate) fn write_dir_context(dir: &Path, ctx: &DirContext) -> SealfsResult<()> {
    fs::write(dir.join(DIRIV_FILE), ctx.as_bytes())?;
    Ok(())
}

impl Volume {
    /// Walk plaintext directory segments from the root.
    fn walk_dir(
        &self,
        keys: &MountedKeys,
        segments: &[&str],
    ) -> SealfsResult<(PathBuf, DirContext)> {
        let mut dir = self.session.root.clone();
        let mut ctx = self.session.root_ctx;
        for (depth, segment) in segments.iter().enumerate() {
            dir.push(keys.names.encode(segment, &ctx)?);
            ctx = read_dir_context(&dir, self.session.record.name_context, &segments[..=depth].join("/"))?;
        }
        Ok((dir, ctx))
    }

    fn locate(&self, keys: &MountedKeys, path: &str) -> SealfsResult<Located> {
        let segments = split_path(path)?;
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| SealfsError::InvalidName("the volume root has no name".into()))?;
        let (parent, parent_ctx) = self.walk_dir(keys, parents)?;
        let backing = parent.join(keys.names.encode(name, &parent_ctx)?);
        Ok(Located {
            parent_ctx,
            name: name.to_string(),
            backing,
            plain: segments.join("/"),
        })
    }

    /// Backing path of any entry, the root included.
    fn backing_path(&self, keys: &MountedKeys, path: &str) -> SealfsResult<(PathBuf, String)> {
        if split_path(path)?.is_empty() {
            return Ok((self.session.root.clone(), "/".into()));
        }
        let loc = self.locate(keys, path)?;
        Ok((loc.backing, loc.plain))
    }

    fn seed_mask(&self, keys: &MountedKeys, parent: &DirContext, name: &str) -> Option<SeedMask> {
        match self.session.record.iv_policy {
            IvPolicy::Header => None,
            IvPolicy::PathBound => Some(binding_mask(keys.keys.binding_key(), parent, name)),
        }
    }

    /// Create a new, empty file. Fails if the path exists.
    pub fn create(&self, path: &str, mode: u32) -> SealfsResult<CryptFile> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&loc.backing)
                .map_err(|e| backing_error(e, &loc.plain))?;

            let mask = self.seed_mask(keys, &loc.parent_ctx, &loc.name);
            let header = match self.session.format.create_header(&file, mask.as_ref()) {
                Ok(header) => header,
                Err(e) => {
                    let _ = fs::remove_file(&loc.backing);
                    return Err(e);
                }
            };
            debug!(path = %loc.plain, "created file");
            CryptFile::new(Arc::clone(&self.session), file, header, loc.plain, true)
        })
    }

    /// Open an existing file, read-write when the backing file allows it.
    pub fn open(&self, path: &str) -> SealfsResult<CryptFile> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            let meta = fs::symlink_metadata(&loc.backing).map_err(|e| backing_error(e, &loc.plain))?;
            match file_kind(meta.file_type()) {
                FileKind::Directory => return Err(SealfsError::IsADirectory(loc.plain)),
                FileKind::Symlink => {
                    return Err(SealfsError::UnsupportedOperation(format!(
                        "{} is a symbolic link; resolve it with readlink",
                        loc.plain
                    )))
                }
                FileKind::File => {}
            }

            let (file, writable) = match OpenOptions::new().read(true).write(true).open(&loc.backing) {
                Ok(file) => (file, true),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => (
                    File::open(&loc.backing).map_err(|e| backing_error(e, &loc.plain))?,
                    false,
                ),
                Err(e) => return Err(backing_error(e, &loc.plain)),
            };

            let mask = self.seed_mask(keys, &loc.parent_ctx, &loc.name);
            let header = self.session.format.read_header(&file, mask.as_ref())?;
            debug!(path = %loc.plain, writable, "opened file");
            CryptFile::new(Arc::clone(&self.session), file, header, loc.plain, writable)
        })
    }

    /// Remove a file or symlink.
    pub fn remove(&self, path: &str) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            let meta = fs::symlink_metadata(&loc.backing).map_err(|e| backing_error(e, &loc.plain))?;
            if meta.is_dir() {
                return Err(SealfsError::IsADirectory(loc.plain));
            }
            fs::remove_file(&loc.backing).map_err(|e| backing_error(e, &loc.plain))?;
            debug!(path = %loc.plain, "removed");
            Ok(())
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            // owner needs write access until the context file exists
            DirBuilder::new()
                .mode(mode | 0o700)
                .create(&loc.backing)
                .map_err(|e| backing_error(e, &loc.plain))?;

            let finish = || -> SealfsResult<()> {
                if self.session.record.name_context == NameContextMode::PerDirectory {
                    write_dir_context(&loc.backing, &DirContext::random())?;
                }
                if mode & 0o700 != 0o700 {
                    fs::set_permissions(&loc.backing, Permissions::from_mode(mode))?;
                }
                Ok(())
            };
            if let Err(e) = finish() {
                let _ = fs::remove_file(loc.backing.join(DIRIV_FILE));
                let _ = fs::remove_dir(&loc.backing);
                return Err(e);
            }
            debug!(path = %loc.plain, "created directory");
            Ok(())
        })
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            let meta = fs::symlink_metadata(&loc.backing).map_err(|e| backing_error(e, &loc.plain))?;
            if !meta.is_dir() {
                return Err(SealfsError::NotADirectory(loc.plain));
            }
            for entry in fs::read_dir(&loc.backing)? {
                if entry?.file_name() != DIRIV_FILE {
                    return Err(SealfsError::DirectoryNotEmpty(loc.plain));
                }
            }

            let ctx_file = loc.backing.join(DIRIV_FILE);
            let saved = fs::read(&ctx_file).ok();
            if saved.is_some() {
                fs::remove_file(&ctx_file)?;
            }
            if let Err(e) = fs::remove_dir(&loc.backing) {
                if let Some(bytes) = saved {
                    let _ = fs::write(&ctx_file, bytes);
                }
                return Err(backing_error(e, &loc.plain));
            }
            debug!(path = %loc.plain, "removed directory");
            Ok(())
        })
    }

    /// List a directory. Entries that fail to decode are reported in
    /// [`Listing::skipped`] rather than failing the whole listing.
    pub fn readdir(&self, path: &str) -> SealfsResult<Listing> {
        self.session.with_keys(|keys| {
            let segments = split_path(path)?;
            let plain = segments.join("/");
            let (dir, ctx) = self.walk_dir(keys, &segments)?;

            let mut listing = Listing::default();
            for entry in fs::read_dir(&dir).map_err(|e| backing_error(e, &plain))? {
                let entry = entry?;
                let os_name = entry.file_name();
                let Some(encoded) = os_name.to_str() else {
                    warn!(dir = %plain, entry = ?os_name, "skipping non-UTF-8 backing entry");
                    listing.skipped.push(os_name.to_string_lossy().into_owned());
                    continue;
                };
                if encoded.starts_with(RESERVED_PREFIX) {
                    continue;
                }
                match keys.names.decode(encoded, &ctx) {
                    Ok(name) => listing.entries.push(DirEntry {
                        name,
                        kind: file_kind(entry.file_type()?),
                        encoded: encoded.to_string(),
                    }),
                    Err(e) => {
                        warn!(dir = %plain, entry = encoded, error = %e, "skipping undecodable entry");
                        listing.skipped.push(encoded.to_string());
                    }
                }
            }
            listing.entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(listing)
        })
    }

    pub fn metadata(&self, path: &str) -> SealfsResult<EntryMetadata> {
        self.session.with_keys(|keys| {
            let (backing, plain) = self.backing_path(keys, path)?;
            let meta = fs::symlink_metadata(&backing).map_err(|e| backing_error(e, &plain))?;
            let kind = file_kind(meta.file_type());
            let size = match kind {
                FileKind::File => self.session.layout.logical_len(meta.len()).ok_or_else(|| {
                    SealfsError::CorruptHeader(format!("{plain}: backing file shorter than header"))
                })?,
                FileKind::Directory => meta.len(),
                FileKind::Symlink => self.read_target(keys, &backing, &plain)?.len() as u64,
            };
            Ok(EntryMetadata {
                kind,
                size,
                modified: meta.modified()?,
                accessed: meta.accessed()?,
                mode: meta.mode() & 0o7777,
                nlink: meta.nlink(),
            })
        })
    }

    /// Rename an entry with one backing `rename(2)`.
    ///
    /// Under a path-bound IV policy the file header is rebound to the new
    /// name first and restored if the rename fails. Times are preserved.
    pub fn rename(&self, from: &str, to: &str) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let src = self.locate(keys, from)?;
            let dst = self.locate(keys, to)?;
            if src.backing == dst.backing {
                return Ok(());
            }
            let meta = fs::symlink_metadata(&src.backing).map_err(|e| backing_error(e, &src.plain))?;

            let rebound = match (
                self.seed_mask(keys, &src.parent_ctx, &src.name),
                self.seed_mask(keys, &dst.parent_ctx, &dst.name),
            ) {
                (Some(old), Some(new)) if meta.is_file() => {
                    let file = open_for_rebind(&src.backing, &meta).map_err(|e| backing_error(e, &src.plain))?;
                    let times = FileTimes::new()
                        .set_accessed(meta.accessed()?)
                        .set_modified(meta.modified()?);
                    self.session.format.rebind(&file, &old, &new)?;
                    file.set_times(times)?;
                    Some((file, times, old, new))
                }
                _ => None,
            };

            if let Err(e) = fs::rename(&src.backing, &dst.backing) {
                if let Some((file, times, old, new)) = rebound {
                    if let Err(undo) = self.session.format.rebind(&file, &new, &old) {
                        warn!(path = %src.plain, error = %undo, "failed to restore header after rename error");
                    }
                    let _ = file.set_times(times);
                }
                return Err(backing_error(e, &src.plain));
            }
            debug!(from = %src.plain, to = %dst.plain, "renamed");
            Ok(())
        })
    }

    /// Create a hard link. Not representable under a path-bound IV policy.
    pub fn link(&self, existing: &str, new: &str) -> SealfsResult<()> {
        if !self.session.record.iv_policy.allows_hard_links() {
            return Err(SealfsError::UnsupportedOperation(
                "hard links are not supported with path-bound file IVs".into(),
            ));
        }
        self.session.with_keys(|keys| {
            let src = self.locate(keys, existing)?;
            let dst = self.locate(keys, new)?;
            let meta = fs::symlink_metadata(&src.backing).map_err(|e| backing_error(e, &src.plain))?;
            if meta.is_dir() {
                return Err(SealfsError::IsADirectory(src.plain));
            }
            fs::hard_link(&src.backing, &dst.backing).map_err(|e| backing_error(e, &dst.plain))?;
            debug!(existing = %src.plain, new = %dst.plain, "linked");
            Ok(())
        })
    }

    pub fn symlink(&self, target: &str, link_path: &str) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, link_path)?;
            let stored = if self.session.record.encrypt_symlinks {
                keys.names.encode_target(target)?
            } else {
                target.to_string()
            };
            std::os::unix::fs::symlink(stored, &loc.backing).map_err(|e| backing_error(e, &loc.plain))?;
            debug!(path = %loc.plain, "created symlink");
            Ok(())
        })
    }

    pub fn readlink(&self, path: &str) -> SealfsResult<String> {
        self.session.with_keys(|keys| {
            let loc = self.locate(keys, path)?;
            self.read_target(keys, &loc.backing, &loc.plain)
        })
    }

    fn read_target(&self, keys: &MountedKeys, backing: &Path, plain: &str) -> SealfsResult<String> {
        let stored = fs::read_link(backing).map_err(|e| match e.raw_os_error() {
            Some(libc::EINVAL) => SealfsError::InvalidName(format!("{plain} is not a symbolic link")),
            _ => backing_error(e, plain),
        })?;
        let stored = stored
            .to_str()
            .ok_or_else(|| SealfsError::InvalidName(format!("{plain}: link target not UTF-8")))?;
        if self.session.record.encrypt_symlinks {
            keys.names.decode_target(stored)
        } else {
            Ok(stored.to_string())
        }
    }

    pub fn set_times(&self, path: &str, accessed: SystemTime, modified: SystemTime) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let (backing, plain) = self.backing_path(keys, path)?;
            reject_symlink(&backing, &plain)?;
            let file = File::open(&backing).map_err(|e| backing_error(e, &plain))?;
            file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))?;
            Ok(())
        })
    }

    pub fn set_permissions(&self, path: &str, mode: u32) -> SealfsResult<()> {
        self.session.with_keys(|keys| {
            let (backing, plain) = self.backing_path(keys, path)?;
            reject_symlink(&backing, &plain)?;
            fs::set_permissions(&backing, Permissions::from_mode(mode & 0o7777))
                .map_err(|e| backing_error(e, &plain))?;
            Ok(())
        })
    }

    /// Encoded backing path (relative to the root) of a plaintext path.
    ///
    /// Intermediate directories must exist; the last segment need not.
    pub fn encode_path(&self, path: &str) -> SealfsResult<String> {
        self.session.with_keys(|keys| {
            let segments = split_path(path)?;
            let Some((name, parents)) = segments.split_last() else {
                return Ok(String::new());
            };
            let (parent, ctx) = self.walk_dir(keys, parents)?;
            let mut encoded = parent
                .strip_prefix(&self.session.root)
                .map_err(|e| SealfsError::Crypto(format!("backing path outside root: {e}")))?
                .to_string_lossy()
                .into_owned();
            if !encoded.is_empty() {
                encoded.push('/');
            }
            encoded.push_str(&keys.names.encode(name, &ctx)?);
            Ok(encoded)
        })
    }

    /// Plaintext path of an encoded backing path (relative to the root).
    pub fn decode_path(&self, encoded: &str) -> SealfsResult<String> {
        self.session.with_keys(|keys| {
            let segments: Vec<&str> = encoded.split('/').filter(|s| !s.is_empty()).collect();
            let mut dir = self.session.root.clone();
            let mut ctx = self.session.root_ctx;
            let mut plain = Vec::with_capacity(segments.len());
            for (depth, segment) in segments.iter().enumerate() {
                plain.push(keys.names.decode(segment, &ctx)?);
                if depth + 1 < segments.len() {
                    dir.push(segment);
                    ctx = read_dir_context(&dir, self.session.record.name_context, &plain.join("/"))?;
                }
            }
            Ok(plain.join("/"))
        })
    }
}

fn reject_symlink(backing: &Path, plain: &str) -> SealfsResult<()> {
    let meta = fs::symlink_metadata(backing).map_err(|e| backing_error(e, plain))?;
    if meta.file_type().is_symlink() {
        return Err(SealfsError::UnsupportedOperation(format!(
            "{plain} is a symbolic link"
        )));
    }
    Ok(())
}

/// Open a file for a header rewrite, lending the owner write permission
/// for the duration if the file is read-only.
fn open_for_rebind(path: &Path, meta: &fs::Metadata) -> io::Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            let mode = meta.mode() & 0o7777;
            fs::set_permissions(path, Permissions::from_mode(mode | 0o600))?;
            let file = OpenOptions::new().read(true).write(true).open(path);
            fs::set_permissions(path, Permissions::from_mode(mode))?;
            file
        }
        other => other,
    }
}
