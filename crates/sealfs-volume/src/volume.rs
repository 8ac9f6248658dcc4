//! Mount session: control record, unlocked keys, shared lock table.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use secrecy::SecretString;
use tracing::{debug, info};

use sealfs_core::config::{KdfConfig, SealfsConfig, DEFAULT_BLOCK_SIZE};
use sealfs_core::{IntegrityMode, NameContextMode, Profile, SealfsError, SealfsResult};
use sealfs_crypto::{
    derive_kek, generate_salt, generate_volume_key, unwrap_volume_key, verify_tag,
    volume_key_to_phrase, wrap_volume_key, DirContext, KdfParams, NameCipher, VolumeKey,
    VolumeKeys, CIPHER_ID,
};

use crate::block::BlockLayout;
use crate::control::{check_block_size, encode_b64, unix_now, ControlRecord, FORMAT_VERSION};
use crate::header::HeaderFormat;
use crate::locks::BlockLocks;
use crate::mapper::{read_dir_context, write_dir_context};

/// What unlocks the volume key.
#[derive(Debug)]
pub enum MountSecret {
    Passphrase(SecretString),
    /// A volume key obtained out of band, e.g. from a recovery phrase
    RawKey(VolumeKey),
}

/// Parameters for mounting and, when `create_if_absent` is set, creating.
///
/// Everything except `create_if_absent` only applies to volume creation;
/// an existing volume always uses its control record.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub create_if_absent: Option<Profile>,
    pub block_size: u32,
    /// Overrides the profile's integrity default
    pub integrity: Option<IntegrityMode>,
    pub name_context: NameContextMode,
    pub encrypt_symlinks: bool,
    pub allow_holes: bool,
    pub kdf: KdfConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            create_if_absent: None,
            block_size: DEFAULT_BLOCK_SIZE,
            integrity: None,
            name_context: NameContextMode::PerDirectory,
            encrypt_symlinks: true,
            allow_holes: true,
            kdf: KdfConfig::default(),
        }
    }
}

impl MountOptions {
    pub fn create(profile: Profile) -> Self {
        Self {
            create_if_absent: Some(profile),
            ..Self::default()
        }
    }

    /// Creation defaults from the operator settings file.
    pub fn from_settings(config: &SealfsConfig) -> Self {
        Self {
            create_if_absent: None,
            block_size: config.volume.block_size,
            integrity: config.volume.integrity,
            name_context: config.volume.name_context,
            encrypt_symlinks: config.volume.encrypt_symlinks,
            allow_holes: config.volume.allow_holes,
            kdf: config.kdf,
        }
    }
}

pub(crate) struct MountedKeys {
    pub(crate) keys: VolumeKeys,
    pub(crate) names: NameCipher,
}

/// State shared by a volume and every file opened through it.
pub(crate) struct Session {
    pub(crate) root: PathBuf,
    pub(crate) record: ControlRecord,
    pub(crate) layout: BlockLayout,
    pub(crate) format: HeaderFormat,
    pub(crate) root_ctx: DirContext,
    pub(crate) locks: BlockLocks,
    keys: RwLock<Option<MountedKeys>>,
}

impl Session {
    /// Run `f` with the volume keys, holding them for its whole duration.
    ///
    /// Must not be nested: unmount may be queued on the lock in between.
    pub(crate) fn with_keys<R>(
        &self,
        f: impl FnOnce(&MountedKeys) -> SealfsResult<R>,
    ) -> SealfsResult<R> {
        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(keys) => f(keys),
            None => Err(SealfsError::Unmounted),
        }
    }
}

/// A mounted volume. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Volume {
    pub(crate) session: Arc<Session>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("root", &self.session.root)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

impl Volume {
    /// Mount the volume at `root`, creating it if asked to.
    pub fn mount(root: impl AsRef<Path>, secret: MountSecret, opts: &MountOptions) -> SealfsResult<Self> {
        let root = root.as_ref();
        check_root(root)?;

        let record = match ControlRecord::load(root) {
            Ok(record) => record,
            Err(SealfsError::NotInitialized(what)) => {
                return match (opts.create_if_absent, &secret) {
                    (Some(profile), MountSecret::Passphrase(passphrase)) => {
                        Self::init(root, passphrase, profile, opts)
                    }
                    (Some(_), MountSecret::RawKey(_)) => Err(SealfsError::Config(
                        "creating a volume requires a passphrase".into(),
                    )),
                    (None, _) => Err(SealfsError::NotInitialized(what)),
                };
            }
            Err(e) => return Err(e),
        };

        let volume_key = match secret {
            MountSecret::Passphrase(passphrase) => {
                let kek = derive_kek(&passphrase, &record.salt_bytes()?, &KdfParams::from(record.kdf))?;
                unwrap_volume_key(&kek, &record.wrapped_key_bytes()?)?
            }
            MountSecret::RawKey(key) => key,
        };
        let keys = VolumeKeys::derive(volume_key)?;
        if !verify_tag(&keys.key_check(), &record.key_check_bytes()?) {
            return Err(SealfsError::Authentication(
                "volume key does not belong to this volume".into(),
            ));
        }

        let volume = Self::assemble(root, record, keys)?;
        info!(root = %root.display(), "mounted volume");
        Ok(volume)
    }

    /// Create a new volume at `root` and return it mounted.
    pub fn init(
        root: impl AsRef<Path>,
        passphrase: &SecretString,
        profile: Profile,
        opts: &MountOptions,
    ) -> SealfsResult<Self> {
        let root = root.as_ref();
        check_root(root)?;
        if ControlRecord::exists(root) {
            return Err(SealfsError::AlreadyInitialized(root.display().to_string()));
        }
        check_block_size(opts.block_size)?;

        let salt = generate_salt();
        let kek = derive_kek(passphrase, &salt, &KdfParams::from(opts.kdf))?;
        let volume_key = generate_volume_key();
        let wrapped = wrap_volume_key(&kek, &volume_key)?;
        let keys = VolumeKeys::derive(volume_key)?;

        let record = ControlRecord {
            version: FORMAT_VERSION,
            cipher: CIPHER_ID.to_string(),
            profile,
            block_size: opts.block_size,
            integrity: opts.integrity.unwrap_or(profile.default_integrity()),
            iv_policy: profile.iv_policy(),
            name_context: opts.name_context,
            encrypt_symlinks: opts.encrypt_symlinks,
            allow_holes: opts.allow_holes,
            salt: encode_b64(&salt),
            wrapped_key: encode_b64(&wrapped),
            key_check: encode_b64(&keys.key_check()),
            created: unix_now(),
            kdf: opts.kdf,
        };

        // the record goes last: its presence means the volume is complete
        if record.name_context == NameContextMode::PerDirectory {
            write_dir_context(root, &DirContext::random())?;
        }
        record.store_new(root)?;

        let volume = Self::assemble(root, record, keys)?;
        info!(
            root = %root.display(),
            %profile,
            block_size = opts.block_size,
            "initialized volume"
        );
        Ok(volume)
    }

    fn assemble(root: &Path, record: ControlRecord, keys: VolumeKeys) -> SealfsResult<Self> {
        let root_ctx = read_dir_context(root, record.name_context, "/")?;
        let names = NameCipher::new(keys.name_key())?;
        let session = Session {
            root: root.to_path_buf(),
            layout: BlockLayout::new(record.block_size, record.tag_size()),
            format: HeaderFormat {
                integrity: record.integrity,
                iv_policy: record.iv_policy,
            },
            record,
            root_ctx,
            locks: BlockLocks::new(),
            keys: RwLock::new(Some(MountedKeys { keys, names })),
        };
        Ok(Self {
            session: Arc::new(session),
        })
    }

    /// Drop the keys. Waits for in-flight operations to finish; every later
    /// operation on this volume or its open files fails with `Unmounted`.
    pub fn unmount(&self) {
        let mut keys = self
            .session
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if keys.take().is_some() {
            info!(root = %self.session.root.display(), "unmounted volume");
        } else {
            debug!(root = %self.session.root.display(), "volume already unmounted");
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.session
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn root(&self) -> &Path {
        &self.session.root
    }

    pub fn record(&self) -> &ControlRecord {
        &self.session.record
    }

    /// The 24-word phrase that re-derives this volume's key.
    pub fn recovery_phrase(&self) -> SealfsResult<String> {
        self.session
            .with_keys(|keys| volume_key_to_phrase(keys.keys.volume_key()))
    }
}

fn check_root(root: &Path) -> SealfsResult<()> {
    let meta = fs::metadata(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SealfsError::NotFound(root.display().to_string()),
        _ => SealfsError::Io(e),
    })?;
    if !meta.is_dir() {
        return Err(SealfsError::NotADirectory(root.display().to_string()));
    }
    if meta.permissions().readonly() {
        return Err(SealfsError::Config(format!(
            "backing root {} is not writable",
            root.display()
        )));
    }
    Ok(())
}
