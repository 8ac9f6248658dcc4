use serde::{Deserialize, Serialize};

use crate::types::{IntegrityMode, NameContextMode, Profile};

/// Default plaintext bytes per content block
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Smallest and largest accepted block sizes
pub const MIN_BLOCK_SIZE: u32 = 64;
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Operator settings (loaded from sealfs.toml)
///
/// These only seed new volumes and the CLI; a mounted volume takes its
/// parameters from its own control record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SealfsConfig {
    pub log: LogConfig,
    pub volume: VolumeDefaults,
    pub kdf: KdfConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: warn)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Parameters applied by `sealfs init` when the command line is silent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeDefaults {
    /// Creation profile (default: standard)
    pub profile: Profile,
    /// Plaintext block size in bytes (default: 1024)
    pub block_size: u32,
    /// Override the profile's integrity mode
    pub integrity: Option<IntegrityMode>,
    /// Filename context scope (default: per-directory)
    pub name_context: NameContextMode,
    /// Encrypt symlink targets (default: true)
    pub encrypt_symlinks: bool,
    /// Grow files sparsely when integrity mode is off (default: true)
    pub allow_holes: bool,
}

/// Argon2id cost parameters for new volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "text".into(),
        }
    }
}

impl Default for VolumeDefaults {
    fn default() -> Self {
        Self {
            profile: Profile::Standard,
            block_size: DEFAULT_BLOCK_SIZE,
            integrity: None,
            name_context: NameContextMode::PerDirectory,
            encrypt_symlinks: true,
            allow_holes: true,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}
