use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether each content block carries an authentication tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrityMode {
    /// No per-block tags; tampering goes undetected.
    None,
    /// Every block is followed by a keyed tag over IV || ciphertext.
    BlockMac,
}

/// How a file's IV seed is bound to its on-disk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IvPolicy {
    /// Seed stored as-is; two names sharing one header share IVs, so hard
    /// links work.
    Header,
    /// Stored seed is masked with material derived from the entry's parent
    /// context and name. Hard links cannot be represented.
    PathBound,
}

impl IvPolicy {
    pub fn allows_hard_links(self) -> bool {
        matches!(self, IvPolicy::Header)
    }
}

/// Scope of the filename encryption context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameContextMode {
    /// Each directory has its own random context.
    PerDirectory,
    /// One all-zero context for the whole volume.
    Global,
}

/// Volume creation presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    Standard,
    Paranoid,
}

impl Profile {
    pub fn iv_policy(self) -> IvPolicy {
        match self {
            Profile::Standard => IvPolicy::Header,
            Profile::Paranoid => IvPolicy::PathBound,
        }
    }

    pub fn default_integrity(self) -> IntegrityMode {
        match self {
            Profile::Standard => IntegrityMode::None,
            Profile::Paranoid => IntegrityMode::BlockMac,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Standard => f.write_str("standard"),
            Profile::Paranoid => f.write_str("paranoid"),
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Profile::Standard),
            "paranoid" => Ok(Profile::Paranoid),
            other => Err(format!("unknown profile '{other}' (expected standard or paranoid)")),
        }
    }
}

/// Kind of a plaintext directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_pick_policies() {
        assert_eq!(Profile::Standard.iv_policy(), IvPolicy::Header);
        assert_eq!(Profile::Paranoid.iv_policy(), IvPolicy::PathBound);
        assert_eq!(Profile::Paranoid.default_integrity(), IntegrityMode::BlockMac);
        assert!(IvPolicy::Header.allows_hard_links());
        assert!(!IvPolicy::PathBound.allows_hard_links());
    }

    #[test]
    fn profile_parse() {
        assert_eq!("Paranoid".parse::<Profile>().unwrap(), Profile::Paranoid);
        assert!("fast".parse::<Profile>().is_err());
    }
}
