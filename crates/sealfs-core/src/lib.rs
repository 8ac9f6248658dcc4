//! sealfs-core: shared types, policy flags, settings schema, and the error
//! taxonomy used by every sealfs crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{SealfsError, SealfsResult};
pub use types::{FileKind, IntegrityMode, IvPolicy, NameContextMode, Profile};
