//! sealfs-volume: the encrypted overlay engine
//!
//! A [`Volume`] presents a plaintext tree over a backing directory in which
//! every name is encrypted and every file is `header || blocks`:
//!
//! ```text
//! backing root/
//! ├── .sealfs.toml            control record (parameters, wrapped key)
//! ├── .sealfs.diriv           root name context
//! ├── <E(name)>               file: [24-byte header][block 0][block 1]...
//! └── <E(dir)>/
//!     ├── .sealfs.diriv       this directory's name context
//!     └── <E(name)>
//! ```
//!
//! Paths enter through the mapper ([`Volume::create`], [`Volume::open`],
//! [`Volume::rename`], ...); content goes through [`CryptFile`].

pub mod block;
pub mod control;
pub mod file;
pub mod header;
pub(crate) mod io;
pub mod locks;
pub mod mapper;
pub mod volume;

pub use control::ControlRecord;
pub use file::CryptFile;
pub use mapper::{DirEntry, EntryMetadata, Listing};
pub use volume::{MountOptions, MountSecret, Volume};
