//! Read-only virtual filesystem over archive files.
//!
//! Archives (zip, tar, gzip/bzip2/xz-compressed tar, single gz/bz2/xz files,
//! 7z and rar) are browsed as directory trees through composite paths of the
//! form `<local path>!/<entry path>`. Readers are cached per archive and
//! rebuilt when the file changes on disk. Archives inside archives are copied
//! to a scratch directory on demand and opened like local files.

pub mod cache;
pub mod config;
pub mod errors;
pub mod formats;
pub mod fs;
pub mod handler;
pub mod nest;
pub mod utils;
pub mod vfs;

pub use config::Config;
pub use errors::{VfsError, VfsResult};
pub use formats::{ArchiveKind, Codec};
pub use fs::{EntryAttributes, EntryInfo, EntryTree, VirtualEntry};
pub use handler::{ArchiveHandler, EntryStream, SEPARATOR};
pub use vfs::ArchiveFileSystem;
