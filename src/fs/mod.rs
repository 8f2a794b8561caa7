//! Filesystem module: entry tree, in-archive paths and local file helpers

pub mod entry;
pub mod path;
pub mod utils;

pub use entry::{EntryAttributes, EntryId, EntryInfo, EntryTree, NewEntry, VirtualEntry};
pub use utils::FileStamp;
