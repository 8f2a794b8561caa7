//! Per-archive handler: entry tree, whole-buffer reads and streams
//!
//! A handler holds no archive state of its own. Open readers and their entry
//! trees live in the shared [`HandleCache`]; every operation checks one out,
//! verifies that the archive on disk still has the stamp the reader was built
//! from, and transparently rebuilds the reader when it does not. Eviction from
//! the cache frees the tree along with the reader.

mod stream;

pub use stream::EntryStream;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheHandle, Dispose, HandleCache};
use crate::config::LimitsConfig;
use crate::errors::{VfsError, VfsResult};
use crate::formats::{ArchiveKind, ArchiveReader};
use crate::fs::entry::{DEFAULT_LENGTH, EntryAttributes, EntryTree, NewEntry, VirtualEntry};
use crate::fs::path::normalize_entry_path;
use crate::fs::utils::{FileStamp, canonical_path};
use crate::utils::lock_recovering;

/// Separator between the local archive path and the in-archive path
pub const SEPARATOR: &str = "!/";

/// An open archive as stored in the handle cache
pub struct ArchiveHolder {
    path: PathBuf,
    reader: Mutex<Option<ArchiveReader>>,
    entries: Vec<NewEntry>,
    /// First listed position of each entry path
    index: HashMap<String, usize>,
    single_file: bool,
    fallback_length: Option<u64>,
    /// Built on first use
    tree: Mutex<Option<Arc<EntryTree>>>,
    disposals: AtomicUsize,
}

impl ArchiveHolder {
    pub fn open(kind: ArchiveKind, path: &Path) -> VfsResult<Self> {
        let reader = ArchiveReader::open(kind, path)?;
        let entries = reader.entries().to_vec();
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            index.entry(entry.path.clone()).or_insert(i);
        }
        Ok(Self {
            path: path.to_path_buf(),
            single_file: reader.is_single_file(),
            fallback_length: reader.fallback_length(),
            reader: Mutex::new(Some(reader)),
            entries,
            index,
            tree: Mutex::new(None),
            disposals: AtomicUsize::new(0),
        })
    }

    /// Entry tree of this archive, built once per holder
    pub fn tree(&self) -> Arc<EntryTree> {
        let mut memo = lock_recovering(&self.tree, "entry tree");
        if let Some(tree) = memo.as_ref() {
            return Arc::clone(tree);
        }
        let tree = Arc::new(EntryTree::build(self.entries.iter().cloned()));
        log::debug!("{}: {} entries", self.path.display(), tree.len() - 1);
        *memo = Some(Arc::clone(&tree));
        tree
    }

    #[cfg(test)]
    fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    /// Run `f` with exclusive access to the reader
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut ArchiveReader) -> VfsResult<T>) -> VfsResult<T> {
        let mut guard = lock_recovering(&self.reader, "archive reader");
        match guard.as_mut() {
            Some(reader) => f(reader),
            None => Err(VfsError::corrupt(&self.path, "reader already disposed")),
        }
    }

    /// Position and listing of the entry at `entry_path`. Single-file
    /// archives ignore the path and return their only member.
    fn locate(&self, entry_path: &str) -> VfsResult<(usize, &NewEntry)> {
        if self.single_file
            && let Some((i, entry)) = self.entries.iter().enumerate().find(|(_, e)| !e.is_directory)
        {
            return Ok((i, entry));
        }
        let normalized = normalize_entry_path(entry_path);
        match self.index.get(&normalized) {
            Some(&i) if !self.entries[i].is_directory => Ok((i, &self.entries[i])),
            Some(_) => Err(VfsError::NotFound(format!(
                "{}{}{}: is a directory",
                self.path.display(),
                SEPARATOR,
                normalized
            ))),
            None => Err(VfsError::NotFound(format!("{}{}{}", self.path.display(), SEPARATOR, normalized))),
        }
    }

    /// Length checked by the too-large guard
    fn guarded_length(&self, entry: &NewEntry) -> u64 {
        if entry.length == DEFAULT_LENGTH {
            self.fallback_length.unwrap_or(DEFAULT_LENGTH)
        } else {
            entry.length
        }
    }
}

impl Dispose for ArchiveHolder {
    fn dispose(&self) {
        if self.disposals.fetch_add(1, Ordering::SeqCst) > 0 {
            log::warn!("{}: holder disposed more than once", self.path.display());
        }
        log::debug!("disposing reader for {}", self.path.display());
        lock_recovering(&self.reader, "archive reader").take();
        lock_recovering(&self.tree, "entry tree").take();
    }
}

pub struct ArchiveHandler {
    path: PathBuf,
    kind: ArchiveKind,
    cache: HandleCache<ArchiveHolder>,
    limits: LimitsConfig,
}

impl ArchiveHandler {
    pub fn new(path: &Path, kind: ArchiveKind, cache: HandleCache<ArchiveHolder>, limits: LimitsConfig) -> VfsResult<Self> {
        Ok(Self {
            path: canonical_path(path)?,
            kind,
            cache,
            limits,
        })
    }

    /// Canonical path of the archive file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Composite path of the archive root
    pub fn root_path(&self) -> String {
        format!("{}{}", self.path.display(), SEPARATOR)
    }

    /// Check out the holder, rebuilding it if the file changed on disk
    fn checkout(&self) -> VfsResult<CacheHandle<ArchiveHolder>> {
        let current = match FileStamp::of(&self.path) {
            Ok(stamp) => stamp,
            Err(e) => {
                self.cache.invalidate(&self.path);
                return Err(e.into());
            }
        };

        let handle = self.cache.checkout(&self.path, || self.open_holder(current))?;
        if handle.stamp() == current {
            return Ok(handle);
        }

        log::debug!("{} changed on disk, rebuilding", self.path.display());
        self.cache.invalidate_handle(&handle);
        drop(handle);
        self.cache.checkout(&self.path, || self.open_holder(current))
    }

    fn open_holder(&self, stamp: FileStamp) -> VfsResult<(ArchiveHolder, FileStamp)> {
        Ok((ArchiveHolder::open(self.kind, &self.path)?, stamp))
    }

    /// Entry tree of the archive, rebuilt only when the archive changes
    pub fn entry_tree(&self) -> VfsResult<Arc<EntryTree>> {
        Ok(self.checkout()?.tree())
    }

    /// Alias of [`entry_tree`](Self::entry_tree)
    pub fn list_entries(&self) -> VfsResult<Arc<EntryTree>> {
        self.entry_tree()
    }

    pub fn attributes(&self, entry_path: &str) -> VfsResult<Option<EntryAttributes>> {
        let tree = self.entry_tree()?;
        Ok(tree.lookup(&normalize_entry_path(entry_path)).map(|info| info.attributes()))
    }

    /// Child names of the directory at `dir_path`
    pub fn list(&self, dir_path: &str) -> VfsResult<Vec<String>> {
        Ok(self.entry_tree()?.list(&normalize_entry_path(dir_path)))
    }

    /// Sorted listing of `dir_path` with paths under this archive's root
    pub fn children(&self, dir_path: &str) -> VfsResult<Vec<VirtualEntry>> {
        self.children_under(dir_path, &self.root_path())
    }

    /// Sorted listing of `dir_path` with paths under `root_prefix`
    pub fn children_under(&self, dir_path: &str, root_prefix: &str) -> VfsResult<Vec<VirtualEntry>> {
        let tree = self.entry_tree()?;
        let dir = normalize_entry_path(dir_path);
        match tree.lookup(&dir) {
            Some(info) if info.is_directory => Ok(tree.list_entries(&dir, root_prefix)),
            Some(_) => Ok(Vec::new()),
            None => Err(VfsError::NotFound(format!("{}{}", self.root_path(), dir))),
        }
    }

    pub fn is_single_file_archive(&self) -> VfsResult<bool> {
        Ok(self.checkout()?.is_single_file())
    }

    /// Whole contents of an entry.
    ///
    /// Fails with `FileTooBig` when the entry is larger than the configured
    /// threshold; use [`input_stream`](Self::input_stream) for those.
    pub fn contents_to_byte_array(&self, entry_path: &str) -> VfsResult<Vec<u8>> {
        let handle = self.checkout()?;
        let (index, entry) = handle.locate(entry_path)?;
        let length = handle.guarded_length(entry);
        if self.limits.is_too_large(length) {
            return Err(VfsError::FileTooBig(format!(
                "{}{}{}",
                self.path.display(),
                SEPARATOR,
                entry.path
            )));
        }

        let mut data = Vec::with_capacity(entry.length as usize);
        let detached = handle.with_reader(|reader| reader.open_detached(index))?;
        match detached {
            Some(mut reader) => {
                reader
                    .read_to_end(&mut data)
                    .map_err(|e| crate::formats::decode_error(&self.path, e))?;
            }
            None => {
                handle.with_reader(|reader| reader.extract(index, &mut data))?;
            }
        }
        Ok(data)
    }

    /// Stream over an entry. The holder stays checked out until the stream
    /// is closed or dropped. No size limit applies.
    pub fn input_stream(&self, entry_path: &str) -> VfsResult<EntryStream> {
        let handle = self.checkout()?;
        let (index, _) = handle.locate(entry_path)?;
        let detached = handle.with_reader(|reader| reader.open_detached(index))?;
        match detached {
            Some(reader) => Ok(EntryStream::direct(reader, handle)),
            None => Ok(EntryStream::piped(handle, index, &self.limits)?),
        }
    }

    /// Drop the cached reader and its tree
    pub fn clear_caches(&self) {
        self.cache.invalidate(&self.path);
    }
}
