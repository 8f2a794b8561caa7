//! Archive virtual filesystem
//!
//! Composite paths have the form `<local path>!/<entry path>`. A nested
//! archive adds one more separator per level, e.g.
//! `/data/outer.zip!/lib/inner.tar!/docs/readme.md`. Only the first separator
//! marks the local root; the last one splits off the entry path, and every
//! level in between is materialized to a scratch file before it is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::HandleCache;
use crate::config::Config;
use crate::errors::{VfsError, VfsResult};
use crate::formats::ArchiveKind;
use crate::fs::entry::{EntryAttributes, VirtualEntry};
use crate::fs::path::{normalize_entry_path, split_path};
use crate::fs::utils::{FileStamp, canonical_path};
use crate::handler::{ArchiveHandler, ArchiveHolder, EntryStream, SEPARATOR};
use crate::nest::{Materializer, NestedSource};
use crate::utils::lock_recovering;

/// Lexically normalize a local filesystem path: `\` becomes `/`, repeated
/// separators collapse, `.` segments vanish and `..` removes its parent.
fn normalize_local_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{}", joined) } else { joined }
}

/// Normalize the local part of `path` (everything before the first
/// separator) and leave the in-archive part untouched
pub fn normalize_path(path: &str) -> String {
    match path.find(SEPARATOR) {
        Some(i) if i > 0 => format!("{}{}", normalize_local_path(&path[..i]), &path[i..]),
        _ => normalize_local_path(path),
    }
}

/// Root of `path` up to and including the first separator
pub fn extract_root_path(path: &str) -> VfsResult<String> {
    match path.find(SEPARATOR) {
        Some(i) => Ok(path[..i + SEPARATOR.len()].to_string()),
        None => Err(VfsError::MalformedPath(format!("path must contain '{}': {}", SEPARATOR, path))),
    }
}

/// Local file of a root path: everything before the first separator
pub fn extract_local_path(root_path: &str) -> String {
    match root_path.find(SEPARATOR) {
        Some(i) => root_path[..i].to_string(),
        None => root_path.to_string(),
    }
}

pub fn compose_root_path(local_path: &str) -> String {
    format!("{}{}", local_path, SEPARATOR)
}

/// Address the archive root of a bare local path
pub fn find_local_path(path: &str) -> String {
    if path.contains(SEPARATOR) {
        path.to_string()
    } else {
        compose_root_path(path)
    }
}

/// Split at the last separator into (archive path, entry path)
pub fn split_composite_path(path: &str) -> Option<(&str, &str)> {
    path.rfind(SEPARATOR)
        .map(|i| (&path[..i], &path[i + SEPARATOR.len()..]))
}

/// True when the archive part of `path` itself lives inside an archive
pub fn is_nested(path: &str) -> bool {
    split_composite_path(path).is_some_and(|(archive, _)| archive.contains(SEPARATOR))
}

/// A composite path resolved to its handler
struct Resolved {
    handler: Arc<ArchiveHandler>,
    /// Composite root used to build child paths
    root: String,
    entry: String,
}

/// Member of an open archive, materialized through its handler's stream
struct ArchiveMember<'a> {
    handler: &'a ArchiveHandler,
    entry_path: String,
    name: String,
    attributes: EntryAttributes,
    outer_stamp: Option<FileStamp>,
}

impl NestedSource for ArchiveMember<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> i64 {
        self.attributes.timestamp
    }

    fn length(&self) -> u64 {
        self.attributes.length
    }

    fn outer_stamp(&self) -> Option<FileStamp> {
        self.outer_stamp
    }

    fn open_stream(&self) -> VfsResult<Box<dyn std::io::Read + Send>> {
        Ok(Box::new(self.handler.input_stream(&self.entry_path)?))
    }
}

/// Read-only filesystem over local archives and archives nested in them
pub struct ArchiveFileSystem {
    config: Config,
    cache: HandleCache<ArchiveHolder>,
    handlers: Mutex<HashMap<PathBuf, Arc<ArchiveHandler>>>,
    materializer: Materializer,
}

impl ArchiveFileSystem {
    pub fn new(config: Config) -> Self {
        let cache = HandleCache::new(&config.cache);
        let materializer = Materializer::new(&config.nested.temp_root());
        Self {
            config,
            cache,
            handlers: Mutex::new(HashMap::new()),
            materializer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Archive kind this filesystem would use for `local`
    pub fn kind_of(&self, local: &Path) -> Option<ArchiveKind> {
        ArchiveKind::from_path(local, self.config.formats.expand_compressed_tar)
    }

    /// Whether `local` should be opened as an archive root
    pub fn is_correct_file_type(&self, local: &Path) -> bool {
        self.kind_of(local).is_some() && !local.is_dir()
    }

    /// Handler for a local archive file, shared by every caller
    pub fn resolve_handler(&self, local: &Path) -> VfsResult<Arc<ArchiveHandler>> {
        let Some(kind) = self.kind_of(local) else {
            return Err(VfsError::UnsupportedFormat(local.display().to_string()));
        };
        let key = canonical_path(local)?;

        let mut handlers = lock_recovering(&self.handlers, "handler map");
        if let Some(handler) = handlers.get(&key) {
            return Ok(Arc::clone(handler));
        }
        let handler = Arc::new(ArchiveHandler::new(
            &key,
            kind,
            self.cache.clone(),
            self.config.limits.clone(),
        )?);
        handlers.insert(key, Arc::clone(&handler));
        self.prune_handlers(&mut handlers);
        Ok(handler)
    }

    /// Forget handlers whose holder has left the cache and that nobody else
    /// holds, once the map outgrows the cache. They are rebuilt on demand.
    fn prune_handlers(&self, handlers: &mut HashMap<PathBuf, Arc<ArchiveHandler>>) {
        let capacity = self.config.cache.protected_capacity + self.config.cache.probationary_capacity;
        if handlers.len() <= capacity {
            return;
        }
        let before = handlers.len();
        handlers.retain(|key, handler| Arc::strong_count(handler) > 1 || self.cache.contains(key));
        log::debug!("dropped {} idle handlers", before - handlers.len());
    }

    fn resolve(&self, path: &str) -> VfsResult<Resolved> {
        let path = normalize_path(path);
        let Some((archive, entry)) = split_composite_path(&path) else {
            return Err(VfsError::MalformedPath(format!("path must contain '{}': {}", SEPARATOR, path)));
        };

        let local = if archive.contains(SEPARATOR) {
            self.materialize(archive)?
        } else {
            PathBuf::from(archive)
        };

        Ok(Resolved {
            handler: self.resolve_handler(&local)?,
            root: compose_root_path(archive),
            entry: normalize_entry_path(entry),
        })
    }

    /// Copy the archive member at composite `path` to a local scratch file
    /// and return that file's path
    pub fn materialize(&self, path: &str) -> VfsResult<PathBuf> {
        let resolved = self.resolve(path)?;
        let handler = &resolved.handler;
        let tree = handler.entry_tree()?;

        let single = handler.is_single_file_archive()?;
        let entry_path = if single {
            // The only member, whatever path was asked for
            tree.iter()
                .find(|(_, info)| info.parent.is_some() && !info.is_directory)
                .map(|(p, _)| p)
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?
        } else {
            resolved.entry.clone()
        };

        let Some(info) = tree.lookup(&entry_path) else {
            return Err(VfsError::NotFound(path.to_string()));
        };
        if info.is_directory {
            return Err(VfsError::UnsupportedFormat(format!("{} is a directory", path)));
        }

        let outer_stamp = if single { Some(FileStamp::of(handler.path())?) } else { None };
        let member = ArchiveMember {
            handler,
            name: split_path(&entry_path).1.to_string(),
            entry_path: entry_path.clone(),
            attributes: info.attributes(),
            outer_stamp,
        };
        self.materializer.materialize(&member)
    }

    /// Sorted listing of the directory at composite `path`
    pub fn children(&self, path: &str) -> VfsResult<Vec<VirtualEntry>> {
        let r = self.resolve(path)?;
        r.handler.children_under(&r.entry, &r.root)
    }

    /// Child names of the directory at composite `path`
    pub fn list(&self, path: &str) -> VfsResult<Vec<String>> {
        let r = self.resolve(path)?;
        r.handler.list(&r.entry)
    }

    pub fn attributes(&self, path: &str) -> VfsResult<Option<EntryAttributes>> {
        let r = self.resolve(path)?;
        r.handler.attributes(&r.entry)
    }

    pub fn contents_to_byte_array(&self, path: &str) -> VfsResult<Vec<u8>> {
        let r = self.resolve(path)?;
        r.handler.contents_to_byte_array(&r.entry)
    }

    pub fn input_stream(&self, path: &str) -> VfsResult<EntryStream> {
        let r = self.resolve(path)?;
        r.handler.input_stream(&r.entry)
    }

    /// Listing that treats any failure as an empty directory
    pub fn children_or_empty(&self, path: &str) -> Vec<VirtualEntry> {
        self.children(path).unwrap_or_else(|e| {
            log::warn!("cannot list {}: {}", path, e);
            Vec::new()
        })
    }

    /// Whole-buffer read that treats any failure as a missing file
    pub fn read_or_none(&self, path: &str) -> Option<Vec<u8>> {
        match self.contents_to_byte_array(path) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("cannot read {}: {}", path, e);
                None
            }
        }
    }

    /// Composite root to browse when the host opens `path`.
    ///
    /// `path` is either a local file or a composite path to an archive
    /// member. Returns `None` when it is not an archive or cannot be opened,
    /// in which case the host shows a plain file.
    pub fn archive_root_for(&self, path: &str) -> Option<String> {
        let normalized = normalize_path(path);
        let file_name = match split_composite_path(&normalized) {
            Some((_, entry)) => split_path(&normalize_entry_path(entry)).1.to_string(),
            None => Path::new(&normalized)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        self.kind_of(Path::new(&file_name))?;

        let root = compose_root_path(&normalized);
        match self.children(&root) {
            Ok(_) => Some(root),
            Err(e) => {
                log::warn!("{} is not browsable as an archive: {}", path, e);
                None
            }
        }
    }

    /// Drop every handler, memoized tree and idle reader
    pub fn clear_caches(&self) {
        let handlers: Vec<Arc<ArchiveHandler>> = lock_recovering(&self.handlers, "handler map")
            .drain()
            .map(|(_, handler)| handler)
            .collect();
        for handler in handlers {
            handler.clear_caches();
        }
        self.cache.clear();
    }
}
