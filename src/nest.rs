//! Nested archive materialization
//!
//! An archive stored inside another archive cannot be opened by a format
//! reader directly. It is copied out once to
//! `<temp root>/archives/<key>/<name>`, where the key hashes the member's
//! name, timestamp and length, and the copy is reused for as long as it
//! exists with the expected size. Requests for the same key are serialized,
//! so concurrent callers wait for one extraction and then share its result.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::DEFAULT_LENGTH;
use crate::fs::utils::{FileStamp, copy_stream_to_file, set_modified_millis};
use crate::utils::{lock_recovering, to_hex};

const NESTED_FILES_ROOT: &str = "archives";

/// An archive member that can be copied out to a local file
pub trait NestedSource {
    /// Short name of the member, used as the file name of the copy
    fn name(&self) -> &str;
    /// Declared modification time in epoch millis
    fn timestamp(&self) -> i64;
    /// Declared uncompressed length
    fn length(&self) -> u64;
    /// Stamp of the containing archive when the member is the only member
    /// of a single-file archive and so inherits its metadata
    fn outer_stamp(&self) -> Option<FileStamp>;
    fn open_stream(&self) -> VfsResult<Box<dyn Read + Send>>;
}

pub struct Materializer {
    root: PathBuf,
    /// Keys with an extraction in progress
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Exclusive claim on one cache key, given up on drop
struct KeyClaim<'a> {
    owner: &'a Materializer,
    key: String,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        lock_recovering(&self.owner.busy, "materializer keys").remove(&self.key);
        self.owner.released.notify_all();
    }
}

impl Materializer {
    pub fn new(temp_root: &Path) -> Self {
        Self {
            root: temp_root.join(NESTED_FILES_ROOT),
            busy: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn claim(&self, key: &str) -> KeyClaim<'_> {
        let mut busy = lock_recovering(&self.busy, "materializer keys");
        while busy.contains(key) {
            busy = self.released.wait(busy).unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(key.to_string());
        KeyClaim {
            owner: self,
            key: key.to_string(),
        }
    }

    /// Directory name for a member: hex of the first 16 bytes of a SHA-256
    pub fn cache_key(source: &dyn NestedSource) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.name().as_bytes());
        if let Some(outer) = source.outer_stamp() {
            hasher.update(outer.modified.to_be_bytes());
            hasher.update(outer.length.to_be_bytes());
        }
        hasher.update(source.timestamp().to_be_bytes());
        hasher.update(source.length().to_be_bytes());
        let digest = hasher.finalize();
        to_hex(&digest[..16])
    }

    /// Local copy of `source`, extracting it only if no usable copy exists
    pub fn materialize(&self, source: &dyn NestedSource) -> VfsResult<PathBuf> {
        let name = source.name();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(VfsError::UnsupportedFormat(format!("cannot materialize member named {:?}", name)));
        }

        let key = Self::cache_key(source);
        let target = self.root.join(&key).join(name);
        let _claim = self.claim(&key);
        if is_reusable(&target, source.length()) {
            log::debug!("reusing nested archive {}", target.display());
            return Ok(target);
        }

        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }

        log::debug!("materializing {} to {}", name, target.display());
        let mut stream = source.open_stream()?;
        let written = copy_stream_to_file(&mut stream, &target)?;
        if source.length() != DEFAULT_LENGTH && written != source.length() {
            log::warn!(
                "{}: extracted {} bytes, archive declared {}",
                target.display(),
                written,
                source.length()
            );
        }
        set_modified_millis(&target, source.timestamp());
        Ok(target)
    }
}

fn is_reusable(target: &Path, declared_length: u64) -> bool {
    match std::fs::metadata(target) {
        Ok(meta) if meta.is_file() => declared_length == DEFAULT_LENGTH || meta.len() == declared_length,
        _ => false,
    }
}
