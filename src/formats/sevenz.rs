use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sevenz_rust::{Password, SevenZReader};

use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::NewEntry;
use crate::fs::path::{normalize_entry_path, single_file_member_name};
use crate::utils::system_time_to_millis;

/// Identifies an entry in the extraction callback sequence
#[derive(Debug, Clone)]
struct MemberKey {
    raw_name: String,
    /// How many earlier members carry the same raw name
    occurrence: usize,
}

pub struct SevenZipReader {
    path: PathBuf,
    entries: Vec<NewEntry>,
    keys: Vec<MemberKey>,
    single_file: bool,
}

impl SevenZipReader {
    pub fn open(path: &Path) -> VfsResult<Self> {
        let reader = SevenZReader::open(path, Password::empty()).map_err(|e| VfsError::corrupt(path, e))?;
        let files = &reader.archive().files;

        // One member without a stored name: a compressed single file
        let single_file = files.len() == 1 && !files[0].is_directory() && normalize_entry_path(files[0].name()).is_empty();

        let mut entries = Vec::with_capacity(files.len());
        let mut keys: Vec<MemberKey> = Vec::with_capacity(files.len());
        for sz_entry in files {
            let entry_path = if single_file {
                let archive_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                single_file_member_name(&archive_name)
            } else {
                normalize_entry_path(sz_entry.name())
            };
            if entry_path.is_empty() || entry_path == "." {
                continue;
            }

            let modified = {
                let st: SystemTime = sz_entry.last_modified_date().into();
                if st > SystemTime::UNIX_EPOCH { Some(st) } else { None }
            };

            let raw_name = sz_entry.name().to_string();
            let occurrence = keys.iter().filter(|k| k.raw_name == raw_name).count();
            entries.push(NewEntry {
                path: entry_path,
                is_directory: sz_entry.is_directory(),
                length: sz_entry.size(),
                timestamp: system_time_to_millis(modified),
            });
            keys.push(MemberKey { raw_name, occurrence });
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            keys,
            single_file,
        })
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    /// Decode the archive up to the requested member and copy it into `out`.
    /// Solid blocks are decoded in order, so members before it are drained.
    pub fn extract(&mut self, index: usize, out: &mut dyn Write) -> VfsResult<u64> {
        let Some(key) = self.keys.get(index).cloned() else {
            return Err(VfsError::NotFound(format!("{}: entry #{}", self.path.display(), index)));
        };

        let mut reader =
            SevenZReader::open(&self.path, Password::empty()).map_err(|e| VfsError::corrupt(&self.path, e))?;

        let mut seen = 0usize;
        let mut written: Option<u64> = None;
        let mut write_error: Option<std::io::Error> = None;
        reader
            .for_each_entries(|entry, data: &mut dyn Read| {
                if entry.name() != key.raw_name {
                    std::io::copy(data, &mut std::io::sink())
                        .map_err(|e| sevenz_rust::Error::other(format!("Failed to read: {}", e)))?;
                    return Ok(true);
                }
                if seen < key.occurrence {
                    seen += 1;
                    std::io::copy(data, &mut std::io::sink())
                        .map_err(|e| sevenz_rust::Error::other(format!("Failed to read: {}", e)))?;
                    return Ok(true);
                }
                match std::io::copy(data, out) {
                    Ok(n) => written = Some(n),
                    Err(e) => write_error = Some(e),
                }
                Ok(false)
            })
            .map_err(|e| VfsError::corrupt(&self.path, e))?;

        if let Some(e) = write_error {
            return Err(VfsError::Io(e));
        }
        written.ok_or_else(|| VfsError::corrupt(&self.path, format!("member {} not decoded", key.raw_name)))
    }
}
