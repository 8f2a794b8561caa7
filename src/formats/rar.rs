use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::NewEntry;
use crate::fs::path::normalize_entry_path;
use crate::utils::{dos_time_to_system_time, system_time_to_millis};

/// Rar reader backed by the unrar library.
///
/// unrar hands out a member only as a whole buffer, so extraction holds one
/// member in memory before writing it out.
pub struct RarReader {
    path: PathBuf,
    entries: Vec<NewEntry>,
    /// Header position of each listed entry
    ordinals: Vec<usize>,
}

impl RarReader {
    pub fn open(path: &Path) -> VfsResult<Self> {
        let archive = unrar::Archive::new(path)
            .open_for_listing()
            .map_err(|e| VfsError::corrupt(path, e))?;

        let mut entries = Vec::new();
        let mut ordinals = Vec::new();
        for (ordinal, header) in archive.enumerate() {
            let header = header.map_err(|e| VfsError::corrupt(path, e))?;
            let entry_path = normalize_entry_path(&header.filename.to_string_lossy());
            if entry_path.is_empty() || entry_path == "." {
                continue;
            }
            entries.push(NewEntry {
                path: entry_path,
                is_directory: header.is_directory(),
                length: header.unpacked_size,
                timestamp: system_time_to_millis(dos_time_to_system_time(header.file_time)),
            });
            ordinals.push(ordinal);
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            ordinals,
        })
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    pub fn extract(&mut self, index: usize, out: &mut dyn Write) -> VfsResult<u64> {
        let Some(&target) = self.ordinals.get(index) else {
            return Err(VfsError::NotFound(format!("{}: entry #{}", self.path.display(), index)));
        };

        let mut cursor = unrar::Archive::new(&self.path)
            .open_for_processing()
            .map_err(|e| VfsError::corrupt(&self.path, e))?;
        let mut ordinal = 0usize;
        loop {
            let Some(header) = cursor.read_header().map_err(|e| VfsError::corrupt(&self.path, e))? else {
                break;
            };
            if ordinal == target {
                let (data, _next) = header.read().map_err(|e| VfsError::corrupt(&self.path, e))?;
                out.write_all(&data)?;
                return Ok(data.len() as u64);
            }
            cursor = header.skip().map_err(|e| VfsError::corrupt(&self.path, e))?;
            ordinal += 1;
        }
        Err(VfsError::corrupt(&self.path, "archive ended before the requested entry"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_a_rar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rar");
        std::fs::write(&path, b"Rar! but not really").unwrap();
        assert!(matches!(RarReader::open(&path), Err(VfsError::CorruptArchive(_))));
    }
}
