use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use ::zip::ZipArchive;
use ::zip::result::ZipError;

use super::decode_error;
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::NewEntry;
use crate::fs::path::normalize_entry_path;
use crate::utils::{civil_to_system_time, system_time_to_millis};

pub struct ZipReader {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    entries: Vec<NewEntry>,
    /// Position of each listed entry in the central directory
    indices: Vec<usize>,
}

impl ZipReader {
    pub fn open(path: &Path) -> VfsResult<Self> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| zip_error(path, e))?;

        let mut entries = Vec::with_capacity(archive.len());
        let mut indices = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i).map_err(|e| zip_error(path, e))?;
            let entry_path = normalize_entry_path(file.name());
            if entry_path.is_empty() || entry_path == "." {
                continue;
            }

            let modified = file.last_modified().and_then(|dt| {
                civil_to_system_time(
                    dt.year() as i64,
                    dt.month() as i64,
                    dt.day() as i64,
                    dt.hour() as i64,
                    dt.minute() as i64,
                    dt.second() as i64,
                )
            });

            entries.push(NewEntry {
                path: entry_path,
                is_directory: file.is_dir(),
                length: file.size(),
                timestamp: system_time_to_millis(modified),
            });
            indices.push(i);
        }

        Ok(Self {
            path: path.to_path_buf(),
            archive,
            entries,
            indices,
        })
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    pub fn extract(&mut self, index: usize, out: &mut dyn Write) -> VfsResult<u64> {
        let Some(&raw_index) = self.indices.get(index) else {
            return Err(VfsError::NotFound(format!("{}: entry #{}", self.path.display(), index)));
        };
        let mut file = self.archive.by_index(raw_index).map_err(|e| zip_error(&self.path, e))?;
        std::io::copy(&mut file, out).map_err(|e| decode_error(&self.path, e))
    }
}

fn zip_error(path: &Path, err: ZipError) -> VfsError {
    match err {
        ZipError::Io(e) => decode_error(path, e),
        other => VfsError::corrupt(path, other),
    }
}
