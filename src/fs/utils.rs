use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::utils::{millis_to_system_time, system_time_to_millis};

/// (modification time, length) snapshot of a local file.
///
/// A cached reader is trusted only while the file still has the stamp that
/// was recorded when the reader was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    /// Milliseconds since the epoch
    pub modified: i64,
    pub length: u64,
}

impl FileStamp {
    /// Stamp of the file at `path`; follows symlinks
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            modified: system_time_to_millis(meta.modified().ok()),
            length: meta.len(),
        })
    }
}

/// Canonical form of a local archive path
pub fn canonical_path(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

/// Set the modification time of `dest` from an epoch-millis timestamp.
/// Best-effort: unknown timestamps and failures are ignored.
pub fn set_modified_millis(dest: &Path, millis: i64) {
    if let Some(mtime) = millis_to_system_time(millis) {
        let _ = filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(mtime));
    }
}

/// Copy a stream into `dest` through a uniquely named temp file in the same
/// directory, renaming it over `dest` on success. Returns the number of bytes
/// copied. A failed copy leaves `dest` untouched and removes the temp file.
pub fn copy_stream_to_file(reader: &mut dyn Read, dest: &Path) -> std::io::Result<u64> {
    let dir = match dest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut part = tempfile::Builder::new().suffix(".part").tempfile_in(dir)?;
    let total = std::io::copy(reader, part.as_file_mut())?;
    part.as_file_mut().flush()?;
    part.persist(dest)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_tracks_length_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"12345").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let stamp = FileStamp::of(&path).unwrap();
        assert_eq!(stamp.length, 5);
        assert_eq!(stamp.modified, 1_000_000_000);
    }

    #[test]
    fn test_canonical_path_resolves_dots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();
        let dotted = dir.path().join(".").join("a.bin");
        assert_eq!(canonical_path(&path).unwrap(), canonical_path(&dotted).unwrap());
    }

    #[test]
    fn test_copy_stream_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tar");
        let mut data: &[u8] = b"payload";
        assert_eq!(copy_stream_to_file(&mut data, &dest).unwrap(), 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_stream_failure_cleans_up() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("boom"))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tar");
        assert!(copy_stream_to_file(&mut Failing, &dest).is_err());
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_set_modified_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");
        std::fs::write(&path, b"").unwrap();
        set_modified_millis(&path, 2_000_000_000);
        assert_eq!(FileStamp::of(&path).unwrap().modified, 2_000_000_000);
    }
}
