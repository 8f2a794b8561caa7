use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{Codec, decode_error};
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::{DEFAULT_LENGTH, NewEntry};
use crate::fs::path::{normalize_entry_path, single_file_member_name, split_path};
use crate::fs::utils::FileStamp;

/// A single compressed file (gz, bz2, xz) presented as a one-member archive
pub struct CompressedFile {
    path: PathBuf,
    codec: Codec,
    entries: Vec<NewEntry>,
    compressed_length: u64,
}

impl CompressedFile {
    pub fn open(path: &Path, codec: Codec) -> VfsResult<Self> {
        codec.check_magic(path)?;
        let stamp = FileStamp::of(path)?;

        let archive_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let (stored_name, stored_time) = match codec {
            Codec::Gzip => read_gzip_header(path)?,
            Codec::Bzip2 | Codec::Xz => (None, None),
        };

        let name = stored_name.unwrap_or_else(|| single_file_member_name(&archive_name));
        let length = match codec {
            Codec::Gzip => read_gzip_isize(path)?,
            Codec::Bzip2 | Codec::Xz => DEFAULT_LENGTH,
        };
        let timestamp = stored_time.unwrap_or(stamp.modified);

        Ok(Self {
            path: path.to_path_buf(),
            codec,
            entries: vec![NewEntry {
                path: name,
                is_directory: false,
                length,
                timestamp,
            }],
            compressed_length: stamp.length,
        })
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    pub fn compressed_length(&self) -> Option<u64> {
        Some(self.compressed_length)
    }

    pub fn open_detached(&self) -> VfsResult<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(self.codec.decoder(file))
    }

    pub fn extract(&self, out: &mut dyn Write) -> VfsResult<u64> {
        let mut decoder = self.open_detached()?;
        std::io::copy(&mut decoder, out).map_err(|e| decode_error(&self.path, e))
    }
}

/// Stored file name and modification time (millis) from a gzip header
fn read_gzip_header(path: &Path) -> VfsResult<(Option<String>, Option<i64>)> {
    let file = File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let Some(header) = decoder.header() else {
        return Err(VfsError::corrupt(path, "invalid gzip header"));
    };

    let name = header
        .filename()
        .map(|raw| normalize_entry_path(&String::from_utf8_lossy(raw)))
        .map(|name| split_path(&name).1.to_string())
        .filter(|name| !name.is_empty());
    let mtime = match header.mtime() {
        0 => None,
        secs => Some(secs as i64 * 1000),
    };
    Ok((name, mtime))
}

/// Uncompressed size from the gzip trailer (RFC 1952 ISIZE, modulo 2^32)
fn read_gzip_isize(path: &Path) -> VfsResult<u64> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 18 {
        return Err(VfsError::corrupt(path, "truncated gzip stream"));
    }
    file.seek(SeekFrom::End(-4))?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer)?;
    Ok(u32::from_le_bytes(trailer) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn write_gzip(path: &Path, data: &[u8]) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn test_unnamed_gzip_member_takes_archive_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt.gz");
        write_gzip(&path, b"hello report");

        let file = CompressedFile::open(&path, Codec::Gzip).unwrap();
        assert_eq!(file.entries().len(), 1);
        assert_eq!(file.entries()[0].path, "report.txt");
        assert_eq!(file.entries()[0].length, 12);
    }

    #[test]
    fn test_unnamed_tgz_member_is_a_tar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tgz");
        write_gzip(&path, b"not really a tar");

        let file = CompressedFile::open(&path, Codec::Gzip).unwrap();
        assert_eq!(file.entries()[0].path, "data.tar");
    }

    #[test]
    fn test_stored_gzip_name_and_mtime_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.gz");
        let mut encoder = flate2::GzBuilder::new()
            .filename("original.csv")
            .mtime(1_600_000_000)
            .write(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"a,b\n").unwrap();
        encoder.finish().unwrap();

        let file = CompressedFile::open(&path, Codec::Gzip).unwrap();
        assert_eq!(file.entries()[0].path, "original.csv");
        assert_eq!(file.entries()[0].timestamp, 1_600_000_000_000);
    }

    #[test]
    fn test_extract_decompresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gz");
        write_gzip(&path, b"payload bytes");

        let file = CompressedFile::open(&path, Codec::Gzip).unwrap();
        let mut out = Vec::new();
        assert_eq!(file.extract(&mut out).unwrap(), 13);
        assert_eq!(out, b"payload bytes");
    }

    #[test]
    fn test_bzip2_length_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt.bz2");
        let mut encoder = bzip2::write::BzEncoder::new(File::create(&path).unwrap(), bzip2::Compression::default());
        encoder.write_all(b"bz data").unwrap();
        encoder.finish().unwrap();

        let file = CompressedFile::open(&path, Codec::Bzip2).unwrap();
        assert_eq!(file.entries()[0].path, "notes.txt");
        assert_eq!(file.entries()[0].length, DEFAULT_LENGTH);
        let mut out = Vec::new();
        file.extract(&mut out).unwrap();
        assert_eq!(out, b"bz data");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.gz");
        std::fs::write(&path, b"plain text, not gzip").unwrap();
        assert!(matches!(CompressedFile::open(&path, Codec::Gzip), Err(VfsError::CorruptArchive(_))));
    }
}
