use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ::tar::{Archive, EntryType};

use super::{Codec, decode_error};
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::{DEFAULT_TIMESTAMP, NewEntry};
use crate::fs::path::normalize_entry_path;

/// Where an entry's data lives
#[derive(Debug, Clone, Copy)]
struct TarLocation {
    /// Position in the raw entry sequence, used to rescan compressed tars
    ordinal: usize,
    /// Byte offset of the data in an uncompressed tar
    offset: u64,
    size: u64,
}

/// Tar reader, optionally behind a stream compressor.
///
/// A plain tar is random access: every entry is read straight from its data
/// offset. A compressed tar is forward-only, so extraction reopens the stream
/// and walks the headers up to the requested entry.
pub struct TarReader {
    path: PathBuf,
    codec: Option<Codec>,
    entries: Vec<NewEntry>,
    locations: Vec<TarLocation>,
}

impl TarReader {
    pub fn open(path: &Path, codec: Option<Codec>) -> VfsResult<Self> {
        if let Some(codec) = codec {
            codec.check_magic(path)?;
        }

        let mut archive = Archive::new(open_stream(path, codec)?);
        let mut entries = Vec::new();
        let mut locations = Vec::new();

        let iter = archive.entries().map_err(|e| decode_error(path, e))?;
        for (ordinal, entry) in iter.enumerate() {
            let entry = entry.map_err(|e| decode_error(path, e))?;
            let header = entry.header();
            let entry_type = header.entry_type();
            if matches!(
                entry_type,
                EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName | EntryType::GNULongLink
            ) {
                continue;
            }

            let raw_path = entry.path().map_err(|e| VfsError::corrupt(path, e))?;
            let entry_path = normalize_entry_path(&raw_path.to_string_lossy());
            if entry_path.is_empty() || entry_path == "." {
                continue;
            }

            let is_directory = entry_type.is_dir();
            let size = if is_directory { 0 } else { entry.size() };
            let timestamp = header
                .mtime()
                .ok()
                .map(|secs| secs as i64 * 1000)
                .unwrap_or(DEFAULT_TIMESTAMP);

            entries.push(NewEntry {
                path: entry_path,
                is_directory,
                length: size,
                timestamp,
            });
            locations.push(TarLocation {
                ordinal,
                offset: entry.raw_file_position(),
                size,
            });
        }

        log::debug!("{}: {} tar entries", path.display(), entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            codec,
            entries,
            locations,
        })
    }

    pub fn entries(&self) -> &[NewEntry] {
        &self.entries
    }

    fn location(&self, index: usize) -> VfsResult<TarLocation> {
        self.locations
            .get(index)
            .copied()
            .ok_or_else(|| VfsError::NotFound(format!("{}: entry #{}", self.path.display(), index)))
    }

    /// Uncompressed tars hand out a bounded reader on a fresh file handle
    pub fn open_detached(&self, index: usize) -> VfsResult<Option<Box<dyn Read + Send>>> {
        if self.codec.is_some() {
            return Ok(None);
        }
        let location = self.location(index)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        Ok(Some(Box::new(BufReader::new(file).take(location.size))))
    }

    pub fn extract(&mut self, index: usize, out: &mut dyn Write) -> VfsResult<u64> {
        let location = self.location(index)?;

        if let Some(mut reader) = self.open_detached(index)? {
            return std::io::copy(&mut reader, out).map_err(|e| decode_error(&self.path, e));
        }

        // Forward scan
        let mut archive = Archive::new(open_stream(&self.path, self.codec)?);
        let iter = archive.entries().map_err(|e| decode_error(&self.path, e))?;
        for (ordinal, entry) in iter.enumerate() {
            let mut entry = entry.map_err(|e| decode_error(&self.path, e))?;
            if ordinal == location.ordinal {
                return std::io::copy(&mut entry, out).map_err(|e| decode_error(&self.path, e));
            }
        }
        Err(VfsError::corrupt(&self.path, "archive ended before the requested entry"))
    }
}

fn open_stream(path: &Path, codec: Option<Codec>) -> VfsResult<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    Ok(match codec {
        Some(codec) => codec.decoder(file),
        None => Box::new(BufReader::new(file)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn append_file<W: Write>(builder: &mut ::tar::Builder<W>, path: &str, data: &[u8]) {
        let mut header = ::tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn append_dir<W: Write>(builder: &mut ::tar::Builder<W>, path: &str) {
        let mut header = ::tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, std::io::empty()).unwrap();
    }

    fn fill<W: Write>(builder: &mut ::tar::Builder<W>) {
        append_dir(builder, "docs/");
        append_file(builder, "docs/readme.md", b"# readme");
        append_file(builder, "./src/main.rs", b"fn main() {}");
        append_file(builder, "last.bin", &[7u8; 1500]);
    }

    fn build_tar(path: &Path) {
        let mut builder = ::tar::Builder::new(File::create(path).unwrap());
        fill(&mut builder);
        builder.finish().unwrap();
    }

    fn build_tar_gz(path: &Path) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = ::tar::Builder::new(encoder);
        fill(&mut builder);
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_plain_tar_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        build_tar(&path);

        let reader = TarReader::open(&path, None).unwrap();
        let paths: Vec<&str> = reader.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs", "docs/readme.md", "src/main.rs", "last.bin"]);
        assert!(reader.entries()[0].is_directory);
        assert_eq!(reader.entries()[3].length, 1500);
        assert_eq!(reader.entries()[1].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_plain_tar_detached_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        build_tar(&path);

        let reader = TarReader::open(&path, None).unwrap();
        let mut stream = reader.open_detached(2).unwrap().unwrap();
        let mut data = String::new();
        stream.read_to_string(&mut data).unwrap();
        assert_eq!(data, "fn main() {}");
    }

    #[test]
    fn test_gzip_tar_forward_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar.gz");
        build_tar_gz(&path);

        let mut reader = TarReader::open(&path, Some(Codec::Gzip)).unwrap();
        assert_eq!(reader.entries().len(), 4);
        assert!(reader.open_detached(1).unwrap().is_none());

        let mut out = Vec::new();
        assert_eq!(reader.extract(3, &mut out).unwrap(), 1500);
        assert!(out.iter().all(|b| *b == 7));

        // Earlier entry after a later one: the scan restarts from the top
        out.clear();
        reader.extract(1, &mut out).unwrap();
        assert_eq!(out, b"# readme");
    }

    #[test]
    fn test_gzip_tar_rejects_plain_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tgz");
        build_tar(&path);
        assert!(matches!(TarReader::open(&path, Some(Codec::Gzip)), Err(VfsError::CorruptArchive(_))));
    }
}
