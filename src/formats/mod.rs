//! Format readers
//!
//! Supports: zip, tar, tar.gz, tar.bz2, tar.xz, 7z, rar, and single-file gz/bz2/xz.
//!
//! Each reader opens one local archive file, lists its entries once, and can
//! extract any entry by its position in that list. Readers that can produce an
//! entry from an independent file handle also offer a detached stream, which
//! does not need the shared reader to stay locked while it is consumed.

mod compressed;
mod rar;
mod sevenz;
mod tar;
mod zip;

pub use self::compressed::CompressedFile;
pub use self::rar::RarReader;
pub use self::sevenz::SevenZipReader;
pub use self::tar::TarReader;
pub use self::zip::ZipReader;

use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::NewEntry;

/// Stream compressor wrapped around a tar or a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
}

impl Codec {
    /// Wrap a raw compressed stream in the matching decoder
    pub fn decoder<'a, R: Read + Send + 'a>(self, reader: R) -> Box<dyn Read + Send + 'a> {
        let reader = BufReader::new(reader);
        match self {
            Codec::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Codec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
            Codec::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        }
    }

    fn magic(self) -> &'static [u8] {
        match self {
            Codec::Gzip => &[0x1f, 0x8b],
            Codec::Bzip2 => b"BZh",
            Codec::Xz => &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
        }
    }

    /// Fail with `CorruptArchive` unless the file starts with this codec's magic
    pub fn check_magic(self, path: &Path) -> VfsResult<()> {
        let magic = self.magic();
        let mut head = vec![0u8; magic.len()];
        let mut file = std::fs::File::open(path)?;
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == head.len() && head == magic {
            Ok(())
        } else {
            Err(VfsError::corrupt(path, format!("not a {} stream", self.display_name())))
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Codec::Gzip => "GZ",
            Codec::Bzip2 => "BZ2",
            Codec::Xz => "XZ",
        }
    }
}

/// Supported archive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    /// Tar, optionally wrapped in a stream compressor
    Tar(Option<Codec>),
    /// A single compressed file (gz, bz2, xz)
    Compressed(Codec),
    SevenZip,
    Rar,
}

const ZIP_EXTENSIONS: &[&str] = &[
    "zip", "jar", "war", "ear", "apk", "aar", "epub", "nupkg", "whl", "xpi", "ipa", "vsix",
    "odt", "ods", "odp", "docx", "xlsx", "pptx",
];

/// Suffixes checked longest first; `None` codec means plain tar
const TAR_SUFFIXES: &[(&str, Option<Codec>)] = &[
    (".tar.gz", Some(Codec::Gzip)),
    (".tar.bz2", Some(Codec::Bzip2)),
    (".tar.xz", Some(Codec::Xz)),
    (".tgz", Some(Codec::Gzip)),
    (".taz", Some(Codec::Gzip)),
    (".tbz2", Some(Codec::Bzip2)),
    (".tbz", Some(Codec::Bzip2)),
    (".tb2", Some(Codec::Bzip2)),
    (".tz2", Some(Codec::Bzip2)),
    (".txz", Some(Codec::Xz)),
    (".tar", None),
];

impl ArchiveKind {
    /// Detect archive type from file extension.
    ///
    /// With `expand_compressed_tar` off, compressed tars are treated as
    /// single-file archives whose member is the inner tar.
    pub fn from_path(path: &Path, expand_compressed_tar: bool) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        Self::from_file_name(&name, expand_compressed_tar)
    }

    pub fn from_file_name(name: &str, expand_compressed_tar: bool) -> Option<Self> {
        let name = name.to_lowercase();

        for (suffix, codec) in TAR_SUFFIXES {
            if name.ends_with(suffix) {
                return Some(match codec {
                    Some(codec) if !expand_compressed_tar => ArchiveKind::Compressed(*codec),
                    _ => ArchiveKind::Tar(*codec),
                });
            }
        }

        let extension = name.rsplit_once('.').map(|(_, ext)| ext)?;
        if ZIP_EXTENSIONS.contains(&extension) {
            return Some(ArchiveKind::Zip);
        }
        match extension {
            "7z" => Some(ArchiveKind::SevenZip),
            "rar" => Some(ArchiveKind::Rar),
            "gz" => Some(ArchiveKind::Compressed(Codec::Gzip)),
            "bz2" => Some(ArchiveKind::Compressed(Codec::Bzip2)),
            "xz" => Some(ArchiveKind::Compressed(Codec::Xz)),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "ZIP",
            ArchiveKind::Tar(None) => "TAR",
            ArchiveKind::Tar(Some(Codec::Gzip)) => "TAR.GZ",
            ArchiveKind::Tar(Some(Codec::Bzip2)) => "TAR.BZ2",
            ArchiveKind::Tar(Some(Codec::Xz)) => "TAR.XZ",
            ArchiveKind::Compressed(codec) => codec.display_name(),
            ArchiveKind::SevenZip => "7Z",
            ArchiveKind::Rar => "RAR",
        }
    }

    /// All extensions this crate claims, for host file-type registration
    pub fn all_extensions() -> Vec<String> {
        let mut extensions: Vec<String> = ZIP_EXTENSIONS.iter().map(|e| format!(".{}", e)).collect();
        extensions.extend(TAR_SUFFIXES.iter().map(|(suffix, _)| suffix.to_string()));
        extensions.extend([".7z", ".rar", ".gz", ".bz2", ".xz"].iter().map(|e| e.to_string()));
        extensions
    }
}

/// An open archive. One variant per supported container.
pub enum ArchiveReader {
    Compressed(CompressedFile),
    Zip(ZipReader),
    Tar(TarReader),
    SevenZip(SevenZipReader),
    Rar(RarReader),
}

impl ArchiveReader {
    pub fn open(kind: ArchiveKind, path: &Path) -> VfsResult<Self> {
        log::debug!("opening {} archive {}", kind.display_name(), path.display());
        Ok(match kind {
            ArchiveKind::Zip => ArchiveReader::Zip(ZipReader::open(path)?),
            ArchiveKind::Tar(codec) => ArchiveReader::Tar(TarReader::open(path, codec)?),
            ArchiveKind::Compressed(codec) => ArchiveReader::Compressed(CompressedFile::open(path, codec)?),
            ArchiveKind::SevenZip => ArchiveReader::SevenZip(SevenZipReader::open(path)?),
            ArchiveKind::Rar => ArchiveReader::Rar(RarReader::open(path)?),
        })
    }

    /// Entries in archive order
    pub fn entries(&self) -> &[NewEntry] {
        match self {
            ArchiveReader::Compressed(r) => r.entries(),
            ArchiveReader::Zip(r) => r.entries(),
            ArchiveReader::Tar(r) => r.entries(),
            ArchiveReader::SevenZip(r) => r.entries(),
            ArchiveReader::Rar(r) => r.entries(),
        }
    }

    /// True when the archive holds exactly one member that has no stored path
    pub fn is_single_file(&self) -> bool {
        match self {
            ArchiveReader::Compressed(_) => true,
            ArchiveReader::SevenZip(r) => r.is_single_file(),
            _ => false,
        }
    }

    /// Decompress entry `index` into `out`. Returns the number of bytes written.
    pub fn extract(&mut self, index: usize, out: &mut dyn Write) -> VfsResult<u64> {
        match self {
            ArchiveReader::Compressed(r) => r.extract(out),
            ArchiveReader::Zip(r) => r.extract(index, out),
            ArchiveReader::Tar(r) => r.extract(index, out),
            ArchiveReader::SevenZip(r) => r.extract(index, out),
            ArchiveReader::Rar(r) => r.extract(index, out),
        }
    }

    /// A stream over entry `index` on its own file handle, if this format can
    /// produce one. `None` means the entry must be pushed through `extract`.
    pub fn open_detached(&self, index: usize) -> VfsResult<Option<Box<dyn Read + Send>>> {
        match self {
            ArchiveReader::Compressed(r) => r.open_detached().map(Some),
            ArchiveReader::Tar(r) => r.open_detached(index),
            _ => Ok(None),
        }
    }

    /// Size used by the too-large guard when the entry does not record one
    pub fn fallback_length(&self) -> Option<u64> {
        match self {
            ArchiveReader::Compressed(r) => r.compressed_length(),
            _ => None,
        }
    }
}

/// Map an I/O error raised while decoding into the crate error
pub(crate) fn decode_error(path: &Path, err: std::io::Error) -> VfsError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput | std::io::ErrorKind::UnexpectedEof => {
            VfsError::corrupt(path, err)
        }
        _ => VfsError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_zip_family() {
        for name in ["a.zip", "B.JAR", "book.epub", "app.apk"] {
            assert_eq!(ArchiveKind::from_file_name(name, true), Some(ArchiveKind::Zip), "{}", name);
        }
    }

    #[test]
    fn test_detect_tar_family_longest_suffix_first() {
        assert_eq!(ArchiveKind::from_file_name("a.tar", true), Some(ArchiveKind::Tar(None)));
        assert_eq!(ArchiveKind::from_file_name("a.tar.gz", true), Some(ArchiveKind::Tar(Some(Codec::Gzip))));
        assert_eq!(ArchiveKind::from_file_name("a.TGZ", true), Some(ArchiveKind::Tar(Some(Codec::Gzip))));
        assert_eq!(ArchiveKind::from_file_name("a.tbz2", true), Some(ArchiveKind::Tar(Some(Codec::Bzip2))));
        assert_eq!(ArchiveKind::from_file_name("a.tar.xz", true), Some(ArchiveKind::Tar(Some(Codec::Xz))));
    }

    #[test]
    fn test_compressed_tar_as_single_file() {
        assert_eq!(ArchiveKind::from_file_name("a.tgz", false), Some(ArchiveKind::Compressed(Codec::Gzip)));
        assert_eq!(ArchiveKind::from_file_name("a.tar.bz2", false), Some(ArchiveKind::Compressed(Codec::Bzip2)));
        assert_eq!(ArchiveKind::from_file_name("a.tar", false), Some(ArchiveKind::Tar(None)));
    }

    #[test]
    fn test_detect_other_kinds() {
        assert_eq!(ArchiveKind::from_file_name("a.7z", true), Some(ArchiveKind::SevenZip));
        assert_eq!(ArchiveKind::from_file_name("a.rar", true), Some(ArchiveKind::Rar));
        assert_eq!(ArchiveKind::from_file_name("report.txt.gz", true), Some(ArchiveKind::Compressed(Codec::Gzip)));
        assert_eq!(ArchiveKind::from_file_name("a.xz", true), Some(ArchiveKind::Compressed(Codec::Xz)));
        assert_eq!(ArchiveKind::from_file_name("notes.txt", true), None);
        assert_eq!(ArchiveKind::from_file_name("noext", true), None);
    }

    #[test]
    fn test_all_extensions_are_detected() {
        for ext in ArchiveKind::all_extensions() {
            let name = format!("file{}", ext);
            assert!(ArchiveKind::from_file_name(&name, true).is_some(), "{}", name);
        }
    }

    #[test]
    fn test_check_magic() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.gz");
        std::fs::write(&good, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert!(Codec::Gzip.check_magic(&good).is_ok());
        assert!(matches!(Codec::Bzip2.check_magic(&good), Err(VfsError::CorruptArchive(_))));

        let short = dir.path().join("b.xz");
        std::fs::write(&short, [0xfd]).unwrap();
        assert!(matches!(Codec::Xz.check_magic(&short), Err(VfsError::CorruptArchive(_))));
    }
}
