use thiserror::Error;

/// Error type for archive filesystem operations.
///
/// Codec-specific failures are translated into these variants at the format
/// boundary, so callers never match on zip/tar/7z/rar error types.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("File too big to load into memory: {0}")]
    FileTooBig(String),
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Malformed path: {0}")]
    MalformedPath(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type VfsResult<T> = Result<T, VfsError>;

impl VfsError {
    /// True for errors that mean "nothing at this path" rather than a failure
    /// of the archive itself.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        VfsError::CorruptArchive(format!("{}: {}", path.display(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_counts_as_not_found() {
        let err = VfsError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(VfsError::NotFound("a!/b".into()).is_not_found());
        assert!(!VfsError::FileTooBig("a!/b".into()).is_not_found());
    }

    #[test]
    fn test_corrupt_message_names_archive() {
        let err = VfsError::corrupt(std::path::Path::new("/tmp/a.zip"), "bad header");
        assert_eq!(err.to_string(), "Corrupt archive: /tmp/a.zip: bad header");
    }
}
