//! In-archive path helpers
//!
//! Archive entry paths always use `/`, never start with a separator and never
//! end with one. The root of an archive is the empty path.

/// Extensions that stand for "tar inside a compressor" in a single suffix
const MERGED_ARCHIVE_EXTENSIONS: &[(&str, &str)] = &[
    ("tgz", "tar"),
    ("tlz", "tar"),
    ("tz", "tar"),
    ("taz", "tar"),
    ("tzst", "tar"),
    ("tb2", "tar"),
    ("tbz", "tar"),
    ("tbz2", "tar"),
    ("tz2", "tar"),
    ("txz", "tar"),
];

/// Normalize archive paths: replace backslashes, drop empty and "." segments
/// so leading, trailing and doubled separators vanish
pub fn normalize_entry_path(p: &str) -> String {
    p.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Split an entry path into (parent path, short name)
pub fn split_path(entry_name: &str) -> (&str, &str) {
    match entry_name.rfind('/') {
        Some(p) if p > 0 => (&entry_name[..p], &entry_name[p + 1..]),
        _ => ("", entry_name),
    }
}

/// Join a directory path and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Extension of a file name without the dot, if any
pub fn file_extension(file_name: &str) -> Option<&str> {
    match file_name.rfind('.') {
        Some(p) if p > 0 && p + 1 < file_name.len() => Some(&file_name[p + 1..]),
        _ => None,
    }
}

/// Inner extension implied by a merged extension like `tgz`
pub fn merged_inner_extension(extension: &str) -> Option<&'static str> {
    MERGED_ARCHIVE_EXTENSIONS
        .iter()
        .find(|(merged, _)| merged.eq_ignore_ascii_case(extension))
        .map(|(_, inner)| *inner)
}

/// Append the inner extension of a merged extension to `name`, unless `name`
/// already carries it.
pub fn decorate_merged_name_with_extension(extension: &str, name: &str) -> String {
    match merged_inner_extension(extension) {
        Some(inner) => {
            let suffix = format!(".{}", inner);
            if name.to_ascii_lowercase().ends_with(&suffix) {
                name.to_string()
            } else {
                format!("{}{}", name, suffix)
            }
        }
        None => name.to_string(),
    }
}

/// Name of the only member of a single-file archive that does not store one.
///
/// `report.txt.gz` gives `report.txt`, `data.tgz` gives `data.tar`.
pub fn single_file_member_name(archive_file_name: &str) -> String {
    match file_extension(archive_file_name) {
        Some(ext) => {
            let stem = &archive_file_name[..archive_file_name.len() - ext.len() - 1];
            decorate_merged_name_with_extension(ext, stem)
        }
        None => archive_file_name.to_string(),
    }
}
