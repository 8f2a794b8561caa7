//! Archive entry tree
//!
//! Every archive is indexed as an arena of [`EntryInfo`] nodes keyed by their
//! in-archive path. Parents are arena indices, so a node never keeps another
//! node alive and the tree has no reference cycles.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::fs::path::{join_path, normalize_entry_path, split_path};
use crate::utils::millis_to_system_time;

/// Length reported when an entry does not carry its uncompressed size
pub const DEFAULT_LENGTH: u64 = 0;
/// Timestamp reported when an entry does not carry a modification time
pub const DEFAULT_TIMESTAMP: i64 = -1;

/// Index of a node inside an [`EntryTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Own name, never containing '/'. Empty for the root.
    pub short_name: Box<str>,
    pub is_directory: bool,
    /// Uncompressed size, `DEFAULT_LENGTH` when unknown
    pub length: u64,
    /// Milliseconds since the epoch, `DEFAULT_TIMESTAMP` when unknown
    pub timestamp: i64,
    /// Containing directory, `None` only for the root
    pub parent: Option<EntryId>,
}

impl EntryInfo {
    pub fn attributes(&self) -> EntryAttributes {
        EntryAttributes {
            is_directory: self.is_directory,
            length: self.length,
            timestamp: self.timestamp,
        }
    }
}

/// Attributes of a single entry, detached from the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAttributes {
    pub is_directory: bool,
    pub length: u64,
    pub timestamp: i64,
}

impl EntryAttributes {
    pub fn modified(&self) -> Option<SystemTime> {
        millis_to_system_time(self.timestamp)
    }
}

/// An entry as reported by a format reader, before it is placed in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Normalized in-archive path
    pub path: String,
    pub is_directory: bool,
    pub length: u64,
    pub timestamp: i64,
}

/// Path-indexed tree of archive entries
#[derive(Debug, Clone, Default)]
pub struct EntryTree {
    nodes: Vec<EntryInfo>,
    children: Vec<Vec<EntryId>>,
    index: HashMap<String, EntryId>,
}

impl EntryTree {
    /// Tree holding only the root directory
    pub fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.push(EntryInfo {
            short_name: "".into(),
            is_directory: true,
            length: DEFAULT_LENGTH,
            timestamp: DEFAULT_TIMESTAMP,
            parent: None,
        });
        tree.children.push(Vec::new());
        tree.index.insert(String::new(), EntryId(0));
        tree
    }

    /// Build a tree from reader entries.
    ///
    /// Ancestors missing from the listing are synthesized as directories. An
    /// ancestor that the listing reports as a file is promoted to a directory.
    /// Paths are normalized first, so `a//b` and `a/./b` both land at `a/b`.
    pub fn build<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = NewEntry>,
    {
        let entries: Vec<NewEntry> = entries
            .into_iter()
            .map(|entry| NewEntry {
                path: normalize_entry_path(&entry.path),
                ..entry
            })
            .collect();
        let mut by_path: HashMap<&str, &NewEntry> = HashMap::with_capacity(entries.len());
        for entry in &entries {
            by_path.entry(entry.path.as_str()).or_insert(entry);
        }

        let mut tree = Self::new();
        for entry in &entries {
            tree.get_or_create_entry(entry, &by_path);
        }
        tree
    }

    fn get_or_create_entry(&mut self, entry: &NewEntry, by_path: &HashMap<&str, &NewEntry>) -> EntryId {
        if let Some(&id) = self.index.get(&entry.path) {
            return id;
        }
        let (parent_path, name) = split_path(&entry.path);
        let parent = self.get_or_create_directory(parent_path, by_path);
        if name.is_empty() || name == "." {
            return parent;
        }
        self.insert(
            entry.path.clone(),
            EntryInfo {
                short_name: name.into(),
                is_directory: entry.is_directory,
                length: entry.length,
                timestamp: entry.timestamp,
                parent: Some(parent),
            },
        )
    }

    fn get_or_create_directory(&mut self, path: &str, by_path: &HashMap<&str, &NewEntry>) -> EntryId {
        let id = match self.index.get(path) {
            Some(&id) => id,
            None => match by_path.get(path) {
                Some(listed) => self.get_or_create_entry(listed, by_path),
                None => {
                    let (parent_path, name) = split_path(path);
                    let parent = self.get_or_create_directory(parent_path, by_path);
                    self.insert(
                        path.to_string(),
                        EntryInfo {
                            short_name: name.into(),
                            is_directory: true,
                            length: DEFAULT_LENGTH,
                            timestamp: DEFAULT_TIMESTAMP,
                            parent: Some(parent),
                        },
                    )
                }
            },
        };
        let node = &mut self.nodes[id.index()];
        if !node.is_directory {
            node.is_directory = true;
        }
        id
    }

    fn insert(&mut self, path: String, info: EntryInfo) -> EntryId {
        let id = EntryId(self.nodes.len() as u32);
        if let Some(parent) = info.parent {
            self.children[parent.index()].push(id);
        }
        self.nodes.push(info);
        self.children.push(Vec::new());
        self.index.insert(path, id);
        id
    }

    pub fn root(&self) -> EntryId {
        EntryId(0)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn find(&self, path: &str) -> Option<EntryId> {
        self.index.get(path).copied()
    }

    pub fn get(&self, id: EntryId) -> &EntryInfo {
        &self.nodes[id.index()]
    }

    pub fn lookup(&self, path: &str) -> Option<&EntryInfo> {
        self.find(path).map(|id| self.get(id))
    }

    pub fn children(&self, id: EntryId) -> &[EntryId] {
        &self.children[id.index()]
    }

    /// Full in-archive path of a node
    pub fn path_of(&self, id: EntryId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let info = self.get(cur);
            if info.parent.is_some() {
                names.push(&*info.short_name);
            }
            current = info.parent;
        }
        names.reverse();
        names.join("/")
    }

    /// All (path, node) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (String, &EntryInfo)> + '_ {
        (0..self.nodes.len()).map(move |i| {
            let id = EntryId(i as u32);
            (self.path_of(id), self.get(id))
        })
    }

    /// Child short names of the directory at `path`
    pub fn list(&self, path: &str) -> Vec<String> {
        match self.find(path) {
            Some(id) if self.get(id).is_directory => self
                .children(id)
                .iter()
                .map(|child| self.get(*child).short_name.to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Directory listing of `path` as presentation entries, directories first
    pub fn list_entries(&self, path: &str, path_prefix: &str) -> Vec<VirtualEntry> {
        let Some(id) = self.find(path) else {
            return Vec::new();
        };
        let mut result: Vec<VirtualEntry> = self
            .children(id)
            .iter()
            .map(|&child| {
                let info = self.get(child);
                let child_path = join_path(path, &info.short_name);
                VirtualEntry::new(
                    info.short_name.to_string(),
                    format!("{}{}", path_prefix, child_path),
                    info.is_directory,
                    info.length,
                )
                .with_modified(millis_to_system_time(info.timestamp))
            })
            .collect();
        sort_entries(&mut result);
        result
    }
}

/// Represents a single file or directory entry returned to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualEntry {
    /// File/directory name (not full path)
    pub name: String,
    /// Composite path of the entry
    pub path: String,
    /// Whether this is a directory
    pub is_dir: bool,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: Option<SystemTime>,
    /// Whether the name starts with '.'
    pub is_hidden: bool,
}

impl VirtualEntry {
    pub fn new(name: String, path: String, is_dir: bool, size: u64) -> Self {
        let is_hidden = name.starts_with('.');
        Self {
            name,
            path,
            is_dir,
            size,
            modified: None,
            is_hidden,
        }
    }

    pub fn with_modified(mut self, time: Option<SystemTime>) -> Self {
        self.modified = time;
        self
    }
}

/// Directories first, then case-insensitive by name
pub fn sort_entries(entries: &mut [VirtualEntry]) {
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, length: u64) -> NewEntry {
        NewEntry {
            path: path.to_string(),
            is_directory: false,
            length,
            timestamp: 1000,
        }
    }

    fn dir(path: &str) -> NewEntry {
        NewEntry {
            path: path.to_string(),
            is_directory: true,
            length: DEFAULT_LENGTH,
            timestamp: 2000,
        }
    }

    #[test]
    fn test_synthesizes_missing_ancestors() {
        let tree = EntryTree::build(vec![file("a/b/c.txt", 3)]);
        assert_eq!(tree.len(), 4);
        let a = tree.lookup("a").unwrap();
        let ab = tree.lookup("a/b").unwrap();
        assert!(a.is_directory);
        assert!(ab.is_directory);
        assert_eq!(ab.timestamp, DEFAULT_TIMESTAMP);
        assert_eq!(tree.lookup("a/b/c.txt").unwrap().length, 3);
    }

    #[test]
    fn test_explicit_directory_listed_after_child_keeps_its_attributes() {
        let tree = EntryTree::build(vec![file("x/y.txt", 10), dir("x")]);
        assert_eq!(tree.len(), 3);
        let x = tree.lookup("x").unwrap();
        assert!(x.is_directory);
        assert_eq!(x.timestamp, 2000);
        assert_eq!(tree.children(tree.root()).len(), 1);
    }

    #[test]
    fn test_file_ancestor_is_promoted() {
        let tree = EntryTree::build(vec![file("a", 5), file("a/b.txt", 1)]);
        let a = tree.lookup("a").unwrap();
        assert!(a.is_directory);
        assert_eq!(a.length, 5);
        assert_eq!(tree.list("a"), vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_duplicate_paths_are_not_duplicated() {
        let tree = EntryTree::build(vec![file("a.txt", 1), file("a.txt", 2)]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.lookup("a.txt").unwrap().length, 1);
    }

    #[test]
    fn test_parent_chain_reaches_root() {
        let tree = EntryTree::build(vec![file("p/q/r/s.txt", 1)]);
        for (path, _) in tree.iter() {
            let mut id = tree.find(&path).unwrap();
            while let Some(parent) = tree.get(id).parent {
                id = parent;
            }
            assert_eq!(id, tree.root());
        }
    }

    #[test]
    fn test_path_of_roundtrips() {
        let tree = EntryTree::build(vec![file("one/two/three.bin", 1), dir("one/empty")]);
        for (path, _) in tree.iter() {
            assert_eq!(tree.find(&path).map(|id| tree.path_of(id)), Some(path.clone()));
        }
    }

    #[test]
    fn test_building_twice_is_identical() {
        let input = vec![file("z/1.txt", 1), dir("y"), file("y/2.txt", 2), file("3.txt", 3)];
        let first = EntryTree::build(input.clone());
        let second = EntryTree::build(input);
        let a: Vec<(String, EntryInfo)> = first.iter().map(|(p, i)| (p, i.clone())).collect();
        let b: Vec<(String, EntryInfo)> = second.iter().map(|(p, i)| (p, i.clone())).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_entries_sorts_directories_first() {
        let tree = EntryTree::build(vec![file("b.txt", 1), file("A.txt", 1), dir("zdir")]);
        let listed = tree.list_entries("", "/tmp/a.zip!/");
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "A.txt", "b.txt"]);
        assert_eq!(listed[1].path, "/tmp/a.zip!/A.txt");
    }

    #[test]
    fn test_doubled_separators_do_not_create_nameless_directories() {
        let tree = EntryTree::build(vec![file("a//b.txt", 4), file("c/./d.txt", 5)]);
        assert_eq!(tree.list("a"), vec!["b.txt".to_string()]);
        assert_eq!(tree.list("c"), vec!["d.txt".to_string()]);
        assert_eq!(tree.lookup("a/b.txt").unwrap().length, 4);
        assert!(tree.iter().all(|(_, info)| info.parent.is_none() || !info.short_name.is_empty()));
        assert!(tree.iter().all(|(_, info)| &*info.short_name != "."));
    }

    #[test]
    fn test_dot_entries_collapse_into_parent() {
        let tree = EntryTree::build(vec![dir("."), file("a.txt", 1)]);
        assert_eq!(tree.len(), 2);
    }
}
