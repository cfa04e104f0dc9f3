//! In-memory filesystem tree.
//!
//! Paths are stored relative to `/` without a leading slash (`etc/passwd`)
//! in a `BTreeMap`, so iteration is always path-lexicographic and never
//! depends on the order packages were extracted or the host filesystem.

use std::collections::BTreeMap;
use std::sync::Arc;

/// What a path holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File(Arc<[u8]>),
    Symlink(String),
    /// Hard link to another path in the tree (relative form)
    Hardlink(String),
}

/// A filesystem entry with ownership and permission bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNode {
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FsNode {
    pub fn directory(mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            kind: NodeKind::Directory,
            mode,
            uid,
            gid,
        }
    }

    pub fn file(data: impl Into<Arc<[u8]>>, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            kind: NodeKind::File(data.into()),
            mode,
            uid,
            gid,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }
}

/// Normalize `/a//b/./c/` to `a/b/c`. Returns `None` for the root itself
/// or for paths escaping the root with `..`.
pub fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// A root filesystem under construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FsTree {
    nodes: BTreeMap<String, FsNode>,
}

impl FsTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `path`, creating missing parent directories as
    /// `root:root 0755`. Existing parents are left untouched.
    pub fn insert(&mut self, path: &str, node: FsNode) {
        let Some(path) = normalize(path) else {
            return;
        };
        self.ensure_parents(&path);
        if !node.is_dir() {
            if let Some(existing) = self.nodes.get(&path) {
                if existing.is_dir() {
                    self.remove_children(&path);
                }
            }
        }
        self.nodes.insert(path, node);
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            let replace = match self.nodes.get(&prefix) {
                Some(node) => !node.is_dir(),
                None => true,
            };
            if replace {
                self.nodes
                    .insert(prefix.clone(), FsNode::directory(0o755, 0, 0));
            }
        }
    }

    fn remove_children(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.nodes.retain(|p, _| !p.starts_with(&prefix));
    }

    pub fn get(&self, path: &str) -> Option<&FsNode> {
        normalize(path).and_then(|p| self.nodes.get(&p))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut FsNode> {
        normalize(path).and_then(move |p| self.nodes.get_mut(&p))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// File contents at `path`, if it is a regular file.
    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        match &self.get(path)?.kind {
            NodeKind::File(data) => Some(data),
            _ => None,
        }
    }

    /// All entries in path-lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FsNode)> {
        self.nodes.iter().map(|(p, n)| (p.as_str(), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/var//lib/./pg/").as_deref(), Some("var/lib/pg"));
        assert_eq!(normalize("./usr/bin").as_deref(), Some("usr/bin"));
        assert_eq!(normalize("/a/b/../c").as_deref(), Some("a/c"));
        assert_eq!(normalize("/"), None);
        assert_eq!(normalize("../etc"), None);
    }

    #[test]
    fn test_insert_creates_parents() {
        let mut tree = FsTree::new();
        tree.insert("/usr/bin/git", FsNode::file(b"elf".to_vec(), 0o755, 0, 0));
        assert!(tree.get("/usr").unwrap().is_dir());
        assert!(tree.get("usr/bin").unwrap().is_dir());
        assert_eq!(tree.read_file("/usr/bin/git"), Some(&b"elf"[..]));
    }

    #[test]
    fn test_insert_keeps_existing_parent_metadata() {
        let mut tree = FsTree::new();
        tree.insert("/var/lib/postgresql", FsNode::directory(0o700, 70, 70));
        tree.insert("/var/lib/postgresql/data", FsNode::directory(0o777, 0, 0));
        let parent = tree.get("/var/lib/postgresql").unwrap();
        assert_eq!((parent.uid, parent.mode), (70, 0o700));
    }

    #[test]
    fn test_iteration_is_sorted() {
        let mut tree = FsTree::new();
        tree.insert("/z", FsNode::file(Vec::new(), 0o644, 0, 0));
        tree.insert("/a/b", FsNode::file(Vec::new(), 0o644, 0, 0));
        let paths: Vec<&str> = tree.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a", "a/b", "z"]);
    }

    #[test]
    fn test_file_replacing_directory_drops_children() {
        let mut tree = FsTree::new();
        tree.insert("/opt/app/bin", FsNode::file(Vec::new(), 0o755, 0, 0));
        tree.insert("/opt/app", FsNode::file(b"x".to_vec(), 0o644, 0, 0));
        assert!(!tree.contains("/opt/app/bin"));
        assert_eq!(tree.read_file("/opt/app"), Some(&b"x"[..]));
    }
}
