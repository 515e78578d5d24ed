//! Allocation reference tree
//!
//! Each allocation's namespace is a tree of [`Ref`]s stored in the key-value
//! store. A file's hash commits to its content fields; a directory's hash
//! commits to its children's hashes, so the root hash commits to the whole
//! allocation.
//!
//! ## Keys
//!
//! ```text
//! ref:<sha256("<allocation_id>:<canonical path>")>
//! ```
//!
//! Parents are referenced by store key and re-read on every use; nothing holds
//! a live handle to another node.

pub mod model;
pub mod store;

pub use model::{directory_hash, FileContent, Ref, RefKind, RefListing, RefType};
pub use store::ReferenceStore;

use crate::digest;

/// Entity id of the ref at `path` within an allocation
pub fn lookup_key(allocation_id: &str, path: &str) -> String {
    digest::hash(format!("{}:{}", allocation_id, path))
}

/// Normalize a slash-separated path
///
/// Always absolute, no empty or `.` segments, `..` resolved, no trailing
/// slash. The allocation root is `/`.
pub fn canonical_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Parent of a canonical path, `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => Some("/".to_string()),
    }
}

/// Last segment of a canonical path; the root is named `/`
pub fn file_name(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Canonical paths from the root down to `path`, inclusive
pub fn ancestors_top_down(path: &str) -> Vec<String> {
    let mut chain = vec![path.to_string()];
    let mut current = path.to_string();
    while let Some(parent) = parent_path(&current) {
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    chain
}

/// Child path under a canonical directory path
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_path() {
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("docs//readme.txt"), "/docs/readme.txt");
        assert_eq!(canonical_path("/docs/./a/../readme.txt/"), "/docs/readme.txt");
        assert_eq!(canonical_path("/../.."), "/");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/docs/readme.txt").as_deref(), Some("/docs"));
        assert_eq!(parent_path("/docs").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(file_name("/docs/readme.txt"), "readme.txt");
        assert_eq!(file_name("/"), "/");
        assert_eq!(join_path("/", "docs"), "/docs");
        assert_eq!(join_path("/docs", "a"), "/docs/a");
    }

    #[test]
    fn test_ancestors_top_down() {
        assert_eq!(ancestors_top_down("/"), vec!["/"]);
        assert_eq!(ancestors_top_down("/a/b"), vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn test_lookup_key_is_scoped_by_allocation() {
        assert_eq!(lookup_key("A1", "/docs"), lookup_key("A1", "/docs"));
        assert_ne!(lookup_key("A1", "/docs"), lookup_key("A2", "/docs"));
        assert_ne!(lookup_key("A1", "/docs"), lookup_key("A1", "/doc"));
    }
}
