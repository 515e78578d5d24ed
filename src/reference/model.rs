//! Reference tree nodes
//!
//! A [`Ref`] is either a directory holding child keys or a file holding
//! content commitments. The two shapes are separate enum variants so a file
//! can never carry children.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::lookup_key;
use crate::datastore::Entity;
use crate::digest;

/// Version stamped on newly created refs
pub const REF_VERSION: &str = "1.0";

/// Type discriminant as it appears in hash data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefType {
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "f")]
    File,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "d",
            Self::File => "f",
        }
    }
}

impl std::fmt::Display for RefType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content commitments of a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content_hash: String,
    pub size: i64,
    pub merkle_root: String,
    pub actual_file_size: i64,
    pub actual_file_hash: String,
    pub custom_meta: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    /// Child name -> child ref store key, ordered by name
    #[serde(rename = "d")]
    Directory { children: BTreeMap<String, String> },
    #[serde(rename = "f")]
    File(FileContent),
}

/// A node of an allocation's namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub allocation_id: String,
    pub name: String,
    /// Canonical path, `/` for the root
    pub path: String,
    /// Store key of the parent, `None` only for the root
    pub parent_ref: Option<String>,
    pub hash: String,
    pub version: String,
    /// Unix seconds
    pub creation_date: i64,
    pub kind: RefKind,
}

impl Ref {
    /// An empty directory at a canonical path
    pub fn directory(allocation_id: &str, path: &str, parent_ref: Option<String>) -> Self {
        Self::new(
            allocation_id,
            path,
            parent_ref,
            RefKind::Directory {
                children: BTreeMap::new(),
            },
        )
    }

    /// A file at a canonical path, with its hash already computed
    pub fn file(
        allocation_id: &str,
        path: &str,
        parent_ref: Option<String>,
        content: FileContent,
    ) -> Self {
        let mut file = Self::new(allocation_id, path, parent_ref, RefKind::File(content));
        file.hash = file.file_hash().unwrap_or_default();
        file
    }

    fn new(allocation_id: &str, path: &str, parent_ref: Option<String>, kind: RefKind) -> Self {
        Self {
            allocation_id: allocation_id.to_string(),
            name: super::file_name(path).to_string(),
            path: path.to_string(),
            parent_ref,
            hash: String::new(),
            version: REF_VERSION.to_string(),
            creation_date: digest::now(),
            kind,
        }
    }

    pub fn ref_type(&self) -> RefType {
        match self.kind {
            RefKind::Directory { .. } => RefType::Directory,
            RefKind::File(_) => RefType::File,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_ref.is_none()
    }

    /// Children of a directory, `None` for a file
    pub fn children(&self) -> Option<&BTreeMap<String, String>> {
        match &self.kind {
            RefKind::Directory { children } => Some(children),
            RefKind::File(_) => None,
        }
    }

    pub fn file_content(&self) -> Option<&FileContent> {
        match &self.kind {
            RefKind::File(content) => Some(content),
            RefKind::Directory { .. } => None,
        }
    }

    /// Colon-joined hash input of a file
    pub fn file_hash_data(&self) -> Option<String> {
        let content = self.file_content()?;
        Some(format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            RefType::File,
            self.name,
            self.path,
            content.size,
            content.content_hash,
            content.merkle_root,
            content.actual_file_size,
            content.actual_file_hash,
        ))
    }

    /// Hash of a file; a pure function of its fields
    pub fn file_hash(&self) -> Option<String> {
        self.file_hash_data().map(digest::hash)
    }

    /// Row shown when listing a directory
    pub fn listing(&self) -> RefListing {
        let content = self.file_content();
        RefListing {
            name: self.name.clone(),
            path: self.path.clone(),
            ref_type: self.ref_type(),
            hash: self.hash.clone(),
            size: content.map(|c| c.size),
            content_hash: content.map(|c| c.content_hash.clone()),
            merkle_root: content.map(|c| c.merkle_root.clone()),
            actual_file_size: content.map(|c| c.actual_file_size),
            custom_meta: content.map(|c| c.custom_meta.clone()),
            num_children: self.children().map(|c| c.len()),
        }
    }
}

impl Entity for Ref {
    const NAME: &'static str = "ref";

    fn entity_id(&self) -> String {
        lookup_key(&self.allocation_id, &self.path)
    }
}

/// Hash of a directory from its children's hashes in name order
pub fn directory_hash<'a>(child_hashes: impl IntoIterator<Item = &'a str>) -> String {
    digest::hash(child_hashes.into_iter().collect::<Vec<_>>().join(":"))
}

/// Listing row for one ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefListing {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_meta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_children: Option<usize>,
}
