//! Error types for the blobber core

use thiserror::Error;

/// Step of a bottom-up hash recomputation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashChainStep {
    /// Reading a child ref while hashing a directory
    ReadChild,
    /// Persisting a recomputed hash
    WriteRef,
    /// Re-fetching the parent from the store
    ReadParent,
    /// The caller's context was cancelled between steps
    Cancelled,
}

impl std::fmt::Display for HashChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadChild => "read_child",
            Self::WriteRef => "write_ref",
            Self::ReadParent => "read_parent",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("File store error: {0}")]
    FileStore(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Hash chain failed at {path} ({step}): {source}")]
    HashChain {
        path: String,
        step: HashChainStep,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Invalid validation ticket: {0}")]
    InvalidTicket(String),

    #[error("Invalid challenge transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Challenge {id} exhausted {retries} retries")]
    RetriesExhausted { id: String, retries: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap this error with the operation that was in progress
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True if this error, or the error it wraps, is a missing key
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Context { source, .. } | Self::HashChain { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True if this error, or the error it wraps, came from a cancelled context
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Context { source, .. } | Self::HashChain { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
