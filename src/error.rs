//! Error types for the Quire library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`QuireError`] enum. The variants follow the failure classes of the write
//! path: corrupt or missing commit files, storage failures, programming errors
//! such as a double `prepare_commit`, cooperative merge cancellation and the
//! sticky out-of-memory quarantine of a writer.
//!
//! # Examples
//!
//! ```
//! use quire::error::{QuireError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(QuireError::invalid_operation("prepare_commit was already called"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Quire operations.
#[derive(Error, Debug)]
pub enum QuireError {
    /// I/O errors raised by the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed a checksum or violates an invariant.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// No commit file could be located.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// A named file does not exist in storage.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Storage-related errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The advisory write lock is held by someone else.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The call is not valid in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The writer was closed or rolled back.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// The writer previously hit an out-of-memory condition.
    #[error("Writer quarantined: {0}")]
    Quarantined(String),

    /// Memory could not be allocated.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// A merge observed its abort flag.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// A merge failed.
    #[error("Merge failed: {0}")]
    Merge(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with QuireError.
pub type Result<T> = std::result::Result<T, QuireError>;

impl QuireError {
    /// Create a new corrupt index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        QuireError::CorruptIndex(msg.into())
    }

    /// Create a new index not found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        QuireError::IndexNotFound(msg.into())
    }

    /// Create a new file not found error.
    pub fn file_not_found<S: Into<String>>(msg: S) -> Self {
        QuireError::FileNotFound(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        QuireError::Storage(msg.into())
    }

    /// Create a new lock error.
    pub fn lock_obtain_failed<S: Into<String>>(msg: S) -> Self {
        QuireError::LockObtainFailed(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        QuireError::InvalidOperation(msg.into())
    }

    /// Create a new already closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        QuireError::AlreadyClosed(msg.into())
    }

    /// Create a new quarantine error.
    pub fn quarantined<S: Into<String>>(msg: S) -> Self {
        QuireError::Quarantined(msg.into())
    }

    /// Create a new out of memory error.
    pub fn out_of_memory<S: Into<String>>(msg: S) -> Self {
        QuireError::OutOfMemory(msg.into())
    }

    /// Create a new merge aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        QuireError::MergeAborted(msg.into())
    }

    /// Create a new merge error.
    pub fn merge<S: Into<String>>(msg: S) -> Self {
        QuireError::Merge(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        QuireError::Serialization(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        QuireError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        QuireError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Whether this error must latch the writer into quarantine.
    pub fn is_oom(&self) -> bool {
        matches!(self, QuireError::OutOfMemory(_))
    }

    /// Whether this error is a cooperative merge cancellation.
    pub fn is_merge_aborted(&self) -> bool {
        matches!(self, QuireError::MergeAborted(_))
    }

    /// Whether commit discovery may retry after this error.
    ///
    /// A commit in progress can make a just-listed `segments_N` disappear or
    /// look truncated, so I/O, missing-file and corruption failures all count.
    pub fn is_retryable_on_discovery(&self) -> bool {
        matches!(
            self,
            QuireError::Io(_) | QuireError::FileNotFound(_) | QuireError::CorruptIndex(_)
        )
    }

    /// Produce a best-effort copy of this error for fan-out to several waiters.
    ///
    /// Wrapped foreign errors lose their source chain but keep their message.
    pub fn duplicate(&self) -> Self {
        match self {
            QuireError::Io(e) => QuireError::Io(io::Error::new(e.kind(), e.to_string())),
            QuireError::CorruptIndex(m) => QuireError::CorruptIndex(m.clone()),
            QuireError::IndexNotFound(m) => QuireError::IndexNotFound(m.clone()),
            QuireError::FileNotFound(m) => QuireError::FileNotFound(m.clone()),
            QuireError::Storage(m) => QuireError::Storage(m.clone()),
            QuireError::LockObtainFailed(m) => QuireError::LockObtainFailed(m.clone()),
            QuireError::InvalidOperation(m) => QuireError::InvalidOperation(m.clone()),
            QuireError::AlreadyClosed(m) => QuireError::AlreadyClosed(m.clone()),
            QuireError::Quarantined(m) => QuireError::Quarantined(m.clone()),
            QuireError::OutOfMemory(m) => QuireError::OutOfMemory(m.clone()),
            QuireError::MergeAborted(m) => QuireError::MergeAborted(m.clone()),
            QuireError::Merge(m) => QuireError::Merge(m.clone()),
            QuireError::Json(e) => QuireError::Serialization(e.to_string()),
            QuireError::Serialization(m) => QuireError::Serialization(m.clone()),
            QuireError::Other(m) => QuireError::Other(m.clone()),
            QuireError::Anyhow(e) => QuireError::Other(e.to_string()),
        }
    }
}

impl From<bincode::Error> for QuireError {
    fn from(err: bincode::Error) -> Self {
        QuireError::Serialization(err.to_string())
    }
}
