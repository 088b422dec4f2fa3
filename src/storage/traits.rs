//! Storage traits and common types.

use std::io::{Read, Seek, Write};

use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};

/// A flat namespace of files backing one index.
///
/// Files are written once: the write path never reopens a file for
/// modification, it always creates a new name. Implementations must be safe
/// to share across writer and merge threads.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any previous content.
    ///
    /// The data becomes visible to readers once the output is closed or dropped.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Copy a file to a new name.
    fn copy_file(&self, source: &str, dest: &str) -> Result<()> {
        let mut input = self.open_input(source)?;
        let mut output = self.create_output(dest)?;
        std::io::copy(&mut input, &mut output)?;
        output.close()
    }

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Obtain the advisory lock `name`, failing with
    /// [`QuireError::LockObtainFailed`] if someone else holds it.
    ///
    /// The lock is released when the returned guard is released or dropped.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;
}

/// A readable file.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input.
    fn size(&self) -> Result<u64>;

    /// Close the input.
    fn close(&mut self) -> Result<()>;
}

/// A writable file.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush buffered bytes and sync them to durable storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> Result<u64>;

    /// Close the output, publishing its content.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A held advisory lock.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Name of the lock.
    fn name(&self) -> &str;

    /// Release the lock. Releasing twice is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether `sync` really reaches the disk. Disabling it is only sensible
    /// for throwaway indexes.
    pub sync_writes: bool,

    /// Whether to honour advisory locks.
    pub use_locking: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            buffer_size: 65536, // 64KB
            sync_writes: true,
            use_locking: true,
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Invalid operation.
    InvalidOperation(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for QuireError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => QuireError::file_not_found(name),
            StorageError::LockFailed(name) => QuireError::lock_obtain_failed(name),
            other => QuireError::storage(other.to_string()),
        }
    }
}

/// A lock that does nothing, handed out when locking is disabled.
#[derive(Debug)]
pub struct NoLock {
    name: String,
    released: bool,
}

impl NoLock {
    /// Create a new no-op lock.
    pub fn new(name: &str) -> Self {
        NoLock {
            name: name.to_string(),
            released: false,
        }
    }
}

impl StorageLock for NoLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}
