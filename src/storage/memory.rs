//! In-memory storage implementation for testing and throwaway indexes.
//!
//! Besides the plain [`Storage`] contract, [`MemoryStorage`] tracks which
//! files have been synced so tests can simulate a machine crash with
//! [`MemoryStorage::crash`]: every file written since its last sync is lost,
//! and outputs still open at crash time never publish their content.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::error::{QuireError, Result};
use crate::storage::traits::{
    NoLock, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

#[derive(Debug, Default)]
struct MemoryFiles {
    files: HashMap<String, Arc<[u8]>>,
    unsynced: HashSet<String>,
}

/// An in-memory storage implementation.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: Arc<Mutex<MemoryFiles>>,
    /// Names of the advisory locks currently held.
    locks: Arc<Mutex<HashSet<String>>>,
    /// Bumped by every simulated crash; outputs opened in an older epoch are discarded.
    epoch: Arc<AtomicU64>,
    /// Fault injection: make every `sync` call fail.
    fail_sync: AtomicBool,
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(MemoryFiles::default())),
            locks: Arc::new(Mutex::new(HashSet::new())),
            epoch: Arc::new(AtomicU64::new(0)),
            fail_sync: AtomicBool::new(false),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().files.len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        let files = self.files.lock();
        files.files.values().map(|data| data.len() as u64).sum()
    }

    /// Make subsequent `sync` calls fail with an I/O error.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Simulate a machine crash.
    ///
    /// Files that were never synced disappear, held locks are dropped and
    /// outputs that are still open will not publish anything when closed.
    pub fn crash(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let mut files = self.files.lock();
        let lost: Vec<String> = files.unsynced.drain().collect();
        for name in &lost {
            files.files.remove(name);
        }
        drop(files);

        self.locks.lock().clear();
        debug!("simulated crash lost {} unsynced files", lost.len());
    }

    /// Overwrite a file's bytes in place, for corruption tests.
    pub fn corrupt_file(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let mut files = self.files.lock();
        if !files.files.contains_key(name) {
            return Err(StorageError::FileNotFound(name.to_string()).into());
        }
        files.files.insert(name.to_string(), Arc::from(bytes));
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new_default()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            epoch: Arc::clone(&self.epoch),
            opened_in: self.epoch.load(Ordering::SeqCst),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().files.contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        files.files.remove(name);
        files.unsynced.remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        if files.unsynced.remove(old_name) {
            files.unsynced.insert(new_name.to_string());
        }
        files.files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(QuireError::Io(std::io::Error::other("injected sync failure")));
        }

        let mut files = self.files.lock();
        for name in names {
            if !files.files.contains_key(name) {
                return Err(StorageError::FileNotFound(name.clone()).into());
            }
            files.unsynced.remove(name);
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        if !self.config.use_locking {
            return Ok(Box::new(NoLock::new(name)));
        }

        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
    size: u64,
}

impl MemoryInput {
    /// Read from bytes already held in memory, such as a compound-file entry.
    pub fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
///
/// Content is published into the storage on close, or on drop if the output
/// was abandoned half way (which is how a torn write looks after a crash).
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: Arc<Mutex<MemoryFiles>>,
    epoch: Arc<AtomicU64>,
    opened_in: u64,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Opened before a simulated crash: the bytes never made it anywhere.
        if self.epoch.load(Ordering::SeqCst) != self.opened_in {
            return Ok(());
        }

        let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
        let mut files = self.files.lock();
        files.files.insert(self.name.clone(), data);
        files.unsynced.insert(self.name.clone());
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.locks.lock().contains(&self.name)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(storage: &MemoryStorage, name: &str, data: &[u8]) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(data).unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_memory_storage_creation() {
        let storage = MemoryStorage::new_default();
        assert_eq!(storage.file_count(), 0);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();
        write_file(&storage, "test.txt", b"Hello, Memory!");

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 14);
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new_default();
        assert!(!storage.file_exists("nonexistent.txt"));

        write_file(&storage, "test.txt", b"Test content");
        assert!(storage.file_exists("test.txt"));
        assert_eq!(storage.file_size("test.txt").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["test.txt"]);

        storage.rename_file("test.txt", "renamed.txt").unwrap();
        assert!(!storage.file_exists("test.txt"));
        assert!(storage.file_exists("renamed.txt"));

        storage.copy_file("renamed.txt", "copy.txt").unwrap();
        assert_eq!(storage.file_size("copy.txt").unwrap(), 12);

        storage.delete_file("renamed.txt").unwrap();
        storage.delete_file("renamed.txt").unwrap();
        assert!(!storage.file_exists("renamed.txt"));
        assert_eq!(storage.file_count(), 1);
    }

    #[test]
    fn test_file_not_found() {
        let storage = MemoryStorage::new_default();

        let err = storage.open_input("nonexistent.txt").unwrap_err();
        assert!(matches!(err, QuireError::FileNotFound(_)));
        assert!(storage.file_size("nonexistent.txt").is_err());
        assert!(storage.sync(&["nonexistent.txt".to_string()]).is_err());
    }

    #[test]
    fn test_dropped_output_publishes_partial_content() {
        let storage = MemoryStorage::new_default();
        {
            let mut output = storage.create_output("torn.bin").unwrap();
            output.write_all(b"half").unwrap();
        }
        assert_eq!(storage.file_size("torn.bin").unwrap(), 4);
    }

    #[test]
    fn test_crash_discards_unsynced_files() {
        let storage = MemoryStorage::new_default();
        write_file(&storage, "durable.bin", b"kept");
        storage.sync(&["durable.bin".to_string()]).unwrap();
        write_file(&storage, "volatile.bin", b"lost");

        let mut open = storage.create_output("open.bin").unwrap();
        open.write_all(b"in flight").unwrap();

        storage.crash();
        open.close().unwrap();

        assert!(storage.file_exists("durable.bin"));
        assert!(!storage.file_exists("volatile.bin"));
        assert!(!storage.file_exists("open.bin"));
    }

    #[test]
    fn test_sync_failure_injection() {
        let storage = MemoryStorage::new_default();
        write_file(&storage, "a.bin", b"a");

        storage.set_fail_on_sync(true);
        assert!(storage.sync(&["a.bin".to_string()]).is_err());

        storage.set_fail_on_sync(false);
        storage.sync(&["a.bin".to_string()]).unwrap();
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let storage = MemoryStorage::new_default();

        let mut lock = storage.obtain_lock("write.lock").unwrap();
        assert!(lock.is_valid());

        let err = storage.obtain_lock("write.lock").unwrap_err();
        assert!(matches!(err, QuireError::LockObtainFailed(_)));

        lock.release().unwrap();
        assert!(!lock.is_valid());

        let second = storage.obtain_lock("write.lock").unwrap();
        drop(second);
        assert!(storage.obtain_lock("write.lock").is_ok());
    }

    #[test]
    fn test_locking_disabled() {
        let config = StorageConfig {
            use_locking: false,
            ..Default::default()
        };
        let storage = MemoryStorage::new(config);

        let _first = storage.obtain_lock("write.lock").unwrap();
        assert!(storage.obtain_lock("write.lock").is_ok());
    }
}
