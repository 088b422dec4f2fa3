//! Storage abstraction layer for Quire.
//!
//! The write path only needs a flat namespace of write-once files: create,
//! open, delete, list, sync and an advisory lock. [`traits::Storage`] captures
//! that contract; [`memory::MemoryStorage`] and [`file::FileStorage`] are the
//! two backends, and [`structured`] layers checksummed binary encoding on top.

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

pub use file::FileStorage;
pub use memory::{MemoryInput, MemoryStorage};
pub use structured::{StructReader, StructWriter};
pub use traits::{Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput};
