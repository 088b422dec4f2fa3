//! # Quire
//!
//! The write side of a segment-based full-text index, for Rust.
//!
//! ## Features
//!
//! - Two-phase commits to write-once `segments_N` files, with crash-safe discovery
//! - Lock-free buffered deletes with happens-before ordering against indexing
//! - Doc-values updates and query deletes
//! - Tiered merge policy, serial and concurrent merge schedulers
//! - Pluggable storage, codec and document pipeline
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use quire::prelude::*;
//!
//! let storage = Arc::new(MemoryStorage::default());
//! let writer = IndexWriter::open(storage, IndexWriterConfig::default()).unwrap();
//! writer
//!     .add_document(Document::new().with_term("id", "1"))
//!     .unwrap();
//! writer.delete_documents(vec![Term::new("id", "1")]).unwrap();
//! writer.commit().unwrap();
//! writer.close().unwrap();
//! ```

pub mod error;
pub mod index;
pub mod merge;
pub mod storage;
pub mod util;
pub mod writer;

pub mod prelude {
    pub use crate::error::{QuireError, Result};
    pub use crate::index::pipeline::Document;
    pub use crate::index::{CatalogSnapshot, SegmentCatalog, SegmentCommitInfo, Term};
    pub use crate::merge::{
        ConcurrentMergeScheduler, MergePolicy, MergeScheduler, NoMergePolicy,
        SerialMergeScheduler, TieredMergePolicy,
    };
    pub use crate::storage::{FileStorage, MemoryStorage, Storage};
    pub use crate::writer::{IndexWriter, IndexWriterConfig, IndexWriterSettings, OpenMode};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
