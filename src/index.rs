//! Segment catalog, buffered deletes and per-segment reader state.
//!
//! These modules hold the state an [`IndexWriter`](crate::writer::IndexWriter)
//! coordinates: the ordered list of committed segments, the delete queue
//! shared by indexing threads, the stream of frozen delete packets waiting to
//! be applied and the pooled live-docs of every open segment.

pub mod buffered_updates;
pub mod catalog;
pub mod codec;
pub mod delete_queue;
pub mod deleter;
pub mod file_names;
pub mod pipeline;
pub mod reader_pool;
pub mod readers;
pub mod segment;
pub mod term;
pub mod updates_stream;

pub use catalog::{CatalogSnapshot, SegmentCatalog};
pub use codec::{Codec, CodecRegistry, SegmentReader};
pub use segment::{SegmentCommitInfo, SegmentInfo};
pub use term::{DeleteQuery, DocValue, DocValuesUpdate, NumericRangeQuery, Term};
