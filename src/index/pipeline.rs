//! Document intake and flushing.
//!
//! A [`DocumentPipeline`] buffers documents in per-thread batches and turns
//! each batch into a segment on flush. Every batch owns a [`DeleteSlice`] of
//! the writer's [`DeleteQueue`], advanced each time a document finishes, so a
//! delete enqueued before a document is done is resolved against that
//! document's batch. At flush the slice is pinned to the same point as the
//! frozen global packet: items up to it were applied to the batch, items
//! after it travel in a later packet.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::buffered_updates::{BufferedUpdates, FrozenBufferedUpdates};
use crate::index::codec::Codec;
use crate::index::delete_queue::{DeleteQueue, DeleteSlice};
use crate::index::file_names;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::term::{DocValue, Term};
use crate::storage::Storage;
use crate::util::bits::LiveDocs;

/// A document as the write path sees it: indexed terms plus per-field values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub terms: Vec<Term>,
    pub values: BTreeMap<String, DocValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term<F: Into<String>, T: Into<String>>(mut self, field: F, text: T) -> Self {
        self.terms.push(Term::new(field, text));
        self
    }

    pub fn with_numeric<F: Into<String>>(mut self, field: F, value: i64) -> Self {
        self.values.insert(field.into(), DocValue::Numeric(value));
        self
    }

    pub fn with_binary<F: Into<String>>(mut self, field: F, value: Vec<u8>) -> Self {
        self.values.insert(field.into(), DocValue::Binary(value));
        self
    }

    pub fn add_term(&mut self, term: Term) {
        self.terms.push(term);
    }

    /// Whether the document carries `term`.
    pub fn has_term(&self, term: &Term) -> bool {
        self.terms.contains(term)
    }
}

/// What a flush needs from the writer.
pub struct FlushContext<'a> {
    pub storage: &'a dyn Storage,
    pub codec: &'a dyn Codec,
    pub use_compound_file: bool,
    /// Allocates the name of the next segment.
    pub new_segment_name: &'a dyn Fn() -> String,
}

/// A segment produced by a flush, not yet part of the catalog.
#[derive(Debug)]
pub struct FlushedSegment {
    /// Deletes resolved at flush are already written as its first
    /// live-docs generation.
    pub record: SegmentCommitInfo,
    /// Query deletes and updates that still apply to this segment alone.
    pub segment_updates: Option<FrozenBufferedUpdates>,
}

/// One unit of publication: the global packet frozen with a batch, then
/// the batch's segment. Either may be absent.
#[derive(Debug)]
pub struct FlushTicket {
    pub global_updates: Option<FrozenBufferedUpdates>,
    pub segment: Option<FlushedSegment>,
}

/// Source of flushed segments and buffered deletes.
pub trait DocumentPipeline: Send + Sync + fmt::Debug {
    /// Buffer `doc`. With `delete_term`, documents already buffered or
    /// indexed that contain the term are deleted first.
    fn add_document(&self, doc: Document, delete_term: Option<Term>) -> Result<()>;

    /// The queue deletes and updates are enqueued on.
    fn delete_queue(&self) -> &Arc<DeleteQueue>;

    /// Flush every batch, handing the tickets to `publish` in order.
    ///
    /// Returns the number of segments flushed. A ticket handed to `publish`
    /// before an error stays published.
    fn flush_all(
        &self,
        ctx: &FlushContext<'_>,
        publish: &mut dyn FnMut(FlushTicket) -> Result<()>,
    ) -> Result<usize>;

    /// Discard every buffered document.
    fn abort(&self);

    /// Whether documents or deletes are waiting for a flush.
    fn any_changes(&self) -> bool;

    fn num_buffered_docs(&self) -> usize;
}

struct Batch {
    docs: Vec<Document>,
    slice: DeleteSlice,
    pending: BufferedUpdates,
}

impl Batch {
    fn new(queue: &DeleteQueue) -> Self {
        Batch {
            docs: Vec::new(),
            slice: queue.new_slice(),
            pending: BufferedUpdates::new(),
        }
    }

    fn add(&mut self, queue: &DeleteQueue, doc: Document, delete_term: Option<Term>) {
        let num_docs = self.docs.len();
        let mut apply_slice = num_docs != 0;
        match delete_term {
            Some(term) => queue.add_term_to_slice(term, &mut self.slice),
            None => apply_slice &= queue.update_slice(&mut self.slice),
        }
        if apply_slice {
            self.slice.apply(&mut self.pending, num_docs);
        } else {
            // Nothing buffered yet that the items could delete.
            self.slice.reset();
        }
        self.docs.push(doc);
    }
}

/// Reference pipeline buffering whole documents in memory.
///
/// Batches live in a fixed set of slots; a thread takes the first free slot,
/// so concurrent callers fill separate batches.
pub struct BufferedPipeline {
    delete_queue: Arc<DeleteQueue>,
    slots: Vec<Mutex<Option<Batch>>>,
    next_slot: AtomicUsize,
    num_docs: AtomicUsize,
    flush_lock: Mutex<()>,
}

impl fmt::Debug for BufferedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedPipeline")
            .field("slots", &self.slots.len())
            .field("num_docs", &self.num_docs.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for BufferedPipeline {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl BufferedPipeline {
    pub fn new(num_slots: usize) -> Self {
        let num_slots = num_slots.max(1);
        BufferedPipeline {
            delete_queue: Arc::new(DeleteQueue::new()),
            slots: (0..num_slots).map(|_| Mutex::new(None)).collect(),
            next_slot: AtomicUsize::new(0),
            num_docs: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    fn flush_batch(&self, batch: Batch, ctx: &FlushContext<'_>) -> Result<FlushTicket> {
        let Batch {
            docs,
            mut slice,
            mut pending,
        } = batch;

        let global = self.delete_queue.freeze_global_buffer(Some(&mut slice));
        slice.apply(&mut pending, docs.len());
        let global_updates = global.any().then_some(global);

        if docs.is_empty() {
            return Ok(FlushTicket {
                global_updates,
                segment: None,
            });
        }

        let name = (ctx.new_segment_name)();
        match write_segment(ctx, &name, &docs, &mut pending) {
            Ok(segment) => Ok(FlushTicket {
                global_updates,
                segment: Some(segment),
            }),
            Err(e) => {
                warn!("flush of {name} failed: {e}");
                discard_segment_files(ctx.storage, &name);
                Err(e)
            }
        }
    }
}

fn write_segment(
    ctx: &FlushContext<'_>,
    name: &str,
    docs: &[Document],
    pending: &mut BufferedUpdates,
) -> Result<FlushedSegment> {
    // Term deletes of this batch are resolved here, against the documents.
    let mut live_docs = LiveDocs::new(docs.len());
    let mut del_count = 0;
    if !pending.terms().is_empty() {
        for (doc_id, doc) in docs.iter().enumerate() {
            let deleted = doc
                .terms
                .iter()
                .any(|term| pending.term_limit(term).is_some_and(|limit| doc_id < limit));
            if deleted && live_docs.delete(doc_id) {
                del_count += 1;
            }
        }
    }
    pending.clear_terms();

    let mut files = ctx.codec.write_documents(ctx.storage, name, docs)?;
    if ctx.use_compound_file {
        let compound = ctx.codec.write_compound_file(ctx.storage, name, &files)?;
        for file in &files {
            if let Err(e) = ctx.storage.delete_file(file) {
                debug!("could not delete {file} after bundling: {e}");
            }
        }
        files = compound;
    }

    let mut info = SegmentInfo::new(name, docs.len(), ctx.codec.name())
        .with_files(files)
        .with_compound_file(ctx.use_compound_file)
        .with_diagnostic("source", "flush");
    ctx.codec.write_segment_info(ctx.storage, &mut info)?;

    let mut record = SegmentCommitInfo::fresh(info);
    if del_count > 0 {
        let generation = record.next_write_del_gen();
        ctx.codec
            .write_live_docs(ctx.storage, &record, &live_docs, generation)?;
        record.advance_del_gen();
        record.set_del_count(del_count)?;
    }

    let segment_updates = pending
        .any()
        .then(|| FrozenBufferedUpdates::new(pending, true));

    debug!(
        "flushed {record} ({} docs, {del_count} deleted at flush, private updates: {})",
        docs.len(),
        segment_updates.is_some()
    );
    Ok(FlushedSegment {
        record,
        segment_updates,
    })
}

fn discard_segment_files(storage: &dyn Storage, segment: &str) {
    let Ok(files) = storage.list_files() else {
        return;
    };
    for file in files {
        if file_names::is_index_file(&file) && file_names::parse_segment_name(&file) == segment {
            if let Err(e) = storage.delete_file(&file) {
                debug!("could not delete {file}: {e}");
            }
        }
    }
}

impl DocumentPipeline for BufferedPipeline {
    fn add_document(&self, doc: Document, delete_term: Option<Term>) -> Result<()> {
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = (0..self.slots.len())
            .find_map(|i| self.slots[(start + i) % self.slots.len()].try_lock())
            .unwrap_or_else(|| self.slots[start].lock());

        let batch = slot.get_or_insert_with(|| Batch::new(&self.delete_queue));
        batch.add(&self.delete_queue, doc, delete_term);
        self.num_docs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn delete_queue(&self) -> &Arc<DeleteQueue> {
        &self.delete_queue
    }

    fn flush_all(
        &self,
        ctx: &FlushContext<'_>,
        publish: &mut dyn FnMut(FlushTicket) -> Result<()>,
    ) -> Result<usize> {
        let _flushing = self.flush_lock.lock();
        let mut flushed = 0;

        for slot in &self.slots {
            let Some(batch) = slot.lock().take() else {
                continue;
            };
            self.num_docs.fetch_sub(batch.docs.len(), Ordering::AcqRel);
            let ticket = self.flush_batch(batch, ctx)?;
            if ticket.segment.is_some() {
                flushed += 1;
            }
            publish(ticket)?;
        }

        // Deletes enqueued after the last batch froze.
        let global = self.delete_queue.freeze_global_buffer(None);
        if global.any() {
            publish(FlushTicket {
                global_updates: Some(global),
                segment: None,
            })?;
        }
        Ok(flushed)
    }

    fn abort(&self) {
        let _flushing = self.flush_lock.lock();
        let mut discarded = 0;
        for slot in &self.slots {
            if let Some(batch) = slot.lock().take() {
                discarded += batch.docs.len();
            }
        }
        self.num_docs.fetch_sub(discarded, Ordering::AcqRel);
        debug!("pipeline aborted, discarded {discarded} buffered docs");
    }

    fn any_changes(&self) -> bool {
        self.num_buffered_docs() > 0 || self.delete_queue.any_changes()
    }

    fn num_buffered_docs(&self) -> usize {
        self.num_docs.load(Ordering::Acquire)
    }
}

/// Names of the files of every flushed segment in `tickets`.
pub fn ticket_files(tickets: &[FlushTicket]) -> BTreeSet<String> {
    tickets
        .iter()
        .filter_map(|t| t.segment.as_ref())
        .flat_map(|s| s.record.files())
        .collect()
}
