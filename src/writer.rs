//! The index writer.
//!
//! An [`IndexWriter`] owns the write lock of one index. Documents and deletes
//! go through its [`DocumentPipeline`]; flushed segments are published into
//! the in-memory [`SegmentCatalog`], which only becomes durable through the
//! two-phase [`prepare_commit`](IndexWriter::prepare_commit) /
//! [`commit`](IndexWriter::commit). Merges are chosen by the configured
//! [`MergePolicy`](crate::merge::MergePolicy) and run by the configured
//! [`MergeScheduler`](crate::merge::MergeScheduler).
//!
//! Locks are always taken in this order, any prefix may be skipped:
//!
//! 1. the commit lock
//! 2. the full-flush lock
//! 3. the writer monitor (catalog, deleter, merge bookkeeping)
//! 4. the updates stream, then the reader pool
//!
//! The merge scheduler and the pipeline are never called with the monitor
//! held.

pub mod config;
mod merges;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{QuireError, Result};
use crate::index::catalog::{CatalogSnapshot, SegmentCatalog, SnapshotOwner};
use crate::index::deleter::FileDeleter;
use crate::index::pipeline::{Document, DocumentPipeline, FlushContext, FlushTicket, FlushedSegment};
use crate::index::reader_pool::ReaderPool;
use crate::index::segment::SegmentCommitInfo;
use crate::index::term::{DeleteQuery, DocValue, DocValuesUpdate, Term};
use crate::index::updates_stream::BufferedUpdatesStream;
use crate::merge::one_merge::OneMerge;
use crate::merge::policy::MergeTrigger;
use crate::storage::{Storage, StorageLock};

pub use config::{IndexWriterConfig, IndexWriterSettings, OpenMode};
pub use state::WriterState;

use state::StateCell;

/// `max_num_segments` of merges that are not part of a forced merge.
pub(crate) const UNBOUNDED_MAX_MERGE_SEGMENTS: i64 = -1;

/// Everything guarded by the writer monitor.
pub(crate) struct CoreState {
    pub catalog: SegmentCatalog,
    /// Segments of the last commit; what rollback returns to.
    pub rollback_segments: Vec<SegmentCommitInfo>,

    pub pending_commit: Option<SegmentCatalog>,
    pub pending_commit_change_count: u64,
    /// Files referenced on behalf of the commit in flight.
    pub files_to_commit: Option<BTreeSet<String>>,
    pub change_count: u64,
    pub last_commit_change_count: u64,
    pub committed_segments_file: Option<String>,

    pub deleter: FileDeleter,

    pub pending_merges: VecDeque<Arc<OneMerge>>,
    pub running_merges: Vec<Arc<OneMerge>>,
    pub merging_segments: BTreeSet<String>,
    pub merge_exceptions: Vec<Arc<OneMerge>>,
    pub merge_gen: i64,
    pub stop_merges: bool,
    /// Segments eligible for the current forced merge; true for those that
    /// existed when it started.
    pub segments_to_merge: BTreeMap<String, bool>,
    pub merge_max_num_segments: i64,
    pub closing: bool,

    pub flush_count: u64,
    pub flush_deletes_count: u64,

    pub write_lock: Option<Box<dyn StorageLock>>,
}

impl CoreState {
    /// Record a catalog change and let the deleter reference its files.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.change_count += 1;
        self.catalog.changed();
        self.deleter.checkpoint(&self.catalog, false)
    }

    /// Like [`checkpoint`](Self::checkpoint), for changes that only added
    /// files (live docs written on commit) without changing segments.
    pub fn checkpoint_files(&mut self) -> Result<()> {
        self.change_count += 1;
        self.deleter.checkpoint(&self.catalog, false)
    }

    pub fn new_segment_name(&mut self) -> String {
        self.change_count += 1;
        self.catalog.changed();
        self.catalog.new_segment_name()
    }

    fn release_files_to_commit(&mut self) {
        if let Some(files) = self.files_to_commit.take() {
            self.deleter.dec_ref_files(&files);
        }
    }

    fn release_write_lock(&mut self) -> Result<()> {
        match self.write_lock.take() {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        }
    }
}

pub(crate) struct WriterInner {
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    pipeline: Arc<dyn DocumentPipeline>,
    state: StateCell,

    commit_lock: Mutex<()>,
    full_flush_lock: Mutex<()>,
    core: Mutex<CoreState>,
    merge_cond: Condvar,

    updates_stream: BufferedUpdatesStream,
    reader_pool: ReaderPool,
}

/// Adds, updates and deletes documents of one index, and commits them.
///
/// Cheap to clone; clones share the same writer.
#[derive(Clone)]
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("state", &self.inner.state.get())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer on `storage`, taking its write lock.
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.settings.validate()?;
        let settings = config.settings.clone();
        let lock = storage.obtain_lock(&settings.write_lock_name)?;
        let codecs = config.codec_registry();

        let existing = match SegmentCatalog::read_with_lookahead(
            storage.as_ref(),
            &codecs,
            settings.gen_lookahead_count as usize,
        ) {
            Ok(catalog) => Some(catalog),
            Err(QuireError::IndexNotFound(msg)) => {
                if settings.open_mode == OpenMode::Append {
                    return Err(QuireError::IndexNotFound(msg));
                }
                None
            }
            Err(e) => return Err(e),
        };

        let create = match settings.open_mode {
            OpenMode::Create => true,
            OpenMode::Append => false,
            OpenMode::CreateOrAppend => existing.is_none(),
        };

        let (catalog, change_count) = match (&existing, create) {
            (Some(on_disk), false) => (on_disk.clone(), 0),
            (Some(on_disk), true) => {
                // Keep the generation and name counter so the next commit
                // supersedes the existing one.
                let mut catalog = on_disk.clone();
                catalog.clear();
                catalog.changed();
                (catalog, 1)
            }
            (None, _) => {
                let mut catalog = SegmentCatalog::new();
                catalog.changed();
                (catalog, 1)
            }
        };

        let deleter = FileDeleter::new(
            Arc::clone(&storage),
            existing.as_ref(),
            &catalog,
            &settings.write_lock_name,
        )?;
        let reader_pool = ReaderPool::new(
            Arc::clone(&storage),
            codecs,
            settings.reader_pooling,
        );

        info!(
            "opened writer: create={create}, {} segments, generation {}",
            catalog.len(),
            catalog.generation()
        );

        let core = CoreState {
            rollback_segments: catalog.segments().to_vec(),
            committed_segments_file: existing.as_ref().and_then(|c| c.segments_file_name()),
            catalog,
            pending_commit: None,
            pending_commit_change_count: 0,
            files_to_commit: None,
            change_count,
            last_commit_change_count: 0,
            deleter,
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            merging_segments: BTreeSet::new(),
            merge_exceptions: Vec::new(),
            merge_gen: 0,
            stop_merges: false,
            segments_to_merge: BTreeMap::new(),
            merge_max_num_segments: UNBOUNDED_MAX_MERGE_SEGMENTS,
            closing: false,
            flush_count: 0,
            flush_deletes_count: 0,
            write_lock: Some(lock),
        };

        let pipeline = Arc::clone(&config.pipeline);
        Ok(IndexWriter {
            inner: Arc::new(WriterInner {
                storage,
                pipeline,
                state: StateCell::new(),
                commit_lock: Mutex::new(()),
                full_flush_lock: Mutex::new(()),
                core: Mutex::new(core),
                merge_cond: Condvar::new(),
                updates_stream: BufferedUpdatesStream::new(),
                reader_pool,
                config,
            }),
        })
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn state(&self) -> WriterState {
        self.inner.state.get()
    }

    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.inner.update_document(None, doc)
    }

    /// Atomically delete the documents containing `term` and add `doc`.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<()> {
        self.inner.update_document(Some(term), doc)
    }

    pub fn delete_documents(&self, terms: Vec<Term>) -> Result<()> {
        self.inner.state.ensure_open()?;
        self.inner.pipeline.delete_queue().add_delete(terms);
        self.inner.maybe_flush_deletes()
    }

    pub fn delete_by_query(&self, queries: Vec<Arc<dyn DeleteQuery>>) -> Result<()> {
        self.inner.state.ensure_open()?;
        self.inner.pipeline.delete_queue().add_delete_queries(queries);
        self.inner.maybe_flush_deletes()
    }

    /// Set numeric doc value `field` of every document containing `term`.
    pub fn update_numeric_doc_value<S: Into<String>>(
        &self,
        term: Term,
        field: S,
        value: i64,
    ) -> Result<()> {
        self.update_doc_value(DocValuesUpdate::new(term, field, DocValue::Numeric(value)))
    }

    /// Set binary doc value `field` of every document containing `term`.
    pub fn update_binary_doc_value<S: Into<String>>(
        &self,
        term: Term,
        field: S,
        value: Vec<u8>,
    ) -> Result<()> {
        self.update_doc_value(DocValuesUpdate::new(term, field, DocValue::Binary(value)))
    }

    fn update_doc_value(&self, update: DocValuesUpdate) -> Result<()> {
        self.inner.state.ensure_open()?;
        self.inner.pipeline.delete_queue().add_update(update);
        self.inner.maybe_flush_deletes()
    }

    /// Drop every document and segment. Takes effect on the next commit;
    /// a rollback restores the last commit.
    pub fn delete_all(&self) -> Result<()> {
        let result = self.inner.delete_all();
        self.inner.handle_oom(result, "delete_all")
    }

    /// Flush buffered documents into new segments.
    ///
    /// With `apply_all_deletes`, buffered deletes are resolved against every
    /// segment too; otherwise only once they exceed
    /// `max_buffered_delete_terms`.
    pub fn flush(&self, trigger_merge: bool, apply_all_deletes: bool) -> Result<()> {
        let result = self.inner.flush(trigger_merge, apply_all_deletes);
        self.inner.handle_oom(result, "flush")
    }

    /// First phase of a commit: flush, write and sync every file of the
    /// next commit except making it visible.
    pub fn prepare_commit(&self) -> Result<()> {
        let result = self.inner.state.ensure_open().and_then(|()| {
            let _commit = self.inner.commit_lock.lock();
            self.inner.prepare_commit_internal()
        });
        self.inner.handle_oom(result, "prepare_commit")
    }

    /// Make every change so far durable, running
    /// [`prepare_commit`](Self::prepare_commit) first unless it already ran.
    pub fn commit(&self) -> Result<()> {
        let result = self.inner.commit();
        self.inner.handle_oom(result, "commit")
    }

    /// Discard every change since the last commit and close the writer.
    pub fn rollback(&self) -> Result<()> {
        if self.inner.state.get() == WriterState::Closed {
            return Ok(());
        }
        self.inner.rollback_internal()
    }

    /// Commit (or roll back, per `commit_on_close`), wait for merges and
    /// release the write lock.
    ///
    /// A quarantined writer is rolled back instead. When the close itself
    /// fails the writer is rolled back and the error returned.
    pub fn close(&self) -> Result<()> {
        match self.inner.state.get() {
            WriterState::Closed => return Ok(()),
            WriterState::Quarantined => {
                info!("writer is quarantined; rolling back instead of closing");
                return self.inner.rollback_internal();
            }
            WriterState::Open => {}
        }
        if !self.inner.config.settings.commit_on_close {
            return self.inner.rollback_internal();
        }
        if self.inner.core.lock().pending_commit.is_some() {
            return Err(QuireError::invalid_operation(
                "cannot close: prepare_commit was already called with no corresponding call to commit",
            ));
        }

        let result = self.inner.close_internal();
        if let Err(e) = self.inner.handle_oom(result, "close") {
            warn!("hit error while closing, rolling back: {e}");
            if let Err(rollback_error) = self.inner.rollback_internal() {
                warn!("rollback after failed close also failed: {rollback_error}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Open a point-in-time view of everything added so far, flushing first.
    pub fn nrt_snapshot(&self, apply_all_deletes: bool) -> Result<CatalogSnapshot> {
        let result = self.inner.nrt_snapshot(apply_all_deletes);
        self.inner.handle_oom(result, "nrt_snapshot")
    }

    /// Whether `snapshot` still reflects every change made through this
    /// writer.
    pub fn is_current(&self, snapshot: &CatalogSnapshot) -> Result<bool> {
        self.inner.state.ensure_not_closed()?;
        let version = self.inner.core.lock().catalog.version();
        Ok(snapshot.version == version
            && !self.inner.pipeline.any_changes()
            && !self.inner.updates_stream.any())
    }

    /// Replace the user data stored with the next commit.
    pub fn set_commit_data(&self, user_data: BTreeMap<String, String>) -> Result<()> {
        self.inner.state.ensure_open()?;
        let mut core = self.inner.core.lock();
        core.catalog.set_user_data(user_data);
        core.change_count += 1;
        Ok(())
    }

    pub fn commit_data(&self) -> BTreeMap<String, String> {
        self.inner.core.lock().catalog.user_data().clone()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let changed = {
            let core = self.inner.core.lock();
            core.change_count != core.last_commit_change_count
        };
        changed || self.inner.pipeline.any_changes() || self.inner.updates_stream.any()
    }

    /// Documents in the catalog, deleted ones included; buffered ones are
    /// not counted.
    pub fn max_doc(&self) -> usize {
        self.inner.core.lock().catalog.total_doc_count()
    }

    /// Documents in the catalog minus the deletes applied so far.
    pub fn num_docs(&self) -> usize {
        let core = self.inner.core.lock();
        core.catalog
            .segments()
            .iter()
            .map(|record| {
                record.doc_count() - self.inner.reader_pool.num_deleted_docs(record).min(record.doc_count())
            })
            .sum()
    }

    pub fn num_buffered_docs(&self) -> usize {
        self.inner.pipeline.num_buffered_docs()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.core.lock().catalog.len()
    }

    /// Records of the current segments.
    pub fn segments(&self) -> Vec<SegmentCommitInfo> {
        self.inner.core.lock().catalog.segments().to_vec()
    }

    /// Version of the in-memory catalog; bumps on every change.
    pub fn catalog_version(&self) -> i64 {
        self.inner.core.lock().catalog.version()
    }

    /// Commit file of the last successful commit.
    pub fn committed_segments_file(&self) -> Option<String> {
        self.inner.core.lock().committed_segments_file.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.core.lock().flush_count
    }

    /// Merge down to at most `max_num_segments` segments.
    ///
    /// With `do_wait` the call returns once the merges it started are done,
    /// failing if one of them failed.
    pub fn force_merge(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        let result = self.inner.force_merge(max_num_segments, do_wait);
        self.inner.handle_oom(result, "force_merge")
    }

    /// Merge away segments with many deleted documents.
    pub fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        let result = self.inner.force_merge_deletes(do_wait);
        self.inner.handle_oom(result, "force_merge_deletes")
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.state.ensure_open()?;
        let result = self
            .inner
            .maybe_merge(MergeTrigger::Explicit, UNBOUNDED_MAX_MERGE_SEGMENTS);
        self.inner.handle_oom(result, "maybe_merge")
    }

    /// Block until every pending and running merge is done.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.wait_for_merges()
    }

    /// Ask the merge policy for merges and register them without scheduling.
    pub fn find_and_register_merges(&self, trigger: MergeTrigger) -> Result<bool> {
        self.inner.state.ensure_open()?;
        let mut core = self.inner.core.lock();
        self.inner
            .update_pending_merges(&mut core, trigger, UNBOUNDED_MAX_MERGE_SEGMENTS)
    }

    /// Register `merge` as pending.
    ///
    /// Returns false, changing nothing, when one of its segments is already
    /// merging or no longer in the catalog.
    pub fn register_merge(&self, merge: &Arc<OneMerge>) -> Result<bool> {
        self.inner.state.ensure_open()?;
        let mut core = self.inner.core.lock();
        self.inner.register_merge(&mut core, merge)
    }

    /// Take the oldest pending merge and mark it running.
    pub fn next_merge(&self) -> Option<Arc<OneMerge>> {
        self.inner.next_pending_merge()
    }

    /// Run a merge taken with [`next_merge`](Self::next_merge) on this
    /// thread.
    pub fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.inner.merge(merge)
    }

    /// Abort `merge`. A pending one is dropped at once; a running one stops
    /// at its next abort check.
    pub fn abort_merge(&self, merge: &Arc<OneMerge>) {
        self.inner.abort_merge(merge)
    }

    pub fn pending_merge_count(&self) -> usize {
        self.inner.core.lock().pending_merges.len()
    }

    pub fn running_merge_count(&self) -> usize {
        self.inner.core.lock().running_merges.len()
    }

    /// Segments taking part in a registered merge.
    pub fn merging_segments(&self) -> BTreeSet<String> {
        self.inner.core.lock().merging_segments.clone()
    }
}

impl WriterInner {
    /// Quarantine the writer when `result` is an out-of-memory error.
    fn handle_oom<T>(&self, result: Result<T>, location: &str) -> Result<T> {
        if let Err(e) = &result {
            if e.is_oom() {
                warn!("hit out-of-memory in {location}; writer can only be closed or rolled back");
                self.state.quarantine();
            }
        }
        result
    }

    fn do_wait(&self, core: &mut MutexGuard<'_, CoreState>) {
        self.merge_cond.wait_for(core, Duration::from_secs(1));
    }

    fn update_document(self: &Arc<Self>, term: Option<Term>, doc: Document) -> Result<()> {
        self.state.ensure_open()?;
        let result = self.pipeline.add_document(doc, term);
        self.handle_oom(result, "update_document")?;

        let max_buffered_docs = self.config.settings.max_buffered_docs;
        if max_buffered_docs > 0 && self.pipeline.num_buffered_docs() >= max_buffered_docs {
            debug!("flush at {} buffered docs", self.pipeline.num_buffered_docs());
            let result = self.flush(true, false);
            self.handle_oom(result, "update_document")?;
        }
        Ok(())
    }

    /// Resolve buffered deletes once they exceed `max_buffered_delete_terms`.
    fn maybe_flush_deletes(&self) -> Result<()> {
        let max_terms = self.config.settings.max_buffered_delete_terms;
        if max_terms == 0 || self.pipeline.delete_queue().num_global_term_deletes() < max_terms {
            return Ok(());
        }
        let result = {
            let _full_flush = self.full_flush_lock.lock();
            let packet = self.pipeline.delete_queue().freeze_global_buffer(None);
            let mut core = self.core.lock();
            if packet.any() {
                self.updates_stream.push(packet);
            }
            debug!("apply deletes: {max_terms} buffered delete terms reached");
            self.apply_all_deletes_and_updates(&mut core)
        };
        self.handle_oom(result, "delete_documents")
    }

    fn new_segment_name(&self) -> String {
        self.core.lock().new_segment_name()
    }

    /// Flush every pipeline batch, publishing each ticket in order.
    ///
    /// Caller holds the full-flush lock.
    fn flush_all_batches(&self) -> Result<usize> {
        let new_segment_name = || self.new_segment_name();
        let ctx = FlushContext {
            storage: self.storage.as_ref(),
            codec: self.config.codec.as_ref(),
            use_compound_file: self.config.settings.use_compound_file,
            new_segment_name: &new_segment_name,
        };
        let mut publish = |ticket: FlushTicket| self.publish_flush_ticket(ticket);
        let flushed = self.pipeline.flush_all(&ctx, &mut publish)?;
        if flushed > 0 {
            debug!("flushed {flushed} segments");
        }
        Ok(flushed)
    }

    fn publish_flush_ticket(&self, ticket: FlushTicket) -> Result<()> {
        let mut core = self.core.lock();
        if let Some(global) = ticket.global_updates {
            if global.any() {
                self.updates_stream.push(global);
            }
        }

        let Some(FlushedSegment {
            mut record,
            segment_updates,
        }) = ticket.segment
        else {
            return Ok(());
        };

        // The segment sees every packet pushed before it, none after.
        let next_gen = match segment_updates {
            Some(packet) if packet.any() => self.updates_stream.push(packet),
            _ => self.updates_stream.next_gen(),
        };
        record.set_buffered_deletes_gen(next_gen);

        if record.del_count() >= record.doc_count()
            && !self.config.settings.keep_fully_deleted_segments
        {
            debug!("dropping flushed segment {}: every document is deleted", record.name());
            core.deleter.delete_new_files(&record.files());
            return Ok(());
        }

        debug!("publish flushed segment {} ({} docs)", record.name(), record.doc_count());
        core.catalog.add(record);
        core.checkpoint()
    }

    fn flush(self: &Arc<Self>, trigger_merge: bool, apply_all_deletes: bool) -> Result<()> {
        self.state.ensure_open()?;
        let any_flushed = self.do_flush(apply_all_deletes)?;
        if any_flushed && trigger_merge {
            self.maybe_merge(MergeTrigger::FullFlush, UNBOUNDED_MAX_MERGE_SEGMENTS)?;
        }
        Ok(())
    }

    fn do_flush(&self, apply_all_deletes: bool) -> Result<bool> {
        let _full_flush = self.full_flush_lock.lock();
        let flushed = self.flush_all_batches()?;
        let mut core = self.core.lock();
        core.flush_count += 1;
        self.maybe_apply_deletes(&mut core, apply_all_deletes)?;
        Ok(flushed > 0)
    }

    fn maybe_apply_deletes(&self, core: &mut CoreState, apply_all_deletes: bool) -> Result<()> {
        let max_terms = self.config.settings.max_buffered_delete_terms;
        if apply_all_deletes || (max_terms > 0 && self.updates_stream.num_terms() >= max_terms) {
            return self.apply_all_deletes_and_updates(core);
        }
        Ok(())
    }

    /// Resolve every pushed packet against every segment.
    fn apply_all_deletes_and_updates(&self, core: &mut CoreState) -> Result<()> {
        core.flush_deletes_count += 1;
        let names: Vec<String> = core
            .catalog
            .segments()
            .iter()
            .map(|record| record.name().to_string())
            .collect();
        let result =
            self.updates_stream
                .apply_deletes_and_updates(&self.reader_pool, &mut core.catalog, &names)?;
        if result.any_deletes || result.files_changed {
            core.checkpoint()?;
        }

        if !self.config.settings.keep_fully_deleted_segments && !result.all_deleted.is_empty() {
            let mut dropped = 0;
            for name in &result.all_deleted {
                // A merging segment goes away when its merge commits.
                if core.merging_segments.contains(name) {
                    continue;
                }
                debug!("drop segment {name}: every document is deleted");
                core.catalog.remove(name);
                self.reader_pool.drop_segment(name);
                dropped += 1;
            }
            if dropped > 0 {
                core.checkpoint()?;
            }
        }

        self.updates_stream.prune(&core.catalog);
        Ok(())
    }

    fn commit(self: &Arc<Self>) -> Result<()> {
        self.state.ensure_open()?;
        info!("commit: start");
        let _commit = self.commit_lock.lock();
        let prepared = self.core.lock().pending_commit.is_some();
        if prepared {
            info!("commit: already prepared");
        } else {
            self.prepare_commit_internal()?;
        }
        self.finish_commit()
    }

    /// Caller holds the commit lock.
    fn prepare_commit_internal(self: &Arc<Self>) -> Result<()> {
        if self.core.lock().pending_commit.is_some() {
            return Err(QuireError::invalid_operation(
                "prepare_commit was already called with no corresponding call to commit",
            ));
        }
        info!("prepare commit: flush");

        let (any_flushed, to_commit) = {
            let _full_flush = self.full_flush_lock.lock();
            let flushed = self.flush_all_batches()?;
            let mut core = self.core.lock();
            core.flush_count += 1;
            self.maybe_apply_deletes(&mut core, true)?;
            if self.reader_pool.commit(&mut core.catalog)? {
                core.checkpoint_files()?;
            }

            let to_commit = core.catalog.clone();
            core.pending_commit_change_count = core.change_count;
            let files = to_commit.files(false);
            core.deleter.inc_ref_files(&files);
            core.files_to_commit = Some(files);
            (flushed > 0, to_commit)
        };

        let result = if any_flushed {
            self.maybe_merge(MergeTrigger::FullFlush, UNBOUNDED_MAX_MERGE_SEGMENTS)
        } else {
            Ok(())
        }
        .and_then(|()| self.start_commit(to_commit));

        if result.is_err() {
            self.core.lock().release_files_to_commit();
        }
        result
    }

    /// Write and sync the pending commit file and every segment file it
    /// references.
    fn start_commit(&self, mut to_sync: SegmentCatalog) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.pending_commit_change_count == core.last_commit_change_count {
                debug!("skip commit: no changes pending");
                core.release_files_to_commit();
                return Ok(());
            }
        }
        debug!("start commit: {to_sync}");

        if let Err(e) = to_sync.prepare_commit(self.storage.as_ref()) {
            self.core.lock().catalog.skip_generation_of(&to_sync);
            return Err(e);
        }

        let files: Vec<String> = to_sync.files(false).into_iter().collect();
        if let Err(e) = self.storage.sync(&files) {
            to_sync.rollback_commit(self.storage.as_ref());
            self.core.lock().catalog.skip_generation_of(&to_sync);
            return Err(e);
        }

        self.core.lock().pending_commit = Some(to_sync);
        Ok(())
    }

    fn finish_commit(&self) -> Result<()> {
        let mut core = self.core.lock();
        let Some(mut pending) = core.pending_commit.take() else {
            debug!("commit: nothing pending");
            return Ok(());
        };

        let result = match pending.finish_commit(self.storage.as_ref()) {
            Ok(segments_file) => {
                info!("commit: wrote {segments_file}");
                let checkpointed = core.deleter.checkpoint(&pending, true);
                core.last_commit_change_count = core.pending_commit_change_count;
                core.catalog.update_generation(&pending);
                core.rollback_segments = pending.segments().to_vec();
                core.committed_segments_file = Some(segments_file);
                checkpointed
            }
            Err(e) => {
                warn!("commit: finishing failed: {e}");
                core.catalog.skip_generation_of(&pending);
                Err(e)
            }
        };

        core.release_files_to_commit();
        self.merge_cond.notify_all();
        result
    }

    fn rollback_internal(&self) -> Result<()> {
        info!("rollback");
        let _commit = self.commit_lock.lock();
        {
            let mut core = self.core.lock();
            self.abort_merges(&mut core);
            core.stop_merges = true;
        }

        let mut first_error = self.config.merge_scheduler.close().err();
        self.updates_stream.clear();
        self.pipeline.abort();
        self.pipeline.delete_queue().clear();

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if let Some(mut pending) = core.pending_commit.take() {
            pending.rollback_commit(self.storage.as_ref());
            core.catalog.skip_generation_of(&pending);
            core.release_files_to_commit();
            self.merge_cond.notify_all();
        }

        if let Err(e) = self.reader_pool.drop_all(false, &mut core.catalog) {
            first_error.get_or_insert(e);
        }
        core.catalog.rollback_segments(core.rollback_segments.clone());
        debug!("rollback: restored {} segments", core.catalog.len());

        // Let the deleter drop whatever the discarded changes wrote.
        if let Err(e) = core.deleter.checkpoint(&core.catalog, false) {
            first_error.get_or_insert(e);
        }
        if let Err(e) = core.deleter.refresh(None) {
            first_error.get_or_insert(e);
        }
        core.last_commit_change_count = core.change_count;
        core.deleter.close();

        if let Err(e) = core.release_write_lock() {
            first_error.get_or_insert(e);
        }
        self.state.close();
        info!("rollback: done");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close_internal(self: &Arc<Self>) -> Result<()> {
        info!("close: flush");
        self.flush(true, true)?;
        self.wait_for_merges()?;
        {
            let mut core = self.core.lock();
            core.closing = true;
            core.stop_merges = true;
        }
        self.config.merge_scheduler.close()?;

        info!("close: commit");
        self.commit()?;

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if self.reader_pool.drop_all(true, &mut core.catalog)? {
            core.checkpoint_files()?;
        }
        core.deleter.close();
        core.release_write_lock()?;
        self.state.close();
        self.merge_cond.notify_all();
        info!("closed");
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        self.state.ensure_open()?;
        let _full_flush = self.full_flush_lock.lock();
        self.pipeline.abort();
        self.pipeline.delete_queue().clear();
        self.updates_stream.clear();

        let mut guard = self.core.lock();
        self.abort_merges(&mut guard);
        let core = &mut *guard;
        core.catalog.clear();
        core.deleter.checkpoint(&core.catalog, false)?;
        self.reader_pool.drop_all(false, &mut core.catalog)?;
        core.segments_to_merge.clear();
        core.change_count += 1;
        core.catalog.changed();
        info!("delete_all: dropped every segment");
        Ok(())
    }

    fn nrt_snapshot(self: &Arc<Self>, apply_all_deletes: bool) -> Result<CatalogSnapshot> {
        self.state.ensure_open()?;
        self.reader_pool.enable_pooling();

        let (any_flushed, snapshot) = {
            let _full_flush = self.full_flush_lock.lock();
            let flushed = self.flush_all_batches()?;
            let mut core = self.core.lock();
            core.flush_count += 1;
            self.maybe_apply_deletes(&mut core, apply_all_deletes)?;

            let catalog = core.catalog.clone();
            let mut live_docs = HashMap::new();
            for record in catalog.segments() {
                if self.reader_pool.num_deleted_docs(record) > 0 {
                    live_docs.insert(
                        record.name().to_string(),
                        self.reader_pool.live_docs_snapshot(record)?,
                    );
                }
            }
            // Merges and commits may drop these segments before the caller
            // is done reading them.
            let files = catalog.files(false);
            core.deleter.inc_ref_files(&files);
            let owner: Weak<WriterInner> = Arc::downgrade(self);
            let owner: Weak<dyn SnapshotOwner> = owner;
            let snapshot = CatalogSnapshot::new(catalog, live_docs).pinned(files, owner);
            (flushed > 0, snapshot)
        };
        debug!("nrt snapshot at version {}", snapshot.version);

        if any_flushed {
            self.maybe_merge(MergeTrigger::FullFlush, UNBOUNDED_MAX_MERGE_SEGMENTS)?;
        }
        Ok(snapshot)
    }
}

impl SnapshotOwner for WriterInner {
    fn release_snapshot_files(&self, files: &BTreeSet<String>) {
        let mut core = self.core.lock();
        // A closed writer no longer owns the directory; the next writer
        // removes whatever is left unreferenced.
        if self.state.get() == WriterState::Closed {
            debug!("snapshot released after close; leaving {} files", files.len());
            return;
        }
        core.deleter.dec_ref_files(files);
    }
}
