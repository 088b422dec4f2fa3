//! Per-segment live-docs and reader state.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::index::codec::{Codec, FieldUpdates, SegmentReader};
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Storage;
use crate::util::bits::LiveDocs;

/// Mutable state of one segment while the writer has it open.
///
/// The segment's committed metadata stays in the catalog; every method that
/// needs it takes the [`SegmentCommitInfo`] explicitly. Deletes recorded
/// here are pending until [`ReadersAndUpdates::write_live_docs`].
pub struct ReadersAndUpdates {
    ref_count: usize,
    reader: Option<Arc<dyn SegmentReader>>,
    live_docs: Option<LiveDocs>,
    /// Live docs as last read from or written to storage.
    written_live_docs: Option<LiveDocs>,
    pending_delete_count: usize,
    is_merging: bool,
    merging_updates: FieldUpdates,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
}

impl fmt::Debug for ReadersAndUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadersAndUpdates")
            .field("ref_count", &self.ref_count)
            .field("has_reader", &self.reader.is_some())
            .field("pending_delete_count", &self.pending_delete_count)
            .field("is_merging", &self.is_merging)
            .field("merging_updates", &self.merging_updates.len())
            .finish()
    }
}

impl ReadersAndUpdates {
    /// Fresh state holding one reference, the pool's own.
    pub fn new(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Self {
        ReadersAndUpdates {
            ref_count: 1,
            reader: None,
            live_docs: None,
            written_live_docs: None,
            pending_delete_count: 0,
            is_merging: false,
            merging_updates: FieldUpdates::new(),
            storage,
            codec,
        }
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self) {
        debug_assert!(self.ref_count > 0, "ref count underflow");
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Deletes not yet written to a live-docs file.
    pub fn pending_delete_count(&self) -> usize {
        self.pending_delete_count
    }

    /// Check that the live docs agree with the committed and pending counts.
    pub fn verify_doc_counts(&self, record: &SegmentCommitInfo) -> bool {
        let live = match &self.live_docs {
            Some(live_docs) => live_docs.num_live(),
            None => record.doc_count(),
        };
        record.doc_count() == record.del_count() + self.pending_delete_count + live
    }

    fn ensure_live_docs(&mut self, record: &SegmentCommitInfo) -> Result<&mut LiveDocs> {
        if self.live_docs.is_none() {
            let live_docs = self.codec.read_live_docs(self.storage.as_ref(), record)?;
            self.written_live_docs = Some(live_docs.clone());
            self.live_docs = Some(live_docs);
        }
        Ok(self.live_docs.get_or_insert_with(|| LiveDocs::new(record.doc_count())))
    }

    /// Reader over the segment, opened on first use.
    pub fn get_reader(&mut self, record: &SegmentCommitInfo) -> Result<Arc<dyn SegmentReader>> {
        if let Some(reader) = &self.reader {
            return Ok(Arc::clone(reader));
        }
        let reader = self.codec.open_reader(self.storage.as_ref(), record)?;
        self.ensure_live_docs(record)?;
        self.reader = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Current live docs, if loaded.
    pub fn live_docs(&self) -> Option<&LiveDocs> {
        self.live_docs.as_ref()
    }

    /// Load the live docs before deleting. Snapshot holders keep the old
    /// bits; the next delete copies them.
    pub fn init_writable_live_docs(&mut self, record: &SegmentCommitInfo) -> Result<()> {
        self.ensure_live_docs(record)?;
        Ok(())
    }

    /// Delete `doc`; returns whether it was live.
    pub fn delete(&mut self, record: &SegmentCommitInfo, doc: usize) -> Result<bool> {
        debug_assert!(doc < record.doc_count(), "doc {doc} out of bounds");
        let live_docs = self.ensure_live_docs(record)?;
        let deleted = live_docs.delete(doc);
        if deleted {
            self.pending_delete_count += 1;
        }
        Ok(deleted)
    }

    /// Snapshot of the live docs that later deletes will not change.
    pub fn read_only_live_docs(&mut self, record: &SegmentCommitInfo) -> Result<LiveDocs> {
        Ok(self.ensure_live_docs(record)?.clone())
    }

    /// Forget pending deletes and merge-time updates without writing them.
    ///
    /// The live docs go back to what storage holds.
    pub fn drop_changes(&mut self) {
        if self.pending_delete_count > 0 {
            self.live_docs = self.written_live_docs.clone();
        }
        self.pending_delete_count = 0;
        self.drop_merging_updates();
    }

    /// Close the reader. Live docs stay loaded.
    pub fn drop_readers(&mut self) {
        self.reader = None;
    }

    /// Write pending deletes as a new live-docs generation.
    ///
    /// Returns false when there was nothing to write. On failure the
    /// generation is skipped so a retry never reuses a half-written name.
    pub fn write_live_docs(&mut self, record: &mut SegmentCommitInfo) -> Result<bool> {
        if self.pending_delete_count == 0 {
            return Ok(false);
        }
        let Some(live_docs) = &self.live_docs else {
            return Ok(false);
        };

        let generation = record.next_write_del_gen();
        match self
            .codec
            .write_live_docs(self.storage.as_ref(), record, live_docs, generation)
        {
            Ok(name) => {
                record.advance_del_gen();
                record.set_del_count(record.del_count() + self.pending_delete_count)?;
                self.written_live_docs = Some(live_docs.clone());
                debug!(
                    "wrote {name} with {} new deletes for {}",
                    self.pending_delete_count,
                    record.name()
                );
                self.pending_delete_count = 0;
                Ok(true)
            }
            Err(e) => {
                record.advance_next_write_del_gen();
                if let Some(name) = record.live_docs_file_name() {
                    debug!("live docs write failed for {name}: {e}");
                }
                Err(e)
            }
        }
    }

    /// Write doc-values updates as a new generation and reopen the reader.
    ///
    /// While a merge reads this segment the updates are also remembered so
    /// they can be carried over to the merged segment.
    pub fn write_field_updates(
        &mut self,
        record: &mut SegmentCommitInfo,
        updates: &FieldUpdates,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let generation = record.next_write_field_infos_gen();
        match self
            .codec
            .write_field_updates(self.storage.as_ref(), record, generation, updates)
        {
            Ok(files) => {
                record.advance_field_infos_gen();
                record.set_updates_files(generation, files);
                if self.is_merging {
                    self.merging_updates.merge_from(updates);
                }
                self.reader = None;
                Ok(())
            }
            Err(e) => {
                record.advance_next_write_field_infos_gen();
                Err(e)
            }
        }
    }

    /// Reader plus live-docs snapshot for a merge; marks the segment merging.
    pub fn reader_for_merge(
        &mut self,
        record: &SegmentCommitInfo,
    ) -> Result<(Arc<dyn SegmentReader>, LiveDocs)> {
        self.is_merging = true;
        let reader = self.get_reader(record)?;
        let live_docs = self.read_only_live_docs(record)?;
        Ok((reader, live_docs))
    }

    pub fn is_merging(&self) -> bool {
        self.is_merging
    }

    /// Updates written while a merge was reading this segment.
    pub fn merging_updates(&self) -> &FieldUpdates {
        &self.merging_updates
    }

    pub fn drop_merging_updates(&mut self) {
        self.merging_updates.clear();
        self.is_merging = false;
    }
}
