//! The merge policy seam.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::index::catalog::SegmentCatalog;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment::SegmentCommitInfo;
use crate::merge::one_merge::OneMerge;
use crate::storage::Storage;

/// Why the writer is asking for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeTrigger {
    /// A single segment was flushed.
    SegmentFlush,
    /// Every buffered document was flushed, as on commit or refresh.
    FullFlush,
    /// The application asked, e.g. through `force_merge`.
    Explicit,
    /// A merge just committed.
    MergeFinished,
    /// The writer is closing.
    Closing,
}

/// Merges a policy wants run, in priority order.
#[derive(Debug, Clone, Default)]
pub struct MergeSpecification {
    pub merges: Vec<Arc<OneMerge>>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: Arc<OneMerge>) {
        self.merges.push(merge);
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

impl fmt::Display for MergeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MergeSpec:")?;
        for (i, merge) in self.merges.iter().enumerate() {
            writeln!(f, "  {}: {merge}", i + 1)?;
        }
        Ok(())
    }
}

/// What a policy may ask the writer while choosing merges.
pub struct MergeContext<'a> {
    storage: &'a dyn Storage,
    pool: &'a ReaderPool,
    merging: &'a BTreeSet<String>,
}

impl<'a> MergeContext<'a> {
    pub fn new(storage: &'a dyn Storage, pool: &'a ReaderPool, merging: &'a BTreeSet<String>) -> Self {
        MergeContext {
            storage,
            pool,
            merging,
        }
    }

    /// Deleted documents of `record`, deletes not yet written included.
    pub fn num_deleted_docs(&self, record: &SegmentCommitInfo) -> usize {
        self.pool.num_deleted_docs(record)
    }

    /// Whether `segment` is reserved by a registered merge.
    pub fn is_merging(&self, segment: &str) -> bool {
        self.merging.contains(segment)
    }

    pub fn merging_segments(&self) -> &BTreeSet<String> {
        self.merging
    }

    /// Bytes of every file of `record`.
    pub fn size_in_bytes(&self, record: &SegmentCommitInfo) -> Result<u64> {
        record.size_in_bytes(self.storage)
    }

    /// Bytes of `record`, discounted by its fraction of deleted documents.
    pub fn size(&self, record: &SegmentCommitInfo) -> Result<u64> {
        let bytes = self.size_in_bytes(record)?;
        let doc_count = record.doc_count();
        if doc_count == 0 {
            return Ok(bytes);
        }
        let del_ratio = self.num_deleted_docs(record) as f64 / doc_count as f64;
        Ok((bytes as f64 * (1.0 - del_ratio.min(1.0))) as u64)
    }
}

/// Decides which segments get merged.
///
/// Implementations only propose; the writer registers each proposed merge
/// and rejects those touching segments that are already merging or gone.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Merges wanted during normal indexing.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges needed to bring the index down to `max_segment_count`
    /// segments. Only segments in `segments_to_merge` may take part; the
    /// value is true for segments that existed when the forced merge began.
    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges that reclaim deleted documents.
    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>>;

    /// Whether the segment `merged`, about to join `catalog`, should be
    /// bundled into a compound file.
    fn use_compound_file(
        &self,
        catalog: &SegmentCatalog,
        merged: &SegmentCommitInfo,
        ctx: &MergeContext<'_>,
    ) -> Result<bool>;
}

/// Never merges.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy {
    use_compound_file: bool,
}

impl NoMergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compound_file(use_compound_file: bool) -> Self {
        NoMergePolicy { use_compound_file }
    }
}

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _catalog: &SegmentCatalog,
        _ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_merges(
        &self,
        _catalog: &SegmentCatalog,
        _max_segment_count: usize,
        _segments_to_merge: &BTreeMap<String, bool>,
        _ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_deletes_merges(
        &self,
        _catalog: &SegmentCatalog,
        _ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn use_compound_file(
        &self,
        _catalog: &SegmentCatalog,
        _merged: &SegmentCommitInfo,
        _ctx: &MergeContext<'_>,
    ) -> Result<bool> {
        Ok(self.use_compound_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::{CodecRegistry, SimpleCodec};
    use crate::index::segment::SegmentInfo;
    use crate::storage::{MemoryStorage, StorageOutput};
    use std::io::Write;

    #[test]
    fn test_size_discounts_deletes() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut out = storage.create_output("_0.sdoc").unwrap();
        out.write_all(&[0u8; 100]).unwrap();
        out.close().unwrap();
        let files: BTreeSet<String> = ["_0.sdoc".to_string()].into();
        let mut record =
            SegmentCommitInfo::fresh(SegmentInfo::new("_0", 4, SimpleCodec::NAME).with_files(files));
        record.set_del_count(1).unwrap();

        let pool = ReaderPool::new(storage.clone(), CodecRegistry::default(), false);
        let merging = BTreeSet::new();
        let ctx = MergeContext::new(storage.as_ref(), &pool, &merging);

        assert_eq!(ctx.size_in_bytes(&record).unwrap(), 100);
        assert_eq!(ctx.size(&record).unwrap(), 75);
        assert!(!ctx.is_merging("_0"));
    }

    #[test]
    fn test_no_merge_policy() {
        let storage = Arc::new(MemoryStorage::new_default());
        let pool = ReaderPool::new(storage.clone(), CodecRegistry::default(), false);
        let merging = BTreeSet::new();
        let ctx = MergeContext::new(storage.as_ref(), &pool, &merging);
        let catalog = SegmentCatalog::new();

        let policy = NoMergePolicy::new();
        assert!(policy
            .find_merges(MergeTrigger::Explicit, &catalog, &ctx)
            .unwrap()
            .is_none());
        assert!(policy
            .find_forced_merges(&catalog, 1, &BTreeMap::new(), &ctx)
            .unwrap()
            .is_none());
        assert!(policy
            .find_forced_deletes_merges(&catalog, &ctx)
            .unwrap()
            .is_none());
    }
}
