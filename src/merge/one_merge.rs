//! A single registered or candidate merge.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{QuireError, Result};
use crate::index::codec::SegmentReader;
use crate::index::segment::SegmentCommitInfo;
use crate::util::bits::LiveDocs;

static NEXT_MERGE_ID: AtomicU64 = AtomicU64::new(1);

/// What a merge read from one source segment when it started.
#[derive(Debug, Clone)]
pub struct MergeReader {
    pub segment: String,
    pub reader: Arc<dyn SegmentReader>,
    /// Live docs at the moment the merge pulled the reader.
    pub live_docs: LiveDocs,
    /// Deleted documents at that moment, pending ones included.
    pub del_count: usize,
}

/// Mutable part of a merge, only touched by the writer.
#[derive(Debug)]
pub struct OneMergeState {
    /// Source records as the policy saw them. Segments that turn out to be
    /// fully deleted when the merge starts are removed from here.
    pub segments: Vec<SegmentCommitInfo>,
    /// Record of the merged segment, bound when the merge starts.
    pub info: Option<SegmentCommitInfo>,
    pub register_done: bool,
    pub merge_gen: i64,
    /// Target segment count of the forced merge this belongs to, or -1.
    pub max_num_segments: i64,
    pub estimated_merge_bytes: u64,
    pub total_merge_bytes: u64,
    pub exception: Option<QuireError>,
    pub readers: Vec<MergeReader>,
}

/// One merge of several segments into a new one.
///
/// Shared between the writer, the scheduler thread running it and anyone
/// waiting on it; the abort flag can be raised from any of them.
pub struct OneMerge {
    id: u64,
    aborted: AtomicBool,
    state: Mutex<OneMergeState>,
}

impl fmt::Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMerge")
            .field("id", &self.id)
            .field("segments", &self.segment_names())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl OneMerge {
    /// A candidate merge of `segments`, in the order given.
    pub fn new(segments: Vec<SegmentCommitInfo>) -> Arc<Self> {
        Arc::new(OneMerge {
            id: NEXT_MERGE_ID.fetch_add(1, Ordering::Relaxed),
            aborted: AtomicBool::new(false),
            state: Mutex::new(OneMergeState {
                segments,
                info: None,
                register_done: false,
                merge_gen: 0,
                max_num_segments: -1,
                estimated_merge_bytes: 0,
                total_merge_bytes: 0,
                exception: None,
                readers: Vec::new(),
            }),
        })
    }

    /// Process-wide unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, OneMergeState> {
        self.state.lock()
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.state
            .lock()
            .segments
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn segments(&self) -> Vec<SegmentCommitInfo> {
        self.state.lock().segments.clone()
    }

    /// Documents in the source segments, deleted ones included.
    pub fn total_doc_count(&self) -> usize {
        self.state.lock().segments.iter().map(|s| s.doc_count()).sum()
    }

    /// Name of the merged segment, once the merge has started.
    pub fn merged_name(&self) -> Option<String> {
        self.state
            .lock()
            .info
            .as_ref()
            .map(|info| info.name().to_string())
    }

    pub fn info(&self) -> Option<SegmentCommitInfo> {
        self.state.lock().info.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().register_done
    }

    pub fn max_num_segments(&self) -> i64 {
        self.state.lock().max_num_segments
    }

    /// Bytes the merged segment is expected to take, deletes discounted.
    pub fn estimated_merge_bytes(&self) -> u64 {
        self.state.lock().estimated_merge_bytes
    }

    pub fn total_merge_bytes(&self) -> u64 {
        self.state.lock().total_merge_bytes
    }

    /// Ask the merge to stop at its next abort check.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fails with [`QuireError::MergeAborted`] once the merge was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(QuireError::merge_aborted(format!("merge is aborted: {self}")));
        }
        Ok(())
    }

    /// The error the merge failed with, if any.
    pub fn exception(&self) -> Option<QuireError> {
        self.state.lock().exception.as_ref().map(QuireError::duplicate)
    }

    pub(crate) fn set_exception(&self, error: &QuireError) {
        self.state.lock().exception = Some(error.duplicate());
    }
}

impl fmt::Display for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let names: Vec<String> = state.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(" "))?;
        if let Some(info) = &state.info {
            write!(f, " into {}", info.name())?;
        }
        if state.max_num_segments != -1 {
            write!(f, " [maxNumSegments={}]", state.max_num_segments)?;
        }
        if self.is_aborted() {
            write!(f, " [ABORTED]")?;
        }
        Ok(())
    }
}

/// Turns units of merge work into periodic abort checks.
pub struct CheckAbort<'a> {
    merge: &'a OneMerge,
    interval: u64,
    work: u64,
}

impl<'a> CheckAbort<'a> {
    /// Check `merge` every `interval` units of work.
    pub fn new(merge: &'a OneMerge, interval: u64) -> Self {
        CheckAbort {
            merge,
            interval: interval.max(1),
            work: 0,
        }
    }

    pub fn work(&mut self, units: u64) -> Result<()> {
        self.work += units;
        if self.work >= self.interval {
            self.work = 0;
            self.merge.check_aborted()?;
        }
        Ok(())
    }
}
