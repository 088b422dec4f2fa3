#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use quire::error::{QuireError, Result};
use quire::index::codec::{Codec, FieldUpdates, MergeSource, MergedSegment, SimpleCodec};
use quire::index::pipeline::Document;
use quire::index::{CatalogSnapshot, SegmentCommitInfo, SegmentInfo, SegmentReader, Term};
use quire::merge::{NoMergePolicy, SerialMergeScheduler};
use quire::storage::Storage;
use quire::util::bits::LiveDocs;
use quire::writer::IndexWriterConfig;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Writer config that never merges on its own and runs merges inline.
pub fn manual_config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_compound_file(false)
}

pub fn doc(id: usize) -> Document {
    Document::new()
        .with_term("id", id.to_string())
        .with_numeric("rank", id as i64)
}

pub fn id(id: usize) -> Term {
    Term::new("id", id.to_string())
}

pub fn open_reader(storage: &dyn Storage, record: &SegmentCommitInfo) -> Arc<dyn SegmentReader> {
    SimpleCodec::new().open_reader(storage, record).unwrap()
}

/// Live documents of `snapshot` containing `term`.
pub fn count_live(storage: &dyn Storage, snapshot: &CatalogSnapshot, term: &Term) -> usize {
    snapshot
        .catalog
        .segments()
        .iter()
        .map(|record| {
            open_reader(storage, record)
                .docs_for_term(term)
                .into_iter()
                .filter(|&doc| snapshot.is_live(record.name(), doc))
                .count()
        })
        .sum()
}

/// Live numeric values of `field` for documents containing `term`.
pub fn live_numeric_values(
    storage: &dyn Storage,
    snapshot: &CatalogSnapshot,
    term: &Term,
    field: &str,
) -> Vec<i64> {
    let mut values = Vec::new();
    for record in snapshot.catalog.segments() {
        let reader = open_reader(storage, record);
        for doc in reader.docs_for_term(term) {
            if snapshot.is_live(record.name(), doc) {
                if let Some(value) = reader.numeric_value(field, doc) {
                    values.push(value);
                }
            }
        }
    }
    values
}

/// Delegates to [`SimpleCodec`]; `merge` announces itself and then blocks
/// until released.
#[derive(Debug)]
pub struct DelayingCodec {
    inner: SimpleCodec,
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Test side of a [`DelayingCodec`].
pub struct MergeGate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

impl DelayingCodec {
    pub fn new() -> (Arc<Self>, MergeGate) {
        let (entered_tx, entered_rx) = bounded(16);
        let (release_tx, release_rx) = bounded(16);
        let codec = DelayingCodec {
            inner: SimpleCodec::new(),
            entered: entered_tx,
            release: release_rx,
        };
        (
            Arc::new(codec),
            MergeGate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl Codec for DelayingCodec {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write_documents(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>> {
        self.inner.write_documents(storage, segment, docs)
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()> {
        self.inner.write_segment_info(storage, info)
    }

    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo> {
        self.inner.read_segment_info(storage, segment)
    }

    fn open_reader(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
    ) -> Result<Arc<dyn SegmentReader>> {
        self.inner.open_reader(storage, record)
    }

    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentCommitInfo) -> Result<LiveDocs> {
        self.inner.read_live_docs(storage, record)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String> {
        self.inner
            .write_live_docs(storage, record, live_docs, generation)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        generation: i64,
        updates: &FieldUpdates,
    ) -> Result<BTreeSet<String>> {
        self.inner
            .write_field_updates(storage, record, generation, updates)
    }

    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        segment: &str,
        files: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        self.inner.write_compound_file(storage, segment, files)
    }

    fn merge(
        &self,
        storage: &dyn Storage,
        segment: &str,
        sources: &[MergeSource],
        check_abort: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<MergedSegment> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        self.inner.merge(storage, segment, sources, check_abort)
    }
}

/// Delegates to [`SimpleCodec`] but fails flushes with an out-of-memory
/// error while armed.
#[derive(Debug, Default)]
pub struct OomCodec {
    inner: SimpleCodec,
    armed: AtomicBool,
    failures: Mutex<usize>,
}

impl OomCodec {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn failures(&self) -> usize {
        *self.failures.lock()
    }
}

impl Codec for OomCodec {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn write_documents(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>> {
        if self.armed.load(Ordering::SeqCst) {
            *self.failures.lock() += 1;
            return Err(QuireError::out_of_memory(format!(
                "cannot buffer {} documents of {segment}",
                docs.len()
            )));
        }
        self.inner.write_documents(storage, segment, docs)
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()> {
        self.inner.write_segment_info(storage, info)
    }

    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo> {
        self.inner.read_segment_info(storage, segment)
    }

    fn open_reader(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
    ) -> Result<Arc<dyn SegmentReader>> {
        self.inner.open_reader(storage, record)
    }

    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentCommitInfo) -> Result<LiveDocs> {
        self.inner.read_live_docs(storage, record)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String> {
        self.inner
            .write_live_docs(storage, record, live_docs, generation)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        generation: i64,
        updates: &FieldUpdates,
    ) -> Result<BTreeSet<String>> {
        self.inner
            .write_field_updates(storage, record, generation, updates)
    }

    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        segment: &str,
        files: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        self.inner.write_compound_file(storage, segment, files)
    }
}
