//! Codec abstraction: how segment data reaches storage.
//!
//! The write path never interprets postings or stored values itself. It asks
//! a [`Codec`] to write a flushed batch of documents, to persist live docs
//! and doc-values updates under a new generation, to merge several segments
//! into one and to read everything back through a [`SegmentReader`].

pub mod simple;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};
use crate::index::pipeline::Document;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::term::{DocValue, Term};
use crate::storage::Storage;
use crate::util::bits::LiveDocs;

pub use simple::SimpleCodec;

/// Read access to one segment, including doc-values updates written so far.
pub trait SegmentReader: Send + Sync + Debug {
    /// Number of documents, deleted ones included.
    fn max_doc(&self) -> usize;

    /// Documents containing `term`, ascending.
    fn docs_for_term(&self, term: &Term) -> Vec<usize>;

    /// Numeric doc value of `field` for `doc`.
    fn numeric_value(&self, field: &str, doc: usize) -> Option<i64>;

    /// Binary doc value of `field` for `doc`.
    fn binary_value(&self, field: &str, doc: usize) -> Option<Vec<u8>>;

    /// All doc values of `doc`.
    fn doc_values(&self, doc: usize) -> BTreeMap<String, DocValue>;

    /// All terms of `doc`.
    fn terms(&self, doc: usize) -> Vec<Term>;
}

/// Doc-values changes for one segment, keyed by field then document.
///
/// A later value for the same document replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdates {
    fields: BTreeMap<String, BTreeMap<usize, DocValue>>,
}

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `field` of `doc`.
    pub fn add(&mut self, field: &str, doc: usize, value: DocValue) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    /// Value recorded for `field` of `doc`.
    pub fn get(&self, field: &str, doc: usize) -> Option<&DocValue> {
        self.fields.get(field).and_then(|docs| docs.get(&doc))
    }

    /// Fold `other` into this set; `other` wins on conflicts.
    pub fn merge_from(&mut self, other: &FieldUpdates) {
        for (field, docs) in &other.fields {
            let target = self.fields.entry(field.clone()).or_default();
            for (doc, value) in docs {
                target.insert(*doc, value.clone());
            }
        }
    }

    /// Iterate `(field, doc, value)` in field then document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &DocValue)> {
        self.fields.iter().flat_map(|(field, docs)| {
            docs.iter()
                .map(move |(doc, value)| (field.as_str(), *doc, value))
        })
    }

    /// Names of the updated fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of `(field, doc)` entries.
    pub fn len(&self) -> usize {
        self.fields.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(BTreeMap::is_empty)
    }

    /// Forget every recorded value.
    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// One input segment of a merge.
#[derive(Debug, Clone)]
pub struct MergeSource {
    /// Reader over the segment as it was when the merge started.
    pub reader: Arc<dyn SegmentReader>,

    /// Live docs snapshot; `None` means every document is live.
    pub live_docs: Option<LiveDocs>,
}

impl MergeSource {
    pub fn is_live(&self, doc: usize) -> bool {
        self.live_docs.as_ref().is_none_or(|live| live.is_live(doc))
    }
}

/// Output of [`Codec::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedSegment {
    /// Documents written to the merged segment.
    pub doc_count: usize,

    /// Files written, excluding the `.si` file.
    pub files: BTreeSet<String>,
}

/// Encodes and decodes the files of a segment.
pub trait Codec: Send + Sync + Debug {
    /// Name recorded in commit files and `.si` files.
    fn name(&self) -> &str;

    /// Write a flushed batch of documents as segment `segment`.
    fn write_documents(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>>;

    /// Write the `.si` file of `info`, adding its name to `info.files`.
    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()>;

    /// Read the `.si` file of `segment`.
    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo>;

    /// Open a reader reflecting every updates generation of `record`.
    fn open_reader(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
    ) -> Result<Arc<dyn SegmentReader>>;

    /// Read the current live docs of `record`.
    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentCommitInfo) -> Result<LiveDocs>;

    /// Write `live_docs` as generation `generation`; returns the file name.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String>;

    /// Write doc-values updates as generation `generation`; returns the files.
    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        generation: i64,
        updates: &FieldUpdates,
    ) -> Result<BTreeSet<String>>;

    /// Bundle `files` of `segment` into a compound file; returns the new file set.
    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        segment: &str,
        files: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>>;

    /// Merge the live documents of `sources`, in order, into segment `segment`.
    ///
    /// `check_abort` is called with units of work done and fails once the
    /// merge has been aborted.
    fn merge(
        &self,
        storage: &dyn Storage,
        segment: &str,
        sources: &[MergeSource],
        check_abort: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<MergedSegment> {
        let mut docs = Vec::new();
        for source in sources {
            for doc in 0..source.reader.max_doc() {
                if !source.is_live(doc) {
                    continue;
                }
                docs.push(Document {
                    terms: source.reader.terms(doc),
                    values: source.reader.doc_values(doc),
                });
                check_abort(1)?;
            }
        }

        let files = self.write_documents(storage, segment, &docs)?;
        Ok(MergedSegment {
            doc_count: docs.len(),
            files,
        })
    }
}

/// Codecs known by name, used when reading commit files.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    /// Register `codec` under its name, replacing any previous one.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Look up a codec by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| QuireError::corrupt(format!("unknown codec: {name}")))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SimpleCodec::new()));
        registry
    }
}
