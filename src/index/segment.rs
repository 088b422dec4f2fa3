//! Segment identity and per-commit segment metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuireError, Result};
use crate::index::file_names::{self, LIVE_DOCS_EXTENSION};
use crate::storage::Storage;

/// Immutable identity of a segment, as written to its `.si` file.
///
/// Shared between commit snapshots through an [`Arc`]; changing any field
/// means building a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment name, `_` plus a base-36 counter value.
    pub name: String,

    /// Number of documents, deleted ones included.
    pub doc_count: usize,

    /// Name of the codec that wrote the segment.
    pub codec: String,

    /// Whether the segment's files are bundled in a compound file.
    pub use_compound_file: bool,

    /// Random identifier, distinguishes segments that reuse a name.
    pub id: String,

    /// Free-form diagnostics (`source` = `flush` or `merge`, ...).
    pub diagnostics: BTreeMap<String, String>,

    /// Files written for this segment, excluding live-docs and updates files.
    pub files: BTreeSet<String>,
}

impl SegmentInfo {
    /// Create an info without files.
    pub fn new<N: Into<String>, C: Into<String>>(name: N, doc_count: usize, codec: C) -> Self {
        SegmentInfo {
            name: name.into(),
            doc_count,
            codec: codec.into(),
            use_compound_file: false,
            id: Uuid::new_v4().simple().to_string(),
            diagnostics: BTreeMap::new(),
            files: BTreeSet::new(),
        }
    }

    /// Replace the document count.
    pub fn with_doc_count(mut self, doc_count: usize) -> Self {
        self.doc_count = doc_count;
        self
    }

    /// Replace the file set.
    pub fn with_files(mut self, files: BTreeSet<String>) -> Self {
        self.files = files;
        self
    }

    /// Set the compound-file flag.
    pub fn with_compound_file(mut self, use_compound_file: bool) -> Self {
        self.use_compound_file = use_compound_file;
        self
    }

    /// Add a diagnostics entry.
    pub fn with_diagnostic<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.diagnostics.insert(key.into(), value.into());
        self
    }

    /// Add `file` to the file set, checking it belongs to this segment.
    pub fn add_file(&mut self, file: String) -> Result<()> {
        if file_names::parse_segment_name(&file) != self.name {
            return Err(QuireError::invalid_argument(format!(
                "file '{file}' does not belong to segment {}",
                self.name
            )));
        }
        self.files.insert(file);
        Ok(())
    }
}

/// A segment as recorded by one commit: identity plus the mutable delete and
/// updates bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommitInfo {
    info: Arc<SegmentInfo>,
    del_count: usize,
    del_gen: i64,
    next_write_del_gen: i64,
    field_infos_gen: i64,
    next_write_field_infos_gen: i64,
    updates_files: BTreeMap<i64, BTreeSet<String>>,
    /// Generation of the last delete packet applied; not persisted.
    buffered_deletes_gen: i64,
}

impl SegmentCommitInfo {
    /// Create a record. Generations are -1 when the file does not exist yet.
    pub fn new(info: Arc<SegmentInfo>, del_count: usize, del_gen: i64, field_infos_gen: i64) -> Self {
        SegmentCommitInfo {
            info,
            del_count,
            del_gen,
            next_write_del_gen: if del_gen == -1 { 1 } else { del_gen + 1 },
            field_infos_gen,
            next_write_field_infos_gen: if field_infos_gen == -1 {
                1
            } else {
                field_infos_gen + 1
            },
            updates_files: BTreeMap::new(),
            buffered_deletes_gen: 0,
        }
    }

    /// Record for a segment that has no deletes and no updates.
    pub fn fresh(info: SegmentInfo) -> Self {
        Self::new(Arc::new(info), 0, -1, -1)
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    /// Swap the identity, keeping delete and updates bookkeeping.
    pub fn set_info(&mut self, info: Arc<SegmentInfo>) {
        self.info = info;
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn doc_count(&self) -> usize {
        self.info.doc_count
    }

    /// Number of deleted documents recorded by the last live-docs write.
    pub fn del_count(&self) -> usize {
        self.del_count
    }

    /// Set the deleted-document count, which never exceeds the doc count.
    pub fn set_del_count(&mut self, del_count: usize) -> Result<()> {
        if del_count > self.info.doc_count {
            return Err(QuireError::invalid_argument(format!(
                "del_count {del_count} exceeds doc_count {} of {}",
                self.info.doc_count, self.info.name
            )));
        }
        self.del_count = del_count;
        Ok(())
    }

    /// Live documents according to the committed counts.
    pub fn live_doc_count(&self) -> usize {
        self.info.doc_count - self.del_count
    }

    /// Fraction of deleted documents.
    pub fn del_ratio(&self) -> f64 {
        if self.info.doc_count == 0 {
            0.0
        } else {
            self.del_count as f64 / self.info.doc_count as f64
        }
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen
    }

    /// Called after a live-docs file was written with the next generation.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen = self.del_gen + 1;
    }

    /// Skip a generation whose file may be half written.
    pub fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    pub fn field_infos_gen(&self) -> i64 {
        self.field_infos_gen
    }

    pub fn has_field_updates(&self) -> bool {
        self.field_infos_gen != -1
    }

    pub fn next_write_field_infos_gen(&self) -> i64 {
        self.next_write_field_infos_gen
    }

    /// Called after an updates file was written with the next generation.
    pub fn advance_field_infos_gen(&mut self) {
        self.field_infos_gen = self.next_write_field_infos_gen;
        self.next_write_field_infos_gen = self.field_infos_gen + 1;
    }

    /// Skip a generation whose file may be half written.
    pub fn advance_next_write_field_infos_gen(&mut self) {
        self.next_write_field_infos_gen += 1;
    }

    /// Updates files per generation.
    pub fn updates_files(&self) -> &BTreeMap<i64, BTreeSet<String>> {
        &self.updates_files
    }

    pub fn set_updates_files(&mut self, generation: i64, files: BTreeSet<String>) {
        self.updates_files.insert(generation, files);
    }

    pub fn buffered_deletes_gen(&self) -> i64 {
        self.buffered_deletes_gen
    }

    pub fn set_buffered_deletes_gen(&mut self, generation: i64) {
        self.buffered_deletes_gen = generation;
    }

    /// Current live-docs file, if any deletion was ever written.
    pub fn live_docs_file_name(&self) -> Option<String> {
        file_names::file_name_from_generation(&self.info.name, LIVE_DOCS_EXTENSION, self.del_gen)
    }

    /// Every file this record references.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        if let Some(live) = self.live_docs_file_name() {
            files.insert(live);
        }
        for generation_files in self.updates_files.values() {
            files.extend(generation_files.iter().cloned());
        }
        files
    }

    /// Total size of the referenced files.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            total += storage.file_size(&file)?;
        }
        Ok(total)
    }
}

impl std::fmt::Display for SegmentCommitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.info.name, self.info.doc_count)?;
        if self.del_count > 0 {
            write!(f, ":del={}", self.del_count)?;
        }
        if self.info.use_compound_file {
            write!(f, ":cfs")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageOutput};
    use std::io::Write;

    fn info(name: &str, docs: usize) -> SegmentInfo {
        SegmentInfo::new(name, docs, "Simple")
    }

    #[test]
    fn test_generations() {
        let mut record = SegmentCommitInfo::fresh(info("_0", 10));
        assert!(!record.has_deletions());
        assert_eq!(record.live_docs_file_name(), None);
        assert_eq!(record.next_write_del_gen(), 1);

        record.advance_next_write_del_gen();
        record.advance_del_gen();
        assert_eq!(record.del_gen(), 2);
        assert_eq!(record.next_write_del_gen(), 3);
        assert_eq!(record.live_docs_file_name().unwrap(), "_0_2.liv");

        record.advance_field_infos_gen();
        assert_eq!(record.field_infos_gen(), 1);
        assert!(record.has_field_updates());
    }

    #[test]
    fn test_del_count_bounded() {
        let mut record = SegmentCommitInfo::fresh(info("_1", 3));
        record.set_del_count(3).unwrap();
        assert_eq!(record.live_doc_count(), 0);
        assert!(record.set_del_count(4).is_err());
        assert!((record.del_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_files_and_size() {
        let storage = MemoryStorage::new_default();
        for (name, len) in [("_2.sdoc", 7usize), ("_2.si", 3), ("_2_1.liv", 2), ("_2_1.upd", 5)] {
            let mut out = storage.create_output(name).unwrap();
            out.write_all(&vec![0u8; len]).unwrap();
            out.close().unwrap();
        }

        let seg = info("_2", 4).with_files(["_2.sdoc", "_2.si"].iter().map(|s| s.to_string()).collect());
        let mut record = SegmentCommitInfo::fresh(seg);
        record.advance_del_gen();
        record.set_updates_files(1, ["_2_1.upd".to_string()].into_iter().collect());

        let files: Vec<String> = record.files().into_iter().collect();
        assert_eq!(files, vec!["_2.sdoc", "_2.si", "_2_1.liv", "_2_1.upd"]);
        assert_eq!(record.size_in_bytes(&storage).unwrap(), 17);
    }

    #[test]
    fn test_add_file_checks_segment() {
        let mut seg = info("_3", 1);
        seg.add_file("_3.cfs".to_string()).unwrap();
        assert!(seg.add_file("_4.cfs".to_string()).is_err());
    }
}
