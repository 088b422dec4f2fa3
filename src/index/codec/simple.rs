//! A small reference codec.
//!
//! Each segment keeps its documents in one `.sdoc` file (bincode inside a
//! checksummed envelope). Live docs go to `_N_<gen>.liv`, doc-values updates
//! to `_N_<gen>.upd` as JSON, and a compound `.cfs` bundles the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::error::{QuireError, Result};
use crate::index::codec::{Codec, FieldUpdates, SegmentReader};
use crate::index::file_names::{
    self, COMPOUND_FILE_EXTENSION, LIVE_DOCS_EXTENSION, SEGMENT_INFO_EXTENSION,
};
use crate::index::pipeline::Document;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::term::{DocValue, Term};
use crate::storage::{MemoryInput, Storage, StorageInput, StructReader, StructWriter};
use crate::util::bits::LiveDocs;

/// Extension of stored-document files.
pub const DOCS_EXTENSION: &str = "sdoc";

/// Extension of doc-values updates files.
pub const UPDATES_EXTENSION: &str = "upd";

const DOCS_CODEC: &str = "SimpleDocs";
const INFO_CODEC: &str = "SimpleSegmentInfo";
const LIVE_DOCS_CODEC: &str = "SimpleLiveDocs";
const UPDATES_CODEC: &str = "SimpleUpdates";
const COMPOUND_CODEC: &str = "SimpleCompound";
const VERSION: i32 = 0;

/// The default codec.
#[derive(Debug, Clone, Default)]
pub struct SimpleCodec;

impl SimpleCodec {
    pub const NAME: &'static str = "Simple";

    pub fn new() -> Self {
        SimpleCodec
    }

    fn read_documents(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<Vec<Document>> {
        let name = file_names::segment_file_name(&info.name, "", DOCS_EXTENSION);
        let input: Box<dyn StorageInput> = if info.use_compound_file {
            let mut entries = read_compound(storage, &info.name)?;
            let bytes = entries.remove(&name).ok_or_else(|| {
                QuireError::corrupt(format!("{name} missing from compound file of {}", info.name))
            })?;
            Box::new(MemoryInput::new(Arc::from(bytes)))
        } else {
            storage.open_input(&name)?
        };

        let mut reader = StructReader::new(input)?;
        reader.check_header(DOCS_CODEC, VERSION, VERSION)?;
        let payload = reader.read_bytes()?;
        reader.check_footer()?;
        let docs: Vec<Document> = bincode::deserialize(&payload)?;
        if docs.len() != info.doc_count {
            return Err(QuireError::corrupt(format!(
                "{name} holds {} documents but segment {} has {}",
                docs.len(),
                info.name,
                info.doc_count
            )));
        }
        Ok(docs)
    }

    fn read_field_updates(&self, storage: &dyn Storage, file: &str) -> Result<FieldUpdates> {
        let mut reader = StructReader::new(storage.open_input(file)?)?;
        reader.check_header(UPDATES_CODEC, VERSION, VERSION)?;
        let payload = reader.read_bytes()?;
        reader.check_footer()?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

fn compound_file_name(segment: &str) -> String {
    file_names::segment_file_name(segment, "", COMPOUND_FILE_EXTENSION)
}

fn read_compound(storage: &dyn Storage, segment: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut reader = StructReader::new(storage.open_input(&compound_file_name(segment))?)?;
    reader.check_header(COMPOUND_CODEC, VERSION, VERSION)?;
    let count = reader.read_varint()?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let name = reader.read_string()?;
        let bytes = reader.read_bytes()?;
        entries.insert(name, bytes);
    }
    reader.check_footer()?;
    Ok(entries)
}

impl Codec for SimpleCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn write_documents(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>> {
        let name = file_names::segment_file_name(segment, "", DOCS_EXTENSION);
        let payload = bincode::serialize(docs)?;

        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(DOCS_CODEC, VERSION)?;
        writer.write_bytes(&payload)?;
        writer.write_footer()?;
        writer.close()?;

        Ok(BTreeSet::from([name]))
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()> {
        let name = file_names::segment_file_name(&info.name, "", SEGMENT_INFO_EXTENSION);
        info.add_file(name.clone())?;

        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(INFO_CODEC, VERSION)?;
        writer.write_string(&info.name)?;
        writer.write_varint(info.doc_count as u64)?;
        writer.write_u8(u8::from(info.use_compound_file))?;
        writer.write_string(&info.codec)?;
        writer.write_string(&info.id)?;
        writer.write_string_map(&info.diagnostics)?;
        writer.write_string_set(&info.files)?;
        writer.write_footer()?;
        writer.close()
    }

    fn read_segment_info(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentInfo> {
        let name = file_names::segment_file_name(segment, "", SEGMENT_INFO_EXTENSION);
        let mut reader = StructReader::new(storage.open_input(&name)?)?;
        reader.check_header(INFO_CODEC, VERSION, VERSION)?;

        let stored_name = reader.read_string()?;
        if stored_name != segment {
            return Err(QuireError::corrupt(format!(
                "{name} describes segment {stored_name}"
            )));
        }
        let doc_count = reader.read_varint()? as usize;
        let use_compound_file = match reader.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(QuireError::corrupt(format!(
                    "invalid compound flag {other} in {name}"
                )));
            }
        };
        let codec = reader.read_string()?;
        let id = reader.read_string()?;
        let diagnostics = reader.read_string_map()?;
        let files = reader.read_string_set()?;
        reader.check_footer()?;

        Ok(SegmentInfo {
            name: stored_name,
            doc_count,
            codec,
            use_compound_file,
            id,
            diagnostics,
            files,
        })
    }

    fn open_reader(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
    ) -> Result<Arc<dyn SegmentReader>> {
        let mut docs = self.read_documents(storage, record.info())?;

        for (generation, files) in record.updates_files() {
            for file in files {
                let updates = self.read_field_updates(storage, file)?;
                for (field, doc, value) in updates.iter() {
                    let target = docs.get_mut(doc).ok_or_else(|| {
                        QuireError::corrupt(format!(
                            "{file} (gen {generation}) updates doc {doc} beyond {}",
                            record.doc_count()
                        ))
                    })?;
                    target.values.insert(field.to_string(), value.clone());
                }
            }
        }

        Ok(Arc::new(SimpleSegmentReader::new(docs)))
    }

    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentCommitInfo) -> Result<LiveDocs> {
        let Some(name) = record.live_docs_file_name() else {
            return Ok(LiveDocs::new(record.doc_count()));
        };

        let mut reader = StructReader::new(storage.open_input(&name)?)?;
        reader.check_header(LIVE_DOCS_CODEC, VERSION, VERSION)?;
        let max_doc = reader.read_varint()? as usize;
        let bytes = reader.read_bytes()?;
        reader.check_footer()?;

        if max_doc != record.doc_count() {
            return Err(QuireError::corrupt(format!(
                "{name} covers {max_doc} docs, segment has {}",
                record.doc_count()
            )));
        }
        let live = LiveDocs::from_bytes(&bytes, max_doc)
            .ok_or_else(|| QuireError::corrupt(format!("{name} is too short")))?;
        if live.num_deleted() != record.del_count() {
            return Err(QuireError::corrupt(format!(
                "{name} has {} deletions, commit records {}",
                live.num_deleted(),
                record.del_count()
            )));
        }
        Ok(live)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        live_docs: &LiveDocs,
        generation: i64,
    ) -> Result<String> {
        let name =
            file_names::file_name_from_generation(record.name(), LIVE_DOCS_EXTENSION, generation)
                .ok_or_else(|| QuireError::invalid_argument("live docs generation -1"))?;

        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(LIVE_DOCS_CODEC, VERSION)?;
        writer.write_varint(live_docs.len() as u64)?;
        writer.write_bytes(&live_docs.to_bytes())?;
        writer.write_footer()?;
        writer.close()?;
        Ok(name)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentCommitInfo,
        generation: i64,
        updates: &FieldUpdates,
    ) -> Result<BTreeSet<String>> {
        let suffix = file_names::to_radix36(generation as u64);
        let name = file_names::segment_file_name(record.name(), &suffix, UPDATES_EXTENSION);
        let payload = serde_json::to_vec(updates)?;

        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(UPDATES_CODEC, VERSION)?;
        writer.write_bytes(&payload)?;
        writer.write_footer()?;
        writer.close()?;
        Ok(BTreeSet::from([name]))
    }

    fn write_compound_file(
        &self,
        storage: &dyn Storage,
        segment: &str,
        files: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let name = compound_file_name(segment);
        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(COMPOUND_CODEC, VERSION)?;
        writer.write_varint(files.len() as u64)?;
        for file in files {
            let mut input = storage.open_input(file)?;
            let mut bytes = Vec::new();
            input.read_to_end(&mut bytes)?;
            writer.write_string(file)?;
            writer.write_bytes(&bytes)?;
        }
        writer.write_footer()?;
        writer.close()?;

        debug!("bundled {} files of {segment} into {name}", files.len());
        Ok(BTreeSet::from([name]))
    }
}

/// Reader over fully materialised documents.
#[derive(Debug)]
pub struct SimpleSegmentReader {
    docs: Vec<Document>,
    postings: AHashMap<Term, Vec<usize>>,
}

impl SimpleSegmentReader {
    pub fn new(docs: Vec<Document>) -> Self {
        let mut postings: AHashMap<Term, Vec<usize>> = AHashMap::new();
        for (doc, document) in docs.iter().enumerate() {
            for term in &document.terms {
                let list = postings.entry(term.clone()).or_default();
                if list.last() != Some(&doc) {
                    list.push(doc);
                }
            }
        }
        SimpleSegmentReader { docs, postings }
    }
}

impl SegmentReader for SimpleSegmentReader {
    fn max_doc(&self) -> usize {
        self.docs.len()
    }

    fn docs_for_term(&self, term: &Term) -> Vec<usize> {
        self.postings.get(term).cloned().unwrap_or_default()
    }

    fn numeric_value(&self, field: &str, doc: usize) -> Option<i64> {
        match self.docs.get(doc)?.values.get(field)? {
            DocValue::Numeric(value) => Some(*value),
            DocValue::Binary(_) => None,
        }
    }

    fn binary_value(&self, field: &str, doc: usize) -> Option<Vec<u8>> {
        match self.docs.get(doc)?.values.get(field)? {
            DocValue::Binary(bytes) => Some(bytes.clone()),
            DocValue::Numeric(_) => None,
        }
    }

    fn doc_values(&self, doc: usize) -> BTreeMap<String, DocValue> {
        self.docs
            .get(doc)
            .map(|d| d.values.clone())
            .unwrap_or_default()
    }

    fn terms(&self, doc: usize) -> Vec<Term> {
        self.docs
            .get(doc)
            .map(|d| d.terms.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::MergeSource;
    use crate::storage::MemoryStorage;

    fn doc(id: usize) -> Document {
        Document::new()
            .with_term("id", id.to_string())
            .with_term("body", "common")
            .with_numeric("price", id as i64)
    }

    fn flush(storage: &MemoryStorage, codec: &SimpleCodec, name: &str, n: usize) -> SegmentCommitInfo {
        let docs: Vec<Document> = (0..n).map(doc).collect();
        let files = codec.write_documents(storage, name, &docs).unwrap();
        let mut info = SegmentInfo::new(name, n, SimpleCodec::NAME).with_files(files);
        codec.write_segment_info(storage, &mut info).unwrap();
        SegmentCommitInfo::fresh(info)
    }

    #[test]
    fn test_segment_info_round_trip() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let record = flush(&storage, &codec, "_0", 3);

        let read = codec.read_segment_info(&storage, "_0").unwrap();
        assert_eq!(&read, record.info().as_ref());
        assert!(read.files.contains("_0.si"));
        assert!(read.files.contains("_0.sdoc"));
    }

    #[test]
    fn test_reader_postings() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let record = flush(&storage, &codec, "_0", 4);

        let reader = codec.open_reader(&storage, &record).unwrap();
        assert_eq!(reader.max_doc(), 4);
        assert_eq!(reader.docs_for_term(&Term::new("id", "2")), vec![2]);
        assert_eq!(reader.docs_for_term(&Term::new("body", "common")), vec![0, 1, 2, 3]);
        assert!(reader.docs_for_term(&Term::new("id", "9")).is_empty());
        assert_eq!(reader.numeric_value("price", 3), Some(3));
    }

    #[test]
    fn test_live_docs_generations() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let mut record = flush(&storage, &codec, "_1", 5);

        assert_eq!(codec.read_live_docs(&storage, &record).unwrap().num_live(), 5);

        let mut live = LiveDocs::new(5);
        live.delete(1);
        live.delete(4);
        let name = codec
            .write_live_docs(&storage, &record, &live, record.next_write_del_gen())
            .unwrap();
        assert_eq!(name, "_1_1.liv");
        record.advance_del_gen();
        record.set_del_count(2).unwrap();

        let read = codec.read_live_docs(&storage, &record).unwrap();
        assert_eq!(read, live);

        record.set_del_count(1).unwrap();
        assert!(matches!(
            codec.read_live_docs(&storage, &record),
            Err(QuireError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_field_updates_applied_in_generation_order() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let mut record = flush(&storage, &codec, "_2", 3);

        for (value, doc) in [(100, 0), (200, 0)] {
            let mut updates = FieldUpdates::new();
            updates.add("price", doc, DocValue::Numeric(value));
            let generation = record.next_write_field_infos_gen();
            let files = codec
                .write_field_updates(&storage, &record, generation, &updates)
                .unwrap();
            record.advance_field_infos_gen();
            record.set_updates_files(generation, files);
        }

        let reader = codec.open_reader(&storage, &record).unwrap();
        assert_eq!(reader.numeric_value("price", 0), Some(200));
        assert_eq!(reader.numeric_value("price", 1), Some(1));
        assert!(record.files().contains("_2_2.upd"));
    }

    #[test]
    fn test_compound_file() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let docs: Vec<Document> = (0..2).map(doc).collect();
        let files = codec.write_documents(&storage, "_3", &docs).unwrap();

        let cfs = codec.write_compound_file(&storage, "_3", &files).unwrap();
        assert_eq!(cfs.iter().next().unwrap(), "_3.cfs");
        storage.delete_file("_3.sdoc").unwrap();

        let info = SegmentInfo::new("_3", 2, SimpleCodec::NAME)
            .with_files(cfs)
            .with_compound_file(true);
        let reader = codec
            .open_reader(&storage, &SegmentCommitInfo::fresh(info))
            .unwrap();
        assert_eq!(reader.docs_for_term(&Term::new("id", "1")), vec![1]);
    }

    #[test]
    fn test_merge_skips_deleted() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let a = flush(&storage, &codec, "_4", 3);
        let b = flush(&storage, &codec, "_5", 2);

        let mut live_a = LiveDocs::new(3);
        live_a.delete(1);
        let sources = vec![
            MergeSource {
                reader: codec.open_reader(&storage, &a).unwrap(),
                live_docs: Some(live_a),
            },
            MergeSource {
                reader: codec.open_reader(&storage, &b).unwrap(),
                live_docs: None,
            },
        ];

        let mut work = 0;
        let merged = codec
            .merge(&storage, "_6", &sources, &mut |units| {
                work += units;
                Ok(())
            })
            .unwrap();
        assert_eq!(merged.doc_count, 4);
        assert_eq!(work, 4);

        let info = SegmentInfo::new("_6", 4, SimpleCodec::NAME).with_files(merged.files);
        let reader = codec
            .open_reader(&storage, &SegmentCommitInfo::fresh(info))
            .unwrap();
        assert!(reader.docs_for_term(&Term::new("id", "1")).len() == 1);
        assert_eq!(reader.numeric_value("price", 1), Some(2));
    }

    #[test]
    fn test_merge_abort() {
        let storage = MemoryStorage::new_default();
        let codec = SimpleCodec::new();
        let a = flush(&storage, &codec, "_7", 3);
        let sources = vec![MergeSource {
            reader: codec.open_reader(&storage, &a).unwrap(),
            live_docs: None,
        }];

        let result = codec.merge(&storage, "_8", &sources, &mut |_| {
            Err(QuireError::merge_aborted("test"))
        });
        assert!(matches!(result, Err(QuireError::MergeAborted(_))));
        assert!(!storage.file_exists("_8.sdoc"));
    }
}
