//! The segment catalog and its commit files.
//!
//! A [`SegmentCatalog`] is the ordered list of segments making up the index
//! plus the catalog-wide counters. Each commit writes it to a fresh
//! `segments_N` file in two phases: [`SegmentCatalog::prepare_commit`] writes
//! everything except the checksum footer, [`SegmentCatalog::finish_commit`]
//! appends the footer and syncs. A file without a footer never passes
//! [`SegmentCatalog::read_commit`], so a crash between the two phases leaves
//! the previous commit in charge.
//!
//! Finding the current commit is retry tolerant, see
//! [`find_segments_file`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::error::{QuireError, Result};
use crate::index::codec::CodecRegistry;
use crate::index::file_names::{self, SEGMENTS, SEGMENTS_GEN};
use crate::index::segment::SegmentCommitInfo;
use crate::storage::structured::{FOOTER_LENGTH, StructReader, StructWriter};
use crate::storage::{Storage, StorageOutput};
use crate::util::bits::LiveDocs;

/// Commit file format version.
const FORMAT: i32 = 1;

/// Format of `segments.gen`.
pub const FORMAT_SEGMENTS_GEN: i32 = -3;

/// Size of a well-formed `segments.gen`: format, two generations and footer.
const SEGMENTS_GEN_LENGTH: u64 = 4 + 8 + 8 + FOOTER_LENGTH;

/// How many generations past the last known one discovery probes.
pub const DEFAULT_GEN_LOOKAHEAD_COUNT: usize = 10;

/// Ordered segments plus catalog-wide counters.
pub struct SegmentCatalog {
    segments: Vec<SegmentCommitInfo>,
    /// Bumped on every change; near-real-time readers compare it.
    version: i64,
    /// Source of new segment names.
    counter: i32,
    /// Generation of the commit being written or last written.
    generation: i64,
    /// Generation of the last successful commit.
    last_generation: i64,
    user_data: BTreeMap<String, String>,
    pending_commit: Option<StructWriter<Box<dyn StorageOutput>>>,
}

impl Default for SegmentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SegmentCatalog {
    /// Records share their immutable [`SegmentInfo`](crate::index::SegmentInfo);
    /// a clone never carries a pending commit.
    fn clone(&self) -> Self {
        SegmentCatalog {
            segments: self.segments.clone(),
            version: self.version,
            counter: self.counter,
            generation: self.generation,
            last_generation: self.last_generation,
            user_data: self.user_data.clone(),
            pending_commit: None,
        }
    }
}

impl fmt::Debug for SegmentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentCatalog")
            .field("segments", &self.segments.len())
            .field("version", &self.version)
            .field("counter", &self.counter)
            .field("generation", &self.generation)
            .field("last_generation", &self.last_generation)
            .field("pending_commit", &self.pending_commit.is_some())
            .finish()
    }
}

impl fmt::Display for SegmentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match file_names::segments_file_name(self.last_generation) {
            Some(name) => write!(f, "{name}:")?,
            None => write!(f, "uncommitted:")?,
        }
        for (i, record) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

impl SegmentCatalog {
    /// Empty catalog that has never been committed.
    pub fn new() -> Self {
        let version = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        SegmentCatalog {
            segments: Vec::new(),
            version,
            counter: 0,
            generation: -1,
            last_generation: -1,
            user_data: BTreeMap::new(),
            pending_commit: None,
        }
    }

    /// Read the most recent commit with the default codecs and lookahead.
    pub fn read(storage: &dyn Storage) -> Result<Self> {
        Self::read_with_lookahead(storage, &CodecRegistry::default(), DEFAULT_GEN_LOOKAHEAD_COUNT)
    }

    /// Read the most recent commit, probing up to `lookahead` generations
    /// past the newest one the storage lists.
    pub fn read_with_lookahead(
        storage: &dyn Storage,
        codecs: &CodecRegistry,
        lookahead: usize,
    ) -> Result<Self> {
        find_segments_file(storage, lookahead, |file| {
            Self::read_commit(storage, codecs, file)
        })
    }

    /// Parse one commit file.
    pub fn read_commit(storage: &dyn Storage, codecs: &CodecRegistry, file: &str) -> Result<Self> {
        let generation = file_names::generation_from_segments_file_name(file)?;
        let mut reader = StructReader::new(storage.open_input(file)?)?;
        reader.check_header(SEGMENTS, FORMAT, FORMAT)?;

        let mut catalog = SegmentCatalog::new();
        catalog.generation = generation;
        catalog.last_generation = generation;
        catalog.version = reader.read_i64()?;
        catalog.counter = reader.read_i32()?;
        if catalog.counter < 0 {
            return Err(QuireError::corrupt(format!(
                "invalid counter {} in {file}",
                catalog.counter
            )));
        }

        let count = reader.read_i32()?;
        if count < 0 {
            return Err(QuireError::corrupt(format!(
                "invalid segment count {count} in {file}"
            )));
        }

        for _ in 0..count {
            let name = reader.read_string()?;
            let codec = codecs.get(&reader.read_string()?)?;
            let info = codec.read_segment_info(storage, &name)?;
            let del_gen = reader.read_i64()?;
            let del_count = reader.read_i32()?;
            if del_count < 0 || del_count as usize > info.doc_count {
                return Err(QuireError::corrupt(format!(
                    "invalid deletion count {del_count} vs doc count {} for segment {name} in {file}",
                    info.doc_count
                )));
            }
            let field_infos_gen = reader.read_i64()?;

            let mut record =
                SegmentCommitInfo::new(Arc::new(info), del_count as usize, del_gen, field_infos_gen);
            let num_gens = reader.read_i32()?;
            if num_gens < 0 {
                return Err(QuireError::corrupt(format!(
                    "invalid updates generation count {num_gens} for segment {name} in {file}"
                )));
            }
            for _ in 0..num_gens {
                let generation = reader.read_i64()?;
                let files = reader.read_string_set()?;
                record.set_updates_files(generation, files);
            }
            catalog.segments.push(record);
        }

        catalog.user_data = reader.read_string_map()?;
        reader.check_footer()?;
        reader.close()?;

        debug!("read {file} with {count} segments");
        Ok(catalog)
    }

    /// Write the next generation's commit file, minus its footer.
    ///
    /// The catalog's `generation` moves to the new file; `last_generation`
    /// only follows in [`SegmentCatalog::finish_commit`].
    pub fn prepare_commit(&mut self, storage: &dyn Storage) -> Result<()> {
        if self.pending_commit.is_some() {
            return Err(QuireError::invalid_operation(
                "prepare_commit was already called",
            ));
        }

        let next = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        let file = segments_name(next)?;
        self.generation = next;

        let mut output = StructWriter::new(storage.create_output(&file)?);
        match self.write_body(&mut output) {
            Ok(()) => {
                self.pending_commit = Some(output);
                debug!("prepared {file}");
                Ok(())
            }
            Err(e) => {
                drop(output);
                if let Err(delete_error) = storage.delete_file(&file) {
                    debug!("could not delete {file} after failed prepare: {delete_error}");
                }
                Err(e)
            }
        }
    }

    fn write_body(&self, output: &mut StructWriter<Box<dyn StorageOutput>>) -> Result<()> {
        output.write_header(SEGMENTS, FORMAT)?;
        output.write_i64(self.version)?;
        output.write_i32(self.counter)?;
        output.write_i32(to_i32(self.segments.len(), "segment count")?)?;

        for record in &self.segments {
            if record.del_count() > record.doc_count() {
                return Err(QuireError::invalid_operation(format!(
                    "cannot write segment {}: invalid del_count {} vs doc count {}",
                    record.name(),
                    record.del_count(),
                    record.doc_count()
                )));
            }
            output.write_string(record.name())?;
            output.write_string(&record.info().codec)?;
            output.write_i64(record.del_gen())?;
            output.write_i32(to_i32(record.del_count(), "del_count")?)?;
            output.write_i64(record.field_infos_gen())?;
            let updates = record.updates_files();
            output.write_i32(to_i32(updates.len(), "updates generation count")?)?;
            for (generation, files) in updates {
                output.write_i64(*generation)?;
                output.write_string_set(files)?;
            }
        }

        output.write_string_map(&self.user_data)
    }

    /// Complete a prepared commit: footer, close, sync, then `segments.gen`.
    ///
    /// Returns the name of the new commit file. Any failure removes the
    /// half-written file and leaves no commit pending.
    pub fn finish_commit(&mut self, storage: &dyn Storage) -> Result<String> {
        let Some(mut output) = self.pending_commit.take() else {
            return Err(QuireError::invalid_operation(
                "prepare_commit was not called",
            ));
        };
        let file = segments_name(self.generation)?;

        let closed = output.write_footer().and_then(|()| output.close());
        if let Err(e) = closed {
            delete_quietly(storage, &file);
            return Err(e);
        }

        if let Err(e) = storage.sync(std::slice::from_ref(&file)) {
            delete_quietly(storage, &file);
            return Err(e);
        }

        self.last_generation = self.generation;
        write_segments_gen(storage, self.generation);
        debug!("committed {file}");
        Ok(file)
    }

    /// Discard a prepared commit, deleting its file.
    pub fn rollback_commit(&mut self, storage: &dyn Storage) {
        if let Some(output) = self.pending_commit.take() {
            drop(output);
            if let Ok(file) = segments_name(self.generation) {
                delete_quietly(storage, &file);
                debug!("rolled back prepared {file}");
            }
        }
    }

    /// Prepare and finish in one go.
    pub fn commit(&mut self, storage: &dyn Storage) -> Result<String> {
        self.prepare_commit(storage)?;
        self.finish_commit(storage)
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending_commit.is_some()
    }

    /// Take over the generations of `other`, typically the clone that was
    /// just committed.
    pub fn update_generation(&mut self, other: &SegmentCatalog) {
        self.last_generation = other.last_generation;
        self.generation = other.generation;
    }

    /// Move past the generation `other` tried to write, so a failed commit
    /// attempt's file name is never used again.
    pub fn skip_generation_of(&mut self, other: &SegmentCatalog) {
        self.generation = self.generation.max(other.generation);
    }

    /// Record a change.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    /// Allocate the next segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = file_names::segment_name(self.counter as u64);
        self.counter += 1;
        name
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn last_generation(&self) -> i64 {
        self.last_generation
    }

    /// Name of the last committed file, if any.
    pub fn segments_file_name(&self) -> Option<String> {
        file_names::segments_file_name(self.last_generation)
    }

    /// Name the next commit will be written to.
    pub fn next_segments_file_name(&self) -> Option<String> {
        let next = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        file_names::segments_file_name(next)
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn set_user_data(&mut self, user_data: BTreeMap<String, String>) {
        self.user_data = user_data;
    }

    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [SegmentCommitInfo] {
        &mut self.segments
    }

    pub fn get(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|r| r.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|r| r.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|r| r.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn add(&mut self, record: SegmentCommitInfo) {
        self.segments.push(record);
    }

    pub fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let idx = self.index_of(name)?;
        Some(self.segments.remove(idx))
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Documents across all segments, deleted ones included.
    pub fn total_doc_count(&self) -> usize {
        self.segments.iter().map(SegmentCommitInfo::doc_count).sum()
    }

    /// Put back an earlier segment list, keeping counters and generations.
    pub fn rollback_segments(&mut self, segments: Vec<SegmentCommitInfo>) {
        self.segments = segments;
    }

    /// Replace the merged-away segments with `merged`.
    ///
    /// The merged segment takes the place of the first source still present.
    /// With `drop_merged` it is not inserted at all, which is how a merge
    /// whose every document was deleted meanwhile disappears.
    pub fn apply_merge_changes(
        &mut self,
        merged_away: &BTreeSet<String>,
        merged: SegmentCommitInfo,
        drop_merged: bool,
    ) {
        let mut merged = Some(merged);
        let mut kept = Vec::with_capacity(self.segments.len());
        for record in self.segments.drain(..) {
            if merged_away.contains(record.name()) {
                if !drop_merged {
                    if let Some(merged) = merged.take() {
                        kept.push(merged);
                    }
                }
            } else {
                kept.push(record);
            }
        }
        self.segments = kept;

        // Every source vanished while merging; the result goes first.
        if !drop_merged {
            if let Some(merged) = merged {
                self.segments.insert(0, merged);
            }
        }
    }

    /// Files referenced by this catalog, optionally with its commit file.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            if let Some(name) = self.segments_file_name() {
                files.insert(name);
            }
        }
        for record in &self.segments {
            files.extend(record.files());
        }
        files
    }
}

/// Whoever keeps the files of a snapshot alive.
pub(crate) trait SnapshotOwner: Send + Sync {
    fn release_snapshot_files(&self, files: &BTreeSet<String>);
}

/// Files held on behalf of a snapshot until its last clone drops.
struct SnapshotPin {
    files: BTreeSet<String>,
    owner: Weak<dyn SnapshotOwner>,
}

impl fmt::Debug for SnapshotPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPin")
            .field("files", &self.files.len())
            .finish()
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release_snapshot_files(&self.files);
        }
    }
}

/// Catalog state as seen by a near-real-time reader.
///
/// A snapshot taken from a writer keeps its segment files on storage until
/// the snapshot and all of its clones are dropped.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub catalog: SegmentCatalog,
    /// Live docs per segment name, pending deletes included.
    pub live_docs: HashMap<String, LiveDocs>,
    pub version: i64,
    pin: Option<Arc<SnapshotPin>>,
}

impl CatalogSnapshot {
    pub fn new(catalog: SegmentCatalog, live_docs: HashMap<String, LiveDocs>) -> Self {
        let version = catalog.version();
        CatalogSnapshot {
            catalog,
            live_docs,
            version,
            pin: None,
        }
    }

    /// Tie `files` to this snapshot; `owner` is told once the last clone
    /// is gone.
    pub(crate) fn pinned(mut self, files: BTreeSet<String>, owner: Weak<dyn SnapshotOwner>) -> Self {
        self.pin = Some(Arc::new(SnapshotPin { files, owner }));
        self
    }

    /// Files the segments of this snapshot are made of.
    pub fn files(&self) -> BTreeSet<String> {
        self.catalog.files(false)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }

    /// Documents not deleted, across all segments.
    pub fn num_docs(&self) -> usize {
        self.catalog
            .segments()
            .iter()
            .map(|record| match self.live_docs.get(record.name()) {
                Some(live_docs) => live_docs.num_live(),
                None => record.live_doc_count(),
            })
            .sum()
    }

    pub fn max_doc(&self) -> usize {
        self.catalog.total_doc_count()
    }

    /// Whether `doc` of `segment` is live in this snapshot.
    pub fn is_live(&self, segment: &str, doc: usize) -> bool {
        match self.live_docs.get(segment) {
            Some(live_docs) => live_docs.is_live(doc),
            None => self
                .catalog
                .get(segment)
                .is_some_and(|r| !r.has_deletions() && doc < r.doc_count()),
        }
    }
}

/// Run `body` on the current commit file, retrying while a concurrent
/// commit or a stale directory listing gets in the way.
///
/// The generation to try is the larger of the newest `segments_N` listed
/// and the one `segments.gen` records. A generation that fails twice is
/// retried once as `segments_{N-1}`; when the newest generation stops moving
/// for three rounds, up to `lookahead` later generations are probed before
/// the first error is returned.
pub fn find_segments_file<T, F>(storage: &dyn Storage, lookahead: usize, mut body: F) -> Result<T>
where
    F: FnMut(&str) -> Result<T>,
{
    let mut last_gen = -1;
    let mut generation = 0;
    let mut lookahead_count = 0;
    let mut first_error: Option<QuireError> = None;
    let mut retry_count = 0;
    let mut use_first_method = true;

    loop {
        if use_first_method {
            let files = storage.list_files()?;
            let gen_a = last_commit_generation(&files);
            let gen_b = read_segments_gen(storage)?.unwrap_or(-1);
            debug!("discovery: directory listing gen={gen_a}, segments.gen gen={gen_b}");

            generation = gen_a.max(gen_b);
            if generation == -1 {
                return Err(QuireError::index_not_found(format!(
                    "no segments file found in {storage:?}: files: {files:?}"
                )));
            }
        }

        if use_first_method && last_gen == generation && retry_count >= 2 {
            // The listing keeps returning a generation that cannot be read.
            use_first_method = false;
        }

        if !use_first_method {
            if lookahead_count < lookahead {
                generation += 1;
                lookahead_count += 1;
                debug!("discovery: look ahead to generation {generation}");
            } else {
                return Err(first_error.unwrap_or_else(|| {
                    QuireError::index_not_found(format!("no readable segments file in {storage:?}"))
                }));
            }
        } else if last_gen == generation {
            retry_count += 1;
        } else {
            retry_count = 0;
        }
        last_gen = generation;

        let file = segments_name(generation)?;
        match body(&file) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_on_discovery() => {
                debug!("discovery: {file} failed: {e}; will retry (retry_count={retry_count})");

                if generation > 1 && use_first_method && retry_count == 1 {
                    let previous = segments_name(generation - 1)?;
                    if storage.file_exists(&previous) {
                        debug!("discovery: fall back to {previous}");
                        match body(&previous) {
                            Ok(value) => return Ok(value),
                            Err(e2) => debug!("discovery: {previous} failed too: {e2}"),
                        }
                    }
                }
                first_error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Newest generation among commit files in `files`, or -1.
pub fn last_commit_generation(files: &[String]) -> i64 {
    files
        .iter()
        .filter(|name| file_names::is_segments_file(name))
        .filter_map(|name| file_names::generation_from_segments_file_name(name).ok())
        .max()
        .unwrap_or(-1)
}

/// Generation recorded in `segments.gen`.
///
/// A missing, short or inconsistent file yields `None`; a complete file with
/// a bad checksum is a [`QuireError::CorruptIndex`].
pub fn read_segments_gen(storage: &dyn Storage) -> Result<Option<i64>> {
    if !storage.file_exists(SEGMENTS_GEN) {
        return Ok(None);
    }
    let size = match storage.file_size(SEGMENTS_GEN) {
        Ok(size) => size,
        Err(e) => {
            debug!("segments.gen unreadable: {e}");
            return Ok(None);
        }
    };
    if size != SEGMENTS_GEN_LENGTH {
        debug!("segments.gen has unexpected length {size}");
        return Ok(None);
    }

    let input = match storage.open_input(SEGMENTS_GEN) {
        Ok(input) => input,
        Err(e) => {
            debug!("segments.gen unreadable: {e}");
            return Ok(None);
        }
    };
    let mut reader = StructReader::new(input)?;
    let format = reader.read_i32()?;
    if format != FORMAT_SEGMENTS_GEN {
        return Err(QuireError::corrupt(format!(
            "segments.gen has unknown format {format}"
        )));
    }
    let gen0 = reader.read_i64()?;
    let gen1 = reader.read_i64()?;
    reader.check_footer()?;

    if gen0 == gen1 {
        Ok(Some(gen0))
    } else {
        debug!("segments.gen is inconsistent: {gen0} vs {gen1}");
        Ok(None)
    }
}

/// Record `generation` in `segments.gen`. Failures only cost discovery a
/// fallback, so the file is removed instead of reported.
fn write_segments_gen(storage: &dyn Storage, generation: i64) {
    let written = (|| -> Result<()> {
        let mut output = StructWriter::new(storage.create_output(SEGMENTS_GEN)?);
        output.write_i32(FORMAT_SEGMENTS_GEN)?;
        output.write_i64(generation)?;
        output.write_i64(generation)?;
        output.write_footer()?;
        output.close()?;
        storage.sync(&[SEGMENTS_GEN.to_string()])
    })();

    if let Err(e) = written {
        warn!("could not write segments.gen for generation {generation}: {e}");
        delete_quietly(storage, SEGMENTS_GEN);
    }
}

fn segments_name(generation: i64) -> Result<String> {
    file_names::segments_file_name(generation)
        .ok_or_else(|| QuireError::invalid_argument(format!("invalid generation {generation}")))
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| QuireError::invalid_operation(format!("{what} {value} overflows")))
}

fn delete_quietly(storage: &dyn Storage, file: &str) {
    if let Err(e) = storage.delete_file(file) {
        debug!("could not delete {file}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::{Codec, SimpleCodec};
    use crate::index::pipeline::Document;
    use crate::index::segment::SegmentInfo;
    use crate::storage::MemoryStorage;

    fn add_segment(storage: &MemoryStorage, catalog: &mut SegmentCatalog, n: usize) -> String {
        let codec = SimpleCodec::new();
        let name = catalog.new_segment_name();
        let docs: Vec<Document> = (0..n).map(|_| Document::new()).collect();
        let files = codec.write_documents(storage, &name, &docs).unwrap();
        let mut info = SegmentInfo::new(name.clone(), n, SimpleCodec::NAME).with_files(files);
        codec.write_segment_info(storage, &mut info).unwrap();
        storage.sync(&info.files.iter().cloned().collect::<Vec<_>>()).unwrap();
        catalog.add(SegmentCommitInfo::fresh(info));
        catalog.changed();
        name
    }

    #[test]
    fn test_commit_and_read() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 3);
        add_segment(&storage, &mut catalog, 2);
        catalog.get_mut("_1").unwrap().set_updates_files(1, BTreeSet::from(["_1_1.upd".to_string()]));
        catalog.set_user_data(BTreeMap::from([("k".to_string(), "v".to_string())]));

        assert_eq!(catalog.commit(&storage).unwrap(), "segments_1");
        assert_eq!(catalog.last_generation(), 1);

        let read = SegmentCatalog::read(&storage).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.last_generation(), 1);
        assert_eq!(read.version(), catalog.version());
        assert_eq!(read.counter(), 2);
        assert_eq!(read.len(), 2);
        assert_eq!(read.total_doc_count(), 5);
        assert_eq!(read.user_data().get("k").map(String::as_str), Some("v"));
        assert_eq!(read.get("_1").unwrap().updates_files().len(), 1);
        assert!(read.files(true).contains("segments_1"));
        assert_eq!(read_segments_gen(&storage).unwrap(), Some(1));
    }

    #[test]
    fn test_generations_increase() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        let mut last = -1;
        for _ in 0..4 {
            add_segment(&storage, &mut catalog, 1);
            catalog.commit(&storage).unwrap();
            assert!(catalog.generation() > last);
            last = catalog.generation();
        }
        assert_eq!(SegmentCatalog::read(&storage).unwrap().generation(), 4);
    }

    #[test]
    fn test_double_prepare_is_rejected() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.prepare_commit(&storage).unwrap();
        let err = catalog.prepare_commit(&storage).unwrap_err();
        assert!(matches!(err, QuireError::InvalidOperation(_)));

        catalog.rollback_commit(&storage);
        assert!(!catalog.has_pending_commit());
        assert!(matches!(
            catalog.finish_commit(&storage),
            Err(QuireError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_crash_between_phases_keeps_previous_commit() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 2);
        catalog.commit(&storage).unwrap();

        add_segment(&storage, &mut catalog, 4);
        catalog.prepare_commit(&storage).unwrap();
        storage.crash();
        drop(catalog);

        let read = SegmentCatalog::read(&storage).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn test_torn_commit_falls_back_to_previous_generation() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 2);
        catalog.commit(&storage).unwrap();

        add_segment(&storage, &mut catalog, 1);
        catalog.prepare_commit(&storage).unwrap();
        // Dropping the pending output publishes the file without its footer.
        drop(catalog);
        assert!(storage.file_exists("segments_2"));

        let read = SegmentCatalog::read(&storage).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.total_doc_count(), 2);
    }

    #[test]
    fn test_rollback_commit_deletes_file() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.prepare_commit(&storage).unwrap();
        catalog.rollback_commit(&storage);
        assert!(!storage.file_exists("segments_1"));
        assert!(matches!(
            SegmentCatalog::read(&storage),
            Err(QuireError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_failed_sync_removes_commit_file() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.prepare_commit(&storage).unwrap();
        storage.set_fail_on_sync(true);
        assert!(catalog.finish_commit(&storage).is_err());
        assert!(!storage.file_exists("segments_1"));
        assert!(!catalog.has_pending_commit());
        assert_eq!(catalog.last_generation(), -1);
    }

    #[test]
    fn test_invalid_deletion_count_is_corrupt() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        let name = add_segment(&storage, &mut catalog, 2);

        let mut output = StructWriter::new(storage.create_output("segments_1").unwrap());
        output.write_header(SEGMENTS, FORMAT).unwrap();
        output.write_i64(1).unwrap();
        output.write_i32(1).unwrap();
        output.write_i32(1).unwrap();
        output.write_string(&name).unwrap();
        output.write_string(SimpleCodec::NAME).unwrap();
        output.write_i64(1).unwrap();
        output.write_i32(3).unwrap();
        output.write_i64(-1).unwrap();
        output.write_i32(0).unwrap();
        output.write_string_map(&BTreeMap::new()).unwrap();
        output.write_footer().unwrap();
        output.close().unwrap();

        let err =
            SegmentCatalog::read_commit(&storage, &CodecRegistry::default(), "segments_1").unwrap_err();
        match err {
            QuireError::CorruptIndex(msg) => assert!(msg.contains("invalid deletion count")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_corrupt_segments_gen_is_reported() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.commit(&storage).unwrap();

        let mut bytes = vec![0u8; SEGMENTS_GEN_LENGTH as usize];
        bytes[..4].copy_from_slice(&FORMAT_SEGMENTS_GEN.to_le_bytes());
        storage.corrupt_file(SEGMENTS_GEN, bytes).unwrap();
        assert!(matches!(
            SegmentCatalog::read(&storage),
            Err(QuireError::CorruptIndex(_))
        ));

        storage.corrupt_file(SEGMENTS_GEN, vec![1, 2, 3]).unwrap();
        assert_eq!(SegmentCatalog::read(&storage).unwrap().generation(), 1);
    }

    #[test]
    fn test_discovery_opens_newest_generation_first() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.commit(&storage).unwrap();
        catalog.commit(&storage).unwrap();
        storage.delete_file("segments_1").unwrap();

        let mut seen = Vec::new();
        let read = find_segments_file(&storage, 0, |file| {
            seen.push(file.to_string());
            SegmentCatalog::read_commit(&storage, &CodecRegistry::default(), file)
        })
        .unwrap();
        assert_eq!(read.generation(), 2);
        assert_eq!(seen, vec!["segments_2"]);
    }

    /// Storage whose listing is frozen, as with a stale network directory cache.
    #[derive(Debug)]
    struct StaleListing {
        inner: MemoryStorage,
        listing: Vec<String>,
    }

    impl Storage for StaleListing {
        fn open_input(&self, name: &str) -> Result<Box<dyn crate::storage::StorageInput>> {
            self.inner.open_input(name)
        }
        fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            self.inner.create_output(name)
        }
        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }
        fn delete_file(&self, name: &str) -> Result<()> {
            self.inner.delete_file(name)
        }
        fn list_files(&self) -> Result<Vec<String>> {
            Ok(self.listing.clone())
        }
        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }
        fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_file(old_name, new_name)
        }
        fn sync(&self, names: &[String]) -> Result<()> {
            self.inner.sync(names)
        }
        fn obtain_lock(&self, name: &str) -> Result<Box<dyn crate::storage::StorageLock>> {
            self.inner.obtain_lock(name)
        }
    }

    #[test]
    fn test_lookahead_finds_unlisted_generation() {
        let inner = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.commit(&inner).unwrap();
        catalog.commit(&inner).unwrap();
        inner.delete_file("segments_1").unwrap();
        inner.delete_file(SEGMENTS_GEN).unwrap();

        let storage = StaleListing {
            inner,
            listing: vec!["segments_1".to_string()],
        };
        let codecs = CodecRegistry::default();

        let read = SegmentCatalog::read_with_lookahead(&storage, &codecs, 1).unwrap();
        assert_eq!(read.generation(), 2);

        let err = SegmentCatalog::read_with_lookahead(&storage, &codecs, 0).unwrap_err();
        assert!(err.is_retryable_on_discovery());
    }

    #[test]
    fn test_apply_merge_changes() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        for _ in 0..4 {
            add_segment(&storage, &mut catalog, 1);
        }
        let merged_name = catalog.new_segment_name();
        let merged =
            SegmentCommitInfo::fresh(SegmentInfo::new(merged_name.clone(), 2, SimpleCodec::NAME));

        let away = BTreeSet::from(["_1".to_string(), "_2".to_string()]);
        catalog.apply_merge_changes(&away, merged.clone(), false);
        let names: Vec<&str> = catalog.segments().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["_0", merged_name.as_str(), "_3"]);

        let mut dropped = catalog.clone();
        let away = BTreeSet::from([merged_name.clone()]);
        dropped.apply_merge_changes(&away, merged.clone(), true);
        assert_eq!(dropped.len(), 2);
        assert!(!dropped.contains(&merged_name));

        // Sources all gone: the merged segment is inserted first.
        let away = BTreeSet::from(["_9".to_string()]);
        catalog.apply_merge_changes(&away, merged, false);
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.index_of(&merged_name), Some(0));
    }

    #[test]
    fn test_clone_drops_pending_commit() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        catalog.prepare_commit(&storage).unwrap();
        let clone = catalog.clone();
        assert!(catalog.has_pending_commit());
        assert!(!clone.has_pending_commit());
        assert_eq!(clone.generation(), 1);
        catalog.rollback_commit(&storage);
    }

    #[derive(Default)]
    struct CountingOwner {
        released: parking_lot::Mutex<Vec<BTreeSet<String>>>,
    }

    impl SnapshotOwner for CountingOwner {
        fn release_snapshot_files(&self, files: &BTreeSet<String>) {
            self.released.lock().push(files.clone());
        }
    }

    #[test]
    fn test_snapshot_pin_released_by_last_clone() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 3);
        let owner = Arc::new(CountingOwner::default());
        let weak: Weak<CountingOwner> = Arc::downgrade(&owner);
        let weak: Weak<dyn SnapshotOwner> = weak;

        let snapshot = CatalogSnapshot::new(catalog, HashMap::new());
        let files = snapshot.files();
        assert!(!files.is_empty());
        let snapshot = snapshot.pinned(files.clone(), weak);
        assert!(snapshot.is_pinned());

        let clone = snapshot.clone();
        drop(snapshot);
        assert!(owner.released.lock().is_empty());
        drop(clone);
        assert_eq!(*owner.released.lock(), vec![files]);
    }
}
