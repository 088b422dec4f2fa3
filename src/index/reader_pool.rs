//! Pool of per-segment [`ReadersAndUpdates`].
//!
//! Exactly one state object exists per live segment. The pool holds one
//! reference of its own; users take more with [`ReaderPool::get`] and give
//! them back with [`ReaderPool::release`]. Unless reader pooling is on, a
//! state whose count drops back to the pool's own reference is torn down
//! immediately, after writing its pending deletes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{QuireError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::codec::CodecRegistry;
use crate::index::readers::ReadersAndUpdates;
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Storage;
use crate::util::bits::LiveDocs;

/// Mutex-guarded map from segment name to its state.
#[derive(Debug)]
pub struct ReaderPool {
    readers: Mutex<HashMap<String, ReadersAndUpdates>>,
    pooling: AtomicBool,
    storage: Arc<dyn Storage>,
    codecs: CodecRegistry,
}

impl ReaderPool {
    pub fn new(storage: Arc<dyn Storage>, codecs: CodecRegistry, pooling: bool) -> Self {
        ReaderPool {
            readers: Mutex::new(HashMap::new()),
            pooling: AtomicBool::new(pooling),
            storage,
            codecs,
        }
    }

    pub fn is_pooling(&self) -> bool {
        self.pooling.load(Ordering::Acquire)
    }

    /// Keep states alive between uses, as near-real-time readers need.
    pub fn enable_pooling(&self) {
        self.pooling.store(true, Ordering::Release);
    }

    /// Whether a state exists for `segment`.
    pub fn contains(&self, segment: &str) -> bool {
        self.readers.lock().contains_key(segment)
    }

    /// Number of pooled states.
    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }

    /// Take a reference to `record`'s state, creating it if `create`.
    ///
    /// Returns false, without taking a reference, when the state is absent
    /// and `create` is false.
    pub fn get(&self, record: &SegmentCommitInfo, create: bool) -> Result<bool> {
        let mut readers = self.readers.lock();
        if !readers.contains_key(record.name()) {
            if !create {
                return Ok(false);
            }
            let codec = self.codecs.get(&record.info().codec)?;
            readers.insert(
                record.name().to_string(),
                ReadersAndUpdates::new(Arc::clone(&self.storage), codec),
            );
        }
        if let Some(rld) = readers.get_mut(record.name()) {
            rld.inc_ref();
        }
        Ok(true)
    }

    /// Give back a reference taken with [`ReaderPool::get`].
    ///
    /// Returns true when releasing wrote a live-docs file; the caller must
    /// then checkpoint so the new file is tracked. `record` is `None` for
    /// segments that already left the catalog; their pending changes are
    /// discarded and the state goes as soon as nobody else holds it.
    pub fn release(&self, segment: &str, record: Option<&mut SegmentCommitInfo>) -> Result<bool> {
        let mut readers = self.readers.lock();
        let Some(rld) = readers.get_mut(segment) else {
            return Ok(false);
        };
        rld.dec_ref();

        let Some(record) = record else {
            if rld.ref_count() <= 1 {
                rld.drop_changes();
                rld.drop_readers();
                readers.remove(segment);
            }
            return Ok(false);
        };

        if self.is_pooling() || rld.ref_count() > 1 {
            return Ok(false);
        }

        let written = rld.write_live_docs(record)?;
        rld.drop_readers();
        readers.remove(segment);
        Ok(written)
    }

    /// Run `f` on `record`'s state between a `get` and a `release`.
    ///
    /// The second element of the result is the `release` flag.
    pub fn with_handle<R, F>(&self, record: &mut SegmentCommitInfo, f: F) -> Result<(R, bool)>
    where
        F: FnOnce(&mut ReadersAndUpdates, &mut SegmentCommitInfo) -> Result<R>,
    {
        self.get(record, true)?;
        let name = record.name().to_string();
        let outcome = match self.with(&name, |rld| f(rld, record)) {
            Some(outcome) => outcome,
            None => Err(QuireError::other(format!("reader state for {name} vanished"))),
        };
        match outcome {
            Ok(value) => {
                let written = self.release(&name, Some(record))?;
                Ok((value, written))
            }
            Err(e) => {
                // Keep the original error; the release is best effort here.
                if let Err(release_error) = self.release(&name, Some(record)) {
                    warn!("release of {name} failed after error: {release_error}");
                }
                Err(e)
            }
        }
    }

    /// Run `f` on an existing state without touching its references.
    pub fn with<R>(&self, segment: &str, f: impl FnOnce(&mut ReadersAndUpdates) -> R) -> Option<R> {
        self.readers.lock().get_mut(segment).map(f)
    }

    /// Deletes applied to `record` so far, pending ones included.
    pub fn num_deleted_docs(&self, record: &SegmentCommitInfo) -> usize {
        let pending = self
            .with(record.name(), |rld| rld.pending_delete_count())
            .unwrap_or(0);
        record.del_count() + pending
    }

    /// Current live docs of `record`, pending deletes included.
    pub fn live_docs_snapshot(&self, record: &SegmentCommitInfo) -> Result<LiveDocs> {
        if let Some(snapshot) = self.with(record.name(), |rld| rld.read_only_live_docs(record)) {
            return snapshot;
        }
        let codec = self.codecs.get(&record.info().codec)?;
        codec.read_live_docs(self.storage.as_ref(), record)
    }

    /// Tear down one state without writing anything.
    pub fn drop_segment(&self, segment: &str) {
        if let Some(mut rld) = self.readers.lock().remove(segment) {
            rld.drop_readers();
        }
    }

    /// Tear down every state. With `do_save` pending deletes are written
    /// first, otherwise they are discarded.
    ///
    /// Every state is dropped even if one fails; the first error is returned.
    /// The boolean is true when live-docs files were written.
    pub fn drop_all(&self, do_save: bool, catalog: &mut SegmentCatalog) -> Result<bool> {
        let mut readers = self.readers.lock();
        let mut first_error = None;
        let mut written = false;

        for (name, mut rld) in readers.drain() {
            if do_save {
                if let Some(record) = catalog.get_mut(&name) {
                    match rld.write_live_docs(record) {
                        Ok(w) => written |= w,
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
            } else {
                rld.drop_changes();
            }
            rld.drop_readers();
        }

        debug!("dropped all pooled readers (save={do_save})");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Write pending deletes of every catalog segment, keeping the states.
    ///
    /// Returns true when any live-docs file was written.
    pub fn commit(&self, catalog: &mut SegmentCatalog) -> Result<bool> {
        let mut readers = self.readers.lock();
        let mut written = false;
        for record in catalog.segments_mut() {
            if let Some(rld) = readers.get_mut(record.name()) {
                debug_assert!(rld.verify_doc_counts(record));
                written |= rld.write_live_docs(record)?;
            }
        }
        Ok(written)
    }

    /// Whether any pooled state holds unwritten deletes.
    pub fn any_pending_deletes(&self) -> bool {
        self.readers
            .lock()
            .values()
            .any(|rld| rld.pending_delete_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::{Codec, SimpleCodec};
    use crate::index::pipeline::Document;
    use crate::index::segment::SegmentInfo;
    use crate::storage::MemoryStorage;

    fn record(storage: &MemoryStorage, name: &str, n: usize) -> SegmentCommitInfo {
        let codec = SimpleCodec::new();
        let docs: Vec<Document> = (0..n).map(|_| Document::new()).collect();
        let files = codec.write_documents(storage, name, &docs).unwrap();
        SegmentCommitInfo::fresh(SegmentInfo::new(name, n, SimpleCodec::NAME).with_files(files))
    }

    fn pool(storage: &Arc<MemoryStorage>, pooling: bool) -> ReaderPool {
        ReaderPool::new(storage.clone(), CodecRegistry::default(), pooling)
    }

    #[test]
    fn test_get_without_create() {
        let storage = Arc::new(MemoryStorage::new_default());
        let pool = pool(&storage, true);
        let seg = record(&storage, "_0", 2);

        assert!(!pool.get(&seg, false).unwrap());
        assert!(pool.is_empty());
        assert!(pool.get(&seg, true).unwrap());
        assert!(pool.get(&seg, false).unwrap());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.with("_0", |rld| rld.ref_count()), Some(3));
    }

    #[test]
    fn test_release_without_pooling_writes_and_drops() {
        let storage = Arc::new(MemoryStorage::new_default());
        let pool = pool(&storage, false);
        let mut seg = record(&storage, "_0", 3);

        let ((), written) = pool
            .with_handle(&mut seg, |rld, record| {
                rld.init_writable_live_docs(record)?;
                rld.delete(record, 0)?;
                Ok(())
            })
            .unwrap();

        assert!(written);
        assert!(!pool.contains("_0"));
        assert_eq!(seg.del_count(), 1);
        assert!(storage.file_exists("_0_1.liv"));
    }

    #[test]
    fn test_release_with_pooling_keeps_state() {
        let storage = Arc::new(MemoryStorage::new_default());
        let pool = pool(&storage, true);
        let mut seg = record(&storage, "_0", 3);

        let (_, written) = pool
            .with_handle(&mut seg, |rld, record| rld.delete(record, 2))
            .unwrap();
        assert!(!written);
        assert!(pool.any_pending_deletes());
        assert_eq!(pool.num_deleted_docs(&seg), 1);
        assert!(!pool.live_docs_snapshot(&seg).unwrap().is_live(2));
    }

    #[test]
    fn test_commit_and_drop_all() {
        let storage = Arc::new(MemoryStorage::new_default());
        let pool = pool(&storage, true);
        let mut catalog = SegmentCatalog::new();
        catalog.add(record(&storage, "_0", 2));
        catalog.add(record(&storage, "_1", 2));

        for name in ["_0", "_1"] {
            let seg = catalog.get_mut(name).unwrap();
            pool.with_handle(seg, |rld, record| rld.delete(record, 1))
                .unwrap();
        }

        assert!(pool.commit(&mut catalog).unwrap());
        assert_eq!(catalog.get("_0").unwrap().del_count(), 1);
        assert!(!pool.any_pending_deletes());
        assert_eq!(pool.len(), 2);

        pool.with_handle(catalog.get_mut("_1").unwrap(), |rld, record| rld.delete(record, 0))
            .unwrap();
        assert!(!pool.drop_all(false, &mut catalog).unwrap());
        assert!(pool.is_empty());
        assert_eq!(catalog.get("_1").unwrap().del_count(), 1);
    }
}
