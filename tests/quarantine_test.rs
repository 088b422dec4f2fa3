mod common;

use std::sync::Arc;

use quire::error::QuireError;
use quire::index::SegmentCatalog;
use quire::merge::{NoMergePolicy, SerialMergeScheduler};
use quire::storage::MemoryStorage;
use quire::writer::{IndexWriter, IndexWriterConfig, OpenMode, WriterState};

use common::{OomCodec, doc, manual_config};

fn oom_writer(storage: &Arc<MemoryStorage>, codec: &Arc<OomCodec>) -> IndexWriter {
    let config = IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_compound_file(false)
        .with_codec(codec.clone());
    IndexWriter::open(storage.clone(), config).unwrap()
}

#[test]
fn test_out_of_memory_quarantines_writer() {
    common::init_logging();
    let storage = Arc::new(MemoryStorage::default());
    let codec = Arc::new(OomCodec::default());
    let writer = oom_writer(&storage, &codec);
    for i in 0..3 {
        writer.add_document(doc(i)).unwrap();
    }
    writer.commit().unwrap();

    codec.arm();
    writer.add_document(doc(3)).unwrap();
    let flushed = writer.flush(false, true);
    assert!(matches!(flushed, Err(QuireError::OutOfMemory(_))));
    assert_eq!(codec.failures(), 1);
    assert_eq!(writer.state(), WriterState::Quarantined);

    assert!(matches!(
        writer.add_document(doc(4)),
        Err(QuireError::Quarantined(_))
    ));
    assert!(matches!(writer.commit(), Err(QuireError::Quarantined(_))));
    assert!(matches!(
        writer.force_merge(1, true),
        Err(QuireError::Quarantined(_))
    ));

    // Close rolls back instead of committing.
    writer.close().unwrap();
    assert_eq!(writer.state(), WriterState::Closed);

    let catalog = SegmentCatalog::read(storage.as_ref()).unwrap();
    assert_eq!(catalog.generation(), 1);
    assert_eq!(catalog.total_doc_count(), 3);

    let reopened = IndexWriter::open(
        storage.clone(),
        manual_config().with_open_mode(OpenMode::Append),
    )
    .unwrap();
    assert_eq!(reopened.max_doc(), 3);
    reopened.close().unwrap();
}

#[test]
fn test_rollback_of_quarantined_writer_releases_lock() {
    let storage = Arc::new(MemoryStorage::default());
    let codec = Arc::new(OomCodec::default());
    let writer = oom_writer(&storage, &codec);
    codec.arm();
    writer.add_document(doc(1)).unwrap();
    assert!(writer.commit().is_err());
    assert_eq!(writer.state(), WriterState::Quarantined);

    writer.rollback().unwrap();
    assert!(matches!(
        writer.add_document(doc(2)),
        Err(QuireError::AlreadyClosed(_))
    ));

    // Nothing was ever committed, but the lock is free again.
    let next = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    assert_eq!(next.max_doc(), 0);
    next.close().unwrap();
}
