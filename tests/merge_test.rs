mod common;

use std::sync::Arc;
use std::thread;

use quire::index::SegmentCatalog;
use quire::index::file_names::from_radix36;
use quire::merge::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, NoMergePolicy, OneMerge,
    SerialMergeScheduler, TieredMergePolicy, TieredMergePolicyConfig,
};
use quire::index::CatalogSnapshot;
use quire::storage::{MemoryStorage, Storage};
use quire::writer::{IndexWriter, IndexWriterConfig};

use common::{DelayingCodec, count_live, doc, id, live_numeric_values, manual_config, open_reader};

fn add_segment(writer: &IndexWriter, ids: std::ops::Range<usize>) {
    for i in ids {
        writer.add_document(doc(i)).unwrap();
    }
    writer.flush(false, false).unwrap();
}

fn tiered() -> Arc<TieredMergePolicy> {
    Arc::new(
        TieredMergePolicy::new(TieredMergePolicyConfig {
            use_compound_file: false,
            ..Default::default()
        })
        .unwrap(),
    )
}

#[test]
fn test_changes_during_merge_are_carried_over() {
    common::init_logging();
    let storage = Arc::new(MemoryStorage::default());
    let (codec, gate) = DelayingCodec::new();
    let config = IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_compound_file(false)
        .with_codec(codec);
    let writer = IndexWriter::open(storage.clone(), config).unwrap();
    add_segment(&writer, 0..5);
    add_segment(&writer, 5..10);

    let merge = OneMerge::new(writer.segments());
    assert!(writer.register_merge(&merge).unwrap());
    let running = writer.next_merge().unwrap();
    let merging = {
        let writer = writer.clone();
        thread::spawn(move || writer.run_merge(&running))
    };
    gate.entered.recv().unwrap();

    writer.delete_documents(vec![id(3)]).unwrap();
    writer.update_numeric_doc_value(id(7), "rank", 700).unwrap();
    writer.flush(false, true).unwrap();
    assert_eq!(writer.segment_count(), 2);

    gate.release.send(()).unwrap();
    merging.join().unwrap().unwrap();

    assert_eq!(writer.segment_count(), 1);
    assert!(writer.merging_segments().is_empty());
    assert_eq!(writer.num_docs(), 9);
    writer.commit().unwrap();

    let snapshot = writer.nrt_snapshot(true).unwrap();
    assert_eq!(snapshot.num_docs(), 9);
    assert_eq!(count_live(storage.as_ref(), &snapshot, &id(3)), 0);
    assert_eq!(
        live_numeric_values(storage.as_ref(), &snapshot, &id(7), "rank"),
        vec![700]
    );
    writer.close().unwrap();
}

#[test]
fn test_merging_segments_are_exclusive() {
    let storage = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    for i in 0..4 {
        add_segment(&writer, i * 2..i * 2 + 2);
    }
    let segments = writer.segments();

    let left = OneMerge::new(segments[0..2].to_vec());
    let right = OneMerge::new(segments[2..4].to_vec());
    let straddling = OneMerge::new(segments[1..3].to_vec());
    assert!(writer.register_merge(&left).unwrap());
    assert!(writer.register_merge(&right).unwrap());
    assert!(!writer.register_merge(&straddling).unwrap());
    assert_eq!(writer.merging_segments().len(), 4);

    while let Some(merge) = writer.next_merge() {
        writer.run_merge(&merge).unwrap();
    }
    assert_eq!(writer.segment_count(), 2);
    assert_eq!(writer.max_doc(), 8);
    assert!(writer.merging_segments().is_empty());
    writer.close().unwrap();
}

#[test]
fn test_force_merge_with_concurrent_scheduler() {
    let storage = Arc::new(MemoryStorage::default());
    let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
        max_thread_count: 2,
        ..Default::default()
    });
    let config = IndexWriterConfig::default()
        .with_merge_policy(tiered())
        .with_merge_scheduler(Arc::new(scheduler));
    let writer = IndexWriter::open(storage.clone(), config).unwrap();
    for i in 0..3 {
        add_segment(&writer, i * 10..i * 10 + 10);
    }
    assert_eq!(writer.segment_count(), 3);

    writer.force_merge(1, true).unwrap();
    assert_eq!(writer.segment_count(), 1);
    assert_eq!(writer.max_doc(), 30);
    writer.close().unwrap();

    let catalog = SegmentCatalog::read(storage.as_ref()).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog.total_doc_count(), 30);
}

#[test]
fn test_force_merge_deletes_drops_deleted_documents() {
    let storage = Arc::new(MemoryStorage::default());
    let config = IndexWriterConfig::default()
        .with_merge_policy(tiered())
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()));
    let writer = IndexWriter::open(storage.clone(), config).unwrap();
    add_segment(&writer, 0..10);
    add_segment(&writer, 10..20);
    writer
        .delete_documents((0..5).map(id).collect())
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.max_doc(), 20);

    writer.force_merge_deletes(true).unwrap();
    assert_eq!(writer.max_doc(), 15);
    assert_eq!(writer.num_docs(), 15);
    assert!(writer.segments().iter().all(|record| !record.has_deletions()));
    writer.close().unwrap();
}

#[test]
fn test_segment_names_stay_below_counter() {
    let storage = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    for i in 0..5 {
        add_segment(&writer, i * 3..i * 3 + 3);
    }
    let merge = OneMerge::new(writer.segments()[1..4].to_vec());
    assert!(writer.register_merge(&merge).unwrap());
    let merge = writer.next_merge().unwrap();
    writer.run_merge(&merge).unwrap();
    writer.close().unwrap();

    let catalog = SegmentCatalog::read(storage.as_ref()).unwrap();
    assert_eq!(catalog.len(), 3);
    let counter = catalog.counter() as u64;
    for record in catalog.segments() {
        let suffix = from_radix36(record.name().trim_start_matches('_')).unwrap();
        assert!(suffix < counter, "{} vs counter {counter}", record.name());
    }
}

#[test]
fn test_rollback_aborts_pending_merges() {
    let storage = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    add_segment(&writer, 0..3);
    add_segment(&writer, 3..6);
    writer.commit().unwrap();

    let merge = OneMerge::new(writer.segments());
    assert!(writer.register_merge(&merge).unwrap());
    writer.rollback().unwrap();
    assert!(merge.is_aborted());
    assert_eq!(SegmentCatalog::read(storage.as_ref()).unwrap().len(), 2);
}

#[test]
fn test_snapshot_keeps_files_of_merged_segments() {
    common::init_logging();
    let storage = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    add_segment(&writer, 0..5);
    add_segment(&writer, 5..10);
    writer.delete_documents(vec![id(2)]).unwrap();

    let snapshot = writer.nrt_snapshot(true).unwrap();
    assert!(snapshot.is_pinned());
    let old_files = snapshot.files();
    assert!(!old_files.is_empty());

    let merge = OneMerge::new(writer.segments());
    assert!(writer.register_merge(&merge).unwrap());
    let merge = writer.next_merge().unwrap();
    writer.run_merge(&merge).unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.segment_count(), 1);
    assert!(
        writer
            .segments()
            .iter()
            .all(|record| snapshot.catalog.get(record.name()).is_none())
    );

    for file in &old_files {
        assert!(storage.file_exists(file), "{file} removed under a live snapshot");
    }
    assert_eq!(snapshot.num_docs(), 9);
    for i in 0..10 {
        assert_eq!(count_live(storage.as_ref(), &snapshot, &id(i)), usize::from(i != 2), "id {i}");
    }

    let clone = snapshot.clone();
    drop(snapshot);
    assert!(old_files.iter().all(|file| storage.file_exists(file)));
    drop(clone);
    for file in &old_files {
        assert!(!storage.file_exists(file), "{file} outlived its last snapshot");
    }
    writer.close().unwrap();
}

#[test]
fn test_snapshot_after_close_leaves_files() {
    let storage = Arc::new(MemoryStorage::default());
    let writer = IndexWriter::open(storage.clone(), manual_config()).unwrap();
    add_segment(&writer, 0..3);
    let snapshot = writer.nrt_snapshot(true).unwrap();
    let files = snapshot.files();
    writer.close().unwrap();

    drop(snapshot);
    assert!(files.iter().all(|file| storage.file_exists(file)));
    assert_eq!(SegmentCatalog::read(storage.as_ref()).unwrap().total_doc_count(), 3);
}

fn check_snapshot(storage: &dyn Storage, snapshot: &CatalogSnapshot) {
    let mut live = 0;
    for record in snapshot.catalog.segments() {
        let reader = open_reader(storage, record);
        assert_eq!(reader.max_doc(), record.doc_count());
        live += (0..reader.max_doc())
            .filter(|&doc| snapshot.is_live(record.name(), doc))
            .count();
    }
    assert_eq!(live, snapshot.num_docs());
}

#[test]
fn test_snapshots_during_background_merges() {
    common::init_logging();
    let storage = Arc::new(MemoryStorage::default());
    let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
        max_merge_at_once: 2,
        segments_per_tier: 2.0,
        floor_segment_mb: 0.001,
        use_compound_file: false,
        ..Default::default()
    })
    .unwrap();
    let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
        max_thread_count: 2,
        max_merge_count: 4,
        ..Default::default()
    });
    let config = IndexWriterConfig::default()
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(Arc::new(scheduler))
        .with_compound_file(false)
        .with_max_buffered_docs(5);
    let writer = IndexWriter::open(storage.clone(), config).unwrap();

    let indexer = {
        let writer = writer.clone();
        thread::spawn(move || {
            for i in 0..300 {
                writer.add_document(doc(i)).unwrap();
                if i % 3 == 0 {
                    writer.delete_documents(vec![id(i)]).unwrap();
                }
            }
        })
    };

    let mut checked = 0;
    while !indexer.is_finished() || checked < 5 {
        let snapshot = writer.nrt_snapshot(true).unwrap();
        check_snapshot(storage.as_ref(), &snapshot);
        checked += 1;
    }
    indexer.join().unwrap();

    writer.wait_for_merges().unwrap();
    let snapshot = writer.nrt_snapshot(true).unwrap();
    check_snapshot(storage.as_ref(), &snapshot);
    assert_eq!(snapshot.num_docs(), 200);
    assert_eq!(count_live(storage.as_ref(), &snapshot, &id(3)), 0);
    assert_eq!(count_live(storage.as_ref(), &snapshot, &id(4)), 1);
    drop(snapshot);
    writer.close().unwrap();
}
