//! Criterion benchmarks for the Quire write path.
//!
//! - Delete queue throughput, single and multi threaded
//! - Indexing with periodic commits into memory storage
//! - Forced merges of small segments

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;

use quire::index::delete_queue::DeleteQueue;
use quire::index::pipeline::Document;
use quire::index::{DocValue, DocValuesUpdate, Term};
use quire::merge::{NoMergePolicy, SerialMergeScheduler, TieredMergePolicy, TieredMergePolicyConfig};
use quire::storage::MemoryStorage;
use quire::writer::{IndexWriter, IndexWriterConfig};

/// Random `id` terms drawn from `0..range`.
fn generate_terms(count: usize, range: usize) -> Vec<Term> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| Term::new("id", rng.random_range(0..range).to_string()))
        .collect()
}

fn generate_documents(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            Document::new()
                .with_term("id", i.to_string())
                .with_term("body", format!("word{}", i % 97))
                .with_numeric("rank", i as i64)
        })
        .collect()
}

fn manual_config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy::new()))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
        .with_compound_file(false)
}

fn bench_delete_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete_queue");
    let terms = generate_terms(10_000, 1_000_000);

    group.throughput(Throughput::Elements(terms.len() as u64));
    group.bench_function("add_delete_and_freeze", |b| {
        b.iter(|| {
            let queue = DeleteQueue::new();
            for term in &terms {
                queue.add_delete(vec![term.clone()]);
            }
            black_box(queue.freeze_global_buffer(None))
        })
    });

    group.throughput(Throughput::Elements(terms.len() as u64));
    group.bench_function("slices_follow_updates", |b| {
        b.iter(|| {
            let queue = DeleteQueue::new();
            let mut slice = queue.new_slice();
            for (i, term) in terms.iter().enumerate() {
                if i % 3 == 0 {
                    queue.add_update(DocValuesUpdate::new(
                        term.clone(),
                        "rank",
                        DocValue::Numeric(i as i64),
                    ));
                } else {
                    queue.add_term_to_slice(term.clone(), &mut slice);
                }
                if i % 64 == 0 {
                    queue.update_slice(&mut slice);
                }
            }
            black_box(queue.freeze_global_buffer(Some(&mut slice)))
        })
    });

    let per_thread = terms.len() / 4;
    group.throughput(Throughput::Elements((per_thread * 4) as u64));
    group.bench_function("concurrent_add_delete", |b| {
        b.iter(|| {
            let queue = Arc::new(DeleteQueue::new());
            let handles: Vec<_> = terms
                .chunks(per_thread)
                .take(4)
                .map(|chunk| {
                    let queue = Arc::clone(&queue);
                    let chunk = chunk.to_vec();
                    thread::spawn(move || {
                        for term in chunk {
                            queue.add_delete(vec![term]);
                        }
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.join();
            }
            black_box(queue.num_global_term_deletes())
        })
    });

    group.finish();
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    group.sample_size(20);
    let docs = generate_documents(2_000);

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("add_and_commit", |b| {
        b.iter(|| {
            let storage = Arc::new(MemoryStorage::default());
            let writer = IndexWriter::open(storage, manual_config().with_max_buffered_docs(500))
                .unwrap();
            for (i, doc) in docs.iter().enumerate() {
                writer.add_document(doc.clone()).unwrap();
                if i % 700 == 0 {
                    writer.commit().unwrap();
                }
            }
            writer.close().unwrap();
            black_box(writer.flush_count())
        })
    });

    let deletes = generate_terms(500, docs.len());
    group.throughput(Throughput::Elements((docs.len() + deletes.len()) as u64));
    group.bench_function("add_delete_commit", |b| {
        b.iter(|| {
            let storage = Arc::new(MemoryStorage::default());
            let writer = IndexWriter::open(storage, manual_config().with_max_buffered_docs(500))
                .unwrap();
            for doc in &docs {
                writer.add_document(doc.clone()).unwrap();
            }
            writer.delete_documents(deletes.clone()).unwrap();
            writer.commit().unwrap();
            let live = writer.num_docs();
            writer.close().unwrap();
            black_box(live)
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);
    let docs = generate_documents(1_000);

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("force_merge_ten_segments", |b| {
        b.iter_with_setup(
            || {
                let policy = TieredMergePolicy::new(TieredMergePolicyConfig {
                    use_compound_file: false,
                    ..Default::default()
                })
                .unwrap();
                let config = IndexWriterConfig::default()
                    .with_merge_policy(Arc::new(policy))
                    .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
                    .with_max_buffered_docs(100);
                let writer =
                    IndexWriter::open(Arc::new(MemoryStorage::default()), config).unwrap();
                for doc in &docs {
                    writer.add_document(doc.clone()).unwrap();
                }
                writer.flush(false, true).unwrap();
                writer
            },
            |writer| {
                writer.force_merge(1, true).unwrap();
                black_box(writer.segment_count());
                writer.rollback().unwrap();
            },
        )
    });

    group.finish();
}

criterion_group!(benches, bench_delete_queue, bench_indexing, bench_merge);

criterion_main!(benches);
