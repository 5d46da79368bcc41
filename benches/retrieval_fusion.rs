//! Benchmarks the Retriever's brute-force vector/keyword fusion against an
//! in-memory store at a handful of corpus sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memfuse_core::config::MemFuseConfig;
use memfuse_core::embeddings::MockEmbedder;
use memfuse_core::retrieval::{RetrieveRequest, Retriever};
use memfuse_core::types::FactType;
use std::sync::Arc;
use test_utils::{test_fact, InMemoryStorage};
use uuid::Uuid;

fn bench_retrieve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("retrieve");

    for corpus_size in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(corpus_size), &corpus_size, |b, &size| {
            let embedder = Arc::new(MockEmbedder::new(1024));
            let storage = Arc::new(InMemoryStorage::default());
            let session_id = Uuid::new_v4();

            rt.block_on(async {
                for i in 0..size {
                    let fact = test_fact(session_id, i as i64, FactType::Fact, &format!("fact number {i}"), 1024);
                    storage.insert_fact(&fact).await.unwrap();
                }
            });

            let retriever = Retriever::new(Arc::clone(&embedder), Arc::clone(&storage), MemFuseConfig::default());
            let request = RetrieveRequest {
                session_id: Some(session_id),
                ..RetrieveRequest::new("what do we know about fact number 42")
            };

            b.to_async(&rt).iter(|| async { black_box(retriever.retrieve(&request).await.unwrap()) });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_retrieve);
criterion_main!(benches);
