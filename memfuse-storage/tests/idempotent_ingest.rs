//! Re-ingesting the same document chunk twice must not duplicate rows
//! (universal invariant 1) — exercises the full E6 "re-run ingestion"
//! scenario against a real libsql file.

use memfuse_core::storage::StorageBackend;
use memfuse_storage::TursoStorage;
use test_utils::test_chunk;

#[tokio::test]
async fn reingesting_identical_content_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let storage = TursoStorage::open_local(dir.path().join("ingest.db"), 4).await.unwrap();

    let chunk = test_chunk("handbook.md", "employees get unlimited pto", 1024);

    let first = storage.upsert_chunk(&chunk).await.unwrap();
    let second = storage.upsert_chunk(&chunk).await.unwrap();
    assert!(first);
    assert!(!second);

    let hits = storage.search_chunks(&chunk.embedding, 10, Some("handbook.md"), false).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn distinct_content_in_the_same_document_is_kept_separately() {
    let dir = tempfile::tempdir().unwrap();
    let storage = TursoStorage::open_local(dir.path().join("ingest.db"), 4).await.unwrap();

    let a = test_chunk("handbook.md", "employees get unlimited pto", 1024);
    let b = test_chunk("handbook.md", "remote work is allowed company-wide", 1024);

    assert!(storage.upsert_chunk(&a).await.unwrap());
    assert!(storage.upsert_chunk(&b).await.unwrap());

    let hits = storage.search_chunks(&a.embedding, 10, Some("handbook.md"), false).await.unwrap();
    assert_eq!(hits.len(), 2);
}
