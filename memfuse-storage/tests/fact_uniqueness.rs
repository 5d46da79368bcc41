//! `(session_id, type, content)` is unique on structured_memory —
//! identical facts are absorbed at insert, not duplicated (universal
//! invariant 4; E2 "repeated statement" scenario).

use memfuse_core::storage::StorageBackend;
use memfuse_core::types::FactType;
use memfuse_storage::TursoStorage;
use test_utils::test_fact;

#[tokio::test]
async fn identical_fact_is_absorbed_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let storage = TursoStorage::open_local(dir.path().join("facts.db"), 4).await.unwrap();
    let session_id = storage.get_or_create_session("dana").await.unwrap();

    let fact = test_fact(session_id, 0, FactType::Decision, "we will ship on fridays", 1024);

    let first = storage.insert_fact(&fact).await.unwrap();
    assert_eq!(first, Some(fact.fact_id));

    let mut restated = test_fact(session_id, 1, FactType::Decision, "we will ship on fridays", 1024);
    restated.embedding = fact.embedding.clone();
    let second = storage.insert_fact(&restated).await.unwrap();
    assert!(second.is_none());

    let stored = storage.facts_by_session_and_type(session_id, FactType::Decision).await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn same_content_different_type_is_kept_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let storage = TursoStorage::open_local(dir.path().join("facts.db"), 4).await.unwrap();
    let session_id = storage.get_or_create_session("erin").await.unwrap();

    let as_fact = test_fact(session_id, 0, FactType::Fact, "deploys happen on fridays", 1024);
    let as_decision = test_fact(session_id, 0, FactType::Decision, "deploys happen on fridays", 1024);

    assert!(storage.insert_fact(&as_fact).await.unwrap().is_some());
    assert!(storage.insert_fact(&as_decision).await.unwrap().is_some());
}
