//! libSQL/Turso-backed implementation of `memfuse_core::storage::StorageBackend`.
//!
//! Brute-force cosine similarity stands in for an ANN index (schema §3's own
//! sequential-fallback design note): every `search_*` call scans the
//! relevant table and scores rows in process. That keeps the backend honest
//! for the corpus sizes this crate targets without depending on an
//! extension that isn't guaranteed present on every libsql build.

pub mod codec;
pub mod migrations;
pub mod pool;
pub mod schema;
pub mod storage;

pub use storage::TursoStorage;
