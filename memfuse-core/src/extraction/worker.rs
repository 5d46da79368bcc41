//! Background worker pool for the durable extraction queue (spec §4.3.1,
//! grounded on spec §5's "non-cancelable background jobs drained on
//! shutdown").

use super::Extractor;
use crate::embeddings::Embedder;
use crate::llm::LanguageModel;
use crate::storage::StorageBackend;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Polls `pending_extractions`, runs jobs through an [`Extractor`], and
/// ensures at most one job per session runs at a time (single-flight,
/// spec §5).
pub struct ExtractionWorkerPool {
    handles: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ExtractionWorkerPool {
    /// Spawn `worker_count` polling tasks sharing one session-level lock
    /// set, polling every `poll_interval`.
    pub fn spawn<E, L, S>(
        extractor: Arc<Extractor<E, L, S>>,
        storage: Arc<S>,
        worker_count: usize,
        poll_interval: Duration,
    ) -> Self
    where
        E: Embedder + 'static,
        L: LanguageModel + 'static,
        S: StorageBackend + 'static,
    {
        let stopping = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let in_flight: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

        let handles = (0..worker_count.max(1))
            .map(|_| {
                let extractor = Arc::clone(&extractor);
                let storage = Arc::clone(&storage);
                let stopping = Arc::clone(&stopping);
                let wake = Arc::clone(&wake);
                let in_flight = Arc::clone(&in_flight);

                tokio::spawn(async move {
                    loop {
                        if stopping.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            () = wake.notified() => {}
                            () = tokio::time::sleep(poll_interval) => {}
                        }

                        if stopping.load(Ordering::Acquire) {
                            break;
                        }

                        let Ok(pending) = storage.pending_extractions(16).await else { continue };

                        for (session_id, round_id) in pending {
                            let claimed = {
                                let mut guard = in_flight.lock();
                                guard.insert(session_id)
                            };
                            if !claimed {
                                continue;
                            }

                            let Ok(rounds) = storage.recent_turns(session_id, 1).await else {
                                in_flight.lock().remove(&session_id);
                                continue;
                            };

                            let result = extractor.extract(session_id, &rounds).await;
                            let succeeded = result.is_ok();
                            let _ = storage.complete_extraction(session_id, round_id, succeeded).await;
                            if succeeded {
                                let _ = storage.set_last_extracted_round(session_id, round_id).await;
                            }

                            in_flight.lock().remove(&session_id);
                        }
                    }
                })
            })
            .collect();

        Self { handles, stopping, wake }
    }

    /// Signal all workers to stop after their current poll iteration and
    /// wait for them to drain — no in-flight job is cancelled mid-way.
    pub async fn shutdown(self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify_waiters();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
