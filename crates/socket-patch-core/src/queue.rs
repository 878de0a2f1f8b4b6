//! In-process FIFO serialization of read-modify-write operations per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::PatchError;

/// Tail of a key's chain: the id of the last submitted operation and the
/// receiver that fires when it finishes.
type Tail = (u64, oneshot::Receiver<()>);

/// Serializes operations that share a logical key (a project directory or a
/// patch UUID) in strict submission order. Operations on different keys run
/// independently.
///
/// Each submission is spawned onto the runtime immediately, so ordering is
/// fixed at call time and a caller that drops the returned future does not
/// interrupt an in-flight write.
#[derive(Debug, Default)]
pub struct OperationQueue {
    tails: Mutex<HashMap<String, Tail>>,
    next_id: AtomicU64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `op` behind every earlier operation on `key`.
    ///
    /// The predecessor's outcome is ignored: a failed or panicked operation
    /// still lets the next one run.
    pub fn run<F, Fut, T>(
        self: &Arc<Self>,
        key: impl Into<String>,
        op: F,
    ) -> impl Future<Output = Result<T, PatchError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PatchError>> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();

        let previous = {
            let mut tails = self.tails.lock().unwrap();
            tails.insert(key.clone(), (id, done_rx))
        };

        let evict = EvictOnDrop {
            queue: Arc::clone(self),
            key,
            id,
        };
        let handle = tokio::spawn(async move {
            // Dropped on return and on unwind alike.
            let _evict = evict;

            if let Some((_, prev_rx)) = previous {
                // Err means the predecessor's sender was dropped, which also
                // marks it finished.
                let _ = prev_rx.await;
            }

            let result = op().await;

            let _ = done_tx.send(());
            result
        });

        async move {
            handle.await.map_err(|e| {
                warn!("Queued operation did not complete: {}", e);
                PatchError::Internal(format!("Queued operation did not complete: {}", e))
            })?
        }
    }

    /// Drop the key's entry if `id` is still its tail.
    fn evict(&self, key: &str, id: u64) {
        let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        if tails.get(key).is_some_and(|(tail_id, _)| *tail_id == id) {
            tails.remove(key);
        }
    }

    /// Number of keys with queued or running operations.
    pub fn pending_keys(&self) -> usize {
        self.tails.lock().unwrap().len()
    }
}

/// Removes a finished operation's tail entry, however the operation ended.
struct EvictOnDrop {
    queue: Arc<OperationQueue>,
    key: String,
    id: u64,
}

impl Drop for EvictOnDrop {
    fn drop(&mut self) {
        self.queue.evict(&self.key, self.id);
    }
}
