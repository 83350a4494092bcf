//! Per-peer serial task queues.
//!
//! Every client connection owns two [`SerialQueue`]s, one per traffic
//! direction. A queue runs its tasks strictly in submission order on a
//! dedicated worker, so delivery order is preserved per peer while a slow
//! or faulty peer never blocks anyone else's traffic.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::trace;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A serial execution queue backed by a dedicated worker task.
///
/// Handles are cheap to clone and share the queue. When the last handle is
/// dropped the worker drains what was already submitted, then exits.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl SerialQueue {
    /// Spawn a new queue and its worker.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(label: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let label = label.into();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
            trace!(queue = %label, "Serial queue drained");
        });

        Self { tx }
    }

    /// Submit a task; it runs after everything submitted before it.
    ///
    /// Returns `false` if the worker is gone.
    pub fn submit(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        self.tx.send(Box::pin(task)).is_ok()
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").finish_non_exhaustive()
    }
}
