//! Background workers and their supervisor.
//!
//! Each worker is one tokio task running an independent poll loop. Workers
//! share no mutable state with each other; everything flows through the
//! file registry and the vector sink. The supervisor exists purely so the
//! host process has a single shutdown hook that cannot hang forever.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod extractor;
pub mod indexer;
pub mod watcher;

pub use extractor::ExtractionWorker;
pub use indexer::{IndexingConfig, IndexingWorker};
pub use watcher::IngestWatcher;

/// Receiving side of a worker's stop signal.
///
/// Workers select on `changed()` alongside their poll timer; the value
/// flips to `true` exactly once, at shutdown.
pub type StopSignal = watch::Receiver<bool>;

/// A named, stoppable worker task.
pub struct WorkerHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(name: &'static str, stop: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { name, stop, handle }
    }

    /// Create the stop channel for a worker about to be spawned.
    pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
        watch::channel(false)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Owns every worker's lifecycle.
///
/// No business logic lives here: workers are registered after spawning and
/// the only operation is a best-effort graceful stop.
#[derive(Default)]
pub struct WorkerSupervisor {
    workers: Vec<WorkerHandle>,
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: WorkerHandle) {
        info!("Registered worker {}", handle.name);
        self.workers.push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal every worker to stop, then join each within the shared
    /// deadline. A worker that does not come back in time is logged and
    /// abandoned, never force-killed.
    pub async fn stop_all(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;

        for worker in &self.workers {
            let _ = worker.stop.send(true);
        }

        for worker in self.workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, worker.handle).await {
                Ok(Ok(())) => info!("Worker {} stopped", worker.name),
                Ok(Err(e)) => warn!("Worker {} terminated abnormally: {}", worker.name, e),
                Err(_) => warn!(
                    "Worker {} did not stop within the shutdown timeout",
                    worker.name
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_all_joins_cooperative_workers() {
        let mut supervisor = WorkerSupervisor::new();

        let (stop_tx, mut stop_rx) = WorkerHandle::stop_channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        });
        supervisor.register(WorkerHandle::new("worker_test", stop_tx, handle));

        supervisor.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_all_abandons_stuck_worker_after_timeout() {
        let mut supervisor = WorkerSupervisor::new();

        let (stop_tx, _stop_rx) = WorkerHandle::stop_channel();
        // Never observes the stop signal
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        supervisor.register(WorkerHandle::new("worker_stuck", stop_tx, handle));

        let started = std::time::Instant::now();
        supervisor.stop_all(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
