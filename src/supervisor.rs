//! Task supervision.
//!
//! Every long-lived task (feeder ingest loops, the engine tick loop, the
//! logger flush timer) is spawned through the supervisor, which keeps the
//! join handle and a shared shutdown signal. Nothing is fire-and-forget:
//! shutdown flips the signal and joins each task with a bounded grace period.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A receiver that resolves `changed()` once shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a task and retain its handle for shutdown joining.
    pub fn spawn<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.handles.lock().push((name.to_string(), handle));
    }

    /// Flip the shutdown signal without waiting for tasks.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and join every task, aborting any that overrun the
    /// per-task grace period.
    pub async fn shutdown(self, grace: Duration) {
        self.signal_shutdown();

        let handles = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!(task = %name, "task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "task panicked during shutdown"),
                Err(_) => {
                    warn!(task = %name, grace_secs = grace.as_secs(), "task overran shutdown grace; aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_observe_shutdown_and_join() {
        let supervisor = Supervisor::new();
        let mut rx = supervisor.subscribe();
        supervisor.spawn("waiter", async move {
            let _ = rx.changed().await;
        });

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn overrunning_task_does_not_hang_shutdown() {
        let supervisor = Supervisor::new();
        supervisor.spawn("stubborn", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = std::time::Instant::now();
        supervisor.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
