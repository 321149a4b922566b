use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context handed to a background task on each run.
pub struct Context {
    pub task_name: &'static str,
    pub shutdown: broadcast::Receiver<()>,
}

/// A periodic background task: eviction passes, monitoring sweeps.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one run
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Drives registered background tasks until shutdown.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ctx = Context {
                            task_name: task.name(),
                            shutdown: shutdown_rx.resubscribe(),
                        };
                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(task = task.name(), error = %e, "background task failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "background task stopping");
                        break;
                    }
                }
            }
        });

        self.tasks.lock().expect("scheduler poisoned").push(handle);
    }

    /// Signal every task to stop and wait for them to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<_> = self.tasks.lock()?.drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
