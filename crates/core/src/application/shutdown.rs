// Graceful Shutdown Token
//
// Two-stage contract: `shutdown` stops new pop cycles, `hammer` abandons
// whatever is still in flight. Background tasks registered through the token
// are awaited by the sender.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Shutdown signal for graceful termination
#[derive(Clone)]
pub struct ShutdownToken {
    shutdown: CancellationToken,
    hammer: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for shutdown signal
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_hammered(&self) -> bool {
        self.hammer.is_cancelled()
    }

    /// Token cancelled at shutdown-begin (also cancelled by the hammer)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token cancelled once in-flight work must be abandoned
    pub fn hammer_token(&self) -> CancellationToken {
        self.hammer.clone()
    }

    /// Run `future` as a registered background task
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future)
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    shutdown: CancellationToken,
    hammer: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownSender {
    /// Signal shutdown to all workers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Abandon in-flight work
    pub fn hammer(&self) {
        self.hammer.cancel();
    }

    /// Shut down and wait for registered tasks.
    ///
    /// Fires the hammer if they are still running after `grace`. Returns
    /// true when every task finished before the hammer.
    pub async fn shutdown_and_wait(&self, grace: Duration) -> bool {
        self.shutdown();
        self.tasks.close();
        info!(tasks = self.tasks.len(), "Waiting for background tasks");

        tokio::select! {
            _ = self.tasks.wait() => true,
            _ = tokio::time::sleep(grace) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    remaining = self.tasks.len(),
                    "Graceful period elapsed, hammering remaining tasks"
                );
                self.hammer();
                self.tasks.wait().await;
                false
            }
        }
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let hammer = CancellationToken::new();
    let shutdown = hammer.child_token();
    let tasks = TaskTracker::new();
    (
        ShutdownSender {
            shutdown: shutdown.clone(),
            hammer: hammer.clone(),
            tasks: tasks.clone(),
        },
        ShutdownToken {
            shutdown,
            hammer,
            tasks,
        },
    )
}
