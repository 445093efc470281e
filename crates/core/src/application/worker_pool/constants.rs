// Worker pool constants (no magic values)
use std::time::Duration;

/// How long a push waits for room in a full queue (5s)
pub const PUSH_BLOCK_TIME: Duration = Duration::from_secs(5);

/// Longest wait for more items before a partial batch is handed over (5s)
pub const BATCH_FILL_WAIT: Duration = PUSH_BLOCK_TIME;

/// Pause before requeueing a batch the handler could not process at all (10s)
pub const UNHANDLED_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Sleep when the backend yields nothing without blocking (100ms)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Default grace period for `shutdown_wait` callers (5s)
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
