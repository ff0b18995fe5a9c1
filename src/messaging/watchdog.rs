use crate::core::{CommandError, Result};
use crate::engine::context::SharedContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

/// Per-correlation-id synchronization object releasing a blocked submitter.
///
/// The response loop hands it the final context and signals completion; the
/// submitting caller blocks on [`Self::await_result`] until then or until
/// the timeout elapses — it never hangs indefinitely.
pub struct MessageProgressWatchdog {
    correlation_id: Uuid,
    slot: Mutex<Option<SharedContext>>,
    completed: AtomicBool,
    done: Notify,
}

impl MessageProgressWatchdog {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            slot: Mutex::new(None),
            completed: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Stores the final context. Called by the response loop before
    /// signaling completion.
    pub fn set_result(&self, ctx: SharedContext) -> Result<()> {
        *self.slot.lock()? = Some(ctx);
        Ok(())
    }

    /// Signals the submitting caller that its result is ready.
    pub fn message_processing_is_done(&self) {
        self.completed.store(true, Ordering::Release);
        self.done.notify_one();
    }

    pub fn is_done(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Blocks until the response loop signals, or fails with a typed
    /// timeout once `limit` elapses.
    pub async fn await_result(&self, limit: Duration) -> Result<SharedContext> {
        if !self.is_done() {
            // notify_one stores a permit, so a signal racing this wait is
            // not lost.
            if timeout(limit, self.done.notified()).await.is_err() && !self.is_done() {
                return Err(CommandError::WatchdogTimeout(self.correlation_id));
            }
        }
        self.slot.lock()?.take().ok_or_else(|| {
            CommandError::Execution(format!(
                "watchdog {} signaled without a result",
                self.correlation_id
            ))
        })
    }
}

/// Map of outstanding correlation ids to their watchdogs.
///
/// Lookup is exact and order-independent: a response is routed to its own
/// watchdog no matter how responses interleave across correlations.
#[derive(Default)]
pub struct WatchdogRegistry {
    watchdogs: Mutex<HashMap<Uuid, Arc<MessageProgressWatchdog>>>,
}

impl WatchdogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and tracks a watchdog for a freshly submitted message.
    pub fn register(&self, correlation_id: Uuid) -> Result<Arc<MessageProgressWatchdog>> {
        let watchdog = Arc::new(MessageProgressWatchdog::new(correlation_id));
        self.watchdogs
            .lock()?
            .insert(correlation_id, watchdog.clone());
        Ok(watchdog)
    }

    /// Removes and returns the watchdog for a matched response, if the
    /// caller has not already given up.
    pub fn take(&self, correlation_id: &Uuid) -> Result<Option<Arc<MessageProgressWatchdog>>> {
        Ok(self.watchdogs.lock()?.remove(correlation_id))
    }

    /// Drops an abandoned watchdog (submission failed after registration).
    pub fn discard(&self, correlation_id: &Uuid) -> Result<()> {
        self.watchdogs.lock()?.remove(correlation_id);
        Ok(())
    }

    pub fn outstanding(&self) -> Result<usize> {
        Ok(self.watchdogs.lock()?.len())
    }
}
