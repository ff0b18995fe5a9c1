pub mod cache;
pub mod command;
pub mod composite;
pub mod context;
pub mod executor;
pub mod registry;

pub use cache::EntityCache;
pub use command::Command;
pub use composite::{CountdownLatch, ExecutionMode, MacroCommand, NestedCommand};
pub use context::{CommandContext, CommandState, SharedContext, UndoPayload, share};
pub use executor::CommandActionExecutor;
pub use registry::{CommandRegistry, TransactionalCommand};

/// Operational configuration for the engine.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Requested worker-pool size. The effective size never drops below the
    /// available hardware parallelism.
    pub worker_permits: usize,
    /// Timeout in milliseconds to wait for a worker slot when saturated.
    pub acquire_timeout_ms: u64,
    /// Capacity of the request and response queues.
    pub queue_capacity: usize,
    /// Default timeout in milliseconds a submitting caller waits on its
    /// watchdog.
    pub watchdog_timeout_ms: u64,
    /// Timeout in milliseconds a parallel macro waits on its barrier.
    pub barrier_timeout_ms: u64,
}

impl EnginePolicy {
    /// Worker-pool size with the hardware-parallelism floor applied.
    pub fn effective_worker_permits(&self) -> usize {
        self.worker_permits.max(available_parallelism())
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            worker_permits: available_parallelism(),
            acquire_timeout_ms: 2_000,
            queue_capacity: 256,
            watchdog_timeout_ms: 5_000,
            barrier_timeout_ms: 10_000,
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
