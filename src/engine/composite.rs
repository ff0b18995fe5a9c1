use crate::core::{CommandError, Result};
use crate::engine::command::Command;
use crate::engine::context::{CommandContext, CommandState, share};
use crate::engine::executor::CommandActionExecutor;
use crate::messaging::message::ActionContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{Instrument, Level, event, info_span};

/// Fixed-count synchronization barrier joining parallel nested completions.
///
/// Built for a single waiting orchestrator: `notify_one` stores a permit, so
/// the waiter cannot miss the final count-down even if it arrives between
/// the counter check and the wait.
pub struct CountdownLatch {
    expected: usize,
    remaining: AtomicUsize,
    done: Notify,
}

impl CountdownLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            remaining: AtomicUsize::new(expected),
            done: Notify::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Counts one completion. Saturates at zero.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            self.done.notify_one();
        }
    }

    /// Blocks the orchestrator until all completions counted down or the
    /// wait is cut short, in which case the caller receives a typed
    /// barrier-interrupted failure carrying the expected count.
    pub async fn wait(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            if self.remaining() == 0 {
                return Ok(());
            }
            if timeout_at(deadline, self.done.notified()).await.is_err() {
                return Err(CommandError::BarrierInterrupted {
                    expected: self.expected,
                });
            }
        }
    }
}

/// A command that can run as one step of a macro command.
///
/// Each concrete step builds its own typed context from the macro's raw
/// input and knows how to absorb a predecessor's result — invoked
/// polymorphically by the macro, so new step families plug in without
/// touching the orchestrator.
#[async_trait]
pub trait NestedCommand: Command {
    /// Builds this step's `Ready` context from the macro's raw input.
    fn prepare_nested_context(&self, macro_input: &Value) -> Result<CommandContext>;

    /// Moves the previous step's result into this step's redo parameter.
    fn transfer_result(&self, source: &CommandContext, target: &mut CommandContext) {
        target.set_redo_parameter(source.result().cloned());
    }
}

/// How a macro command runs its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Pipeline: list order, result of step N feeds step N+1, first failure
    /// halts the chain.
    Sequential,
    /// Fan-out/fan-in: all steps dispatched concurrently, joined at a
    /// fixed-count barrier, aggregated only after every step finished.
    Parallel,
}

/// A command whose execution is the orchestrated execution of nested
/// commands. Nested contexts are exclusively owned by the macro context
/// that created them; every nested dispatch funnels through the executor
/// choke point under the macro's own admission permit.
pub struct MacroCommand {
    command_id: String,
    mode: ExecutionMode,
    steps: Vec<Arc<dyn NestedCommand>>,
    executor: Arc<CommandActionExecutor>,
    barrier_timeout: Duration,
}

impl MacroCommand {
    pub fn sequential(
        command_id: impl Into<String>,
        steps: Vec<Arc<dyn NestedCommand>>,
        executor: Arc<CommandActionExecutor>,
    ) -> Self {
        Self::new(command_id, ExecutionMode::Sequential, steps, executor)
    }

    pub fn parallel(
        command_id: impl Into<String>,
        steps: Vec<Arc<dyn NestedCommand>>,
        executor: Arc<CommandActionExecutor>,
    ) -> Self {
        Self::new(command_id, ExecutionMode::Parallel, steps, executor)
    }

    pub fn new(
        command_id: impl Into<String>,
        mode: ExecutionMode,
        steps: Vec<Arc<dyn NestedCommand>>,
        executor: Arc<CommandActionExecutor>,
    ) -> Self {
        let barrier_timeout = executor.barrier_timeout();
        Self {
            command_id: command_id.into(),
            mode,
            steps,
            executor,
            barrier_timeout,
        }
    }

    pub fn with_barrier_timeout(mut self, limit: Duration) -> Self {
        self.barrier_timeout = limit;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn run_sequential(
        &self,
        action: &ActionContext,
        ctx: &mut CommandContext,
    ) -> Result<()> {
        let nested = ctx.nested().to_vec();
        let mut previous: Option<usize> = None;

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(prev) = previous {
                let source = nested[prev].lock().await;
                let mut target = nested[index].lock().await;
                step.transfer_result(&source, &mut target);
            }

            let command: Arc<dyn Command> = step.clone();
            self.executor
                .commit_nested(action, command, nested[index].clone())
                .await?;

            let guard = nested[index].lock().await;
            if guard.state() == CommandState::Done {
                previous = Some(index);
                continue;
            }

            let first_failure = guard.exception().cloned().unwrap_or_else(|| {
                CommandError::Execution(format!(
                    "nested command '{}' ended in state {}",
                    step.command_id(),
                    guard.state()
                ))
            });
            drop(guard);
            event!(
                Level::WARN,
                step = step.command_id(),
                skipped = self.steps.len() - index - 1,
                "sequential chain halted, remaining steps skipped"
            );
            return Err(first_failure);
        }

        let last_result = match nested.last() {
            Some(last) => last.lock().await.result().cloned().unwrap_or(Value::Null),
            None => Value::Null,
        };
        ctx.complete(last_result)
    }

    async fn run_parallel(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let nested = ctx.nested().to_vec();
        let expected = self.steps.len();
        let latch = Arc::new(CountdownLatch::new(expected));
        let first_failure: Arc<Mutex<Option<CommandError>>> = Arc::new(Mutex::new(None));

        // Each nested terminal transition counts the barrier down; the
        // orchestrator never polls nested state while they run.
        for shared in &nested {
            let mut guard = shared.lock().await;
            let latch = latch.clone();
            let failure_slot = first_failure.clone();
            guard.on_state_change(Arc::new(move |nested_ctx, state| {
                if !state.is_terminal() {
                    return;
                }
                if state == CommandState::Fail {
                    if let Ok(mut slot) = failure_slot.lock() {
                        if slot.is_none() {
                            *slot = nested_ctx.exception().cloned();
                        }
                    }
                }
                latch.count_down();
            }));
        }

        for (index, step) in self.steps.iter().enumerate() {
            let executor = self.executor.clone();
            let action = action.clone();
            let command: Arc<dyn Command> = step.clone();
            let shared = nested[index].clone();
            let step_id = step.command_id().to_string();
            tokio::spawn(async move {
                if let Err(err) = executor.commit_nested(&action, command, shared).await {
                    event!(Level::ERROR, step = %step_id, error = %err, "nested dispatch failed");
                }
            });
        }

        latch.wait(self.barrier_timeout).await?;

        let mut results = Vec::with_capacity(expected);
        for shared in &nested {
            let guard = shared.lock().await;
            match guard.state() {
                CommandState::Done => results.push(guard.result().cloned().unwrap_or(Value::Null)),
                state => {
                    event!(
                        Level::WARN,
                        command = guard.command_id(),
                        state = %state,
                        "nested command did not succeed"
                    );
                }
            }
        }

        let captured = first_failure.lock()?.take();
        if let Some(err) = captured {
            return Err(err);
        }
        if results.len() != expected {
            return Err(CommandError::Execution(format!(
                "parallel macro '{}' finished with {} of {} nested results",
                self.command_id,
                results.len(),
                expected
            )));
        }
        ctx.complete(Value::Array(results))
    }
}

#[async_trait]
impl Command for MacroCommand {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        if self.steps.is_empty() {
            return Err(CommandError::ContextCreation(format!(
                "macro command '{}' has no nested commands",
                self.command_id
            )));
        }
        let mut ctx = CommandContext::ready(&self.command_id, input.clone());
        for step in &self.steps {
            let nested = step.prepare_nested_context(&input)?;
            ctx.push_nested(share(nested));
        }
        Ok(ctx)
    }

    async fn do_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let span = info_span!(
            "engine.command.macro",
            command = %self.command_id,
            mode = ?self.mode,
            steps = self.steps.len()
        );
        match self.mode {
            ExecutionMode::Sequential => self.run_sequential(action, ctx).instrument(span).await,
            ExecutionMode::Parallel => self.run_parallel(action, ctx).instrument(span).await,
        }
    }

    /// Rolls back every nested command that finished, in reverse order.
    /// Steps that never ran (still `Ready`) are left untouched.
    async fn undo_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let nested = ctx.nested().to_vec();
        for (index, step) in self.steps.iter().enumerate().rev() {
            let state = nested[index].lock().await.state();
            if !matches!(state, CommandState::Done | CommandState::Fail) {
                continue;
            }
            let command: Arc<dyn Command> = step.clone();
            self.executor
                .rollback_nested(action, command, nested[index].clone())
                .await?;
            let guard = nested[index].lock().await;
            if guard.state() != CommandState::Undone {
                return Err(guard.exception().cloned().unwrap_or_else(|| {
                    CommandError::Execution(format!(
                        "nested command '{}' failed to roll back",
                        step.command_id()
                    ))
                }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TinyStep {
        id: String,
    }

    impl TinyStep {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.to_string() })
        }
    }

    #[async_trait]
    impl Command for TinyStep {
        fn command_id(&self) -> &str {
            &self.id
        }

        fn prepare_context(&self, input: Value) -> Result<CommandContext> {
            Ok(CommandContext::ready(&self.id, input))
        }

        async fn do_command(
            &self,
            _action: &ActionContext,
            ctx: &mut CommandContext,
        ) -> Result<()> {
            ctx.complete(json!(self.id))
        }

        async fn undo_command(
            &self,
            _action: &ActionContext,
            _ctx: &mut CommandContext,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl NestedCommand for TinyStep {
        fn prepare_nested_context(&self, macro_input: &Value) -> Result<CommandContext> {
            Ok(CommandContext::ready(&self.id, macro_input.clone()))
        }
    }

    #[tokio::test]
    async fn sequential_macro_completes_on_a_single_permit_pool() {
        let executor = Arc::new(CommandActionExecutor::with_permits(
            1,
            Duration::from_millis(200),
        ));
        let macro_cmd = MacroCommand::sequential(
            "pair",
            vec![TinyStep::new("one"), TinyStep::new("two")],
            executor.clone(),
        );
        let ctx = share(macro_cmd.prepare_context(json!({})).unwrap());
        let command: Arc<dyn Command> = Arc::new(macro_cmd);

        executor
            .commit_action(&ActionContext::new("test", "pair"), command, ctx.clone())
            .await
            .unwrap();

        let guard = ctx.lock().await;
        assert_eq!(guard.state(), CommandState::Done);
        assert_eq!(guard.result(), Some(&json!("two")));
    }

    #[tokio::test]
    async fn parallel_macro_completes_on_a_single_permit_pool() {
        let executor = Arc::new(CommandActionExecutor::with_permits(
            1,
            Duration::from_millis(200),
        ));
        let macro_cmd = MacroCommand::parallel(
            "fanout",
            vec![TinyStep::new("a"), TinyStep::new("b"), TinyStep::new("c")],
            executor.clone(),
        )
        .with_barrier_timeout(Duration::from_secs(1));
        let ctx = share(macro_cmd.prepare_context(json!({})).unwrap());
        let command: Arc<dyn Command> = Arc::new(macro_cmd);

        executor
            .commit_action(&ActionContext::new("test", "fanout"), command, ctx.clone())
            .await
            .unwrap();

        let guard = ctx.lock().await;
        assert_eq!(guard.state(), CommandState::Done);
        assert_eq!(guard.result(), Some(&json!(["a", "b", "c"])));
    }

    #[tokio::test]
    async fn latch_releases_after_all_count_downs() {
        let latch = Arc::new(CountdownLatch::new(3));
        for _ in 0..3 {
            let latch = latch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                latch.count_down();
            });
        }
        latch.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(latch.remaining(), 0);
    }

    #[tokio::test]
    async fn latch_wait_times_out_with_expected_count() {
        let latch = CountdownLatch::new(2);
        latch.count_down();
        let err = latch.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, CommandError::BarrierInterrupted { expected: 2 });
    }

    #[test]
    fn latch_saturates_at_zero() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
    }
}
