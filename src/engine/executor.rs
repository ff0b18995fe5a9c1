use crate::core::{CommandError, Result};
use crate::engine::EnginePolicy;
use crate::engine::command::Command;
use crate::engine::context::{CommandState, SharedContext};
use crate::messaging::message::{ActionContext, CommandMessage, Direction};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Duration, timeout};
use tracing::{Instrument, Level, Span, event, info_span};

/// Single choke point through which all command execution passes,
/// nested executions included.
///
/// Validates the message, enforces the context-state preconditions, and
/// captures every command error into the context — a failed context always
/// carries the exception, and no error escapes past this boundary.
pub struct CommandActionExecutor {
    workers: Arc<Semaphore>,
    acquire_timeout: Duration,
    barrier_timeout: Duration,
}

impl CommandActionExecutor {
    pub fn new(policy: &EnginePolicy) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(policy.effective_worker_permits())),
            acquire_timeout: Duration::from_millis(policy.acquire_timeout_ms),
            barrier_timeout: Duration::from_millis(policy.barrier_timeout_ms),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_permits(permits: usize, acquire_timeout: Duration) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(permits)),
            acquire_timeout,
            barrier_timeout: Duration::from_millis(10_000),
        }
    }

    /// Default barrier wait for parallel macro commands built over this
    /// executor.
    pub fn barrier_timeout(&self) -> Duration {
        self.barrier_timeout
    }

    /// Validates and dispatches one command message under a worker-pool
    /// permit.
    ///
    /// The returned `Ok` means the message was processed; the outcome of the
    /// command itself lives in the message's context.
    pub async fn process_action_command(&self, msg: &CommandMessage) -> Result<()> {
        let span = Self::message_span(msg);
        self.admit(msg).instrument(span).await
    }

    /// Dispatch path for nested steps of an already-admitted composite.
    ///
    /// The parent command holds the admission permit for the whole
    /// composite; a second acquire per step would starve a one-permit pool.
    pub(crate) async fn process_nested_command(&self, msg: &CommandMessage) -> Result<()> {
        let span = Self::message_span(msg);
        self.run(msg).instrument(span).await
    }

    fn message_span(msg: &CommandMessage) -> Span {
        info_span!(
            "engine.command.message",
            correlation_id = %msg.correlation_id,
            command = msg.command.command_id(),
            facade = %msg.action_context.facade,
            action = %msg.action_context.action,
            direction = ?msg.direction
        )
    }

    async fn admit(&self, msg: &CommandMessage) -> Result<()> {
        let _permit = match timeout(self.acquire_timeout, self.workers.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CommandError::Execution(
                    "worker pool closed".to_string(),
                ));
            }
            Err(_) => {
                let saturated = CommandError::Execution(format!(
                    "worker pool saturated after {}ms",
                    self.acquire_timeout.as_millis()
                ));
                msg.context.lock().await.failed(saturated.clone());
                return Err(saturated);
            }
        };
        self.run(msg).await
    }

    async fn run(&self, msg: &CommandMessage) -> Result<()> {
        let mut ctx = msg.context.lock().await;
        match msg.direction {
            Direction::Unknown => {
                event!(Level::WARN, "refusing message with undefined direction");
                ctx.failed(CommandError::UndefinedDirection(msg.correlation_id));
            }
            Direction::Do => {
                if let Err(err) = ctx.begin_do() {
                    event!(Level::WARN, error = %err, "doCommand refused by context state");
                    ctx.failed(err);
                    return Ok(());
                }
                match msg.command.do_command(&msg.action_context, &mut ctx).await {
                    Ok(()) => {
                        if ctx.state() != CommandState::Done {
                            let err = CommandError::Execution(format!(
                                "command '{}' returned without completing its context",
                                msg.command.command_id()
                            ));
                            event!(Level::ERROR, error = %err, "broken command contract");
                            ctx.failed(err);
                        } else {
                            event!(Level::DEBUG, "command done");
                        }
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "command failed");
                        ctx.failed(err);
                    }
                }
            }
            Direction::Undo => {
                if let Err(err) = ctx.begin_undo() {
                    event!(Level::WARN, error = %err, "undoCommand refused by context state");
                    ctx.failed(err);
                    return Ok(());
                }
                match msg.command.undo_command(&msg.action_context, &mut ctx).await {
                    Ok(()) => {
                        ctx.mark_undone();
                        event!(Level::DEBUG, "command rolled back");
                    }
                    Err(err) => {
                        event!(Level::WARN, error = %err, "rollback failed");
                        ctx.failed(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds a correlation-tagged DO message and funnels it through
    /// [`Self::process_action_command`].
    pub async fn commit_action(
        &self,
        action: &ActionContext,
        command: Arc<dyn Command>,
        context: SharedContext,
    ) -> Result<CommandMessage> {
        let msg = CommandMessage::new(Direction::Do, action.clone(), command, context);
        self.process_action_command(&msg).await?;
        Ok(msg)
    }

    /// Builds a correlation-tagged UNDO message and funnels it through
    /// [`Self::process_action_command`].
    pub async fn rollback_action(
        &self,
        action: &ActionContext,
        command: Arc<dyn Command>,
        context: SharedContext,
    ) -> Result<CommandMessage> {
        let msg = CommandMessage::new(Direction::Undo, action.clone(), command, context);
        self.process_action_command(&msg).await?;
        Ok(msg)
    }

    /// DO dispatch for a nested step, run under the parent's permit.
    pub(crate) async fn commit_nested(
        &self,
        action: &ActionContext,
        command: Arc<dyn Command>,
        context: SharedContext,
    ) -> Result<CommandMessage> {
        let msg = CommandMessage::new(Direction::Do, action.clone(), command, context);
        self.process_nested_command(&msg).await?;
        Ok(msg)
    }

    /// UNDO dispatch for a nested step, run under the parent's permit.
    pub(crate) async fn rollback_nested(
        &self,
        action: &ActionContext,
        command: Arc<dyn Command>,
        context: SharedContext,
    ) -> Result<CommandMessage> {
        let msg = CommandMessage::new(Direction::Undo, action.clone(), command, context);
        self.process_nested_command(&msg).await?;
        Ok(msg)
    }
}
