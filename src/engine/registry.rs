use crate::core::{CommandError, Result};
use crate::engine::command::Command;
use crate::engine::context::CommandContext;
use crate::messaging::message::ActionContext;
use crate::persist::{NoopTransaction, TransactionBoundary};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Wraps a command so every `do`/`undo` runs inside the persistence
/// transaction boundary.
///
/// The registry hands this wrapper back in place of the raw command, so
/// "call through the transactional wrapper" is ordinary injection rather
/// than a runtime self-lookup.
pub struct TransactionalCommand {
    inner: Arc<dyn Command>,
    boundary: Arc<dyn TransactionBoundary>,
}

impl TransactionalCommand {
    pub fn new(inner: Arc<dyn Command>, boundary: Arc<dyn TransactionBoundary>) -> Self {
        Self { inner, boundary }
    }

    async fn transactional<F>(&self, run: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.boundary.begin().await?;
        match run.await {
            Ok(()) => self.boundary.commit().await,
            Err(err) => {
                if let Err(rollback_err) = self.boundary.rollback().await {
                    event!(
                        Level::ERROR,
                        command = self.inner.command_id(),
                        error = %rollback_err,
                        "transaction rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Command for TransactionalCommand {
    fn command_id(&self) -> &str {
        self.inner.command_id()
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        self.inner.prepare_context(input)
    }

    async fn do_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.transactional(self.inner.do_command(action, ctx)).await
    }

    async fn undo_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.transactional(self.inner.undo_command(action, ctx)).await
    }
}

/// Name → command lookup used by callers submitting `(command_id, input)`.
///
/// Registration wraps each command in [`TransactionalCommand`]; resolution
/// always yields the wrapper.
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
    boundary: Arc<dyn TransactionBoundary>,
}

impl CommandRegistry {
    pub fn new(boundary: Arc<dyn TransactionBoundary>) -> Self {
        Self {
            commands: HashMap::new(),
            boundary,
        }
    }

    pub fn register(&mut self, command: Arc<dyn Command>) {
        let id = command.command_id().to_string();
        let wrapped: Arc<dyn Command> =
            Arc::new(TransactionalCommand::new(command, self.boundary.clone()));
        if self.commands.insert(id.clone(), wrapped).is_some() {
            event!(Level::WARN, command = %id, "command re-registered, previous dropped");
        }
    }

    pub fn resolve(&self, command_id: &str) -> Result<Arc<dyn Command>> {
        self.commands
            .get(command_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownCommand(command_id.to_string()))
    }

    pub fn contains(&self, command_id: &str) -> bool {
        self.commands.contains_key(command_id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoopTransaction))
    }
}
