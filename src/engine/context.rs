use crate::core::{CommandError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared form of a context handed across tasks and loops.
pub type SharedContext = Arc<Mutex<CommandContext>>;

/// Listener invoked after every state transition with the new state.
pub type StateListener = Arc<dyn Fn(&CommandContext, CommandState) + Send + Sync>;

/// Lifecycle of one execution attempt of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    /// Constructed, input not yet validated.
    Init,
    /// Input validated, eligible for the forward operation.
    Ready,
    /// Forward or rollback operation in flight.
    Work,
    /// Operation succeeded; `result` is authoritative.
    Done,
    /// Exception captured; `exception` is authoritative.
    Fail,
    /// Rollback completed after a prior Done/Fail.
    Undone,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fail | Self::Undone)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Work => "WORK",
            Self::Done => "DONE",
            Self::Fail => "FAIL",
            Self::Undone => "UNDONE",
        };
        write!(f, "{name}")
    }
}

/// Rollback payload cached by a forward mutation.
///
/// The shape tells the rollback path what to do: a snapshot is restored by
/// value, a created entity is deleted by id. Exhaustively matched, so a new
/// shape cannot slip past the rollback dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UndoPayload {
    /// Full pre-mutation snapshot (update/delete case).
    Restore(Value),
    /// Id of the entity the forward operation created (create case).
    DeleteById(Uuid),
}

/// Mutable record wrapping one execution attempt of one command.
///
/// Mutated exclusively by the owning command (or its cache helper) while the
/// executor drives `do`/`undo`; discarded once the caller consumes the
/// result or exception.
pub struct CommandContext {
    command_id: String,
    state: CommandState,
    redo_parameter: Option<Value>,
    undo_parameter: Option<UndoPayload>,
    result: Option<Value>,
    exception: Option<CommandError>,
    result_detached: bool,
    nested: Vec<SharedContext>,
    listeners: Vec<StateListener>,
}

impl CommandContext {
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            state: CommandState::Init,
            redo_parameter: None,
            undo_parameter: None,
            result: None,
            exception: None,
            result_detached: false,
            nested: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Builds a validated context, eligible for the forward operation.
    pub fn ready(command_id: impl Into<String>, redo_parameter: Value) -> Self {
        let mut ctx = Self::new(command_id);
        ctx.redo_parameter = Some(redo_parameter);
        ctx.set_state(CommandState::Ready);
        ctx
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn redo_parameter(&self) -> Option<&Value> {
        self.redo_parameter.as_ref()
    }

    pub fn set_redo_parameter(&mut self, value: Option<Value>) {
        self.redo_parameter = value;
    }

    pub fn undo_parameter(&self) -> Option<&UndoPayload> {
        self.undo_parameter.as_ref()
    }

    pub fn set_undo_parameter(&mut self, payload: UndoPayload) {
        self.undo_parameter = Some(payload);
    }

    pub fn take_undo_parameter(&mut self) -> Option<UndoPayload> {
        self.undo_parameter.take()
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Hands the result to the caller and detaches it from the context.
    pub fn take_result(&mut self) -> Option<Value> {
        let result = self.result.take();
        if result.is_some() {
            self.result_detached = true;
        }
        result
    }

    pub fn result_detached(&self) -> bool {
        self.result_detached
    }

    pub fn exception(&self) -> Option<&CommandError> {
        self.exception.as_ref()
    }

    /// Ordered per-step contexts of a macro command. Empty otherwise.
    pub fn nested(&self) -> &[SharedContext] {
        &self.nested
    }

    pub fn push_nested(&mut self, ctx: SharedContext) {
        self.nested.push(ctx);
    }

    pub fn on_state_change(&mut self, listener: StateListener) {
        self.listeners.push(listener);
    }

    /// Marks the forward operation in flight. Refused outside `Ready`.
    pub fn begin_do(&mut self) -> Result<()> {
        if self.state != CommandState::Ready {
            return Err(self.illegal("doCommand"));
        }
        self.set_state(CommandState::Work);
        Ok(())
    }

    /// Marks the rollback in flight. Only a finished attempt can roll back.
    pub fn begin_undo(&mut self) -> Result<()> {
        if !matches!(self.state, CommandState::Done | CommandState::Fail) {
            return Err(self.illegal("undoCommand"));
        }
        self.set_state(CommandState::Work);
        Ok(())
    }

    /// Stores the authoritative result and moves to `Done`.
    ///
    /// Only legal while an operation is in flight; a result can never be set
    /// on a context that is not transitioning to `Done`.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        if self.state != CommandState::Work {
            return Err(self.illegal("complete"));
        }
        self.result = Some(result);
        self.exception = None;
        self.set_state(CommandState::Done);
        Ok(())
    }

    /// Records the exception and forces `Fail`, dropping any partial result.
    pub fn failed(&mut self, exception: CommandError) {
        self.result = None;
        self.exception = Some(exception);
        self.set_state(CommandState::Fail);
    }

    /// Marks the rollback finished; the cached undo payload is spent.
    pub fn mark_undone(&mut self) {
        self.undo_parameter = None;
        self.set_state(CommandState::Undone);
    }

    /// Clears a consumed result slot (create-rollback leaves no result behind).
    pub fn clear_result(&mut self) {
        self.result = None;
    }

    fn illegal(&self, operation: &str) -> CommandError {
        CommandError::IllegalState {
            command: self.command_id.clone(),
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    fn set_state(&mut self, state: CommandState) {
        self.state = state;
        let listeners = self.listeners.clone();
        for listener in listeners {
            listener(self, state);
        }
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("command_id", &self.command_id)
            .field("state", &self.state)
            .field("redo_parameter", &self.redo_parameter)
            .field("undo_parameter", &self.undo_parameter)
            .field("result", &self.result)
            .field("exception", &self.exception)
            .field("result_detached", &self.result_detached)
            .field("nested", &self.nested.len())
            .finish()
    }
}

/// Wraps a context for cross-task sharing.
pub fn share(ctx: CommandContext) -> SharedContext {
    Arc::new(Mutex::new(ctx))
}
