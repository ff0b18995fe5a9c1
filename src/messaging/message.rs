use crate::engine::command::Command;
use crate::engine::context::SharedContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Which way a command message drives its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Do,
    Undo,
    /// Anything the wire decoder could not recognize. Always refused by the
    /// executor.
    #[serde(other)]
    Unknown,
}

/// Caller/tracing metadata attached to every command message.
///
/// Passed explicitly through the call chain; never stored in ambient
/// task-local state, so pooled workers cannot leak one caller's identity
/// into another's execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    /// Facade that accepted the call (`student-api`, `admissions`, ...).
    pub facade: String,
    /// Business action name for tracing.
    pub action: String,
    /// Optional id of the user or system initiating the action.
    pub actor_id: Option<String>,
}

impl ActionContext {
    pub fn new(facade: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            facade: facade.into(),
            action: action.into(),
            actor_id: None,
        }
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Immutable envelope around one dispatch of one command.
///
/// Created once per dispatch; only the context it references mutates.
#[derive(Clone)]
pub struct CommandMessage {
    pub correlation_id: Uuid,
    pub direction: Direction,
    pub action_context: ActionContext,
    pub command: Arc<dyn Command>,
    pub context: SharedContext,
    pub created_at: DateTime<Utc>,
}

impl CommandMessage {
    /// Builds an envelope with a fresh correlation id.
    pub fn new(
        direction: Direction,
        action_context: ActionContext,
        command: Arc<dyn Command>,
        context: SharedContext,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            direction,
            action_context,
            command,
            context,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandMessage")
            .field("correlation_id", &self.correlation_id)
            .field("direction", &self.direction)
            .field("action_context", &self.action_context)
            .field("command", &self.command.command_id())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Textual form a message takes on the local queue.
///
/// The live context and command stay in the service's in-flight table; the
/// wire form carries only what is needed to find them again plus the caller
/// metadata for observability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub correlation_id: Uuid,
    pub direction: Direction,
    pub action_context: ActionContext,
    pub command_id: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl WireMessage {
    pub fn from_message(msg: &CommandMessage, payload: Option<Value>) -> Self {
        Self {
            correlation_id: msg.correlation_id,
            direction: msg.direction,
            action_context: msg.action_context.clone(),
            command_id: msg.command.command_id().to_string(),
            payload,
            created_at: msg.created_at,
        }
    }

    /// The poison marker: nil correlation id, unknown direction.
    pub fn empty() -> Self {
        Self {
            correlation_id: Uuid::nil(),
            direction: Direction::Unknown,
            action_context: ActionContext::default(),
            command_id: String::new(),
            payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_nil() && self.command_id.is_empty()
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes a queued message; garbage degrades to the EMPTY marker so a
    /// consuming loop never crashes on a corrupt entry.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::empty())
    }
}
