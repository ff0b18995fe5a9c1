use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    #[error("Command '{0}' is not registered")]
    UnknownCommand(String),

    #[error("Undefined message direction for correlation {0}")]
    UndefinedDirection(Uuid),

    #[error("Command '{command}' cannot run {operation} from state {state}")]
    IllegalState {
        command: String,
        operation: String,
        state: String,
    },

    #[error("Parameter type mismatch: {0}")]
    ParameterType(String),

    #[error("{entity} '{id}' not found")]
    EntityNotFound { entity: String, id: String },

    #[error("{entity} '{id}' has dependents and cannot be deleted")]
    DependentEntities { entity: String, id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Barrier interrupted while waiting for {expected} nested commands")]
    BarrierInterrupted { expected: usize },

    #[error("Timed out waiting for message {0}")]
    WatchdogTimeout(Uuid),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

impl<T> From<std::sync::PoisonError<T>> for CommandError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
