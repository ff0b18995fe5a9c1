// ============================================================================
// Campusops Library
// ============================================================================

pub mod commands;
pub mod core;
pub mod domain;
pub mod engine;
pub mod messaging;
pub mod persist;

// Re-export main types for convenience
pub use self::core::{CommandError, Result};
pub use domain::{Course, Faculty, PersistEntity, Profile, Student};
pub use engine::{
    Command, CommandActionExecutor, CommandContext, CommandRegistry, CommandState,
    CountdownLatch, EnginePolicy, EntityCache, ExecutionMode, MacroCommand, NestedCommand,
    SharedContext, TransactionalCommand, UndoPayload, share,
};
pub use messaging::{
    ActionContext, CommandMessage, CommandMessageService, Direction, MessageProgressWatchdog,
    WatchdogHandle, WatchdogRegistry, WireMessage,
};
pub use persist::{
    EntityGateway, GuardedGateway, InMemoryGateway, NoopTransaction, TransactionBoundary,
};

// ============================================================================
// High-level usage
// ============================================================================
//
// Callers register commands, start the message service, and submit
// `(command_id, input)` pairs either synchronously or through the queue:
//
// ```no_run
// use campusops::{
//     ActionContext, CommandMessageService, CommandRegistry, Direction, EnginePolicy,
//     EntityGateway, InMemoryGateway, NoopTransaction, Student,
// };
// use campusops::commands::register_entity_commands;
// use serde_json::json;
// use std::sync::Arc;
//
// # async fn demo() -> campusops::Result<()> {
// let students: Arc<dyn EntityGateway<Student>> = Arc::new(InMemoryGateway::new());
// let mut registry = CommandRegistry::new(Arc::new(NoopTransaction));
// register_entity_commands(&mut registry, students.clone());
//
// let service = CommandMessageService::new(Arc::new(registry), EnginePolicy::default());
// service.processing();
//
// let handle = service
//     .send_command(
//         ActionContext::new("student-api", "create"),
//         "student.create",
//         json!({"id": null, "first_name": "Ada", "last_name": "Lovelace",
//                "email": "ada@example.edu", "faculty_id": null}),
//         Direction::Do,
//     )
//     .await?;
// let context = handle.await_result().await?;
// let created = context.lock().await.take_result();
// # let _ = created;
// # Ok(())
// # }
// ```
