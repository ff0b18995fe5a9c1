use crate::core::{CommandError, Result};
use crate::domain::PersistEntity;
use crate::engine::context::{CommandContext, CommandState, UndoPayload};
use crate::persist::EntityGateway;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{Level, event};

/// Snapshot-before-mutate / cache-for-undo / restore-or-delete-on-rollback
/// helper shared by entity-mutating commands.
///
/// The cached [`UndoPayload`] shape decides the rollback path: a `Restore`
/// snapshot is saved back, a `DeleteById` removes the row the forward
/// operation created. Rollback stays symmetric with whatever the forward
/// operation actually did, without a separate operation-kind flag.
pub struct EntityCache<T: PersistEntity> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: PersistEntity> EntityCache<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Loads an entity and returns the adapted copy the `adopt` mapping
    /// produces — never the live instance, so later mutation cannot corrupt
    /// a cached snapshot.
    pub async fn retrieve_entity(
        &self,
        id: uuid::Uuid,
        gateway: &dyn EntityGateway<T>,
        adopt: impl FnOnce(&T) -> T,
    ) -> Result<T> {
        let found = gateway.find_by_id(id).await?;
        match found {
            Some(entity) => Ok(adopt(&entity)),
            None => Err(CommandError::EntityNotFound {
                entity: T::ENTITY_NAME.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Adapts the context's redo parameter to `T` and persists it.
    ///
    /// A redo parameter that is absent or does not deserialize to `T` is a
    /// fatal parameter-type error, never silently ignored.
    pub async fn persist_redo_entity(
        &self,
        ctx: &CommandContext,
        gateway: &dyn EntityGateway<T>,
    ) -> Result<T> {
        let redo = ctx.redo_parameter().ok_or_else(|| {
            CommandError::ParameterType(format!(
                "command '{}' has no redo parameter to persist",
                ctx.command_id()
            ))
        })?;
        let entity: T = serde_json::from_value(redo.clone()).map_err(|err| {
            CommandError::ParameterType(format!(
                "redo parameter of command '{}' is not a {}: {}",
                ctx.command_id(),
                T::ENTITY_NAME,
                err
            ))
        })?;
        gateway.save(entity).await
    }

    /// Rolls back whatever the forward operation cached.
    ///
    /// * `Restore` snapshot: saved back, restoring the previous value.
    /// * `DeleteById`: only legal when the command permits delete-on-rollback
    ///   (create commands do); deletes the created row, then clears the redo
    ///   payload's id and the context result so the context could be redone
    ///   as a fresh create.
    /// * No undo payload: nothing to roll back, a no-op success.
    pub async fn rollback_cached_entity(
        &self,
        ctx: &mut CommandContext,
        gateway: &dyn EntityGateway<T>,
        delete_on_rollback: bool,
    ) -> Result<()> {
        let undo = match ctx.undo_parameter().cloned() {
            Some(undo) => undo,
            None => {
                event!(
                    Level::DEBUG,
                    command = ctx.command_id(),
                    "no undo parameter cached, nothing to roll back"
                );
                return Ok(());
            }
        };

        match undo {
            UndoPayload::Restore(snapshot) => {
                let previous: T = serde_json::from_value(snapshot).map_err(|err| {
                    CommandError::ParameterType(format!(
                        "undo snapshot of command '{}' is not a {}: {}",
                        ctx.command_id(),
                        T::ENTITY_NAME,
                        err
                    ))
                })?;
                gateway.save(previous).await?;
                Ok(())
            }
            UndoPayload::DeleteById(id) => {
                if !delete_on_rollback {
                    return Err(CommandError::ParameterType(format!(
                        "command '{}' cached a created-{} id but does not permit delete on rollback",
                        ctx.command_id(),
                        T::ENTITY_NAME
                    )));
                }
                gateway.delete_by_id(id).await?;
                self.clear_redo_identity(ctx);
                Ok(())
            }
        }
    }

    /// Post-save decision point: a context that already failed gets the
    /// supplied rollback process instead of a result; otherwise the result
    /// is stored and, in create mode only, the new id is cached so a later
    /// rollback knows to delete rather than restore.
    pub async fn after_entity_persistence_check<F, Fut>(
        &self,
        ctx: &mut CommandContext,
        rollback_process: F,
        persisted: T,
        create_mode: bool,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if ctx.state() == CommandState::Fail {
            event!(
                Level::WARN,
                command = ctx.command_id(),
                "context failed during persistence, rolling back"
            );
            return rollback_process().await;
        }

        if create_mode {
            let id = persisted.id().ok_or_else(|| {
                CommandError::ParameterType(format!(
                    "persisted {} has no id to cache for rollback",
                    T::ENTITY_NAME
                ))
            })?;
            ctx.set_undo_parameter(UndoPayload::DeleteById(id));
        }

        let result = serde_json::to_value(&persisted)?;
        ctx.complete(result)
    }

    // After a delete-by-id rollback the redo payload should lose its id so
    // the context can be redone as a fresh create. A redo payload that is
    // present but has no id slot is reported instead of silently accepted.
    fn clear_redo_identity(&self, ctx: &mut CommandContext) {
        match ctx.redo_parameter().cloned() {
            None => {}
            Some(Value::Object(mut fields)) => {
                fields.insert("id".to_string(), Value::Null);
                ctx.set_redo_parameter(Some(Value::Object(fields)));
            }
            Some(other) => {
                event!(
                    Level::WARN,
                    command = ctx.command_id(),
                    payload_kind = %value_kind(&other),
                    "redo parameter has no settable id after delete rollback"
                );
            }
        }
        ctx.clear_result();
    }
}

impl<T: PersistEntity> Default for EntityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
