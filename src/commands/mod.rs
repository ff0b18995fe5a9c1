//! Ready-made entity commands built on the cache helper and the
//! persistence facades.
//!
//! One family per operation, generic over the entity type; registering an
//! entity yields `<entity>.create`, `<entity>.update`, `<entity>.delete`,
//! and `<entity>.find`.

pub mod admission;

use crate::core::{CommandError, Result};
use crate::domain::PersistEntity;
use crate::engine::cache::EntityCache;
use crate::engine::command::Command;
use crate::engine::context::{CommandContext, UndoPayload};
use crate::engine::registry::CommandRegistry;
use crate::messaging::message::ActionContext;
use crate::persist::EntityGateway;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

fn entity_id_from_input(command_id: &str, input: &Value) -> Result<Uuid> {
    let raw = input.get("id").and_then(Value::as_str).ok_or_else(|| {
        CommandError::ParameterType(format!(
            "command '{command_id}' requires an object with an 'id' field"
        ))
    })?;
    Uuid::parse_str(raw).map_err(|err| {
        CommandError::ParameterType(format!("command '{command_id}' received a malformed id: {err}"))
    })
}

/// Persists a new entity; rollback deletes the created row by id.
pub struct CreateEntityCommand<T: PersistEntity> {
    command_id: String,
    gateway: Arc<dyn EntityGateway<T>>,
    cache: EntityCache<T>,
}

impl<T: PersistEntity> CreateEntityCommand<T> {
    pub fn new(gateway: Arc<dyn EntityGateway<T>>) -> Self {
        Self {
            command_id: format!("{}.create", T::ENTITY_NAME),
            gateway,
            cache: EntityCache::new(),
        }
    }
}

#[async_trait]
impl<T: PersistEntity> Command for CreateEntityCommand<T> {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        serde_json::from_value::<T>(input.clone()).map_err(|err| {
            CommandError::ContextCreation(format!(
                "input for '{}' is not a {}: {}",
                self.command_id,
                T::ENTITY_NAME,
                err
            ))
        })?;
        Ok(CommandContext::ready(&self.command_id, input))
    }

    async fn do_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let persisted = self.cache.persist_redo_entity(ctx, self.gateway.as_ref()).await?;
        let gateway = self.gateway.clone();
        let created_id = persisted.id();
        let rollback = || async move {
            if let Some(id) = created_id {
                gateway.delete_by_id(id).await?;
            }
            Ok(())
        };
        self.cache
            .after_entity_persistence_check(ctx, rollback, persisted, true)
            .await
    }

    async fn undo_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.cache
            .rollback_cached_entity(ctx, self.gateway.as_ref(), true)
            .await
    }
}

/// Overwrites an existing entity; rollback restores the pre-mutation
/// snapshot by value.
pub struct UpdateEntityCommand<T: PersistEntity> {
    command_id: String,
    gateway: Arc<dyn EntityGateway<T>>,
    cache: EntityCache<T>,
}

impl<T: PersistEntity> UpdateEntityCommand<T> {
    pub fn new(gateway: Arc<dyn EntityGateway<T>>) -> Self {
        Self {
            command_id: format!("{}.update", T::ENTITY_NAME),
            gateway,
            cache: EntityCache::new(),
        }
    }
}

#[async_trait]
impl<T: PersistEntity> Command for UpdateEntityCommand<T> {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        let incoming = serde_json::from_value::<T>(input.clone()).map_err(|err| {
            CommandError::ContextCreation(format!(
                "input for '{}' is not a {}: {}",
                self.command_id,
                T::ENTITY_NAME,
                err
            ))
        })?;
        if incoming.id().is_none() {
            return Err(CommandError::ContextCreation(format!(
                "'{}' requires the {} id to be set",
                self.command_id,
                T::ENTITY_NAME
            )));
        }
        Ok(CommandContext::ready(&self.command_id, input))
    }

    async fn do_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let incoming: T = serde_json::from_value(
            ctx.redo_parameter().cloned().unwrap_or(Value::Null),
        )
        .map_err(|err| {
            CommandError::ParameterType(format!(
                "redo parameter of '{}' is not a {}: {}",
                self.command_id,
                T::ENTITY_NAME,
                err
            ))
        })?;
        let id = incoming.id().ok_or_else(|| {
            CommandError::ParameterType(format!("'{}' requires an id", self.command_id))
        })?;

        // Snapshot before mutating so the rollback path has the previous
        // value, detached from anything the gateway holds.
        let snapshot = self
            .cache
            .retrieve_entity(id, self.gateway.as_ref(), PersistEntity::adopt_copy)
            .await?;
        ctx.set_undo_parameter(UndoPayload::Restore(serde_json::to_value(&snapshot)?));

        let persisted = self.cache.persist_redo_entity(ctx, self.gateway.as_ref()).await?;
        let gateway = self.gateway.clone();
        let previous = snapshot.adopt_copy();
        let rollback = || async move {
            gateway.save(previous).await?;
            Ok(())
        };
        self.cache
            .after_entity_persistence_check(ctx, rollback, persisted, false)
            .await
    }

    async fn undo_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.cache
            .rollback_cached_entity(ctx, self.gateway.as_ref(), false)
            .await
    }
}

/// Removes an entity by id; rollback re-saves the pre-deletion snapshot.
pub struct DeleteEntityCommand<T: PersistEntity> {
    command_id: String,
    gateway: Arc<dyn EntityGateway<T>>,
    cache: EntityCache<T>,
}

impl<T: PersistEntity> DeleteEntityCommand<T> {
    pub fn new(gateway: Arc<dyn EntityGateway<T>>) -> Self {
        Self {
            command_id: format!("{}.delete", T::ENTITY_NAME),
            gateway,
            cache: EntityCache::new(),
        }
    }
}

#[async_trait]
impl<T: PersistEntity> Command for DeleteEntityCommand<T> {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        entity_id_from_input(&self.command_id, &input)
            .map_err(|err| CommandError::ContextCreation(err.to_string()))?;
        Ok(CommandContext::ready(&self.command_id, input))
    }

    async fn do_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let input = ctx.redo_parameter().cloned().unwrap_or(Value::Null);
        let id = entity_id_from_input(&self.command_id, &input)?;

        let snapshot = self
            .cache
            .retrieve_entity(id, self.gateway.as_ref(), PersistEntity::adopt_copy)
            .await?;
        ctx.set_undo_parameter(UndoPayload::Restore(serde_json::to_value(&snapshot)?));

        let deleted = self.gateway.delete_by_id(id).await?;
        ctx.complete(json!({ "deleted": deleted, "id": id }))
    }

    async fn undo_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.cache
            .rollback_cached_entity(ctx, self.gateway.as_ref(), false)
            .await
    }
}

/// Looks an entity up by id. Read-only: nothing is cached for undo, so a
/// rollback is a no-op success.
pub struct FindEntityCommand<T: PersistEntity> {
    command_id: String,
    gateway: Arc<dyn EntityGateway<T>>,
    cache: EntityCache<T>,
}

impl<T: PersistEntity> FindEntityCommand<T> {
    pub fn new(gateway: Arc<dyn EntityGateway<T>>) -> Self {
        Self {
            command_id: format!("{}.find", T::ENTITY_NAME),
            gateway,
            cache: EntityCache::new(),
        }
    }
}

#[async_trait]
impl<T: PersistEntity> Command for FindEntityCommand<T> {
    fn command_id(&self) -> &str {
        &self.command_id
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        entity_id_from_input(&self.command_id, &input)
            .map_err(|err| CommandError::ContextCreation(err.to_string()))?;
        Ok(CommandContext::ready(&self.command_id, input))
    }

    async fn do_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        let input = ctx.redo_parameter().cloned().unwrap_or(Value::Null);
        let id = entity_id_from_input(&self.command_id, &input)?;
        let found = self
            .cache
            .retrieve_entity(id, self.gateway.as_ref(), PersistEntity::adopt_copy)
            .await?;
        ctx.complete(serde_json::to_value(&found)?)
    }

    async fn undo_command(&self, _action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.cache
            .rollback_cached_entity(ctx, self.gateway.as_ref(), false)
            .await
    }
}

/// Registers the four command families for one entity type.
pub fn register_entity_commands<T: PersistEntity>(
    registry: &mut CommandRegistry,
    gateway: Arc<dyn EntityGateway<T>>,
) {
    registry.register(Arc::new(CreateEntityCommand::new(gateway.clone())));
    registry.register(Arc::new(UpdateEntityCommand::new(gateway.clone())));
    registry.register(Arc::new(DeleteEntityCommand::new(gateway.clone())));
    registry.register(Arc::new(FindEntityCommand::new(gateway)));
}
