//! Narrow persistence facades consumed by the command engine.
//!
//! The engine never issues raw queries; everything goes through
//! [`EntityGateway`]. Request processing is wrapped by a
//! [`TransactionBoundary`] supplied by the hosting application.

use crate::core::{CommandError, Result};
use crate::domain::PersistEntity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-entity persistence facade: find, save, delete.
#[async_trait]
pub trait EntityGateway<T: PersistEntity>: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<T>>;

    /// Persists the entity, assigning an id when it has none.
    /// Returns the persisted copy (with its id populated).
    async fn save(&self, entity: T) -> Result<T>;

    /// Returns `true` when a row was actually removed.
    async fn delete_by_id(&self, id: Uuid) -> Result<bool>;
}

/// Transaction demarcation supplied by the persistence collaborator.
///
/// The engine calls `begin`/`commit`/`rollback` around each command
/// execution and holds no locks of its own across the boundary.
#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Boundary for deployments without transactional storage (and for tests).
#[derive(Debug, Default)]
pub struct NoopTransaction;

#[async_trait]
impl TransactionBoundary for NoopTransaction {
    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process gateway used by tests and demos.
pub struct InMemoryGateway<T: PersistEntity> {
    rows: Arc<Mutex<HashMap<Uuid, T>>>,
}

impl<T: PersistEntity> InMemoryGateway<T> {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

impl<T: PersistEntity> Default for InMemoryGateway<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PersistEntity> Clone for InMemoryGateway<T> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
        }
    }
}

#[async_trait]
impl<T: PersistEntity> EntityGateway<T> for InMemoryGateway<T> {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<T>> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&id).map(|row| row.adopt_copy()))
    }

    async fn save(&self, mut entity: T) -> Result<T> {
        let id = match entity.id() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                entity.set_id(Some(id));
                id
            }
        };
        let mut rows = self.rows.lock().await;
        rows.insert(id, entity.adopt_copy());
        Ok(entity)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        Ok(rows.remove(&id).is_some())
    }
}

/// Gateway wrapper that refuses deletion while a dependent check trips.
///
/// Facades use this to surface the caller-visible "has dependents" error
/// instead of an opaque persistence failure.
pub struct GuardedGateway<T: PersistEntity> {
    inner: Arc<dyn EntityGateway<T>>,
    guard: Arc<dyn Fn(Uuid) -> bool + Send + Sync>,
}

impl<T: PersistEntity> GuardedGateway<T> {
    pub fn new(
        inner: Arc<dyn EntityGateway<T>>,
        guard: Arc<dyn Fn(Uuid) -> bool + Send + Sync>,
    ) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl<T: PersistEntity> EntityGateway<T> for GuardedGateway<T> {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<T>> {
        self.inner.find_by_id(id).await
    }

    async fn save(&self, entity: T) -> Result<T> {
        self.inner.save(entity).await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        if (self.guard)(id) {
            return Err(CommandError::DependentEntities {
                entity: T::ENTITY_NAME.to_string(),
                id: id.to_string(),
            });
        }
        self.inner.delete_by_id(id).await
    }
}
