use campusops::{
    ActionContext, Command, CommandActionExecutor, CommandContext, CommandError, CommandState,
    EnginePolicy, EntityCache, EntityGateway, InMemoryGateway, PersistEntity, Student,
    UndoPayload, share,
};
use campusops::commands::CreateEntityCommand;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

fn test_policy() -> EnginePolicy {
    EnginePolicy {
        worker_permits: 16,
        ..EnginePolicy::default()
    }
}

fn student(id: Option<Uuid>, email: &str) -> Student {
    Student {
        id,
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        email: email.to_string(),
        faculty_id: None,
    }
}

#[tokio::test]
async fn retrieve_entity_returns_adapted_copy_or_typed_not_found() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();

    let saved = gateway
        .save(student(None, "ada@example.edu"))
        .await
        .unwrap();
    let id = saved.id().unwrap();

    let copy = cache
        .retrieve_entity(id, &gateway, Student::adopt_copy)
        .await
        .unwrap();
    assert_eq!(copy.email, "ada@example.edu");

    let missing = Uuid::new_v4();
    let err = cache
        .retrieve_entity(missing, &gateway, Student::adopt_copy)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CommandError::EntityNotFound {
            entity: "student".to_string(),
            id: missing.to_string(),
        }
    );
}

#[tokio::test]
async fn rollback_restore_branch_saves_snapshot_back() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();

    let original = gateway
        .save(student(None, "before@example.edu"))
        .await
        .unwrap();
    let id = original.id().unwrap();
    gateway
        .save(student(Some(id), "after@example.edu"))
        .await
        .unwrap();

    let mut ctx = CommandContext::ready("student.update", json!({}));
    ctx.set_undo_parameter(UndoPayload::Restore(
        serde_json::to_value(&original).unwrap(),
    ));
    cache
        .rollback_cached_entity(&mut ctx, &gateway, false)
        .await
        .unwrap();

    let restored = gateway.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(restored.email, "before@example.edu");
}

#[tokio::test]
async fn rollback_delete_branch_removes_row_and_clears_redo_id() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();

    let created = gateway
        .save(student(None, "new@example.edu"))
        .await
        .unwrap();
    let id = created.id().unwrap();

    let mut ctx = CommandContext::ready(
        "student.create",
        serde_json::to_value(&created).unwrap(),
    );
    ctx.set_undo_parameter(UndoPayload::DeleteById(id));
    cache
        .rollback_cached_entity(&mut ctx, &gateway, true)
        .await
        .unwrap();

    assert!(gateway.find_by_id(id).await.unwrap().is_none());
    assert_eq!(
        ctx.redo_parameter().and_then(|redo| redo.get("id")),
        Some(&Value::Null)
    );
    assert!(ctx.result().is_none());
}

#[tokio::test]
async fn rollback_shape_mismatches_fail_with_parameter_type_error() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();

    // A snapshot that is not a student.
    let mut ctx = CommandContext::ready("student.update", json!({}));
    ctx.set_undo_parameter(UndoPayload::Restore(json!("not a student")));
    let err = cache
        .rollback_cached_entity(&mut ctx, &gateway, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ParameterType(_)));

    // A created-entity id on a command that does not permit delete.
    let mut ctx = CommandContext::ready("student.update", json!({}));
    ctx.set_undo_parameter(UndoPayload::DeleteById(Uuid::new_v4()));
    let err = cache
        .rollback_cached_entity(&mut ctx, &gateway, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ParameterType(_)));
}

#[tokio::test]
async fn rollback_with_nothing_cached_is_noop() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();
    let mut ctx = CommandContext::ready("student.update", json!({}));
    cache
        .rollback_cached_entity(&mut ctx, &gateway, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn create_then_rollback_clears_id_and_result() {
    let executor = CommandActionExecutor::new(&test_policy());
    let gateway = Arc::new(InMemoryGateway::<Student>::new());
    let facade: Arc<dyn EntityGateway<Student>> = gateway.clone();
    let command: Arc<dyn Command> = Arc::new(CreateEntityCommand::new(facade));
    let action = ActionContext::new("student-api", "create");

    let ctx = share(
        command
            .prepare_context(serde_json::to_value(student(None, "ada@example.edu")).unwrap())
            .unwrap(),
    );
    executor
        .commit_action(&action, command.clone(), ctx.clone())
        .await
        .unwrap();

    let created_id = {
        let guard = ctx.lock().await;
        assert_eq!(guard.state(), CommandState::Done);
        match guard.undo_parameter() {
            Some(UndoPayload::DeleteById(id)) => *id,
            other => panic!("expected DeleteById undo payload, got {other:?}"),
        }
    };
    assert_eq!(gateway.len().await, 1);

    executor
        .rollback_action(&action, command, ctx.clone())
        .await
        .unwrap();

    let guard = ctx.lock().await;
    assert_eq!(guard.state(), CommandState::Undone);
    assert!(gateway.find_by_id(created_id).await.unwrap().is_none());
    assert_eq!(
        guard.redo_parameter().and_then(|redo| redo.get("id")),
        Some(&Value::Null)
    );
    assert!(guard.result().is_none());
    assert!(guard.undo_parameter().is_none());
}

#[tokio::test]
async fn persist_redo_entity_rejects_mismatched_payload() {
    let gateway = InMemoryGateway::<Student>::new();
    let cache = EntityCache::<Student>::new();
    let ctx = CommandContext::ready("student.create", json!([1, 2, 3]));
    let err = cache
        .persist_redo_entity(&ctx, &gateway)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::ParameterType(_)));
    assert!(gateway.is_empty().await);
}
