use campusops::{
    ActionContext, Command, CommandActionExecutor, CommandContext, CommandError, CommandMessage,
    CommandState, Direction, EnginePolicy, EntityGateway, InMemoryGateway, Student, share,
};
use campusops::commands::CreateEntityCommand;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingCommand {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Command for CountingCommand {
    fn command_id(&self) -> &str {
        "counting"
    }

    fn prepare_context(&self, input: Value) -> campusops::Result<CommandContext> {
        Ok(CommandContext::ready("counting", input))
    }

    async fn do_command(
        &self,
        _action: &ActionContext,
        ctx: &mut CommandContext,
    ) -> campusops::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ctx.complete(json!(true))
    }

    async fn undo_command(
        &self,
        _action: &ActionContext,
        _ctx: &mut CommandContext,
    ) -> campusops::Result<()> {
        Ok(())
    }
}

fn test_policy() -> EnginePolicy {
    EnginePolicy {
        worker_permits: 16,
        ..EnginePolicy::default()
    }
}

fn student_input() -> Value {
    json!({
        "id": null,
        "first_name": "Ada",
        "last_name": "Lovelace",
        "email": "ada@example.edu",
        "faculty_id": null
    })
}

#[tokio::test]
async fn do_command_in_init_state_fails_without_running_business_logic() {
    let executor = CommandActionExecutor::new(&test_policy());
    let invocations = Arc::new(AtomicUsize::new(0));
    let command: Arc<dyn Command> = Arc::new(CountingCommand {
        invocations: invocations.clone(),
    });

    // Context built but never validated: still INIT.
    let ctx = share(CommandContext::new("counting"));
    let msg = CommandMessage::new(
        Direction::Do,
        ActionContext::new("test", "do"),
        command,
        ctx.clone(),
    );
    executor.process_action_command(&msg).await.unwrap();

    let guard = ctx.lock().await;
    assert_eq!(guard.state(), CommandState::Fail);
    assert!(matches!(
        guard.exception(),
        Some(CommandError::IllegalState { .. })
    ));
    assert!(guard.result().is_none());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn do_command_on_done_context_fails_and_never_saves_again() {
    let executor = CommandActionExecutor::new(&test_policy());
    let gateway = Arc::new(InMemoryGateway::<Student>::new());
    let facade: Arc<dyn EntityGateway<Student>> = gateway.clone();
    let command: Arc<dyn Command> = Arc::new(CreateEntityCommand::new(facade));

    let ctx = share(command.prepare_context(student_input()).unwrap());
    let action = ActionContext::new("student-api", "create");
    executor
        .commit_action(&action, command.clone(), ctx.clone())
        .await
        .unwrap();
    assert_eq!(ctx.lock().await.state(), CommandState::Done);
    assert_eq!(gateway.len().await, 1);

    // A second DO against the same (now DONE) context must be refused
    // before the save function could run again.
    executor
        .commit_action(&action, command, ctx.clone())
        .await
        .unwrap();
    let guard = ctx.lock().await;
    assert_eq!(guard.state(), CommandState::Fail);
    assert!(matches!(
        guard.exception(),
        Some(CommandError::IllegalState { .. })
    ));
    assert_eq!(gateway.len().await, 1);
}

#[tokio::test]
async fn unknown_direction_marks_context_failed() {
    let executor = CommandActionExecutor::new(&test_policy());
    let command: Arc<dyn Command> = Arc::new(CountingCommand {
        invocations: Arc::new(AtomicUsize::new(0)),
    });
    let ctx = share(CommandContext::ready("counting", json!({})));
    let msg = CommandMessage::new(
        Direction::Unknown,
        ActionContext::new("test", "confused"),
        command,
        ctx.clone(),
    );
    executor.process_action_command(&msg).await.unwrap();

    let guard = ctx.lock().await;
    assert_eq!(guard.state(), CommandState::Fail);
    assert_eq!(
        guard.exception(),
        Some(&CommandError::UndefinedDirection(msg.correlation_id))
    );
}

#[tokio::test]
async fn undo_without_cached_payload_is_noop_success() {
    let executor = CommandActionExecutor::new(&test_policy());
    let gateway = Arc::new(InMemoryGateway::<Student>::new());
    let facade: Arc<dyn EntityGateway<Student>> = gateway.clone();
    let command: Arc<dyn Command> = Arc::new(CreateEntityCommand::new(facade));

    // Force a DONE context with no undo payload: complete it by hand.
    let mut ctx = CommandContext::ready("student.create", student_input());
    ctx.begin_do().unwrap();
    ctx.complete(json!({})).unwrap();
    let shared = share(ctx);

    executor
        .rollback_action(&ActionContext::new("test", "undo"), command, shared.clone())
        .await
        .unwrap();
    assert_eq!(shared.lock().await.state(), CommandState::Undone);
}

#[tokio::test]
async fn failed_context_carries_exception_and_no_result() {
    struct ExplodingCommand;

    #[async_trait]
    impl Command for ExplodingCommand {
        fn command_id(&self) -> &str {
            "exploding"
        }

        fn prepare_context(&self, input: Value) -> campusops::Result<CommandContext> {
            Ok(CommandContext::ready("exploding", input))
        }

        async fn do_command(
            &self,
            _action: &ActionContext,
            _ctx: &mut CommandContext,
        ) -> campusops::Result<()> {
            Err(CommandError::Persistence("constraint violated".to_string()))
        }

        async fn undo_command(
            &self,
            _action: &ActionContext,
            _ctx: &mut CommandContext,
        ) -> campusops::Result<()> {
            Ok(())
        }
    }

    let executor = CommandActionExecutor::new(&test_policy());
    let command: Arc<dyn Command> = Arc::new(ExplodingCommand);
    let ctx = share(command.prepare_context(json!({})).unwrap());
    executor
        .commit_action(&ActionContext::new("test", "do"), command, ctx.clone())
        .await
        .unwrap();

    let guard = ctx.lock().await;
    assert_eq!(guard.state(), CommandState::Fail);
    assert_eq!(
        guard.exception(),
        Some(&CommandError::Persistence("constraint violated".to_string()))
    );
    assert!(guard.result().is_none());
}
