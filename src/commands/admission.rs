//! Admit-student composite: create the student, then create a profile
//! linked to the freshly assigned student id.
//!
//! The steps double as the reference implementation of result transfer
//! between sequential nested commands.

use crate::core::{CommandError, Result};
use crate::domain::{Profile, Student};
use crate::engine::command::Command;
use crate::engine::composite::{MacroCommand, NestedCommand};
use crate::engine::context::CommandContext;
use crate::engine::executor::CommandActionExecutor;
use crate::messaging::message::ActionContext;
use crate::persist::EntityGateway;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::CreateEntityCommand;

pub const ADMIT_STUDENT_COMMAND: &str = "admission.admit_student";

/// Step 1: create the student from the macro input's `student` field.
pub struct CreateStudentStep {
    inner: CreateEntityCommand<Student>,
}

impl CreateStudentStep {
    pub fn new(gateway: Arc<dyn EntityGateway<Student>>) -> Self {
        Self {
            inner: CreateEntityCommand::new(gateway),
        }
    }
}

#[async_trait]
impl Command for CreateStudentStep {
    fn command_id(&self) -> &str {
        self.inner.command_id()
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        self.inner.prepare_context(input)
    }

    async fn do_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.inner.do_command(action, ctx).await
    }

    async fn undo_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.inner.undo_command(action, ctx).await
    }
}

#[async_trait]
impl NestedCommand for CreateStudentStep {
    fn prepare_nested_context(&self, macro_input: &Value) -> Result<CommandContext> {
        let student = macro_input.get("student").cloned().ok_or_else(|| {
            CommandError::ContextCreation(
                "admission input requires a 'student' field".to_string(),
            )
        })?;
        self.inner.prepare_context(student)
    }
}

/// Step 2: create the profile, linked to the student created by step 1.
pub struct CreateProfileStep {
    inner: CreateEntityCommand<Profile>,
}

impl CreateProfileStep {
    pub fn new(gateway: Arc<dyn EntityGateway<Profile>>) -> Self {
        Self {
            inner: CreateEntityCommand::new(gateway),
        }
    }
}

#[async_trait]
impl Command for CreateProfileStep {
    fn command_id(&self) -> &str {
        self.inner.command_id()
    }

    fn prepare_context(&self, input: Value) -> Result<CommandContext> {
        self.inner.prepare_context(input)
    }

    async fn do_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.inner.do_command(action, ctx).await
    }

    async fn undo_command(&self, action: &ActionContext, ctx: &mut CommandContext) -> Result<()> {
        self.inner.undo_command(action, ctx).await
    }
}

#[async_trait]
impl NestedCommand for CreateProfileStep {
    fn prepare_nested_context(&self, macro_input: &Value) -> Result<CommandContext> {
        let profile = macro_input.get("profile").cloned().ok_or_else(|| {
            CommandError::ContextCreation(
                "admission input requires a 'profile' field".to_string(),
            )
        })?;
        self.inner.prepare_context(profile)
    }

    /// The created student's id becomes the profile's `student_id`.
    fn transfer_result(&self, source: &CommandContext, target: &mut CommandContext) {
        let student_id = source
            .result()
            .and_then(|student| student.get("id"))
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(Value::Object(mut fields)) = target.redo_parameter().cloned() {
            fields.insert("student_id".to_string(), student_id);
            target.set_redo_parameter(Some(Value::Object(fields)));
        }
    }
}

/// Builds the sequential admit-student macro over the given gateways.
pub fn admit_student_command(
    students: Arc<dyn EntityGateway<Student>>,
    profiles: Arc<dyn EntityGateway<Profile>>,
    executor: Arc<CommandActionExecutor>,
) -> MacroCommand {
    MacroCommand::sequential(
        ADMIT_STUDENT_COMMAND,
        vec![
            Arc::new(CreateStudentStep::new(students)),
            Arc::new(CreateProfileStep::new(profiles)),
        ],
        executor,
    )
}
