use crate::core::Result;
use crate::engine::context::CommandContext;
use crate::messaging::message::ActionContext;
use async_trait::async_trait;
use serde_json::Value;

/// A uniform, undoable unit of work.
///
/// Commands never set `Fail` themselves; they return the error and the
/// executor captures it into the context, so there is exactly one place the
/// state machine is driven from. A successful `do_command` must call
/// [`CommandContext::complete`] before returning — the executor treats an
/// `Ok` return on a non-`Done` context as a broken command.
#[async_trait]
pub trait Command: Send + Sync {
    fn command_id(&self) -> &str;

    /// Builds a `Ready` context from raw caller input.
    ///
    /// Fails with a context-creation error when the input cannot be adapted
    /// to the command's parameter shape.
    fn prepare_context(&self, input: Value) -> Result<CommandContext>;

    /// Forward operation. Precondition (enforced by the executor): the
    /// context is in `Work`, having come from `Ready`.
    async fn do_command(
        &self,
        action: &ActionContext,
        ctx: &mut CommandContext,
    ) -> Result<()>;

    /// Inverse operation. With no undo parameter cached this is a no-op
    /// success; the executor then marks the context `Undone`.
    async fn undo_command(
        &self,
        action: &ActionContext,
        ctx: &mut CommandContext,
    ) -> Result<()>;
}
