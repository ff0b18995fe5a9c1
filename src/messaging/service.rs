use crate::core::{CommandError, Result};
use crate::engine::EnginePolicy;
use crate::engine::context::{SharedContext, share};
use crate::engine::executor::CommandActionExecutor;
use crate::engine::registry::CommandRegistry;
use crate::messaging::message::{ActionContext, CommandMessage, Direction, WireMessage};
use crate::messaging::watchdog::{MessageProgressWatchdog, WatchdogRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{Level, event};
use uuid::Uuid;

/// Watchdog-backed handle returned to an asynchronous submitter.
pub struct WatchdogHandle {
    watchdog: Arc<MessageProgressWatchdog>,
    default_timeout: Duration,
    watchdogs: Arc<WatchdogRegistry>,
    inflight: Arc<StdMutex<HashMap<Uuid, CommandMessage>>>,
}

impl WatchdogHandle {
    pub fn correlation_id(&self) -> Uuid {
        self.watchdog.correlation_id()
    }

    /// Blocks until the response loop signals or the service's default
    /// watchdog timeout elapses.
    pub async fn await_result(&self) -> Result<SharedContext> {
        self.await_result_with_timeout(self.default_timeout).await
    }

    pub async fn await_result_with_timeout(&self, limit: Duration) -> Result<SharedContext> {
        match self.watchdog.await_result(limit).await {
            Err(err @ CommandError::WatchdogTimeout(_)) => {
                self.abandon();
                Err(err)
            }
            other => other,
        }
    }

    // A caller that timed out is gone; its bookkeeping goes with it so
    // neither the watchdog registry nor the in-flight table can accumulate
    // abandoned correlations.
    fn abandon(&self) {
        let correlation_id = self.watchdog.correlation_id();
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&correlation_id);
        }
        if let Err(err) = self.watchdogs.discard(&correlation_id) {
            event!(Level::ERROR, error = %err, "watchdog registry lock failed");
        }
    }
}

impl fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogHandle")
            .field("correlation_id", &self.watchdog.correlation_id())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Decouples command submission from execution through an in-process,
/// best-effort message channel.
///
/// Two background loops share the service's active flag: the request loop
/// executes submitted messages through the executor choke point, the
/// response loop completes pending callers by correlation id. Shutdown is
/// cooperative — a poison message is injected and each loop exits after
/// observing it; no worker is ever killed mid-message.
pub struct CommandMessageService {
    executor: Arc<CommandActionExecutor>,
    registry: Arc<CommandRegistry>,
    policy: EnginePolicy,
    request_tx: mpsc::Sender<String>,
    response_tx: mpsc::Sender<String>,
    request_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    response_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    inflight: Arc<StdMutex<HashMap<Uuid, CommandMessage>>>,
    watchdogs: Arc<WatchdogRegistry>,
    active: Arc<AtomicBool>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl CommandMessageService {
    pub fn new(registry: Arc<CommandRegistry>, policy: EnginePolicy) -> Self {
        let executor = Arc::new(CommandActionExecutor::new(&policy));
        let (request_tx, request_rx) = mpsc::channel(policy.queue_capacity);
        let (response_tx, response_rx) = mpsc::channel(policy.queue_capacity);
        Self {
            executor,
            registry,
            policy,
            request_tx,
            response_tx,
            request_rx: Arc::new(Mutex::new(request_rx)),
            response_rx: Arc::new(Mutex::new(response_rx)),
            inflight: Arc::new(StdMutex::new(HashMap::new())),
            watchdogs: Arc::new(WatchdogRegistry::new()),
            active: Arc::new(AtomicBool::new(false)),
            workers: StdMutex::new(Vec::new()),
        }
    }

    /// The executor this service dispatches through; macro commands are
    /// built over the same instance so nested execution shares the worker
    /// pool.
    pub fn executor(&self) -> Arc<CommandActionExecutor> {
        self.executor.clone()
    }

    pub fn registry(&self) -> Arc<CommandRegistry> {
        self.registry.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of loop workers currently owned by the service.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|workers| workers.len()).unwrap_or(0)
    }

    pub fn outstanding_watchdogs(&self) -> Result<usize> {
        self.watchdogs.outstanding()
    }

    /// Number of submitted messages not yet matched with a response.
    pub fn inflight_messages(&self) -> usize {
        self.inflight
            .lock()
            .map(|inflight| inflight.len())
            .unwrap_or(0)
    }

    /// Starts the request and response loops.
    ///
    /// Idempotent against being invoked while already active: the second
    /// call logs and returns without spawning another pair of loops.
    pub fn processing(&self) {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            event!(Level::INFO, "message service already active");
            return;
        }

        let request_worker = self.spawn_request_loop();
        let response_worker = self.spawn_response_loop();
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(request_worker);
            workers.push(response_worker);
        }
        event!(Level::INFO, "message service processing started");
    }

    /// Cooperative shutdown: clears the active flag, injects the poison
    /// message into both queues, and waits for the loops to observe it.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            event!(Level::INFO, "message service already inactive");
            return Ok(());
        }

        let poison = WireMessage::empty()
            .encode()
            .unwrap_or_else(|_| String::new());
        let _ = self.request_tx.send(poison.clone()).await;
        let _ = self.response_tx.send(poison).await;

        let workers: Vec<JoinHandle<()>> = self.workers.lock()?.drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                event!(Level::ERROR, error = %err, "loop worker join failed");
            }
        }
        event!(Level::INFO, "message service stopped");
        Ok(())
    }

    /// Submits a command for asynchronous execution and returns the
    /// watchdog-backed handle the caller blocks on.
    ///
    /// The command id is resolved eagerly — an unknown id fails fast. A
    /// serialization failure marks the freshly built context `Fail` and the
    /// message is dropped, never retried.
    pub async fn send_command(
        &self,
        action: ActionContext,
        command_id: &str,
        input: Value,
        direction: Direction,
    ) -> Result<WatchdogHandle> {
        let command = self.registry.resolve(command_id)?;
        let context = share(command.prepare_context(input.clone())?);
        let msg = CommandMessage::new(direction, action, command, context);
        self.submit(msg, Some(input)).await
    }

    /// Submits an UNDO message for an already-executed context.
    pub async fn send_undo(
        &self,
        action: ActionContext,
        command_id: &str,
        context: SharedContext,
    ) -> Result<WatchdogHandle> {
        let command = self.registry.resolve(command_id)?;
        let msg = CommandMessage::new(Direction::Undo, action, command, context);
        self.submit(msg, None).await
    }

    async fn submit(&self, msg: CommandMessage, payload: Option<Value>) -> Result<WatchdogHandle> {
        let context = msg.context.clone();
        let wire = WireMessage::from_message(&msg, payload);
        let raw = match wire.encode() {
            Ok(raw) => raw,
            Err(err) => {
                let err = CommandError::from(err);
                context.lock().await.failed(err.clone());
                event!(
                    Level::ERROR,
                    correlation_id = %msg.correlation_id,
                    error = %err,
                    "submission serialization failed, message dropped"
                );
                return Err(err);
            }
        };

        let correlation_id = msg.correlation_id;
        let watchdog = self.watchdogs.register(correlation_id)?;
        self.inflight.lock()?.insert(correlation_id, msg);

        if self.request_tx.send(raw).await.is_err() {
            self.watchdogs.discard(&correlation_id)?;
            self.inflight.lock()?.remove(&correlation_id);
            let err = CommandError::Execution("request queue closed".to_string());
            context.lock().await.failed(err.clone());
            return Err(err);
        }

        event!(
            Level::DEBUG,
            correlation_id = %correlation_id,
            "command message submitted"
        );
        Ok(WatchdogHandle {
            watchdog,
            default_timeout: Duration::from_millis(self.policy.watchdog_timeout_ms),
            watchdogs: self.watchdogs.clone(),
            inflight: self.inflight.clone(),
        })
    }

    /// Synchronous in-process path: executes through the choke point
    /// without touching the queues and returns the mutated context.
    pub async fn execute(
        &self,
        action: &ActionContext,
        command_id: &str,
        input: Value,
    ) -> Result<SharedContext> {
        let command = self.registry.resolve(command_id)?;
        let context = share(command.prepare_context(input)?);
        self.executor
            .commit_action(action, command, context.clone())
            .await?;
        Ok(context)
    }

    /// Synchronous rollback of a previously executed context.
    pub async fn execute_undo(
        &self,
        action: &ActionContext,
        command_id: &str,
        context: SharedContext,
    ) -> Result<SharedContext> {
        let command = self.registry.resolve(command_id)?;
        self.executor
            .rollback_action(action, command, context.clone())
            .await?;
        Ok(context)
    }

    fn spawn_request_loop(&self) -> JoinHandle<()> {
        let rx = self.request_rx.clone();
        let executor = self.executor.clone();
        let inflight = self.inflight.clone();
        let watchdogs = self.watchdogs.clone();
        let response_tx = self.response_tx.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let mut rx = rx.lock().await;
            event!(Level::DEBUG, "request loop started");
            loop {
                let raw = match rx.recv().await {
                    Some(raw) => raw,
                    None => break,
                };
                let wire = WireMessage::decode(&raw);
                if wire.is_empty() {
                    if !active.load(Ordering::Acquire) {
                        event!(Level::INFO, "request loop observed poison, stopping");
                        break;
                    }
                    event!(Level::WARN, "dropping undecodable request message");
                    continue;
                }

                let msg = match inflight.lock() {
                    Ok(inflight) => inflight.get(&wire.correlation_id).cloned(),
                    Err(err) => {
                        event!(Level::ERROR, error = %err, "in-flight table lock failed");
                        continue;
                    }
                };
                let Some(msg) = msg else {
                    event!(
                        Level::WARN,
                        correlation_id = %wire.correlation_id,
                        "no in-flight message for correlation id, dropping"
                    );
                    continue;
                };

                // The action context travels inside the message; nothing is
                // installed on the worker itself.
                if let Err(err) = executor.process_action_command(&msg).await {
                    event!(
                        Level::ERROR,
                        correlation_id = %msg.correlation_id,
                        error = %err,
                        "request processing escaped the executor"
                    );
                    msg.context.lock().await.failed(err);
                }

                let response = WireMessage::from_message(&msg, None);
                match response.encode() {
                    Ok(raw) => {
                        if response_tx.send(raw).await.is_err() {
                            event!(Level::ERROR, "response queue closed, settling caller directly");
                            settle_undeliverable(&inflight, &watchdogs, &msg);
                        }
                    }
                    Err(err) => {
                        msg.context.lock().await.failed(err.into());
                        event!(
                            Level::ERROR,
                            correlation_id = %msg.correlation_id,
                            "response serialization failed, settling caller directly"
                        );
                        settle_undeliverable(&inflight, &watchdogs, &msg);
                    }
                }
            }
            event!(Level::DEBUG, "request loop finished");
        })
    }

    fn spawn_response_loop(&self) -> JoinHandle<()> {
        let rx = self.response_rx.clone();
        let inflight = self.inflight.clone();
        let watchdogs = self.watchdogs.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let mut rx = rx.lock().await;
            event!(Level::DEBUG, "response loop started");
            loop {
                let raw = match rx.recv().await {
                    Some(raw) => raw,
                    None => break,
                };
                let wire = WireMessage::decode(&raw);
                if wire.is_empty() {
                    if !active.load(Ordering::Acquire) {
                        event!(Level::INFO, "response loop observed poison, stopping");
                        break;
                    }
                    event!(Level::WARN, "dropping undecodable response message");
                    continue;
                }

                let msg = match inflight.lock() {
                    Ok(mut inflight) => inflight.remove(&wire.correlation_id),
                    Err(err) => {
                        event!(Level::ERROR, error = %err, "in-flight table lock failed");
                        continue;
                    }
                };

                match watchdogs.take(&wire.correlation_id) {
                    Ok(Some(watchdog)) => {
                        if let Some(msg) = msg {
                            if let Err(err) = watchdog.set_result(msg.context.clone()) {
                                event!(Level::ERROR, error = %err, "watchdog result slot lock failed");
                            }
                        }
                        watchdog.message_processing_is_done();
                    }
                    Ok(None) => {
                        event!(
                            Level::WARN,
                            correlation_id = %wire.correlation_id,
                            "no watchdog for response, caller gave up or timed out"
                        );
                    }
                    Err(err) => {
                        event!(Level::ERROR, error = %err, "watchdog registry lock failed");
                    }
                }
            }
            event!(Level::DEBUG, "response loop finished");
        })
    }
}

// A response that cannot travel the response queue still settles its
// caller: the in-flight entry is removed and the watchdog is handed the
// context directly, so the submitter is released instead of waiting out
// its timeout against a message that will never arrive.
fn settle_undeliverable(
    inflight: &StdMutex<HashMap<Uuid, CommandMessage>>,
    watchdogs: &WatchdogRegistry,
    msg: &CommandMessage,
) {
    if let Ok(mut inflight) = inflight.lock() {
        inflight.remove(&msg.correlation_id);
    }
    match watchdogs.take(&msg.correlation_id) {
        Ok(Some(watchdog)) => {
            if let Err(err) = watchdog.set_result(msg.context.clone()) {
                event!(Level::ERROR, error = %err, "watchdog result slot lock failed");
            }
            watchdog.message_processing_is_done();
        }
        Ok(None) => {}
        Err(err) => {
            event!(Level::ERROR, error = %err, "watchdog registry lock failed");
        }
    }
}
