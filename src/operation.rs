//! The asynchronous operation engine.
//!
//! An operation is a cancellable, observable unit of work running on its own
//! tokio worker. It owns at most one live remote task handle at a time and
//! drives it with a jittered, backed-off poll loop. Observers receive whole
//! state snapshots over a watch channel: delivery is at-least-once and
//! snapshots are idempotent to re-apply.

use crate::config::{EngineConfig, PollConfig};
use crate::failure::Failure;
use crate::objects::TaskRef;
use crate::registry::OperationRegistry;
use crate::rpc::{Connection, RemoteTaskStatus, RpcSession};
use crate::{PoolError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Point-in-time view of an operation, suitable for direct rendering.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub state: OperationState,
    /// 0-100, monotonically non-decreasing.
    pub percent: f64,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub safe_to_exit: bool,
    pub suppress_history: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A unit of work the engine can run. Implementations hold everything they
/// need up front; `run` is invoked once, on a background worker.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    fn title(&self) -> String;

    fn description(&self) -> String {
        self.title()
    }

    /// RBAC permissions this operation needs, for the fail-fast pre-check.
    fn required_permissions(&self) -> Vec<String> {
        Vec::new()
    }

    /// The connection whose session is consulted for the permission
    /// pre-check.
    fn connection(&self) -> Option<Arc<Connection>> {
        None
    }

    /// False while the client should warn before exiting mid-operation.
    fn safe_to_exit(&self) -> bool {
        true
    }

    fn suppress_history(&self) -> bool {
        false
    }

    /// Remote object references this operation applies to, for the
    /// at-most-one-in-progress registry query.
    fn applies_to(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, ctx: &OpContext) -> Result<()>;
}

#[derive(Clone)]
struct LiveTask {
    task: TaskRef,
    session: Arc<dyn RpcSession>,
}

struct MutableState {
    state: OperationState,
    percent: f64,
    description: String,
    error: Option<String>,
    error_code: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) struct OperationCore {
    id: Uuid,
    title: String,
    safe_to_exit: bool,
    suppress_history: bool,
    applies_to: Vec<String>,
    created_at: DateTime<Utc>,
    poll: PollConfig,
    state: Mutex<MutableState>,
    events: watch::Sender<OperationSnapshot>,
    cancel: CancellationToken,
    live_task: Mutex<Option<LiveTask>>,
}

impl OperationCore {
    fn new(op: &dyn Operation, poll: PollConfig) -> Arc<Self> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let initial = OperationSnapshot {
            id,
            title: op.title(),
            description: op.description(),
            state: OperationState::Created,
            percent: 0.0,
            error: None,
            error_code: None,
            safe_to_exit: op.safe_to_exit(),
            suppress_history: op.suppress_history(),
            created_at,
            finished_at: None,
        };
        let (events, _) = watch::channel(initial.clone());
        Arc::new(Self {
            id,
            title: initial.title.clone(),
            safe_to_exit: initial.safe_to_exit,
            suppress_history: initial.suppress_history,
            applies_to: op.applies_to(),
            created_at,
            poll,
            state: Mutex::new(MutableState {
                state: OperationState::Created,
                percent: 0.0,
                description: initial.description.clone(),
                error: None,
                error_code: None,
                finished_at: None,
            }),
            events,
            cancel: CancellationToken::new(),
            live_task: Mutex::new(None),
        })
    }

    fn snapshot(&self) -> OperationSnapshot {
        let st = self.state.lock().unwrap();
        OperationSnapshot {
            id: self.id,
            title: self.title.clone(),
            description: st.description.clone(),
            state: st.state,
            percent: st.percent,
            error: st.error.clone(),
            error_code: st.error_code.clone(),
            safe_to_exit: self.safe_to_exit,
            suppress_history: self.suppress_history,
            created_at: self.created_at,
            finished_at: st.finished_at,
        }
    }

    fn publish(&self) {
        self.events.send_replace(self.snapshot());
    }

    fn set_state(&self, state: OperationState) {
        self.state.lock().unwrap().state = state;
        self.publish();
    }

    /// Global percent, clamped monotonic: a backwards report is ignored.
    fn set_percent(&self, percent: f64) {
        {
            let mut st = self.state.lock().unwrap();
            let clamped = percent.clamp(0.0, 100.0);
            if clamped <= st.percent {
                return;
            }
            st.percent = clamped;
        }
        self.publish();
    }

    fn set_description(&self, description: String) {
        self.state.lock().unwrap().description = description;
        self.publish();
    }

    fn finish(&self, state: OperationState, error: Option<&PoolError>) {
        {
            let mut st = self.state.lock().unwrap();
            st.state = state;
            st.finished_at = Some(Utc::now());
            if state == OperationState::Completed {
                st.percent = 100.0;
            }
            if let Some(e) = error {
                st.error = Some(e.to_string());
                st.error_code = e.code().map(str::to_string);
            }
        }
        self.publish();
    }

    fn set_live_task(&self, task: &TaskRef, session: &Arc<dyn RpcSession>) {
        *self.live_task.lock().unwrap() = Some(LiveTask {
            task: task.clone(),
            session: session.clone(),
        });
    }

    fn take_live_task(&self) -> Option<LiveTask> {
        self.live_task.lock().unwrap().take()
    }

    fn live_task(&self) -> Option<LiveTask> {
        self.live_task.lock().unwrap().clone()
    }
}

/// Caller-side view of a started operation.
#[derive(Clone)]
pub struct OperationHandle {
    core: Arc<OperationCore>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.core.id)
            .field("title", &self.core.title)
            .finish_non_exhaustive()
    }
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn title(&self) -> &str {
        &self.core.title
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        self.core.snapshot()
    }

    pub fn state(&self) -> OperationState {
        self.core.state.lock().unwrap().state
    }

    pub fn percent(&self) -> f64 {
        self.core.state.lock().unwrap().percent
    }

    pub fn error_message(&self) -> Option<String> {
        self.core.state.lock().unwrap().error.clone()
    }

    pub fn error_code(&self) -> Option<String> {
        self.core.state.lock().unwrap().error_code.clone()
    }

    pub fn suppress_history(&self) -> bool {
        self.core.suppress_history
    }

    pub fn applies_to(&self) -> &[String] {
        &self.core.applies_to
    }

    /// Watch channel of state/percent/description snapshots.
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.core.events.subscribe()
    }

    /// Request cooperative cancellation. Only effective while the operation
    /// is queued or running; a live remote task receives a cancel request
    /// and the next poll cycle observes the terminal state.
    pub async fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.core.cancel.cancel();
        if let Some(live) = self.core.live_task() {
            if let Err(e) = live.session.task_cancel(&live.task).await {
                warn!(task = %live.task, error = %e, "remote task cancel request failed");
            }
        }
    }

    /// Wait for the operation to reach a terminal state.
    pub async fn wait(&self) -> OperationState {
        let mut rx = self.subscribe();
        loop {
            let state = rx.borrow().state;
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Execution context handed to `Operation::run`, scoped to a sub-range of
/// the 0-100 percent scale so composite operations can nest children.
#[derive(Clone)]
pub struct OpContext {
    core: Arc<OperationCore>,
    lo: f64,
    hi: f64,
}

impl OpContext {
    pub fn cancelled(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    /// Cooperative cancellation check, called at phase boundaries.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            Err(PoolError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Set progress local to this context's range (0-100).
    pub fn set_percent(&self, local: f64) {
        let frac = local.clamp(0.0, 100.0) / 100.0;
        self.core.set_percent(self.lo + frac * (self.hi - self.lo));
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.core.set_description(description.into());
    }

    /// A child context occupying the `[lo, hi]` slice (local percent) of
    /// this one. Phase boundaries must be monotonic.
    pub fn subrange(&self, lo: f64, hi: f64) -> OpContext {
        let span = self.hi - self.lo;
        OpContext {
            core: self.core.clone(),
            lo: self.lo + lo.clamp(0.0, 100.0) / 100.0 * span,
            hi: self.lo + hi.clamp(0.0, 100.0) / 100.0 * span,
        }
    }

    /// Poll a remote task to completion, mapping its progress fraction
    /// linearly into `[start, end]` (local percent). Returns the task's
    /// result payload on success.
    ///
    /// A task handle the server no longer knows about counts as success:
    /// completed remote tasks may be reaped before we observe them.
    pub async fn poll_task(
        &self,
        session: &Arc<dyn RpcSession>,
        task: &TaskRef,
        start: f64,
        end: f64,
    ) -> Result<Option<String>> {
        self.core.set_live_task(task, session);
        let result = self.poll_task_inner(session, task, start, end).await;
        self.core.take_live_task();
        if let Err(e) = session.task_destroy(task).await {
            debug!(task = %task, error = %e, "remote task destroy failed");
        }
        result
    }

    async fn poll_task_inner(
        &self,
        session: &Arc<dyn RpcSession>,
        task: &TaskRef,
        start: f64,
        end: f64,
    ) -> Result<Option<String>> {
        let poll = &self.core.poll;
        let mut interval = poll.initial();
        let mut cancel_sent = false;

        loop {
            let status = match session.task_status(task).await {
                Ok(t) => t,
                Err(e) if task_vanished(&e) => {
                    debug!(task = %task, "remote task vanished, treating as success");
                    self.set_percent(end);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match status.status {
                RemoteTaskStatus::Success => {
                    self.set_percent(end);
                    return Ok(status.result);
                }
                RemoteTaskStatus::Failure => {
                    return Err(PoolError::Remote(Failure::from_error_info(
                        &status.error_info,
                    )));
                }
                RemoteTaskStatus::Cancelled => return Err(PoolError::Cancelled),
                RemoteTaskStatus::Pending => {
                    let frac = status.progress.clamp(0.0, 1.0);
                    self.set_percent(start + frac * (end - start));

                    if self.cancelled() && !cancel_sent {
                        if let Err(e) = session.task_cancel(task).await {
                            warn!(task = %task, error = %e, "remote task cancel request failed");
                        }
                        cancel_sent = true;
                    }

                    tokio::time::sleep(jittered(interval)).await;
                    interval = interval.mul_f64(1.5).min(poll.max());
                }
            }
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

fn task_vanished(err: &PoolError) -> bool {
    matches!(err.code(), Some("HANDLE_INVALID") | Some("TASK_NOT_FOUND"))
        || matches!(err, PoolError::ObjectNotFound { kind: "task", .. })
}

/// Starts operations on background workers and registers them for history
/// and per-object bookkeeping.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<OperationRegistry>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let registry = Arc::new(OperationRegistry::new(config.history_limit));
        Arc::new(Self { config, registry })
    }

    pub fn registry(&self) -> Arc<OperationRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Begin executing an operation; returns immediately with its handle.
    /// Fails synchronously when a required permission is known to be absent.
    pub fn start(&self, op: Arc<dyn Operation>) -> Result<OperationHandle> {
        if self.config.precheck_permissions {
            if let Some(connection) = op.connection() {
                if let Ok(session) = connection.session() {
                    for permission in op.required_permissions() {
                        if !session.has_permission(&permission) {
                            return Err(PoolError::PermissionDenied(permission));
                        }
                    }
                }
            }
        }

        let core = OperationCore::new(op.as_ref(), self.config.poll.clone());
        let handle = OperationHandle { core: core.clone() };
        core.set_state(OperationState::Queued);
        self.registry.register(handle.clone());

        let registry = self.registry.clone();
        tokio::spawn(async move {
            run_to_completion(op, core, registry).await;
        });

        Ok(handle)
    }
}

async fn run_to_completion(
    op: Arc<dyn Operation>,
    core: Arc<OperationCore>,
    registry: Arc<OperationRegistry>,
) {
    // Cancelled while queued: never reaches Running, no remote call is made.
    if core.cancel.is_cancelled() {
        info!(id = %core.id, title = %core.title, "operation cancelled before start");
        core.finish(OperationState::Cancelled, None);
        registry.finish(core.id);
        return;
    }

    core.set_state(OperationState::Running);
    info!(id = %core.id, title = %core.title, "operation started");

    let ctx = OpContext {
        core: core.clone(),
        lo: 0.0,
        hi: 100.0,
    };
    let result = op.run(&ctx).await;

    // Release any remote task handle left over by an abrupt exit.
    if let Some(live) = core.take_live_task() {
        if let Err(e) = live.session.task_destroy(&live.task).await {
            debug!(task = %live.task, error = %e, "remote task destroy failed");
        }
    }

    match result {
        Ok(()) => {
            core.finish(OperationState::Completed, None);
            info!(id = %core.id, title = %core.title, "operation completed");
        }
        Err(PoolError::Cancelled) => {
            core.finish(OperationState::Cancelled, None);
            info!(id = %core.id, title = %core.title, "operation cancelled");
        }
        Err(e) => {
            error!(id = %core.id, title = %core.title, error = %e, "operation failed");
            core.finish(OperationState::Failed, Some(&e));
        }
    }
    registry.finish(core.id);
}

/// Runs children strictly in sequence, each occupying an equal slice of the
/// percent scale. Fails as a whole on the first child failure.
pub struct SequenceOperation {
    title: String,
    children: Vec<Arc<dyn Operation>>,
}

impl SequenceOperation {
    pub fn new(title: impl Into<String>, children: Vec<Arc<dyn Operation>>) -> Self {
        Self {
            title: title.into(),
            children,
        }
    }
}

#[async_trait]
impl Operation for SequenceOperation {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn required_permissions(&self) -> Vec<String> {
        let mut perms: Vec<String> = self
            .children
            .iter()
            .flat_map(|c| c.required_permissions())
            .collect();
        perms.sort();
        perms.dedup();
        perms
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.children.iter().find_map(|c| c.connection())
    }

    fn safe_to_exit(&self) -> bool {
        self.children.iter().all(|c| c.safe_to_exit())
    }

    fn applies_to(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.children.iter().flat_map(|c| c.applies_to()).collect();
        refs.sort();
        refs.dedup();
        refs
    }

    async fn run(&self, ctx: &OpContext) -> Result<()> {
        let n = self.children.len().max(1) as f64;
        for (i, child) in self.children.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.set_description(child.description());
            let lo = i as f64 / n * 100.0;
            let hi = (i + 1) as f64 / n * 100.0;
            child.run(&ctx.subrange(lo, hi)).await?;
        }
        Ok(())
    }
}
