//! The environment session.
//!
//! An [`Environment`] owns one provisioned target and drives it through
//! `reset` / `step` / `evaluate` / `close`:
//!
//! ```text
//! create ──▶ Running ──▶ (reset / step / evaluate)* ──▶ close ──▶ Closed
//!               │                                        ▲
//!               └──── fatal target failure ──▶ Error ────┘
//! ```
//!
//! Acquisition failures are returned from [`EnvironmentBuilder::create`], so
//! callers never hold an environment whose target did not pass its
//! liveness probe.

use crate::action::CanonicalAction;
use crate::adapter::{Adapter, ResolutionPair};
use crate::error::{CoreError, Result};
use crate::observation::{Observation, Resolution};
use crate::task::Task;
use crate::tracer::{EventKind, RunId, TraceEvent, Tracer};
use arena_target::{
    error_codes, ControllerClient, FunctionCall, Provisioner, TargetError, TargetHandle,
    TargetState,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default timeout for connecting to a target's controller.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    /// Acquiring the target
    Creating,
    /// Target ready; operations allowed
    Running,
    /// Target failed after becoming ready; only `close` is allowed
    Error,
    /// Target released
    Closed,
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Error => write!(f, "Error"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// What `step` returns.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Observation after the last action, in the agent's resolution
    pub observation: Observation,
    /// Sum of the rewards reported for the applied actions
    pub reward: f64,
    /// True when the target ended the episode or reported a fatal condition
    pub terminated: bool,
    /// Per-step details: `dispatched`, `skipped`, `errors`, `response`
    pub info: HashMap<String, Value>,
}

struct RunTrace {
    tracer: Tracer,
    run: RunId,
}

/// Builder for [`Environment`].
pub struct EnvironmentBuilder<A: Adapter> {
    task: Task,
    adapter: Arc<A>,
    provisioner: Option<Arc<dyn Provisioner>>,
    trace: Option<RunTrace>,
    connect_timeout: Duration,
}

impl<A: Adapter> EnvironmentBuilder<A> {
    /// Set the provisioner that supplies the target.
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Record this environment's events under `run`.
    pub fn tracer(mut self, tracer: Tracer, run: RunId) -> Self {
        self.trace = Some(RunTrace { tracer, run });
        self
    }

    /// Set the controller connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Acquire the target and connect to its controller.
    ///
    /// # Errors
    ///
    /// [`CoreError::Configuration`] when no provisioner was set;
    /// [`CoreError::Provisioning`] when the target never became ready.
    pub async fn create(self) -> Result<Environment<A>> {
        let provisioner = self.provisioner.ok_or_else(|| {
            CoreError::Configuration("environment needs a provisioner".into())
        })?;

        let mut env = Environment {
            id: Uuid::new_v4(),
            task: self.task,
            state: EnvState::Creating,
            provisioner,
            handle: None,
            client: None,
            adapter: self.adapter,
            trace: self.trace,
            step_count: 0,
            target_resolution: None,
            connect_timeout: self.connect_timeout,
        };

        if let Some(trace) = &env.trace {
            trace.tracer.attach(&trace.run);
        }
        let target = env.task.target_ref.clone();
        env.record(EventKind::Request, json!({"op": "create", "target": target}));

        let start = std::time::Instant::now();
        tracing::info!(env_id = %env.id, target = %target, "Creating environment");

        let handle = match env.provisioner.acquire(&target).await {
            Ok(handle) => handle,
            Err(e) => return Err(env.fail_creation(e, None).await),
        };
        // From here on `Drop` releases the target if `create` is cancelled.
        let endpoint = handle.endpoint().to_string();
        env.handle = Some(handle);

        let client = match ControllerClient::connect(&endpoint, env.connect_timeout).await {
            Ok(client) => client,
            Err(e) => {
                let mut handle = env.handle.take();
                if let Some(handle) = handle.as_mut() {
                    if let Err(release) = env.provisioner.release(handle).await {
                        tracing::error!(env_id = %env.id, error = %release, "Failed to release unreachable target");
                    }
                }
                return Err(env.fail_creation(e, handle.as_ref()).await);
            }
        };

        if let Some(handle) = &env.handle {
            env.record(
                EventKind::Response,
                json!({"op": "create", "target_id": handle.id().to_string(), "endpoint": handle.endpoint()}),
            );
            tracing::info!(
                env_id = %env.id,
                target_id = %handle.id(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Environment running"
            );
        }
        env.client = Some(client);
        env.state = EnvState::Running;
        Ok(env)
    }
}

/// A stateful session over one provisioned target.
pub struct Environment<A: Adapter> {
    id: Uuid,
    task: Task,
    state: EnvState,
    provisioner: Arc<dyn Provisioner>,
    handle: Option<TargetHandle>,
    client: Option<ControllerClient>,
    adapter: Arc<A>,
    trace: Option<RunTrace>,
    step_count: u64,
    target_resolution: Option<Resolution>,
    connect_timeout: Duration,
}

impl<A: Adapter> fmt::Debug for Environment<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("target", &self.handle.as_ref().map(|h| h.id()))
            .field("step_count", &self.step_count)
            .finish()
    }
}

impl<A: Adapter> Environment<A> {
    /// Start building an environment for `task`.
    pub fn builder(task: Task, adapter: Arc<A>) -> EnvironmentBuilder<A> {
        EnvironmentBuilder {
            task,
            adapter,
            provisioner: None,
            trace: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Unique environment id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EnvState {
        self.state
    }

    /// The task this environment runs.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Number of `step` calls that dispatched actions or observed.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// The target handle, until the environment is closed.
    pub fn target(&self) -> Option<&TargetHandle> {
        self.handle.as_ref()
    }

    /// Run this environment records into.
    pub fn run_id(&self) -> Option<&RunId> {
        self.trace.as_ref().map(|t| &t.run)
    }

    /// Target resolution learned from the latest observation.
    pub fn target_resolution(&self) -> Option<Resolution> {
        self.target_resolution
    }

    fn record(&self, kind: EventKind, payload: Value) {
        if let Some(trace) = &self.trace {
            trace.tracer.record(
                TraceEvent::new(&trace.run, kind, payload)
                    .with_environment(self.id.to_string())
                    .with_step(self.step_count),
            );
        }
    }

    async fn fail_creation(&mut self, e: TargetError, handle: Option<&TargetHandle>) -> CoreError {
        tracing::error!(
            env_id = %self.id,
            target_id = ?handle.map(|h| h.id()),
            error = %e,
            "Environment creation failed"
        );
        self.record(EventKind::Error, json!({"op": "create", "error": e.to_string()}));
        self.state = EnvState::Error;
        if let Some(trace) = self.trace.take() {
            trace.tracer.detach(&trace.run).await;
        }
        CoreError::Provisioning(e)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            EnvState::Running => Ok(()),
            EnvState::Closed => Err(CoreError::Closed),
            other => Err(CoreError::InvalidState {
                expected: EnvState::Running.to_string(),
                actual: other.to_string(),
            }),
        }
    }

    fn client(&mut self) -> Result<&mut ControllerClient> {
        self.client.as_mut().ok_or_else(|| CoreError::InvalidState {
            expected: "connected".into(),
            actual: "disconnected".into(),
        })
    }

    /// Wrap a target failure, moving to `Error` when it is fatal.
    fn upstream(&mut self, op: &str, e: TargetError) -> CoreError {
        self.record(
            EventKind::Error,
            json!({"op": op, "error": e.to_string(), "fatal": e.is_fatal()}),
        );
        if e.is_fatal() {
            tracing::warn!(env_id = %self.id, op, error = %e, "Target failed, environment unusable");
            self.state = EnvState::Error;
        }
        CoreError::UpstreamExecution(e)
    }

    /// Fetch an observation in target space and learn the target resolution.
    async fn observe_target(&mut self) -> Result<Observation> {
        self.record(EventKind::Request, json!({"op": "observe"}));
        let result = self.client()?.observe::<Observation>().await;
        let observation = result.map_err(|e| self.upstream("observe", e))?;
        if let Some(resolution) = observation.resolution() {
            self.target_resolution = Some(resolution);
        }
        self.record(
            EventKind::Response,
            json!({"op": "observe", "observation": observation.summary()}),
        );
        Ok(observation)
    }

    /// Fetch an observation and scale it to the agent's resolution.
    async fn observe(&mut self) -> Result<Observation> {
        let observation = self.observe_target().await?;
        match (self.target_resolution, self.adapter.agent_resolution()) {
            (Some(target), Some(agent)) if target != agent => {
                self.adapter.rescale(observation, target, agent)
            }
            _ => Ok(observation),
        }
    }

    /// Run the task's setup calls in order and return the first observation.
    ///
    /// # Errors
    ///
    /// [`CoreError::Setup`] names the first failing call; later calls are not run.
    pub async fn reset(&mut self) -> Result<Observation> {
        self.ensure_running()?;
        let setup = self.task.setup.clone();
        tracing::info!(env_id = %self.id, calls = setup.len(), "Resetting environment");

        for (index, call) in setup.iter().enumerate() {
            self.record(EventKind::Request, json!({"op": "setup", "index": index, "call": call}));
            let result = self.client()?.invoke(call).await;
            match result {
                Ok(value) => {
                    self.record(EventKind::Response, json!({"op": "setup", "index": index, "result": value}));
                }
                Err(e) => {
                    tracing::warn!(env_id = %self.id, index, function = %call.name, error = %e, "Setup call failed");
                    self.record(
                        EventKind::Error,
                        json!({"op": "setup", "index": index, "error": e.to_string()}),
                    );
                    if e.is_fatal() {
                        self.state = EnvState::Error;
                    }
                    return Err(CoreError::Setup {
                        index,
                        name: call.name.clone(),
                        source: e,
                    });
                }
            }
        }

        self.observe().await
    }

    /// Replace the task (same target) and reset.
    ///
    /// # Errors
    ///
    /// [`CoreError::Configuration`] if the new task names a different target.
    pub async fn reset_task(&mut self, task: Task) -> Result<Observation> {
        self.ensure_running()?;
        if task.target_ref != self.task.target_ref {
            return Err(CoreError::Configuration(format!(
                "task targets {} but this environment runs {}",
                task.target_ref, self.task.target_ref
            )));
        }
        self.task = task;
        self.reset().await
    }

    /// Apply a batch of raw agent actions, or just observe when `actions` is `None`.
    ///
    /// The whole batch is converted, rescaled and validated before anything is
    /// dispatched, so a bad action means nothing runs. Once dispatching
    /// starts, a failing action is recorded in `info["errors"]` and the rest
    /// still run unless the failure is fatal.
    pub async fn step(&mut self, actions: Option<&[A::Raw]>) -> Result<StepResult> {
        self.ensure_running()?;
        let raws = match actions {
            Some(raws) if !raws.is_empty() => raws,
            _ => {
                let observation = self.observe().await?;
                self.step_count += 1;
                return Ok(StepResult {
                    observation,
                    reward: 0.0,
                    terminated: false,
                    info: HashMap::from([("dispatched".to_string(), json!(0))]),
                });
            }
        };

        let canonical = self.prepare(raws).await?;
        self.step_count += 1;
        let step = self.step_count;
        tracing::debug!(env_id = %self.id, step, actions = canonical.len(), "Dispatching actions");

        let mut reward = 0.0;
        let mut terminated = false;
        let mut fatal = false;
        let mut dispatched = 0usize;
        let mut skipped = Vec::new();
        let mut errors = Vec::new();
        let mut info = HashMap::new();

        for (index, action) in canonical.iter().enumerate() {
            if fatal {
                skipped.push(json!({"index": index, "reason": "target failed"}));
                continue;
            }
            if action.is_noop() {
                skipped.push(json!({"index": index, "reason": "no-op"}));
                continue;
            }
            match action {
                CanonicalAction::FetchState => {
                    dispatched += 1;
                    continue;
                }
                CanonicalAction::Wait { duration_ms } => {
                    tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                    dispatched += 1;
                    continue;
                }
                CanonicalAction::Response { text } => {
                    info.insert("response".to_string(), json!(text));
                    terminated = true;
                }
                _ => {}
            }

            self.record(EventKind::Request, json!({"op": "act", "index": index, "action": action}));
            let result = self.client()?.act(action).await;
            match result {
                Ok(outcome) => {
                    dispatched += 1;
                    reward += outcome.reward.unwrap_or(0.0);
                    terminated |= outcome.terminated;
                    self.record(
                        EventKind::Response,
                        json!({"op": "act", "index": index, "reward": outcome.reward, "terminated": outcome.terminated}),
                    );
                }
                Err(e) => {
                    let is_fatal = e.is_fatal();
                    tracing::warn!(env_id = %self.id, step, index, fatal = is_fatal, error = %e, "Action failed");
                    self.record(
                        EventKind::Error,
                        json!({"op": "act", "index": index, "error": e.to_string(), "fatal": is_fatal}),
                    );
                    errors.push(json!({
                        "index": index,
                        "action": action.tag(),
                        "error": e.to_string(),
                        "fatal": is_fatal,
                    }));
                    if is_fatal {
                        fatal = true;
                        terminated = true;
                    }
                }
            }
        }

        let observation = if fatal {
            self.state = EnvState::Error;
            Observation::default()
        } else {
            self.observe().await?
        };

        info.insert("dispatched".to_string(), json!(dispatched));
        if !skipped.is_empty() {
            info.insert("skipped".to_string(), Value::Array(skipped));
        }
        if !errors.is_empty() {
            info.insert("errors".to_string(), Value::Array(errors));
        }

        Ok(StepResult {
            observation,
            reward,
            terminated,
            info,
        })
    }

    /// Convert, rescale and validate a batch without dispatching anything.
    async fn prepare(&mut self, raws: &[A::Raw]) -> Result<Vec<CanonicalAction>> {
        let canonical = match self.adapter.adapt_list(raws) {
            Ok(actions) => actions,
            Err(e) => {
                self.record(EventKind::Error, json!({"op": "adapt", "error": e.to_string()}));
                return Err(e);
            }
        };

        let pair = match self.adapter.agent_resolution() {
            Some(agent) => {
                if self.target_resolution.is_none() {
                    self.observe_target().await?;
                }
                match self.target_resolution {
                    Some(target) => Some(ResolutionPair::new(agent, target)?),
                    None => {
                        tracing::debug!(env_id = %self.id, "Target reports no resolution, dispatching unscaled");
                        None
                    }
                }
            }
            None => None,
        };

        let mut prepared = Vec::with_capacity(canonical.len());
        for action in canonical {
            let action = match pair {
                Some(pair) => self.adapter.rescale_action(action, pair),
                None => action,
            };
            if let Err(e) = action.validate() {
                self.record(EventKind::Error, json!({"op": "validate", "error": e.to_string()}));
                return Err(e.into());
            }
            prepared.push(action);
        }
        Ok(prepared)
    }

    /// Run the evaluate calls (the task's, or `calls` when given) and average their scores.
    ///
    /// A call may return a number, a boolean, or an object with a numeric
    /// `reward` or `score` field.
    pub async fn evaluate(&mut self, calls: Option<&[FunctionCall]>) -> Result<f64> {
        self.ensure_running()?;
        let calls = calls.map_or_else(|| self.task.evaluate.clone(), <[FunctionCall]>::to_vec);
        if calls.is_empty() {
            tracing::warn!(env_id = %self.id, "No evaluate calls, scoring 0.0");
            return Ok(0.0);
        }

        let mut total = 0.0;
        for call in &calls {
            self.record(EventKind::Request, json!({"op": "evaluate", "call": call}));
            let result = self.client()?.invoke(call).await;
            let value = result.map_err(|e| self.upstream("evaluate", e))?;
            let score = score_of(&value).ok_or_else(|| {
                self.upstream(
                    "evaluate",
                    TargetError::Rpc {
                        code: error_codes::INTERNAL_ERROR,
                        message: format!("evaluate '{}' returned a non-numeric result: {value}", call.name),
                        data: None,
                    },
                )
            })?;
            self.record(EventKind::Response, json!({"op": "evaluate", "function": call.name, "score": score}));
            total += score;
        }

        let score = total / calls.len() as f64;
        tracing::info!(env_id = %self.id, score, calls = calls.len(), "Evaluated");
        Ok(score)
    }

    /// Push new controller source into the running target and reconnect.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnsupportedOperation`] for image-based and remote targets.
    pub async fn hot_reload(&mut self, controller_source: &Path) -> Result<()> {
        self.ensure_running()?;
        self.record(
            EventKind::Request,
            json!({"op": "hot_reload", "source": controller_source.display().to_string()}),
        );

        let handle = self.handle.as_ref().ok_or(CoreError::Closed)?;
        let endpoint = handle.endpoint().to_string();
        let result = self.provisioner.hot_reload(handle, controller_source).await;
        match result {
            Ok(()) => {}
            Err(TargetError::UnsupportedOperation(message)) => {
                self.record(EventKind::Error, json!({"op": "hot_reload", "error": message}));
                return Err(CoreError::UnsupportedOperation(message));
            }
            Err(e) => return Err(self.upstream("hot_reload", e)),
        }

        self.client = None;
        let client = ControllerClient::connect(&endpoint, self.connect_timeout)
            .await
            .map_err(|e| self.upstream("hot_reload", e))?;
        self.client = Some(client);
        self.record(EventKind::Response, json!({"op": "hot_reload"}));
        tracing::info!(env_id = %self.id, "Controller reloaded");
        Ok(())
    }

    /// Release the target and flush this environment's trace.
    ///
    /// Idempotent: closing a closed environment is a no-op. The state is
    /// `Closed` afterwards even if the release failed.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == EnvState::Closed {
            return Ok(());
        }
        tracing::info!(env_id = %self.id, state = %self.state, "Closing environment");
        self.record(EventKind::Request, json!({"op": "close"}));
        self.client = None;

        let mut released = Ok(());
        if let Some(mut handle) = self.handle.take() {
            match self.provisioner.release(&mut handle).await {
                Ok(()) => self.record(EventKind::Response, json!({"op": "close"})),
                Err(e) => {
                    tracing::error!(env_id = %self.id, target_id = %handle.id(), error = %e, "Failed to release target");
                    self.record(EventKind::Error, json!({"op": "close", "error": e.to_string()}));
                    // Keep the handle so drop retries the release.
                    self.handle = Some(handle);
                    released = Err(CoreError::UpstreamExecution(e));
                }
            }
        }
        self.state = EnvState::Closed;

        if let Some(trace) = self.trace.take() {
            let outcome = trace.tracer.detach(&trace.run).await;
            tracing::debug!(env_id = %self.id, run_id = %trace.run, outcome = ?outcome, "Trace flushed");
        }
        released
    }
}

impl<A: Adapter> Drop for Environment<A> {
    fn drop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) if handle.state() != TargetState::Terminated => handle,
            _ => return,
        };
        let provisioner = self.provisioner.clone();
        let trace = self.trace.take();
        let env_id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(env_id = %env_id, target_id = %handle.id(), "Environment dropped without close, releasing target");
                runtime.spawn(async move {
                    let mut handle = handle;
                    if let Err(e) = provisioner.release(&mut handle).await {
                        tracing::error!(env_id = %env_id, error = %e, "Background release failed");
                    }
                    if let Some(trace) = trace {
                        trace.tracer.detach(&trace.run).await;
                    }
                });
            }
            Err(_) => {
                tracing::error!(env_id = %env_id, target_id = %handle.id(), "Environment dropped outside a runtime, target leaked");
            }
        }
    }
}

/// Extract a score from an evaluate result.
pub fn score_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Object(map) => map
            .get("reward")
            .or_else(|| map.get("score"))
            .and_then(score_of),
        _ => None,
    }
}
