//! Agent loop and batch runner.
//!
//! [`run_episode`] drives one environment until the agent is done, the target
//! terminates the episode, or the step limit is hit. [`Runner`] adds the
//! create/close bracket around it and runs task sets with bounded
//! concurrency.

use crate::adapter::Adapter;
use crate::config::RuntimeConfig;
use crate::environment::{EnvState, Environment};
use crate::error::{CoreError, Result};
use crate::observation::Observation;
use crate::task::Task;
use crate::tracer::{RunId, Tracer};
use arena_target::Provisioner;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default number of environments a task set runs at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// What an agent decided after looking at an observation.
#[derive(Debug, Clone)]
pub struct AgentStep<R> {
    /// Actions to apply, in the agent's native format
    pub actions: Vec<R>,
    /// The agent considers the task finished
    pub done: bool,
}

impl<R> AgentStep<R> {
    /// Apply `actions` and keep going.
    pub fn act(actions: Vec<R>) -> Self {
        Self {
            actions,
            done: false,
        }
    }

    /// Stop without further actions.
    pub fn done() -> Self {
        Self {
            actions: Vec::new(),
            done: true,
        }
    }
}

/// The decision-making side of an episode.
#[async_trait]
pub trait Agent: Send {
    /// Native action format; must match the adapter's.
    type Raw: Send + Sync;

    /// Decide the next actions for `prompt` given the latest observation.
    async fn predict(&mut self, prompt: &str, observation: &Observation) -> Result<AgentStep<Self::Raw>>;
}

/// Summary of one finished episode.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeResult {
    /// Task prompt
    pub prompt: String,
    /// Score from the task's evaluate calls
    pub score: f64,
    /// Sum of the per-step rewards
    pub reward: f64,
    /// Number of steps taken
    pub steps: u64,
    /// The target ended the episode
    pub terminated: bool,
    /// The target failed mid-episode and could not be evaluated
    pub failed: bool,
    /// Text of the last `response` action, if any
    pub response: Option<String>,
}

/// Run one episode on an already-created environment.
///
/// The environment is left open; closing it is the caller's job.
pub async fn run_episode<A, G>(env: &mut Environment<A>, agent: &mut G, max_steps: u32) -> Result<EpisodeResult>
where
    A: Adapter,
    G: Agent<Raw = A::Raw>,
{
    let prompt = env.task().prompt.clone();
    let mut observation = env.reset().await?;
    let mut reward = 0.0;
    let mut terminated = false;
    let mut response = None;

    for _ in 0..max_steps {
        let decision = agent
            .predict(&prompt, &observation)
            .await
            .map_err(|e| match e {
                CoreError::Agent(_) => e,
                other => CoreError::Agent(other.to_string()),
            })?;

        if decision.actions.is_empty() && decision.done {
            break;
        }

        let result = env.step(Some(decision.actions.as_slice())).await?;
        reward += result.reward;
        if let Some(text) = result.info.get("response").and_then(|v| v.as_str()) {
            response = Some(text.to_string());
        }
        observation = result.observation;

        if result.terminated {
            terminated = true;
            break;
        }
        if decision.done {
            break;
        }
    }

    let failed = env.state() == EnvState::Error;
    let score = if failed {
        tracing::warn!(env_id = %env.id(), "Target failed during the episode, scoring 0.0");
        0.0
    } else {
        env.evaluate(None).await?
    };

    Ok(EpisodeResult {
        prompt,
        score,
        reward,
        steps: env.step_count(),
        terminated,
        failed,
        response,
    })
}

/// Creates environments for tasks and runs agents against them.
pub struct Runner<A: Adapter> {
    provisioner: Arc<dyn Provisioner>,
    adapter: Arc<A>,
    trace: Option<(Tracer, RunId)>,
    max_steps: u32,
    concurrency: usize,
    connect_timeout: Duration,
}

impl<A: Adapter> Runner<A> {
    /// Create a runner with default limits.
    pub fn new(provisioner: Arc<dyn Provisioner>, adapter: Arc<A>) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            provisioner,
            adapter,
            trace: None,
            max_steps: defaults.max_steps,
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout: defaults.connect_timeout,
        }
    }

    /// Create a runner with limits from `config`.
    pub fn from_config(config: &RuntimeConfig, provisioner: Arc<dyn Provisioner>, adapter: Arc<A>) -> Self {
        Self {
            max_steps: config.max_steps,
            connect_timeout: config.connect_timeout,
            ..Self::new(provisioner, adapter)
        }
    }

    /// Record every environment under `run`.
    pub fn with_tracer(mut self, tracer: Tracer, run: RunId) -> Self {
        self.trace = Some((tracer, run));
        self
    }

    /// Set the per-episode step limit.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set how many environments a task set may run at once (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Create an environment for `task`, run one episode, and always close it.
    pub async fn run_task<G>(&self, task: Task, mut agent: G) -> Result<EpisodeResult>
    where
        G: Agent<Raw = A::Raw>,
    {
        let mut builder = Environment::builder(task, Arc::clone(&self.adapter))
            .provisioner(Arc::clone(&self.provisioner))
            .connect_timeout(self.connect_timeout);
        if let Some((tracer, run)) = &self.trace {
            builder = builder.tracer(tracer.clone(), run.clone());
        }
        let mut env = builder.create().await?;

        let outcome = run_episode(&mut env, &mut agent, self.max_steps).await;
        let closed = env.close().await;

        match (outcome, closed) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(result), Err(e)) => {
                tracing::warn!(error = %e, "Episode finished but target release failed");
                Ok(result)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Run every task with its own agent, at most `concurrency` at a time.
    ///
    /// Results are returned in the order of `tasks`.
    pub async fn run_taskset<G, F>(&self, tasks: Vec<Task>, make_agent: F) -> Vec<Result<EpisodeResult>>
    where
        G: Agent<Raw = A::Raw>,
        F: Fn(&Task) -> G,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(tasks = tasks.len(), concurrency = self.concurrency, "Running task set");

        let episodes = tasks.into_iter().enumerate().map(|(index, task)| {
            let agent = make_agent(&task);
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|e| CoreError::Configuration(format!("runner shut down: {e}")))?;
                tracing::debug!(index, "Starting task");
                let result = self.run_task(task, agent).await;
                if let Err(e) = &result {
                    tracing::warn!(index, error = %e, "Task failed");
                }
                result
            }
        });

        futures::future::join_all(episodes).await
    }
}
