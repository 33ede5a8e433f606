//! # arena-core
//!
//! Environment runtime for arena.
//!
//! An agent talks to an [`Environment`]: it resets the task, sends batches of
//! actions in its own format, gets observations back, and finally asks for a
//! score. The environment converts actions to the [`CanonicalAction`] schema
//! through an [`Adapter`], dispatches them to the target's controller, and
//! records everything it does to a [`Tracer`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    arena-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │    Runner       │────▶│  Agent::predict()        │    │
//! │  │  - run_task()   │     └──────────────────────────┘    │
//! │  │  - run_taskset()│                                     │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  Environment    │────▶│  Adapter                 │    │
//! │  │  - reset()      │     │  convert / rescale       │    │
//! │  │  - step()       │     └──────────────────────────┘    │
//! │  │  - evaluate()   │     ┌──────────────────────────┐    │
//! │  │  - close()      │────▶│  Tracer ──▶ HTTP ingest  │    │
//! │  └─────────────────┘     │         └─▶ local JSONL  │    │
//! │           │              └──────────────────────────┘    │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   arena-target: Provisioner + ControllerClient           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use arena_core::{CanonicalAdapter, Environment, FunctionCall, Task, TargetRef};
//! use arena_target::{ProvisionerConfig, RoutingProvisioner};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> arena_core::Result<()> {
//! let provisioner = RoutingProvisioner::from_config(ProvisionerConfig::from_env())
//!     .map_err(arena_core::CoreError::Provisioning)?;
//!
//! let task = Task::new("Open the settings page", TargetRef::gym("browser"))
//!     .with_evaluate(FunctionCall::new("contains_text").arg("Settings"));
//!
//! let mut env = Environment::builder(task, Arc::new(CanonicalAdapter::new()))
//!     .provisioner(Arc::new(provisioner))
//!     .create()
//!     .await?;
//!
//! let observation = env.reset().await?;
//! println!("{}", observation.summary());
//!
//! env.step(Some(&[json!({"type": "click", "point": {"x": 40, "y": 12}})])).await?;
//! let score = env.evaluate(None).await?;
//! println!("score = {score}");
//!
//! env.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod adapter;
mod config;
mod environment;
mod error;
mod observation;
mod runner;
mod task;
mod tracer;

pub use action::{CanonicalAction, Key, Modifier, MouseButton, Point, ValidationError};
pub use adapter::{Adapter, CanonicalAdapter, ComputerUseAdapter, OperatorAdapter, ResolutionPair};
pub use config::{parse_resolution, RetryPolicy, RuntimeConfig, TracerConfig};
pub use environment::{score_of, EnvState, Environment, EnvironmentBuilder, StepResult};
pub use error::{CoreError, Result};
pub use observation::{Observation, Resolution};
pub use runner::{run_episode, Agent, AgentStep, EpisodeResult, Runner, DEFAULT_CONCURRENCY};
pub use task::Task;
pub use tracer::{
    EventKind, FlushOutcome, HttpIngest, IngestSink, RunId, RunStatus, TraceEvent, Tracer, UploadError,
};

pub use arena_target::{FunctionCall, TargetRef};
