//! Agent loop and task-set runner.

mod common;

use arena_core::{
    Agent, AgentStep, CanonicalAdapter, CoreError, FunctionCall, Observation, Result, Runner,
    Task, TargetRef,
};
use async_trait::async_trait;
use common::{start_controller, FixedProvisioner};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Plays back a fixed list of decisions, then declares itself done.
struct ScriptedAgent {
    script: VecDeque<AgentStep<Value>>,
    seen: Vec<Option<String>>,
}

impl ScriptedAgent {
    fn new(script: Vec<AgentStep<Value>>) -> Self {
        Self {
            script: script.into(),
            seen: Vec::new(),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    type Raw = Value;

    async fn predict(&mut self, _prompt: &str, observation: &Observation) -> Result<AgentStep<Value>> {
        self.seen.push(observation.text.clone());
        Ok(self.script.pop_front().unwrap_or_else(AgentStep::done))
    }
}

struct BrokenAgent;

#[async_trait]
impl Agent for BrokenAgent {
    type Raw = Value;

    async fn predict(&mut self, _prompt: &str, _observation: &Observation) -> Result<AgentStep<Value>> {
        Err(CoreError::Agent("model unavailable".into()))
    }
}

fn click(x: i32, y: i32) -> Value {
    json!({"type": "click", "point": {"x": x, "y": y}})
}

#[tokio::test]
async fn test_episode_runs_until_agent_is_done() {
    let controller = start_controller(1280, 720, "ok").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let runner = Runner::new(provisioner.clone(), Arc::new(CanonicalAdapter::new()));

    let task = Task::new("click twice", TargetRef::gym("browser"))
        .with_evaluate(FunctionCall::new("contains_text").arg("ok"));
    let agent = ScriptedAgent::new(vec![
        AgentStep::act(vec![click(1, 1)]),
        AgentStep::act(vec![click(2, 2), click(3, 3)]),
    ]);

    let result = runner.run_task(task, agent).await.unwrap();
    assert_eq!(result.score, 1.0);
    assert_eq!(result.steps, 2);
    assert!(!result.terminated);
    assert!(!result.failed);
    assert_eq!(controller.acts().len(), 3);
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_episode_stops_at_max_steps() {
    let controller = start_controller(1280, 720, "").await;
    let runner = Runner::new(
        FixedProvisioner::new(&controller.endpoint),
        Arc::new(CanonicalAdapter::new()),
    )
    .with_max_steps(2);

    let script = (0..10).map(|i| AgentStep::act(vec![click(i, i)])).collect();
    let result = runner
        .run_task(Task::new("loop", TargetRef::gym("browser")), ScriptedAgent::new(script))
        .await
        .unwrap();
    assert_eq!(result.steps, 2);
    assert_eq!(controller.acts().len(), 2);
}

#[tokio::test]
async fn test_episode_ends_on_response() {
    let controller = start_controller(1280, 720, "").await;
    let runner = Runner::new(
        FixedProvisioner::new(&controller.endpoint),
        Arc::new(CanonicalAdapter::new()),
    );

    let agent = ScriptedAgent::new(vec![
        AgentStep::act(vec![json!({"type": "response", "text": "42"})]),
        AgentStep::act(vec![click(1, 1)]),
    ]);
    let result = runner
        .run_task(Task::new("answer", TargetRef::gym("browser")), agent)
        .await
        .unwrap();
    assert!(result.terminated);
    assert_eq!(result.response.as_deref(), Some("42"));
    assert_eq!(result.steps, 1);
}

#[tokio::test]
async fn test_fatal_target_scores_zero_and_releases() {
    let controller = start_controller(1280, 720, "ok").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let runner = Runner::new(provisioner.clone(), Arc::new(CanonicalAdapter::new()));

    let task = Task::new("crash", TargetRef::gym("browser"))
        .with_evaluate(FunctionCall::new("contains_text").arg("ok"));
    let agent = ScriptedAgent::new(vec![AgentStep::act(vec![json!({"type": "custom", "name": "crash"})])]);

    let result = runner.run_task(task, agent).await.unwrap();
    assert!(result.failed);
    assert!(result.terminated);
    assert_eq!(result.score, 0.0);
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_agent_error_still_closes() {
    let controller = start_controller(1280, 720, "").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let runner = Runner::new(provisioner.clone(), Arc::new(CanonicalAdapter::new()));

    let err = runner
        .run_task(Task::new("p", TargetRef::gym("browser")), BrokenAgent)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Agent(_)));
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_taskset_results_keep_input_order() {
    let controller = start_controller(1280, 720, "alpha beta").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let runner = Runner::new(provisioner.clone(), Arc::new(CanonicalAdapter::new())).with_concurrency(2);

    let tasks: Vec<Task> = ["alpha", "gamma", "beta", "delta"]
        .iter()
        .map(|word| {
            Task::new(*word, TargetRef::gym("browser"))
                .with_evaluate(FunctionCall::new("contains_text").arg(*word))
        })
        .collect();

    let results = runner
        .run_taskset(tasks, |_task| ScriptedAgent::new(vec![AgentStep::act(vec![click(5, 5)])]))
        .await;

    let scores: Vec<f64> = results.iter().map(|r| r.as_ref().unwrap().score).collect();
    assert_eq!(scores, vec![1.0, 0.0, 1.0, 0.0]);
    let prompts: Vec<&str> = results.iter().map(|r| r.as_ref().unwrap().prompt.as_str()).collect();
    assert_eq!(prompts, vec!["alpha", "gamma", "beta", "delta"]);
    assert_eq!(provisioner.released(), 4);
}
