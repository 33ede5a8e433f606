//! Environment lifecycle against an in-process controller.

mod common;

use arena_core::{
    CanonicalAdapter, ComputerUseAdapter, CoreError, EnvState, Environment, FunctionCall,
    Resolution, RunId, RunStatus, Task, TargetRef, Tracer,
};
use common::{start_controller, FailingProvisioner, FixedProvisioner};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn task() -> Task {
    Task::new("check the page", TargetRef::gym("browser"))
}

async fn canonical_env(task: Task, provisioner: Arc<FixedProvisioner>) -> Environment<CanonicalAdapter> {
    Environment::builder(task, Arc::new(CanonicalAdapter::new()))
        .provisioner(provisioner)
        .create()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_evaluate_contains_text() {
    let controller = start_controller(1280, 720, "status: ok").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let task = task().with_evaluate(FunctionCall::new("contains_text").arg("ok"));
    let mut env = canonical_env(task, provisioner.clone()).await;
    assert_eq!(env.state(), EnvState::Running);

    let observation = env.reset().await.unwrap();
    assert!(observation.contains_text("status: ok"));

    assert_eq!(env.evaluate(None).await.unwrap(), 1.0);
    let missing = [FunctionCall::new("contains_text").arg("no")];
    assert_eq!(env.evaluate(Some(&missing)).await.unwrap(), 0.0);

    env.close().await.unwrap();
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_evaluate_averages_scores() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let calls = [
        FunctionCall::new("score").arg(1.0),
        FunctionCall::new("score").arg(0.0),
        FunctionCall::new("contains_text").arg(""),
        FunctionCall::new("score").arg(0.0),
    ];
    assert_eq!(env.evaluate(Some(&calls)).await.unwrap(), 0.5);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_runs_setup_in_order() {
    let controller = start_controller(1280, 720, "").await;
    let task = task()
        .with_setup(FunctionCall::new("noop"))
        .with_setup(FunctionCall::new("set_text").arg("welcome"));
    let mut env = canonical_env(task, FixedProvisioner::new(&controller.endpoint)).await;

    let observation = env.reset().await.unwrap();
    assert_eq!(observation.text.as_deref(), Some("welcome"));
    assert_eq!(controller.calls(), vec!["noop", "set_text"]);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_stops_at_failing_setup_call() {
    let controller = start_controller(1280, 720, "").await;
    let task = task()
        .with_setup(FunctionCall::new("noop"))
        .with_setup(FunctionCall::new("fail"))
        .with_setup(FunctionCall::new("set_text").arg("never"));
    let mut env = canonical_env(task, FixedProvisioner::new(&controller.endpoint)).await;

    let err = env.reset().await.unwrap_err();
    match err {
        CoreError::Setup { index, name, .. } => {
            assert_eq!(index, 1);
            assert_eq!(name, "fail");
        }
        other => panic!("expected setup error, got {other:?}"),
    }
    assert_eq!(controller.calls(), vec!["noop", "fail"]);
    // A non-fatal setup failure leaves the environment usable.
    assert_eq!(env.state(), EnvState::Running);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_click_is_rescaled_to_target_space() {
    let controller = start_controller(2000, 1000, "").await;
    let adapter = Arc::new(CanonicalAdapter::with_resolution(Resolution::new(1000, 500)));
    let mut env = Environment::builder(task(), adapter)
        .provisioner(FixedProvisioner::new(&controller.endpoint))
        .create()
        .await
        .unwrap();

    let result = env
        .step(Some(&[json!({"type": "click", "point": {"x": 100, "y": 100}})]))
        .await
        .unwrap();

    let acts = controller.acts();
    assert_eq!(acts.len(), 1);
    assert_eq!(acts[0]["point"], json!({"x": 200, "y": 200}));
    assert_eq!(result.observation.resolution(), Some(Resolution::new(1000, 500)));
    assert_eq!(env.target_resolution(), Some(Resolution::new(2000, 1000)));
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_batch_dispatches_nothing() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let err = env
        .step(Some(&[
            json!({"type": "click", "point": {"x": 1, "y": 1}}),
            json!({"type": "click", "point": {"x": -5, "y": 1}}),
        ]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(controller.acts().is_empty());
    assert_eq!(env.state(), EnvState::Running);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_agent_action_dispatches_nothing() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = Environment::builder(task(), Arc::new(ComputerUseAdapter::new()))
        .provisioner(FixedProvisioner::new(&controller.endpoint))
        .create()
        .await
        .unwrap();

    let err = env
        .step(Some(&[
            json!({"action": "left_click", "coordinate": [10, 10]}),
            json!({"action": "zoom", "coordinate": [10, 10]}),
        ]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnsupportedAction(_)));
    assert!(controller.acts().is_empty());
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_step_skips_noops_and_handles_response() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let result = env
        .step(Some(&[
            json!({"type": "type", "text": ""}),
            json!({"type": "fetch_state"}),
            json!({"type": "wait", "duration_ms": 1}),
            json!({"type": "type", "text": "hello"}),
            json!({"type": "response", "text": "done"}),
        ]))
        .await
        .unwrap();

    let acts = controller.acts();
    assert_eq!(acts.len(), 2);
    assert_eq!(acts[0]["type"], "type");
    assert_eq!(acts[1]["type"], "response");
    assert!(result.terminated);
    assert_eq!(result.info["response"], "done");
    assert_eq!(result.info["skipped"][0]["index"], 0);
    assert_eq!(env.step_count(), 1);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_step_without_actions_observes() {
    let controller = start_controller(1280, 720, "page").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let result = env.step(None).await.unwrap();
    assert!(result.observation.contains_text("page"));
    assert!(!result.terminated);
    assert!(controller.acts().is_empty());
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_target_reported_termination_and_reward() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let result = env
        .step(Some(&[json!({"type": "custom", "name": "finish"})]))
        .await
        .unwrap();
    assert!(result.terminated);
    assert_eq!(result.reward, 1.0);
    assert_eq!(env.state(), EnvState::Running);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_action_moves_to_error() {
    let controller = start_controller(1280, 720, "").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let mut env = canonical_env(task(), provisioner.clone()).await;

    let result = env
        .step(Some(&[
            json!({"type": "custom", "name": "crash"}),
            json!({"type": "click", "point": {"x": 1, "y": 1}}),
        ]))
        .await
        .unwrap();

    assert!(result.terminated);
    assert_eq!(result.info["errors"][0]["fatal"], true);
    assert_eq!(result.info["skipped"][0]["index"], 1);
    assert_eq!(controller.acts().len(), 1);
    assert_eq!(env.state(), EnvState::Error);

    let err = env.evaluate(None).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));

    env.close().await.unwrap();
    assert_eq!(env.state(), EnvState::Closed);
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let controller = start_controller(1280, 720, "").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let mut env = canonical_env(task(), provisioner.clone()).await;

    env.close().await.unwrap();
    env.close().await.unwrap();
    assert_eq!(provisioner.released(), 1);
    assert!(env.target().is_none());

    assert!(matches!(env.reset().await, Err(CoreError::Closed)));
    assert!(matches!(env.step(None).await, Err(CoreError::Closed)));
    assert!(matches!(env.evaluate(None).await, Err(CoreError::Closed)));
    assert!(matches!(
        env.hot_reload(Path::new("/tmp/controller")).await,
        Err(CoreError::Closed)
    ));
}

#[tokio::test]
async fn test_hot_reload_reconnects() {
    let controller = start_controller(1280, 720, "before").await;
    let provisioner = FixedProvisioner::reloadable(&controller.endpoint);
    let mut env = canonical_env(task(), provisioner.clone()).await;

    env.hot_reload(Path::new("/tmp/controller")).await.unwrap();
    assert_eq!(env.state(), EnvState::Running);

    controller.set_text("after");
    let observation = env.step(None).await.unwrap().observation;
    assert!(observation.contains_text("after"));
    assert_eq!(controller.connections.load(std::sync::atomic::Ordering::SeqCst), 2);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_hot_reload_unsupported_for_image_targets() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let err = env.hot_reload(Path::new("/tmp/controller")).await.unwrap_err();
    assert!(matches!(err, CoreError::UnsupportedOperation(_)));
    assert_eq!(env.state(), EnvState::Running);
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_task_rejects_other_target() {
    let controller = start_controller(1280, 720, "").await;
    let mut env = canonical_env(task(), FixedProvisioner::new(&controller.endpoint)).await;

    let other = Task::new("elsewhere", TargetRef::gym("desktop"));
    assert!(matches!(env.reset_task(other).await, Err(CoreError::Configuration(_))));

    let same = task().with_setup(FunctionCall::new("set_text").arg("second"));
    let observation = env.reset_task(same).await.unwrap();
    assert!(observation.contains_text("second"));
    env.close().await.unwrap();
}

#[tokio::test]
async fn test_acquire_failure_is_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::local(dir.path());
    let run = RunId::new();

    let err = Environment::builder(task(), Arc::new(CanonicalAdapter::new()))
        .provisioner(Arc::new(FailingProvisioner))
        .tracer(tracer.clone(), run.clone())
        .create()
        .await
        .unwrap_err();

    assert!(err.never_ready());
    assert!(!err.is_timeout());
    assert_eq!(tracer.status(&run), Some(RunStatus::Finalized));
    assert!(tracer.fallback_path(&run).exists());
}

#[tokio::test]
async fn test_unreachable_controller_is_timeout_and_released() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);
    let provisioner = FixedProvisioner::new(endpoint);

    let err = Environment::builder(task(), Arc::new(CanonicalAdapter::new()))
        .provisioner(provisioner.clone())
        .connect_timeout(Duration::from_millis(300))
        .create()
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_cancelled_create_releases_target() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);
    let provisioner = FixedProvisioner::new(endpoint);

    let create = Environment::builder(task(), Arc::new(CanonicalAdapter::new()))
        .provisioner(provisioner.clone())
        .connect_timeout(Duration::from_secs(5))
        .create();
    let outcome = tokio::time::timeout(Duration::from_millis(300), create).await;
    assert!(outcome.is_err());

    for _ in 0..50 {
        if provisioner.released() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_missing_provisioner_is_configuration_error() {
    let err = Environment::builder(task(), Arc::new(CanonicalAdapter::new()))
        .create()
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
}

#[tokio::test]
async fn test_drop_releases_target() {
    let controller = start_controller(1280, 720, "").await;
    let provisioner = FixedProvisioner::new(&controller.endpoint);
    let env = canonical_env(task(), provisioner.clone()).await;

    drop(env);
    for _ in 0..50 {
        if provisioner.released() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(provisioner.released(), 1);
}

#[tokio::test]
async fn test_events_are_recorded_per_environment() {
    let controller = start_controller(1280, 720, "").await;
    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::local(dir.path());
    let run = RunId::new();

    let mut env = Environment::builder(task(), Arc::new(CanonicalAdapter::new()))
        .provisioner(FixedProvisioner::new(&controller.endpoint))
        .tracer(tracer.clone(), run.clone())
        .create()
        .await
        .unwrap();
    env.step(Some(&[json!({"type": "press", "keys": ["enter"]})])).await.unwrap();

    let events = tracer.events(&run);
    let env_id = env.id().to_string();
    assert!(events.iter().all(|e| e.environment_id.as_deref() == Some(env_id.as_str())));
    assert!(events.iter().any(|e| e.payload["op"] == "act"));

    env.close().await.unwrap();
    assert_eq!(tracer.status(&run), Some(RunStatus::Finalized));
    let lines = std::fs::read_to_string(tracer.fallback_path(&run)).unwrap();
    assert!(lines.lines().count() >= 4);
    assert!(lines.lines().any(|l| l.contains("\"close\"")));
}
