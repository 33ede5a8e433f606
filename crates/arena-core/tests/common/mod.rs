//! Shared fixtures: an in-process controller and a provisioner pointing at it.

#![allow(dead_code)]

use arena_target::{
    error_codes, Backend, Provisioner, TargetError, TargetHandle, TargetRef, TargetState,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// State of the fake controller, shared with the test.
#[derive(Clone)]
pub struct Controller {
    pub endpoint: String,
    /// Page text returned by `observe` and checked by `contains_text`
    pub text: Arc<Mutex<String>>,
    /// Every action received by `act`, in order
    pub acts: Arc<Mutex<Vec<Value>>>,
    /// Every function name received by `call`, in order
    pub calls: Arc<Mutex<Vec<String>>>,
    pub connections: Arc<AtomicUsize>,
}

impl Controller {
    pub fn acts(&self) -> Vec<Value> {
        self.acts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_text(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }
}

/// Start a controller reporting a `width`x`height` screen and `text`.
///
/// Functions: `contains_text(needle)` returns a bool, `set_text(text)`,
/// `noop`, `score(value)` echoes `{"score": value}`, `fail` returns an RPC
/// error. A `custom` action named `crash` returns a fatal error; any `custom`
/// action named `finish` reports `terminated` with reward 1.0.
pub async fn start_controller(width: u32, height: u32, text: &str) -> Controller {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let controller = Controller {
        endpoint: listener.local_addr().unwrap().to_string(),
        text: Arc::new(Mutex::new(text.to_string())),
        acts: Arc::new(Mutex::new(Vec::new())),
        calls: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
    };

    let state = controller.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            state.connections.fetch_add(1, Ordering::SeqCst);
            let state = state.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let reply = match handle(&state, width, height, &req) {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": req["id"], "result": result}),
                        Err((code, message)) => json!({
                            "jsonrpc": "2.0",
                            "id": req["id"],
                            "error": {"code": code, "message": message}
                        }),
                    };
                    if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    controller
}

fn handle(state: &Controller, width: u32, height: u32, req: &Value) -> Result<Value, (i32, String)> {
    let params = &req["params"];
    match req["method"].as_str().unwrap_or_default() {
        "ping" => Ok(json!({"pong": true})),
        "observe" => Ok(json!({
            "text": state.text.lock().unwrap().clone(),
            "width": width,
            "height": height,
        })),
        "act" => {
            let action = params["action"].clone();
            state.acts.lock().unwrap().push(action.clone());
            match (action["type"].as_str(), action["name"].as_str()) {
                (Some("custom"), Some("crash")) => {
                    Err((error_codes::TARGET_FATAL, "browser crashed".to_string()))
                }
                (Some("custom"), Some("finish")) => Ok(json!({"reward": 1.0, "terminated": true})),
                _ => Ok(json!({"reward": 0.0})),
            }
        }
        "call" => {
            let name = params["name"].as_str().unwrap_or_default().to_string();
            state.calls.lock().unwrap().push(name.clone());
            let arg = &params["args"][0];
            match name.as_str() {
                "contains_text" => {
                    let needle = arg.as_str().unwrap_or_default();
                    Ok(json!(state.text.lock().unwrap().contains(needle)))
                }
                "set_text" => {
                    *state.text.lock().unwrap() = arg.as_str().unwrap_or_default().to_string();
                    Ok(Value::Null)
                }
                "noop" => Ok(Value::Null),
                "score" => Ok(json!({"score": arg})),
                "fail" => Err((error_codes::INTERNAL_ERROR, "function failed".to_string())),
                other => Err((error_codes::METHOD_NOT_FOUND, format!("unknown function {other}"))),
            }
        }
        other => Err((error_codes::METHOD_NOT_FOUND, format!("unknown method {other}"))),
    }
}

/// Provisioner that hands out handles pointing at a fixed endpoint.
pub struct FixedProvisioner {
    endpoint: String,
    hot_reload: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub reloads: AtomicUsize,
}

impl FixedProvisioner {
    pub fn new(endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            hot_reload: false,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        })
    }

    /// Same, but accepting hot reloads like a locally built target.
    pub fn reloadable(endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            hot_reload: true,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        })
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FixedProvisioner {
    async fn acquire(&self, _target: &TargetRef) -> arena_target::Result<TargetHandle> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut handle = TargetHandle::new(
            self.endpoint.clone(),
            Backend::Remote {
                job_id: format!("job-{}", self.acquired.load(Ordering::SeqCst)),
            },
        );
        handle.transition(TargetState::Running);
        Ok(handle)
    }

    async fn hot_reload(&self, _handle: &TargetHandle, _source: &Path) -> arena_target::Result<()> {
        if !self.hot_reload {
            return Err(TargetError::UnsupportedOperation(
                "hot reload needs a locally built target".into(),
            ));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, handle: &mut TargetHandle) -> arena_target::Result<()> {
        if handle.state() == TargetState::Terminated {
            return Ok(());
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        handle.transition(TargetState::Terminated);
        Ok(())
    }
}

/// Provisioner whose targets never come up.
pub struct FailingProvisioner;

#[async_trait]
impl Provisioner for FailingProvisioner {
    async fn acquire(&self, target: &TargetRef) -> arena_target::Result<TargetHandle> {
        Err(TargetError::Provisioning(format!("{target} never answered its probe")))
    }

    async fn hot_reload(&self, _handle: &TargetHandle, _source: &Path) -> arena_target::Result<()> {
        Ok(())
    }

    async fn release(&self, _handle: &mut TargetHandle) -> arena_target::Result<()> {
        Ok(())
    }
}
