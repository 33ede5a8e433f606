//! Dispatch of targets to a remote execution service.
//!
//! The service is asked to start an image, then polled until it reports the
//! target running (with a reachable controller endpoint) or failed.

use crate::config::{ProbePolicy, ProvisionerConfig, RemoteConfig};
use crate::error::{Result, TargetError};
use crate::probe::wait_until_live;
use crate::provisioner::Provisioner;
use crate::target::{Backend, Location, Source, TargetHandle, TargetRef, TargetState};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct CreateTargetRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateTargetResponse {
    id: String,
}

/// Status reported by the remote service for a dispatched target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Still starting.
    Pending,
    /// Ready; `endpoint` is set.
    Running,
    /// Will never become ready.
    Failed,
}

#[derive(Debug, Deserialize)]
struct TargetStatusResponse {
    status: RemoteStatus,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Provisioner backed by a remote execution service.
pub struct RemoteProvisioner {
    http: reqwest::Client,
    remote: RemoteConfig,
    probe: ProbePolicy,
}

impl RemoteProvisioner {
    /// Create a provisioner from the `remote` section of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Configuration`] when no remote service is configured.
    pub fn new(config: ProvisionerConfig) -> Result<Self> {
        let remote = config.remote.ok_or_else(|| {
            TargetError::Configuration("remote execution service is not configured".into())
        })?;
        if remote.base_url.is_empty() {
            return Err(TargetError::Configuration(
                "remote base_url is required".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            remote,
            probe: config.probe,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/targets{path}", self.remote.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.remote.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn create(&self, image: &str) -> Result<String> {
        let response = self
            .authorized(self.http.post(self.url("")))
            .json(&CreateTargetRequest { image })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TargetError::Provisioning(format!(
                "remote service rejected target for {image}: {status} {body}"
            )));
        }
        let created: CreateTargetResponse = response.json().await?;
        Ok(created.id)
    }

    async fn status(&self, job_id: &str) -> Result<TargetStatusResponse> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/{job_id}"))))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let response = self
            .authorized(self.http.delete(self.url(&format!("/{job_id}"))))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!(job_id = %job_id, "Remote target already gone");
                Ok(())
            }
            status => Err(TargetError::Provisioning(format!(
                "remote service refused to release {job_id}: {status}"
            ))),
        }
    }

    /// Poll until the service reports the target running, returning its endpoint.
    async fn wait_running(&self, job_id: &str) -> Result<String> {
        let deadline = Instant::now() + self.remote.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = match tokio::time::timeout(remaining, self.status(job_id)).await {
                Ok(poll) => poll,
                Err(_) => {
                    return Err(TargetError::Timeout {
                        operation: format!("remote target {job_id} startup"),
                        after: self.remote.timeout,
                    })
                }
            };
            match poll {
                Ok(TargetStatusResponse {
                    status: RemoteStatus::Running,
                    endpoint: Some(endpoint),
                    ..
                }) => return Ok(endpoint),
                Ok(TargetStatusResponse {
                    status: RemoteStatus::Failed,
                    message,
                    ..
                }) => {
                    return Err(TargetError::Provisioning(format!(
                        "remote target {job_id} failed: {}",
                        message.unwrap_or_else(|| "no message".into())
                    )))
                }
                Ok(report) => {
                    tracing::trace!(job_id = %job_id, status = ?report.status, "Remote target not ready");
                }
                // A flaky status endpoint is retried until the deadline.
                Err(e) => tracing::debug!(job_id = %job_id, error = %e, "Status poll failed"),
            }

            if Instant::now() + self.remote.poll_interval > deadline {
                return Err(TargetError::Timeout {
                    operation: format!("remote target {job_id} startup"),
                    after: self.remote.timeout,
                });
            }
            tokio::time::sleep(self.remote.poll_interval).await;
        }
    }
}

#[async_trait]
impl Provisioner for RemoteProvisioner {
    async fn acquire(&self, target: &TargetRef) -> Result<TargetHandle> {
        let image = match target {
            TargetRef::CustomGym {
                location: Location::Remote,
                source: Source::Image(image),
            } => image,
            TargetRef::CustomGym {
                location: Location::Remote,
                source: Source::BuildContext(path),
            } => {
                return Err(TargetError::Configuration(format!(
                    "remote targets need a pre-built image, got build context {}",
                    path.display()
                )))
            }
            other => {
                return Err(TargetError::Configuration(format!(
                    "remote provisioner only handles remote custom gyms, got {other}"
                )))
            }
        };

        let start = Instant::now();
        let job_id = self.create(image).await?;
        tracing::info!(job_id = %job_id, image = %image, "Remote target dispatched");

        let ready = match self.wait_running(&job_id).await {
            Ok(endpoint) => wait_until_live(&endpoint, &self.probe)
                .await
                .map(|()| endpoint),
            Err(e) => Err(e),
        };

        let endpoint = match ready {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Remote target never became ready");
                if let Err(cleanup) = self.delete(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to release remote target");
                }
                return Err(e);
            }
        };

        let mut handle = TargetHandle::new(endpoint, Backend::Remote { job_id });
        handle.transition(TargetState::Running);
        tracing::info!(
            target_id = %handle.id(),
            endpoint = %handle.endpoint(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Remote target ready"
        );
        Ok(handle)
    }

    async fn hot_reload(&self, _handle: &TargetHandle, _controller_source: &Path) -> Result<()> {
        Err(TargetError::UnsupportedOperation(
            "hot reload is not available for remote targets".into(),
        ))
    }

    async fn release(&self, handle: &mut TargetHandle) -> Result<()> {
        if handle.state() == TargetState::Terminated {
            return Ok(());
        }
        let Backend::Remote { job_id } = handle.backend() else {
            return Err(TargetError::Configuration(format!(
                "target {} is not a remote target",
                handle.id()
            )));
        };
        let job_id = job_id.clone();

        tracing::info!(target_id = %handle.id(), job_id = %job_id, "Releasing remote target");
        handle.transition(TargetState::Terminating);
        match self.delete(&job_id).await {
            Ok(()) => {
                handle.transition(TargetState::Terminated);
                Ok(())
            }
            Err(e) => {
                handle.transition(TargetState::Failed);
                Err(e)
            }
        }
    }
}
