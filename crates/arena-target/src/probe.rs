//! Liveness probe against a target's controller.
//!
//! A target only counts as `Running` once its controller accepts a
//! connection and answers `ping`.

use crate::client::ControllerClient;
use crate::config::ProbePolicy;
use crate::error::TargetError;
use tokio::time::timeout;

/// Probe `endpoint` until the controller answers or the policy's budget is spent.
///
/// # Errors
///
/// Returns [`TargetError::Provisioning`] when every attempt failed.
pub async fn wait_until_live(endpoint: &str, policy: &ProbePolicy) -> Result<(), TargetError> {
    let start = std::time::Instant::now();
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=policy.attempts {
        match probe_once(endpoint, policy).await {
            Ok(()) => {
                tracing::debug!(
                    endpoint = %endpoint,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Liveness probe passed"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::trace!(endpoint = %endpoint, attempt, error = %e, "Liveness probe attempt failed");
                last_error = e.to_string();
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    tracing::warn!(
        endpoint = %endpoint,
        attempts = policy.attempts,
        elapsed_ms = start.elapsed().as_millis() as u64,
        error = %last_error,
        "Liveness probe budget exhausted"
    );
    Err(TargetError::Provisioning(format!(
        "controller at {endpoint} failed liveness probe after {} attempts: {last_error}",
        policy.attempts
    )))
}

async fn probe_once(endpoint: &str, policy: &ProbePolicy) -> Result<(), TargetError> {
    let mut client = timeout(policy.attempt_timeout, ControllerClient::try_connect(endpoint))
        .await
        .map_err(|_| TargetError::Connection(format!("connect to {endpoint} timed out")))??
        .with_rpc_timeout(policy.attempt_timeout);
    client.ping().await
}
