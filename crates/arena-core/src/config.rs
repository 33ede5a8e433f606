//! Runtime configuration.

use crate::error::{CoreError, Result};
use crate::observation::Resolution;
use arena_target::ProvisionerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Bounded exponential backoff for trace uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total upload attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Where and how traces are shipped.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Ingest service base URL; `None` keeps traces local only
    pub ingest_url: Option<String>,
    /// Bearer token for the ingest service
    pub api_key: Option<String>,
    /// Upload retry policy
    pub retry: RetryPolicy,
    /// Directory for runs that could not be uploaded
    pub fallback_dir: PathBuf,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            ingest_url: None,
            api_key: None,
            retry: RetryPolicy::default(),
            fallback_dir: std::env::temp_dir().join("arena-traces"),
        }
    }
}

/// Everything an arena process needs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Provisioning settings
    pub provisioner: ProvisionerConfig,
    /// Tracing settings
    pub tracer: TracerConfig,
    /// Resolution agents are assumed to work at when an adapter does not say
    pub agent_resolution: Option<Resolution>,
    /// Upper bound on steps per episode in the runner
    pub max_steps: u32,
    /// Timeout for connecting to a target's controller
    pub connect_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provisioner: ProvisionerConfig::default(),
            tracer: TracerConfig::default(),
            agent_resolution: None,
            max_steps: 50,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// Provisioner variables are documented on [`ProvisionerConfig::from_env`].
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `ARENA_INGEST_URL` | unset (traces kept local) |
    /// | `ARENA_INGEST_API_KEY` | falls back to `ARENA_API_KEY` |
    /// | `ARENA_TRACE_DIR` | `$TMPDIR/arena-traces` |
    /// | `ARENA_UPLOAD_ATTEMPTS` | `5` |
    /// | `ARENA_AGENT_RESOLUTION` | unset, e.g. `1280x720` |
    /// | `ARENA_MAX_STEPS` | `50` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let tracer = TracerConfig {
            ingest_url: std::env::var("ARENA_INGEST_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            api_key: std::env::var("ARENA_INGEST_API_KEY")
                .or_else(|_| std::env::var("ARENA_API_KEY"))
                .ok(),
            retry: RetryPolicy {
                max_attempts: env_parse("ARENA_UPLOAD_ATTEMPTS")
                    .unwrap_or(default.tracer.retry.max_attempts),
                ..default.tracer.retry
            },
            fallback_dir: std::env::var("ARENA_TRACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.tracer.fallback_dir),
        };

        Self {
            provisioner: ProvisionerConfig::from_env(),
            tracer,
            agent_resolution: std::env::var("ARENA_AGENT_RESOLUTION")
                .ok()
                .and_then(|v| parse_resolution(&v)),
            max_steps: env_parse("ARENA_MAX_STEPS").unwrap_or(default.max_steps),
            ..default
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.provisioner.validate().map_err(|e| CoreError::Configuration(e.to_string()))?;
        if self.tracer.retry.max_attempts == 0 {
            return Err(CoreError::Configuration(
                "upload attempts must be > 0".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(CoreError::Configuration("max_steps must be > 0".into()));
        }
        if let Some(resolution) = self.agent_resolution {
            if !resolution.is_positive() {
                return Err(CoreError::Configuration(format!(
                    "agent resolution must be positive, got {resolution}"
                )));
            }
        }
        Ok(())
    }
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_resolution(value: &str) -> Option<Resolution> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some(Resolution::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
