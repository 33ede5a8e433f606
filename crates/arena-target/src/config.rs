//! Provisioner configuration types.

use crate::error::TargetError;
use std::path::PathBuf;
use std::time::Duration;

/// Bounded-retry policy for the liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Number of connect+ping attempts before the target is declared failed.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
    /// Timeout for a single connect or ping.
    pub attempt_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

/// Settings for the remote execution service.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Service base URL, e.g. `https://exec.example.com`.
    pub base_url: String,
    /// Bearer token, if the service requires one.
    pub api_key: Option<String>,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Upper bound on waiting for the target to report `running`.
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Configuration shared by the provisioners.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Port the controller listens on inside the container (default: 8765).
    pub controller_port: u16,
    /// Where the controller package lives inside the container.
    pub controller_dir: PathBuf,
    /// Command run inside the container after new controller source is copied in.
    pub reload_command: Vec<String>,
    /// Liveness probe policy.
    pub probe: ProbePolicy,
    /// Remote execution service; `None` disables remote targets.
    pub remote: Option<RemoteConfig>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            controller_port: 8765,
            controller_dir: PathBuf::from("/app/controller"),
            reload_command: vec![
                "pip".into(),
                "install".into(),
                "--no-deps".into(),
                "-e".into(),
                "/app/controller".into(),
            ],
            probe: ProbePolicy::default(),
            remote: None,
        }
    }
}

impl ProvisionerConfig {
    /// Create a new config builder.
    pub fn builder() -> ProvisionerConfigBuilder {
        ProvisionerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `ARENA_CONTROLLER_PORT` | `8765` |
    /// | `ARENA_PROBE_ATTEMPTS` | `60` |
    /// | `ARENA_PROBE_INTERVAL_MS` | `500` |
    /// | `ARENA_REMOTE_URL` | unset (remote targets disabled) |
    /// | `ARENA_API_KEY` | unset |
    /// | `ARENA_REMOTE_TIMEOUT_SECS` | `300` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let probe = ProbePolicy {
            attempts: env_parse("ARENA_PROBE_ATTEMPTS").unwrap_or(default.probe.attempts),
            interval: env_parse("ARENA_PROBE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.probe.interval),
            ..default.probe
        };

        let remote = std::env::var("ARENA_REMOTE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|base_url| RemoteConfig {
                base_url,
                api_key: std::env::var("ARENA_API_KEY").ok(),
                timeout: env_parse("ARENA_REMOTE_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(RemoteConfig::default().timeout),
                ..RemoteConfig::default()
            });

        Self {
            controller_port: env_parse("ARENA_CONTROLLER_PORT").unwrap_or(default.controller_port),
            probe,
            remote,
            ..default
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.controller_port == 0 {
            return Err(TargetError::Configuration(
                "controller_port must be > 0".into(),
            ));
        }
        if self.probe.attempts == 0 {
            return Err(TargetError::Configuration(
                "probe attempts must be > 0".into(),
            ));
        }
        if self.reload_command.is_empty() {
            return Err(TargetError::Configuration(
                "reload_command must not be empty".into(),
            ));
        }
        if let Some(remote) = &self.remote {
            if remote.base_url.is_empty() {
                return Err(TargetError::Configuration(
                    "remote base_url is required".into(),
                ));
            }
            if remote.timeout.is_zero() {
                return Err(TargetError::Configuration(
                    "remote timeout must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Builder for ProvisionerConfig.
#[derive(Debug, Default)]
pub struct ProvisionerConfigBuilder {
    config: ProvisionerConfig,
}

impl ProvisionerConfigBuilder {
    /// Set the controller port inside the container.
    pub fn controller_port(mut self, port: u16) -> Self {
        self.config.controller_port = port;
        self
    }

    /// Set where the controller package lives inside the container.
    pub fn controller_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.controller_dir = dir.into();
        self
    }

    /// Set the in-place reinstall command used by hot reload.
    pub fn reload_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.reload_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the liveness probe policy.
    pub fn probe(mut self, probe: ProbePolicy) -> Self {
        self.config.probe = probe;
        self
    }

    /// Enable remote targets.
    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = Some(remote);
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ProvisionerConfig, TargetError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.controller_port, 8765);
        assert_eq!(config.probe.attempts, 60);
        assert!(config.remote.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_probe_attempts() {
        let result = ProvisionerConfig::builder()
            .probe(ProbePolicy {
                attempts: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(TargetError::Configuration(_))));
    }

    #[test]
    fn test_builder_rejects_remote_without_url() {
        let result = ProvisionerConfig::builder()
            .remote(RemoteConfig::default())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = ProvisionerConfig::builder()
            .controller_port(9000)
            .controller_dir("/opt/ctl")
            .reload_command(["sh", "-c", "make install"])
            .remote(RemoteConfig {
                base_url: "http://exec.local".into(),
                ..Default::default()
            })
            .build()
            .expect("should build successfully");

        assert_eq!(config.controller_port, 9000);
        assert_eq!(config.controller_dir, PathBuf::from("/opt/ctl"));
        assert_eq!(config.reload_command, vec!["sh", "-c", "make install"]);
        assert_eq!(config.remote.unwrap().base_url, "http://exec.local");
    }
}
