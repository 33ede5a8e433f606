//! Target references and handles.
//!
//! A [`TargetRef`] says *what* to provision; a [`TargetHandle`] is the
//! exclusive, non-cloneable receipt for one provisioned target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a custom gym runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Local Docker daemon.
    Local,
    /// External execution service.
    Remote,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// What a custom gym is built or started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// A ready-made image name, e.g. `ghcr.io/acme/todo-gym:latest`.
    Image(String),
    /// A local directory holding a `Dockerfile` and a `controller/` package.
    BuildContext(PathBuf),
}

/// Selects which target to provision and which provisioning strategy applies.
///
/// JSON forms:
///
/// ```json
/// {"standard_gym": "browser"}
/// {"custom_gym": {"location": "local", "source": {"build_context": "./gyms/todo"}}}
/// {"custom_gym": {"location": "remote", "source": {"image": "acme/todo:1"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRef {
    /// A pre-registered gym, resolved through a [`GymRegistry`](crate::GymRegistry).
    StandardGym(String),
    /// A caller-supplied gym.
    CustomGym {
        /// Where to run it
        location: Location,
        /// What to run
        source: Source,
    },
}

impl TargetRef {
    /// Reference a pre-registered gym by name.
    pub fn gym(name: impl Into<String>) -> Self {
        Self::StandardGym(name.into())
    }

    /// Start a local container from an existing image.
    pub fn local_image(image: impl Into<String>) -> Self {
        Self::CustomGym {
            location: Location::Local,
            source: Source::Image(image.into()),
        }
    }

    /// Build a local image from a directory, then start it.
    pub fn local_build(context: impl Into<PathBuf>) -> Self {
        Self::CustomGym {
            location: Location::Local,
            source: Source::BuildContext(context.into()),
        }
    }

    /// Dispatch an image to the remote execution service.
    pub fn remote_image(image: impl Into<String>) -> Self {
        Self::CustomGym {
            location: Location::Remote,
            source: Source::Image(image.into()),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StandardGym(name) => write!(f, "gym:{name}"),
            Self::CustomGym { location, source } => match source {
                Source::Image(image) => write!(f, "{location}:image:{image}"),
                Source::BuildContext(path) => write!(f, "{location}:build:{}", path.display()),
            },
        }
    }
}

/// Unique identifier for a provisioned target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Create a new random target ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TargetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle state of a provisioned target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    /// Creation requested, nothing started yet.
    Pending,
    /// Building an image from a local build context.
    Building,
    /// Started and passed its liveness probe.
    Running,
    /// Teardown in progress.
    Terminating,
    /// Released.
    Terminated,
    /// Failed before or after becoming ready.
    Failed,
}

impl TargetState {
    /// Terminated targets accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Building => write!(f, "Building"),
            Self::Running => write!(f, "Running"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Backend-specific part of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// A container on the local Docker daemon.
    Container {
        /// Docker container id or name
        container_id: String,
        /// Image the container was started from
        image: String,
        /// Build context, when the image was built locally
        build_context: Option<PathBuf>,
    },
    /// A target owned by the remote execution service.
    Remote {
        /// Identifier assigned by the service
        job_id: String,
    },
}

/// Exclusive receipt for one provisioned target.
///
/// Not `Clone`: exactly one owner may address a target.
#[derive(Debug)]
pub struct TargetHandle {
    id: TargetId,
    endpoint: String,
    backend: Backend,
    state: TargetState,
    created_at: DateTime<Utc>,
}

impl TargetHandle {
    /// Create a handle for a freshly started target.
    ///
    /// `endpoint` is the `host:port` of the controller's RPC surface.
    pub fn new(endpoint: impl Into<String>, backend: Backend) -> Self {
        Self {
            id: TargetId::new(),
            endpoint: endpoint.into(),
            backend,
            state: TargetState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Get the target ID.
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Controller RPC address.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Backend details.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Get the current state.
    pub fn state(&self) -> TargetState {
        self.state
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Build context the target was built from, if any.
    pub fn build_context(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Container { build_context, .. } => build_context.as_deref(),
            Backend::Remote { .. } => None,
        }
    }

    /// Move the handle to `next`. Transitions out of `Terminated` are ignored.
    pub fn transition(&mut self, next: TargetState) {
        if self.state.is_terminal() {
            tracing::trace!(target_id = %self.id, next = %next, "Ignoring transition out of Terminated");
            return;
        }
        tracing::trace!(target_id = %self.id, from = %self.state, to = %next, "Target state transition");
        self.state = next;
    }
}
