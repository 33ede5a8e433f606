//! The provisioning seam and the routing provisioner.

use crate::config::ProvisionerConfig;
use crate::docker::DockerProvisioner;
use crate::error::{Result, TargetError};
use crate::registry::GymRegistry;
use crate::remote::RemoteProvisioner;
use crate::target::{Backend, Location, TargetHandle, TargetRef, TargetState};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Creates and destroys isolated execution targets.
///
/// Implementations must make `release` idempotent: releasing a handle that is
/// already `Terminated`, or whose target no longer exists, succeeds.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Materialize a target. The returned handle is `Running` and has passed
    /// its liveness probe.
    async fn acquire(&self, target: &TargetRef) -> Result<TargetHandle>;

    /// Copy new controller source into a running target and reinstall it in place.
    async fn hot_reload(&self, handle: &TargetHandle, controller_source: &Path) -> Result<()>;

    /// Tear the target down.
    async fn release(&self, handle: &mut TargetHandle) -> Result<()>;
}

/// Resolves standard gyms, then routes each request to the local or remote backend.
#[derive(Clone)]
pub struct RoutingProvisioner {
    registry: GymRegistry,
    local: Option<Arc<dyn Provisioner>>,
    remote: Option<Arc<dyn Provisioner>>,
}

impl RoutingProvisioner {
    /// Create a router with no backends.
    pub fn new(registry: GymRegistry) -> Self {
        Self {
            registry,
            local: None,
            remote: None,
        }
    }

    /// Build the default router: Docker locally, plus the remote service when configured.
    pub fn from_config(config: ProvisionerConfig) -> Result<Self> {
        config.validate()?;
        let mut router = Self::new(GymRegistry::default())
            .with_local(Arc::new(DockerProvisioner::connect(config.clone())?));
        if config.remote.is_some() {
            router = router.with_remote(Arc::new(RemoteProvisioner::new(config)?));
        }
        Ok(router)
    }

    /// Set the backend for `Location::Local`.
    pub fn with_local(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.local = Some(provisioner);
        self
    }

    /// Set the backend for `Location::Remote`.
    pub fn with_remote(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.remote = Some(provisioner);
        self
    }

    /// Mutable access to the gym registry.
    pub fn registry_mut(&mut self) -> &mut GymRegistry {
        &mut self.registry
    }

    fn backend_for(&self, location: Location) -> Result<&Arc<dyn Provisioner>> {
        let backend = match location {
            Location::Local => self.local.as_ref(),
            Location::Remote => self.remote.as_ref(),
        };
        backend.ok_or_else(|| {
            TargetError::Configuration(format!("no provisioner configured for {location} targets"))
        })
    }

    fn backend_for_handle(&self, handle: &TargetHandle) -> Result<&Arc<dyn Provisioner>> {
        match handle.backend() {
            Backend::Container { .. } => self.backend_for(Location::Local),
            Backend::Remote { .. } => self.backend_for(Location::Remote),
        }
    }
}

#[async_trait]
impl Provisioner for RoutingProvisioner {
    async fn acquire(&self, target: &TargetRef) -> Result<TargetHandle> {
        let resolved = self.registry.resolve(target)?;
        let TargetRef::CustomGym { location, .. } = &resolved else {
            return Err(TargetError::Configuration(format!(
                "registry returned unresolved target {resolved}"
            )));
        };
        tracing::debug!(requested = %target, resolved = %resolved, "Routing acquire");
        self.backend_for(*location)?.acquire(&resolved).await
    }

    async fn hot_reload(&self, handle: &TargetHandle, controller_source: &Path) -> Result<()> {
        self.backend_for_handle(handle)?
            .hot_reload(handle, controller_source)
            .await
    }

    async fn release(&self, handle: &mut TargetHandle) -> Result<()> {
        if handle.state() == TargetState::Terminated {
            return Ok(());
        }
        self.backend_for_handle(handle)?.release(handle).await
    }
}
