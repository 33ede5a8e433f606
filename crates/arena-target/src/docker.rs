//! Local container provisioning on the Docker daemon.
//!
//! Build-context targets are built into an image first; image targets are
//! started directly. Every container publishes the controller port on an
//! ephemeral loopback port, and the handle only becomes `Running` once the
//! controller behind that port passes its liveness probe.

use crate::config::ProvisionerConfig;
use crate::error::{Result, TargetError};
use crate::probe::wait_until_live;
use crate::provisioner::Provisioner;
use crate::target::{Backend, Location, Source, TargetHandle, TargetId, TargetRef, TargetState};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Build descriptor every build context must contain.
pub const BUILD_DESCRIPTOR: &str = "Dockerfile";

/// Directory (relative to the build context) holding the controller package.
pub const CONTROLLER_PACKAGE_DIR: &str = "controller";

/// Label applied to every container this provisioner starts.
const MANAGED_BY_LABEL: (&str, &str) = ("managed-by", "arena");

/// Provisioner backed by the local Docker daemon.
pub struct DockerProvisioner {
    docker: Docker,
    config: ProvisionerConfig,
}

impl DockerProvisioner {
    /// Create a provisioner using the local Docker defaults (socket or `DOCKER_HOST`).
    pub fn connect(config: ProvisionerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::from_client(docker, config))
    }

    /// Create from an existing bollard client.
    pub fn from_client(docker: Docker, config: ProvisionerConfig) -> Self {
        Self { docker, config }
    }

    /// Check that the Docker daemon answers.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Build an image from `context` and return its tag.
    ///
    /// The context is archived with normalized metadata so identical
    /// directories produce identical build inputs.
    async fn build(&self, context: &Path) -> Result<String> {
        validate_build_context(context)?;
        let tag = image_tag_for(context);
        let start = std::time::Instant::now();
        tracing::info!(context = %context.display(), tag = %tag, "Building gym image");

        let archive = archive_dir(context.to_path_buf(), PathBuf::from(".")).await?;
        let options = BuildImageOptions {
            dockerfile: BUILD_DESCRIPTOR.to_string(),
            t: tag.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut log = String::new();
        let mut stream = self.docker.build_image(options, None, Some(Bytes::from(archive)));
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        tracing::trace!(line = %line.trim_end(), "build output");
                        log.push_str(&line);
                    }
                    if let Some(error) = info.error {
                        tracing::warn!(tag = %tag, error = %error, "Image build failed");
                        return Err(TargetError::Build {
                            message: error,
                            log,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Image build stream failed");
                    return Err(TargetError::Build {
                        message: e.to_string(),
                        log,
                    });
                }
            }
        }

        tracing::info!(
            tag = %tag,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Gym image built"
        );
        Ok(tag)
    }

    /// Create and start a container, returning the published controller endpoint.
    async fn start_container(&self, name: &str, image: &str) -> Result<String> {
        let port_key = format!("{}/tcp", self.config.controller_port);

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: None,
                }]),
            )])),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.to_string()),
            exposed_ports: Some(HashMap::from([(port_key.clone(), HashMap::new())])),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                MANAGED_BY_LABEL.0.to_string(),
                MANAGED_BY_LABEL.1.to_string(),
            )])),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container_config,
            )
            .await?;
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;

        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let host_port = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&port_key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|port| !port.is_empty())
            .ok_or_else(|| {
                TargetError::Provisioning(format!(
                    "container {name} did not publish controller port {port_key}"
                ))
            })?;

        Ok(format!("127.0.0.1:{host_port}"))
    }

    /// Describe why a container is not serving, for error messages.
    async fn container_status(&self, name: &str) -> String {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => match inspect.state {
                Some(state) if state.running == Some(true) => "container running".to_string(),
                Some(state) => format!(
                    "container exited with code {}",
                    state.exit_code.unwrap_or(-1)
                ),
                None => "container state unknown".to_string(),
            },
            Err(e) => format!("container not inspectable: {e}"),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let _ = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 5 }))
            .await;

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                tracing::debug!(container = %container_id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run a command inside a container and return `(exit_code, combined output)`.
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<(i64, String)> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(log) => output.push_str(&log.to_string()),
                    Err(e) => {
                        output.push_str(&format!("\n[exec stream error: {e}]"));
                        break;
                    }
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok((inspect.exit_code.unwrap_or(-1), output))
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn acquire(&self, target: &TargetRef) -> Result<TargetHandle> {
        let TargetRef::CustomGym {
            location: Location::Local,
            source,
        } = target
        else {
            return Err(TargetError::Configuration(format!(
                "docker provisioner only handles local custom gyms, got {target}"
            )));
        };

        let id = TargetId::new();
        let start = std::time::Instant::now();
        tracing::info!(target_id = %id, target = %target, "Acquiring local target");

        let (image, build_context) = match source {
            Source::Image(image) => (image.clone(), None),
            Source::BuildContext(context) => {
                tracing::debug!(target_id = %id, state = %TargetState::Building, "Target state");
                (self.build(context).await?, Some(context.clone()))
            }
        };

        let name = format!("arena-target-{id}");
        let endpoint = match self.start_container(&name, &image).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(target_id = %id, error = %e, "Container start failed");
                let _ = self.remove(&name).await;
                return Err(e);
            }
        };
        tracing::debug!(target_id = %id, endpoint = %endpoint, "Container started, probing controller");

        if let Err(e) = wait_until_live(&endpoint, &self.config.probe).await {
            let status = self.container_status(&name).await;
            tracing::error!(target_id = %id, status = %status, "Target failed liveness probe");
            if let Err(cleanup) = self.remove(&name).await {
                tracing::warn!(target_id = %id, error = %cleanup, "Failed to remove unhealthy container");
            }
            return Err(TargetError::Provisioning(format!("{e} ({status})")));
        }

        let mut handle = TargetHandle::new(
            endpoint,
            Backend::Container {
                container_id: name,
                image,
                build_context,
            },
        );
        handle.transition(TargetState::Running);
        tracing::info!(
            target_id = %handle.id(),
            endpoint = %handle.endpoint(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Local target ready"
        );
        Ok(handle)
    }

    async fn hot_reload(&self, handle: &TargetHandle, controller_source: &Path) -> Result<()> {
        let Backend::Container {
            container_id,
            build_context: Some(_),
            ..
        } = handle.backend()
        else {
            return Err(TargetError::UnsupportedOperation(
                "hot reload requires a local target built from a build context".into(),
            ));
        };
        if handle.state() != TargetState::Running {
            return Err(TargetError::Provisioning(format!(
                "cannot hot reload target {} in state {}",
                handle.id(),
                handle.state()
            )));
        }
        if !controller_source.is_dir() {
            return Err(TargetError::Configuration(format!(
                "controller source {} is not a directory",
                controller_source.display()
            )));
        }

        let start = std::time::Instant::now();
        let install_dir = &self.config.controller_dir;
        let (parent, leaf) = match (install_dir.parent(), install_dir.file_name()) {
            (Some(parent), Some(leaf)) => (parent.to_path_buf(), PathBuf::from(leaf)),
            _ => {
                return Err(TargetError::Configuration(format!(
                    "controller_dir {} has no parent directory",
                    install_dir.display()
                )))
            }
        };

        let archive = archive_dir(controller_source.to_path_buf(), leaf).await?;
        tracing::debug!(
            target_id = %handle.id(),
            bytes = archive.len(),
            dest = %install_dir.display(),
            "Uploading controller source"
        );
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: parent.to_string_lossy().to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await?;

        let (exit_code, output) = self.exec(container_id, &self.config.reload_command).await?;
        if exit_code != 0 {
            tracing::warn!(target_id = %handle.id(), exit_code, "Controller reinstall failed");
            return Err(TargetError::Provisioning(format!(
                "controller reinstall exited with {exit_code}: {}",
                output.trim()
            )));
        }

        tracing::info!(
            target_id = %handle.id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Controller hot reloaded"
        );
        Ok(())
    }

    async fn release(&self, handle: &mut TargetHandle) -> Result<()> {
        if handle.state() == TargetState::Terminated {
            return Ok(());
        }
        let Backend::Container { container_id, .. } = handle.backend() else {
            return Err(TargetError::Configuration(format!(
                "target {} is not a local container",
                handle.id()
            )));
        };
        let container_id = container_id.clone();

        tracing::info!(target_id = %handle.id(), container = %container_id, "Releasing local target");
        handle.transition(TargetState::Terminating);
        match self.remove(&container_id).await {
            Ok(()) => {
                handle.transition(TargetState::Terminated);
                Ok(())
            }
            Err(e) => {
                tracing::error!(target_id = %handle.id(), error = %e, "Failed to remove container");
                handle.transition(TargetState::Failed);
                Err(e)
            }
        }
    }
}

/// Check the conventional layout of a build context.
pub fn validate_build_context(context: &Path) -> Result<()> {
    if !context.is_dir() {
        return Err(TargetError::Configuration(format!(
            "build context {} is not a directory",
            context.display()
        )));
    }
    if !context.join(BUILD_DESCRIPTOR).is_file() {
        return Err(TargetError::Configuration(format!(
            "build context {} has no {BUILD_DESCRIPTOR}",
            context.display()
        )));
    }
    if !context.join(CONTROLLER_PACKAGE_DIR).is_dir() {
        return Err(TargetError::Configuration(format!(
            "build context {} has no {CONTROLLER_PACKAGE_DIR}/ package",
            context.display()
        )));
    }
    Ok(())
}

/// Image tag derived from the build context's directory name.
pub fn image_tag_for(context: &Path) -> String {
    let name: String = context
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches(|c| c == '-' || c == '.' || c == '_');
    if name.is_empty() {
        "arena-gym:dev".to_string()
    } else {
        format!("arena-gym-{name}:dev")
    }
}

/// Tar `dir` under `prefix` with normalized headers.
async fn archive_dir(dir: PathBuf, prefix: PathBuf) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);
        builder.append_dir_all(&prefix, &dir)?;
        builder.into_inner()
    })
    .await
    .map_err(|e| TargetError::Io(std::io::Error::other(e)))?
    .map_err(TargetError::from)
}
