//! # arena-target
//!
//! Target provisioning layer for arena environments.
//!
//! A *target* is an isolated container (local or remote) running a gym and a
//! *controller* that exposes a small RPC surface: `ping`, `call`, `act` and
//! `observe`. This crate creates targets, waits for their controllers to come
//! up, talks to them, and tears them down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    arena-target (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌────────────────────┐    ┌─────────────────────────┐   │
//! │  │ RoutingProvisioner │───▶│ GymRegistry             │   │
//! │  │   - acquire()      │    │  browser / desktop / .. │   │
//! │  │   - hot_reload()   │    └─────────────────────────┘   │
//! │  │   - release()      │                                  │
//! │  └────────────────────┘                                  │
//! │        │            │                                    │
//! │        ▼            ▼                                    │
//! │  ┌────────────┐ ┌─────────────────┐                      │
//! │  │  Docker    │ │  Remote         │  HTTP /v1/targets    │
//! │  │ build/run  │ │  dispatch+poll  │─────────────▶        │
//! │  └────────────┘ └─────────────────┘                      │
//! │        │ published port     │ endpoint                   │
//! │        ▼                    ▼                            │
//! │  ┌──────────────────────────────────┐                    │
//! │  │ ControllerClient (JSON-RPC/TCP)  │                    │
//! │  │  ping / call / act / observe     │                    │
//! │  └──────────────────────────────────┘                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use arena_target::{ControllerClient, Provisioner, ProvisionerConfig, RoutingProvisioner, TargetRef};
//! use std::time::Duration;
//!
//! # async fn example() -> arena_target::Result<()> {
//! let provisioner = RoutingProvisioner::from_config(ProvisionerConfig::from_env())?;
//!
//! let mut handle = provisioner.acquire(&TargetRef::gym("browser")).await?;
//! let mut client = ControllerClient::connect(handle.endpoint(), Duration::from_secs(10)).await?;
//! client.ping().await?;
//!
//! provisioner.release(&mut handle).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod docker;
mod error;
mod probe;
mod provisioner;
mod registry;
mod remote;
mod target;

pub use client::{error_codes, ActOutcome, ControllerClient, FunctionCall};
pub use config::{ProbePolicy, ProvisionerConfig, ProvisionerConfigBuilder, RemoteConfig};
pub use docker::{
    image_tag_for, validate_build_context, DockerProvisioner, BUILD_DESCRIPTOR,
    CONTROLLER_PACKAGE_DIR,
};
pub use error::{Result, TargetError};
pub use probe::wait_until_live;
pub use provisioner::{Provisioner, RoutingProvisioner};
pub use registry::GymRegistry;
pub use remote::{RemoteProvisioner, RemoteStatus};
pub use target::{Backend, Location, Source, TargetHandle, TargetId, TargetRef, TargetState};
