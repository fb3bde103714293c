//! Container runtime abstraction.
//!
//! The lifecycle manager only talks to the runtime through
//! [`ContainerRuntime`], and only obtains runtimes through a
//! [`Connector`]. The Docker implementation lives in [`crate::docker`].

use std::sync::Arc;

use async_trait::async_trait;
use instancer_common::error::Result;
use instancer_common::types::{ContainerId, ContainerStatus, ResourceLimits};

use crate::endpoint::Endpoint;

/// Everything the runtime needs to start one challenge instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Image reference to run.
    pub image: String,
    /// Port published on a runtime-chosen host port.
    pub internal_port: u16,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// Translated resource constraints.
    pub limits: ResourceLimits,
    /// Bind mounts in `host:container[:mode]` form.
    pub binds: Vec<String>,
    /// Whether the runtime removes the container once it stops.
    pub auto_remove: bool,
}

impl RunSpec {
    /// Builds a spec for `image` exposing `internal_port`.
    #[must_use]
    pub fn new(image: impl Into<String>, internal_port: u16) -> Self {
        Self {
            image: image.into(),
            internal_port,
            command: Vec::new(),
            limits: ResourceLimits::default(),
            binds: Vec::new(),
            auto_remove: true,
        }
    }

    /// Sets the command from a startup command line.
    #[must_use]
    pub fn command_line(mut self, line: &str) -> Self {
        self.command = line.split_whitespace().map(str::to_string).collect();
        self
    }

    /// Sets the resource limits.
    #[must_use]
    pub const fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the bind mounts.
    #[must_use]
    pub fn binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    /// Runtime port key, e.g. `1337/tcp`.
    #[must_use]
    pub fn port_key(&self) -> String {
        format!("{}/tcp", self.internal_port)
    }
}

/// An image known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// Runtime image identifier.
    pub id: String,
    /// Repository tags; may be empty for dangling images.
    pub tags: Vec<String>,
}

/// Operations the lifecycle manager needs from a container runtime.
///
/// Implementations classify failures: transport problems as
/// [`InstancerError::Transport`](instancer_common::error::InstancerError::Transport),
/// unknown containers as `NotFound`, and domain rejections as `Runtime`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks that the runtime answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be reached.
    async fn ping(&self) -> Result<()>;

    /// Creates and starts a container, returning its identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is missing or the runtime refuses.
    async fn run(&self, spec: &RunSpec) -> Result<ContainerId>;

    /// Reports whether a container is running.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport or runtime failures; an
    /// unknown container is [`ContainerStatus::Missing`].
    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus>;

    /// Returns the host port bound to the container's published port.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected.
    async fn host_port(&self, id: &ContainerId) -> Result<Option<u16>>;

    /// Kills a container. Killing a container that is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refuses the kill.
    async fn kill(&self, id: &ContainerId) -> Result<()>;

    /// Lists images known to the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;
}

/// Establishes runtime handles for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `endpoint` and verifies the runtime answers.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Connection`](instancer_common::error::InstancerError::Connection)
    /// classified as timeout, authentication, or transport failure.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ContainerRuntime>>;
}
