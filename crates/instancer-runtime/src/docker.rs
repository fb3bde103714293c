//! Docker Engine implementation of [`ContainerRuntime`] over `bollard`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::ListImagesOptions;
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::{API_DEFAULT_VERSION, Docker};
use instancer_common::constants::{API_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS};
use instancer_common::error::{ConnectionFailure, InstancerError, Result};
use instancer_common::types::{ContainerId, ContainerStatus};

use crate::backend::{Connector, ContainerRuntime, ImageSummary, RunSpec};
use crate::endpoint::Endpoint;
use crate::ssh::SshTunnel;

/// Connects to Docker Engine endpoints.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    connect_timeout: Duration,
}

impl DockerConnector {
    /// Creates a connector with the default connect timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub const fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for DockerConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ContainerRuntime>> {
        tracing::info!(%endpoint, "connecting to container runtime");
        let (docker, tunnel) = match endpoint {
            Endpoint::Unix(path) => {
                let docker = Docker::connect_with_unix(
                    &path.to_string_lossy(),
                    API_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(connect_failure)?;
                (docker, None)
            }
            Endpoint::Tcp(addr) => {
                let docker = Docker::connect_with_http(
                    &format!("http://{addr}"),
                    API_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(connect_failure)?;
                (docker, None)
            }
            Endpoint::Ssh { .. } => {
                let tunnel = SshTunnel::open(endpoint, self.connect_timeout).await?;
                let docker = Docker::connect_with_unix(
                    &tunnel.socket_path().to_string_lossy(),
                    API_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(connect_failure)?;
                (docker, Some(tunnel))
            }
        };

        // The client connects lazily; a ping makes failures surface here.
        match tokio::time::timeout(self.connect_timeout, docker.ping()).await {
            Err(_) => {
                return Err(InstancerError::Connection {
                    kind: ConnectionFailure::Timeout,
                    message: format!("no answer from {endpoint} within {:?}", self.connect_timeout),
                });
            }
            Ok(Err(e)) => return Err(connect_failure(e)),
            Ok(Ok(_)) => {}
        }

        tracing::info!(%endpoint, "container runtime connected");
        Ok(Arc::new(DockerRuntime {
            docker,
            _tunnel: tunnel,
        }))
    }
}

/// A live Docker client. Dropping it tears down any SSH tunnel.
pub struct DockerRuntime {
    docker: Docker,
    _tunnel: Option<SshTunnel>,
}

impl DockerRuntime {
    async fn discard(&self, id: &ContainerId) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id.as_str(), Some(options)).await {
            tracing::warn!(container = %id, error = %e, "failed to remove unstarted container");
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerId> {
        let config = container_config(spec);
        let created = match self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
        {
            Ok(created) => created,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(InstancerError::Runtime {
                    message: format!("image not found: {}", spec.image),
                });
            }
            Err(e) => return Err(classify(e)),
        };
        for warning in &created.warnings {
            tracing::warn!(image = %spec.image, %warning, "runtime warning on create");
        }

        let id = ContainerId::new(created.id);
        if let Err(e) = self
            .docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            self.discard(&id).await;
            return Err(classify(e));
        }
        tracing::info!(container = %id.short(), image = %spec.image, "container started");
        Ok(id)
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::Missing),
            Err(e) => Err(classify(e)),
        }
    }

    async fn host_port(&self, id: &ContainerId) -> Result<Option<u16>> {
        let info = match self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(InstancerError::NotFound {
                    kind: "container",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(classify(e)),
        };
        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();
        Ok(first_host_port(&ports))
    }

    async fn kill(&self, id: &ContainerId) -> Result<()> {
        match self
            .docker
            .kill_container(id.as_str(), None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                tracing::info!(container = %id.short(), "container killed");
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                message,
            }) => {
                tracing::debug!(container = %id.short(), %message, "container already gone");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(classify)?;
        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image.repo_tags,
            })
            .collect())
    }
}

fn container_config(spec: &RunSpec) -> Config<String> {
    let port_key = spec.port_key();
    let exposed_ports = HashMap::from([(port_key.clone(), HashMap::new())]);
    let port_bindings: PortMap = HashMap::from([(
        port_key,
        Some(vec![PortBinding {
            host_ip: None,
            host_port: None,
        }]),
    )]);

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        auto_remove: Some(spec.auto_remove),
        memory: spec.limits.memory_bytes,
        cpu_quota: spec.limits.cpu_quota_us,
        cpu_period: spec.limits.cpu_period_us,
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// First host port bound in a port map, in port-key order.
fn first_host_port(ports: &PortMap) -> Option<u16> {
    let mut keys: Vec<&String> = ports.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|k| ports.get(k).and_then(Option::as_ref))
        .flatten()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

/// Maps a failed runtime call onto the error taxonomy.
fn classify(err: DockerError) -> InstancerError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => InstancerError::Runtime {
            message: format!("runtime rejected the request ({status_code}): {message}"),
        },
        DockerError::RequestTimeoutError => InstancerError::Transport {
            message: "runtime request timed out".into(),
        },
        other => InstancerError::Transport {
            message: other.to_string(),
        },
    }
}

fn connect_failure(err: DockerError) -> InstancerError {
    let kind = match &err {
        DockerError::RequestTimeoutError => ConnectionFailure::Timeout,
        DockerError::DockerResponseServerError {
            status_code: 401 | 403,
            ..
        } => ConnectionFailure::Authentication,
        _ => ConnectionFailure::Transport,
    };
    InstancerError::Connection {
        kind,
        message: err.to_string(),
    }
}
