//! SSH tunnels to remote runtimes.
//!
//! The system `ssh` client forwards a private local socket to the remote
//! runtime socket. The forwarding process lives as long as the tunnel.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use instancer_common::constants::REMOTE_DOCKER_SOCKET;
use instancer_common::error::{ConnectionFailure, InstancerError, Result};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::endpoint::Endpoint;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running `ssh -L` forward. Dropping it kills the ssh process.
#[derive(Debug)]
pub struct SshTunnel {
    _child: Child,
    socket: PathBuf,
    _dir: TempDir,
}

impl SshTunnel {
    /// Starts a tunnel and waits until the local socket appears.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Connection`] classified as authentication
    /// failure, timeout, or transport failure.
    pub async fn open(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let Endpoint::Ssh { port, .. } = endpoint else {
            return Err(InstancerError::config(format!("{endpoint} is not an ssh endpoint")));
        };
        let destination = endpoint
            .ssh_destination()
            .ok_or_else(|| InstancerError::config("ssh endpoint has no destination"))?;

        let dir = tempfile::Builder::new()
            .prefix("instancer-ssh-")
            .tempdir()
            .map_err(|e| InstancerError::Io {
                path: std::env::temp_dir(),
                source: e,
            })?;
        let socket = dir.path().join("docker.sock");

        let mut child = Command::new("ssh")
            .args(forward_args(&destination, *port, &socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstancerError::Connection {
                kind: ConnectionFailure::Transport,
                message: format!("failed to launch ssh: {e}"),
            })?;
        tracing::debug!(%destination, socket = %socket.display(), "ssh tunnel starting");

        let deadline = Instant::now() + timeout;
        loop {
            if socket.exists() {
                tracing::info!(%destination, "ssh tunnel established");
                return Ok(Self {
                    _child: child,
                    socket,
                    _dir: dir,
                });
            }
            let exited = child.try_wait().map_err(|e| InstancerError::Connection {
                kind: ConnectionFailure::Transport,
                message: format!("ssh tunnel state unknown: {e}"),
            })?;
            if let Some(status) = exited {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(exit_error(status, &stderr));
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(InstancerError::Connection {
                    kind: ConnectionFailure::Timeout,
                    message: format!("ssh tunnel to {destination} not ready within {timeout:?}"),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Local end of the forward.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

fn forward_args(destination: &str, port: Option<u16>, socket: &Path) -> Vec<String> {
    let mut args = vec![
        "-nNT".to_string(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "ExitOnForwardFailure=yes".into(),
        "-L".into(),
        format!("{}:{REMOTE_DOCKER_SOCKET}", socket.display()),
    ];
    if let Some(port) = port {
        args.push("-p".into());
        args.push(port.to_string());
    }
    args.push(destination.to_string());
    args
}

fn exit_error(status: ExitStatus, stderr: &str) -> InstancerError {
    let stderr = stderr.trim();
    InstancerError::Connection {
        kind: classify_stderr(stderr),
        message: if stderr.is_empty() {
            format!("ssh exited with {status}")
        } else {
            format!("ssh exited with {status}: {stderr}")
        },
    }
}

fn classify_stderr(stderr: &str) -> ConnectionFailure {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("host key verification failed")
    {
        ConnectionFailure::Authentication
    } else if lower.contains("timed out") {
        ConnectionFailure::Timeout
    } else {
        ConnectionFailure::Transport
    }
}
