//! Runtime endpoint descriptors.

use std::fmt;
use std::path::PathBuf;

use instancer_common::error::{InstancerError, Result};

/// Where the container runtime's control API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Local socket, e.g. `/var/run/docker.sock`.
    Unix(PathBuf),
    /// Plain TCP, kept as `host:port`.
    Tcp(String),
    /// Remote runtime reached through an SSH-forwarded socket.
    Ssh {
        /// Login user, if given.
        user: Option<String>,
        /// Remote host.
        host: String,
        /// SSH port, if not the default.
        port: Option<u16>,
    },
}

impl Endpoint {
    /// Parses an endpoint descriptor.
    ///
    /// Returns `Ok(None)` for an empty descriptor: no endpoint means the
    /// backend is disabled, which is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Config`] for unknown schemes or malformed
    /// addresses.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(InstancerError::config("unix endpoint has no socket path"));
            }
            return Ok(Some(Self::Unix(PathBuf::from(path))));
        }
        if raw.starts_with('/') {
            return Ok(Some(Self::Unix(PathBuf::from(raw))));
        }
        if let Some(addr) = raw
            .strip_prefix("tcp://")
            .or_else(|| raw.strip_prefix("http://"))
        {
            let addr = addr.trim_end_matches('/');
            validate_host_port(addr)?;
            return Ok(Some(Self::Tcp(addr.to_string())));
        }
        if let Some(target) = raw.strip_prefix("ssh://") {
            return parse_ssh(target.trim_end_matches('/')).map(Some);
        }
        Err(InstancerError::config(format!(
            "unsupported runtime endpoint {raw:?}: expected unix://, tcp://, http:// or ssh://"
        )))
    }

    /// SSH destination in `user@host` form.
    #[must_use]
    pub fn ssh_destination(&self) -> Option<String> {
        match self {
            Self::Ssh { user: Some(user), host, .. } => Some(format!("{user}@{host}")),
            Self::Ssh { user: None, host, .. } => Some(host.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ssh { user, host, port } => {
                write!(f, "ssh://")?;
                if let Some(user) = user {
                    write!(f, "{user}@")?;
                }
                write!(f, "{host}")?;
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                Ok(())
            }
        }
    }
}

fn validate_host_port(addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(InstancerError::config(format!(
            "tcp endpoint {addr:?} must be host:port"
        )));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(InstancerError::config(format!(
            "tcp endpoint {addr:?} must be host:port"
        )));
    }
    Ok(())
}

fn parse_ssh(target: &str) -> Result<Endpoint> {
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return Err(InstancerError::config("ssh endpoint has an empty user")),
        None => (None, target),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| InstancerError::config(format!("invalid ssh port {port:?}")))?;
            (host, Some(port))
        }
        None => (rest, None),
    };
    if host.is_empty() {
        return Err(InstancerError::config("ssh endpoint has no host"));
    }
    Ok(Endpoint::Ssh {
        user,
        host: host.to_string(),
        port,
    })
}
