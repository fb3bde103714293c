//! Domain primitive types used across the instancer workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier the container runtime assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the conventional 12-character short form.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a container challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengeId(pub u64);

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a team. All container operations are keyed by team, not user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub u64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical ownership key of an instance: one live record per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// Challenge the instance serves.
    pub challenge: ChallengeId,
    /// Team that owns the instance.
    pub team: TeamId,
}

impl InstanceKey {
    /// Creates a key for the given pair.
    #[must_use]
    pub const fn new(challenge: ChallengeId, team: TeamId) -> Self {
        Self { challenge, team }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "challenge {} / team {}", self.challenge, self.team)
    }
}

/// Persisted record of one live container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Runtime-assigned identity; primary key.
    pub container_id: ContainerId,
    /// Challenge the container serves.
    pub challenge_id: ChallengeId,
    /// Owning team.
    pub team_id: TeamId,
    /// Host port the runtime mapped to the challenge's internal port.
    pub host_port: Option<u16>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp after which the reaper reclaims the container.
    pub expires_at: i64,
}

impl InstanceRecord {
    /// Ownership key of this record.
    #[must_use]
    pub const fn key(&self) -> InstanceKey {
        InstanceKey::new(self.challenge_id, self.team_id)
    }

    /// Returns true once `now` is past the expiry.
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

/// Runtime-level resource constraints applied to a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU time allowed per period, in microseconds.
    pub cpu_quota_us: Option<i64>,
    /// Length of the CPU accounting period, in microseconds.
    pub cpu_period_us: Option<i64>,
}

impl ResourceLimits {
    /// Returns true if no constraint is set.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_quota_us.is_none()
    }
}

/// State of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Container is actively running.
    Running,
    /// Container exists but is not running.
    Stopped,
    /// The runtime does not know the container.
    Missing,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// What the challenge subsystem knows about a container challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDescriptor {
    /// Challenge identifier.
    pub id: ChallengeId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Port the service listens on inside the container.
    pub internal_port: u16,
    /// Startup command; empty means the image default.
    #[serde(default)]
    pub command: String,
    /// Opaque JSON volume specification forwarded to the runtime.
    #[serde(default)]
    pub volumes: String,
    /// Initial scoring value.
    #[serde(default)]
    pub initial: u32,
    /// Minimum scoring value.
    #[serde(default)]
    pub minimum: u32,
    /// Number of solves until the value reaches the minimum.
    #[serde(default)]
    pub decay: u32,
}
