//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for instancer data when running as a system service.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/instancer";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "INSTANCER_DATA_DIR";

/// File holding the instance registry.
pub const REGISTRY_FILE: &str = "instances.json";

/// File holding the runtime settings key/value pairs.
pub const SETTINGS_FILE: &str = "settings.json";

/// File holding the challenge catalog.
pub const CATALOG_FILE: &str = "challenges.json";

/// Seconds between two expiration sweeps.
pub const EXPIRATION_CHECK_INTERVAL_SECS: u64 = 5;

/// Fixed CPU accounting period handed to the runtime, in microseconds.
pub const CPU_PERIOD_US: i64 = 100_000;

/// Smallest CPU quota the runtime accepts, in microseconds.
pub const MIN_CPU_QUOTA_US: i64 = 1_000;

/// Seconds allowed for establishing a runtime connection.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Seconds allowed for a single runtime API call.
pub const API_TIMEOUT_SECS: u64 = 120;

/// Docker socket path on the far side of an SSH tunnel.
pub const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Returns the data directory, preferring `$HOME/.instancer` and falling
/// back to `/var/lib/instancer`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".instancer");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}
