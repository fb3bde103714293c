//! Configuration models: on-disk locations and runtime settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InstancerError, Result};

/// Settings key: runtime control endpoint.
pub const KEY_CONNECTION_ENDPOINT: &str = "connection_endpoint";
/// Settings key: hostname players use to reach their instance.
pub const KEY_PUBLIC_HOSTNAME: &str = "public_hostname";
/// Settings key: instance lifetime in minutes (0 disables the reaper).
pub const KEY_EXPIRATION_MINUTES: &str = "expiration_minutes";
/// Settings key: memory cap per container, in megabytes.
pub const KEY_MAX_MEMORY_MB: &str = "max_memory_mb";
/// Settings key: CPU cap per container, in cores.
pub const KEY_MAX_CPU_CORES: &str = "max_cpu_cores";

/// Every key the settings form must submit.
pub const SETTINGS_KEYS: [&str; 5] = [
    KEY_CONNECTION_ENDPOINT,
    KEY_PUBLIC_HOSTNAME,
    KEY_EXPIRATION_MINUTES,
    KEY_MAX_MEMORY_MB,
    KEY_MAX_CPU_CORES,
];

/// Where the instancer keeps its state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancerConfig {
    /// Base directory for instancer state.
    pub data_dir: PathBuf,
    /// Instance registry file.
    pub registry_file: PathBuf,
    /// Settings key/value file.
    pub settings_file: PathBuf,
    /// Challenge catalog file.
    pub catalog_file: PathBuf,
}

impl InstancerConfig {
    /// Lays out all state files under `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            registry_file: data_dir.join(crate::constants::REGISTRY_FILE),
            settings_file: data_dir.join(crate::constants::SETTINGS_FILE),
            catalog_file: data_dir.join(crate::constants::CATALOG_FILE),
            data_dir,
        }
    }
}

impl Default for InstancerConfig {
    fn default() -> Self {
        Self::with_data_dir(crate::constants::data_dir())
    }
}

/// Longest instance lifetime a settings form may request: ten years.
pub const MAX_EXPIRATION_MINUTES: u64 = 10 * 365 * 24 * 60;

/// Typed view over the persisted settings key/value pairs.
///
/// Resource limits stay in their raw textual form: they are validated
/// by the limit translator at the point of use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Runtime control endpoint; empty disables the backend.
    pub connection_endpoint: String,
    /// Hostname reported to players.
    pub public_hostname: String,
    /// Instance lifetime in minutes.
    pub expiration_minutes: u64,
    /// Raw memory cap in megabytes.
    pub max_memory_mb: Option<String>,
    /// Raw CPU cap in cores.
    pub max_cpu_cores: Option<String>,
}

impl RuntimeSettings {
    /// Loads settings from stored pairs, tolerating missing or malformed
    /// values the way a freshly installed deployment needs.
    #[must_use]
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Self {
        let expiration_minutes = match pairs.get(KEY_EXPIRATION_MINUTES) {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "invalid expiration minutes, reaper disabled");
                0
            }),
        };
        Self {
            connection_endpoint: pairs
                .get(KEY_CONNECTION_ENDPOINT)
                .cloned()
                .unwrap_or_default(),
            public_hostname: pairs.get(KEY_PUBLIC_HOSTNAME).cloned().unwrap_or_default(),
            expiration_minutes,
            max_memory_mb: non_empty(pairs.get(KEY_MAX_MEMORY_MB)),
            max_cpu_cores: non_empty(pairs.get(KEY_MAX_CPU_CORES)),
        }
    }

    /// Validates a submitted settings form.
    ///
    /// All five keys must be present and the expiration must be an
    /// integer between 0 and [`MAX_EXPIRATION_MINUTES`]. Limit values are checked separately by the
    /// limit translator.
    ///
    /// # Errors
    ///
    /// Returns [`InstancerError::Config`] naming the first offending key.
    pub fn from_form(form: &BTreeMap<String, String>) -> Result<Self> {
        for key in SETTINGS_KEYS {
            if !form.contains_key(key) {
                return Err(InstancerError::config(format!("missing setting: {key}")));
            }
        }
        let raw = &form[KEY_EXPIRATION_MINUTES];
        let expiration_minutes = raw.trim().parse::<u64>().map_err(|_| {
            InstancerError::config(format!(
                "{KEY_EXPIRATION_MINUTES} must be a non-negative integer, got {raw:?}"
            ))
        })?;
        if expiration_minutes > MAX_EXPIRATION_MINUTES {
            return Err(InstancerError::config(format!(
                "{KEY_EXPIRATION_MINUTES} must be at most {MAX_EXPIRATION_MINUTES}, got {expiration_minutes}"
            )));
        }
        let mut settings = Self::from_pairs(form);
        settings.expiration_minutes = expiration_minutes;
        Ok(settings)
    }

    /// Serializes the settings back into key/value pairs.
    #[must_use]
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                KEY_CONNECTION_ENDPOINT.to_string(),
                self.connection_endpoint.clone(),
            ),
            (KEY_PUBLIC_HOSTNAME.to_string(), self.public_hostname.clone()),
            (
                KEY_EXPIRATION_MINUTES.to_string(),
                self.expiration_minutes.to_string(),
            ),
            (
                KEY_MAX_MEMORY_MB.to_string(),
                self.max_memory_mb.clone().unwrap_or_default(),
            ),
            (
                KEY_MAX_CPU_CORES.to_string(),
                self.max_cpu_cores.clone().unwrap_or_default(),
            ),
        ])
    }

    /// Instance lifetime in seconds, clamped to `i64::MAX`.
    #[must_use]
    pub fn expiration_seconds(&self) -> i64 {
        i64::try_from(self.expiration_minutes.saturating_mul(60)).unwrap_or(i64::MAX)
    }

    /// Returns true if expired instances should be reclaimed.
    #[must_use]
    pub const fn reaper_enabled(&self) -> bool {
        self.expiration_minutes > 0
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> BTreeMap<String, String> {
        BTreeMap::from([
            (KEY_CONNECTION_ENDPOINT.into(), "unix:///var/run/docker.sock".into()),
            (KEY_PUBLIC_HOSTNAME.into(), "ctf.example.org".into()),
            (KEY_EXPIRATION_MINUTES.into(), "45".into()),
            (KEY_MAX_MEMORY_MB.into(), "512".into()),
            (KEY_MAX_CPU_CORES.into(), "0.5".into()),
        ])
    }

    #[test]
    fn from_form_accepts_complete_form() {
        let s = RuntimeSettings::from_form(&form()).unwrap();
        assert_eq!(s.expiration_minutes, 45);
        assert_eq!(s.expiration_seconds(), 2700);
        assert_eq!(s.max_memory_mb.as_deref(), Some("512"));
        assert_eq!(s.max_cpu_cores.as_deref(), Some("0.5"));
    }

    #[test]
    fn from_form_rejects_missing_key() {
        let mut f = form();
        let _ = f.remove(KEY_MAX_CPU_CORES);
        let err = RuntimeSettings::from_form(&f).unwrap_err();
        assert!(err.to_string().contains(KEY_MAX_CPU_CORES));
    }

    #[test]
    fn from_form_rejects_negative_expiration() {
        let mut f = form();
        let _ = f.insert(KEY_EXPIRATION_MINUTES.into(), "-1".into());
        assert!(RuntimeSettings::from_form(&f).is_err());
    }

    #[test]
    fn from_form_rejects_out_of_range_expiration() {
        let mut f = form();
        let _ = f.insert(KEY_EXPIRATION_MINUTES.into(), u64::MAX.to_string());
        let err = RuntimeSettings::from_form(&f).unwrap_err();
        assert!(err.to_string().contains("at most"));

        let _ = f.insert(
            KEY_EXPIRATION_MINUTES.into(),
            MAX_EXPIRATION_MINUTES.to_string(),
        );
        assert!(RuntimeSettings::from_form(&f).is_ok());
    }

    #[test]
    fn expiration_seconds_never_goes_negative() {
        let s = RuntimeSettings {
            expiration_minutes: u64::MAX,
            ..RuntimeSettings::default()
        };
        assert_eq!(s.expiration_seconds(), i64::MAX);
    }

    #[test]
    fn from_pairs_treats_malformed_expiration_as_disabled() {
        let mut f = form();
        let _ = f.insert(KEY_EXPIRATION_MINUTES.into(), "soon".into());
        let s = RuntimeSettings::from_pairs(&f);
        assert_eq!(s.expiration_minutes, 0);
        assert!(!s.reaper_enabled());
    }

    #[test]
    fn from_pairs_drops_blank_limits() {
        let mut f = form();
        let _ = f.insert(KEY_MAX_MEMORY_MB.into(), "  ".into());
        assert_eq!(RuntimeSettings::from_pairs(&f).max_memory_mb, None);
    }

    #[test]
    fn pairs_survive_a_roundtrip() {
        let s = RuntimeSettings::from_form(&form()).unwrap();
        assert_eq!(RuntimeSettings::from_pairs(&s.to_pairs()), s);
    }

    #[test]
    fn config_places_files_under_data_dir() {
        let cfg = InstancerConfig::with_data_dir("/tmp/inst");
        assert_eq!(cfg.registry_file, PathBuf::from("/tmp/inst/instances.json"));
        assert_eq!(cfg.settings_file, PathBuf::from("/tmp/inst/settings.json"));
    }
}
