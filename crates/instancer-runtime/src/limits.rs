//! Resource limit translation.
//!
//! Turns the abstract memory and CPU caps from the settings store into the
//! constraint parameters the runtime understands: a byte count for memory
//! and a quota/period pair for CPU bandwidth.

use instancer_common::config::{KEY_MAX_CPU_CORES, KEY_MAX_MEMORY_MB};
use instancer_common::constants::{CPU_PERIOD_US, MIN_CPU_QUOTA_US};
use instancer_common::error::{InstancerError, Result};
use instancer_common::types::ResourceLimits;

const BYTES_PER_MB: i64 = 1024 * 1024;

/// Parses raw settings values and translates them into runtime limits.
///
/// Blank values count as absent.
///
/// # Errors
///
/// Returns [`InstancerError::Config`] if a value is not a number, is
/// negative, or is out of range for the runtime.
pub fn parse_limits(max_memory_mb: Option<&str>, max_cpu_cores: Option<&str>) -> Result<ResourceLimits> {
    let memory = match max_memory_mb.map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            InstancerError::config(format!("{KEY_MAX_MEMORY_MB} must be an integer, got {raw:?}"))
        })?),
    };
    let cpu = match max_cpu_cores.map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
            InstancerError::config(format!("{KEY_MAX_CPU_CORES} must be a number, got {raw:?}"))
        })?),
    };
    translate(memory, cpu)
}

/// Translates typed caps into runtime limits.
///
/// Zero or absent values impose no limit.
///
/// # Errors
///
/// Returns [`InstancerError::Config`] for negative or non-finite values,
/// and for CPU caps below what the runtime can enforce.
pub fn translate(max_memory_mb: Option<i64>, max_cpu_cores: Option<f64>) -> Result<ResourceLimits> {
    let mut limits = ResourceLimits::default();

    if let Some(mb) = max_memory_mb {
        limits.memory_bytes = memory_bytes(mb)?;
    }
    if let Some(cores) = max_cpu_cores {
        if let Some((quota, period)) = cpu_bandwidth(cores)? {
            limits.cpu_quota_us = Some(quota);
            limits.cpu_period_us = Some(period);
        }
    }

    tracing::debug!(?limits, "resource limits translated");
    Ok(limits)
}

fn memory_bytes(mb: i64) -> Result<Option<i64>> {
    if mb < 0 {
        return Err(InstancerError::config(format!(
            "{KEY_MAX_MEMORY_MB} must not be negative, got {mb}"
        )));
    }
    if mb == 0 {
        return Ok(None);
    }
    mb.checked_mul(BYTES_PER_MB)
        .map(Some)
        .ok_or_else(|| InstancerError::config(format!("{KEY_MAX_MEMORY_MB} is too large: {mb}")))
}

/// Computes `quota = cores * period` over the fixed period.
#[allow(clippy::cast_possible_truncation)]
fn cpu_bandwidth(cores: f64) -> Result<Option<(i64, i64)>> {
    if !cores.is_finite() || cores < 0.0 {
        return Err(InstancerError::config(format!(
            "{KEY_MAX_CPU_CORES} must be a non-negative number, got {cores}"
        )));
    }
    if cores == 0.0 {
        return Ok(None);
    }
    let quota = (cores * CPU_PERIOD_US as f64) as i64;
    if quota < MIN_CPU_QUOTA_US {
        return Err(InstancerError::config(format!(
            "{KEY_MAX_CPU_CORES} of {cores} is below the runtime minimum of 0.01 cores"
        )));
    }
    Ok(Some((quota, CPU_PERIOD_US)))
}
