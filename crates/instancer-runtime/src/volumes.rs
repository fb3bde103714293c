//! Volume specification translation.
//!
//! Challenges carry an opaque JSON volume specification. Two shapes are
//! accepted and forwarded to the runtime as bind strings:
//!
//! - an object mapping host paths to `{"bind": "/path", "mode": "ro"}`
//!   (or directly to the container path),
//! - an array of ready-made `host:container[:mode]` strings.

use instancer_common::error::{InstancerError, Result};
use serde_json::Value;

/// Translates a volume specification into runtime bind strings.
///
/// An empty specification yields no binds.
///
/// # Errors
///
/// Returns [`InstancerError::Config`] if the specification is not valid
/// JSON or has an unsupported shape.
pub fn parse_volume_spec(spec: &str) -> Result<Vec<String>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(spec)
        .map_err(|e| InstancerError::config(format!("volume specification is not valid JSON: {e}")))?;

    match value {
        Value::Object(map) => map
            .iter()
            .map(|(host, target)| bind_from_entry(host, target))
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(bind) if !bind.is_empty() => Ok(bind),
                other => Err(InstancerError::config(format!(
                    "volume list entries must be bind strings, got {other}"
                ))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(InstancerError::config(format!(
            "volume specification must be a JSON object or array, got {other}"
        ))),
    }
}

fn bind_from_entry(host: &str, target: &Value) -> Result<String> {
    if host.is_empty() {
        return Err(InstancerError::config("volume host path is empty"));
    }
    match target {
        Value::String(bind) => Ok(format!("{host}:{bind}")),
        Value::Object(opts) => {
            let bind = opts
                .get("bind")
                .and_then(Value::as_str)
                .filter(|b| !b.is_empty())
                .ok_or_else(|| {
                    InstancerError::config(format!("volume {host:?} is missing a bind path"))
                })?;
            match opts.get("mode").and_then(Value::as_str) {
                Some(mode) if !mode.is_empty() => Ok(format!("{host}:{bind}:{mode}")),
                _ => Ok(format!("{host}:{bind}")),
            }
        }
        other => Err(InstancerError::config(format!(
            "volume {host:?} has an unsupported target {other}"
        ))),
    }
}
