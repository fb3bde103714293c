//! Output helpers for CLI commands.
//!
//! Operation results print as pretty JSON on stdout. Failures print an
//! `{"error", "status"}` object and turn into a failing exit code.

#![allow(clippy::print_stdout)]

use std::process::ExitCode;

use instancer_common::error::InstancerError;
use instancer_common::types::InstanceRecord;
use instancer_runtime::service::ErrorReply;
use serde::Serialize;
use serde_json::Value;

/// Prints a successful result, or the structured error.
///
/// # Errors
///
/// Returns an error only if the value cannot be serialized.
pub fn emit<T: Serialize>(result: Result<T, InstancerError>) -> anyhow::Result<ExitCode> {
    match result {
        Ok(value) => {
            print_json(&with_expiry(serde_json::to_value(value)?))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::debug!(error = ?e, "operation failed");
            print_json(&ErrorReply::from(&e))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Prints any serializable value as pretty JSON.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints instance records as a table.
pub fn print_instances(records: &[InstanceRecord]) {
    if records.is_empty() {
        println!("No instances found.");
        return;
    }
    println!(
        "{:<10} {:<8} {:<14} {:<7} {:<26}",
        "CHALLENGE", "TEAM", "CONTAINER", "PORT", "EXPIRES"
    );
    for r in records {
        println!(
            "{:<10} {:<8} {:<14} {:<7} {:<26}",
            r.challenge_id,
            r.team_id,
            r.container_id.short(),
            r.host_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            format_timestamp(r.expires_at),
        );
    }
}

/// Renders a Unix timestamp as RFC 3339.
#[must_use]
pub fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map_or_else(|| secs.to_string(), |t| t.to_rfc3339())
}

/// Adds an `expires_at` rendering next to a numeric `expires` field.
fn with_expiry(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        if let Some(secs) = map.get("expires").and_then(Value::as_i64) {
            let _ = map.insert("expires_at".into(), Value::String(format_timestamp(secs)));
        }
    }
    value
}
