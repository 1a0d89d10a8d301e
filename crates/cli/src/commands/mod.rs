//! Command handlers for the `dagrun` binary

pub mod graph;
pub mod pipeline;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Print a record as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", text);
    Ok(())
}

/// Parse a `key=value` pair. The value is read as JSON when it parses,
/// otherwise it is kept as a string.
pub fn parse_param(s: &str) -> Result<(String, Value)> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
