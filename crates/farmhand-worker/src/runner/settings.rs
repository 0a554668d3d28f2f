//! Typed access to command settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use farmhand_core::Settings;

use super::ValidationError;

fn invalid(command: &str, key: &str, expected: &'static str) -> ValidationError {
    ValidationError::InvalidSetting {
        command: command.to_string(),
        key: key.to_string(),
        expected,
    }
}

pub fn required_str<'a>(
    settings: &'a Settings,
    command: &str,
    key: &str,
) -> Result<&'a str, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Err(ValidationError::MissingSetting {
            command: command.to_string(),
            key: key.to_string(),
        }),
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(invalid(command, key, "a non-empty string")),
    }
}

pub fn optional_str<'a>(
    settings: &'a Settings,
    command: &str,
    key: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(command, key, "a string")),
    }
}

/// A non-negative number of seconds that fits a [`Duration`]. Integers and
/// floats are accepted.
pub fn optional_secs(
    settings: &Settings,
    command: &str,
    key: &str,
) -> Result<Option<Duration>, ValidationError> {
    const EXPECTED: &str = "a non-negative number of seconds";
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map(Some)
            .ok_or_else(|| invalid(command, key, EXPECTED)),
        Some(_) => Err(invalid(command, key, EXPECTED)),
    }
}

pub fn optional_str_list(
    settings: &Settings,
    command: &str,
    key: &str,
) -> Result<Vec<String>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(invalid(command, key, "a list of strings")),
            })
            .collect(),
        Some(_) => Err(invalid(command, key, "a list of strings")),
    }
}

pub fn optional_str_map(
    settings: &Settings,
    command: &str,
    key: &str,
) -> Result<BTreeMap<String, String>, ValidationError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                _ => Err(invalid(command, key, "a map of strings")),
            })
            .collect(),
        Some(_) => Err(invalid(command, key, "a map of strings")),
    }
}
