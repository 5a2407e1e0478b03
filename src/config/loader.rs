//! Flag file loading.
//!
//! A flag file supplies values for `serve` flags. Two layouts are accepted:
//!
//! ```text
//! # plain: one flag per line, "name value" or "name=value"
//! db ./rdvp-store
//! log.format=json
//!
//! # TOML: a flat table of flag names
//! db = "./rdvp-store"
//! relay-max-circuits = 64
//! ```
//!
//! Names may carry leading dashes. Unknown names are an error.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::validation::ValidationError;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{}: unknown flag '{key}'", path.display())]
    UnknownKey { path: PathBuf, key: String },
    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load `path` and return its `(flag, value)` pairs in file order.
///
/// `known` lists the accepted flag names.
pub fn load_flag_file(path: &Path, known: &[&str]) -> Result<Vec<(String, String)>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let pairs = parse_flag_file(path, &content)?;

    for (key, _) in &pairs {
        if !known.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey {
                path: path.to_path_buf(),
                key: key.clone(),
            });
        }
    }
    Ok(pairs)
}

fn parse_flag_file(path: &Path, content: &str) -> Result<Vec<(String, String)>, ConfigError> {
    // a TOML table wins when the whole file parses as one
    if let Ok(table) = content.parse::<toml::Table>() {
        if !table.is_empty() {
            return table
                .into_iter()
                .map(|(key, value)| {
                    let value = toml_value(&value).ok_or_else(|| ConfigError::Parse {
                        path: path.to_path_buf(),
                        line: 0,
                        reason: format!("'{key}' must be a string, number, boolean or list"),
                    })?;
                    Ok((flag_name(&key), value))
                })
                .collect();
        }
    }

    let mut pairs = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let split = line
            .find(|c: char| c == '=' || c.is_whitespace())
            .map(|at| (&line[..at], &line[at + 1..]));
        let (key, value) = match split {
            Some((key, value)) => (key, unquote(value.trim())),
            None => (line, ""),
        };
        if flag_name(key).is_empty() {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                reason: "missing flag name".to_string(),
            });
        }
        pairs.push((flag_name(key), value.to_string()));
    }
    Ok(pairs)
}

fn flag_name(key: &str) -> String {
    key.trim().trim_start_matches('-').to_string()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn toml_value(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(toml_value)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        toml::Value::Datetime(_) | toml::Value::Table(_) => None,
    }
}
