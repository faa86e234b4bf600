//! Layered `fleetctl` configuration.
//!
//! The embedded `config/default.toml` is the base layer. A user file only
//! carries the keys it overrides, and only those keys are written back on save.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fleet_core::config::ControllerConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Everything `fleetctl` reads from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// `[log]` section.
    #[serde(default)]
    pub log: LogConfig,
    /// `[controller]` section, passed to the controller as is.
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl CliConfig {
    /// Parses the embedded defaults.
    pub fn defaults() -> Result<Self> {
        resolve(&toml::Table::new())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `fleet_core=debug`.
    pub level: String,
    /// Colored output. Turn off when logs go to a file.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

/// Loads, edits and saves the layered configuration.
pub struct ConfigManager {
    path: Option<PathBuf>,
    overrides: toml::Table,
    config: CliConfig,
}

impl ConfigManager {
    /// Built-in defaults only.
    pub fn load_defaults() -> Result<Self> {
        Ok(Self {
            path: None,
            overrides: toml::Table::new(),
            config: CliConfig::defaults()?,
        })
    }

    /// Defaults overlaid with the file at `path`. A missing file is treated as empty.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let overrides = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?
        } else {
            toml::Table::new()
        };
        let config =
            resolve(&overrides).with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(Self {
            path: Some(path),
            overrides,
            config,
        })
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &CliConfig {
        &self.config
    }

    /// Consumes the manager, keeping the resolved configuration.
    pub fn into_config(self) -> CliConfig {
        self.config
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the user overrides back to the backing file.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| anyhow!("no configuration file to save to; pass --config"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let toml = toml::to_string_pretty(&self.overrides)?;
        fs::write(path, toml)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Effective value of a dotted key such as `controller.probe.interval`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let root = toml::Value::try_from(&self.config).ok()?;
        let mut current = &root;
        for segment in key.split('.') {
            current = current.as_table()?.get(segment)?;
        }
        Some(match current {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// Overrides a single dotted key. The change is rejected when the
    /// resulting configuration does not parse or validate.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(anyhow!("invalid configuration key: '{key}'"));
        }
        if self.get(key).is_none() {
            return Err(anyhow!("unknown configuration key: {key}"));
        }

        let mut overrides = self.overrides.clone();
        insert_dotted(&mut overrides, &segments, parse_value(value))?;
        let config = resolve(&overrides)
            .with_context(|| format!("rejected value '{value}' for {key}"))?;
        self.overrides = overrides;
        self.config = config;
        Ok(())
    }
}

/// Applies `overrides` on top of the embedded defaults and validates the result.
fn resolve(overrides: &toml::Table) -> Result<CliConfig> {
    let mut merged: toml::Table =
        toml::from_str(DEFAULT_CONFIG).context("embedded default configuration is invalid")?;
    overlay(&mut merged, overrides.clone());
    let config: CliConfig = toml::Value::Table(merged).try_into()?;
    config.controller.validate()?;
    Ok(config)
}

/// Recursive table merge. Tables merge key by key; anything else, arrays
/// included, replaces the base value.
fn overlay(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                overlay(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

fn insert_dotted(table: &mut toml::Table, segments: &[&str], value: toml::Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(anyhow!("empty configuration key"));
    };
    let mut current = table;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert(toml::Value::Table(toml::Table::new()));
        current = entry
            .as_table_mut()
            .ok_or_else(|| anyhow!("'{segment}' is not a table"))?;
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

/// Interprets a command-line value as a TOML literal, falling back to a string.
fn parse_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn embedded_defaults_match_code_defaults() {
        let parsed = CliConfig::defaults().unwrap();
        let coded = CliConfig::default();
        assert_eq!(parsed.to_toml().unwrap(), coded.to_toml().unwrap());
    }

    #[test]
    fn nested_tables_merge_and_arrays_replace() {
        let mut base: toml::Table = toml::from_str("a = 1\n[t]\nx = 1\ny = [1, 2]\n").unwrap();
        let overrides: toml::Table = toml::from_str("[t]\ny = [3]\n").unwrap();
        overlay(&mut base, overrides);
        assert_eq!(base["a"].as_integer(), Some(1));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn values_parse_as_toml_literals() {
        assert_eq!(parse_value("3").as_integer(), Some(3));
        assert_eq!(parse_value("true").as_bool(), Some(true));
        assert_eq!(parse_value("250ms").as_str(), Some("250ms"));
        assert_eq!(parse_value("\"quoted\"").as_str(), Some("quoted"));
    }
}
