//! Container configuration
//!
//! Sources, lowest priority first:
//! - preset defaults (`production`, `development`, `test`, `minimal`)
//! - a configuration file (TOML, JSON, YAML)
//! - `CONTAINER_*` environment variables

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Deployment profile of a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Production,
    #[default]
    Development,
    Test,
    Minimal,
    Custom(String),
}

impl Profile {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" => Profile::Production,
            "development" => Profile::Development,
            "test" => Profile::Test,
            "minimal" => Profile::Minimal,
            custom => Profile::Custom(custom.to_string()),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Profile::Production => write!(f, "production"),
            Profile::Development => write!(f, "development"),
            Profile::Test => write!(f, "test"),
            Profile::Minimal => write!(f, "minimal"),
            Profile::Custom(name) => write!(f, "custom({})", name),
        }
    }
}

/// Configuration of an application context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Context name used in logs and events
    pub name: String,
    pub environment: Profile,
    /// Re-registering a name replaces the definition instead of failing
    pub allow_definition_overriding: bool,
    /// Default for singletons without an explicit lazy flag
    pub lazy_init: bool,
    /// Worker threads delivering asynchronous events
    pub async_workers: usize,
    /// Upper bound on waiting for in-flight asynchronous listeners at close
    pub shutdown_drain_timeout_ms: u64,
    /// Install validation interceptors on components declaring constraints
    pub validation_enabled: bool,
    /// Optional integrations available to `OnClass` conditions
    pub modules: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl ContainerConfig {
    pub fn production() -> Self {
        Self {
            name: "application".to_string(),
            environment: Profile::Production,
            allow_definition_overriding: false,
            lazy_init: false,
            async_workers: 4,
            shutdown_drain_timeout_ms: 10_000,
            validation_enabled: true,
            modules: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn development() -> Self {
        Self {
            name: "application".to_string(),
            environment: Profile::Development,
            allow_definition_overriding: true,
            lazy_init: false,
            async_workers: 2,
            shutdown_drain_timeout_ms: 5_000,
            validation_enabled: true,
            modules: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn test() -> Self {
        Self {
            name: "test".to_string(),
            environment: Profile::Test,
            allow_definition_overriding: true,
            lazy_init: false,
            async_workers: 1,
            shutdown_drain_timeout_ms: 2_000,
            validation_enabled: true,
            modules: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Smallest footprint: lazy singletons, one worker, no validation
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            environment: Profile::Minimal,
            allow_definition_overriding: true,
            lazy_init: true,
            async_workers: 1,
            shutdown_drain_timeout_ms: 1_000,
            validation_enabled: false,
            modules: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn from_preset_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::production()),
            "development" | "dev" => Ok(Self::development()),
            "test" => Ok(Self::test()),
            "minimal" => Ok(Self::minimal()),
            other => Err(anyhow!("Unknown configuration preset: {}", other)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.insert(module.into());
        self
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("context name must not be empty"));
        }
        if self.async_workers == 0 {
            return Err(anyhow!("async_workers must be at least 1"));
        }
        if self.async_workers > 256 {
            return Err(anyhow!(
                "async_workers = {} exceeds the limit of 256",
                self.async_workers
            ));
        }
        if self.shutdown_drain_timeout_ms == 0 {
            warn!(
                "shutdown_drain_timeout_ms = 0: asynchronous listeners will not be awaited at close"
            );
        }
        Ok(())
    }
}

/// Loads [`ContainerConfig`] from files and environment variables
pub struct ConfigurationLoader {
    env_prefix: String,
    validate_on_load: bool,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: "CONTAINER".to_string(),
            validate_on_load: true,
        }
    }

    /// Set environment variable prefix (default: "CONTAINER")
    pub fn env_prefix<S: Into<String>>(&mut self, prefix: S) -> &mut Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn validate(&mut self, enabled: bool) -> &mut Self {
        self.validate_on_load = enabled;
        self
    }

    /// Preset, then optional file, then environment overrides
    pub fn load(&self, preset: Option<&str>, file: Option<&Path>) -> Result<ContainerConfig> {
        let mut config = match preset {
            Some(name) => ContainerConfig::from_preset_name(name)?,
            None => ContainerConfig::default(),
        };

        if let Some(path) = file {
            config = self.load_from_file(path)?;
        }

        self.apply_environment_variables(&mut config)?;

        if self.validate_on_load {
            config.validate()?;
        }
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<ContainerConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => self.load_from_toml(&content)?,
            Some("json") => self.load_from_json(&content)?,
            Some("yaml") | Some("yml") => self.load_from_yaml(&content)?,
            _ => {
                return Err(anyhow!(
                    "Unsupported configuration file format: {:?}",
                    path.extension()
                ))
            }
        };
        debug!("Loaded container configuration from {}", path.display());
        Ok(config)
    }

    pub fn load_from_toml(&self, content: &str) -> Result<ContainerConfig> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_json(&self, content: &str) -> Result<ContainerConfig> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load_from_yaml(&self, content: &str) -> Result<ContainerConfig> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, config: &ContainerConfig, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(config)?,
            Some("json") => serde_json::to_string_pretty(config)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(config)?,
            _ => return Err(anyhow!("Unsupported file format: {:?}", path.extension())),
        };
        fs::write(path, content)?;
        Ok(())
    }

    fn apply_environment_variables(&self, config: &mut ContainerConfig) -> Result<()> {
        let prefix = format!("{}_", self.env_prefix);
        for (key, value) in env::vars() {
            if let Some(config_key) = key.strip_prefix(&prefix) {
                self.apply_env_var(config, config_key, &value)?;
            }
        }
        Ok(())
    }

    fn apply_env_var(&self, config: &mut ContainerConfig, key: &str, value: &str) -> Result<()> {
        match key.to_uppercase().as_str() {
            "NAME" => config.name = value.to_string(),
            "ENVIRONMENT" => config.environment = Profile::parse(value),
            "ALLOW_DEFINITION_OVERRIDING" => {
                config.allow_definition_overriding = parse_bool(key, value)?
            }
            "LAZY_INIT" => config.lazy_init = parse_bool(key, value)?,
            "ASYNC_WORKERS" => config.async_workers = value.parse()?,
            "SHUTDOWN_DRAIN_TIMEOUT_MS" => config.shutdown_drain_timeout_ms = value.parse()?,
            "VALIDATION_ENABLED" => config.validation_enabled = parse_bool(key, value)?,
            "MODULES" => {
                config.modules = value
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            other => match other.strip_prefix("PROPERTY_") {
                Some(property) => {
                    let property = property.to_lowercase().replace('_', ".");
                    config.properties.insert(property, value.to_string());
                }
                None => debug!(
                    "Ignoring unknown configuration variable {}_{}",
                    self.env_prefix, key
                ),
            },
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} expects a boolean, got '{}'", key, value)),
    }
}
