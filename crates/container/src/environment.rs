use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ContainerConfig, Profile};

/// Runtime environment visible to conditions and factories
#[derive(Debug, Clone, Default)]
pub struct Environment {
    profile: Profile,
    properties: BTreeMap<String, String>,
    modules: BTreeSet<String>,
}

impl Environment {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            properties: BTreeMap::new(),
            modules: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            profile: config.environment.clone(),
            properties: config.properties.clone(),
            modules: config.modules.clone(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.insert(module.into());
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn property_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.property(key).unwrap_or(default)
    }

    /// Parse a property, `None` when absent
    pub fn parsed_property<T: std::str::FromStr>(&self, key: &str) -> Option<Result<T, T::Err>> {
        self.property(key).map(str::parse)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Whether an optional integration is available
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains(module)
    }
}
