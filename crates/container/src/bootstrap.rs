//! Bootstrap contexts.
//!
//! A [`BootstrapImporter`] builds and refreshes a short-lived secondary
//! context, then moves every component marked
//! [`markers::BOOTSTRAP_CONFIGURATION`], together with the products declared
//! on it (recursively), into the target context before the target loads its
//! own definitions. The secondary keeps a sentinel under each moved name, so
//! closing it never destroys what the target now owns.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::{ApplicationContext, ApplicationContextBuilder};
use crate::definition::markers;
use crate::errors::{ContainerError, ContainerResult};
use crate::hooks::{ContextAware, PostProcessor};
use crate::types::Component;

/// Primary source of secondary contexts built by [`BootstrapImporter`]
pub const BOOTSTRAP_PRIMARY_SOURCE: &str = "bootstrap";

/// Seeds a target context before its refresh
pub trait Bootstrap: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the names registered in `target`
    fn import(&self, target: &ApplicationContext) -> ContainerResult<Vec<String>>;
}

type Configure = Arc<dyn Fn(ApplicationContextBuilder) -> ApplicationContextBuilder + Send + Sync>;

pub struct BootstrapImporter {
    name: String,
    primary_source: String,
    configure: Configure,
}

impl BootstrapImporter {
    /// `configure` receives a builder preset with the target's configuration
    /// and adds the secondary context's definitions
    pub fn new<F>(name: impl Into<String>, configure: F) -> Self
    where
        F: Fn(ApplicationContextBuilder) -> ApplicationContextBuilder + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            primary_source: BOOTSTRAP_PRIMARY_SOURCE.to_string(),
            configure: Arc::new(configure),
        }
    }

    pub fn primary_source(mut self, source: impl Into<String>) -> Self {
        self.primary_source = source.into();
        self
    }

    fn secondary(&self, target: &ApplicationContext) -> ContainerResult<ApplicationContext> {
        let config = target
            .config()
            .clone()
            .with_name(format!("{}-{}", target.name(), self.name));
        let builder = ApplicationContext::builder()
            .config(config)
            .primary_source(self.primary_source.clone());
        (self.configure)(builder).build()
    }

    /// Bootstrap-configuration names followed by everything they declare
    fn selection(secondary: &ApplicationContext) -> Vec<String> {
        let snapshot = secondary.registry_snapshot();
        let definitions = snapshot.definitions();
        let mut queue = snapshot
            .find_by_marker(markers::BOOTSTRAP_CONFIGURATION)
            .into_iter()
            .collect::<VecDeque<_>>();
        let mut seen = HashSet::new();
        let mut selected = Vec::new();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            queue.extend(
                definitions
                    .iter()
                    .filter(|def| def.declaring() == Some(name.as_str()))
                    .map(|def| def.name().to_string()),
            );
            selected.push(name);
        }
        selected
    }

    fn migrate(
        &self,
        name: &str,
        secondary: &ApplicationContext,
        target: &ApplicationContext,
    ) -> ContainerResult<()> {
        let definition = secondary.definition(name)?;
        target.register_definition((*definition).clone())?;
        if !definition.scope().is_shared() {
            debug!(component = name, "Prototype definition imported");
            return Ok(());
        }

        let component = secondary.get_component(name)?;
        target.replace_instance(name, component.clone());
        secondary.replace_instance(name, Component::sentinel(name));

        if let Some(hook) = component.view::<dyn PostProcessor>() {
            target.register_hook_component(name, hook)?;
        }
        if let Some(aware) = component.view::<dyn ContextAware>() {
            aware
                .set_context(target)
                .map_err(|e| ContainerError::creation(name, &e))?;
        }
        debug!(component = name, "Imported into '{}'", target.name());
        Ok(())
    }
}

impl Bootstrap for BootstrapImporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn import(&self, target: &ApplicationContext) -> ContainerResult<Vec<String>> {
        if target.primary_source() == Some(self.primary_source.as_str()) {
            debug!(
                context = target.name(),
                "Skipping bootstrap '{}': target is a bootstrap context", self.name
            );
            return Ok(Vec::new());
        }

        let secondary = self.secondary(target).map_err(|e| ContainerError::Bootstrap {
            reason: format!("'{}' could not be built: {}", self.name, e),
        })?;
        secondary.refresh().map_err(|e| ContainerError::Bootstrap {
            reason: format!("'{}' failed to refresh: {}", self.name, e),
        })?;

        let selected = Self::selection(&secondary);
        let mut imported = Vec::with_capacity(selected.len());
        let mut failure = None;
        for name in selected {
            match self.migrate(&name, &secondary, target) {
                Ok(()) => imported.push(name),
                Err(e) => {
                    failure = Some(ContainerError::Bootstrap {
                        reason: format!("'{}' could not import '{}': {}", self.name, name, e),
                    });
                    break;
                }
            }
        }

        if let Err(e) = secondary.close() {
            warn!("Closing bootstrap context '{}' reported: {}", secondary.name(), e);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        info!(
            context = target.name(),
            "Bootstrap '{}' imported {} component(s)",
            self.name,
            imported.len()
        );
        Ok(imported)
    }
}

impl fmt::Debug for BootstrapImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapImporter")
            .field("name", &self.name)
            .field("primary_source", &self.primary_source)
            .finish()
    }
}
