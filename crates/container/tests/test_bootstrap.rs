//! Bootstrap contexts seeding a target context before its refresh

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use container::{
    markers, ApplicationContext, BootstrapImporter, ComponentDefinition, ContainerConfig,
    ContainerError, ContextAware, ContextState, PostProcessor, BOOTSTRAP_PRIMARY_SOURCE,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static INIT_TRACING: Lazy<()> = Lazy::new(common::init_test_logging);

struct SettingsSource {
    url: String,
}

struct Settings {
    endpoint: String,
}

struct Scratch;

#[derive(Default)]
struct Counters {
    source_destroyed: AtomicUsize,
    settings_destroyed: AtomicUsize,
    scratch_destroyed: AtomicUsize,
}

fn settings_importer(counters: Arc<Counters>) -> BootstrapImporter {
    BootstrapImporter::new("config", move |builder| {
        let source_counters = Arc::clone(&counters);
        let settings_counters = Arc::clone(&counters);
        let scratch_counters = Arc::clone(&counters);
        builder
            .component(
                ComponentDefinition::builder::<SettingsSource>("settingsSource")
                    .factory(|_| {
                        Ok(SettingsSource {
                            url: "https://config.internal".into(),
                        })
                    })
                    .marked(markers::BOOTSTRAP_CONFIGURATION)
                    .on_destroy(move |_| {
                        source_counters.source_destroyed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build(),
            )
            .component(
                ComponentDefinition::produced_by::<SettingsSource, Settings, _>(
                    "settings",
                    "settingsSource",
                    |source, _| {
                        Ok(Settings {
                            endpoint: format!("{}/v1", source.url),
                        })
                    },
                )
                .on_destroy(move |_| {
                    settings_counters.settings_destroyed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build(),
            )
            .component(
                ComponentDefinition::builder::<Scratch>("scratch")
                    .factory(|_| Ok(Scratch))
                    .on_destroy(move |_| {
                        scratch_counters.scratch_destroyed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build(),
            )
    })
}

fn target_with(importer: BootstrapImporter) -> ApplicationContext {
    Lazy::force(&INIT_TRACING);
    ApplicationContext::builder()
        .config(ContainerConfig::test())
        .bootstrap(Arc::new(importer))
        .build()
        .unwrap()
}

#[test]
fn test_marked_components_and_products_move_to_target() {
    let counters = Arc::new(Counters::default());
    let context = target_with(settings_importer(Arc::clone(&counters)));
    context.refresh().unwrap();

    assert!(context.contains_definition("settingsSource"));
    assert!(context.contains_definition("settings"));
    assert!(!context.contains_definition("scratch"));
    assert_eq!(
        context.get::<Settings>().unwrap().endpoint,
        "https://config.internal/v1"
    );

    // the secondary is gone: its own components are destroyed, moved ones are not
    assert_eq!(counters.scratch_destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.source_destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(counters.settings_destroyed.load(Ordering::SeqCst), 0);

    context.close().unwrap();
    assert_eq!(counters.source_destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(counters.settings_destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_imported_instances_are_not_rebuilt() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let importer = BootstrapImporter::new("config", move |builder| {
        let counter = Arc::clone(&counter);
        builder.component(
            ComponentDefinition::builder::<SettingsSource>("settingsSource")
                .factory(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(SettingsSource { url: "x".into() })
                })
                .marked(markers::BOOTSTRAP_CONFIGURATION)
                .build(),
        )
    });
    let context = target_with(importer);
    context.refresh().unwrap();
    context.get::<SettingsSource>().unwrap();

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(context.stats().singleton_creations, 0);
}

struct Observer {
    contexts: Mutex<Vec<String>>,
}

impl ContextAware for Observer {
    fn set_context(&self, context: &ApplicationContext) -> anyhow::Result<()> {
        self.contexts.lock().push(context.name().to_string());
        Ok(())
    }
}

struct AuditHook;

impl PostProcessor for AuditHook {
    fn name(&self) -> &str {
        "audit-hook"
    }
}

#[test]
fn test_moved_components_are_rebound_to_target() {
    let importer = BootstrapImporter::new("infra", |builder| {
        builder
            .component(
                ComponentDefinition::builder::<Observer>("observer")
                    .factory(|_| {
                        Ok(Observer {
                            contexts: Mutex::new(Vec::new()),
                        })
                    })
                    .provides::<dyn ContextAware>(|o| o as Arc<dyn ContextAware>)
                    .marked(markers::BOOTSTRAP_CONFIGURATION)
                    .build(),
            )
            .component(
                ComponentDefinition::builder::<AuditHook>("auditHook")
                    .factory(|_| Ok(AuditHook))
                    .provides::<dyn PostProcessor>(|h| h as Arc<dyn PostProcessor>)
                    .marked(markers::BOOTSTRAP_CONFIGURATION)
                    .build(),
            )
    });
    let context = target_with(importer);
    context.refresh().unwrap();

    let observer = context.get::<Observer>().unwrap();
    assert_eq!(
        *observer.contexts.lock(),
        vec!["test-infra".to_string(), "test".to_string()]
    );

    let hooks = context.hook_names();
    assert_eq!(hooks.iter().filter(|h| *h == "audit-hook").count(), 1);
}

#[test]
fn test_secondary_failure_aborts_target_refresh() {
    struct Broken;

    let importer = BootstrapImporter::new("vault", |builder| {
        builder.component(
            ComponentDefinition::builder::<Broken>("secrets")
                .factory(|_| Err(anyhow!("vault sealed")))
                .marked(markers::BOOTSTRAP_CONFIGURATION)
                .build(),
        )
    });
    let context = target_with(importer);

    match context.refresh() {
        Err(ContainerError::Bootstrap { reason }) => {
            assert!(reason.contains("vault"));
        }
        other => panic!("expected a bootstrap failure, got {:?}", other),
    }
    assert_eq!(context.state(), ContextState::Closed);
}

#[test]
fn test_target_definition_replaces_imported_instance() {
    struct ImportedSettings;
    struct LocalSettings {
        endpoint: &'static str,
    }

    let importer = BootstrapImporter::new("config", |builder| {
        builder.component(
            ComponentDefinition::builder::<ImportedSettings>("settings")
                .factory(|_| Ok(ImportedSettings))
                .marked(markers::BOOTSTRAP_CONFIGURATION)
                .build(),
        )
    });
    Lazy::force(&INIT_TRACING);
    let context = ApplicationContext::builder()
        .config(ContainerConfig::test())
        .bootstrap(Arc::new(importer))
        .component(
            ComponentDefinition::builder::<LocalSettings>("settings")
                .factory(|_| {
                    Ok(LocalSettings {
                        endpoint: "http://localhost",
                    })
                })
                .build(),
        )
        .build()
        .unwrap();
    context.refresh().unwrap();

    assert_eq!(
        context.get::<LocalSettings>().unwrap().endpoint,
        "http://localhost"
    );
    assert!(context.get_named::<ImportedSettings>("settings").is_err());
}

#[test]
fn test_bootstrap_context_does_not_bootstrap_itself() {
    Lazy::force(&INIT_TRACING);
    let counters = Arc::new(Counters::default());
    let context = ApplicationContext::builder()
        .config(ContainerConfig::test())
        .primary_source(BOOTSTRAP_PRIMARY_SOURCE)
        .bootstrap(Arc::new(settings_importer(counters)))
        .build()
        .unwrap();
    context.refresh().unwrap();

    assert!(!context.contains_definition("settingsSource"));
    assert_eq!(context.primary_source(), Some(BOOTSTRAP_PRIMARY_SOURCE));
}
