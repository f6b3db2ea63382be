//! Event delivery through a context: synchronous and asynchronous
//! listeners, listener components and the context's own lifecycle events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use container::{
    AfterRefresh, ApplicationContext, ApplicationEvent, ApplicationListener, ComponentDefinition,
    ContainerConfig, ContainerError, ContextClosed, ContextEvent, ContextRefreshed, ContextState,
    Delivery, RefreshScopeRefreshed, TypeKey,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static INIT_TRACING: Lazy<()> = Lazy::new(common::init_test_logging);

const DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct OrderPlaced {
    id: u32,
}

fn context_with(definitions: Vec<ComponentDefinition>) -> ApplicationContext {
    Lazy::force(&INIT_TRACING);
    let mut builder = ApplicationContext::builder().config(ContainerConfig::test());
    for definition in definitions {
        builder = builder.component(definition);
    }
    builder.build().unwrap()
}

#[test]
fn test_sync_listener_finishes_before_publish_returns() {
    let context = context_with(vec![]);
    context.refresh().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    context.subscribe::<OrderPlaced, _>("slow", Delivery::Sync, move |_| {
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    context.publish(ApplicationEvent::new(OrderPlaced { id: 1 })).unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_sync_failure_reaches_the_publisher() {
    let context = context_with(vec![]);
    context.refresh().unwrap();

    let later = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later);
    context.subscribe::<OrderPlaced, _>("inventory", Delivery::Sync, |order| {
        Err(anyhow!("order {} is out of stock", order.id))
    });
    context.subscribe::<OrderPlaced, _>("billing", Delivery::Sync, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    match context.publish(ApplicationEvent::new(OrderPlaced { id: 7 })) {
        Err(ContainerError::Listener { listener, reason }) => {
            assert_eq!(listener, "inventory");
            assert!(reason.contains("order 7"));
        }
        other => panic!("expected a listener failure, got {:?}", other),
    }
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[test]
fn test_async_listener_runs_on_event_worker() {
    let context = context_with(vec![]);
    context.refresh().unwrap();

    let threads = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&threads);
    context.subscribe::<OrderPlaced, _>("mailer", Delivery::Async, move |order| {
        let name = thread::current().name().unwrap_or_default().to_string();
        seen.lock().push((order.id, name));
        Ok(())
    });

    for id in 0..3 {
        context.publish(ApplicationEvent::new(OrderPlaced { id })).unwrap();
    }
    assert!(context.drain_events(DRAIN));

    let threads = threads.lock();
    assert_eq!(threads.len(), 3);
    assert!(threads
        .iter()
        .all(|(_, name)| name.starts_with(&format!("{}-events-", context.name()))));
}

#[test]
fn test_one_publish_reaches_sync_and_async_listeners() {
    let context = context_with(vec![]);
    context.refresh().unwrap();

    let reserved = Arc::new(AtomicBool::new(false));
    let mailed = Arc::new(AtomicBool::new(false));
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = Mutex::new(gate);

    let flag = Arc::clone(&reserved);
    context.subscribe::<OrderPlaced, _>("reservations", Delivery::Sync, move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let sent = Arc::clone(&mailed);
    context.subscribe::<OrderPlaced, _>("mailer", Delivery::Async, move |_| {
        // held until the publisher has returned
        gate.lock()
            .recv_timeout(DRAIN)
            .map_err(|_| anyhow!("never released"))?;
        sent.store(true, Ordering::SeqCst);
        Ok(())
    });

    context.publish(ApplicationEvent::new(OrderPlaced { id: 4 })).unwrap();
    assert!(reserved.load(Ordering::SeqCst));
    assert!(!mailed.load(Ordering::SeqCst));

    release.send(()).unwrap();
    assert!(context.drain_events(DRAIN));
    assert!(mailed.load(Ordering::SeqCst));
}

#[test]
fn test_async_failure_does_not_reach_the_publisher() {
    let context = context_with(vec![]);
    context.refresh().unwrap();
    context.subscribe::<OrderPlaced, _>("flaky", Delivery::Async, |_| Err(anyhow!("smtp down")));

    assert!(context.publish(ApplicationEvent::new(OrderPlaced { id: 2 })).is_ok());
    assert!(context.drain_events(DRAIN));
}

#[test]
fn test_async_delivery_after_close_is_dropped() {
    let context = context_with(vec![]);
    context.refresh().unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    context.subscribe::<OrderPlaced, _>("late", Delivery::Async, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    context.close().unwrap();

    context.publish(ApplicationEvent::new(OrderPlaced { id: 3 })).unwrap();
    assert!(context.drain_events(Duration::from_millis(200)));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}

struct AuditTrail {
    seen: Mutex<Vec<String>>,
}

impl ApplicationListener for AuditTrail {
    fn event_type(&self) -> TypeKey {
        TypeKey::of::<dyn ContextEvent>()
    }

    fn on_event(&self, event: &ApplicationEvent) -> anyhow::Result<()> {
        let context = event
            .view::<dyn ContextEvent>()
            .ok_or_else(|| anyhow!("not a context event"))?;
        let kind = if event.is::<ContextRefreshed>() {
            "refreshed"
        } else if event.is::<ContextClosed>() {
            "closed"
        } else {
            "other"
        };
        self.seen
            .lock()
            .push(format!("{}:{}", kind, context.context_name()));
        Ok(())
    }

    fn name(&self) -> &str {
        "audit-trail"
    }
}

#[test]
fn test_listener_component_observes_lifecycle() {
    let audit = ComponentDefinition::builder::<AuditTrail>("auditTrail")
        .factory(|_| {
            Ok(AuditTrail {
                seen: Mutex::new(Vec::new()),
            })
        })
        .provides::<dyn ApplicationListener>(|a| a as Arc<dyn ApplicationListener>)
        .build();
    let context = context_with(vec![audit]);
    context.refresh().unwrap();

    let trail = context.get::<AuditTrail>().unwrap();
    assert_eq!(*trail.seen.lock(), vec!["refreshed:test"]);

    context.close().unwrap();
    assert_eq!(*trail.seen.lock(), vec!["refreshed:test", "closed:test"]);
    assert_eq!(context.state(), ContextState::Closed);
}

#[test]
fn test_prototype_listener_component_is_skipped() {
    let audit = ComponentDefinition::builder::<AuditTrail>("auditTrail")
        .factory(|_| {
            Ok(AuditTrail {
                seen: Mutex::new(Vec::new()),
            })
        })
        .provides::<dyn ApplicationListener>(|a| a as Arc<dyn ApplicationListener>)
        .prototype()
        .build();
    let baseline = context_with(vec![]);
    baseline.refresh().unwrap();
    let context = context_with(vec![audit]);
    context.refresh().unwrap();
    assert_eq!(context.stats().listeners, baseline.stats().listeners);
}

struct Warmup {
    log: Arc<Mutex<Vec<String>>>,
}

impl AfterRefresh for Warmup {
    fn after_refresh(&self, context: &ApplicationContext) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("after-refresh in {}", context.state()));
        Ok(())
    }
}

#[test]
fn test_after_refresh_runs_before_refreshed_event() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let warmup_log = Arc::clone(&log);
    let warmup = ComponentDefinition::builder::<Warmup>("warmup")
        .factory(move |_| {
            Ok(Warmup {
                log: Arc::clone(&warmup_log),
            })
        })
        .provides::<dyn AfterRefresh>(|w| w as Arc<dyn AfterRefresh>)
        .build();
    let context = context_with(vec![warmup]);

    let listener_log = Arc::clone(&log);
    context.subscribe::<ContextRefreshed, _>("refreshed", Delivery::Sync, move |event| {
        listener_log.lock().push(format!("refreshed {}", event.context));
        Ok(())
    });
    context.refresh().unwrap();

    assert_eq!(
        *log.lock(),
        vec!["after-refresh in WIRED", "refreshed test"]
    );
}

#[test]
fn test_refresh_scope_publishes_refreshed_names() {
    struct Settings;

    let settings = ComponentDefinition::builder::<Settings>("settings")
        .factory(|_| Ok(Settings))
        .refresh_scoped()
        .build();
    let context = context_with(vec![settings]);
    context.refresh().unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&names);
    context.subscribe::<RefreshScopeRefreshed, _>("scope", Delivery::Sync, move |event| {
        seen.lock().extend(event.refreshed.iter().cloned());
        Ok(())
    });

    assert_eq!(context.refresh_scope().unwrap(), vec!["settings".to_string()]);
    assert_eq!(*names.lock(), vec!["settings".to_string()]);
}
