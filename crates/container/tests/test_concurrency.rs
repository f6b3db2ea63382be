//! Construct-once guarantees under concurrent first access

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use container::{
    ApplicationContext, Autowired, ComponentDefinition, ContainerConfig, Dependency, WeakContext,
    WiringPlan,
};
use once_cell::sync::{Lazy, OnceCell};
use serial_test::serial;

static INIT_TRACING: Lazy<()> = Lazy::new(common::init_test_logging);

const THREADS: usize = 16;

struct ExpensiveIndex {
    serial: usize,
}

fn lazy_index(created: Arc<AtomicUsize>) -> ComponentDefinition {
    ComponentDefinition::builder::<ExpensiveIndex>("index")
        .factory(move |_| {
            thread::sleep(Duration::from_millis(25));
            Ok(ExpensiveIndex {
                serial: created.fetch_add(1, Ordering::SeqCst),
            })
        })
        .lazy(true)
        .build()
}

fn context_with(definitions: Vec<ComponentDefinition>) -> ApplicationContext {
    Lazy::force(&INIT_TRACING);
    let mut builder = ApplicationContext::builder().config(ContainerConfig::test());
    for definition in definitions {
        builder = builder.component(definition);
    }
    let context = builder.build().unwrap();
    context.refresh().unwrap();
    context
}

#[test]
#[serial]
fn test_concurrent_first_access_creates_once() {
    let created = Arc::new(AtomicUsize::new(0));
    let context = context_with(vec![lazy_index(Arc::clone(&created))]);
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles = (0..THREADS)
        .map(|_| {
            let context = context.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                context.get::<ExpensiveIndex>().unwrap()
            })
        })
        .collect::<Vec<_>>();

    let instances = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    assert_eq!(instances[0].serial, 0);
    assert_eq!(context.stats().singleton_creations, 1);
}

#[test]
#[serial]
fn test_concurrent_access_to_distinct_singletons() {
    struct Shard(usize);

    let created = Arc::new(AtomicUsize::new(0));
    let definitions = (0..4)
        .map(|shard| {
            let created = Arc::clone(&created);
            ComponentDefinition::builder::<Shard>(format!("shard-{}", shard))
                .factory(move |_| {
                    created.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    Ok(Shard(shard))
                })
                .lazy(true)
                .build()
        })
        .collect();
    let context = context_with(definitions);

    let handles = (0..THREADS)
        .map(|i| {
            let context = context.clone();
            thread::spawn(move || {
                let name = format!("shard-{}", i % 4);
                context.get_named::<Shard>(&name).unwrap().0
            })
        })
        .collect::<Vec<_>>();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), i % 4);
    }
    assert_eq!(created.load(Ordering::SeqCst), 4);
}

#[test]
#[serial]
fn test_factory_waiting_on_another_thread_does_not_block_it() {
    struct Schema {
        version: u32,
    }
    struct Migrator {
        target: u32,
    }

    let handle: Arc<OnceCell<WeakContext>> = Arc::new(OnceCell::new());
    let context_slot = Arc::clone(&handle);
    let migrator = ComponentDefinition::builder::<Migrator>("migrator")
        .factory(move |_| {
            let context = context_slot
                .get()
                .and_then(WeakContext::upgrade)
                .ok_or_else(|| anyhow!("context is gone"))?;
            // the schema is built on a helper thread while this factory waits
            let version = thread::spawn(move || context.get::<Schema>().map(|s| s.version))
                .join()
                .map_err(|_| anyhow!("schema loader panicked"))??;
            Ok(Migrator {
                target: version + 1,
            })
        })
        .lazy(true)
        .build();
    let schema = ComponentDefinition::builder::<Schema>("schema")
        .factory(|_| Ok(Schema { version: 41 }))
        .lazy(true)
        .build();
    let context = context_with(vec![migrator, schema]);
    handle.set(context.downgrade()).ok();

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let requester = context.clone();
    thread::spawn(move || {
        let target = requester.get::<Migrator>().map(|m| m.target);
        done_tx.send(target).ok();
    });

    let target = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("migrator creation did not finish");
    assert_eq!(target.unwrap(), 42);
    assert_eq!(context.stats().singleton_creations, 2);
}

trait Lookup: Send + Sync {
    fn serial(&self) -> usize;
}

impl Lookup for ExpensiveIndex {
    fn serial(&self) -> usize {
        self.serial
    }
}

struct SearchService {
    index: Autowired<dyn Lookup>,
}

#[test]
#[serial]
fn test_deferred_reference_resolves_once_across_threads() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let index = ComponentDefinition::builder::<ExpensiveIndex>("index")
        .factory(move |_| {
            thread::sleep(Duration::from_millis(10));
            Ok(ExpensiveIndex {
                serial: counter.fetch_add(1, Ordering::SeqCst),
            })
        })
        .provides::<dyn Lookup>(|i| i as Arc<dyn Lookup>)
        .lazy(true)
        .build();
    let service = ComponentDefinition::builder::<SearchService>("search")
        .factory(|_| {
            Ok(SearchService {
                index: Autowired::new(),
            })
        })
        .wired(WiringPlan::new().field_with(
            "index",
            Dependency::by_type().lazy(),
            |s: &SearchService| &s.index,
        ))
        .build();

    let context = context_with(vec![index, service]);
    let search = context.get::<SearchService>().unwrap();
    assert!(search.index.is_deferred());
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles = (0..THREADS)
        .map(|_| {
            let search = Arc::clone(&search);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                search.index.get().unwrap().serial()
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(search.index.lazy_ref().map_or(false, |lazy| lazy.is_resolved()));
}
