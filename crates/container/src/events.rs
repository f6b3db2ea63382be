//! Application events.
//!
//! Synchronous listeners run on the publishing thread in registration order;
//! `publish` returns after all of them, and the first failure stops delivery.
//! Asynchronous listeners run on the blocking pool of a small tokio runtime
//! owned by the multicaster and are observed only through their effects;
//! their failures are logged.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ContainerError;
use crate::types::{Instance, TypeKey};

/// Published event: payload plus the types it can be observed as
#[derive(Clone)]
pub struct ApplicationEvent {
    id: Uuid,
    timestamp: DateTime<Utc>,
    payload_type: TypeKey,
    views: HashMap<TypeKey, Instance>,
}

impl ApplicationEvent {
    pub fn new<T: Send + Sync + 'static>(payload: T) -> Self {
        Self::from_arc(Arc::new(payload))
    }

    pub fn from_arc<T: Send + Sync + 'static>(payload: Arc<T>) -> Self {
        let mut views = HashMap::new();
        views.insert(TypeKey::of::<T>(), Arc::new(payload) as Instance);
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload_type: TypeKey::of::<T>(),
            views,
        }
    }

    /// Also deliver to listeners of `V` (a supertype view of the payload)
    pub fn with_view<V: ?Sized + Send + Sync + 'static>(mut self, view: Arc<V>) -> Self {
        self.views.insert(TypeKey::of::<V>(), Arc::new(view) as Instance);
        self
    }

    pub fn view<V: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        self.views
            .get(&TypeKey::of::<V>())?
            .clone()
            .downcast::<Arc<V>>()
            .ok()
            .map(|view| Arc::clone(&*view))
    }

    pub fn is<V: ?Sized + 'static>(&self) -> bool {
        self.is_type(&TypeKey::of::<V>())
    }

    fn is_type(&self, key: &TypeKey) -> bool {
        self.views.contains_key(key)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload_type(&self) -> TypeKey {
        self.payload_type
    }
}

impl fmt::Debug for ApplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationEvent")
            .field("id", &self.id)
            .field("type", &self.payload_type)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Common view of the events a context publishes about itself
pub trait ContextEvent: Send + Sync {
    fn context_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ContextRefreshed {
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct RefreshScopeRefreshed {
    pub context: String,
    pub refreshed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContextClosed {
    pub context: String,
}

macro_rules! context_event {
    ($($event:ty),*) => {
        $(
            impl ContextEvent for $event {
                fn context_name(&self) -> &str {
                    &self.context
                }
            }
        )*
    };
}

context_event!(ContextRefreshed, RefreshScopeRefreshed, ContextClosed);

impl ContextRefreshed {
    pub fn event(context: &str) -> ApplicationEvent {
        let payload = Arc::new(Self {
            context: context.to_string(),
        });
        ApplicationEvent::from_arc(Arc::clone(&payload)).with_view::<dyn ContextEvent>(payload)
    }
}

impl RefreshScopeRefreshed {
    pub fn event(context: &str, refreshed: Vec<String>) -> ApplicationEvent {
        let payload = Arc::new(Self {
            context: context.to_string(),
            refreshed,
        });
        ApplicationEvent::from_arc(Arc::clone(&payload)).with_view::<dyn ContextEvent>(payload)
    }
}

impl ContextClosed {
    pub fn event(context: &str) -> ApplicationEvent {
        let payload = Arc::new(Self {
            context: context.to_string(),
        });
        ApplicationEvent::from_arc(Arc::clone(&payload)).with_view::<dyn ContextEvent>(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sync,
    Async,
}

/// Listener implemented by components
pub trait ApplicationListener: Send + Sync {
    /// Type (payload or view) this listener receives
    fn event_type(&self) -> TypeKey;

    fn on_event(&self, event: &ApplicationEvent) -> anyhow::Result<()>;

    fn delivery(&self) -> Delivery {
        Delivery::Sync
    }

    fn name(&self) -> &str {
        "listener"
    }
}

pub type ListenerId = u64;

type ListenerFn = Arc<dyn Fn(&ApplicationEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    name: String,
    event_type: TypeKey,
    delivery: Delivery,
    listener: ListenerFn,
}

/// Runtime running asynchronous listeners, plus the deliveries not yet joined
struct AsyncTrack {
    runtime: Option<Runtime>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncTrack {
    fn start(size: usize, context: &str) -> Result<Self, ContainerError> {
        let prefix = format!("{}-events-", context);
        let next = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(size)
            .thread_name_fn(move || {
                format!("{}{}", prefix, next.fetch_add(1, Ordering::Relaxed))
            })
            .enable_time()
            .build()
            .map_err(|e| ContainerError::Listener {
                listener: "event-worker".into(),
                reason: format!("cannot start event runtime: {}", e),
            })?;
        debug!("Started event runtime for '{}' ({} worker(s))", context, size);
        Ok(Self {
            runtime: Some(runtime),
            deliveries: Mutex::new(Vec::new()),
        })
    }

    fn spawn(&self, entry: ListenerEntry, event: Arc<ApplicationEvent>) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let handle = runtime.spawn_blocking(move || {
            if let Err(e) = (entry.listener)(&event) {
                warn!("Asynchronous listener '{}' failed: {:#}", entry.name, e);
            }
        });
        let mut deliveries = self.deliveries.lock();
        deliveries.retain(|delivery| !delivery.is_finished());
        deliveries.push(handle);
    }

    /// Join deliveries until none is left or `limit` elapses. Deliveries
    /// started by listeners while draining are joined too.
    fn drain(&self, limit: Duration) -> bool {
        let Some(runtime) = self.runtime.as_ref() else {
            return true;
        };
        let deadline = Instant::now() + limit;
        loop {
            let batch = std::mem::take(&mut *self.deliveries.lock());
            if batch.is_empty() {
                return true;
            }
            let unfinished = runtime.block_on(async {
                let mut pending = batch.into_iter();
                while let Some(mut delivery) = pending.next() {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match timeout(remaining, &mut delivery).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_panic() => warn!("Asynchronous listener panicked"),
                        Ok(Err(_)) => {}
                        Err(_) => {
                            let unfinished = std::iter::once(delivery).chain(pending);
                            return Some(unfinished.collect::<Vec<_>>());
                        }
                    }
                }
                None
            });
            if let Some(unfinished) = unfinished {
                self.deliveries.lock().extend(unfinished);
                return false;
            }
        }
    }

    fn pending(&self) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|delivery| !delivery.is_finished())
            .count()
    }
}

impl Drop for AsyncTrack {
    fn drop(&mut self) {
        // running listeners finish on their own
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Dispatches events to registered listeners
pub struct EventMulticaster {
    context: String,
    workers: usize,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_id: AtomicU64,
    track: Mutex<Option<Arc<AsyncTrack>>>,
    closed: AtomicBool,
}

impl EventMulticaster {
    pub fn new(context: impl Into<String>, workers: usize) -> Self {
        Self {
            context: context.into(),
            workers: workers.max(1),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            track: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe a closure to events observable as `E`
    pub fn subscribe<E, F>(&self, name: &str, delivery: Delivery, listener: F) -> ListenerId
    where
        E: ?Sized + Send + Sync + 'static,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: ListenerFn =
            Arc::new(move |event: &ApplicationEvent| match event.view::<E>() {
                Some(payload) => listener(&payload),
                None => Ok(()),
            });
        self.add(name.to_string(), TypeKey::of::<E>(), delivery, listener)
    }

    pub fn add_listener(&self, listener: Arc<dyn ApplicationListener>) -> ListenerId {
        let name = listener.name().to_string();
        let event_type = listener.event_type();
        let delivery = listener.delivery();
        let callback: ListenerFn =
            Arc::new(move |event: &ApplicationEvent| listener.on_event(event));
        self.add(name, event_type, delivery, callback)
    }

    fn add(
        &self,
        name: String,
        event_type: TypeKey,
        delivery: Delivery,
        listener: ListenerFn,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Listener '{}' subscribed to {} ({:?})",
            name, event_type, delivery
        );
        self.listeners.write().push(ListenerEntry {
            id,
            name,
            event_type,
            delivery,
            listener,
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event`. Synchronous listeners have all returned when this
    /// returns; a failing one stops delivery to the rest.
    pub fn publish(&self, event: ApplicationEvent) -> Result<(), ContainerError> {
        let matching = self
            .listeners
            .read()
            .iter()
            .filter(|entry| event.is_type(&entry.event_type))
            .cloned()
            .collect::<Vec<_>>();
        debug!(
            "Publishing {} to {} listener(s)",
            event.payload_type(),
            matching.len()
        );

        let event = Arc::new(event);
        for entry in matching {
            match entry.delivery {
                Delivery::Sync => {
                    (entry.listener)(&event).map_err(|e| ContainerError::Listener {
                        listener: entry.name.clone(),
                        reason: format!("{:#}", e),
                    })?;
                }
                Delivery::Async => self.dispatch(entry, Arc::clone(&event))?,
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        entry: ListenerEntry,
        event: Arc<ApplicationEvent>,
    ) -> Result<(), ContainerError> {
        if self.closed.load(Ordering::SeqCst) {
            warn!(
                "Dropping asynchronous delivery to '{}': event workers are stopped",
                entry.name
            );
            return Ok(());
        }

        let track = {
            let mut slot = self.track.lock();
            match slot.as_ref() {
                Some(track) => Arc::clone(track),
                None => {
                    let track = Arc::new(AsyncTrack::start(self.workers, &self.context)?);
                    *slot = Some(Arc::clone(&track));
                    track
                }
            }
        };
        track.spawn(entry, event);
        Ok(())
    }

    fn track(&self) -> Option<Arc<AsyncTrack>> {
        self.track.lock().clone()
    }

    /// Wait up to `timeout` for in-flight asynchronous deliveries. Returns
    /// whether everything finished.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.track().map_or(true, |track| track.drain(timeout))
    }

    pub fn pending(&self) -> usize {
        self.track().map_or(0, |track| track.pending())
    }

    /// Drain with `timeout`, then stop the event runtime. Later asynchronous
    /// deliveries are dropped.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.drain(timeout);
        if !drained {
            warn!(
                "{} asynchronous delivery(ies) still running after {:?}",
                self.pending(),
                timeout
            );
        }
        self.closed.store(true, Ordering::SeqCst);
        let track = self.track.lock().take();
        if track.is_some() {
            drop(track);
            info!("Event workers of '{}' stopped", self.context);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct OrderPlaced {
        id: u32,
    }

    #[test]
    fn test_sync_delivery_in_registration_order() {
        let bus = EventMulticaster::new("test", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe::<OrderPlaced, _>(label, Delivery::Sync, move |e| {
                seen.lock().push(format!("{}:{}", label, e.id));
                Ok(())
            });
        }
        bus.publish(ApplicationEvent::new(OrderPlaced { id: 7 })).unwrap();
        assert_eq!(*seen.lock(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_sync_failure_stops_delivery() {
        let bus = EventMulticaster::new("test", 1);
        let reached = Arc::new(AtomicUsize::new(0));
        bus.subscribe::<OrderPlaced, _>("failing", Delivery::Sync, |_| {
            Err(anyhow::anyhow!("rejected"))
        });
        let counter = Arc::clone(&reached);
        bus.subscribe::<OrderPlaced, _>("after", Delivery::Sync, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = bus.publish(ApplicationEvent::new(OrderPlaced { id: 1 }));
        assert!(matches!(
            result,
            Err(ContainerError::Listener { ref listener, .. }) if listener == "failing"
        ));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_supertype_view_delivery() {
        let bus = EventMulticaster::new("test", 1);
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        bus.subscribe::<dyn ContextEvent, _>("any", Delivery::Sync, move |e| {
            sink.lock().push(e.context_name().to_string());
            Ok(())
        });
        bus.publish(ContextRefreshed::event("app")).unwrap();
        bus.publish(ContextClosed::event("app")).unwrap();
        bus.publish(ApplicationEvent::new(OrderPlaced { id: 2 })).unwrap();
        assert_eq!(names.lock().len(), 2);
    }

    #[test]
    fn test_async_delivery_and_drain() {
        let bus = EventMulticaster::new("test", 2);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        bus.subscribe::<OrderPlaced, _>("async", Delivery::Async, move |_| {
            thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe::<OrderPlaced, _>("async-failing", Delivery::Async, |_| {
            Err(anyhow::anyhow!("logged only"))
        });

        for id in 0..4 {
            bus.publish(ApplicationEvent::new(OrderPlaced { id })).unwrap();
        }
        assert!(bus.drain(Duration::from_secs(5)));
        assert_eq!(delivered.load(Ordering::SeqCst), 4);
        assert_eq!(bus.pending(), 0);
        assert!(bus.shutdown(Duration::from_secs(1)));

        // dropped after shutdown
        bus.publish(ApplicationEvent::new(OrderPlaced { id: 9 })).unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_deliveries_started_while_draining_are_joined() {
        struct Reindex;

        let bus = Arc::new(EventMulticaster::new("test", 2));
        let reindexed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reindexed);
        bus.subscribe::<Reindex, _>("indexer", Delivery::Async, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let publisher = Arc::clone(&bus);
        bus.subscribe::<OrderPlaced, _>("catalog", Delivery::Async, move |_| {
            thread::sleep(Duration::from_millis(30));
            publisher.publish(ApplicationEvent::new(Reindex))?;
            Ok(())
        });

        bus.publish(ApplicationEvent::new(OrderPlaced { id: 5 })).unwrap();
        assert!(bus.shutdown(Duration::from_secs(5)));
        assert_eq!(reindexed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_async_panic_is_contained() {
        let bus = EventMulticaster::new("test", 1);
        bus.subscribe::<OrderPlaced, _>("panicking", Delivery::Async, |_| {
            panic!("listener bug")
        });
        bus.publish(ApplicationEvent::new(OrderPlaced { id: 6 })).unwrap();
        assert!(bus.drain(Duration::from_secs(5)));
        assert!(bus.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventMulticaster::new("test", 1);
        let id = bus.subscribe::<OrderPlaced, _>("x", Delivery::Sync, |_| Ok(()));
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }
}
