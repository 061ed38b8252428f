//! The store: root coordinator and drain loop.
//!
//! # Architecture
//!
//! ```text
//! dispatch(action, owner)
//!     │  validate owner + type, stamp, enqueue
//!     ▼
//! ┌──────────────┐  Enqueued   ┌───────────────────────────────────────────┐
//! │ ActionQueue  │────────────▶│ drain task (single consumer)              │
//! └──────────────┘   wake      │   for each entry, in order:               │
//!                              │     1. reducer(snapshot, action) → merge  │
//!                              │     2. interceptor chain (pre, post)      │
//!                              │     3. listeners                          │
//!                              │     4. settle the caller's future         │
//!                              └───────────────────────────────────────────┘
//! ```
//!
//! Reducers always run in queue order. The interceptor chain is polled once
//! inline; if it suspends (network call, nested dispatch) the remainder is
//! spawned as a tracked task and the loop moves on. Async work from
//! different actions may therefore overlap, while reducer application stays
//! strictly FIFO.
//!
//! The store owns every registry. Nothing is process-global, so two stores
//! never see each other's containers, interceptors or listeners.
//!
//! # Lifecycle
//!
//! [`Store::new`] spawns the drain task and must be called inside a tokio
//! runtime. The task holds only a weak reference and exits once the last
//! `Store` clone is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::container::{ContainerHandle, Reducer, StateContainer};
use crate::core::{panic_message, Action, ActionPattern, ActionSpec};
use crate::error::{Result, SluiceError};
use crate::interceptor::{run_chain, InterceptorApi, InterceptorRecord, InterceptorRegistry};
use crate::listener::{self, ListenerHandle, ListenerMode, ListenerRegistry, SharedListeners};
use crate::persist::{self, PersistConfig};
use crate::queue::{ActionQueue, QueueOp, QueuedEntry};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

struct ContainerSlot {
    reducer: Reducer,
    state: StateContainer,
    persist_task: Option<JoinHandle<()>>,
}

impl ContainerSlot {
    fn stop_persistence(&mut self) {
        if let Some(task) = self.persist_task.take() {
            task.abort();
        }
    }
}

/// Counts interceptor chains still running after their action was settled.
struct Inflight {
    count: AtomicUsize,
}

/// Decrements the inflight count when the chain it guards finishes.
struct InflightGuard {
    inner: Arc<StoreInner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.quiet.notify_waiters();
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    containers: RwLock<HashMap<String, ContainerSlot>>,
    queue: Mutex<ActionQueue>,
    interceptors: Mutex<InterceptorRegistry>,
    listeners: SharedListeners,
    inflight: Inflight,
    draining: AtomicBool,
    wake: Arc<Notify>,
    quiet: Notify,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for slot in write(&self.containers).values_mut() {
            slot.stop_persistence();
        }
        // Let the drain task observe that the store is gone.
        self.wake.notify_one();
    }
}

/// Root coordinator owning containers, the queue and every registry.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// A non-owning reference to a [`Store`].
///
/// Long-lived closures (tag refetches, timers) hold this so they never keep a
/// dropped store alive.
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

impl std::fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakStore")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store with default configuration and start its drain task.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let wake = Arc::new(Notify::new());

        let mut queue = ActionQueue::new();
        let waker = wake.clone();
        queue.subscribe(move |op, _, _| {
            if op == QueueOp::Enqueued {
                waker.notify_one();
            }
        });

        let inner = Arc::new(StoreInner {
            config,
            containers: RwLock::new(HashMap::new()),
            queue: Mutex::new(queue),
            interceptors: Mutex::new(InterceptorRegistry::new()),
            listeners: Arc::new(Mutex::new(ListenerRegistry::new())),
            inflight: Inflight {
                count: AtomicUsize::new(0),
            },
            draining: AtomicBool::new(false),
            wake: wake.clone(),
            quiet: Notify::new(),
        });

        tokio::spawn(drain_loop(Arc::downgrade(&inner), wake));

        Self { inner }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Register (or re-register) a container.
    ///
    /// Re-registering a name replaces its reducer and state. The owner's
    /// interceptor table is cleared either way so setup code can run again.
    pub fn register_container(&self, name: &str, reducer: Reducer, initial: Value) -> ContainerHandle {
        let state = StateContainer::new(initial);

        let previous = write(&self.inner.containers).insert(
            name.to_string(),
            ContainerSlot {
                reducer,
                state: state.clone(),
                persist_task: None,
            },
        );
        if let Some(mut previous) = previous {
            debug!(container = %name, "container re-registered");
            previous.stop_persistence();
        }

        self.reset_interceptors(name);
        ContainerHandle::new(name.to_string(), self.clone(), state)
    }

    /// Register a container whose state is hydrated from, and written back to, a persistence adapter.
    pub async fn register_persisted_container(
        &self,
        name: &str,
        reducer: Reducer,
        initial: Value,
        persist: PersistConfig,
    ) -> Result<ContainerHandle> {
        let handle = self.register_container(name, reducer, initial);
        persist::hydrate(&persist, name, handle.state()).await?;

        let task = persist::spawn_writer(persist, name.to_string(), handle.state().subscribe());
        match write(&self.inner.containers).get_mut(name) {
            Some(slot) => slot.persist_task = Some(task),
            None => task.abort(),
        }

        Ok(handle)
    }

    /// Tear down a container: stop persistence, reset its state, drop its interceptors.
    ///
    /// Listeners are left alone; they are removed through their own handles.
    pub fn destroy_container(&self, name: &str) -> bool {
        let removed = write(&self.inner.containers).remove(name);
        let Some(mut slot) = removed else {
            return false;
        };

        slot.stop_persistence();
        slot.state.reset();
        lock(&self.inner.interceptors).remove_owner(name);
        debug!(container = %name, "container destroyed");
        true
    }

    pub fn has_container(&self, name: &str) -> bool {
        read(&self.inner.containers).contains_key(name)
    }

    /// Snapshot of a container's state.
    pub fn get_state(&self, name: &str) -> Option<Value> {
        read(&self.inner.containers)
            .get(name)
            .map(|slot| slot.state.value())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Enqueue `action` for `owner` and wait until it has been processed.
    ///
    /// Validation happens immediately: an unknown owner or an empty action
    /// type fails without touching the queue. The action is enqueued before
    /// the returned future is first polled.
    pub fn dispatch(
        &self,
        action: impl Into<ActionSpec>,
        owner: &str,
    ) -> impl Future<Output = Result<Action>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let submitted = self.submit(action.into(), owner, Some(tx));

        async move {
            submitted?;
            rx.await.map_err(|_| SluiceError::Dropped)
        }
    }

    /// Dispatch after `delay`. Abort the returned handle to cancel.
    pub fn timed_dispatch(&self, action: impl Into<ActionSpec>, owner: &str, delay: Duration) -> JoinHandle<()> {
        let spec = action.into();
        let owner = owner.to_string();
        let store = self.downgrade();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = store.upgrade() else {
                return;
            };
            if let Err(e) = store.submit(spec, &owner, None) {
                warn!(owner = %owner, error = %e, "timed dispatch rejected");
            }
        })
    }

    fn submit(&self, spec: ActionSpec, owner: &str, settle: Option<oneshot::Sender<Action>>) -> Result<()> {
        if !self.has_container(owner) {
            return Err(SluiceError::InvalidOwner {
                name: owner.to_string(),
            });
        }
        if spec.action_type.is_empty() {
            return Err(SluiceError::UndefinedActionType {
                owner: owner.to_string(),
            });
        }

        let action = Action::stamp(spec, owner);
        let entry = match settle {
            Some(tx) => QueuedEntry::new(action, tx),
            None => QueuedEntry::detached(action),
        };
        lock(&self.inner.queue).enqueue(entry);
        Ok(())
    }

    /// Wait until the queue is empty, no drain pass is running and every
    /// interceptor chain has finished.
    pub async fn settle(&self) {
        loop {
            // Register before checking so a wakeup between the two is not lost.
            let notified = self.inner.quiet.notified();
            if self.is_quiet() {
                return;
            }
            notified.await;
        }
    }

    fn is_quiet(&self) -> bool {
        lock(&self.inner.queue).is_empty()
            && !self.inner.draining.load(Ordering::Acquire)
            && self.inner.inflight.count.load(Ordering::Acquire) == 0
    }

    /// Number of interceptor chains still running.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.count.load(Ordering::Acquire)
    }

    /// Process everything currently queued. Only one pass runs at a time.
    async fn drain(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }

        while let Some(entry) = self.next_entry() {
            self.process(entry).await;
        }

        self.inner.draining.store(false, Ordering::Release);
        self.inner.quiet.notify_waiters();
    }

    fn next_entry(&self) -> Option<QueuedEntry> {
        let mut queue = lock(&self.inner.queue);
        if queue.is_empty() {
            return None;
        }
        match queue.dequeue() {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "drain found nothing to do");
                None
            }
        }
    }

    async fn process(&self, entry: QueuedEntry) {
        let action = entry.action().clone();

        self.apply_reducer(&action);

        if self.inner.config.log_actions {
            debug!(
                action_type = %action.action_type(),
                owner = %action.name(),
                action_id = %action.id(),
                "action processed"
            );
        }

        let records = lock(&self.inner.interceptors).get(action.name(), action.action_type());
        if !records.is_empty() {
            let guard = self.track();
            let api = InterceptorApi::new(self.clone(), action.name().to_string(), action.clone());
            let mut chain = run_chain(records, api).boxed();
            if futures::poll!(&mut chain).is_pending() {
                tokio::spawn(async move {
                    chain.await;
                    drop(guard);
                });
            }
        }

        listener::notify(&self.inner.listeners, &action);
        entry.resolve();
    }

    fn apply_reducer(&self, action: &Action) {
        let slot = read(&self.inner.containers)
            .get(action.name())
            .map(|slot| (slot.reducer.clone(), slot.state.clone()));

        let Some((reducer, state)) = slot else {
            warn!(owner = %action.name(), "container removed before its action was processed");
            return;
        };

        let snapshot = state.value();
        match catch_unwind(AssertUnwindSafe(|| reducer(&snapshot, action))) {
            Ok(Ok(result)) => {
                state.update(move |_| result);
            }
            Ok(Err(e)) => {
                warn!(owner = %action.name(), action_type = %action.action_type(), error = %e, "reducer failed");
            }
            Err(panic) => {
                warn!(
                    owner = %action.name(),
                    action_type = %action.action_type(),
                    panic = %panic_message(&panic),
                    "reducer panicked"
                );
            }
        }
    }

    fn track(&self) -> InflightGuard {
        self.inner.inflight.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            inner: self.inner.clone(),
        }
    }

    // =========================================================================
    // Interceptors
    // =========================================================================

    pub fn add_interceptor(&self, owner: &str, action_type: &str, record: InterceptorRecord) {
        lock(&self.inner.interceptors).add(owner, action_type, record);
    }

    pub fn interceptors(&self, owner: &str, action_type: &str) -> Vec<InterceptorRecord> {
        lock(&self.inner.interceptors).get(owner, action_type)
    }

    pub fn reset_interceptors(&self, owner: &str) {
        lock(&self.inner.interceptors).reset(owner);
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a persistent listener. `custom_id` must be unique if given.
    pub fn add_listener<F>(
        &self,
        pattern: impl Into<ActionPattern>,
        f: F,
        owner: &str,
        custom_id: Option<&str>,
    ) -> Result<ListenerHandle>
    where
        F: Fn(&Action) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        listener::register(
            &self.inner.listeners,
            pattern.into(),
            Arc::new(f),
            owner,
            ListenerMode::Persistent,
            custom_id,
        )
    }

    /// Register a listener that is removed after it first fires.
    pub fn add_once_listener<F>(
        &self,
        pattern: impl Into<ActionPattern>,
        f: F,
        owner: &str,
        custom_id: Option<&str>,
    ) -> Result<ListenerHandle>
    where
        F: Fn(&Action) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        listener::register(
            &self.inner.listeners,
            pattern.into(),
            Arc::new(f),
            owner,
            ListenerMode::Once,
            custom_id,
        )
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("containers", &read(&self.inner.containers).len())
            .field("queued", &lock(&self.inner.queue).len())
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}

async fn drain_loop(inner: Weak<StoreInner>, wake: Arc<Notify>) {
    info!("drain loop started");
    loop {
        wake.notified().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Store { inner }.drain().await;
    }
    info!("drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::reducer;
    use crate::interceptor::Phase;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_reducer() -> Reducer {
        reducer(|state, action| match action.action_type() {
            "inc" => Ok(json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 })),
            "set" => Ok(json!({ "count": action.payload().cloned().unwrap_or(json!(0)) })),
            "boom" => Err(anyhow::anyhow!("reducer exploded")),
            _ => Ok(Value::Null),
        })
    }

    #[tokio::test]
    async fn test_dispatch_applies_reducer() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));

        let action = handle.dispatch("inc").await.unwrap();
        assert_eq!(action.action_type(), "inc");
        assert_eq!(action.name(), "counter");
        assert_eq!(handle.value(), json!({ "count": 1 }));
        assert_eq!(store.get_state("counter"), Some(json!({ "count": 1 })));
    }

    #[tokio::test]
    async fn test_unknown_owner_rejected_before_enqueue() {
        let store = Store::new();
        let err = store.dispatch("inc", "missing").await.unwrap_err();
        assert!(matches!(err, SluiceError::InvalidOwner { ref name } if name == "missing"));
        assert!(lock(&store.inner.queue).is_empty());
    }

    #[tokio::test]
    async fn test_empty_type_rejected() {
        let store = Store::new();
        store.register_container("counter", counter_reducer(), json!({ "count": 0 }));
        let err = store.dispatch("", "counter").await.unwrap_err();
        assert!(matches!(err, SluiceError::UndefinedActionType { .. }));
    }

    #[tokio::test]
    async fn test_reducer_failure_still_resolves() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 3 }));

        let action = handle.dispatch("boom").await.unwrap();
        assert_eq!(action.action_type(), "boom");
        assert_eq!(handle.value(), json!({ "count": 3 }));

        handle.dispatch("inc").await.unwrap();
        assert_eq!(handle.value(), json!({ "count": 4 }));
    }

    #[tokio::test]
    async fn test_panicking_reducer_is_contained() {
        let store = Store::new();
        let handle = store.register_container("p", reducer(|_, _| panic!("bad reducer")), json!({}));
        assert!(handle.dispatch("x").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_under_concurrent_dispatch() {
        let store = Store::new();
        let handle = store.register_container(
            "log",
            reducer(|state, action| {
                let mut items = state.as_array().cloned().unwrap_or_default();
                items.push(action.payload().cloned().unwrap_or(Value::Null));
                Ok(Value::Array(items))
            }),
            json!([]),
        );

        let futures: Vec<_> = (0..50)
            .map(|i| handle.store().dispatch(ActionSpec::new("push").with_payload(json!(i)), "log"))
            .collect();
        futures::future::join_all(futures).await;

        let expected: Vec<Value> = (0..50).map(|i| json!(i)).collect();
        assert_eq!(handle.value(), Value::Array(expected));
    }

    #[tokio::test]
    async fn test_nested_dispatch_from_interceptor_does_not_deadlock() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));

        handle.add_interceptor(
            "start",
            crate::interceptor::SmartInterceptor::new(|api| {
                async move {
                    api.dispatch("inc").await?;
                    api.dispatch("inc").await?;
                    Ok(())
                }
                .boxed()
            })
            .into_record(Phase::Post),
        );

        handle.dispatch("start").await.unwrap();
        store.settle().await;
        assert_eq!(handle.value(), json!({ "count": 2 }));
        assert_eq!(store.inflight(), 0);
    }

    #[tokio::test]
    async fn test_interceptor_sees_reduced_state() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        handle.add_pre_interceptor("inc", move |api| {
            *sink.lock().unwrap() = api.get_state(None);
            Ok(())
        });

        handle.dispatch("inc").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(json!({ "count": 1 })));
    }

    #[tokio::test]
    async fn test_listeners_fire_after_processing() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let once = handle
            .add_once_listener("inc", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        handle.dispatch("inc").await.unwrap();
        handle.dispatch("inc").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!once.is_active());
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_listener_id() {
        let store = Store::new();
        store.register_container("c", counter_reducer(), json!({}));
        store.add_listener("x", |_| Ok(()), "c", Some("fixed")).unwrap();
        let err = store.add_listener("y", |_| Ok(()), "c", Some("fixed")).unwrap_err();
        assert!(matches!(err, SluiceError::DuplicateListenerId { .. }));
    }

    #[tokio::test]
    async fn test_reregistration_resets_interceptors() {
        let store = Store::new();
        let handle = store.register_container("c", counter_reducer(), json!({ "count": 0 }));
        handle.add_pre_interceptor("inc", |_| Ok(()));
        assert_eq!(store.interceptors("c", "inc").len(), 1);

        store.register_container("c", counter_reducer(), json!({ "count": 0 }));
        assert!(store.interceptors("c", "inc").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_resets_and_unregisters() {
        let store = Store::new();
        let handle = store.register_container("c", counter_reducer(), json!({ "count": 0 }));
        handle.add_pre_interceptor("inc", |_| Ok(()));
        handle.dispatch("inc").await.unwrap();

        handle.destroy();
        assert_eq!(handle.value(), json!({ "count": 0 }));
        assert!(!store.has_container("c"));
        assert!(store.interceptors("c", "inc").is_empty());
        assert!(matches!(
            handle.dispatch("inc").await,
            Err(SluiceError::InvalidOwner { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_dispatch_waits_minutes() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));

        let timer = handle.timed_dispatch("inc", 0.5);
        tokio::time::sleep(Duration::from_secs(29)).await;
        store.settle().await;
        assert_eq!(handle.value(), json!({ "count": 0 }));

        timer.await.unwrap();
        store.settle().await;
        assert_eq!(handle.value(), json!({ "count": 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_dispatch_can_be_aborted() {
        let store = Store::new();
        let handle = store.register_container("counter", counter_reducer(), json!({ "count": 0 }));

        let timer = handle.timed_dispatch("inc", 1.0);
        timer.abort();
        tokio::time::sleep(Duration::from_secs(120)).await;
        store.settle().await;
        assert_eq!(handle.value(), json!({ "count": 0 }));
    }

    #[tokio::test]
    async fn test_weak_store_does_not_keep_store_alive() {
        let store = Store::new();
        let weak = store.downgrade();
        assert!(weak.upgrade().is_some());
        drop(store);
        assert!(weak.upgrade().is_none());
    }
}
