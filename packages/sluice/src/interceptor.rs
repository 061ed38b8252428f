//! Interceptors - middleware around the reducer for one (container, action type) pair.
//!
//! # Phases
//!
//! ```text
//! dequeue → reducer → [pre interceptors] → [post interceptors] → listeners → settle
//! ```
//!
//! Both phases run after the reducer; `pre` simply runs first. Within a phase
//! interceptors run sequentially in registration order.
//!
//! # Plain vs smart
//!
//! A **plain** interceptor is a synchronous callback. If it errors or panics
//! the rest of that action's chain is skipped (the loop keeps going).
//!
//! A **smart** interceptor ([`SmartInterceptor`]) runs an async callback and
//! routes its outcome to `fulfilled` or `rejected`. Its errors never abort the
//! chain because `rejected` is the error path.
//!
//! ```ignore
//! let fetch_user = SmartInterceptor::new(|api| async move {
//!     let id = api.payload().cloned().unwrap_or_default();
//!     client.get_user(id).await
//! }.boxed())
//! .on_fulfilled(|user, api| async move {
//!     let _ = api.dispatch(ActionSpec::new("users/loaded").with_payload(user)).await;
//! }.boxed());
//!
//! handle.add_interceptor("users/load", fetch_user.into_record(Phase::Post));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use crate::core::{panic_message, Action, ActionSpec};
use crate::dispatch::Store;
use crate::error::Result;

/// When an interceptor runs relative to the others for the same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
}

/// What interceptors can do while handling an action.
///
/// Cheap to clone; every clone addresses the same store and action.
#[derive(Clone)]
pub struct InterceptorApi {
    store: Store,
    owner: String,
    action: Action,
}

impl InterceptorApi {
    pub(crate) fn new(store: Store, owner: String, action: Action) -> Self {
        Self {
            store,
            owner,
            action,
        }
    }

    /// The action being intercepted.
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn payload(&self) -> Option<&Value> {
        self.action.payload()
    }

    /// Container the action was dispatched against.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Dispatch against the current owner.
    pub fn dispatch(
        &self,
        action: impl Into<ActionSpec>,
    ) -> impl Future<Output = Result<Action>> + Send + 'static {
        self.store.dispatch(action, &self.owner)
    }

    /// Dispatch against any container.
    pub fn dispatch_global(
        &self,
        action: impl Into<ActionSpec>,
        name: &str,
    ) -> impl Future<Output = Result<Action>> + Send + 'static {
        self.store.dispatch(action, name)
    }

    /// State snapshot of `name`, or of the current owner when `None`.
    pub fn get_state(&self, name: Option<&str>) -> Option<Value> {
        self.store.get_state(name.unwrap_or(&self.owner))
    }
}

impl std::fmt::Debug for InterceptorApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorApi")
            .field("owner", &self.owner)
            .field("action", &self.action.action_type())
            .finish_non_exhaustive()
    }
}

type PlainCallback = Arc<dyn Fn(&InterceptorApi) -> anyhow::Result<()> + Send + Sync>;
type SmartCallback<T> =
    Arc<dyn Fn(InterceptorApi) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
type Fulfilled<T> = Arc<dyn Fn(T, InterceptorApi) -> BoxFuture<'static, ()> + Send + Sync>;
type Rejected = Arc<dyn Fn(anyhow::Error, InterceptorApi) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased smart interceptor, so records of different result types share one table.
pub(crate) trait HandledInterceptor: Send + Sync {
    fn run(&self, api: InterceptorApi) -> BoxFuture<'static, ()>;
}

/// An async interceptor with its own success and failure continuations.
///
/// Building one is cheap and every value is independent: two endpoints built
/// from the same factory never share continuation state.
pub struct SmartInterceptor<T> {
    callback: SmartCallback<T>,
    fulfilled: Fulfilled<T>,
    rejected: Rejected,
}

impl<T: Send + 'static> SmartInterceptor<T> {
    /// Create a smart interceptor whose continuations do nothing.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(InterceptorApi) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            fulfilled: Arc::new(|_, _| async {}.boxed()),
            rejected: Arc::new(|_, _| async {}.boxed()),
        }
    }

    /// Called with the callback's result on success.
    pub fn on_fulfilled<F>(mut self, f: F) -> Self
    where
        F: Fn(T, InterceptorApi) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.fulfilled = Arc::new(f);
        self
    }

    /// Called with the callback's error on failure.
    pub fn on_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn(anyhow::Error, InterceptorApi) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.rejected = Arc::new(f);
        self
    }

    pub fn into_record(self, mode: Phase) -> InterceptorRecord {
        InterceptorRecord::smart(mode, self)
    }
}

impl<T> Clone for SmartInterceptor<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            fulfilled: self.fulfilled.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

impl<T: Send + 'static> HandledInterceptor for SmartInterceptor<T> {
    fn run(&self, api: InterceptorApi) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            match (this.callback)(api.clone()).await {
                Ok(result) => (this.fulfilled)(result, api).await,
                Err(e) => (this.rejected)(e, api).await,
            }
        }
        .boxed()
    }
}

#[derive(Clone)]
enum Handler {
    Plain(PlainCallback),
    Smart(Arc<dyn HandledInterceptor>),
}

/// One registered interceptor.
#[derive(Clone)]
pub struct InterceptorRecord {
    mode: Phase,
    handler: Handler,
}

impl InterceptorRecord {
    /// A fire-and-forget interceptor.
    pub fn plain<F>(mode: Phase, f: F) -> Self
    where
        F: Fn(&InterceptorApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            mode,
            handler: Handler::Plain(Arc::new(f)),
        }
    }

    pub fn smart<T: Send + 'static>(mode: Phase, interceptor: SmartInterceptor<T>) -> Self {
        Self {
            mode,
            handler: Handler::Smart(Arc::new(interceptor)),
        }
    }

    pub fn mode(&self) -> Phase {
        self.mode
    }

    /// Whether this record carries its own continuations.
    pub fn is_handled(&self) -> bool {
        matches!(self.handler, Handler::Smart(_))
    }
}

impl std::fmt::Debug for InterceptorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRecord")
            .field("mode", &self.mode)
            .field("handled", &self.is_handled())
            .finish()
    }
}

/// Interceptor table keyed by owner, then action type.
#[derive(Default)]
pub struct InterceptorRegistry {
    table: HashMap<String, HashMap<String, Vec<InterceptorRecord>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; records for one key run in insertion order.
    pub fn add(&mut self, owner: &str, action_type: &str, record: InterceptorRecord) {
        self.table
            .entry(owner.to_string())
            .or_default()
            .entry(action_type.to_string())
            .or_default()
            .push(record);
    }

    /// Records for `(owner, action_type)`, empty when none are registered.
    pub fn get(&self, owner: &str, action_type: &str) -> Vec<InterceptorRecord> {
        self.table
            .get(owner)
            .and_then(|by_type| by_type.get(action_type))
            .cloned()
            .unwrap_or_default()
    }

    /// Clear every record of `owner`, keeping the owner's slot.
    pub fn reset(&mut self, owner: &str) {
        self.table.insert(owner.to_string(), HashMap::new());
    }

    pub(crate) fn remove_owner(&mut self, owner: &str) {
        self.table.remove(owner);
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("owners", &self.table.len())
            .finish()
    }
}

/// Run every `pre` record, then every `post` record, one at a time.
///
/// A failing plain interceptor or any panic stops the chain for this action.
pub(crate) async fn run_chain(records: Vec<InterceptorRecord>, api: InterceptorApi) {
    for phase in [Phase::Pre, Phase::Post] {
        for record in records.iter().filter(|r| r.mode == phase) {
            let outcome = match &record.handler {
                Handler::Plain(callback) => catch_unwind(AssertUnwindSafe(|| callback(&api)))
                    .map_err(|panic| anyhow::anyhow!("interceptor panicked: {}", panic_message(&panic)))
                    .and_then(|result| result),
                Handler::Smart(interceptor) => AssertUnwindSafe(interceptor.run(api.clone()))
                    .catch_unwind()
                    .await
                    .map_err(|panic| anyhow::anyhow!("interceptor panicked: {}", panic_message(&panic))),
            };

            if let Err(e) = outcome {
                warn!(
                    owner = %api.owner(),
                    action_type = %api.action().action_type(),
                    phase = ?phase,
                    error = %e,
                    "interceptor failed, skipping the rest of the chain"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn log_record(mode: Phase, log: &Arc<Mutex<Vec<String>>>, label: &str) -> InterceptorRecord {
        let log = log.clone();
        let label = label.to_string();
        InterceptorRecord::plain(mode, move |_| {
            log.lock().unwrap().push(label.clone());
            Ok(())
        })
    }

    #[test]
    fn test_registry_keeps_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = InterceptorRegistry::new();
        registry.add("a", "x", log_record(Phase::Post, &log, "1"));
        registry.add("a", "x", log_record(Phase::Pre, &log, "2"));
        registry.add("a", "y", log_record(Phase::Pre, &log, "3"));

        let records = registry.get("a", "x");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mode(), Phase::Post);
        assert_eq!(records[1].mode(), Phase::Pre);
        assert!(registry.get("a", "z").is_empty());
        assert!(registry.get("b", "x").is_empty());
    }

    #[test]
    fn test_reset_clears_only_that_owner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = InterceptorRegistry::new();
        registry.add("a", "x", log_record(Phase::Pre, &log, "1"));
        registry.add("b", "x", log_record(Phase::Pre, &log, "2"));

        registry.reset("a");
        assert!(registry.get("a", "x").is_empty());
        assert_eq!(registry.get("b", "x").len(), 1);
    }

    #[tokio::test]
    async fn test_chain_runs_pre_before_post() {
        let store = Store::new();
        store.register_container("c", crate::container::reducer(|_, _| Ok(json!(null))), json!({}));

        let log = Arc::new(Mutex::new(Vec::new()));
        let records = vec![
            log_record(Phase::Post, &log, "post-1"),
            log_record(Phase::Pre, &log, "pre-1"),
            log_record(Phase::Post, &log, "post-2"),
            log_record(Phase::Pre, &log, "pre-2"),
        ];
        let action = crate::core::Action::stamp(ActionSpec::new("x"), "c");
        run_chain(records, InterceptorApi::new(store, "c".into(), action)).await;

        assert_eq!(*log.lock().unwrap(), vec!["pre-1", "pre-2", "post-1", "post-2"]);
    }

    #[tokio::test]
    async fn test_failing_plain_interceptor_stops_chain() {
        let store = Store::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let records = vec![
            InterceptorRecord::plain(Phase::Pre, |_| Err(anyhow::anyhow!("nope"))),
            log_record(Phase::Post, &log, "never"),
        ];
        let action = crate::core::Action::stamp(ActionSpec::new("x"), "c");
        run_chain(records, InterceptorApi::new(store, "c".into(), action)).await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_smart_interceptor_routes_outcomes() {
        let store = Store::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let ok_log = log.clone();
        let ok = SmartInterceptor::new(|_| async { Ok(41) }.boxed()).on_fulfilled(move |n, _| {
            let log = ok_log.clone();
            async move { log.lock().unwrap().push(format!("fulfilled {}", n + 1)) }.boxed()
        });

        let err_log = log.clone();
        let failing = SmartInterceptor::<()>::new(|_| async { Err(anyhow::anyhow!("down")) }.boxed())
            .on_rejected(move |e, _| {
                let log = err_log.clone();
                async move { log.lock().unwrap().push(format!("rejected {}", e)) }.boxed()
            });

        let records = vec![
            failing.into_record(Phase::Pre),
            ok.clone().into_record(Phase::Post),
        ];
        assert!(records[0].is_handled());

        let action = crate::core::Action::stamp(ActionSpec::new("x"), "c");
        run_chain(records, InterceptorApi::new(store, "c".into(), action)).await;

        assert_eq!(*log.lock().unwrap(), vec!["rejected down", "fulfilled 42"]);
    }

    #[tokio::test]
    async fn test_panicking_smart_interceptor_is_contained() {
        let store = Store::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let boom = SmartInterceptor::<()>::new(|_| {
            async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }
            .boxed()
        });
        let records = vec![boom.into_record(Phase::Pre), log_record(Phase::Post, &log, "after")];

        let action = crate::core::Action::stamp(ActionSpec::new("x"), "c");
        run_chain(records, InterceptorApi::new(store, "c".into(), action)).await;

        assert!(log.lock().unwrap().is_empty());
    }
}
