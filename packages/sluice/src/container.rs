//! State containers and the reducer merge policy.
//!
//! A [`StateContainer`] holds one JSON value behind a `tokio::sync::watch`
//! channel. Reducer results are folded in with [`merge_state`]:
//!
//! | Reducer result                            | Effect                        |
//! |-------------------------------------------|-------------------------------|
//! | `null`, `false`, `""`, `{}`, `[]`         | no-op, subscribers not woken  |
//! | non-empty array                           | replaces the state            |
//! | non-empty object, object state            | key-wise shallow merge        |
//! | non-empty object, non-object state        | replaces the state            |
//! | number, `true`, non-empty string          | replaces the state            |
//!
//! The array/object asymmetry is load-bearing: endpoint state lives in object
//! containers and relies on the merge, while list containers rely on replace.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::{Action, ActionPattern, ActionSpec};
use crate::dispatch::Store;
use crate::error::Result;
use crate::interceptor::{InterceptorRecord, Phase};
use crate::listener::ListenerHandle;

/// A reducer maps `(snapshot, action)` to a partial state.
///
/// Returning an empty value (see the module table) leaves state untouched,
/// which is how reducers ignore actions they do not handle.
pub type Reducer = Arc<dyn Fn(&Value, &Action) -> anyhow::Result<Value> + Send + Sync>;

/// Wrap a closure as a [`Reducer`].
pub fn reducer<F>(f: F) -> Reducer
where
    F: Fn(&Value, &Action) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Fold a reducer result into the current state.
///
/// Returns `None` when the result is empty and state should stay as is.
pub fn merge_state(current: &Value, result: Value) -> Option<Value> {
    if is_empty_result(&result) {
        return None;
    }

    match (current, result) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            merged.extend(patch);
            Some(Value::Object(merged))
        }
        (_, replacement) => Some(replacement),
    }
}

/// Reactive holder for one container's state.
///
/// Cloning shares the same underlying value.
#[derive(Clone)]
pub struct StateContainer {
    tx: Arc<watch::Sender<Value>>,
    initial: Arc<Value>,
}

impl StateContainer {
    pub fn new(initial: Value) -> Self {
        let (tx, _) = watch::channel(initial.clone());
        Self {
            tx: Arc::new(tx),
            initial: Arc::new(initial),
        }
    }

    /// Current snapshot.
    pub fn value(&self) -> Value {
        self.tx.borrow().clone()
    }

    pub fn initial(&self) -> &Value {
        &self.initial
    }

    /// Replace the state wholesale.
    pub fn set(&self, value: Value) {
        self.tx.send_replace(value);
    }

    /// Apply `f` to the current state and merge its result.
    ///
    /// Returns whether the state changed.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Value) -> Value,
    {
        self.tx.send_if_modified(|state| {
            let result = f(state);
            match merge_state(state, result) {
                Some(next) => {
                    *state = next;
                    true
                }
                None => false,
            }
        })
    }

    /// Restore the initial state.
    pub fn reset(&self) {
        self.set((*self.initial).clone());
    }

    /// Observe changes. The receiver starts at the current value; dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for StateContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContainer")
            .field("value", &*self.tx.borrow())
            .finish_non_exhaustive()
    }
}

/// Handle returned by container registration.
///
/// Every dispatch through the handle is addressed to its container.
#[derive(Clone)]
pub struct ContainerHandle {
    name: String,
    store: Store,
    state: StateContainer,
}

impl ContainerHandle {
    pub(crate) fn new(name: String, store: Store, state: StateContainer) -> Self {
        Self { name, store, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Current state snapshot.
    pub fn value(&self) -> Value {
        self.state.value()
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.state.subscribe()
    }

    /// Dispatch against this container and wait for it to be processed.
    pub async fn dispatch(&self, action: impl Into<ActionSpec>) -> Result<Action> {
        self.store.dispatch(action, &self.name).await
    }

    /// Dispatch after `delay_minutes` minutes. Abort the handle to cancel.
    pub fn timed_dispatch(&self, action: impl Into<ActionSpec>, delay_minutes: f64) -> JoinHandle<()> {
        self.store
            .timed_dispatch(action, &self.name, minutes(delay_minutes))
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    /// Tear the container down. Its state returns to the initial value.
    pub fn destroy(&self) {
        self.store.destroy_container(&self.name);
    }

    pub fn add_interceptor(&self, action_type: &str, record: InterceptorRecord) {
        self.store.add_interceptor(&self.name, action_type, record);
    }

    pub fn add_pre_interceptor<F>(&self, action_type: &str, f: F)
    where
        F: Fn(&crate::interceptor::InterceptorApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_interceptor(action_type, InterceptorRecord::plain(Phase::Pre, f));
    }

    pub fn add_post_interceptor<F>(&self, action_type: &str, f: F)
    where
        F: Fn(&crate::interceptor::InterceptorApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_interceptor(action_type, InterceptorRecord::plain(Phase::Post, f));
    }

    pub fn add_listener<F>(&self, pattern: impl Into<ActionPattern>, f: F) -> Result<ListenerHandle>
    where
        F: Fn(&Action) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.store.add_listener(pattern, f, &self.name, None)
    }

    pub fn add_once_listener<F>(&self, pattern: impl Into<ActionPattern>, f: F) -> Result<ListenerHandle>
    where
        F: Fn(&Action) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.store.add_once_listener(pattern, f, &self.name, None)
    }

    pub(crate) fn state(&self) -> &StateContainer {
        &self.state
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Convert a fractional minute delay into a `Duration`.
///
/// Negative and NaN delays mean "now"; delays too large to represent saturate.
pub(crate) fn minutes(delay_minutes: f64) -> Duration {
    if delay_minutes.is_nan() || delay_minutes <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delay_minutes * 60.0).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_results_merge() {
        let merged = merge_state(&json!({ "a": 1, "b": 2 }), json!({ "b": 3, "c": 4 }));
        assert_eq!(merged, Some(json!({ "a": 1, "b": 3, "c": 4 })));
    }

    #[test]
    fn test_array_results_replace() {
        let merged = merge_state(&json!([1, 2, 3]), json!([4]));
        assert_eq!(merged, Some(json!([4])));

        let merged = merge_state(&json!({ "a": 1 }), json!([4]));
        assert_eq!(merged, Some(json!([4])));
    }

    #[test]
    fn test_empty_results_are_noops() {
        let current = json!({ "a": 1 });
        for empty in [json!(null), json!(false), json!({}), json!([]), json!("")] {
            assert_eq!(merge_state(&current, empty), None);
        }
    }

    #[test]
    fn test_scalars_replace() {
        assert_eq!(merge_state(&json!(1), json!(0)), Some(json!(0)));
        assert_eq!(merge_state(&json!({ "a": 1 }), json!("x")), Some(json!("x")));
    }

    #[test]
    fn test_container_update_and_reset() {
        let container = StateContainer::new(json!({ "count": 0 }));
        assert!(container.update(|s| json!({ "count": s["count"].as_i64().unwrap() + 1 })));
        assert_eq!(container.value(), json!({ "count": 1 }));

        assert!(!container.update(|_| json!(null)));
        assert_eq!(container.value(), json!({ "count": 1 }));

        container.reset();
        assert_eq!(container.value(), json!({ "count": 0 }));
    }

    #[tokio::test]
    async fn test_subscribers_only_wake_on_change() {
        let container = StateContainer::new(json!({ "a": 1 }));
        let mut rx = container.subscribe();
        assert_eq!(*rx.borrow_and_update(), json!({ "a": 1 }));

        container.update(|_| json!({}));
        assert!(!rx.has_changed().unwrap());

        container.update(|_| json!({ "a": 2 }));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), json!({ "a": 2 }));
    }

    #[test]
    fn test_minutes_conversion() {
        assert_eq!(minutes(1.0), Duration::from_secs(60));
        assert_eq!(minutes(0.5), Duration::from_secs(30));
        assert_eq!(minutes(-1.0), Duration::ZERO);
        assert_eq!(minutes(f64::NAN), Duration::ZERO);
        assert_eq!(minutes(1e300), Duration::MAX);
        assert_eq!(minutes(f64::INFINITY), Duration::MAX);
        assert_eq!(minutes(f64::NEG_INFINITY), Duration::ZERO);
    }
}
