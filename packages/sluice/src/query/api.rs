//! Query apis.
//!
//! A [`QueryApi`] is a container (named by its reducer path) holding one
//! [`EndpointState`] per declared endpoint, plus one orchestrated
//! interceptor per endpoint registered on its `start` and `update` actions.
//!
//! ```ignore
//! let things = QueryApi::builder("things")
//!     .base_query(BaseQuery::new("https://api.example.com"))
//!     .endpoint("getThing", Endpoint::query(|id| QueryRequest::get(format!("/things/{}", canonicalize(id)))))
//!     .register(&store)
//!     .await?;
//!
//! things.call("getThing", json!("x")).await?;
//! store.settle().await;
//! assert_eq!(things.state("getThing")?.status, EndpointStatus::Completed);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::CacheEngine;
use crate::container::{reducer, ContainerHandle};
use crate::core::Action;
use crate::dispatch::Store;
use crate::error::{Result, SluiceError};
use crate::interceptor::Phase;
use crate::listener::ListenerHandle;
use crate::persist::PersistConfig;
use crate::query::endpoint::{ApiDefaults, Endpoint, Resolved};
use crate::query::orchestrator::{endpoint_interceptor, EndpointListeners, EndpointRuntime, ListenerSlot};
use crate::query::state::{endpoint_reducer, initial_state, EndpointAction, EndpointState, EndpointStatus, UnwrapResult};
use crate::query::transport::BaseQuery;

/// Declares a query api before it is registered with a store.
pub struct QueryApiBuilder {
    reducer_path: String,
    base_query: Option<BaseQuery>,
    endpoints: Vec<(String, Endpoint)>,
    defaults: ApiDefaults,
    cache: Option<Arc<CacheEngine>>,
    sweep: bool,
    persist: Option<PersistConfig>,
}

impl QueryApiBuilder {
    fn new(reducer_path: String) -> Self {
        Self {
            reducer_path,
            base_query: None,
            endpoints: Vec::new(),
            defaults: ApiDefaults::default(),
            cache: None,
            sweep: true,
            persist: None,
        }
    }

    pub fn base_query(mut self, base_query: BaseQuery) -> Self {
        self.base_query = Some(base_query);
        self
    }

    /// Declare an endpoint. Declaring a name twice keeps the last one.
    pub fn endpoint(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        let name = name.into();
        self.endpoints.retain(|(existing, _)| existing != &name);
        self.endpoints.push((name, endpoint));
        self
    }

    pub fn defaults(mut self, defaults: ApiDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Share a cache engine (and its tag registry) with other apis.
    pub fn cache(mut self, cache: Arc<CacheEngine>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run the cache sweeper on the store's `sweep_interval`. On by default.
    ///
    /// An engine runs one sweeper however many apis share it.
    pub fn sweep(mut self, enabled: bool) -> Self {
        self.sweep = enabled;
        self
    }

    /// Persist the api's endpoint states.
    pub fn persist(mut self, persist: PersistConfig) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Register the api's container and interceptors with `store`.
    ///
    /// Registering the same reducer path again replaces the previous api.
    pub async fn register(self, store: &Store) -> Result<QueryApi> {
        let path = self.reducer_path;
        let initial = initial_state(self.endpoints.iter().map(|(name, _)| name.as_str()));
        let reduce = reducer(|state, action| Ok(endpoint_reducer(state, action)));

        let handle = match self.persist {
            Some(persist) => {
                store
                    .register_persisted_container(&path, reduce, initial, persist)
                    .await?
            }
            None => store.register_container(&path, reduce, initial),
        };

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(CacheEngine::in_memory()));
        let defaults = Arc::new(self.defaults);
        let base_query = self.base_query.map(Arc::new);
        let listeners = Arc::new(EndpointListeners::default());

        let mut endpoints = HashMap::new();
        let mut update_listeners = Vec::new();

        for (name, endpoint) in self.endpoints {
            let runtime = Arc::new(EndpointRuntime::new(
                &name,
                &path,
                Resolved {
                    endpoint,
                    defaults: defaults.clone(),
                },
                base_query.clone(),
                cache.clone(),
                listeners.clone(),
            ));

            let interceptor = endpoint_interceptor(runtime.clone());
            handle.add_interceptor(
                &EndpointAction::Start.action_type(&name),
                interceptor.clone().into_record(Phase::Post),
            );
            handle.add_interceptor(
                &EndpointAction::Update.action_type(&name),
                interceptor.into_record(Phase::Post),
            );

            let slots = listeners.clone();
            let endpoint_name = name.clone();
            update_listeners.push(handle.add_listener(
                EndpointAction::Optimistic.action_type(&name),
                move |action| {
                    slots.fire(
                        &endpoint_name,
                        ListenerSlot::Update,
                        action.payload().unwrap_or(&Value::Null),
                    );
                    Ok(())
                },
            )?);

            endpoints.insert(name, runtime);
        }

        if self.sweep {
            cache.ensure_sweeper(store.config().sweep_interval);
        }

        info!(api = %path, endpoints = endpoints.len(), "query api registered");

        Ok(QueryApi {
            inner: Arc::new(QueryApiInner {
                handle,
                endpoints,
                cache,
                listeners,
                update_listeners,
            }),
        })
    }
}

impl std::fmt::Debug for QueryApiBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryApiBuilder")
            .field("reducer_path", &self.reducer_path)
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

struct QueryApiInner {
    handle: ContainerHandle,
    endpoints: HashMap<String, Arc<EndpointRuntime>>,
    cache: Arc<CacheEngine>,
    listeners: Arc<EndpointListeners>,
    update_listeners: Vec<ListenerHandle>,
}

impl Drop for QueryApiInner {
    fn drop(&mut self) {
        for listener in &self.update_listeners {
            listener.destroy();
        }
    }
}

/// A registered query api. Cheap to clone.
#[derive(Clone)]
pub struct QueryApi {
    inner: Arc<QueryApiInner>,
}

impl QueryApi {
    pub fn builder(reducer_path: impl Into<String>) -> QueryApiBuilder {
        QueryApiBuilder::new(reducer_path.into())
    }

    /// The reducer path, which is also the container name.
    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.inner.handle
    }

    pub fn store(&self) -> &Store {
        self.inner.handle.store()
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.inner.cache
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.inner.endpoints.keys().map(String::as_str)
    }

    fn runtime(&self, endpoint: &str) -> Result<&Arc<EndpointRuntime>> {
        self.inner
            .endpoints
            .get(endpoint)
            .ok_or_else(|| SluiceError::UnknownEndpoint {
                api: self.name().to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `endpoint` with `args`.
    ///
    /// Points the endpoint's tag at a refetch with these `args`, then
    /// dispatches `start`. Resolves once `start` has been processed; the
    /// request itself continues in the background (see [`Store::settle`]).
    pub async fn call(&self, endpoint: &str, args: Value) -> Result<Action> {
        let runtime = self.runtime(endpoint)?;
        runtime.register_refetch(self.store().downgrade(), args.clone());
        self.inner
            .handle
            .dispatch(runtime.action(EndpointAction::Start, args))
            .await
    }

    /// Refetch without the `loading` transition.
    pub async fn update(&self, endpoint: &str, args: Value) -> Result<Action> {
        let runtime = self.runtime(endpoint)?;
        self.inner
            .handle
            .dispatch(runtime.action(EndpointAction::Update, args))
            .await
    }

    /// Replace the endpoint's data without touching its status.
    pub async fn optimistic(&self, endpoint: &str, data: Value) -> Result<Action> {
        let runtime = self.runtime(endpoint)?;
        self.inner
            .handle
            .dispatch(runtime.action(EndpointAction::Optimistic, data))
            .await
    }

    /// Seed the endpoint's state. `state` fields override the defaults of a
    /// completed, error-free endpoint.
    pub async fn hydrate(&self, endpoint: &str, state: Value) -> Result<Action> {
        let runtime = self.runtime(endpoint)?;
        self.inner
            .handle
            .dispatch(runtime.action(EndpointAction::Hydrate, state))
            .await
    }

    /// Mark the endpoint loading now and hydrate it with whatever `initial` resolves to.
    pub fn hydrate_later<F>(&self, endpoint: &str, initial: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = Value> + Send + 'static,
    {
        let runtime = self.runtime(endpoint)?.clone();
        let handle = self.inner.handle.clone();

        let loading = handle.store().dispatch(
            runtime.action(
                EndpointAction::Hydrate,
                json!({ "status": EndpointStatus::Loading, "data": null, "error": null }),
            ),
            handle.name(),
        );

        Ok(tokio::spawn(async move {
            if let Err(e) = loading.await {
                warn!(endpoint = %runtime.name(), error = %e, "hydrate dispatch failed");
                return;
            }
            let state = initial.await;
            if let Err(e) = handle
                .dispatch(runtime.action(EndpointAction::Hydrate, state))
                .await
            {
                warn!(endpoint = %runtime.name(), error = %e, "hydrate dispatch failed");
            }
        }))
    }

    /// Register the endpoint's tag refetch before its first call.
    pub fn register_tag(&self, endpoint: &str, args: Value) -> Result<()> {
        let runtime = self.runtime(endpoint)?;
        runtime.register_refetch(self.store().downgrade(), args);
        Ok(())
    }

    /// Fetch once, outside the store. Request failures come back as data.
    pub async fn unwrap(&self, endpoint: &str, args: Value) -> Result<UnwrapResult> {
        let runtime = self.runtime(endpoint)?.clone();
        Ok(runtime.unwrap(args).await)
    }

    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) {
        self.inner.cache.invalidate_tags(tags).await;
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current state of one endpoint.
    pub fn state(&self, endpoint: &str) -> Result<EndpointState> {
        self.runtime(endpoint)?;
        let state = self
            .store()
            .get_state(self.name())
            .ok_or_else(|| SluiceError::InvalidOwner {
                name: self.name().to_string(),
            })?;
        Ok(EndpointState::from_container(&state, endpoint).unwrap_or_default())
    }

    /// Rewrite a completed endpoint's data. Returns whether anything was dispatched.
    pub async fn update_query_result<F>(&self, endpoint: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&Value) -> Value,
    {
        let current = self.state(endpoint)?;
        if current.status != EndpointStatus::Completed {
            return Ok(false);
        }
        self.optimistic(endpoint, f(&current.data)).await?;
        Ok(true)
    }

    // =========================================================================
    // Endpoint listeners
    // =========================================================================

    fn listen<F>(&self, endpoint: &str, slot: ListenerSlot, f: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.runtime(endpoint)?;
        self.inner.listeners.set(endpoint, slot, Arc::new(f));
        Ok(())
    }

    /// Called with the arguments of every request, before it goes out.
    pub fn on_start<F>(&self, endpoint: &str, f: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listen(endpoint, ListenerSlot::Start, f)
    }

    /// Called with the new data on every `optimistic` transition.
    pub fn on_update<F>(&self, endpoint: &str, f: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listen(endpoint, ListenerSlot::Update, f)
    }

    pub fn on_completed<F>(&self, endpoint: &str, f: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listen(endpoint, ListenerSlot::Completed, f)
    }

    pub fn on_error<F>(&self, endpoint: &str, f: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listen(endpoint, ListenerSlot::Error, f)
    }
}

impl std::fmt::Debug for QueryApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryApi")
            .field("name", &self.name())
            .field("endpoints", &self.inner.endpoints.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::endpoint::Mock;
    use crate::query::transport::{QueryRequest, Response};
    use crate::testing::MockTransport;
    use std::sync::Mutex;

    async fn api_with(store: &Store, transport: &Arc<MockTransport>, endpoint: Endpoint) -> QueryApi {
        QueryApi::builder("things")
            .base_query(BaseQuery::with_transport("https://api.test", transport.clone()))
            .endpoint("getThing", endpoint)
            .sweep(false)
            .register(store)
            .await
            .unwrap()
    }

    fn get_thing() -> Endpoint {
        Endpoint::query(|args| QueryRequest::get(format!("/things/{}", args.as_str().unwrap_or_default())))
    }

    #[tokio::test]
    async fn test_initial_state_and_unknown_endpoint() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        let api = api_with(&store, &transport, get_thing()).await;

        assert_eq!(api.state("getThing").unwrap(), EndpointState::default());
        assert_eq!(api.endpoints().collect::<Vec<_>>(), vec!["getThing"]);

        let err = api.call("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, SluiceError::UnknownEndpoint { ref endpoint, .. } if endpoint == "nope"));
        assert!(api.on_completed("nope", |_| {}).is_err());
    }

    #[tokio::test]
    async fn test_call_goes_loading_then_completed() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        transport.push(Response::json_body(200, &json!({ "id": "x" })));
        let api = api_with(&store, &transport, get_thing()).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let weak = store.downgrade();
        store
            .add_once_listener(
                "getThing/start",
                move |_| {
                    if let Some(store) = weak.upgrade() {
                        let state = store.get_state("things").unwrap_or_default();
                        observed.lock().unwrap().push(state["getThing"]["status"].clone());
                    }
                    Ok(())
                },
                "things",
                None,
            )
            .unwrap();

        api.call("getThing", json!("x")).await.unwrap();
        store.settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!("loading")]);
        let state = api.state("getThing").unwrap();
        assert_eq!(state.status, EndpointStatus::Completed);
        assert_eq!(state.data, json!({ "id": "x" }));
        assert_eq!(transport.calls()[0].url, "https://api.test/things/x");
    }

    #[tokio::test]
    async fn test_failure_sets_failed_and_fires_error_listener() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        transport.push(Response::json_body(500, &json!({ "detail": "exploded" })));
        let api = api_with(
            &store,
            &transport,
            get_thing().parse_error(|body, _| body["detail"].clone()),
        )
        .await;

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        api.on_error("getThing", move |e| sink.lock().unwrap().push(e.clone()))
            .unwrap();

        api.call("getThing", json!("x")).await.unwrap();
        store.settle().await;

        let state = api.state("getThing").unwrap();
        assert_eq!(state.status, EndpointStatus::Failed);
        assert_eq!(state.error, json!("exploded"));
        assert_eq!(*errors.lock().unwrap(), vec![json!("exploded")]);
    }

    #[tokio::test]
    async fn test_hooks_share_context_and_defaults_apply() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        transport.push(Response::json_body(200, &json!({ "items": [1, 2] })));

        let contexts = Arc::new(Mutex::new(Vec::new()));
        let sink = contexts.clone();
        let api = QueryApi::builder("things")
            .base_query(BaseQuery::with_transport("https://api.test", transport.clone()))
            .defaults(
                ApiDefaults::new()
                    .transform_response(|body, _| body["items"].clone())
                    .on_success(move |data, hooks| {
                        sink.lock().unwrap().push((data.clone(), hooks.get_context()));
                        Ok(())
                    }),
            )
            .endpoint(
                "getThing",
                get_thing().on_start(|args, hooks| {
                    hooks.set_context(json!({ "requested": args }));
                    Ok(())
                }),
            )
            .sweep(false)
            .register(&store)
            .await
            .unwrap();

        api.call("getThing", json!("x")).await.unwrap();
        store.settle().await;

        assert_eq!(api.state("getThing").unwrap().data, json!([1, 2]));
        assert_eq!(
            *contexts.lock().unwrap(),
            vec![(json!([1, 2]), json!({ "requested": "x" }))]
        );
    }

    #[tokio::test]
    async fn test_update_query_result_only_when_completed() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        let api = api_with(&store, &transport, Endpoint::mocked(Mock::success(json!([1])))).await;

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        api.on_update("getThing", move |data| sink.lock().unwrap().push(data.clone()))
            .unwrap();

        assert!(!api.update_query_result("getThing", |_| json!([])).await.unwrap());

        api.call("getThing", Value::Null).await.unwrap();
        store.settle().await;

        let applied = api
            .update_query_result("getThing", |data| {
                let mut items = data.as_array().cloned().unwrap_or_default();
                items.push(json!(2));
                Value::Array(items)
            })
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(api.state("getThing").unwrap().data, json!([1, 2]));
        assert_eq!(api.state("getThing").unwrap().status, EndpointStatus::Completed);
        assert_eq!(*updates.lock().unwrap(), vec![json!([1, 2])]);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_hydrate_and_hydrate_later() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        let api = api_with(&store, &transport, get_thing()).await;

        api.hydrate("getThing", json!({ "data": "seeded" })).await.unwrap();
        let state = api.state("getThing").unwrap();
        assert_eq!(state.status, EndpointStatus::Completed);
        assert_eq!(state.data, json!("seeded"));

        let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
        let task = api
            .hydrate_later("getThing", async move { rx.await.unwrap_or(Value::Null) })
            .unwrap();
        store.settle().await;
        assert_eq!(api.state("getThing").unwrap().status, EndpointStatus::Loading);

        tx.send(json!({ "data": "late" })).unwrap();
        task.await.unwrap();
        let state = api.state("getThing").unwrap();
        assert_eq!(state.status, EndpointStatus::Completed);
        assert_eq!(state.data, json!("late"));
    }

    #[tokio::test]
    async fn test_premature_tag_registration() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        transport.push(Response::json_body(200, &json!("fresh")));
        let api = api_with(&store, &transport, get_thing().tag("things")).await;

        assert!(!api.cache().has_tag("things"));
        api.register_tag("getThing", json!("y")).unwrap();
        assert!(api.cache().has_tag("things"));

        api.invalidate_tags(&["things"]).await;
        store.settle().await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.calls()[0].url, "https://api.test/things/y");
        assert_eq!(api.state("getThing").unwrap().data, json!("fresh"));
    }

    #[tokio::test]
    async fn test_unwrap_leaves_state_alone() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        transport.push(Response::json_body(200, &json!({ "id": 3 })));
        let api = api_with(&store, &transport, get_thing()).await;

        let result = api.unwrap("getThing", json!("3")).await.unwrap();
        assert_eq!(result, UnwrapResult::completed(json!({ "id": 3 })));
        assert_eq!(api.state("getThing").unwrap(), EndpointState::default());
    }

    #[tokio::test]
    async fn test_dropping_api_removes_update_listeners() {
        let store = Store::new();
        let transport = Arc::new(MockTransport::new());
        let api = api_with(&store, &transport, get_thing()).await;
        assert_eq!(store.listener_count(), 1);

        drop(api);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_apis_sharing_an_engine_share_its_sweeper() {
        let store = Store::new();
        let cache = Arc::new(CacheEngine::in_memory());

        for path in ["first", "second"] {
            QueryApi::builder(path)
                .endpoint("getThing", Endpoint::mocked(Mock::success(json!(1))))
                .cache(cache.clone())
                .register(&store)
                .await
                .unwrap();
        }

        assert!(!cache.ensure_sweeper(std::time::Duration::from_secs(1)));
    }
}
