//! Endpoint orchestration: one smart interceptor per endpoint.
//!
//! ```text
//! <endpoint>/start | <endpoint>/update
//!     │
//!     ├─ cache lookup ──── fresh data ─────▶ <endpoint>/hydrate, stop
//!     ├─ optimistic update ───────────────▶ <endpoint>/optimistic
//!     ├─ on_start hook, start listener
//!     ├─ request (mock or base query)
//!     │
//!     ├─ ok:  transform ─▶ cache write ─▶ <endpoint>/completed ─▶ invalidate tags ─▶ on_success ─▶ completed listener
//!     └─ err: parse ─▶ transform ─▶ rollback ─▶ <endpoint>/failed ─▶ on_error ─▶ error listener
//! ```
//!
//! Failures never escape the chain: they end as a `failed` transition.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::cache::CacheEngine;
use crate::core::{panic_message, ActionSpec};
use crate::dispatch::{lock, WeakStore};
use crate::error::Result;
use crate::interceptor::{InterceptorApi, SmartInterceptor};
use crate::query::endpoint::{default_parse_error, CachePolicy, Hook, HookApi, Resolved};
use crate::query::state::{EndpointAction, UnwrapResult};
use crate::query::transport::{BaseQuery, QueryError, Response, ResponseMeta};

// =============================================================================
// Endpoint listeners
// =============================================================================

/// Points in an endpoint call that a single callback can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerSlot {
    /// Before the request, with the call arguments.
    Start,
    /// On every `optimistic` transition, with the new data.
    Update,
    /// After `completed`, with the transformed response.
    Completed,
    /// After `failed`, with the transformed error.
    Error,
}

type SlotCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// One callback per (endpoint, slot); setting a slot again replaces it.
#[derive(Default)]
pub(crate) struct EndpointListeners {
    slots: Mutex<HashMap<(String, ListenerSlot), SlotCallback>>,
}

impl EndpointListeners {
    pub(crate) fn set(&self, endpoint: &str, slot: ListenerSlot, callback: SlotCallback) {
        lock(&self.slots).insert((endpoint.to_string(), slot), callback);
    }

    pub(crate) fn fire(&self, endpoint: &str, slot: ListenerSlot, value: &Value) {
        let callback = lock(&self.slots).get(&(endpoint.to_string(), slot)).cloned();
        let Some(callback) = callback else {
            return;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
            warn!(
                endpoint,
                slot = ?slot,
                panic = %panic_message(&panic),
                "endpoint listener panicked"
            );
        }
    }
}

// =============================================================================
// Request outcomes
// =============================================================================

/// What the interceptor callback hands to `fulfilled`.
pub(crate) enum Fetched {
    /// Served from cache; state was hydrated already.
    Cached,
    Fresh {
        data: Value,
        response: ResponseMeta,
        args: Value,
    },
}

/// Why a request produced no usable response.
#[derive(Debug)]
pub(crate) enum RequestError {
    /// A mock declared as failing.
    Mock(Value),
    /// Non-2xx or non-JSON response.
    Query(QueryError),
    /// Transport failure or an undecodable body.
    Other(anyhow::Error),
}

impl RequestError {
    fn into_parts(self) -> (Value, Option<ResponseMeta>) {
        match self {
            RequestError::Mock(error) => (error, None),
            RequestError::Query(e) => (e.data, Some(e.response)),
            RequestError::Other(e) => (Value::String(e.to_string()), None),
        }
    }
}

/// Carried from the callback to `rejected`.
#[derive(Debug, thiserror::Error)]
#[error("request for endpoint {endpoint:?} failed")]
struct FetchFailure {
    endpoint: String,
    data: Value,
    response: Option<ResponseMeta>,
    /// Data to restore when an optimistic update was applied.
    rollback: Option<Value>,
}

// =============================================================================
// Runtime
// =============================================================================

/// Everything one endpoint needs at call time.
pub(crate) struct EndpointRuntime {
    name: String,
    api: String,
    resolved: Resolved,
    base_query: Option<Arc<BaseQuery>>,
    cache: Arc<CacheEngine>,
    listeners: Arc<EndpointListeners>,
    context: Arc<Mutex<Map<String, Value>>>,
}

impl EndpointRuntime {
    pub(crate) fn new(
        name: &str,
        api: &str,
        resolved: Resolved,
        base_query: Option<Arc<BaseQuery>>,
        cache: Arc<CacheEngine>,
        listeners: Arc<EndpointListeners>,
    ) -> Self {
        Self {
            name: name.to_string(),
            api: api.to_string(),
            resolved,
            base_query,
            cache,
            listeners,
            context: Arc::new(Mutex::new(Map::new())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn action(&self, kind: EndpointAction, payload: Value) -> ActionSpec {
        ActionSpec::new(kind.action_type(&self.name)).with_payload(payload)
    }

    fn hook_api(&self, api: InterceptorApi) -> HookApi {
        HookApi::new(api, &self.name, self.context.clone())
    }

    async fn send(&self, api: &InterceptorApi, kind: EndpointAction, payload: Value) {
        if let Err(e) = api.dispatch(self.action(kind, payload)).await {
            warn!(endpoint = %self.name, action = %kind, error = %e, "endpoint dispatch failed");
        }
    }

    /// Run a user hook. Errors are logged; a panic is logged and returned.
    fn run_hook(&self, label: &str, hook: Option<&Hook>, value: &Value, api: &HookApi) -> Option<String> {
        let hook = hook?;
        match catch_unwind(AssertUnwindSafe(|| hook(value, api))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(endpoint = %self.name, hook = label, error = %e, "endpoint hook failed");
                None
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(endpoint = %self.name, hook = label, panic = %message, "endpoint hook panicked");
                Some(message)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------

    /// Fresh cached data for `args`, if any.
    async fn cached_data(&self, args: &Value) -> Option<Value> {
        let policy = self.resolved.endpoint.cache.as_ref()?;
        match self.lookup(policy, args).await {
            Ok(data) => data,
            Err(e) => {
                warn!(endpoint = %self.name, error = %e, "cache read failed");
                None
            }
        }
    }

    /// Creates an empty entry on first sight and evicts an expired one.
    async fn lookup(&self, policy: &CachePolicy, args: &Value) -> Result<Option<Value>> {
        let key = policy.key_for(args);
        let now = self.cache.now();

        match self.cache.read(&self.name, &key).await? {
            None => {
                let entry = policy.entry_for(args, now, self.resolved.endpoint.tag.as_deref());
                self.cache.write(&self.name, &key, entry).await?;
                Ok(None)
            }
            Some(entry) if entry.is_expired(now) => {
                debug!(endpoint = %self.name, key = %key, "cache entry expired");
                self.cache.remove(&self.name, &key).await?;
                Ok(None)
            }
            Some(entry) => Ok(entry.data),
        }
    }

    async fn write_cache(&self, args: &Value, data: &Value) {
        let Some(policy) = &self.resolved.endpoint.cache else {
            return;
        };
        let entry = policy
            .entry_for(args, self.cache.now(), self.resolved.endpoint.tag.as_deref())
            .with_data(data.clone());
        if let Err(e) = self.cache.write(&self.name, &policy.key_for(args), entry).await {
            warn!(endpoint = %self.name, error = %e, "cache write failed");
        }
    }

    /// Point this endpoint's tag at a refetch with `args`.
    ///
    /// The refetch evicts the entry for `args` and dispatches `update` with them.
    pub(crate) fn register_refetch(&self, store: WeakStore, args: Value) {
        let Some(tag) = self.resolved.endpoint.tag.clone() else {
            return;
        };

        let cache = Arc::downgrade(&self.cache);
        let policy = self.resolved.endpoint.cache.clone();
        let endpoint = self.name.clone();
        let owner = self.api.clone();

        self.cache.register_tag(
            &tag,
            Arc::new(move || {
                let cache = cache.clone();
                let policy = policy.clone();
                let endpoint = endpoint.clone();
                let owner = owner.clone();
                let store = store.clone();
                let args = args.clone();
                async move {
                    if let (Some(cache), Some(policy)) = (cache.upgrade(), policy) {
                        if let Err(e) = cache.remove(&endpoint, &policy.key_for(&args)).await {
                            warn!(endpoint = %endpoint, error = %e, "failed to evict invalidated entry");
                        }
                    }
                    let Some(store) = store.upgrade() else {
                        return;
                    };
                    let update = ActionSpec::new(EndpointAction::Update.action_type(&endpoint)).with_payload(args);
                    if let Err(e) = store.dispatch(update, &owner).await {
                        warn!(endpoint = %endpoint, error = %e, "refetch dispatch failed");
                    }
                }
                .boxed()
            }),
        );
    }

    // -------------------------------------------------------------------------
    // Request
    // -------------------------------------------------------------------------

    async fn request(&self, args: &Value) -> Result<(Value, ResponseMeta), RequestError> {
        let endpoint = &self.resolved.endpoint;

        let response = match (&endpoint.mock, &endpoint.query) {
            (Some(mock), _) => {
                if !mock.ok {
                    return Err(RequestError::Mock(mock.error.clone()));
                }
                Response::json_body(mock.status, &mock.data)
            }
            (None, Some(query)) => {
                let base = self
                    .base_query
                    .as_ref()
                    .ok_or_else(|| RequestError::Other(anyhow!("query api {:?} has no base query", self.api)))?;
                let response = base
                    .execute(&query(args))
                    .await
                    .map_err(|e| RequestError::Other(e.into()))?;

                if response.status() == 204 {
                    return Ok((json!({}), response.meta().clone()));
                }
                if !response.meta().is_json() {
                    return Err(RequestError::Query(QueryError::new(
                        Value::String(response.text().to_string()),
                        response.meta().clone(),
                    )));
                }
                response
            }
            (None, None) => {
                return Err(RequestError::Other(anyhow!(
                    "endpoint {:?} declares neither a query nor a mock",
                    self.name
                )))
            }
        };

        let json = response.json().map_err(RequestError::Other)?;
        if !response.ok() {
            return Err(RequestError::Query(QueryError::new(json, response.meta().clone())));
        }
        Ok((json, response.meta().clone()))
    }

    // -------------------------------------------------------------------------
    // Interceptor stages
    // -------------------------------------------------------------------------

    async fn fetch(&self, api: InterceptorApi) -> anyhow::Result<Fetched> {
        let args = api.payload().cloned().unwrap_or(Value::Null);

        if let Some(data) = self.cached_data(&args).await {
            debug!(endpoint = %self.name, "serving from cache");
            self.send(&api, EndpointAction::Hydrate, json!({ "data": data })).await;
            return Ok(Fetched::Cached);
        }

        let hooks = self.hook_api(api.clone());
        let rollback = self.apply_optimistic(&args, &hooks).await;

        if let Some(panic) = self.run_hook("on_start", self.resolved.endpoint.on_start.as_ref(), &args, &hooks) {
            return Err(FetchFailure {
                endpoint: self.name.clone(),
                data: Value::String(panic),
                response: None,
                rollback,
            }
            .into());
        }
        self.listeners.fire(&self.name, ListenerSlot::Start, &args);

        match self.request(&args).await {
            Ok((data, response)) => Ok(Fetched::Fresh { data, response, args }),
            Err(e) => {
                let (data, response) = e.into_parts();
                Err(FetchFailure {
                    endpoint: self.name.clone(),
                    data,
                    response,
                    rollback,
                }
                .into())
            }
        }
    }

    /// Apply the optimistic update, returning the data it replaced.
    async fn apply_optimistic(&self, args: &Value, hooks: &HookApi) -> Option<Value> {
        let update = self.resolved.endpoint.on_optimistic_update.as_ref()?;
        let current = hooks
            .get_state(None)
            .and_then(|state| state.get(&self.name).map(|slice| slice["data"].clone()))
            .unwrap_or(Value::Null);

        match catch_unwind(AssertUnwindSafe(|| update(&current, args, hooks))) {
            Ok(Ok(optimistic)) => {
                self.send(hooks, EndpointAction::Optimistic, optimistic).await;
                Some(current)
            }
            Ok(Err(e)) => {
                warn!(endpoint = %self.name, error = %e, "optimistic update failed");
                None
            }
            Err(panic) => {
                warn!(endpoint = %self.name, panic = %panic_message(&panic), "optimistic update panicked");
                None
            }
        }
    }

    async fn fulfilled(&self, fetched: Fetched, api: InterceptorApi) {
        let Fetched::Fresh { data, response, args } = fetched else {
            return;
        };

        let data = self.resolved.transform_response(data, &response);
        self.write_cache(&args, &data).await;
        self.send(&api, EndpointAction::Completed, data.clone()).await;

        let invalidates = &self.resolved.endpoint.invalidates;
        if !invalidates.is_empty() {
            self.cache.invalidate_tags(invalidates.as_slice()).await;
        }

        let hooks = self.hook_api(api);
        self.run_hook("on_success", self.resolved.on_success(), &data, &hooks);
        self.listeners.fire(&self.name, ListenerSlot::Completed, &data);
    }

    async fn rejected(&self, error: anyhow::Error, api: InterceptorApi) {
        let FetchFailure {
            data,
            response,
            rollback,
            ..
        } = match error.downcast::<FetchFailure>() {
            Ok(failure) => failure,
            Err(other) => FetchFailure {
                endpoint: self.name.clone(),
                data: Value::String(other.to_string()),
                response: None,
                rollback: None,
            },
        };

        debug!(endpoint = %self.name, status = ?response.as_ref().map(|r| r.status), "endpoint request failed");

        let parsed = self
            .resolved
            .parse_error(&data, response.as_ref())
            .unwrap_or(data);
        let error = self.resolved.transform_error(parsed);

        if let Some(backup) = rollback {
            self.send(&api, EndpointAction::Optimistic, backup).await;
        }
        self.send(&api, EndpointAction::Failed, error.clone()).await;

        let hooks = self.hook_api(api);
        self.run_hook("on_error", self.resolved.on_error(), &error, &hooks);
        self.listeners.fire(&self.name, ListenerSlot::Error, &error);
    }

    // -------------------------------------------------------------------------
    // One-shot path
    // -------------------------------------------------------------------------

    /// Fetch without touching the store. Errors come back as data.
    pub(crate) async fn unwrap(&self, args: Value) -> UnwrapResult {
        if let Some(data) = self.cached_data(&args).await {
            return UnwrapResult::completed(data);
        }

        match self.request(&args).await {
            Ok((data, response)) => {
                let data = self.resolved.transform_response(data, &response);
                self.write_cache(&args, &data).await;
                UnwrapResult::completed(data)
            }
            Err(RequestError::Mock(error)) => UnwrapResult::failed(error),
            Err(RequestError::Query(e)) if e.response.is_json() => {
                let parsed = self
                    .resolved
                    .parse_error(&e.data, Some(&e.response))
                    .unwrap_or_else(|| default_parse_error(&e.data));
                UnwrapResult::failed(self.resolved.transform_error(parsed))
            }
            Err(other) => {
                let (data, response) = other.into_parts();
                let parsed = self
                    .resolved
                    .parse_error(&data, response.as_ref())
                    .unwrap_or(data);
                UnwrapResult::failed(self.resolved.transform_error(parsed))
            }
        }
    }
}

/// Build the interceptor registered on both `start` and `update` of an endpoint.
pub(crate) fn endpoint_interceptor(runtime: Arc<EndpointRuntime>) -> SmartInterceptor<Fetched> {
    let on_call = runtime.clone();
    let on_ok = runtime.clone();
    let on_err = runtime;

    SmartInterceptor::new(move |api| {
        let runtime = on_call.clone();
        async move { runtime.fetch(api).await }.boxed()
    })
    .on_fulfilled(move |fetched, api| {
        let runtime = on_ok.clone();
        async move { runtime.fulfilled(fetched, api).await }.boxed()
    })
    .on_rejected(move |error, api| {
        let runtime = on_err.clone();
        async move { runtime.rejected(error, api).await }.boxed()
    })
}
