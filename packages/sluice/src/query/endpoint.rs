//! Endpoint declarations.
//!
//! An [`Endpoint`] is pure configuration: how to build the request from the
//! call arguments, how to shape the response and the error, which hooks to
//! run, and how to cache. The orchestrator turns each one into a smart
//! interceptor when the api is registered.
//!
//! ```ignore
//! let get_thing = Endpoint::query(|args| QueryRequest::get(format!("/things/{}", args.as_str().unwrap_or_default())))
//!     .cache(CachePolicy::new(CacheKey::derived(|args| canonicalize(args))).ttl(|_| Expiry::from_millis(1000)))
//!     .tag("things");
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::cache::{CacheEntry, CacheKey, Expiry};
use crate::dispatch::lock;
use crate::interceptor::InterceptorApi;
use crate::query::transport::{QueryRequest, ResponseMeta};

pub type QueryFn = Arc<dyn Fn(&Value) -> QueryRequest + Send + Sync>;
pub type TransformResponse = Arc<dyn Fn(Value, &ResponseMeta) -> Value + Send + Sync>;
pub type TransformError = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type ParseError = Arc<dyn Fn(&Value, Option<&ResponseMeta>) -> Value + Send + Sync>;
pub type Hook = Arc<dyn Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync>;
pub type OptimisticUpdate = Arc<dyn Fn(&Value, &Value, &HookApi) -> anyhow::Result<Value> + Send + Sync>;

type ExpiryFn = Arc<dyn Fn(&Value) -> Expiry + Send + Sync>;
type AutoRefreshFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

// =============================================================================
// Hook API
// =============================================================================

/// What hooks see: the interceptor API plus the endpoint's shared context.
///
/// The context is one map per endpoint, shared by every call of it. Derefs to
/// [`InterceptorApi`], so `dispatch`, `dispatch_global` and `get_state` are
/// available directly.
#[derive(Clone)]
pub struct HookApi {
    api: InterceptorApi,
    endpoint: String,
    context: Arc<Mutex<Map<String, Value>>>,
}

impl HookApi {
    pub(crate) fn new(api: InterceptorApi, endpoint: &str, context: Arc<Mutex<Map<String, Value>>>) -> Self {
        Self {
            api,
            endpoint: endpoint.to_string(),
            context,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Merge the fields of `data` into the context. Non-object values are
    /// stored under `"value"`.
    pub fn set_context(&self, data: Value) {
        let mut context = lock(&self.context);
        match data {
            Value::Object(fields) => context.extend(fields),
            other => {
                context.insert("value".to_string(), other);
            }
        }
    }

    pub fn get_context(&self) -> Value {
        Value::Object(lock(&self.context).clone())
    }
}

impl Deref for HookApi {
    type Target = InterceptorApi;

    fn deref(&self) -> &Self::Target {
        &self.api
    }
}

impl fmt::Debug for HookApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookApi")
            .field("endpoint", &self.endpoint)
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Cache policy
// =============================================================================

/// How an endpoint's responses are cached.
///
/// Without a `ttl` entries never expire. Without `auto_refresh` an expired
/// entry is simply evicted by the sweeper.
#[derive(Clone)]
pub struct CachePolicy {
    key: CacheKey,
    ttl: Option<ExpiryFn>,
    auto_refresh: Option<AutoRefreshFn>,
}

impl CachePolicy {
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            auto_refresh: None,
        }
    }

    pub fn ttl<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Expiry + Send + Sync + 'static,
    {
        self.ttl = Some(Arc::new(f));
        self
    }

    pub fn auto_refresh<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.auto_refresh = Some(Arc::new(f));
        self
    }

    /// Composite key for one call.
    pub fn key_for(&self, args: &Value) -> String {
        self.key.resolve(args)
    }

    pub fn expiry_for(&self, args: &Value) -> Expiry {
        self.ttl.as_ref().map(|f| f(args)).unwrap_or(Expiry::Never)
    }

    pub fn auto_refresh_for(&self, args: &Value) -> bool {
        self.auto_refresh.as_ref().map(|f| f(args)).unwrap_or(false)
    }

    /// A fresh entry for `args`, without data.
    pub(crate) fn entry_for(&self, args: &Value, now: DateTime<Utc>, tag: Option<&str>) -> CacheEntry {
        CacheEntry::pending(
            now,
            self.expiry_for(args),
            self.auto_refresh_for(args),
            tag.map(str::to_string),
        )
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("key", &self.key)
            .field("ttl", &self.ttl.is_some())
            .field("auto_refresh", &self.auto_refresh.is_some())
            .finish()
    }
}

// =============================================================================
// Mock
// =============================================================================

/// A static response that bypasses the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Mock {
    pub data: Value,
    pub error: Value,
    pub ok: bool,
    pub status: u16,
}

impl Mock {
    /// Succeeds with `data`.
    pub fn success(data: Value) -> Self {
        Self {
            data,
            error: Value::Null,
            ok: true,
            status: 200,
        }
    }

    /// Fails with `error` before any response exists.
    pub fn failure(error: Value) -> Self {
        Self {
            data: Value::Null,
            error,
            ok: false,
            status: 200,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// One remote endpoint of a query api.
#[derive(Clone, Default)]
pub struct Endpoint {
    pub(crate) query: Option<QueryFn>,
    pub(crate) transform_response: Option<TransformResponse>,
    pub(crate) transform_error: Option<TransformError>,
    pub(crate) parse_error: Option<ParseError>,
    pub(crate) on_start: Option<Hook>,
    pub(crate) on_success: Option<Hook>,
    pub(crate) on_error: Option<Hook>,
    pub(crate) on_optimistic_update: Option<OptimisticUpdate>,
    pub(crate) cache: Option<CachePolicy>,
    pub(crate) tag: Option<String>,
    pub(crate) invalidates: Vec<String>,
    pub(crate) mock: Option<Mock>,
}

impl Endpoint {
    /// An endpoint that builds its request from the call arguments.
    pub fn query<F>(f: F) -> Self
    where
        F: Fn(&Value) -> QueryRequest + Send + Sync + 'static,
    {
        Self {
            query: Some(Arc::new(f)),
            ..Self::default()
        }
    }

    /// An endpoint answered by a static mock.
    pub fn mocked(mock: Mock) -> Self {
        Self {
            mock: Some(mock),
            ..Self::default()
        }
    }

    /// Replace the transport with a static mock.
    pub fn mock(mut self, mock: Mock) -> Self {
        self.mock = Some(mock);
        self
    }

    pub fn transform_response<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &ResponseMeta) -> Value + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(f));
        self
    }

    pub fn transform_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_error = Some(Arc::new(f));
        self
    }

    pub fn parse_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&ResponseMeta>) -> Value + Send + Sync + 'static,
    {
        self.parse_error = Some(Arc::new(f));
        self
    }

    /// Runs with the call arguments before the request goes out.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Runs with the transformed response.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Runs with the transformed error.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Computes speculative data from `(current data, args)`. Rolled back if the call fails.
    pub fn on_optimistic_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value, &HookApi) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.on_optimistic_update = Some(Arc::new(f));
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Invalidation group this endpoint refetches under.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Tags to invalidate after a successful call.
    pub fn invalidates<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    pub fn tag_name(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("query", &self.query.is_some())
            .field("cache", &self.cache)
            .field("tag", &self.tag)
            .field("invalidates", &self.invalidates)
            .field("mock", &self.mock)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Api defaults
// =============================================================================

/// Fallbacks used by every endpoint that does not declare its own.
#[derive(Clone, Default)]
pub struct ApiDefaults {
    pub(crate) transform_response: Option<TransformResponse>,
    pub(crate) transform_error: Option<TransformError>,
    pub(crate) parse_error: Option<ParseError>,
    pub(crate) on_success: Option<Hook>,
    pub(crate) on_error: Option<Hook>,
}

impl ApiDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform_response<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &ResponseMeta) -> Value + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(f));
        self
    }

    pub fn transform_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_error = Some(Arc::new(f));
        self
    }

    pub fn parse_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&ResponseMeta>) -> Value + Send + Sync + 'static,
    {
        self.parse_error = Some(Arc::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &HookApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ApiDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiDefaults").finish_non_exhaustive()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// An endpoint paired with its api's defaults. Endpoint settings win.
#[derive(Clone, Debug)]
pub(crate) struct Resolved {
    pub(crate) endpoint: Endpoint,
    pub(crate) defaults: Arc<ApiDefaults>,
}

impl Resolved {
    pub(crate) fn transform_response(&self, data: Value, meta: &ResponseMeta) -> Value {
        match self
            .endpoint
            .transform_response
            .as_ref()
            .or(self.defaults.transform_response.as_ref())
        {
            Some(f) => f(data, meta),
            None => data,
        }
    }

    pub(crate) fn transform_error(&self, error: Value) -> Value {
        match self
            .endpoint
            .transform_error
            .as_ref()
            .or(self.defaults.transform_error.as_ref())
        {
            Some(f) => f(error),
            None => error,
        }
    }

    /// The declared parser's output, or `None` when neither level declares one.
    pub(crate) fn parse_error(&self, data: &Value, meta: Option<&ResponseMeta>) -> Option<Value> {
        self.endpoint
            .parse_error
            .as_ref()
            .or(self.defaults.parse_error.as_ref())
            .map(|f| f(data, meta))
    }

    pub(crate) fn on_success(&self) -> Option<&Hook> {
        self.endpoint.on_success.as_ref().or(self.defaults.on_success.as_ref())
    }

    pub(crate) fn on_error(&self) -> Option<&Hook> {
        self.endpoint.on_error.as_ref().or(self.defaults.on_error.as_ref())
    }
}

/// Best-effort message extraction from an error body.
///
/// Tries, in order: `non_field_errors[0]`, `details[0]`, `detail`, the first
/// element of an array body, then `"<first key> <first value[0]>"`. Anything
/// else is returned unchanged.
pub fn default_parse_error(body: &Value) -> Value {
    if let Some(first) = body.get("non_field_errors").and_then(first_of) {
        return first;
    }
    if let Some(first) = body.get("details").and_then(first_of) {
        return first;
    }
    if let Some(detail) = body.get("detail").filter(|d| !d.is_null()) {
        return detail.clone();
    }
    match body {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        Value::Object(fields) => match fields.iter().next() {
            Some((key, value)) => {
                let first = first_of(value).unwrap_or_else(|| value.clone());
                let text = match first {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Value::String(format!("{} {}", key, text))
            }
            None => body.clone(),
        },
        other => other.clone(),
    }
}

fn first_of(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => items.first().cloned(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}
