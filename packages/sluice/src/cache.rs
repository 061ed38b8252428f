//! Cache & invalidation engine for query endpoints.
//!
//! # Overview
//!
//! Entries are addressed by `(endpoint, composite key)`. Each entry records
//! when it was written, how long it stays fresh ([`Expiry`]), whether the
//! sweeper should refetch it on expiry, and the tag it belongs to.
//!
//! ```text
//!                ┌────────────────────┐
//!  endpoint ────▶│  CacheAdapter      │◀──── sweeper (every sweep_interval)
//!  (read/write)  │  endpoint → key →  │        │ expired + auto_refresh
//!                │     CacheEntry     │        ▼
//!                └────────────────────┘   tag refetch ──▶ dispatch <endpoint>/update
//! ```
//!
//! Tags map to the refetch closure registered by the most recent call
//! carrying that tag. Invalidating a tag nobody registered is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SluiceError};

// =============================================================================
// Entries
// =============================================================================

/// How long an entry stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiry {
    /// Never expires; exempt from sweeping.
    Never,
    /// Expires this long after `last_updated`.
    After(Duration),
}

impl Expiry {
    pub fn from_millis(ms: u64) -> Self {
        Expiry::After(Duration::from_millis(ms))
    }
}

/// One cached endpoint result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `None` while the first fetch for this key is in flight.
    pub data: Option<Value>,
    pub last_updated: DateTime<Utc>,
    pub expire: Expiry,
    pub auto_refresh: bool,
    pub tag: Option<String>,
}

impl CacheEntry {
    /// An entry with no data yet, stamped at `now`.
    pub fn pending(now: DateTime<Utc>, expire: Expiry, auto_refresh: bool, tag: Option<String>) -> Self {
        Self {
            data: None,
            last_updated: now,
            expire,
            auto_refresh,
            tag,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Strictly past `last_updated + expire`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expire {
            Expiry::Never => false,
            Expiry::After(ttl) => TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| self.last_updated.checked_add_signed(ttl))
                .map(|deadline| deadline < now)
                .unwrap_or(false),
        }
    }
}

// =============================================================================
// Composite keys
// =============================================================================

/// Stable string form of a JSON value: object keys sorted, nested values canonicalized.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", k, canonicalize(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

/// Combine a literal cache key with call arguments.
///
/// `Null` arguments mean "no arguments" and yield the bare key.
pub fn compose_cache_key(key: &str, args: &Value) -> String {
    match args {
        Value::Null => key.to_string(),
        other => format!("{}-{}", key, canonicalize(other)),
    }
}

/// An endpoint's declared cache key.
#[derive(Clone)]
pub enum CacheKey {
    /// Combined with the call arguments via [`compose_cache_key`].
    Literal(String),
    /// Computed from the call arguments; used as is.
    Derived(Arc<dyn Fn(&Value) -> String + Send + Sync>),
}

impl CacheKey {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        CacheKey::Derived(Arc::new(f))
    }

    /// The composite key for one call.
    pub fn resolve(&self, args: &Value) -> String {
        match self {
            CacheKey::Literal(key) => compose_cache_key(key, args),
            CacheKey::Derived(f) => f(args),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        CacheKey::Literal(key.to_string())
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            CacheKey::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Pluggable storage for cache entries.
#[async_trait]
pub trait CacheAdapter: Send + Sync + 'static {
    async fn read(&self, endpoint: &str, key: &str) -> anyhow::Result<Option<CacheEntry>>;

    async fn write(&self, endpoint: &str, key: &str, entry: CacheEntry) -> anyhow::Result<()>;

    async fn remove(&self, endpoint: &str, key: &str) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;

    async fn endpoints(&self) -> anyhow::Result<Vec<String>>;

    async fn keys(&self, endpoint: &str) -> anyhow::Result<Vec<String>>;
}

/// Default in-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn read(&self, endpoint: &str, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .get(endpoint)
            .and_then(|by_key| by_key.get(key).cloned()))
    }

    async fn write(&self, endpoint: &str, key: &str, entry: CacheEntry) -> anyhow::Result<()> {
        self.entries
            .entry(endpoint.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, endpoint: &str, key: &str) -> anyhow::Result<()> {
        if let Some(mut by_key) = self.entries.get_mut(endpoint) {
            by_key.remove(key);
        }
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        for mut by_key in self.entries.iter_mut() {
            by_key.clear();
        }
        Ok(())
    }

    async fn endpoints(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn keys(&self, endpoint: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .entries
            .get(endpoint)
            .map(|by_key| by_key.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A tag's refetch: evict the tagged entry and re-dispatch the endpoint.
pub type Refetch = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub refreshed: usize,
}

/// Shortest period the sweeper accepts; `tokio::time::interval` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Cache adapter + clock + tag registry.
pub struct CacheEngine {
    adapter: Arc<dyn CacheAdapter>,
    clock: Arc<dyn Clock>,
    tags: DashMap<String, Refetch>,
    sweeper: OnceLock<SweeperHandle>,
}

impl CacheEngine {
    pub fn new(adapter: Arc<dyn CacheAdapter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            adapter,
            clock,
            tags: DashMap::new(),
            sweeper: OnceLock::new(),
        }
    }

    /// In-memory cache on the wall clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()), Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn read(&self, endpoint: &str, key: &str) -> Result<Option<CacheEntry>> {
        self.adapter.read(endpoint, key).await.map_err(SluiceError::cache)
    }

    pub async fn write(&self, endpoint: &str, key: &str, entry: CacheEntry) -> Result<()> {
        trace!(endpoint, key, "cache write");
        self.adapter
            .write(endpoint, key, entry)
            .await
            .map_err(SluiceError::cache)
    }

    pub async fn remove(&self, endpoint: &str, key: &str) -> Result<()> {
        trace!(endpoint, key, "cache remove");
        self.adapter.remove(endpoint, key).await.map_err(SluiceError::cache)
    }

    pub async fn clear(&self) -> Result<()> {
        self.adapter.clear().await.map_err(SluiceError::cache)
    }

    pub async fn endpoints(&self) -> Result<Vec<String>> {
        self.adapter.endpoints().await.map_err(SluiceError::cache)
    }

    pub async fn keys(&self, endpoint: &str) -> Result<Vec<String>> {
        self.adapter.keys(endpoint).await.map_err(SluiceError::cache)
    }

    /// Point `tag` at `refetch`, replacing any earlier registration.
    pub fn register_tag(&self, tag: &str, refetch: Refetch) {
        self.tags.insert(tag.to_string(), refetch);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// Fire the refetch of every registered tag in `tags`. Unknown tags are skipped.
    pub async fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) {
        for tag in tags {
            let tag = tag.as_ref();
            // Clone out so no map guard is held across the await.
            let refetch = self.tags.get(tag).map(|r| r.value().clone());
            match refetch {
                Some(refetch) => {
                    debug!(tag, "invalidating tag");
                    refetch().await;
                }
                None => trace!(tag, "tag not registered, nothing to invalidate"),
            }
        }
    }

    /// Evict expired entries, refetching the auto-refresh ones first.
    ///
    /// After a refetch the entry is only evicted if it is still expired, so a
    /// refetch that already wrote fresh data keeps it.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.now();

        for endpoint in self.endpoints().await? {
            for key in self.keys(&endpoint).await? {
                let Some(entry) = self.read(&endpoint, &key).await? else {
                    continue;
                };
                if !entry.is_expired(now) {
                    continue;
                }

                if entry.auto_refresh {
                    if let Some(tag) = &entry.tag {
                        self.invalidate_tags(&[tag]).await;
                        report.refreshed += 1;
                    }
                    let still_stale = self
                        .read(&endpoint, &key)
                        .await?
                        .map(|current| current.is_expired(self.now()))
                        .unwrap_or(false);
                    if !still_stale {
                        continue;
                    }
                }

                self.remove(&endpoint, &key).await?;
                report.evicted += 1;
            }
        }

        if report != SweepReport::default() {
            debug!(evicted = report.evicted, refreshed = report.refreshed, "cache sweep");
        }
        Ok(report)
    }

    /// Start the engine's own sweeper unless one is already running.
    ///
    /// Apis sharing an engine share this sweeper; it stops with the engine.
    /// Returns whether this call started it.
    pub fn ensure_sweeper(self: &Arc<Self>, interval: Duration) -> bool {
        let mut started = false;
        self.sweeper.get_or_init(|| {
            started = true;
            self.spawn_sweeper(interval)
        });
        started
    }

    /// Sweep every `interval` until the handle is dropped or the engine is gone.
    ///
    /// Intervals below [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = if interval < MIN_SWEEP_INTERVAL {
            warn!(interval_ms = interval.as_millis() as u64, "sweep interval too short, using minimum");
            MIN_SWEEP_INTERVAL
        } else {
            interval
        };
        let engine: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "cache sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.sweep().await {
                    warn!(error = %e, "cache sweep failed");
                }
            }
            info!("cache sweeper stopped");
        });
        SweeperHandle { task }
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("tags", &self.tags.len())
            .field("sweeping", &self.sweeper.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Stops the sweeper when dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
