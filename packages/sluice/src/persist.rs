//! Persistence for containers that survive restarts.
//!
//! # The Contract
//!
//! 1. **Hydrate on register.** If the adapter holds a record for the
//!    container name and its [`PayloadKind`] matches, it is merged into state
//!    before the handle is returned.
//!
//! 2. **Write on change.** Every state change (and the state at registration)
//!    is written back as a [`Persisted`] record.
//!
//! 3. **Stop on destroy.** Destroying or re-registering a container aborts
//!    its writer, so the reset to initial state is never persisted.
//!
//! With a `derived` field configured only that field is persisted, and
//! hydration restores it as `{ field: payload }`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::container::StateContainer;
use crate::core::{PayloadKind, Persisted};
use crate::error::{Result, SluiceError};

/// Key-value backend for persisted container state.
///
/// Implementations may be synchronous underneath; the store always awaits them.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync + 'static {
    async fn read(&self, key: &str) -> anyhow::Result<Option<Persisted>>;

    async fn write(&self, key: &str, value: Persisted) -> anyhow::Result<()>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;

    async fn keys(&self) -> anyhow::Result<Vec<String>>;

    async fn has_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.read(key).await?.is_some())
    }
}

/// In-memory adapter backed by a `DashMap`. Useful for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    records: DashMap<String, Persisted>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn read(&self, key: &str) -> anyhow::Result<Option<Persisted>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn write(&self, key: &str, value: Persisted) -> anyhow::Result<()> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.records.clear();
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.records.iter().map(|r| r.key().clone()).collect())
    }

    async fn has_key(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.records.contains_key(key))
    }
}

/// How a container is persisted.
#[derive(Clone)]
pub struct PersistConfig {
    adapter: Arc<dyn PersistenceAdapter>,
    kind: PayloadKind,
    derived: Option<String>,
}

impl PersistConfig {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            adapter,
            kind: PayloadKind::default(),
            derived: None,
        }
    }

    /// Tag records with the producer kind.
    pub fn kind(mut self, kind: PayloadKind) -> Self {
        self.kind = kind;
        self
    }

    /// Persist only this state field.
    pub fn derived(mut self, field: impl Into<String>) -> Self {
        self.derived = Some(field.into());
        self
    }

    pub fn adapter(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.adapter
    }

    fn snapshot(&self, state: &Value) -> Persisted {
        match &self.derived {
            Some(field) => Persisted::new(self.kind, state.get(field).cloned().unwrap_or(Value::Null))
                .with_derived(field.clone()),
            None => Persisted::new(self.kind, state.clone()),
        }
    }
}

impl std::fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistConfig")
            .field("kind", &self.kind)
            .field("derived", &self.derived)
            .finish_non_exhaustive()
    }
}

/// Merge the stored record for `name` into `state`, if there is one.
pub(crate) async fn hydrate(config: &PersistConfig, name: &str, state: &StateContainer) -> Result<()> {
    let record = config
        .adapter
        .read(name)
        .await
        .map_err(SluiceError::persistence)?;

    let Some(record) = record else {
        debug!(container = %name, "nothing persisted yet");
        return Ok(());
    };

    if record.kind != config.kind {
        warn!(
            container = %name,
            stored = %record.kind,
            expected = %config.kind,
            "ignoring persisted record of another kind"
        );
        return Ok(());
    }

    let patch = match &config.derived {
        Some(field) => {
            let mut map = Map::new();
            map.insert(field.clone(), record.payload);
            Value::Object(map)
        }
        None => record.payload,
    };
    state.update(move |_| patch);
    debug!(container = %name, "hydrated from persistence");
    Ok(())
}

/// Write the current state, then every change, until aborted or the container is dropped.
pub(crate) fn spawn_writer(config: PersistConfig, name: String, mut rx: watch::Receiver<Value>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let record = config.snapshot(&rx.borrow_and_update());
            if let Err(e) = config.adapter.write(&name, record).await {
                warn!(container = %name, error = %e, "failed to persist state");
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
