//! Listeners - observers notified after an action's reducer and interceptors.
//!
//! Listeners match on exact action types ([`ActionPattern`]). A `once`
//! listener is removed after the pass in which it fired, whether its callback
//! succeeded or failed. Only listeners that actually ran are removed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;
use uuid::Uuid;

use crate::core::{panic_message, Action, ActionPattern};
use crate::dispatch::lock;
use crate::error::{Result, SluiceError};

pub(crate) type ListenerCallback = Arc<dyn Fn(&Action) -> anyhow::Result<()> + Send + Sync>;

/// How long a listener stays registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Removed after the first matching action.
    Once,
    /// Stays until destroyed.
    Persistent,
}

#[derive(Clone)]
pub(crate) struct ListenerRecord {
    id: String,
    pattern: ActionPattern,
    callback: ListenerCallback,
    mode: ListenerMode,
    owner: String,
}

/// Flat collection of listener records.
#[derive(Default)]
pub struct ListenerRegistry {
    records: Vec<ListenerRecord>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    fn insert(&mut self, record: ListenerRecord) -> Result<()> {
        if self.contains(&record.id) {
            return Err(SluiceError::DuplicateListenerId { id: record.id });
        }
        self.records.push(record);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }

    fn matching(&self, action_type: &str) -> Vec<ListenerRecord> {
        self.records
            .iter()
            .filter(|r| r.pattern.matches(action_type))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.records.len())
            .finish()
    }
}

/// Shared handle to a listener registry.
pub(crate) type SharedListeners = Arc<Mutex<ListenerRegistry>>;

/// Register a listener and return its destroy handle.
pub(crate) fn register(
    registry: &SharedListeners,
    pattern: ActionPattern,
    callback: ListenerCallback,
    owner: &str,
    mode: ListenerMode,
    custom_id: Option<&str>,
) -> Result<ListenerHandle> {
    let id = custom_id
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    lock(registry).insert(ListenerRecord {
        id: id.clone(),
        pattern,
        callback,
        mode,
        owner: owner.to_string(),
    })?;

    Ok(ListenerHandle {
        id,
        registry: Arc::downgrade(registry),
    })
}

/// Run every listener matching `action`, then drop the `once` listeners that ran.
///
/// Callbacks run without the registry lock held, so they may register or
/// destroy listeners themselves.
pub(crate) fn notify(registry: &SharedListeners, action: &Action) {
    let matching = lock(registry).matching(action.action_type());
    if matching.is_empty() {
        return;
    }

    let mut fired_once = Vec::new();
    for record in &matching {
        let outcome = catch_unwind(AssertUnwindSafe(|| (record.callback)(action)))
            .map_err(|panic| anyhow::anyhow!("listener panicked: {}", panic_message(&panic)))
            .and_then(|result| result);

        if let Err(e) = outcome {
            warn!(
                listener = %record.id,
                owner = %record.owner,
                action_type = %action.action_type(),
                error = %e,
                "listener failed"
            );
        }

        if record.mode == ListenerMode::Once {
            fired_once.push(record.id.as_str());
        }
    }

    if !fired_once.is_empty() {
        let mut registry = lock(registry);
        for id in fired_once {
            registry.remove(id);
        }
    }
}

/// Returned by listener registration; [`destroy`](Self::destroy) removes the listener.
///
/// Dropping the handle leaves the listener registered.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: String,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn destroy(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(&self.id),
            None => false,
        }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| lock(&registry).contains(&self.id))
            .unwrap_or(false)
    }
}
