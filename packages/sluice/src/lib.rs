//! # Sluice
//!
//! A queue-driven action pipeline with interceptors, listeners, and a query
//! cache engine.
//!
//! ## Core Concepts
//!
//! State lives in named **containers**. Nothing mutates a container directly:
//! - An [`Action`] is dispatched to an owner container through the [`Store`]
//! - The owner's [`Reducer`] derives the next state from a snapshot
//! - **Interceptors** run side effects for the action and may dispatch more
//! - **Listeners** observe processed actions across all containers
//!
//! The key principle: **reducers apply in dispatch order, always**. Async work
//! started by interceptors may overlap; state transitions never reorder.
//!
//! ## Architecture
//!
//! ```text
//! Caller / interceptor
//!     │
//!     ▼ dispatch(action, owner)
//! ActionQueue (FIFO) ◄──────────────────────────────┐
//!     │                                             │
//!     ▼ drain task, one entry at a time             │
//!     ├─► reducer(snapshot, action) ─► merge        │
//!     │                                             │
//!     ├─► interceptor chain ──────── dispatch() ────┤
//!     │     pre ─► post (smart: fulfilled/rejected) │
//!     │                                             │
//!     ├─► listeners (once listeners removed first)  │
//!     │                                             │
//!     └─► resolve caller's future                   │
//!                                                   │
//! QueryApi                                          │
//!     call() ─► <endpoint>/start ───────────────────┘
//!                  │ orchestrator interceptor
//!                  ├─► CacheEngine hit ─► <endpoint>/hydrate
//!                  └─► BaseQuery ─► Transport ─► <endpoint>/completed | /failed
//! ```
//!
//! ## Key Invariants
//!
//! 1. **FIFO reducers** - Actions reduce in the order they were enqueued
//! 2. **Validate before enqueue** - Unknown owners fail without touching the queue
//! 3. **Once means once** - A once listener is gone before the action's dispatch resolves
//! 4. **Store-scoped** - Registries belong to a store; two stores never interact
//!
//! ## Example
//!
//! ```ignore
//! use sluice::{reducer, BaseQuery, CachePolicy, Endpoint, Expiry, QueryApi, QueryRequest, Store};
//! use serde_json::json;
//!
//! let store = Store::new();
//!
//! // 1. Plain container
//! let counter = store.register_container(
//!     "counter",
//!     reducer(|state, action| {
//!         let n = state["count"].as_i64().unwrap_or(0);
//!         Ok(match action.action_type() {
//!             "increment" => json!({ "count": n + 1 }),
//!             _ => state.clone(),
//!         })
//!     }),
//!     json!({ "count": 0 }),
//! );
//! counter.dispatch("increment").await?;
//!
//! // 2. Query api
//! let api = QueryApi::builder("things")
//!     .base_query(BaseQuery::new("https://api.example.com"))
//!     .endpoint(
//!         "getThing",
//!         Endpoint::query(|id| QueryRequest::get(format!("/things/{}", id)))
//!             .cache(CachePolicy::new("thing").ttl(|_| Expiry::from_millis(1000))),
//!     )
//!     .register(&store)
//!     .await?;
//!
//! api.call("getThing", json!("x")).await?;
//! store.settle().await;
//! assert_eq!(api.state("getThing")?.data["id"], "x");
//! ```

// Core modules
mod cache;
mod config;
mod container;
mod core;
mod dispatch;
mod error;
mod interceptor;
mod listener;
mod persist;
mod queue;
mod thunk;

// Remote endpoints over the store
pub mod query;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{Action, ActionId, ActionPattern, ActionSpec, PayloadKind, Persisted};

// Re-export store and containers
pub use crate::container::{merge_state, reducer, ContainerHandle, Reducer, StateContainer};
pub use crate::dispatch::{Store, WeakStore};
pub use crate::queue::{ActionQueue, QueueOp, QueuedEntry};
pub use crate::thunk::AsyncThunk;

// Re-export interceptors and listeners
pub use crate::interceptor::{InterceptorApi, InterceptorRecord, InterceptorRegistry, Phase, SmartInterceptor};
pub use crate::listener::{ListenerHandle, ListenerMode, ListenerRegistry};

// Re-export persistence and cache
pub use crate::cache::{
    canonicalize, compose_cache_key, CacheAdapter, CacheEngine, CacheEntry, CacheKey, Clock, Expiry, MemoryCache,
    Refetch, SweepReport, SweeperHandle, SystemClock, MIN_SWEEP_INTERVAL,
};
pub use crate::persist::{MemoryAdapter, PersistConfig, PersistenceAdapter};

// Re-export query surface
pub use crate::query::{
    ApiDefaults, BaseQuery, CachePolicy, Endpoint, EndpointState, EndpointStatus, Mock, QueryApi, QueryRequest,
    Response, Transport,
};

// Re-export config and errors
pub use crate::config::StoreConfig;
pub use crate::error::{Result, SluiceError};

// Re-export async_trait for adapter implementations
pub use async_trait::async_trait;
