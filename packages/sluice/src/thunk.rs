//! Async thunks: an async payload creator wrapped in lifecycle actions.
//!
//! ```text
//! run(handle, payload)
//!     │
//!     ├─► <type>/pending   (payload)
//!     ├─► payload creator  (may dispatch through the handle)
//!     │
//!     ├─ ok:    <type>/fulfilled (result, mapped if a result mapper is set)
//!     └─ err:   <type>/rejected  (error message; panics included)
//! ```
//!
//! All three actions go through the container's reducer like any other.
//! Failures end as `rejected`; they never surface from [`AsyncThunk::run`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::container::ContainerHandle;
use crate::core::{panic_message, Action, ActionSpec};
use crate::error::Result;

type PayloadCreator = Arc<dyn Fn(Value, ContainerHandle) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type ResultMapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// An async operation that reports its progress as actions.
#[derive(Clone)]
pub struct AsyncThunk {
    action_type: String,
    payload_creator: PayloadCreator,
    result_mapper: Option<ResultMapper>,
}

impl AsyncThunk {
    pub fn new<F>(action_type: impl Into<String>, payload_creator: F) -> Self
    where
        F: Fn(Value, ContainerHandle) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self {
            action_type: action_type.into(),
            payload_creator: Arc::new(payload_creator),
            result_mapper: None,
        }
    }

    /// Shape the creator's result before it becomes the `fulfilled` payload.
    pub fn map_result<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.result_mapper = Some(Arc::new(f));
        self
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn pending(&self) -> String {
        format!("{}/pending", self.action_type)
    }

    pub fn fulfilled(&self) -> String {
        format!("{}/fulfilled", self.action_type)
    }

    pub fn rejected(&self) -> String {
        format!("{}/rejected", self.action_type)
    }

    /// Run against `handle`'s container.
    ///
    /// Resolves with the processed `fulfilled` or `rejected` action. Errors
    /// only when a dispatch itself is refused (e.g. the container is gone).
    pub async fn run(&self, handle: &ContainerHandle, payload: Value) -> Result<Action> {
        handle
            .dispatch(ActionSpec::new(self.pending()).with_payload(payload.clone()))
            .await?;

        let creator = self.payload_creator.clone();
        let owner = handle.clone();
        let outcome = AssertUnwindSafe(async move { creator(payload, owner).await })
            .catch_unwind()
            .await;

        let settled = match outcome {
            Ok(Ok(result)) => {
                let result = match &self.result_mapper {
                    Some(map) => map(result),
                    None => result,
                };
                ActionSpec::new(self.fulfilled()).with_payload(result)
            }
            Ok(Err(e)) => {
                debug!(thunk = %self.action_type, error = %e, "thunk rejected");
                ActionSpec::new(self.rejected()).with_payload(Value::String(format!("{:#}", e)))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(thunk = %self.action_type, panic = %message, "thunk panicked");
                ActionSpec::new(self.rejected()).with_payload(Value::String(message))
            }
        };

        handle.dispatch(settled).await
    }
}

impl std::fmt::Debug for AsyncThunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncThunk")
            .field("action_type", &self.action_type)
            .field("maps_result", &self.result_mapper.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::reducer;
    use crate::dispatch::Store;
    use crate::error::SluiceError;
    use anyhow::anyhow;
    use serde_json::json;

    /// Records every reduced action as `[type, payload]`.
    fn journal(store: &Store) -> ContainerHandle {
        store.register_container(
            "journal",
            reducer(|state, action| {
                let mut log = state["log"].as_array().cloned().unwrap_or_default();
                log.push(json!([action.action_type(), action.payload().cloned().unwrap_or(Value::Null)]));
                Ok(json!({ "log": log }))
            }),
            json!({ "log": [] }),
        )
    }

    #[tokio::test]
    async fn test_fulfilled_thunk_reduces_pending_then_fulfilled() {
        let store = Store::new();
        let handle = journal(&store);

        let thunk = AsyncThunk::new("users/fetch", |id, handle| {
            async move {
                handle.dispatch("users/progress").await?;
                Ok(json!({ "id": id, "name": "ada" }))
            }
            .boxed()
        })
        .map_result(|user| user["name"].clone());

        let settled = thunk.run(&handle, json!(7)).await.unwrap();
        assert_eq!(settled.action_type(), "users/fetch/fulfilled");

        assert_eq!(
            handle.value()["log"],
            json!([
                ["users/fetch/pending", 7],
                ["users/progress", null],
                ["users/fetch/fulfilled", "ada"]
            ])
        );
    }

    #[tokio::test]
    async fn test_failing_thunk_reduces_pending_then_rejected() {
        let store = Store::new();
        let handle = journal(&store);

        let thunk = AsyncThunk::new("users/save", |_, _| async { Err(anyhow!("quota exceeded")) }.boxed());
        let settled = thunk.run(&handle, json!({ "name": "ada" })).await.unwrap();

        assert_eq!(settled.action_type(), thunk.rejected());
        assert_eq!(
            handle.value()["log"],
            json!([
                ["users/save/pending", { "name": "ada" }],
                ["users/save/rejected", "quota exceeded"]
            ])
        );
    }

    #[tokio::test]
    async fn test_panicking_thunk_is_rejected() {
        let store = Store::new();
        let handle = journal(&store);

        let thunk = AsyncThunk::new("users/sync", |_, _| -> BoxFuture<'static, anyhow::Result<Value>> {
            panic!("lost connection");
        });
        let settled = thunk.run(&handle, Value::Null).await.unwrap();

        assert_eq!(settled.payload(), Some(&json!("lost connection")));
        assert_eq!(
            handle.value()["log"],
            json!([
                ["users/sync/pending", null],
                ["users/sync/rejected", "lost connection"]
            ])
        );
    }

    #[tokio::test]
    async fn test_thunk_against_destroyed_container_errors() {
        let store = Store::new();
        let handle = journal(&store);
        handle.destroy();

        let thunk = AsyncThunk::new("users/fetch", |_, _| async { Ok(Value::Null) }.boxed());
        let err = thunk.run(&handle, Value::Null).await.unwrap_err();
        assert!(matches!(err, SluiceError::InvalidOwner { .. }));
    }

    #[test]
    fn test_lifecycle_action_types() {
        let thunk = AsyncThunk::new("posts/load", |_, _| async { Ok(Value::Null) }.boxed());
        assert_eq!(thunk.action_type(), "posts/load");
        assert_eq!(thunk.pending(), "posts/load/pending");
        assert_eq!(thunk.fulfilled(), "posts/load/fulfilled");
        assert_eq!(thunk.rejected(), "posts/load/rejected");
    }
}
