//! Structured errors for sluice.
//!
//! `SluiceError` is the boundary error type: everything a caller of the public
//! API can observe as a failure is one of its variants.
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is internal transport (reducers, interceptors, hooks, adapters)
//! - `SluiceError` is what crosses the public API
//!
//! Reducer, interceptor and listener failures never reach the caller of
//! `dispatch`. They are logged and, for endpoints, turned into a `failed`
//! state transition.
//!
//! # Example
//!
//! ```ignore
//! use sluice::SluiceError;
//!
//! match store.dispatch("users/load", "nope").await {
//!     Err(SluiceError::InvalidOwner { name }) => eprintln!("no container {}", name),
//!     Err(e) => eprintln!("dispatch failed: {}", e),
//!     Ok(action) => println!("processed {}", action.id()),
//! }
//! ```

use thiserror::Error;

use crate::query::QueryError;

/// Convenience alias for results at the public boundary.
pub type Result<T, E = SluiceError> = std::result::Result<T, E>;

/// Structured error type for sluice operations.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// Dispatch against a container name that has no registered reducer.
    #[error("no container registered under {name:?}")]
    InvalidOwner {
        /// The unknown container name.
        name: String,
    },

    /// Dispatch with an empty action type.
    #[error("action dispatched to {owner:?} has no type")]
    UndefinedActionType {
        /// Container the action was addressed to.
        owner: String,
    },

    /// A caller-supplied listener id is already taken.
    #[error("listener id {id:?} is already registered")]
    DuplicateListenerId {
        /// The colliding id.
        id: String,
    },

    /// Dequeue on an empty queue. Non-fatal inside the drain loop.
    #[error("there are no actions in the queue")]
    EmptyQueue,

    /// A query api was asked for an endpoint it does not declare.
    #[error("query api {api:?} has no endpoint {endpoint:?}")]
    UnknownEndpoint {
        /// Reducer path of the api.
        api: String,
        /// The requested endpoint name.
        endpoint: String,
    },

    /// Non-2xx or non-JSON response.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The transport failed before any response existed.
    #[error("transport failure: {message}")]
    Transport {
        /// The underlying error message.
        message: String,
    },

    /// A persistence adapter failed.
    #[error("persistence failure: {message}")]
    Persistence {
        /// The underlying error message.
        message: String,
    },

    /// A cache adapter failed.
    #[error("cache failure: {message}")]
    Cache {
        /// The underlying error message.
        message: String,
    },

    /// The store was dropped before the action was processed.
    #[error("store dropped before the action was processed")]
    Dropped,
}

impl SluiceError {
    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        SluiceError::Persistence {
            message: err.to_string(),
        }
    }

    pub(crate) fn cache(err: impl std::fmt::Display) -> Self {
        SluiceError::Cache {
            message: err.to_string(),
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        SluiceError::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ResponseMeta;
    use serde_json::json;

    #[test]
    fn test_invalid_owner_display() {
        let err = SluiceError::InvalidOwner {
            name: "todos".into(),
        };
        assert!(err.to_string().contains("no container"));
        assert!(err.to_string().contains("todos"));
    }

    #[test]
    fn test_empty_queue_display() {
        assert_eq!(
            SluiceError::EmptyQueue.to_string(),
            "there are no actions in the queue"
        );
    }

    #[test]
    fn test_query_error_is_transparent() {
        let err: SluiceError = QueryError::new(json!({ "detail": "nope" }), ResponseMeta::new(404)).into();
        assert!(err.to_string().contains("404"));
        match err {
            SluiceError::Query(q) => assert_eq!(q.data["detail"], "nope"),
            _ => panic!("Expected Query"),
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = SluiceError::DuplicateListenerId { id: "dup".into() }.into();

        match err.downcast_ref::<SluiceError>() {
            Some(SluiceError::DuplicateListenerId { id }) => assert_eq!(id, "dup"),
            _ => panic!("Expected DuplicateListenerId"),
        }
    }

    #[test]
    fn test_helpers_capture_message() {
        let err = SluiceError::cache("disk full");
        assert!(matches!(err, SluiceError::Cache { ref message } if message == "disk full"));
        let err = SluiceError::persistence(anyhow::anyhow!("locked"));
        assert!(err.to_string().contains("locked"));
    }
}
