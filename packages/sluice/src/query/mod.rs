//! Query toolkit: remote endpoints driven through the store.
//!
//! - [`transport`]: requests, responses, the [`Transport`] seam and [`BaseQuery`]
//! - [`endpoint`]: endpoint declarations, cache policy, hooks and api defaults
//! - [`state`]: per-endpoint state and its reducer
//! - [`api`]: [`QueryApi`], the registered api and its call surface
//!
//! The orchestrator that sequences cache, optimistic update, request and
//! state transitions is internal; it is installed by [`QueryApiBuilder::register`].

pub mod api;
pub mod endpoint;
mod orchestrator;
pub mod state;
pub mod transport;

pub use api::{QueryApi, QueryApiBuilder};
pub use endpoint::{default_parse_error, ApiDefaults, CachePolicy, Endpoint, HookApi, Mock};
pub use orchestrator::ListenerSlot;
pub use state::{EndpointAction, EndpointState, EndpointStatus, UnwrapResult};
pub use transport::{BaseQuery, Method, QueryError, QueryRequest, ReqwestTransport, Response, ResponseMeta, Transport};
