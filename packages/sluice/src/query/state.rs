//! Endpoint state and the reducer that drives it.
//!
//! An api's container holds one [`EndpointState`] per endpoint:
//!
//! ```json
//! { "getThing": { "status": "completed", "data": { ... }, "error": null } }
//! ```
//!
//! Transitions, keyed by the action suffix:
//!
//! | Action          | status      | data          | error         |
//! |-----------------|-------------|---------------|---------------|
//! | `start`         | `loading`   | kept          | `null`        |
//! | `update`        | kept        | kept          | kept          |
//! | `completed`     | `completed` | payload       | `null`        |
//! | `optimistic`    | kept        | payload       | `null`        |
//! | `failed`        | `failed`    | kept          | payload       |
//! | `hydrate`       | `completed` | payload field | payload field |
//!
//! `failed` keeps `data` so that an optimistic rollback dispatched just before
//! it survives.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::Action;

/// Lifecycle of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    #[default]
    Idle,
    Loading,
    Completed,
    Failed,
}

/// Typed view of one endpoint's slice of state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointState {
    pub status: EndpointStatus,
    pub data: Value,
    pub error: Value,
}

impl EndpointState {
    /// Read `endpoint`'s slice out of an api container's state.
    pub fn from_container(state: &Value, endpoint: &str) -> Option<Self> {
        state
            .get(endpoint)
            .and_then(|slice| serde_json::from_value(slice.clone()).ok())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "data": self.data,
            "error": self.error,
        })
    }
}

/// Outcome of a one-shot call that bypasses the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrapResult {
    pub status: EndpointStatus,
    pub data: Value,
    pub error: Value,
}

impl UnwrapResult {
    pub fn completed(data: Value) -> Self {
        Self {
            status: EndpointStatus::Completed,
            data,
            error: Value::Null,
        }
    }

    pub fn failed(error: Value) -> Self {
        Self {
            status: EndpointStatus::Failed,
            data: Value::Null,
            error,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == EndpointStatus::Completed
    }
}

/// The actions every endpoint understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointAction {
    Start,
    Update,
    Completed,
    Optimistic,
    Failed,
    Hydrate,
}

impl EndpointAction {
    pub const ALL: [EndpointAction; 6] = [
        EndpointAction::Start,
        EndpointAction::Update,
        EndpointAction::Completed,
        EndpointAction::Optimistic,
        EndpointAction::Failed,
        EndpointAction::Hydrate,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            EndpointAction::Start => "start",
            EndpointAction::Update => "update",
            EndpointAction::Completed => "completed",
            EndpointAction::Optimistic => "optimistic",
            EndpointAction::Failed => "failed",
            EndpointAction::Hydrate => "hydrate",
        }
    }

    /// `<endpoint>/<suffix>`.
    pub fn action_type(&self, endpoint: &str) -> String {
        format!("{}/{}", endpoint, self.suffix())
    }

    /// Split an action type into endpoint name and action.
    pub fn parse(action_type: &str) -> Option<(&str, EndpointAction)> {
        let (endpoint, suffix) = action_type.rsplit_once('/')?;
        let action = Self::ALL.into_iter().find(|a| a.suffix() == suffix)?;
        Some((endpoint, action))
    }
}

impl fmt::Display for EndpointAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Every endpoint idle, no data, no error.
pub fn initial_state<'a>(endpoints: impl IntoIterator<Item = &'a str>) -> Value {
    let slices: Map<String, Value> = endpoints
        .into_iter()
        .map(|name| (name.to_string(), EndpointState::default().to_value()))
        .collect();
    Value::Object(slices)
}

/// Reduce an endpoint action into `{ endpoint: new_slice }`.
///
/// Returns `Null` (a no-op for the container) for actions that are not
/// endpoint actions, for endpoints this state does not hold, and for `update`.
pub fn endpoint_reducer(state: &Value, action: &Action) -> Value {
    let Some((endpoint, kind)) = EndpointAction::parse(action.action_type()) else {
        return Value::Null;
    };
    let Some(Value::Object(current)) = state.get(endpoint) else {
        return Value::Null;
    };

    let payload = action.payload().cloned().unwrap_or(Value::Null);
    let mut next = current.clone();

    match kind {
        EndpointAction::Update => return Value::Null,
        EndpointAction::Start => {
            next.insert("status".into(), json!(EndpointStatus::Loading));
            next.insert("error".into(), Value::Null);
        }
        EndpointAction::Completed => {
            next.insert("status".into(), json!(EndpointStatus::Completed));
            next.insert("data".into(), payload);
            next.insert("error".into(), Value::Null);
        }
        EndpointAction::Optimistic => {
            next.insert("data".into(), payload);
            next.insert("error".into(), Value::Null);
        }
        EndpointAction::Failed => {
            next.insert("status".into(), json!(EndpointStatus::Failed));
            next.insert("error".into(), payload);
        }
        EndpointAction::Hydrate => {
            next.insert("status".into(), json!(EndpointStatus::Completed));
            next.insert("error".into(), Value::Null);
            if let Value::Object(fields) = payload {
                next.extend(fields);
            }
        }
    }

    let mut patch = Map::new();
    patch.insert(endpoint.to_string(), Value::Object(next));
    Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActionSpec;

    fn act(action_type: &str, payload: Option<Value>) -> Action {
        let mut spec = ActionSpec::new(action_type);
        spec.payload = payload;
        Action::stamp(spec, "api")
    }

    fn state() -> Value {
        initial_state(["getThing", "listThings"])
    }

    #[test]
    fn test_initial_state_is_idle() {
        let s = state();
        let slice = EndpointState::from_container(&s, "getThing").unwrap();
        assert_eq!(slice, EndpointState::default());
        assert_eq!(s["listThings"]["status"], "idle");
    }

    #[test]
    fn test_parse_action_types() {
        assert_eq!(
            EndpointAction::parse("getThing/start"),
            Some(("getThing", EndpointAction::Start))
        );
        assert_eq!(
            EndpointAction::parse("api/v2/hydrate"),
            Some(("api/v2", EndpointAction::Hydrate))
        );
        assert_eq!(EndpointAction::parse("getThing/unknown"), None);
        assert_eq!(EndpointAction::parse("plain"), None);
        assert_eq!(EndpointAction::Failed.action_type("x"), "x/failed");
    }

    #[test]
    fn test_start_then_completed() {
        let s = state();
        let patch = endpoint_reducer(&s, &act("getThing/start", None));
        assert_eq!(patch["getThing"]["status"], "loading");
        assert!(patch.get("listThings").is_none());

        let patch = endpoint_reducer(&s, &act("getThing/completed", Some(json!({ "id": 1 }))));
        assert_eq!(
            patch,
            json!({ "getThing": { "status": "completed", "data": { "id": 1 }, "error": null } })
        );
    }

    #[test]
    fn test_failed_keeps_data() {
        let s = json!({ "getThing": { "status": "loading", "data": [1, 2], "error": null } });
        let patch = endpoint_reducer(&s, &act("getThing/failed", Some(json!("boom"))));
        assert_eq!(
            patch,
            json!({ "getThing": { "status": "failed", "data": [1, 2], "error": "boom" } })
        );
    }

    #[test]
    fn test_optimistic_keeps_status() {
        let s = json!({ "getThing": { "status": "completed", "data": 1, "error": "old" } });
        let patch = endpoint_reducer(&s, &act("getThing/optimistic", Some(json!(2))));
        assert_eq!(
            patch,
            json!({ "getThing": { "status": "completed", "data": 2, "error": null } })
        );
    }

    #[test]
    fn test_hydrate_merges_payload() {
        let patch = endpoint_reducer(&state(), &act("getThing/hydrate", Some(json!({ "data": "cached" }))));
        assert_eq!(
            patch,
            json!({ "getThing": { "status": "completed", "data": "cached", "error": null } })
        );

        let patch = endpoint_reducer(
            &state(),
            &act("getThing/hydrate", Some(json!({ "status": "loading", "data": null }))),
        );
        assert_eq!(patch["getThing"]["status"], "loading");
    }

    #[test]
    fn test_unrelated_actions_are_noops() {
        assert_eq!(endpoint_reducer(&state(), &act("getThing/update", None)), Value::Null);
        assert_eq!(endpoint_reducer(&state(), &act("other/start", None)), Value::Null);
        assert_eq!(endpoint_reducer(&state(), &act("reset", None)), Value::Null);
    }
}
