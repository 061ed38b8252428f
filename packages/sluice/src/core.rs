//! Core value types for the sluice action pipeline.
//!
//! # Overview
//!
//! An [`ActionSpec`] is what callers hand to `dispatch`: a type string and an
//! optional JSON payload. The queue stamps it into an [`Action`], adding the
//! owning container name and a diagnostic [`ActionId`].
//!
//! Ordering is positional (queue order). The id exists only for logs and
//! correlation and must never be used to sort actions.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

/// Diagnostic identifier attached to every stamped action.
///
/// Built from the epoch-millisecond timestamp followed by two digits of random
/// jitter. Two actions stamped in the same millisecond may still collide,
/// which is acceptable because ids are never used for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a fresh id from the wall clock plus jitter.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        Self(format!("{}{:02}", millis, fastrand::u8(..100)))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action as submitted by a caller, before the queue stamps it.
///
/// # Example
///
/// ```ignore
/// use serde_json::json;
/// use sluice::ActionSpec;
///
/// let spec = ActionSpec::new("todos/added").with_payload(json!({ "title": "milk" }));
/// handle.dispatch(spec).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    /// The action type. An empty type is rejected at dispatch time.
    pub action_type: String,
    /// Optional JSON payload.
    pub payload: Option<Value>,
}

impl ActionSpec {
    /// Create a payload-less action of the given type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<&str> for ActionSpec {
    fn from(action_type: &str) -> Self {
        Self::new(action_type)
    }
}

impl From<String> for ActionSpec {
    fn from(action_type: String) -> Self {
        Self::new(action_type)
    }
}

/// A stamped action: immutable once created by the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    #[serde(rename = "type")]
    action_type: String,
    payload: Option<Value>,
    name: String,
    id: ActionId,
}

impl Action {
    pub(crate) fn stamp(spec: ActionSpec, owner: &str) -> Self {
        Self {
            action_type: spec.action_type,
            payload: spec.payload,
            name: owner.to_string(),
            id: ActionId::generate(),
        }
    }

    /// The action type.
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// The payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Name of the container this action was dispatched against.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Diagnostic id.
    pub fn id(&self) -> &ActionId {
        &self.id
    }

    /// Check the action type.
    pub fn is(&self, action_type: &str) -> bool {
        self.action_type == action_type
    }
}

/// One or more action types a listener subscribes to.
///
/// Matching is exact string membership; there is no globbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPattern(SmallVec<[String; 1]>);

impl ActionPattern {
    /// Does this pattern include `action_type`?
    pub fn matches(&self, action_type: &str) -> bool {
        self.0.iter().any(|t| t == action_type)
    }

    /// The action types in this pattern.
    pub fn types(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for ActionPattern {
    fn from(action_type: &str) -> Self {
        Self(SmallVec::from_elem(action_type.to_string(), 1))
    }
}

impl From<String> for ActionPattern {
    fn from(action_type: String) -> Self {
        Self(SmallVec::from_elem(action_type, 1))
    }
}

impl From<Vec<String>> for ActionPattern {
    fn from(types: Vec<String>) -> Self {
        Self(SmallVec::from_vec(types))
    }
}

impl From<&[&str]> for ActionPattern {
    fn from(types: &[&str]) -> Self {
        Self(types.iter().map(|t| t.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ActionPattern {
    fn from(types: [&str; N]) -> Self {
        Self(types.iter().map(|t| t.to_string()).collect())
    }
}

/// Which producer a persisted payload came from.
///
/// Set explicitly by whoever registers the container, so persistence never
/// has to guess a value's origin from its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// State fed by a websocket channel.
    Websocket,
    /// State owned by a query api (endpoint statuses and data).
    Rest,
    /// Plain reducer-managed state.
    #[default]
    Plain,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Websocket => write!(f, "websocket"),
            PayloadKind::Rest => write!(f, "rest"),
            PayloadKind::Plain => write!(f, "plain"),
        }
    }
}

/// A persisted container snapshot, tagged with its producer.
///
/// `derived` names the single state field that was persisted, when the
/// container persists one field instead of its whole state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persisted {
    pub kind: PayloadKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<String>,
}

impl Persisted {
    pub fn new(kind: PayloadKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            derived: None,
        }
    }

    pub fn with_derived(mut self, field: impl Into<String>) -> Self {
        self.derived = Some(field.into());
        self
    }
}

pub(crate) fn panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_panic_message_extracts_strings() {
        let err = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&err), "boom");

        let err = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&err), "code 7");
    }

    #[test]
    fn test_persisted_skips_empty_derived() {
        let record = Persisted::new(PayloadKind::Plain, json!([1, 2]));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, json!({ "kind": "plain", "payload": [1, 2] }));

        let back: Persisted = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);

        let derived = Persisted::new(PayloadKind::Rest, json!(3)).with_derived("count");
        assert_eq!(derived.derived.as_deref(), Some("count"));
    }

    #[test]
    fn test_stamp_carries_owner_and_payload() {
        let action = Action::stamp(
            ActionSpec::new("todos/added").with_payload(json!({ "title": "milk" })),
            "todos",
        );

        assert_eq!(action.action_type(), "todos/added");
        assert_eq!(action.name(), "todos");
        assert_eq!(action.payload(), Some(&json!({ "title": "milk" })));
        assert!(action.is("todos/added"));
        assert!(!action.id().as_str().is_empty());
    }

    #[test]
    fn test_action_id_is_numeric() {
        let id = ActionId::generate();
        assert!(id.as_str().chars().all(|c| c.is_ascii_digit()));
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn test_action_serializes_type_field() {
        let action = Action::stamp(ActionSpec::new("ping"), "net");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["name"], "net");
    }

    #[test]
    fn test_pattern_single_and_many() {
        let single = ActionPattern::from("a");
        assert!(single.matches("a"));
        assert!(!single.matches("b"));

        let many = ActionPattern::from(["a", "b"]);
        assert!(many.matches("a"));
        assert!(many.matches("b"));
        assert!(!many.matches("c"));
        assert_eq!(many.types().len(), 2);
    }

    #[test]
    fn test_pattern_is_exact_match() {
        let pattern = ActionPattern::from("users/load");
        assert!(!pattern.matches("users/load/start"));
        assert!(!pattern.matches("users"));
    }

    #[test]
    fn test_payload_kind_serde() {
        assert_eq!(serde_json::to_value(PayloadKind::Rest).unwrap(), json!("rest"));
        let kind: PayloadKind = serde_json::from_value(json!("websocket")).unwrap();
        assert_eq!(kind, PayloadKind::Websocket);
        assert_eq!(PayloadKind::default(), PayloadKind::Plain);
    }
}
