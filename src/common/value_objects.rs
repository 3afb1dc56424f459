use crate::common::dateutils::utcnow;
use crate::types::base_enum::BaseEnum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A caller's request to fire a state-machine trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub action_datetime: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActionRequest {
    pub fn new<A: BaseEnum>(action: A) -> Self {
        Self::named(action.value())
    }

    pub fn named(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            action_datetime: utcnow(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn data(&self) -> serde_json::Value {
        serde_json::json!({
            "action": self.action,
            "action_datetime": self.action_datetime.to_rfc3339(),
            "payload": self.payload,
        })
    }
}

/// Outcome of one successful `act()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub action_request: serde_json::Value,
    pub old_state: String,
    pub new_state: String,
}

impl ActionLog {
    pub fn data(&self) -> serde_json::Value {
        serde_json::json!({
            "action_request": self.action_request,
            "old_state": self.old_state,
            "new_state": self.new_state,
        })
    }
}
