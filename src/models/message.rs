//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as returned by the messages API.
///
/// Only `id` and `created` are interpreted; every other field, including
/// ones not listed here, is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Compact view of a message for listing output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub person_email: Option<String>,
    pub created: DateTime<Utc>,
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl From<&Message> for MessageSummary {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            person_email: msg.person_email.clone(),
            created: msg.created,
            text: msg.text.clone(),
            parent_id: msg.parent_id.clone(),
        }
    }
}

/// List response envelope shared by the collection endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemsResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
