//! Room-related models

use serde::{Deserialize, Serialize};

/// Room (space) entity. Fields beyond these pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub room_type: Option<String>,
    pub last_activity: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
