//! Rooms API

use serde::Deserialize;

use super::messages::required;
use super::{ApiError, WebexClient};
use crate::models::message::ItemsResponse;
use crate::models::room::Room;

/// Filters for `GET /rooms`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomQuery {
    pub max: Option<usize>,
    /// `direct` or `group`
    #[serde(rename = "type")]
    pub room_type: Option<String>,
    /// `id`, `lastactivity` or `created`
    pub sort_by: Option<String>,
}

impl RoomQuery {
    fn to_params(&self) -> Result<Vec<(&'static str, String)>, ApiError> {
        let mut params = Vec::new();
        if let Some(max) = self.max.filter(|&max| max > 0) {
            params.push(("max", max.to_string()));
        }
        if let Some(kind) = &self.room_type {
            if !matches!(kind.as_str(), "direct" | "group") {
                return Err(ApiError::InvalidArgument(format!(
                    "room type must be 'direct' or 'group', got {:?}",
                    kind
                )));
            }
            params.push(("type", kind.clone()));
        }
        if let Some(sort) = &self.sort_by {
            if !matches!(sort.as_str(), "id" | "lastactivity" | "created") {
                return Err(ApiError::InvalidArgument(format!(
                    "sortBy must be 'id', 'lastactivity' or 'created', got {:?}",
                    sort
                )));
            }
            params.push(("sortBy", sort.clone()));
        }
        Ok(params)
    }
}

/// `GET /rooms`
pub async fn list_rooms(client: &WebexClient, query: &RoomQuery) -> Result<Vec<Room>, ApiError> {
    let params = query.to_params()?;
    let resp: ItemsResponse<Room> = client.get(&["rooms"], &params).await?;
    tracing::debug!("Listed {} rooms", resp.items.len());
    Ok(resp.items)
}

/// `GET /rooms/{id}`
pub async fn get_room(client: &WebexClient, room_id: &str) -> Result<Room, ApiError> {
    let id = required("roomId", room_id)?;
    client.get(&["rooms", id], &[]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_query_params() {
        let query = RoomQuery {
            max: Some(25),
            room_type: Some("group".into()),
            sort_by: Some("lastactivity".into()),
        };
        assert_eq!(
            query.to_params().unwrap(),
            vec![
                ("max", "25".to_string()),
                ("type", "group".to_string()),
                ("sortBy", "lastactivity".to_string()),
            ]
        );
        assert!(RoomQuery::default().to_params().unwrap().is_empty());
    }

    #[test]
    fn test_room_query_rejects_unknown_values() {
        let query = RoomQuery {
            room_type: Some("team".into()),
            ..Default::default()
        };
        assert_eq!(query.to_params().unwrap_err().kind(), "InvalidArgument");

        let query = RoomQuery {
            sort_by: Some("title".into()),
            ..Default::default()
        };
        assert!(query.to_params().is_err());
    }

    #[test]
    fn test_room_type_field_name() {
        let room: Room = serde_json::from_value(serde_json::json!({
            "id": "R1",
            "title": "Standup",
            "type": "group",
            "isLocked": false
        }))
        .unwrap();
        assert_eq!(room.room_type.as_deref(), Some("group"));
        assert_eq!(serde_json::to_value(&room).unwrap()["isLocked"], false);
    }
}
