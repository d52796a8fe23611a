//! Messages API and time-bounded history retrieval

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, WebexClient};
use crate::models::message::{ItemsResponse, Message};

/// Largest batch the messages endpoint returns per request.
pub const PAGE_SIZE: usize = 100;

/// Upper bound on batch requests for one `list_since` call.
pub const MAX_PAGES: usize = 20;

/// Parameters of one `GET /messages` request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageQuery {
    pub room_id: String,
    pub parent_id: Option<String>,
    pub mentioned_people: Option<String>,
    pub before: Option<String>,
    pub before_message: Option<String>,
    pub max: Option<usize>,
}

impl MessageQuery {
    fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("roomId", self.room_id.clone())];
        let optional = [
            ("parentId", &self.parent_id),
            ("mentionedPeople", &self.mentioned_people),
            ("before", &self.before),
            ("beforeMessage", &self.before_message),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.push((key, value.clone()));
            }
        }
        if let Some(max) = self.max {
            params.push(("max", max.to_string()));
        }
        params
    }
}

/// Source of message batches, newest first.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, ApiError>;
}

#[async_trait]
impl MessageSource for WebexClient {
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, ApiError> {
        let resp: ItemsResponse<Message> = self.get(&["messages"], &query.to_params()).await?;
        Ok(resp.items)
    }
}

/// A `list_since` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub room_id: String,
    /// Inclusive lower bound on `created`
    pub after: Option<String>,
    pub max: Option<usize>,
    pub parent_id: Option<String>,
    pub mentioned_people: Option<String>,
    pub before: Option<String>,
    pub before_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOutcome {
    pub items: Vec<Message>,
    pub count: usize,
    pub truncated_by_max: bool,
}

impl ListOutcome {
    fn new(mut items: Vec<Message>, max: Option<usize>) -> Self {
        let truncated_by_max = match max {
            Some(max) if max > 0 && items.len() > max => {
                items.truncate(max);
                true
            }
            _ => false,
        };
        Self {
            count: items.len(),
            items,
            truncated_by_max,
        }
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_time_bound(value: &str) -> Result<DateTime<Utc>, ApiError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| ApiError::InvalidTimeBound {
            value: value.to_string(),
        })
}

/// Collect a room's messages created at or after `request.after`, newest
/// first, following `beforeMessage` cursors across batches.
///
/// Stops at the first message older than the bound, once `max` items are
/// collected, when the history is exhausted, or after [`MAX_PAGES`]
/// batches. Without an `after` bound (or with `max == 0`) a single batch
/// is fetched.
pub async fn list_since<S: MessageSource + ?Sized>(
    source: &S,
    request: &ListRequest,
) -> Result<ListOutcome, ApiError> {
    if request.room_id.trim().is_empty() {
        return Err(ApiError::InvalidArgument("roomId is required".into()));
    }
    let after = request.after.as_deref().map(parse_time_bound).transpose()?;
    let before = request
        .before
        .as_deref()
        .map(parse_time_bound)
        .transpose()?
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true));

    let base = MessageQuery {
        room_id: request.room_id.clone(),
        parent_id: request.parent_id.clone(),
        mentioned_people: request.mentioned_people.clone(),
        before,
        before_message: request.before_message.clone(),
        max: None,
    };

    let after = match after {
        Some(after) if request.max != Some(0) => after,
        after => {
            let query = MessageQuery {
                max: request.max.filter(|&max| max > 0),
                ..base
            };
            let mut items = source.list_messages(&query).await?;
            if let Some(after) = after {
                if let Some(end) = items.iter().position(|msg| msg.created < after) {
                    items.truncate(end);
                }
            }
            return Ok(ListOutcome::new(items, request.max));
        }
    };

    let mut collected: Vec<Message> = Vec::new();
    let mut cursor = request.before_message.clone();

    for page in 0..MAX_PAGES {
        let query = MessageQuery {
            before_message: cursor.clone(),
            max: Some(PAGE_SIZE),
            ..base.clone()
        };
        let batch = source.list_messages(&query).await?;
        tracing::debug!("Fetched {} messages (page {})", batch.len(), page + 1);

        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();
        cursor = batch.last().map(|msg| msg.id.clone());

        let mut crossed = false;
        for msg in batch {
            if msg.created < after {
                crossed = true;
                break;
            }
            collected.push(msg);
        }
        if crossed {
            break;
        }
        if request.max.is_some_and(|max| collected.len() >= max) {
            break;
        }
        if batch_len < PAGE_SIZE {
            break;
        }
        if page + 1 == MAX_PAGES {
            tracing::debug!(
                "Stopped after {} pages with {} messages; older history not fetched",
                MAX_PAGES,
                collected.len()
            );
        }
    }

    Ok(ListOutcome::new(collected, request.max))
}

/// `GET /messages/{id}`
pub async fn get_message(client: &WebexClient, message_id: &str) -> Result<Message, ApiError> {
    let id = required("messageId", message_id)?;
    client.get(&["messages", id], &[]).await
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_person_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl NewMessage {
    /// Exactly one destination and some content.
    pub fn validate(&self) -> Result<(), ApiError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match (present(&self.room_id), present(&self.to_person_email)) {
            (true, true) => {
                return Err(ApiError::InvalidArgument(
                    "give either roomId or toPersonEmail, not both".into(),
                ))
            }
            (false, false) => {
                return Err(ApiError::InvalidArgument(
                    "roomId or toPersonEmail is required".into(),
                ))
            }
            _ => {}
        }
        if !present(&self.text) && !present(&self.markdown) {
            return Err(ApiError::InvalidArgument(
                "text or markdown is required".into(),
            ));
        }
        Ok(())
    }
}

/// `POST /messages`
pub async fn create_message(client: &WebexClient, message: &NewMessage) -> Result<Message, ApiError> {
    message.validate()?;
    client.post(&["messages"], message).await
}

/// `DELETE /messages/{id}`
pub async fn delete_message(client: &WebexClient, message_id: &str) -> Result<(), ApiError> {
    let id = required("messageId", message_id)?;
    client.delete(&["messages", id]).await
}

pub(crate) fn required<'a>(name: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::InvalidArgument(format!("{} is required", name)));
    }
    Ok(value)
}
