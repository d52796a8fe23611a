//! Tool entry points
//!
//! Each tool runs one API operation and renders the outcome as JSON. Errors
//! never escape: a failure becomes `{"error": <kind>, "details": <message>}`.
//!
//! [`serve`] exposes the same tools over newline-delimited JSON, sharing one
//! [`Auth`] across every request of the session.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::api::messages::{self, NewMessage};
use crate::api::rooms::{self, RoomQuery};
use crate::api::{people, ApiError, ListOutcome, ListRequest, WebexClient};
use crate::auth::{Auth, AuthError};
use crate::models::message::MessageSummary;

/// Render an operation result at the tool boundary.
pub fn render<T: Serialize>(result: Result<T, ApiError>) -> Value {
    match result {
        Ok(value) => serde_json::to_value(value)
            .unwrap_or_else(|e| ApiError::Serialization(e).to_tool_error()),
        Err(e) => {
            tracing::debug!("Tool failed: {}", e);
            e.to_tool_error()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryList {
    items: Vec<MessageSummary>,
    count: usize,
    truncated_by_max: bool,
}

/// Compact listing unless `raw` asks for the full message objects.
pub fn summarize(outcome: ListOutcome, raw: bool) -> Result<Value, ApiError> {
    let value = if raw {
        serde_json::to_value(outcome)
    } else {
        serde_json::to_value(SummaryList {
            items: outcome.items.iter().map(MessageSummary::from).collect(),
            count: outcome.count,
            truncated_by_max: outcome.truncated_by_max,
        })
    };
    Ok(value?)
}

pub async fn list_rooms(client: &WebexClient, query: &RoomQuery) -> Value {
    render(rooms::list_rooms(client, query).await)
}

pub async fn get_room(client: &WebexClient, room_id: &str) -> Value {
    render(rooms::get_room(client, room_id).await)
}

pub async fn list_messages(client: &WebexClient, request: &ListRequest, raw: bool) -> Value {
    let result = messages::list_since(client, request).await;
    render(result.and_then(|outcome| summarize(outcome, raw)))
}

pub async fn get_message(client: &WebexClient, message_id: &str) -> Value {
    render(messages::get_message(client, message_id).await)
}

pub async fn create_message(client: &WebexClient, message: &NewMessage) -> Value {
    render(messages::create_message(client, message).await)
}

pub async fn delete_message(client: &WebexClient, message_id: &str) -> Value {
    let result = messages::delete_message(client, message_id).await;
    render(result.map(|()| json!({ "deleted": message_id.trim() })))
}

pub async fn get_me(client: &WebexClient) -> Value {
    render(people::get_me(client).await)
}

/// Interactive (re)authentication for the active mode.
pub async fn login(auth: &Auth, force: bool) -> Value {
    let result = auth.reauthenticate(force).await.map_err(ApiError::from);
    render(result.map(|_| auth_status(auth)))
}

pub fn logout(auth: &Auth) -> Value {
    render(auth.logout().map(|()| json!({ "loggedOut": true })).map_err(ApiError::from))
}

/// Mode, token presence and refresh schedule.
pub fn auth_status(auth: &Auth) -> Value {
    let Some(status) = auth.status() else {
        return ApiError::from(AuthError::NotInitialized).to_tool_error();
    };
    let mut out = json!({
        "mode": status.mode.as_str(),
        "hasToken": status.has_token,
    });
    if let Some(manager) = status.manager {
        out["expiresAt"] = json!(manager.expires_at);
        out["valid"] = json!(manager.valid);
        out["refreshScheduled"] = json!(manager.refresh_scheduled);
    }
    out
}

/// One line of `serve` input: `{"id": 1, "tool": "get_room", "args": {"roomId": "..."}}`.
#[derive(Debug, Deserialize)]
pub struct ToolCall {
    /// Echoed back so callers can match responses to requests
    #[serde(default)]
    pub id: Option<Value>,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomArgs {
    room_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageArgs {
    message_id: String,
}

#[derive(Deserialize)]
struct ListMessagesArgs {
    #[serde(flatten)]
    request: ListRequest,
    #[serde(default)]
    raw: bool,
}

#[derive(Deserialize)]
struct LoginArgs {
    #[serde(default)]
    force: bool,
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ApiError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| ApiError::InvalidArgument(format!("bad arguments for {}: {}", tool, e)))
}

async fn call_tool(
    client: &WebexClient,
    auth: &Auth,
    tool: &str,
    args: Value,
) -> Result<Value, ApiError> {
    let output = match tool {
        "list_rooms" => list_rooms(client, &parse_args(tool, args)?).await,
        "get_room" => get_room(client, &parse_args::<RoomArgs>(tool, args)?.room_id).await,
        "list_messages" => {
            let args: ListMessagesArgs = parse_args(tool, args)?;
            list_messages(client, &args.request, args.raw).await
        }
        "get_message" => {
            get_message(client, &parse_args::<MessageArgs>(tool, args)?.message_id).await
        }
        "create_message" => create_message(client, &parse_args(tool, args)?).await,
        "delete_message" => {
            delete_message(client, &parse_args::<MessageArgs>(tool, args)?.message_id).await
        }
        "get_me" => get_me(client).await,
        "login" => login(auth, parse_args::<LoginArgs>(tool, args)?.force).await,
        "logout" => logout(auth),
        "status" => auth_status(auth),
        other => {
            return Err(ApiError::InvalidArgument(format!("unknown tool {:?}", other)));
        }
    };
    Ok(output)
}

/// Run one tool call. The response always carries an `output`, which is the
/// tool's JSON result or its error object.
pub async fn dispatch(client: &WebexClient, auth: &Auth, call: ToolCall) -> Value {
    tracing::debug!("Tool call {}", call.tool);
    let output = call_tool(client, auth, &call.tool, call.args)
        .await
        .unwrap_or_else(|e| e.to_tool_error());
    match call.id {
        Some(id) => json!({ "id": id, "output": output }),
        None => json!({ "output": output }),
    }
}

/// Decode and run one request line.
pub async fn handle_line(client: &WebexClient, auth: &Auth, line: &str) -> Value {
    match serde_json::from_str::<ToolCall>(line) {
        Ok(call) => dispatch(client, auth, call).await,
        Err(e) => {
            let err = ApiError::InvalidArgument(format!("malformed request: {}", e));
            json!({ "output": err.to_tool_error() })
        }
    }
}

/// Answer newline-delimited JSON tool calls until `input` closes.
pub async fn serve<R, W>(
    client: &WebexClient,
    auth: &Auth,
    input: R,
    mut output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(client, auth, line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        output
            .write_all(encoded.as_bytes())
            .await
            .context("Failed to write response")?;
        output.flush().await?;
    }
    tracing::debug!("Request stream closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::messages::list_since;
    use crate::api::messages::tests::{message, t0, FakeSource};
    use crate::auth::fetcher::tests::ScriptedFetcher;
    use crate::auth::manager::TokenManager;
    use crate::auth::store::tests::MemoryStore;
    use crate::auth::tokens::tests::ManualClock;
    use crate::auth::tokens::TokenRecord;
    use crate::auth::AuthMode;
    use chrono::Duration;
    use std::sync::Arc;
    use tokio::io::BufReader;

    #[test]
    fn test_render_success() {
        let out = render::<Value>(Ok(json!({ "id": "R1" })));
        assert_eq!(out, json!({ "id": "R1" }));
    }

    #[test]
    fn test_render_error_shape() {
        let out = render::<Value>(Err(ApiError::InvalidTimeBound {
            value: "soon".into(),
        }));
        assert_eq!(out["error"], "InvalidTimeBound");
        assert!(out["details"].as_str().unwrap().contains("soon"));
    }

    async fn outcome() -> ListOutcome {
        let mut reply = message("m1", t0() - Duration::minutes(1));
        reply.parent_id = Some("m0".into());
        reply.person_email = Some("b@example.com".into());
        let source = FakeSource::with(vec![message("m0", t0()), reply]);
        let request = ListRequest {
            room_id: "R1".into(),
            after: Some("2024-01-28T00:00:00Z".into()),
            max: Some(1),
            ..Default::default()
        };
        list_since(&source, &request).await.unwrap()
    }

    #[tokio::test]
    async fn test_summarized_listing() {
        let out = summarize(outcome().await, false).unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["truncatedByMax"], true);
        let item = &out["items"][0];
        assert_eq!(item["id"], "m0");
        assert_eq!(item["text"], "text of m0");
        assert!(item.get("roomId").is_none());
    }

    #[tokio::test]
    async fn test_raw_listing_passes_fields_through() {
        let out = summarize(outcome().await, true).unwrap();
        assert_eq!(out["items"][0]["roomId"], "R1");
        assert_eq!(out["truncatedByMax"], true);
    }

    #[test]
    fn test_status_before_initialize() {
        let out = auth_status(&Auth::new());
        assert_eq!(out["error"], "AuthNotInitialized");
    }

    #[test]
    fn test_static_status_and_logout() {
        let auth = Auth::new();
        auth.install_static("tok".into()).unwrap();

        let out = auth_status(&auth);
        assert_eq!(out["mode"], "static");
        assert_eq!(out["hasToken"], true);
        assert!(out.get("expiresAt").is_none());

        assert_eq!(logout(&auth)["error"], "StaticToken");
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_auth() {
        let client = WebexClient::new("http://127.0.0.1:9", Arc::new(Auth::new()));
        assert_eq!(get_room(&client, " ").await["error"], "InvalidArgument");
        assert_eq!(
            create_message(&client, &NewMessage::default()).await["error"],
            "InvalidArgument"
        );
        let request = ListRequest {
            room_id: "R1".into(),
            after: Some("not-a-date".into()),
            ..Default::default()
        };
        assert_eq!(
            list_messages(&client, &request, false).await["error"],
            "InvalidTimeBound"
        );
    }

    fn responses(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_serve_answers_each_line() {
        let auth = Arc::new(Auth::new());
        auth.install_static("tok".into()).unwrap();
        let client = WebexClient::new("http://127.0.0.1:9", auth.clone());

        let input = concat!(
            r#"{"id": 1, "tool": "status"}"#,
            "\n\n",
            r#"{"id": "b", "tool": "get_room", "args": {"roomId": " "}}"#,
            "\n",
            "not json\n",
            r#"{"tool": "launch"}"#,
            "\n",
            r#"{"id": 5, "tool": "get_message", "args": {}}"#,
            "\n",
        );
        let mut out = Vec::new();
        serve(&client, &auth, input.as_bytes(), &mut out).await.unwrap();

        let replies = responses(&out);
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["output"]["mode"], "static");
        assert_eq!(replies[1]["id"], "b");
        assert_eq!(replies[1]["output"]["error"], "InvalidArgument");
        assert!(replies[2].get("id").is_none());
        assert_eq!(replies[2]["output"]["error"], "InvalidArgument");
        assert!(replies[3]["output"]["details"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
        assert_eq!(replies[4]["id"], 5);
        assert!(replies[4]["output"]["details"]
            .as_str()
            .unwrap()
            .contains("messageId"));
    }

    #[test]
    fn test_list_messages_args_flatten() {
        let call: ToolCall = serde_json::from_str(
            r#"{"tool": "list_messages", "args": {"roomId": "R1", "after": "2024-01-01", "max": 5, "raw": true}}"#,
        )
        .unwrap();
        let args: ListMessagesArgs = parse_args(&call.tool, call.args).unwrap();
        assert_eq!(args.request.room_id, "R1");
        assert_eq!(args.request.after.as_deref(), Some("2024-01-01"));
        assert_eq!(args.request.max, Some(5));
        assert!(args.raw);

        let query: RoomQuery = parse_args("list_rooms", Value::Null).unwrap();
        assert!(query.max.is_none());
        let query: RoomQuery = parse_args("list_rooms", json!({ "type": "group" })).unwrap();
        assert_eq!(query.room_type.as_deref(), Some("group"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_session_shares_one_manager() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(TokenRecord::new("short", t0() + Duration::minutes(10))),
            Ok(TokenRecord::new("long", t0() + Duration::minutes(600))),
        ]));
        let manager = TokenManager::new(
            Arc::new(MemoryStore::default()),
            fetcher.clone(),
            Arc::new(ManualClock::at(t0())),
        );
        let auth = Arc::new(Auth::new());
        auth.install_managed(AuthMode::AutoRefresh, manager, true)
            .await
            .unwrap();
        let client = WebexClient::new("http://127.0.0.1:9", auth.clone());

        let (mut requests, server_in) = tokio::io::duplex(4096);
        let (server_out, replies) = tokio::io::duplex(4096);
        let session = {
            let auth = auth.clone();
            tokio::spawn(async move {
                serve(&client, &auth, BufReader::new(server_in), server_out).await
            })
        };
        let mut replies = BufReader::new(replies).lines();

        requests
            .write_all(b"{\"id\": 1, \"tool\": \"status\"}\n")
            .await
            .unwrap();
        let line = replies.next_line().await.unwrap().unwrap();
        let first: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(first["output"]["hasToken"], true);
        assert_eq!(auth.token().unwrap(), "short");

        // The near-expiry token is renewed in the background between requests
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        requests
            .write_all(b"{\"id\": 2, \"tool\": \"status\"}\n")
            .await
            .unwrap();
        let line = replies.next_line().await.unwrap().unwrap();
        let second: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(second["id"], 2);
        assert_eq!(second["output"]["valid"], true);
        assert_eq!(auth.token().unwrap(), "long");
        assert_eq!(fetcher.calls(), 2);

        drop(requests);
        session.await.unwrap().unwrap();
        auth.shutdown();
    }
}
