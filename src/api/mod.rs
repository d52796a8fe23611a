//! Webex messaging API

pub mod client;
pub mod messages;
pub mod people;
pub mod rooms;

use serde_json::{json, Value};
use thiserror::Error;

use crate::auth::AuthError;

pub use client::WebexClient;
pub use messages::{ListOutcome, ListRequest};

/// Errors from a single tool operation.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid time bound {value:?}: expected an RFC 3339 timestamp or YYYY-MM-DD date")]
    InvalidTimeBound { value: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HTTP {status} for {url}")]
    UpstreamHttp {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.kind(),
            Self::InvalidTimeBound { .. } => "InvalidTimeBound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::UpstreamHttp { .. } => "UpstreamHttpError",
            Self::Transport { .. } => "Transport",
            Self::Serialization(_) => "Serialization",
            Self::Decode { .. } => "Decode",
        }
    }

    /// Tool-boundary form: `{error: <kind>, details: <message>}`, plus the
    /// status and upstream body for HTTP failures.
    pub fn to_tool_error(&self) -> Value {
        let mut out = json!({ "error": self.kind(), "details": self.to_string() });
        if let Self::UpstreamHttp { status, body, .. } = self {
            // Keep the upstream error body structured when it is JSON
            let body = serde_json::from_str::<Value>(body)
                .unwrap_or_else(|_| Value::String(body.clone()));
            out["status"] = json!(status);
            out["body"] = body;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_keeps_json_body() {
        let err = ApiError::UpstreamHttp {
            status: 404,
            url: "https://webexapis.com/v1/messages".into(),
            body: r#"{"message":"not found","trackingId":"T1"}"#.into(),
        };
        let out = err.to_tool_error();
        assert_eq!(out["error"], "UpstreamHttpError");
        assert_eq!(out["details"], "HTTP 404 for https://webexapis.com/v1/messages");
        assert_eq!(out["status"], 404);
        assert_eq!(out["body"]["trackingId"], "T1");
    }

    #[test]
    fn test_upstream_error_plain_body() {
        let err = ApiError::UpstreamHttp {
            status: 502,
            url: "u".into(),
            body: "Bad Gateway".into(),
        };
        assert_eq!(err.to_tool_error()["body"], "Bad Gateway");
    }

    #[test]
    fn test_auth_error_kind_passes_through() {
        let out = ApiError::from(AuthError::NoValidToken).to_tool_error();
        assert_eq!(out["error"], "NoValidToken");
        assert!(out.get("status").is_none());
    }

    #[test]
    fn test_serialization_kind() {
        let cause = serde_json::from_str::<Value>("{").unwrap_err();
        let out = ApiError::from(cause).to_tool_error();
        assert_eq!(out["error"], "Serialization");
        assert!(out["details"].as_str().unwrap().starts_with("Failed to serialize"));
    }

    #[test]
    fn test_invalid_time_bound_message_names_value() {
        let err = ApiError::InvalidTimeBound {
            value: "not-a-date".into(),
        };
        assert_eq!(err.kind(), "InvalidTimeBound");
        assert!(err.to_string().contains("not-a-date"));
    }
}
