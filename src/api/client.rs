//! Authenticated HTTP client for the Webex API
//!
//! Wraps reqwest::Client; every request asks the auth facade for the
//! current token, which may trigger a lazy refresh in managed modes.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::ApiError;
use crate::auth::Auth;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated client for the Webex REST API.
pub struct WebexClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<Auth>,
}

impl WebexClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<Auth>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Resource URL under the API base. Each segment is percent-encoded, so
    /// an id cannot escape its path position.
    fn url(&self, segments: &[&str]) -> Result<String, ApiError> {
        let invalid_base =
            || ApiError::InvalidArgument(format!("invalid API base URL {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid_base())?;
        url.path_segments_mut()
            .map_err(|_| invalid_base())?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    /// GET a JSON resource with query parameters.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.url(path)?;
        let headers = self.auth.headers().await?;
        tracing::debug!("GET {} {:?}", url, query);

        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .query(query)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        decode(check_response(resp, &url).await?, &url).await
    }

    /// POST a JSON body and decode the JSON response.
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &[&str],
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path)?;
        let headers = self.auth.headers().await?;
        tracing::debug!("POST {}", url);

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        decode(check_response(resp, &url).await?, &url).await
    }

    /// DELETE a resource. Webex answers 204 with no body.
    pub async fn delete(&self, path: &[&str]) -> Result<(), ApiError> {
        let url = self.url(path)?;
        let headers = self.auth.headers().await?;
        tracing::debug!("DELETE {}", url);

        let resp = self
            .http
            .delete(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        check_response(resp, &url).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, url: &str) -> Result<T, ApiError> {
    resp.json().await.map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Check HTTP response status code, keeping the error body on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED {
        tracing::warn!("401 Unauthorized for {}. Token may be invalid -- run 'webex-cli login'", url);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::UpstreamHttp {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}
