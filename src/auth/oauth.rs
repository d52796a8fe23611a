//! OAuth2 flows against the Webex identity endpoints
//!
//! Two fetchers live here: the device authorization grant (used for
//! auto-refresh mode when no token helper is configured) and the
//! refresh-token exchange backing OAuth mode.

use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthType, AuthUrl, ClientId, ClientSecret, DeviceAuthorizationUrl,
    RefreshToken, Scope, StandardDeviceAuthorizationResponse, TokenResponse, TokenUrl,
};

use super::fetcher::{CredentialFetcher, DEFAULT_TOKEN_LIFETIME};
use super::tokens::TokenRecord;

const AUTH_URL: &str = "https://webexapis.com/v1/authorize";
const TOKEN_URL: &str = "https://webexapis.com/v1/access_token";
const DEVICE_AUTH_URL: &str = "https://webexapis.com/v1/device/authorize";
const DEVICE_TOKEN_URL: &str = "https://webexapis.com/v1/device/token";

/// Scopes requested when none are configured.
pub const DEFAULT_SCOPES: &str = "spark:all";

/// Integration credentials registered with Webex.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Build the OAuth2 client for the given token endpoint.
fn build_client(creds: &ClientCredentials, token_url: &str) -> Result<BasicClient> {
    let auth_url = AuthUrl::new(AUTH_URL.to_string())?;
    let token_url = TokenUrl::new(token_url.to_string())?;

    // Webex expects client credentials in the form body, not basic auth
    Ok(BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        creds.client_secret.clone().map(ClientSecret::new),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(AuthType::RequestBody))
}

/// Turn a token response into a record, assuming the default lifetime when
/// the server omits `expires_in`.
fn to_record<T: TokenResponse<oauth2::basic::BasicTokenType>>(response: &T) -> TokenRecord {
    TokenRecord::expiring_in(
        response.access_token().secret().to_string(),
        Utc::now(),
        response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
    )
}

/// Device authorization grant: prints a code for the user to enter in a
/// browser, then polls until the login completes.
pub struct DeviceCodeFetcher {
    creds: ClientCredentials,
    scopes: String,
}

impl DeviceCodeFetcher {
    pub fn new(creds: ClientCredentials, scopes: Option<String>) -> Self {
        Self {
            creds,
            scopes: scopes.unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
        }
    }
}

#[async_trait]
impl CredentialFetcher for DeviceCodeFetcher {
    async fn fetch(&self) -> Result<TokenRecord> {
        let client = build_client(&self.creds, DEVICE_TOKEN_URL)?
            .set_device_authorization_url(DeviceAuthorizationUrl::new(
                DEVICE_AUTH_URL.to_string(),
            )?);

        tracing::info!("Initiating device code flow...");

        let request = scopes(&self.scopes)
            .into_iter()
            .fold(client.exchange_device_code()?, |req, scope| req.add_scope(scope));
        let device_auth_response: StandardDeviceAuthorizationResponse = request
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .context("Failed to request device code")?;

        let verification_url = device_auth_response.verification_uri().as_str();
        let user_code = device_auth_response.user_code().secret();

        // stdout carries tool output, so the prompt goes to stderr
        eprintln!();
        eprintln!("To sign in, visit: {}", verification_url);
        eprintln!("Enter code:        {}", user_code);
        eprintln!();

        tracing::info!("Waiting for authentication...");

        let token_response = client
            .exchange_device_access_token(&device_auth_response)
            .request_async(oauth2::reqwest::async_http_client, tokio::time::sleep, None)
            .await
            .context("Failed to exchange device code for token")?;

        Ok(to_record(&token_response))
    }
}

/// Exchanges a long-lived refresh token for access tokens.
///
/// Webex may rotate the refresh token on exchange; the newest one is kept
/// in memory for the next exchange.
pub struct RefreshTokenExchange {
    creds: ClientCredentials,
    refresh_token: Mutex<String>,
}

impl RefreshTokenExchange {
    pub fn new(creds: ClientCredentials, refresh_token: String) -> Self {
        Self {
            creds,
            refresh_token: Mutex::new(refresh_token),
        }
    }

    fn current_refresh_token(&self) -> String {
        self.refresh_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CredentialFetcher for RefreshTokenExchange {
    async fn fetch(&self) -> Result<TokenRecord> {
        let client = build_client(&self.creds, TOKEN_URL)?;

        tracing::info!("Exchanging refresh token for access token...");

        let token_response = client
            .exchange_refresh_token(&RefreshToken::new(self.current_refresh_token()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .context("Failed to exchange refresh token")?;

        if let Some(rotated) = token_response.refresh_token() {
            let mut current = self.refresh_token.lock().unwrap_or_else(|e| e.into_inner());
            if *current != *rotated.secret() {
                tracing::info!("Refresh token rotated by server");
                *current = rotated.secret().to_string();
            }
        }

        Ok(to_record(&token_response))
    }
}

fn scopes(list: &str) -> Vec<Scope> {
    list.split_whitespace()
        .map(|s| Scope::new(s.to_string()))
        .collect()
}
