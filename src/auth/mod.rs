//! Authentication for the Webex API
//!
//! One of three credential modes is chosen at startup and kept for the
//! life of the process:
//!
//! - `static`: a fixed bearer token from the environment
//! - `auto-refresh`: a personal token obtained interactively and renewed
//!   before it expires
//! - `oauth`: access tokens exchanged from an integration's refresh token
//!
//! The two managed modes delegate to a [`TokenManager`]; the [`Auth`]
//! facade hides the difference from the API client.

pub mod fetcher;
pub mod manager;
pub mod oauth;
pub mod store;
pub mod tokens;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::AuthSettings;
use fetcher::{CredentialFetcher, HelperCommandFetcher};
use manager::{ManagerStatus, TokenManager};
use oauth::{ClientCredentials, DeviceCodeFetcher, RefreshTokenExchange};
use store::{keyring_supported, CredentialStore, FileStore, KeyringStore, StoreKind};
use tokens::SystemClock;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No authentication configured. Set WEBEX_ACCESS_TOKEN, WEBEX_AUTO_REFRESH, or OAuth client credentials")]
    NoAuthConfigured,

    #[error("Auto-refresh needs a secure credential store, which is not available on {0}")]
    PlatformUnsupported(String),

    #[error("Authentication configuration is incomplete: {0}")]
    Misconfigured(String),

    #[error("Authentication has not been initialized")]
    NotInitialized,

    #[error("Authentication is already initialized")]
    AlreadyInitialized,

    #[error("No valid token available. Run 'webex-cli login'")]
    NoValidToken,

    #[error("Could not obtain a token: {0:#}")]
    Unavailable(anyhow::Error),

    #[error("Cannot {0} a static token; change WEBEX_ACCESS_TOKEN instead")]
    StaticToken(&'static str),

    #[error("Credential store error: {0:#}")]
    Store(anyhow::Error),
}

impl AuthError {
    /// Short machine-readable name, used as the `error` field of tool output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoAuthConfigured => "NoAuthConfigured",
            Self::PlatformUnsupported(_) => "PlatformUnsupported",
            Self::Misconfigured(_) => "Misconfigured",
            Self::NotInitialized => "AuthNotInitialized",
            Self::AlreadyInitialized => "AlreadyInitialized",
            Self::NoValidToken => "NoValidToken",
            Self::Unavailable(_) => "AuthUnavailable",
            Self::StaticToken(_) => "StaticToken",
            Self::Store(_) => "CredentialStore",
        }
    }
}

/// The credential strategy selected for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Static,
    AutoRefresh,
    OAuth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::AutoRefresh => "auto-refresh",
            Self::OAuth => "oauth",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the auth mode: static token, then auto-refresh, then OAuth.
pub fn select_mode(settings: &AuthSettings, keyring_available: bool) -> Result<AuthMode, AuthError> {
    if settings.static_token.is_some() {
        return Ok(AuthMode::Static);
    }
    if settings.auto_refresh {
        if settings.token_store == StoreKind::Keyring && !keyring_available {
            return Err(AuthError::PlatformUnsupported(std::env::consts::OS.to_string()));
        }
        return Ok(AuthMode::AutoRefresh);
    }
    if settings.oauth_credentials().is_some() {
        return Ok(AuthMode::OAuth);
    }
    Err(AuthError::NoAuthConfigured)
}

/// Build the `Authorization` and `Content-Type` headers for an API request.
pub fn request_headers(token: &str) -> Result<HeaderMap, AuthError> {
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
        AuthError::Misconfigured("token contains characters not allowed in a header".into())
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Auth facade status for display.
#[derive(Debug, Clone)]
pub struct AuthStatus {
    pub mode: AuthMode,
    pub has_token: bool,
    pub manager: Option<ManagerStatus>,
}

struct Active {
    mode: AuthMode,
    token: Option<String>,
    manager: Option<TokenManager>,
    refreshes: Option<broadcast::Receiver<String>>,
}

/// Process-wide authentication state shared by every API call.
pub struct Auth {
    active: Mutex<Option<Active>>,
}

impl Default for Auth {
    fn default() -> Self {
        Self::new()
    }
}

impl Auth {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the mode and set up its token source. Must finish before any request.
    ///
    /// With `acquire` set, a managed mode obtains its first token right away,
    /// running the interactive flow if nothing usable is stored. Without it
    /// only an unexpired stored token is picked up.
    pub async fn initialize(
        &self,
        settings: &AuthSettings,
        acquire: bool,
    ) -> Result<AuthMode, AuthError> {
        if self.lock().is_some() {
            return Err(AuthError::AlreadyInitialized);
        }

        let mode = select_mode(settings, keyring_supported())?;
        tracing::info!("Using {} authentication", mode);

        match mode {
            AuthMode::Static => {
                let token = settings.static_token.clone().ok_or(AuthError::NoAuthConfigured)?;
                self.install_static(token)
            }
            AuthMode::AutoRefresh => {
                let manager = TokenManager::new(
                    build_store(settings, mode),
                    auto_refresh_fetcher(settings)?,
                    Arc::new(SystemClock),
                );
                self.install_managed(mode, manager, acquire).await
            }
            AuthMode::OAuth => {
                let (creds, refresh_token) = settings
                    .oauth_credentials()
                    .ok_or(AuthError::NoAuthConfigured)?;
                let manager = TokenManager::new(
                    build_store(settings, mode),
                    Arc::new(RefreshTokenExchange::new(creds, refresh_token)),
                    Arc::new(SystemClock),
                );
                self.install_managed(mode, manager, acquire).await
            }
        }
    }

    pub(crate) fn install_static(&self, token: String) -> Result<AuthMode, AuthError> {
        self.install(Active {
            mode: AuthMode::Static,
            token: Some(token),
            manager: None,
            refreshes: None,
        })
    }

    pub(crate) async fn install_managed(
        &self,
        mode: AuthMode,
        manager: TokenManager,
        acquire: bool,
    ) -> Result<AuthMode, AuthError> {
        let refreshes = manager.subscribe();
        let token = if acquire {
            match manager.get_valid_token().await {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::error!("Initial token acquisition failed: {}", e);
                    None
                }
            }
        } else {
            manager.load_stored()
        };

        let result = self.install(Active {
            mode,
            token,
            manager: Some(manager.clone()),
            refreshes: Some(refreshes),
        });
        if result.is_err() {
            manager.shutdown();
        }
        result
    }

    fn install(&self, active: Active) -> Result<AuthMode, AuthError> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(AuthError::AlreadyInitialized);
        }
        let mode = active.mode;
        *guard = Some(active);
        Ok(mode)
    }

    /// Current token, without any network access.
    ///
    /// Managed modes pick up tokens renewed in the background and drop the
    /// local copy once the manager no longer holds a valid token.
    pub fn token(&self) -> Result<String, AuthError> {
        let mut guard = self.lock();
        let active = guard.as_mut().ok_or(AuthError::NotInitialized)?;

        if let Some(rx) = active.refreshes.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(token) => active.token = Some(token),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }

        if let Some(manager) = &active.manager {
            match manager.cached_token() {
                Some(fresh) if active.token.as_deref() != Some(fresh.as_str()) => {
                    tracing::debug!("Adopting refreshed token");
                    active.token = Some(fresh);
                }
                Some(_) => {}
                None => active.token = None,
            }
        }

        active.token.clone().ok_or(AuthError::NoValidToken)
    }

    /// Like [`Auth::token`], but lets a managed mode fetch a new token when
    /// none is usable. This is where an expired token is recovered.
    pub async fn ensure_token(&self) -> Result<String, AuthError> {
        match self.token() {
            Err(AuthError::NoValidToken) => {}
            other => return other,
        }

        let manager = self.manager()?.ok_or(AuthError::NoValidToken)?;
        let token = manager.get_valid_token().await?;
        self.set_token(Some(token.clone()));
        Ok(token)
    }

    /// Request headers carrying the current token.
    pub async fn headers(&self) -> Result<HeaderMap, AuthError> {
        let token = self.ensure_token().await?;
        request_headers(&token)
    }

    /// Obtain a new token for the active mode.
    ///
    /// OAuth reuses a stored token unless `force` is set; auto-refresh always
    /// runs the interactive flow. Static tokens cannot be rotated.
    pub async fn reauthenticate(&self, force: bool) -> Result<String, AuthError> {
        let mode = self.mode().ok_or(AuthError::NotInitialized)?;
        let manager = match (mode, self.manager()?) {
            (AuthMode::Static, _) | (_, None) => return Err(AuthError::StaticToken("rotate")),
            (_, Some(manager)) => manager,
        };

        let token = match mode {
            AuthMode::OAuth if !force => manager.get_valid_token().await?,
            _ => manager.force_refresh().await?,
        };
        self.set_token(Some(token.clone()));
        Ok(token)
    }

    /// Forget cached and persisted credentials for the active mode.
    pub fn logout(&self) -> Result<(), AuthError> {
        let manager = self.manager()?.ok_or(AuthError::StaticToken("clear"))?;
        manager.clear()?;
        self.set_token(None);
        Ok(())
    }

    pub fn mode(&self) -> Option<AuthMode> {
        self.lock().as_ref().map(|active| active.mode)
    }

    pub fn status(&self) -> Option<AuthStatus> {
        let has_token = self.token().is_ok();
        let guard = self.lock();
        guard.as_ref().map(|active| AuthStatus {
            mode: active.mode,
            has_token,
            manager: active.manager.as_ref().map(TokenManager::status),
        })
    }

    /// Stop background refreshes before exit.
    pub fn shutdown(&self) {
        if let Ok(Some(manager)) = self.manager() {
            manager.shutdown();
        }
    }

    fn manager(&self) -> Result<Option<TokenManager>, AuthError> {
        let guard = self.lock();
        let active = guard.as_ref().ok_or(AuthError::NotInitialized)?;
        Ok(active.manager.clone())
    }

    fn set_token(&self, token: Option<String>) {
        if let Some(active) = self.lock().as_mut() {
            active.token = token;
        }
    }
}

fn build_store(settings: &AuthSettings, mode: AuthMode) -> Arc<dyn CredentialStore> {
    match settings.token_store {
        StoreKind::Keyring => Arc::new(KeyringStore::new(mode.as_str())),
        StoreKind::File => Arc::new(FileStore::new(settings.tokens_path.clone(), mode.as_str())),
    }
}

/// Helper command if configured, otherwise the device code flow.
fn auto_refresh_fetcher(settings: &AuthSettings) -> Result<Arc<dyn CredentialFetcher>, AuthError> {
    if let Some(command) = &settings.token_helper {
        let fetcher = HelperCommandFetcher::from_command_line(command)
            .map_err(|e| AuthError::Misconfigured(format!("{:#}", e)))?;
        return Ok(Arc::new(fetcher));
    }

    let client_id = settings.client_id.clone().ok_or_else(|| {
        AuthError::Misconfigured(
            "auto-refresh needs WEBEX_TOKEN_HELPER or WEBEX_CLIENT_ID for device login".into(),
        )
    })?;
    Ok(Arc::new(DeviceCodeFetcher::new(
        ClientCredentials {
            client_id,
            client_secret: settings.client_secret.clone(),
        },
        settings.scopes.clone(),
    )))
}
