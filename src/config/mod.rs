//! Configuration loading
//!
//! Settings come from `config.toml` in the platform config directory and
//! are overridden by `WEBEX_*` environment variables. Both are read once
//! at startup.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::oauth::ClientCredentials;
use crate::auth::store::StoreKind;

pub const DEFAULT_API_BASE: &str = "https://webexapis.com/v1";

/// On-disk configuration. Every field is optional.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Messaging API base URL
    pub api_base: Option<String>,
    /// OAuth integration client ID
    pub client_id: Option<String>,
    /// OAuth integration client secret
    pub client_secret: Option<String>,
    /// Long-lived OAuth refresh token
    pub refresh_token: Option<String>,
    /// Where tokens are persisted between runs
    pub token_store: Option<StoreKind>,
    /// Command that performs an interactive login and prints a token as JSON
    pub token_helper: Option<String>,
    /// Space-separated OAuth scopes for device login
    pub scopes: Option<String>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "webex-cli", "webex-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Path of the token file used by the `file` token store.
    pub fn tokens_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("tokens.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }
}

/// Everything authentication needs, after environment overrides.
#[derive(Debug, Default, Clone)]
pub struct AuthSettings {
    pub static_token: Option<String>,
    pub auto_refresh: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub token_helper: Option<String>,
    pub token_store: StoreKind,
    pub scopes: Option<String>,
    pub tokens_path: PathBuf,
}

impl AuthSettings {
    /// Client credentials and refresh token, if all three are present.
    pub fn oauth_credentials(&self) -> Option<(ClientCredentials, String)> {
        let client_id = self.client_id.clone()?;
        let client_secret = self.client_secret.clone()?;
        let refresh_token = self.refresh_token.clone()?;
        Some((
            ClientCredentials {
                client_id,
                client_secret: Some(client_secret),
            },
            refresh_token,
        ))
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base: String,
    pub auth: AuthSettings,
}

impl Settings {
    /// Load the config file and apply the process environment on top.
    pub fn load() -> Result<Self> {
        let config = Config::load()?;
        let tokens_path = Config::tokens_path()?;
        Self::resolve(config, tokens_path, |key| std::env::var(key).ok())
    }

    /// Merge `config` with variables read through `env`.
    pub fn resolve(
        config: Config,
        tokens_path: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        // Blank variables count as unset
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let non_empty = |v: Option<String>| v.filter(|v| !v.trim().is_empty());

        let token_store = match var("WEBEX_TOKEN_STORE") {
            Some(kind) => kind.parse()?,
            None => config.token_store.unwrap_or_default(),
        };

        let auth = AuthSettings {
            static_token: var("WEBEX_ACCESS_TOKEN"),
            auto_refresh: var("WEBEX_AUTO_REFRESH").map_or(false, |v| is_truthy(&v)),
            client_id: var("WEBEX_CLIENT_ID").or(non_empty(config.client_id)),
            client_secret: var("WEBEX_CLIENT_SECRET").or(non_empty(config.client_secret)),
            refresh_token: var("WEBEX_REFRESH_TOKEN").or(non_empty(config.refresh_token)),
            token_helper: var("WEBEX_TOKEN_HELPER").or(non_empty(config.token_helper)),
            token_store,
            scopes: non_empty(config.scopes),
            tokens_path,
        };

        let api_base = var("WEBEX_API_BASE")
            .or(non_empty(config.api_base))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            auth,
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(config: Config, vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::resolve(config, PathBuf::from("/tmp/tokens.toml"), |key| {
            vars.get(key).cloned()
        })
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = resolve(Config::default(), &[]);
        assert_eq!(settings.api_base, DEFAULT_API_BASE);
        assert!(settings.auth.static_token.is_none());
        assert!(!settings.auth.auto_refresh);
        assert_eq!(settings.auth.token_store, StoreKind::Keyring);
        assert!(settings.auth.oauth_credentials().is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let config = Config::parse(
            r#"
api_base = "https://example.test/v1/"
client_id = "file-id"
client_secret = "file-secret"
refresh_token = "file-rt"
token_store = "file"
"#,
        )
        .unwrap();
        let settings = resolve(
            config,
            &[("WEBEX_CLIENT_ID", "env-id"), ("WEBEX_TOKEN_STORE", "keyring")],
        );

        assert_eq!(settings.api_base, "https://example.test/v1");
        assert_eq!(settings.auth.client_id.as_deref(), Some("env-id"));
        assert_eq!(settings.auth.client_secret.as_deref(), Some("file-secret"));
        assert_eq!(settings.auth.token_store, StoreKind::Keyring);

        let (creds, rt) = settings.auth.oauth_credentials().unwrap();
        assert_eq!(creds.client_id, "env-id");
        assert_eq!(rt, "file-rt");
    }

    #[test]
    fn test_blank_values_are_unset() {
        let settings = resolve(
            Config::default(),
            &[("WEBEX_ACCESS_TOKEN", "   "), ("WEBEX_AUTO_REFRESH", "")],
        );
        assert!(settings.auth.static_token.is_none());
        assert!(!settings.auth.auto_refresh);
    }

    #[test]
    fn test_auto_refresh_flag() {
        for value in ["1", "true", "YES", "on"] {
            let settings = resolve(Config::default(), &[("WEBEX_AUTO_REFRESH", value)]);
            assert!(settings.auth.auto_refresh, "value {}", value);
        }
        let settings = resolve(Config::default(), &[("WEBEX_AUTO_REFRESH", "no")]);
        assert!(!settings.auth.auto_refresh);
    }

    #[test]
    fn test_bad_store_kind_is_an_error() {
        let result = Settings::resolve(Config::default(), PathBuf::new(), |key| {
            (key == "WEBEX_TOKEN_STORE").then(|| "vault".to_string())
        });
        assert!(result.is_err());
    }
}
