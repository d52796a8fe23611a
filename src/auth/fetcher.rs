//! Interactive credential fetchers
//!
//! A fetcher drives whatever external flow produces a fresh token. It may
//! block on a human for minutes, so callers must not hold locks across it.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::tokens::TokenRecord;

/// Lifetime assumed when a flow does not report one (personal access tokens).
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

/// Obtains a brand-new token from an external authentication flow.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self) -> Result<TokenRecord>;
}

/// Output contract for a token helper program.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelperOutput {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    expires_in: Option<u64>,
}

/// Runs an external helper (typically a browser automation script) that
/// completes the login and prints `{"token": ..., "expiresAt": ...}` on
/// stdout. `expiresIn` (seconds) is accepted in place of `expiresAt`.
pub struct HelperCommandFetcher {
    program: String,
    args: Vec<String>,
}

impl HelperCommandFetcher {
    /// Build from a command line with POSIX shell quoting, so paths with
    /// spaces can be quoted. No shell is involved in running it.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = shlex::split(command)
            .context("Token helper command has unbalanced quotes")?
            .into_iter();
        let program = parts.next().context("Token helper command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl CredentialFetcher for HelperCommandFetcher {
    async fn fetch(&self) -> Result<TokenRecord> {
        tracing::info!("Running token helper {}...", self.program);

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .with_context(|| format!("Failed to run token helper {}", self.program))?;

        if !output.status.success() {
            bail!("Token helper exited with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_helper_output(stdout.trim(), Utc::now())
    }
}

fn parse_helper_output(stdout: &str, now: DateTime<Utc>) -> Result<TokenRecord> {
    let out: HelperOutput =
        serde_json::from_str(stdout).context("Token helper printed invalid JSON")?;
    if out.token.trim().is_empty() {
        bail!("Token helper returned an empty token");
    }

    let record = match (out.expires_at, out.expires_in) {
        (Some(at), _) => TokenRecord::new(out.token, at),
        (None, Some(secs)) => TokenRecord::expiring_in(out.token, now, Duration::from_secs(secs)),
        (None, None) => TokenRecord::expiring_in(out.token, now, DEFAULT_TOKEN_LIFETIME),
    };
    Ok(record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tokens::tests::t0;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Fetcher replaying scripted outcomes and counting invocations.
    ///
    /// Once the script runs out it keeps returning the last successful token.
    pub struct ScriptedFetcher {
        script: Mutex<VecDeque<std::result::Result<TokenRecord, String>>>,
        last: Mutex<Option<TokenRecord>>,
        calls: Mutex<usize>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        pub fn new(script: Vec<std::result::Result<TokenRecord, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(0),
                delay: None,
            }
        }

        /// Make every fetch take `delay`, like a human finishing a login.
        pub fn slow(self, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..self
            }
        }

        pub fn always(record: TokenRecord) -> Self {
            Self::new(vec![Ok(record)])
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CredentialFetcher for ScriptedFetcher {
        async fn fetch(&self) -> Result<TokenRecord> {
            *self.calls.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(record)) => {
                    *self.last.lock().unwrap() = Some(record.clone());
                    Ok(record)
                }
                Some(Err(msg)) => bail!(msg),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .context("fetcher script exhausted"),
            }
        }
    }

    #[test]
    fn test_parse_helper_expires_at() {
        let record =
            parse_helper_output(r#"{"token":"abc","expiresAt":"2024-01-29T00:00:00Z"}"#, t0())
                .unwrap();
        assert_eq!(record.token, "abc");
        assert_eq!(record.expires_at.to_rfc3339(), "2024-01-29T00:00:00+00:00");
    }

    #[test]
    fn test_parse_helper_expires_in() {
        let record = parse_helper_output(r#"{"token":"abc","expiresIn":600}"#, t0()).unwrap();
        assert_eq!(record.expires_at, t0() + chrono::Duration::minutes(10));
    }

    #[test]
    fn test_parse_helper_default_lifetime() {
        let record = parse_helper_output(r#"{"token":"abc"}"#, t0()).unwrap();
        assert_eq!(record.expires_at, t0() + chrono::Duration::hours(12));
    }

    #[test]
    fn test_parse_helper_rejects_empty_token() {
        assert!(parse_helper_output(r#"{"token":"  "}"#, t0()).is_err());
        assert!(parse_helper_output("not json", t0()).is_err());
    }

    #[test]
    fn test_helper_command_line() {
        let fetcher = HelperCommandFetcher::from_command_line("node login.js --headless").unwrap();
        assert_eq!(fetcher.program, "node");
        assert_eq!(fetcher.args, vec!["login.js", "--headless"]);
        assert!(HelperCommandFetcher::from_command_line("   ").is_err());
    }

    #[test]
    fn test_helper_command_line_quoting() {
        let fetcher = HelperCommandFetcher::from_command_line(
            r#""/opt/webex tools/login" --profile 'work account'"#,
        )
        .unwrap();
        assert_eq!(fetcher.program, "/opt/webex tools/login");
        assert_eq!(fetcher.args, vec!["--profile", "work account"]);

        assert!(HelperCommandFetcher::from_command_line("login 'unterminated").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_command_runs() {
        let fetcher = HelperCommandFetcher {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo '{"token":"from-helper","expiresIn":3600}'"#.to_string(),
            ],
        };
        let record = fetcher.fetch().await.unwrap();
        assert_eq!(record.token, "from-helper");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_command_failure() {
        let fetcher = HelperCommandFetcher {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
        };
        assert!(fetcher.fetch().await.is_err());
    }
}
