//! Token records, time source and refresh scheduling math

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lead time before expiry at which a proactive refresh is scheduled.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Delay used when the refresh window has already been entered.
///
/// Never zero: the refresh must not run inside the scheduling call.
pub const IMMEDIATE_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Backoff before the single retry of a failed scheduled refresh.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// A bearer token together with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Build a record from a relative lifetime, as returned by token endpoints.
    pub fn expiring_in(token: impl Into<String>, now: DateTime<Utc>, lifetime: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(token, expires_at)
    }

    /// A record is only usable while its expiry lies strictly in the future.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Source of wall-clock time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How long to wait before refreshing a token that expires at `expires_at`.
///
/// Refreshes fire `REFRESH_WINDOW` ahead of expiry. Once that point has
/// passed the refresh is due right away, after `IMMEDIATE_REFRESH_DELAY`.
pub fn refresh_delay(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Duration {
    let window = chrono::Duration::from_std(REFRESH_WINDOW).unwrap_or(chrono::Duration::zero());
    let refresh_at = expires_at - window;
    match (refresh_at - now).to_std() {
        Ok(delay) if !delay.is_zero() => delay,
        _ => IMMEDIATE_REFRESH_DELAY,
    }
}
