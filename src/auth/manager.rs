//! Token lifecycle manager
//!
//! Owns the in-memory token, falls back to the persistent store and then
//! to the interactive fetcher, and keeps a single background timer that
//! renews the token `REFRESH_WINDOW` before it expires.
//!
//! Every token change goes through `refresh_locked`; all other paths only
//! read. The cache and the timer handle share one mutex, which is never
//! held across an await. Fetches are serialized by a separate async lock
//! so at most one interactive flow runs at a time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::fetcher::CredentialFetcher;
use super::store::CredentialStore;
use super::tokens::{refresh_delay, Clock, TokenRecord, RETRY_BACKOFF};
use super::AuthError;

const EVENT_CAPACITY: usize = 16;

/// Snapshot of the manager for status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub expires_at: Option<DateTime<Utc>>,
    pub valid: bool,
    pub refresh_scheduled: bool,
}

#[derive(Default)]
struct State {
    cached: Option<TokenRecord>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced or cancelled. A timer that
    /// wakes up with a stale generation does nothing.
    generation: u64,
}

impl State {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.generation += 1;
    }
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    fetcher: Arc<dyn CredentialFetcher>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    refresh_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<String>,
}

/// Shared handle to the token lifecycle of one auth mode.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        fetcher: Arc<dyn CredentialFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                clock,
                state: Mutex::new(State::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Return a usable token: memory first, then the store, then a fresh fetch.
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let _guard = self.inner.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        if let Some(token) = self.inner.adopt_stored() {
            return Ok(token);
        }
        self.inner.refresh_locked().await
    }

    /// Cached or unexpired stored token, never running the fetcher.
    pub fn load_stored(&self) -> Option<String> {
        self.cached_token().or_else(|| self.inner.adopt_stored())
    }

    /// Fetch a new token unconditionally, persist it and reschedule.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.inner.refresh_locked().await
    }

    /// Non-blocking peek at the in-memory token, if it has not expired.
    pub fn cached_token(&self) -> Option<String> {
        let now = self.inner.clock.now();
        self.inner
            .lock_state()
            .cached
            .as_ref()
            .filter(|record| record.is_valid_at(now))
            .map(|record| record.token.clone())
    }

    /// Receive every token produced by a successful refresh.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.events.subscribe()
    }

    /// Cancel the pending refresh and forget the token, in memory and in the store.
    pub fn clear(&self) -> Result<(), AuthError> {
        {
            let mut state = self.inner.lock_state();
            state.cancel_timer();
            state.cached = None;
        }
        self.inner.store.clear().map_err(AuthError::Store)?;
        tracing::info!("Cleared cached and stored token");
        Ok(())
    }

    /// Stop background work without touching any token state.
    pub fn shutdown(&self) {
        self.inner.lock_state().cancel_timer();
    }

    pub fn status(&self) -> ManagerStatus {
        let now = self.inner.clock.now();
        let state = self.inner.lock_state();
        ManagerStatus {
            expires_at: state.cached.as_ref().map(|r| r.expires_at),
            valid: state
                .cached
                .as_ref()
                .map_or(false, |record| record.is_valid_at(now)),
            refresh_scheduled: state
                .timer
                .as_ref()
                .map_or(false, |handle| !handle.is_finished()),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // A panic elsewhere must not take token access down with it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adopt an unexpired token from the store, scheduling its refresh.
    fn adopt_stored(self: &Arc<Self>) -> Option<String> {
        let record = match self.store.load() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Could not read stored token: {:#}", e);
                return None;
            }
        };

        if !record.is_valid_at(self.clock.now()) {
            tracing::debug!("Stored token expired at {}", record.expires_at);
            return None;
        }

        tracing::debug!("Using stored token (expires {})", record.expires_at);
        let token = record.token.clone();
        self.adopt(record);
        Some(token)
    }

    /// Fetch, persist, cache, reschedule and notify. Caller holds `refresh_lock`.
    async fn refresh_locked(self: &Arc<Self>) -> Result<String, AuthError> {
        let record = self.fetcher.fetch().await.map_err(AuthError::Unavailable)?;

        if let Err(e) = self.store.store(&record) {
            tracing::warn!("Could not persist refreshed token: {:#}", e);
        }

        tracing::info!("Token refreshed (expires {})", record.expires_at);
        let token = record.token.clone();
        self.adopt(record);

        // No subscribers is fine
        let _ = self.events.send(token.clone());
        Ok(token)
    }

    /// Replace the cached record and schedule its refresh.
    fn adopt(self: &Arc<Self>, record: TokenRecord) {
        let delay = refresh_delay(self.clock.now(), record.expires_at);
        let mut state = self.lock_state();
        state.cached = Some(record);
        self.schedule(&mut state, delay, false);
        tracing::debug!("Next token refresh in {}s", delay.as_secs());
    }

    /// Start the single refresh timer, cancelling any previous one.
    fn schedule(self: &Arc<Self>, state: &mut State, delay: Duration, is_retry: bool) {
        state.cancel_timer();
        let generation = state.generation;
        let weak = Arc::downgrade(self);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_scheduled(generation, is_retry).await;
            }
        }));
    }

    async fn run_scheduled(self: Arc<Self>, generation: u64, is_retry: bool) {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            // Detach our own handle so rescheduling from here does not abort us
            state.timer = None;
        }

        let _guard = self.refresh_lock.lock().await;
        if self.lock_state().generation != generation {
            // Refreshed or cleared while we waited
            return;
        }

        match self.refresh_locked().await {
            Ok(_) => {}
            Err(e) if !is_retry => {
                tracing::warn!(
                    "Scheduled token refresh failed: {}. Retrying in {}s",
                    e,
                    RETRY_BACKOFF.as_secs()
                );
                let mut state = self.lock_state();
                if state.generation == generation {
                    self.schedule(&mut state, RETRY_BACKOFF, true);
                }
            }
            Err(e) => {
                tracing::error!(
                    "Token refresh retry failed: {}. Token will be renewed on next use",
                    e
                );
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_state().timer.take() {
            handle.abort();
        }
    }
}
