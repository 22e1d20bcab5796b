// ── Session / token lifecycle ──
//
// Owns the bearer token the transport authenticates with. Password
// sessions log in lazily, cache the grant, and keep a one-shot timer armed
// to refresh a minute before expiry. Every timer outcome bumps a watch
// counter; the supervisor reconnects on it so the live connection always
// runs on the current credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bmsbridge_api::{AuthClient, TokenResponse};

use crate::config::Credential;
use crate::error::CoreError;

/// Refresh this long before the access token expires.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

// ── AuthApi ──────────────────────────────────────────────────────────

/// A token grant from login or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Duration,
    pub token_type: String,
}

impl From<TokenResponse> for TokenGrant {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(resp.access_token),
            refresh_token: resp.refresh_token.map(SecretString::from),
            expires_in: Duration::from_secs(resp.expires_in),
            token_type: resp.token_type,
        }
    }
}

/// The login/refresh endpoints, abstracted for tests.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, username: &str, password: &SecretString) -> Result<TokenGrant, CoreError>;

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CoreError>;
}

#[async_trait]
impl AuthApi for AuthClient {
    async fn login(&self, username: &str, password: &SecretString) -> Result<TokenGrant, CoreError> {
        Ok(AuthClient::login(self, username, password).await?.into())
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CoreError> {
        Ok(AuthClient::refresh(self, refresh_token).await?.into())
    }
}

// ── TokenData ────────────────────────────────────────────────────────

struct TokenData {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
    expires_at: Instant,
    token_type: String,
}

impl TokenData {
    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }
}

/// Delay before the scheduled refresh for a token living `expires_in`.
pub fn refresh_delay(expires_in: Duration) -> Duration {
    expires_in
        .saturating_sub(EXPIRY_MARGIN)
        .max(MIN_REFRESH_DELAY)
}

// ── SessionManager ───────────────────────────────────────────────────

/// Token owner for one bridge.
///
/// Cheaply cloneable; clones share the cached token and the refresh timer.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    credential: Credential,
    api: Arc<dyn AuthApi>,
    token: Mutex<Option<TokenData>>,
    refresh_timer: std::sync::Mutex<Option<RefreshTimer>>,
    timer_generation: std::sync::atomic::AtomicU64,
    rotations: watch::Sender<u64>,
}

struct RefreshTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(credential: Credential, api: Arc<dyn AuthApi>) -> Self {
        let (rotations, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                credential,
                api,
                token: Mutex::new(None),
                refresh_timer: std::sync::Mutex::new(None),
                timer_generation: std::sync::atomic::AtomicU64::new(0),
                rotations,
            }),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.inner.credential
    }

    /// Counter bumped each time the refresh timer replaces or drops the
    /// token. A change means the current connection uses stale credentials.
    pub fn rotations(&self) -> watch::Receiver<u64> {
        self.inner.rotations.subscribe()
    }

    /// Return a usable access token, logging in or refreshing as needed.
    pub async fn acquire_token(&self) -> Result<SecretString, CoreError> {
        let (username, password) = match &self.inner.credential {
            Credential::BearerToken(token) => return Ok(token.clone()),
            Credential::Password { username, password } => (username, password),
        };

        let mut token = self.inner.token.lock().await;
        let now = Instant::now();

        if let Some(data) = token.as_ref().filter(|d| d.is_fresh(now)) {
            if !self.refresh_pending() {
                self.schedule_refresh(refresh_delay(data.expires_at - now));
            }
            debug!(token_type = %data.token_type, "using cached access token");
            return Ok(data.access_token.clone());
        }

        if let Some(refresh_token) = token.as_ref().and_then(|d| d.refresh_token.clone()) {
            match self.inner.api.refresh(&refresh_token).await {
                Ok(grant) => {
                    debug!("access token refreshed");
                    return Ok(self.store(&mut token, grant));
                }
                Err(e) => warn!(error = %e, "token refresh failed, falling back to login"),
            }
        }

        let grant = self.inner.api.login(username, password).await?;
        info!(user = %username, "logged in");
        Ok(self.store(&mut token, grant))
    }

    /// Drop the cached token so the next acquisition logs in again.
    pub async fn invalidate(&self) {
        self.cancel_refresh();
        if self.inner.token.lock().await.take().is_some() {
            info!("cached access token invalidated");
        }
    }

    /// Cancel the pending refresh timer, if any.
    pub fn cancel_refresh(&self) {
        let timer = self
            .inner
            .refresh_timer
            .lock()
            .expect("refresh timer lock poisoned")
            .take();
        if let Some(timer) = timer {
            timer.handle.abort();
            debug!("refresh timer cancelled");
        }
    }

    /// True when a refresh timer is armed.
    pub fn refresh_pending(&self) -> bool {
        self.inner
            .refresh_timer
            .lock()
            .expect("refresh timer lock poisoned")
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Expiry of the cached token, if there is one.
    pub async fn token_expires_at(&self) -> Option<Instant> {
        self.inner.token.lock().await.as_ref().map(|d| d.expires_at)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn store(&self, slot: &mut Option<TokenData>, grant: TokenGrant) -> SecretString {
        let (access_token, delay) = Self::put_token(slot, grant);
        self.schedule_refresh(delay);
        access_token
    }

    /// Replace the cached token; returns the access token and the delay
    /// before its refresh.
    fn put_token(slot: &mut Option<TokenData>, grant: TokenGrant) -> (SecretString, Duration) {
        let access_token = grant.access_token.clone();
        debug!(
            token_type = %grant.token_type,
            expires_in_secs = grant.expires_in.as_secs(),
            "storing token grant"
        );
        *slot = Some(TokenData {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Instant::now() + grant.expires_in,
            token_type: grant.token_type,
        });
        (access_token, refresh_delay(grant.expires_in))
    }

    fn schedule_refresh(&self, delay: Duration) {
        let timer = self.spawn_timer(delay);
        let previous = self
            .inner
            .refresh_timer
            .lock()
            .expect("refresh timer lock poisoned")
            .replace(timer);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// The timer keeps its slot entry while the refresh call is in flight,
    /// so `cancel_refresh` aborts the call itself.
    fn spawn_timer(&self, delay: Duration) -> RefreshTimer {
        let generation = self
            .inner
            .timer_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let session = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.scheduled_refresh(generation).await;
        });
        debug!(delay_secs = delay.as_secs(), "token refresh scheduled");
        RefreshTimer { generation, handle }
    }

    fn is_current(timer: Option<&RefreshTimer>, generation: u64) -> bool {
        timer.is_some_and(|t| t.generation == generation)
    }

    async fn scheduled_refresh(&self, generation: u64) {
        let mut token = self.inner.token.lock().await;
        if !Self::is_current(self.timer_slot().as_ref(), generation) {
            return;
        }

        let refresh_token = token.as_ref().and_then(|d| d.refresh_token.clone());
        let outcome = match refresh_token {
            Some(refresh_token) => self.inner.api.refresh(&refresh_token).await,
            None => Err(CoreError::Authentication {
                message: "no refresh token cached".into(),
            }),
        };

        // Cancelled or superseded while the call was in flight.
        let mut timer = self.timer_slot();
        if !Self::is_current(timer.as_ref(), generation) {
            debug!("discarding refresh outcome of a cancelled timer");
            return;
        }

        match outcome {
            Ok(grant) => {
                let (_, delay) = Self::put_token(&mut token, grant);
                *timer = Some(self.spawn_timer(delay));
                info!("access token rotated ahead of expiry");
            }
            Err(e) => {
                warn!(error = %e, "scheduled token refresh failed, clearing session");
                *timer = None;
                *token = None;
            }
        }
        drop(timer);
        drop(token);

        self.inner.rotations.send_modify(|n| *n += 1);
    }

    fn timer_slot(&self) -> std::sync::MutexGuard<'_, Option<RefreshTimer>> {
        self.inner
            .refresh_timer
            .lock()
            .expect("refresh timer lock poisoned")
    }
}
