// Shared fakes for the bmsbridge-core integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use url::Url;

use bmsbridge_core::{
    AuthApi, BridgeConfig, BridgeSignal, ChannelSettings, CoreError, Credential, DecodedEvent,
    OpenedTransport, OutputSink, PusherSettings, ReconnectPolicy, SinkKind, SinkSelection,
    TokenGrant, Transport, TransportEvent, TransportLink,
};

// ── Config ───────────────────────────────────────────────────────────

pub fn config(channels: ChannelSettings, reconnect: ReconnectPolicy, credential: Credential) -> BridgeConfig {
    BridgeConfig {
        base_url: Url::parse("https://bms.example.com/api").unwrap(),
        pusher: PusherSettings {
            key: "app-key".into(),
            cluster: "eu".into(),
            host: None,
            encrypted: true,
        },
        credential,
        channels,
        reconnect,
        sink: SinkSelection::Console,
        timeout: Duration::from_secs(30),
        ca_cert: None,
    }
}

pub fn two_locations() -> ChannelSettings {
    ChannelSettings {
        organization_ids: Vec::new(),
        location_ids: vec!["10".into(), "11".into()],
        notifications: false,
    }
}

pub fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(base_ms),
        max_attempts,
    }
}

pub fn bearer() -> Credential {
    Credential::BearerToken(SecretString::from("static-token".to_string()))
}

pub fn password() -> Credential {
    Credential::Password {
        username: "ops@example.com".into(),
        password: SecretString::from("hunter2".to_string()),
    }
}

// ── Signals ──────────────────────────────────────────────────────────

/// Wait (in virtual time) for the first signal matching `pred`.
pub async fn wait_for_signal(
    rx: &mut broadcast::Receiver<BridgeSignal>,
    pred: impl Fn(&BridgeSignal) -> bool,
) -> BridgeSignal {
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match rx.recv().await {
                Ok(signal) if pred(&signal) => return signal,
                Ok(_) => {}
                Err(e) => panic!("signal stream failed: {e}"),
            }
        }
    })
    .await
    .expect("signal not observed")
}

pub fn is_subscribed(signal: &BridgeSignal) -> bool {
    matches!(signal, BridgeSignal::Subscribed { .. })
}

// ── FakeAuth ─────────────────────────────────────────────────────────

pub struct FakeAuth {
    pub logins: AtomicU32,
    pub refreshes: AtomicU32,
    expires_in: Duration,
    refresh_fails: bool,
    refresh_latency: Duration,
}

impl FakeAuth {
    pub fn new(expires_in: Duration) -> Arc<Self> {
        Self::build(expires_in, false)
    }

    pub fn with_failing_refresh(expires_in: Duration) -> Arc<Self> {
        Self::build(expires_in, true)
    }

    /// Each refresh call takes `latency` before answering.
    pub fn with_slow_refresh(expires_in: Duration, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            refresh_latency: latency,
            ..Self::raw(expires_in, false)
        })
    }

    fn build(expires_in: Duration, refresh_fails: bool) -> Arc<Self> {
        Arc::new(Self::raw(expires_in, refresh_fails))
    }

    fn raw(expires_in: Duration, refresh_fails: bool) -> Self {
        Self {
            logins: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
            expires_in,
            refresh_fails,
            refresh_latency: Duration::ZERO,
        }
    }

    fn grant(&self, access: String) -> TokenGrant {
        TokenGrant {
            access_token: SecretString::from(access),
            refresh_token: Some(SecretString::from("refresh-token".to_string())),
            expires_in: self.expires_in,
            token_type: "Bearer".into(),
        }
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn login(&self, _: &str, _: &SecretString) -> Result<TokenGrant, CoreError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.grant(format!("login-{n}")))
    }

    async fn refresh(&self, _: &SecretString) -> Result<TokenGrant, CoreError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.refresh_latency).await;
        if self.refresh_fails {
            return Err(CoreError::Authentication {
                message: "refresh token revoked".into(),
            });
        }
        Ok(self.grant(format!("refresh-{n}")))
    }
}

// ── FakeTransport ────────────────────────────────────────────────────

/// What the next `open()` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Refuse the connection.
    Fail,
    /// Refuse the connection with a non-retryable server error.
    Reject,
    /// Connect and acknowledge every subscription.
    Accept,
    /// Connect but never acknowledge.
    Silent,
    /// Connect and reject subscriptions with this HTTP status.
    Deny(u16),
}

/// A connection handed out by the fake, for injecting events.
#[derive(Clone)]
pub struct FakeConnection {
    pub events: mpsc::Sender<TransportEvent>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl FakeConnection {
    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.emit(TransportEvent::Disconnected {
            reason: reason.into(),
        })
        .await;
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

pub struct FakeTransport {
    script: Mutex<VecDeque<Script>>,
    fallback: Script,
    pub opens: AtomicU32,
    pub open_times: Mutex<Vec<Instant>>,
    pub tokens: Mutex<Vec<String>>,
    pub connections: Mutex<Vec<FakeConnection>>,
}

impl FakeTransport {
    /// Play `script` in order, then `fallback` forever.
    pub fn new(script: &[Script], fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
            opens: AtomicU32::new(0),
            open_times: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(&[], Script::Accept)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> FakeConnection {
        self.connections.lock().unwrap()[index].clone()
    }

    /// Append steps to the script.
    pub fn queue(&self, script: &[Script]) {
        self.script.lock().unwrap().extend(script.iter().copied());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, token: &SecretString) -> Result<OpenedTransport, CoreError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_times.lock().unwrap().push(Instant::now());
        self.tokens.lock().unwrap().push(token.expose_secret().to_owned());

        let script = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match script {
            Script::Fail => {
                return Err(CoreError::ConnectionFailed {
                    reason: format!("scripted failure #{n}"),
                });
            }
            Script::Reject => {
                return Err(CoreError::ConnectionRejected {
                    reason: "Pusher error 4001: App does not exist".into(),
                });
            }
            _ => {}
        }

        let (events_tx, events) = mpsc::channel(64);
        let log = Arc::new(Mutex::new(Vec::new()));
        self.connections.lock().unwrap().push(FakeConnection {
            events: events_tx.clone(),
            log: Arc::clone(&log),
        });

        Ok(OpenedTransport {
            link: Box::new(FakeLink {
                socket_id: format!("{n}.{n}"),
                script,
                events: events_tx,
                log,
            }),
            events,
        })
    }
}

struct FakeLink {
    socket_id: String,
    script: Script,
    events: mpsc::Sender<TransportEvent>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TransportLink for FakeLink {
    fn socket_id(&self) -> &str {
        &self.socket_id
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.log.lock().unwrap().push(format!("subscribe:{channel}"));
        let reply = match self.script {
            Script::Accept => Some(TransportEvent::SubscriptionSucceeded {
                channel: channel.to_owned(),
            }),
            Script::Deny(status) => Some(TransportEvent::SubscriptionError {
                channel: channel.to_owned(),
                status: Some(status),
                message: "Unauthorized".into(),
            }),
            Script::Silent | Script::Fail | Script::Reject => None,
        };
        if let Some(reply) = reply {
            self.events.send(reply).await.unwrap();
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.log.lock().unwrap().push(format!("unsubscribe:{channel}"));
        Ok(())
    }

    fn close(&self) {
        self.log.lock().unwrap().push("close".into());
        let _ = self.events.try_send(TransportEvent::Disconnected {
            reason: "closed by client".into(),
        });
    }
}

// ── Sinks ────────────────────────────────────────────────────────────

/// Forwards every delivered event to a channel the test reads.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<DecodedEvent>,
    pub flushed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DecodedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                flushed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl OutputSink for RecordingSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Console
    }

    async fn deliver(&self, event: &DecodedEvent) -> bool {
        self.tx.send(event.clone()).is_ok()
    }

    async fn flush(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }
}

/// Rejects everything.
pub struct FailingSink {
    pub attempts: AtomicU32,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl OutputSink for FailingSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Broker
    }

    async fn deliver(&self, _: &DecodedEvent) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        false
    }
}
