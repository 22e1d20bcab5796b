// ── Connection supervisor ──
//
// Owns the transport lifecycle for one bridge. A single background task
// runs connect cycles: acquire a token, open the transport, subscribe every
// channel, then pump events until the connection drops, the credentials
// rotate, or the caller disconnects. Failed cycles back off linearly and
// give up after the configured number of consecutive attempts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channels::ChannelManager;
use crate::config::ReconnectPolicy;
use crate::error::CoreError;
use crate::event::InboundEvent;
use crate::metrics::BridgeMetrics;
use crate::session::SessionManager;
use crate::transport::{OpenedTransport, Transport, TransportEvent, TransportLink};

const SIGNAL_CHANNEL_SIZE: usize = 64;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
    Error(String),
}

impl ConnectionState {
    /// A cycle is running or has reached full subscription.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Subscribing | Self::Subscribed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ── BridgeSignal ─────────────────────────────────────────────────────

/// Lifecycle notifications broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    Connected { socket_id: String },
    Subscribed { channels: usize },
    Disconnected { reason: String },
    CredentialsRotated,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal: no further automatic retries until `connect()`.
    MaxReconnectAttemptsExceeded { attempts: u32 },
    /// Terminal: the server refused the application, so no retry is tried.
    ConnectionRejected { reason: String },
    Error { message: String },
}

/// Supervisor view for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub halted: bool,
    /// Why retries stopped, while halted.
    pub halt_reason: Option<String>,
}

// ── Supervisor ───────────────────────────────────────────────────────

/// Cheaply cloneable via `Arc<SupervisorInner>`.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    policy: ReconnectPolicy,
    session: SessionManager,
    channels: Arc<ChannelManager>,
    transport: Arc<dyn Transport>,
    metrics: Arc<BridgeMetrics>,
    inbound: mpsc::Sender<InboundEvent>,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<BridgeSignal>,
    attempts: AtomicU32,
    halted: AtomicBool,
    halt_reason: ArcSwapOption<String>,
    run: Mutex<Option<RunHandle>>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// How one connect cycle ended.
enum CycleEnd {
    Cancelled,
    Rotated,
    Lost(String),
    Rejected(String),
}

enum PumpEnd {
    Cancelled,
    Rotated,
    Disconnected(String),
}

impl Supervisor {
    pub fn new(
        policy: ReconnectPolicy,
        session: SessionManager,
        channels: Arc<ChannelManager>,
        transport: Arc<dyn Transport>,
        metrics: Arc<BridgeMetrics>,
        inbound: mpsc::Sender<InboundEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SupervisorInner {
                policy,
                session,
                channels,
                transport,
                metrics,
                inbound,
                state,
                signals,
                attempts: AtomicU32::new(0),
                halted: AtomicBool::new(false),
                halt_reason: ArcSwapOption::empty(),
                run: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start connecting in the background.
    ///
    /// A no-op while a cycle is already in progress or subscribed. After
    /// the retry budget ran out, this is the only way to try again, and it
    /// starts from a fresh attempt counter.
    pub async fn connect(&self) {
        let mut run = self.inner.run.lock().await;

        let state = self.state();
        if state.is_active() && run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            info!(%state, "connect ignored, already active");
            return;
        }

        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.halted.store(false, Ordering::SeqCst);
        self.inner.halt_reason.store(None);
        self.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_loop(cancel.clone()));
        *run = Some(RunHandle { cancel, task });
    }

    /// Stop everything and return once the connection is torn down.
    ///
    /// Cancels the pending reconnect, refresh and handshake timers,
    /// unsubscribes every channel and closes the transport.
    pub async fn disconnect(&self) {
        let run = self.inner.run.lock().await.take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }

        self.inner.session.cancel_refresh();
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.channels.clear();
        self.set_state(ConnectionState::Disconnected);
        self.signal(BridgeSignal::Disconnected {
            reason: "disconnect requested".into(),
        });
        info!("disconnected");
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle signals.
    pub fn signals(&self) -> broadcast::Receiver<BridgeSignal> {
        self.inner.signals.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state(),
            reconnect_attempts: self.inner.attempts.load(Ordering::SeqCst),
            halted: self.inner.halted.load(Ordering::SeqCst),
            halt_reason: self.inner.halt_reason.load_full().map(|r| (*r).clone()),
        }
    }

    // ── Run loop ─────────────────────────────────────────────────────

    async fn run_loop(self, cancel: CancellationToken) {
        let mut rotations = self.inner.session.rotations();

        loop {
            rotations.borrow_and_update();

            match self.run_cycle(&cancel, &mut rotations).await {
                CycleEnd::Cancelled => return,
                CycleEnd::Rotated => {
                    info!("credentials rotated, reconnecting");
                    self.inner.metrics.record_reconnect();
                    self.signal(BridgeSignal::CredentialsRotated);
                    self.set_state(ConnectionState::Disconnected);
                }
                CycleEnd::Lost(reason) => {
                    self.set_state(ConnectionState::Disconnected);
                    self.signal(BridgeSignal::Disconnected { reason });
                    if !self.backoff(&cancel).await {
                        return;
                    }
                }
                CycleEnd::Rejected(reason) => {
                    self.set_state(ConnectionState::Disconnected);
                    self.halt(&reason);
                    error!(%reason, "server rejected the connection, not retrying");
                    self.signal(BridgeSignal::ConnectionRejected { reason });
                    return;
                }
            }

            self.set_state(ConnectionState::Connecting);
        }
    }

    async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        rotations: &mut watch::Receiver<u64>,
    ) -> CycleEnd {
        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return CycleEnd::Cancelled,
            token = self.inner.session.acquire_token() => token,
        };
        let token = match token {
            Ok(token) => token,
            Err(e) => return self.fail(&e),
        };

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return CycleEnd::Cancelled,
            opened = self.inner.transport.open(&token) => opened,
        };
        let OpenedTransport { link, mut events } = match opened {
            Ok(opened) => opened,
            Err(e) => return self.fail(&e),
        };

        info!(socket_id = link.socket_id(), "transport connected");
        self.set_state(ConnectionState::Connected);
        self.signal(BridgeSignal::Connected {
            socket_id: link.socket_id().to_owned(),
        });

        self.set_state(ConnectionState::Subscribing);
        let subscribed = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.teardown(link.as_ref()).await;
                return CycleEnd::Cancelled;
            }
            result = self.inner.channels.subscribe_all(link.as_ref(), &mut events) => result,
        };
        let backlog = match subscribed {
            Ok(backlog) => backlog,
            Err(e) => {
                self.inner.channels.clear();
                link.close();
                return self.fail(&e);
            }
        };

        self.inner.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Subscribed);
        self.signal(BridgeSignal::Subscribed {
            channels: self.inner.channels.subscribed_count(),
        });

        for event in backlog {
            self.handle_event(event);
        }

        match self.pump(cancel, rotations, &mut events).await {
            PumpEnd::Cancelled => {
                self.teardown(link.as_ref()).await;
                CycleEnd::Cancelled
            }
            PumpEnd::Rotated => {
                self.teardown(link.as_ref()).await;
                CycleEnd::Rotated
            }
            PumpEnd::Disconnected(reason) => {
                warn!(%reason, "transport disconnected");
                self.inner.channels.clear();
                CycleEnd::Lost(reason)
            }
        }
    }

    async fn pump(
        &self,
        cancel: &CancellationToken,
        rotations: &mut watch::Receiver<u64>,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> PumpEnd {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return PumpEnd::Cancelled,
                _ = rotations.changed() => return PumpEnd::Rotated,
                event = events.recv() => match event {
                    Some(TransportEvent::Disconnected { reason }) => {
                        return PumpEnd::Disconnected(reason);
                    }
                    Some(event) => self.handle_event(event),
                    None => return PumpEnd::Disconnected("event stream ended".into()),
                },
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message {
                channel,
                event,
                data,
            } => match self.inner.channels.route(&channel, &event, data) {
                Some(inbound) => self.forward(inbound),
                None => {
                    trace!(%channel, %event, "ignoring unbound event");
                    self.inner.metrics.record_ignored();
                }
            },
            TransportEvent::Error { code, message } => {
                warn!(?code, %message, "transport error");
                self.signal(BridgeSignal::Error { message });
            }
            TransportEvent::SubscriptionError {
                channel,
                status,
                message,
            } => {
                warn!(%channel, ?status, %message, "late subscription error");
                self.signal(BridgeSignal::Error {
                    message: format!("subscription to {channel} failed: {message}"),
                });
            }
            TransportEvent::SubscriptionSucceeded { channel } => {
                debug!(%channel, "late subscription acknowledgement");
            }
            TransportEvent::Disconnected { reason } => {
                debug!(%reason, "disconnect reported outside the event pump");
            }
        }
    }

    fn forward(&self, event: InboundEvent) {
        match self.inner.inbound.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(channel = %event.channel, event = %event.event, "dispatch queue full, dropping event");
                self.inner.metrics.record_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.metrics.record_dropped();
            }
        }
    }

    /// Unsubscribe everything and close the link.
    async fn teardown(&self, link: &dyn TransportLink) {
        self.inner.channels.unsubscribe_all(link).await;
        link.close();
    }

    fn fail(&self, err: &CoreError) -> CycleEnd {
        warn!(error = %err, "connect attempt failed");
        self.set_state(ConnectionState::Error(err.to_string()));
        self.signal(BridgeSignal::Error {
            message: err.to_string(),
        });
        if err.is_retryable() {
            CycleEnd::Lost(err.to_string())
        } else {
            CycleEnd::Rejected(err.to_string())
        }
    }

    /// Wait out the next retry delay. False when retries are exhausted or
    /// the run was cancelled.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        let max = self.inner.policy.max_attempts;
        let attempt = self.inner.attempts.load(Ordering::SeqCst) + 1;

        if attempt > max {
            let reason = CoreError::MaxReconnectAttemptsExceeded { attempts: max }.to_string();
            self.halt(&reason);
            error!(%reason, "giving up");
            self.signal(BridgeSignal::MaxReconnectAttemptsExceeded { attempts: max });
            return false;
        }
        self.inner.attempts.store(attempt, Ordering::SeqCst);

        let delay = self.inner.policy.delay_for(attempt);
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        self.inner.metrics.record_reconnect();
        self.signal(BridgeSignal::ReconnectScheduled { attempt, delay });

        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Stop retrying until the next `connect()`. The refresh timer stops
    /// with it.
    fn halt(&self, reason: &str) {
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.halt_reason.store(Some(Arc::new(reason.to_owned())));
        self.inner.session.cancel_refresh();
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(%state, "connection state");
        self.inner.state.send_replace(state);
    }

    fn signal(&self, signal: BridgeSignal) {
        let _ = self.inner.signals.send(signal);
    }
}
