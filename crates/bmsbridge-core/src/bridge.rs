// ── Bridge orchestrator ──
//
// Wires the session, channel, supervisor and sink components together
// and runs the dispatcher: a single consumer that decodes each inbound
// event and hands it to the sink. Undecodable events and failed deliveries
// are logged and dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bmsbridge_api::{AuthClient, TlsMode, TransportConfig};

use crate::channels::{ChannelManager, ChannelPlan, ChannelStatus};
use crate::codec;
use crate::config::BridgeConfig;
use crate::error::CoreError;
use crate::event::{DecodedEvent, InboundEvent};
use crate::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::session::{AuthApi, SessionManager};
use crate::sink::{OutputSink, SinkKind, build_sink};
use crate::supervisor::{BridgeSignal, ConnectionState, Supervisor};
use crate::transport::{PusherTransport, Transport};

const INBOUND_CHANNEL_SIZE: usize = 1024;

/// Full bridge view for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub channels: Vec<ChannelStatus>,
    pub sink: SinkKind,
}

impl BridgeStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }
}

/// One bridge instance.
///
/// Built once, then `connect()`ed. The event path runs in background
/// tasks; this handle controls and observes them.
pub struct Bridge {
    supervisor: Supervisor,
    channels: Arc<ChannelManager>,
    sink: Arc<dyn OutputSink>,
    metrics: Arc<BridgeMetrics>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Bridge {
    /// Assemble a bridge from injected components.
    ///
    /// Fails when the configuration yields no channels; nothing is
    /// contacted before that check.
    pub fn new(
        config: &BridgeConfig,
        auth: Arc<dyn AuthApi>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, CoreError> {
        let plan = ChannelPlan::from_settings(&config.channels)?;

        let session = SessionManager::new(config.credential.clone(), auth);
        let channels = Arc::new(ChannelManager::new(plan, session.clone()));
        let metrics = Arc::new(BridgeMetrics::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);

        let supervisor = Supervisor::new(
            config.reconnect,
            session,
            Arc::clone(&channels),
            transport,
            Arc::clone(&metrics),
            inbound_tx,
        );

        Ok(Self {
            supervisor,
            channels,
            sink,
            metrics,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
        })
    }

    /// Assemble a bridge with the production auth client, Pusher transport
    /// and the configured sink.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, CoreError> {
        // Validate channels before building any network client.
        ChannelPlan::from_settings(&config.channels)?;

        let transport_config = TransportConfig {
            tls: config.ca_cert.clone().map_or(TlsMode::System, TlsMode::CustomCa),
            timeout: config.timeout,
        };
        let auth = AuthClient::new(config.base_url.clone(), &transport_config)?;
        let transport = PusherTransport::new(config.pusher.endpoint(), auth.clone());
        let sink = build_sink(&config.sink)?;

        Self::new(config, Arc::new(auth), Arc::new(transport), sink)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the dispatcher (first call only) and the supervisor.
    pub async fn connect(&self) {
        self.start_dispatcher().await;
        self.supervisor.connect().await;
    }

    /// Tear down the connection. The dispatcher keeps running so a later
    /// `connect()` resumes delivery.
    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    /// Disconnect, drain queued events into the sink, then flush it.
    pub async fn shutdown(&self) {
        self.supervisor.disconnect().await;

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
            if let Err(e) = dispatcher.task.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
        }

        self.sink.flush().await;
        info!("bridge shut down");
    }

    async fn start_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return;
        }
        let Some(rx) = self.inbound_rx.lock().await.take() else {
            debug!("dispatcher already consumed its queue");
            return;
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(
            rx,
            Arc::clone(&self.sink),
            Arc::clone(&self.metrics),
            cancel.clone(),
        ));
        *dispatcher = Some(Dispatcher { cancel, task });
    }

    // ── Event path ───────────────────────────────────────────────────

    /// Decode and deliver a single event. Returns whether the sink took it.
    pub async fn process_event(&self, event: InboundEvent) -> bool {
        process(&*self.sink, &self.metrics, event).await
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn status(&self) -> BridgeStatus {
        let supervisor = self.supervisor.status();
        BridgeStatus {
            state: supervisor.state,
            reconnect_attempts: supervisor.reconnect_attempts,
            halted: supervisor.halted,
            halt_reason: supervisor.halt_reason,
            channels: self.channels.snapshot(),
            sink: self.sink.kind(),
        }
    }

    pub fn channels(&self) -> Vec<ChannelStatus> {
        self.channels.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.watch_state()
    }

    pub fn signals(&self) -> broadcast::Receiver<BridgeSignal> {
        self.supervisor.signals()
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

async fn dispatch_loop(
    mut rx: mpsc::Receiver<InboundEvent>,
    sink: Arc<dyn OutputSink>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    process(&*sink, &metrics, event).await;
                }
                None => return,
            },
        }
    }

    // Drain what was already queued before shutdown.
    while let Ok(event) = rx.try_recv() {
        process(&*sink, &metrics, event).await;
    }
    debug!("dispatcher stopped");
}

async fn process(sink: &dyn OutputSink, metrics: &BridgeMetrics, event: InboundEvent) -> bool {
    let InboundEvent {
        channel,
        event,
        payload,
    } = event;
    metrics.record_received(payload.as_ref().map_or(0, String::len));

    let Some(payload) = payload else {
        metrics.record_decode_failure();
        warn!(%channel, %event, "dropping event without payload");
        return false;
    };

    let data = match codec::decode(&payload) {
        Ok(data) => data,
        Err(e) => {
            metrics.record_decode_failure();
            warn!(%channel, %event, stage = %e.stage, error = %e, "dropping undecodable event");
            return false;
        }
    };
    metrics.record_decoded();

    let decoded = DecodedEvent::new(event, channel, data);
    let started = Instant::now();
    let delivered = sink.deliver(&decoded).await;
    metrics.record_delivery(delivered, started.elapsed());

    if !delivered {
        warn!(
            channel = %decoded.channel,
            event = %decoded.event_type,
            sink = %sink.kind(),
            "event not delivered, dropping"
        );
    }
    delivered
}
