// ── Real-time transport seam ──
//
// The supervisor only talks to `Transport` / `TransportLink`. The
// production implementation wraps a `PusherSocket` and signs private
// channel subscriptions through the auth API; tests plug in scripted fakes.

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use bmsbridge_api::{AuthClient, Frame, PusherEndpoint, PusherEvent, PusherSocket};

use crate::error::CoreError;

const EVENT_CHANNEL_SIZE: usize = 1024;

/// Pusher marks channels that need a signed subscription with this prefix.
const PRIVATE_PREFIX: &str = "private-";

// ── TransportEvent ───────────────────────────────────────────────────

/// Everything a live connection reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SubscriptionSucceeded {
        channel: String,
    },
    SubscriptionError {
        channel: String,
        status: Option<u16>,
        message: String,
    },
    Error {
        code: Option<u16>,
        message: String,
    },
    Message {
        channel: String,
        event: String,
        data: Option<String>,
    },
    /// The connection is gone; no further events follow.
    Disconnected {
        reason: String,
    },
}

impl From<PusherEvent> for TransportEvent {
    fn from(event: PusherEvent) -> Self {
        match event {
            PusherEvent::SubscriptionSucceeded { channel } => Self::SubscriptionSucceeded { channel },
            PusherEvent::SubscriptionError {
                channel,
                status,
                message,
            } => Self::SubscriptionError {
                channel,
                status,
                message,
            },
            PusherEvent::Error { code, message } => Self::Error { code, message },
            PusherEvent::Message {
                channel,
                event,
                data,
            } => Self::Message {
                channel,
                event,
                data,
            },
            PusherEvent::Closed { code, reason } => Self::Disconnected {
                reason: match code {
                    Some(code) => format!("closed with code {code}: {reason}"),
                    None => reason,
                },
            },
        }
    }
}

// ── Traits ───────────────────────────────────────────────────────────

/// Control half of an open connection.
#[async_trait]
pub trait TransportLink: Send + Sync {
    fn socket_id(&self) -> &str;

    /// Send the subscribe intent. The acknowledgement arrives as a
    /// [`TransportEvent`].
    async fn subscribe(&self, channel: &str) -> Result<(), CoreError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError>;

    /// Close the connection. A final `Disconnected` event follows.
    fn close(&self);
}

/// An open connection: the control link plus its event stream.
pub struct OpenedTransport {
    pub link: Box<dyn TransportLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens authenticated connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, token: &SecretString) -> Result<OpenedTransport, CoreError>;
}

// ── Pusher implementation ────────────────────────────────────────────

/// Pusher over WebSocket, with private channels signed by the auth API.
pub struct PusherTransport {
    endpoint: PusherEndpoint,
    auth: AuthClient,
}

impl PusherTransport {
    pub fn new(endpoint: PusherEndpoint, auth: AuthClient) -> Self {
        Self { endpoint, auth }
    }
}

#[async_trait]
impl Transport for PusherTransport {
    async fn open(&self, token: &SecretString) -> Result<OpenedTransport, CoreError> {
        let cancel = CancellationToken::new();
        let (socket, mut pusher_rx) = PusherSocket::connect(&self.endpoint, cancel).await?;

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        tokio::spawn(async move {
            while let Some(event) = pusher_rx.recv().await {
                trace!(?event, "transport event");
                if tx.send(TransportEvent::from(event)).await.is_err() {
                    break;
                }
            }
        });

        Ok(OpenedTransport {
            link: Box::new(PusherLink {
                socket,
                token: token.clone(),
                auth: self.auth.clone(),
            }),
            events,
        })
    }
}

struct PusherLink {
    socket: PusherSocket,
    token: SecretString,
    auth: AuthClient,
}

#[async_trait]
impl TransportLink for PusherLink {
    fn socket_id(&self) -> &str {
        self.socket.socket_id()
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CoreError> {
        let authorization = if channel.starts_with(PRIVATE_PREFIX) {
            Some(
                self.auth
                    .authorize_channel(&self.token, self.socket.socket_id(), channel)
                    .await?,
            )
        } else {
            None
        };

        debug!(channel, private = authorization.is_some(), "sending subscribe");
        self.socket
            .send(Frame::subscribe(channel, authorization.as_ref()))
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.socket.send(Frame::unsubscribe(channel)).await?;
        Ok(())
    }

    fn close(&self) {
        self.socket.close();
    }
}
