//! Pusher protocol client over WebSocket.
//!
//! Opens a socket to a Pusher cluster, waits for
//! `pusher:connection_established`, then hands back a [`PusherSocket`] for
//! outbound frames and an mpsc receiver of [`PusherEvent`]s. A background
//! task owns the socket: it answers server pings, pings the server when the
//! line goes quiet, and reports a single [`PusherEvent::Closed`] when the
//! connection ends. Reconnection is the caller's job.
//!
//! # Example
//!
//! ```rust,ignore
//! use bmsbridge_api::pusher::{Frame, PusherEndpoint, PusherSocket};
//! use tokio_util::sync::CancellationToken;
//!
//! let endpoint = PusherEndpoint::new("app-key", "eu");
//! let (socket, mut events) = PusherSocket::connect(&endpoint, CancellationToken::new()).await?;
//! socket.send(Frame::subscribe("notifications", None)).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::ChannelAuthorization;
use crate::error::Error;

// ── Constants ────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u8 = 7;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for `pusher:connection_established` after the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server default when `activity_timeout` is missing from the handshake.
const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 120;

// ── PusherEndpoint ───────────────────────────────────────────────────

/// Where to find the Pusher app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherEndpoint {
    pub key: String,
    pub cluster: String,
    /// Overrides `ws-{cluster}.pusher.com`, optionally with `:port`.
    pub host: Option<String>,
    /// `wss` when true, `ws` otherwise.
    pub encrypted: bool,
}

impl PusherEndpoint {
    pub fn new(key: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cluster: cluster.into(),
            host: None,
            encrypted: true,
        }
    }

    /// Full socket URL including the protocol query string.
    pub fn url(&self) -> Result<Url, Error> {
        let scheme = if self.encrypted { "wss" } else { "ws" };
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| format!("ws-{}.pusher.com", self.cluster));

        let mut url = Url::parse(&format!("{scheme}://{host}/app/{}", self.key))?;
        url.query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", "bmsbridge")
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url)
    }
}

// ── Frame ────────────────────────────────────────────────────────────

/// A single Pusher protocol message, in either direction.
///
/// `data` is usually a JSON-encoded *string* on the wire; use
/// [`decode_data`](Self::decode_data) or [`data_string`](Self::data_string)
/// rather than reading it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn subscribe(channel: &str, auth: Option<&ChannelAuthorization>) -> Self {
        let mut data = json!({ "channel": channel });
        if let Some(auth) = auth {
            data["auth"] = Value::String(auth.auth.clone());
            if let Some(ref channel_data) = auth.channel_data {
                data["channel_data"] = Value::String(channel_data.clone());
            }
        }
        Self {
            event: "pusher:subscribe".into(),
            channel: None,
            data: Some(data),
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            event: "pusher:unsubscribe".into(),
            channel: None,
            data: Some(json!({ "channel": channel })),
        }
    }

    pub fn ping() -> Self {
        Self {
            event: "pusher:ping".into(),
            channel: None,
            data: Some(json!({})),
        }
    }

    pub fn pong() -> Self {
        Self {
            event: "pusher:pong".into(),
            channel: None,
            data: Some(json!({})),
        }
    }

    /// Decode `data` into `T`, unwrapping the JSON-in-a-string encoding.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let result = match &self.data {
            Some(Value::String(raw)) => serde_json::from_str(raw),
            Some(other) => serde_json::from_value(other.clone()),
            None => serde_json::from_value(Value::Null),
        };
        result.map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: self
                .data
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        })
    }

    /// The raw `data` payload as text: string payloads verbatim, anything
    /// else re-serialized.
    pub fn data_string(&self) -> Option<String> {
        match &self.data {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(raw.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
    socket_id: String,
    #[serde(default = "default_activity_timeout")]
    activity_timeout: u64,
}

fn default_activity_timeout() -> u64 {
    DEFAULT_ACTIVITY_TIMEOUT_SECS
}

#[derive(Debug, Default, Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionErrorData {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

// ── PusherEvent ──────────────────────────────────────────────────────

/// What the socket task reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum PusherEvent {
    /// `pusher_internal:subscription_succeeded`.
    SubscriptionSucceeded { channel: String },

    /// `pusher:subscription_error`.
    SubscriptionError {
        channel: String,
        status: Option<u16>,
        message: String,
    },

    /// `pusher:error` on a live connection.
    Error { code: Option<u16>, message: String },

    /// Application event on a channel.
    Message {
        channel: String,
        event: String,
        data: Option<String>,
    },

    /// The connection is gone. Always the last event sent.
    Closed { code: Option<u16>, reason: String },
}

// ── PusherSocket ─────────────────────────────────────────────────────

/// Handle to an established Pusher connection.
///
/// Dropping the handle or calling [`close`](Self::close) tears down the
/// background task, which then emits [`PusherEvent::Closed`].
pub struct PusherSocket {
    socket_id: String,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl PusherSocket {
    /// Connect and wait for `pusher:connection_established`.
    ///
    /// `cancel` is owned by the caller; cancelling it closes the socket.
    pub async fn connect(
        endpoint: &PusherEndpoint,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PusherEvent>), Error> {
        let url = endpoint.url()?;
        tracing::info!(host = url.host_str().unwrap_or_default(), "Connecting to Pusher");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (write, mut read) = ws_stream.split();

        let established = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_established(&mut read))
            .await
            .map_err(|_| Error::Timeout {
                what: "pusher:connection_established",
                timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            })??;

        let activity_timeout = Duration::from_secs(established.activity_timeout.max(1));
        tracing::info!(
            socket_id = %established.socket_id,
            activity_timeout_secs = activity_timeout.as_secs(),
            "Pusher connection established"
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        tokio::spawn(io_loop(
            write,
            read,
            outbound_rx,
            event_tx,
            cancel.clone(),
            activity_timeout,
        ));

        Ok((
            Self {
                socket_id: established.socket_id,
                outbound: outbound_tx,
                cancel,
            },
            event_rx,
        ))
    }

    /// Server-assigned socket id, needed to authorize private channels.
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Queue a frame for the socket task.
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::WebSocketClosed {
                code: 1006,
                reason: "socket task has exited".into(),
            })
    }

    /// Signal the socket task to send a close frame and exit.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

// ── Handshake ────────────────────────────────────────────────────────

async fn await_established<S>(read: &mut S) -> Result<ConnectionEstablished, Error>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = read.next().await {
        match message.map_err(|e| Error::WebSocketConnect(e.to_string()))? {
            Message::Text(text) => {
                let frame = parse_frame(&text)?;
                match frame.event.as_str() {
                    "pusher:connection_established" => return frame.decode_data(),
                    "pusher:error" => {
                        let data: ErrorData = frame.decode_data().unwrap_or_default();
                        return Err(Error::Protocol {
                            code: data.code,
                            message: data.message.unwrap_or_else(|| "unspecified".into()),
                        });
                    }
                    other => tracing::trace!(event = other, "Ignoring frame before handshake"),
                }
            }
            Message::Close(frame) => {
                return Err(Error::WebSocketClosed {
                    code: frame.as_ref().map_or(1005, |cf| u16::from(cf.code)),
                    reason: frame.map(|cf| cf.reason.to_string()).unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    Err(Error::WebSocketClosed {
        code: 1006,
        reason: "stream ended before connection_established".into(),
    })
}

// ── Socket task ──────────────────────────────────────────────────────

/// Outcome of interpreting one inbound text frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Ping,
    Event(PusherEvent),
    Ignore,
}

async fn io_loop<W, R>(
    mut write: W,
    mut read: R,
    mut outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<PusherEvent>,
    cancel: CancellationToken,
    activity_timeout: Duration,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut activity = tokio::time::interval(activity_timeout);
    activity.set_missed_tick_behavior(MissedTickBehavior::Delay);
    activity.reset();
    let mut awaiting_pong = false;

    let closed = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break closed("closed by client");
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    break closed("socket handle dropped");
                };
                if let Err(e) = send_frame(&mut write, &frame).await {
                    break closed(&e.to_string());
                }
            }
            message = read.next() => {
                awaiting_pong = false;
                activity.reset();

                match message {
                    Some(Ok(Message::Text(text))) => match interpret(&text) {
                        Inbound::Ping => {
                            if let Err(e) = send_frame(&mut write, &Frame::pong()).await {
                                break closed(&e.to_string());
                            }
                        }
                        Inbound::Event(event) => {
                            if events.send(event).await.is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                break closed("event receiver dropped");
                            }
                        }
                        Inbound::Ignore => {}
                    },
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "Pusher close frame received");
                        }
                        break PusherEvent::Closed {
                            code: frame.as_ref().map(|cf| u16::from(cf.code)),
                            reason: frame.map(|cf| cf.reason.to_string()).unwrap_or_default(),
                        };
                    }
                    Some(Ok(_)) => {
                        // Binary, Ping, Pong, Frame -- tungstenite answers pings itself
                    }
                    Some(Err(e)) => break closed(&e.to_string()),
                    None => break closed("stream ended"),
                }
            }
            _ = activity.tick() => {
                if awaiting_pong {
                    break closed("no pong received within activity timeout");
                }
                awaiting_pong = true;
                if let Err(e) = send_frame(&mut write, &Frame::ping()).await {
                    break closed(&e.to_string());
                }
            }
        }
    };

    tracing::debug!(?closed, "Pusher socket task exiting");
    let _ = events.send(closed).await;
}

fn closed(reason: &str) -> PusherEvent {
    PusherEvent::Closed {
        code: None,
        reason: reason.to_owned(),
    }
}

async fn send_frame<W>(write: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: String::new(),
    })?;
    tracing::trace!(event = %frame.event, "Sending Pusher frame");
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

// ── Frame parsing ────────────────────────────────────────────────────

fn parse_frame(text: &str) -> Result<Frame, Error> {
    serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })
}

/// Map one inbound text frame to what the socket task should do with it.
fn interpret(text: &str) -> Inbound {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse Pusher frame");
            return Inbound::Ignore;
        }
    };

    match frame.event.as_str() {
        "pusher:ping" => Inbound::Ping,
        "pusher_internal:subscription_succeeded" => match frame.channel {
            Some(channel) => Inbound::Event(PusherEvent::SubscriptionSucceeded { channel }),
            None => Inbound::Ignore,
        },
        "pusher:subscription_error" => {
            let data: SubscriptionErrorData = frame.decode_data().unwrap_or_default();
            let message = data
                .error
                .or(data.kind)
                .unwrap_or_else(|| "subscription rejected".into());
            Inbound::Event(PusherEvent::SubscriptionError {
                channel: frame.channel.unwrap_or_default(),
                status: data.status,
                message,
            })
        }
        "pusher:error" => {
            let data: ErrorData = frame.decode_data().unwrap_or_default();
            Inbound::Event(PusherEvent::Error {
                code: data.code,
                message: data.message.unwrap_or_else(|| "unspecified".into()),
            })
        }
        event if event.starts_with("pusher:") || event.starts_with("pusher_internal:") => {
            Inbound::Ignore
        }
        _ => {
            let data = frame.data_string();
            match frame.channel {
                Some(channel) => Inbound::Event(PusherEvent::Message {
                    channel,
                    event: frame.event,
                    data,
                }),
                None => Inbound::Ignore,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
