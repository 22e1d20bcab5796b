// ── Core error types ──
//
// Bridge-level errors. Consumers never match on HTTP bodies or WebSocket
// close frames directly; the `From<bmsbridge_api::Error>` impl translates
// transport-layer errors into these variants.

use thiserror::Error;

use crate::codec::DecodeError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Session ──────────────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Subscription ─────────────────────────────────────────────────
    #[error("Subscription to {channel} timed out after {timeout_secs}s")]
    SubscriptionTimeout { channel: String, timeout_secs: u64 },

    #[error("Subscription to {channel} rejected (HTTP {status})")]
    SubscriptionAuth { channel: String, status: u16 },

    #[error("Subscription to {channel} failed: {message}")]
    SubscriptionFailed {
        channel: String,
        status: Option<u16>,
        message: String,
    },

    #[error("No channels configured: set ORGANIZATION_IDS, LOCATION_IDS or SUBSCRIBE_NOTIFICATIONS")]
    NoChannels,

    // ── Events ───────────────────────────────────────────────────────
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{sink} sink failed to deliver event: {message}")]
    SinkDelivery { sink: String, message: String },

    // ── Connection ───────────────────────────────────────────────────
    #[error("Gave up reconnecting after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    #[error("Cannot connect: {reason}")]
    ConnectionFailed { reason: String },

    /// The server refused the application outright; retrying cannot help.
    #[error("Connection rejected: {reason}")]
    ConnectionRejected { reason: String },

    #[error("Transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("Timed out after {timeout_secs}s waiting for {what}")]
    Timeout { what: String, timeout_secs: u64 },

    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True when the credentials themselves were refused.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::SubscriptionAuth { .. })
    }

    /// False when reconnecting would only be refused again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConnectionRejected { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<bmsbridge_api::Error> for CoreError {
    fn from(err: bmsbridge_api::Error) -> Self {
        use bmsbridge_api::Error as Api;

        match err {
            Api::Authentication { message, .. } => CoreError::Authentication { message },
            Api::ChannelAuthorization {
                channel,
                status: status @ (401 | 403),
                ..
            } => CoreError::SubscriptionAuth { channel, status },
            Api::ChannelAuthorization {
                channel,
                status,
                message,
            } => CoreError::SubscriptionFailed {
                channel,
                status: Some(status),
                message,
            },
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout {
                what: "HTTP response".into(),
                timeout_secs: 0,
            },
            Api::Transport(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            Api::Tls(reason) | Api::WebSocketConnect(reason) => {
                CoreError::ConnectionFailed { reason }
            }
            Api::Timeout { what, timeout_secs } => CoreError::Timeout {
                what: what.into(),
                timeout_secs,
            },
            Api::WebSocketClosed { code, reason } => CoreError::TransportClosed {
                reason: format!("code {code}: {reason}"),
            },
            err @ Api::Protocol { .. } if !err.is_transient() => CoreError::ConnectionRejected {
                reason: err.to_string(),
            },
            err @ Api::Protocol { .. } => CoreError::ConnectionFailed {
                reason: err.to_string(),
            },
            Api::Deserialization { message, .. } => CoreError::Api {
                message,
                status: None,
            },
        }
    }
}
