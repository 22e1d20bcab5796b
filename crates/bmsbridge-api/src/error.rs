use thiserror::Error;

/// Top-level error type for the `bmsbridge-api` crate.
///
/// Covers every failure mode across both API surfaces: the HTTP auth
/// endpoints and the Pusher WebSocket. `bmsbridge-core` maps these into
/// its bridge-level taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login or token refresh was rejected.
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        status: Option<u16>,
    },

    /// The channel authorization endpoint refused to sign a subscription.
    #[error("Channel authorization for {channel} rejected (HTTP {status}): {message}")]
    ChannelAuthorization {
        channel: String,
        status: u16,
        message: String,
    },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS configuration or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Waited too long for the server.
    #[error("Timed out after {timeout_secs}s waiting for {what}")]
    Timeout { what: &'static str, timeout_secs: u64 },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed before or while it was being used.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// `pusher:error` frame received from the server.
    #[error("Pusher error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Protocol { code: Option<u16>, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if the server refused the credentials themselves,
    /// as opposed to failing to answer.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::Authentication { status, .. } => {
                matches!(status, Some(400 | 401 | 403))
            }
            Self::ChannelAuthorization { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => true,
            Self::Protocol { code, .. } => !matches!(code, Some(4000..=4099)),
            _ => false,
        }
    }

    /// The HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { status, .. } => *status,
            Self::ChannelAuthorization { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
