// bmsbridge-core: Session, subscription and supervision layer between
// bmsbridge-api and the output sinks.

pub mod bridge;
pub mod channels;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{Bridge, BridgeStatus};
pub use channels::{
    ChannelKind, ChannelManager, ChannelPlan, ChannelStatus, ChannelSubscription, PlannedChannel,
};
pub use codec::{DecodeError, DecodeStage};
pub use config::{
    BridgeConfig, ChannelSettings, Credential, PusherSettings, ReconnectPolicy, SinkSelection,
};
pub use error::CoreError;
pub use event::{DecodedEvent, InboundEvent, SinkMessage};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use session::{AuthApi, SessionManager, TokenGrant};
pub use sink::{OutputSink, SinkKind};
pub use supervisor::{BridgeSignal, ConnectionState, Supervisor};
pub use transport::{OpenedTransport, PusherTransport, Transport, TransportEvent, TransportLink};
