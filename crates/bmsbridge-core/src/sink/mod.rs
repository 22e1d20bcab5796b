// ── Output sinks ──
//
// Exactly one sink is active per process. A sink reports each delivery as
// success or failure and never propagates downstream errors; the bridge
// counts failures and moves on.

pub mod broker;
pub mod file;
pub mod log;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::SinkSelection;
use crate::error::CoreError;
use crate::event::DecodedEvent;

pub use broker::{BrokerSink, Publisher};
pub use file::FileSink;
pub use log::LogSink;

#[cfg(feature = "kafka")]
pub use broker::KafkaPublisher;

/// Which sink implementation is active.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SinkKind {
    Broker,
    File,
    Console,
}

impl From<&SinkSelection> for SinkKind {
    fn from(selection: &SinkSelection) -> Self {
        match selection {
            SinkSelection::Broker { .. } => Self::Broker,
            SinkSelection::File { .. } => Self::File,
            SinkSelection::Console => Self::Console,
        }
    }
}

/// A downstream failure as the sink reports it in its log line.
pub(crate) fn delivery_error(sink: SinkKind, err: impl std::fmt::Display) -> CoreError {
    CoreError::SinkDelivery {
        sink: sink.to_string(),
        message: err.to_string(),
    }
}

/// Destination for decoded events.
#[async_trait]
pub trait OutputSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Forward one event. `false` means it was not delivered; it is not
    /// retried.
    async fn deliver(&self, event: &DecodedEvent) -> bool;

    /// Push out anything buffered. Called once on shutdown.
    async fn flush(&self) {}
}

/// Build the sink named by `selection`.
pub fn build_sink(selection: &SinkSelection) -> Result<Arc<dyn OutputSink>, CoreError> {
    match selection {
        #[cfg(feature = "kafka")]
        SinkSelection::Broker { brokers, topic } => {
            let publisher = KafkaPublisher::new(brokers)?;
            Ok(Arc::new(BrokerSink::new(Arc::new(publisher), topic.clone())))
        }
        #[cfg(not(feature = "kafka"))]
        SinkSelection::Broker { .. } => Err(CoreError::Config {
            message: "broker sink requested but bmsbridge was built without the `kafka` feature"
                .into(),
        }),
        SinkSelection::File { path } => Ok(Arc::new(FileSink::new(path.clone()))),
        SinkSelection::Console => Ok(Arc::new(LogSink::new())),
    }
}
