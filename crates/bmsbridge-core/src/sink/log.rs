// Log sink: one JSON line per event on the `bmsbridge::events` target.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{OutputSink, SinkKind};
use crate::event::DecodedEvent;

pub const EVENT_LOG_TARGET: &str = "bmsbridge::events";

#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutputSink for LogSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Console
    }

    async fn deliver(&self, event: &DecodedEvent) -> bool {
        match serde_json::to_string(&event.to_message()) {
            Ok(line) => {
                info!(target: EVENT_LOG_TARGET, "{line}");
                true
            }
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "failed to serialize event");
                false
            }
        }
    }
}
