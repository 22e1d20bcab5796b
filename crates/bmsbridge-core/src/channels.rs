// ── Channel subscriptions ──
//
// Derives the channel set from configuration, runs the subscribe
// handshake for each channel over a live link, and keeps a registry of
// what is currently subscribed. Each channel kind binds a fixed set of
// event names; everything else on the channel is ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ChannelSettings;
use crate::error::CoreError;
use crate::event::InboundEvent;
use crate::session::SessionManager;
use crate::transport::{TransportEvent, TransportLink};

/// Upper bound on waiting for `pusher_internal:subscription_succeeded`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const NOTIFICATIONS_CHANNEL: &str = "notifications";

const ORGANIZATION_EVENTS: &[&str] = &[
    "organization.updated",
    "organization.deleted",
    "location.created",
    "location.updated",
    "location.deleted",
    "user.created",
    "user.updated",
    "user.deleted",
];

const LOCATION_EVENTS: &[&str] = &["sensor.state_changed"];

const NOTIFICATION_EVENTS: &[&str] = &[
    "notification.created",
    "notification.updated",
    "notification.deleted",
];

// ── ChannelKind ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    Organization,
    Location,
    Notifications,
}

impl ChannelKind {
    /// Event names delivered for this kind of channel.
    pub fn bound_events(self) -> &'static [&'static str] {
        match self {
            Self::Organization => ORGANIZATION_EVENTS,
            Self::Location => LOCATION_EVENTS,
            Self::Notifications => NOTIFICATION_EVENTS,
        }
    }

    pub fn binds(self, event: &str) -> bool {
        self.bound_events().contains(&event)
    }
}

// ── ChannelPlan ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChannel {
    pub name: String,
    pub kind: ChannelKind,
}

/// The ordered, de-duplicated channel set derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    channels: Vec<PlannedChannel>,
}

impl ChannelPlan {
    /// Organizations first, then locations, then notifications.
    /// Fails when the result would be empty.
    pub fn from_settings(settings: &ChannelSettings) -> Result<Self, CoreError> {
        let mut channels: Vec<PlannedChannel> = Vec::new();
        let mut push = |name: String, kind: ChannelKind| {
            if !channels.iter().any(|c| c.name == name) {
                channels.push(PlannedChannel { name, kind });
            }
        };

        for id in settings.organization_ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            push(format!("private-organization-{id}"), ChannelKind::Organization);
        }
        for id in settings.location_ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            push(format!("private-location-{id}"), ChannelKind::Location);
        }
        if settings.notifications {
            push(NOTIFICATIONS_CHANNEL.to_owned(), ChannelKind::Notifications);
        }

        if channels.is_empty() {
            return Err(CoreError::NoChannels);
        }
        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[PlannedChannel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn kind_of(&self, channel: &str) -> Option<ChannelKind> {
        self.channels
            .iter()
            .find(|c| c.name == channel)
            .map(|c| c.kind)
    }
}

// ── Registry types ───────────────────────────────────────────────────

/// A channel whose handshake completed on the current connection.
#[derive(Debug, Clone)]
pub struct ChannelSubscription {
    pub name: String,
    pub kind: ChannelKind,
    pub subscribed: bool,
    pub subscribed_at: DateTime<Utc>,
}

/// Per-channel view for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub kind: ChannelKind,
    pub subscribed: bool,
    pub subscribed_at: Option<DateTime<Utc>>,
}

// ── ChannelManager ───────────────────────────────────────────────────

pub struct ChannelManager {
    plan: ChannelPlan,
    registry: DashMap<String, ChannelSubscription>,
    session: SessionManager,
    handshake_timeout: Duration,
}

impl ChannelManager {
    pub fn new(plan: ChannelPlan, session: SessionManager) -> Self {
        Self {
            plan,
            registry: DashMap::new(),
            session,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    /// Subscribe every planned channel, one handshake at a time.
    ///
    /// Events that arrive during the handshakes and are not the awaited
    /// acknowledgement are returned in arrival order for the caller to
    /// process.
    pub async fn subscribe_all(
        &self,
        link: &dyn TransportLink,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> Result<Vec<TransportEvent>, CoreError> {
        let mut backlog = Vec::new();
        for channel in self.plan.channels() {
            self.subscribe(link, events, channel, &mut backlog).await?;
        }
        info!(channels = self.plan.len(), "all channels subscribed");
        Ok(backlog)
    }

    async fn subscribe(
        &self,
        link: &dyn TransportLink,
        events: &mut mpsc::Receiver<TransportEvent>,
        channel: &PlannedChannel,
        backlog: &mut Vec<TransportEvent>,
    ) -> Result<(), CoreError> {
        let name = channel.name.as_str();
        debug!(channel = name, kind = %channel.kind, "subscribing");

        let handshake = async {
            link.subscribe(name).await?;
            await_ack(events, name, backlog).await
        };

        let result = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::SubscriptionTimeout {
                channel: name.to_owned(),
                timeout_secs: self.handshake_timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => {
                self.registry.insert(
                    name.to_owned(),
                    ChannelSubscription {
                        name: name.to_owned(),
                        kind: channel.kind,
                        subscribed: true,
                        subscribed_at: Utc::now(),
                    },
                );
                info!(channel = name, "subscribed");
                Ok(())
            }
            Err(e) => {
                if matches!(e, CoreError::SubscriptionAuth { .. }) {
                    self.session.invalidate().await;
                }
                warn!(channel = name, error = %e, "subscription failed");
                Err(e)
            }
        }
    }

    /// Unsubscribe one channel and forget it.
    pub async fn unsubscribe(&self, link: &dyn TransportLink, channel: &str) -> Result<(), CoreError> {
        if self.registry.remove(channel).is_some() {
            link.unsubscribe(channel).await?;
            debug!(channel, "unsubscribed");
        }
        Ok(())
    }

    /// Unsubscribe everything in the registry. Failures are logged.
    pub async fn unsubscribe_all(&self, link: &dyn TransportLink) {
        let names: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.unsubscribe(link, &name).await {
                warn!(channel = %name, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Forget all subscriptions without talking to the server.
    pub fn clear(&self) {
        self.registry.clear();
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.registry.get(channel).is_some_and(|s| s.subscribed)
    }

    pub fn subscribed_count(&self) -> usize {
        self.registry.iter().filter(|s| s.subscribed).count()
    }

    /// Map a transport message to an inbound event if its channel binds it.
    pub fn route(&self, channel: &str, event: &str, data: Option<String>) -> Option<InboundEvent> {
        let kind = self.plan.kind_of(channel)?;
        kind.binds(event).then(|| InboundEvent {
            channel: channel.to_owned(),
            event: event.to_owned(),
            payload: data,
        })
    }

    /// Every planned channel with its current registry state.
    pub fn snapshot(&self) -> Vec<ChannelStatus> {
        self.plan
            .channels()
            .iter()
            .map(|planned| {
                let entry = self.registry.get(&planned.name);
                ChannelStatus {
                    name: planned.name.clone(),
                    kind: planned.kind,
                    subscribed: entry.as_ref().is_some_and(|s| s.subscribed),
                    subscribed_at: entry.as_ref().map(|s| s.subscribed_at),
                }
            })
            .collect()
    }

    #[cfg(test)]
    fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

async fn await_ack(
    events: &mut mpsc::Receiver<TransportEvent>,
    channel: &str,
    backlog: &mut Vec<TransportEvent>,
) -> Result<(), CoreError> {
    loop {
        match events.recv().await {
            Some(TransportEvent::SubscriptionSucceeded { channel: acked }) if acked == channel => {
                return Ok(());
            }
            Some(TransportEvent::SubscriptionError {
                channel: failed,
                status,
                message,
            }) if failed == channel => {
                return Err(match status {
                    Some(status @ (401 | 403)) => CoreError::SubscriptionAuth {
                        channel: failed,
                        status,
                    },
                    _ => CoreError::SubscriptionFailed {
                        channel: failed,
                        status,
                        message,
                    },
                });
            }
            Some(TransportEvent::Disconnected { reason }) => {
                return Err(CoreError::TransportClosed { reason });
            }
            Some(other) => backlog.push(other),
            None => {
                return Err(CoreError::TransportClosed {
                    reason: "event stream ended during subscription".into(),
                });
            }
        }
    }
}
