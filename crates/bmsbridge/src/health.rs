//! Health and introspection HTTP endpoints.
//!
//! `/health` answers 200 only while every channel is subscribed, so
//! orchestrators restart or alert on a bridge that stopped retrying.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bmsbridge_core::Bridge;

/// Build the router over a shared bridge.
pub fn build_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/channels", get(channels_handler))
        .with_state(bridge)
}

/// A running health server.
pub struct HealthServer {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthServer {
    /// Bind `addr` and serve until [`stop`](Self::stop).
    pub async fn start(addr: SocketAddr, bridge: Arc<Bridge>) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let router = build_router(bridge);
        let shutdown = cancel.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "health server stopped with error");
            }
        });

        info!(%addr, "health server listening");
        Ok(Self { addr, cancel, task })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "health server task ended abnormally");
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let status = bridge.status();
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn status_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.status())
}

async fn metrics_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.metrics())
}

async fn channels_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    Json(bridge.channels())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use bmsbridge_core::sink::LogSink;
    use bmsbridge_core::{
        AuthApi, BridgeConfig, ChannelSettings, ConnectionState, CoreError, Credential,
        OpenedTransport, PusherSettings, ReconnectPolicy, SinkSelection, TokenGrant, Transport,
        TransportEvent, TransportLink,
    };

    use super::*;

    struct NoAuth;

    #[async_trait]
    impl AuthApi for NoAuth {
        async fn login(&self, _: &str, _: &SecretString) -> Result<TokenGrant, CoreError> {
            Err(CoreError::Internal("login not expected".into()))
        }

        async fn refresh(&self, _: &SecretString) -> Result<TokenGrant, CoreError> {
            Err(CoreError::Internal("refresh not expected".into()))
        }
    }

    /// Acknowledges every subscription immediately.
    struct AckTransport;

    struct AckLink {
        tx: mpsc::Sender<TransportEvent>,
    }

    #[async_trait]
    impl TransportLink for AckLink {
        fn socket_id(&self) -> &str {
            "1.1"
        }

        async fn subscribe(&self, channel: &str) -> Result<(), CoreError> {
            self.tx
                .send(TransportEvent::SubscriptionSucceeded {
                    channel: channel.to_owned(),
                })
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))
        }

        async fn unsubscribe(&self, _: &str) -> Result<(), CoreError> {
            Ok(())
        }

        fn close(&self) {}
    }

    #[async_trait]
    impl Transport for AckTransport {
        async fn open(&self, _: &SecretString) -> Result<OpenedTransport, CoreError> {
            let (tx, events) = mpsc::channel(16);
            Ok(OpenedTransport {
                link: Box::new(AckLink { tx }),
                events,
            })
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            base_url: "https://api.example.com".parse().unwrap(),
            pusher: PusherSettings {
                key: "k".into(),
                cluster: "eu".into(),
                host: None,
                encrypted: true,
            },
            credential: Credential::BearerToken(SecretString::from("t")),
            channels: ChannelSettings {
                organization_ids: vec![],
                location_ids: vec!["loc-1".into()],
                notifications: true,
            },
            reconnect: ReconnectPolicy::default(),
            sink: SinkSelection::Console,
            timeout: Duration::from_secs(5),
            ca_cert: None,
        }
    }

    async fn serve() -> (Arc<Bridge>, HealthServer) {
        let bridge = Arc::new(
            Bridge::new(
                &config(),
                Arc::new(NoAuth),
                Arc::new(AckTransport),
                Arc::new(LogSink::new()),
            )
            .unwrap(),
        );
        let server = HealthServer::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&bridge))
            .await
            .unwrap();
        (bridge, server)
    }

    async fn get_json(server: &HealthServer, path: &str) -> (u16, Value) {
        let response = reqwest::get(format!("http://{}{path}", server.addr))
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn health_is_unavailable_before_connecting() {
        let (_bridge, server) = serve().await;

        let (status, body) = get_json(&server, "/health").await;
        assert_eq!(status, 503);
        assert_eq!(body["state"]["state"], "disconnected");
        assert_eq!(body["sink"], "console");

        server.stop().await;
    }

    #[tokio::test]
    async fn health_is_ok_once_subscribed() {
        let (bridge, server) = serve().await;
        let mut state = bridge.watch_state();
        bridge.connect().await;
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        let (status, body) = get_json(&server, "/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["reconnect_attempts"], 0);
        assert_eq!(body["halted"], false);

        let (_, channels) = get_json(&server, "/channels").await;
        let names: Vec<&str> = channels
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["private-location-loc-1", "notifications"]);
        assert!(channels.as_array().unwrap().iter().all(|c| c["subscribed"] == true));

        bridge.shutdown().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn metrics_start_at_zero() {
        let (_bridge, server) = serve().await;

        let (status, body) = get_json(&server, "/metrics").await;
        assert_eq!(status, 200);
        assert_eq!(body["events_received"], 0);
        assert_eq!(body["bytes_received"], 0);
        assert_eq!(body["messages_per_second"], 0.0);
        assert_eq!(body["decode_failures"], 0);
        assert!(body["last_event_at"].is_null());

        server.stop().await;
    }
}
