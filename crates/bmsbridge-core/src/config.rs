// ── Runtime bridge configuration ──
//
// These types describe *what* the bridge connects to and where events go.
// They carry credential data and tuning, but never read the environment.
// `bmsbridge-config` builds a `BridgeConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use bmsbridge_api::PusherEndpoint;

/// How the bridge authenticates with the BMS API.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Static bearer token, used verbatim and never refreshed.
    BearerToken(SecretString),
    /// Email/password login with refresh-token renewal.
    Password {
        username: String,
        password: SecretString,
    },
}

impl Credential {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::BearerToken(_) => "bearer",
            Self::Password { .. } => "password",
        }
    }
}

/// Pusher application coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherSettings {
    pub key: String,
    pub cluster: String,
    /// Replaces `ws-{cluster}.pusher.com`.
    pub host: Option<String>,
    pub encrypted: bool,
}

impl PusherSettings {
    pub fn endpoint(&self) -> PusherEndpoint {
        PusherEndpoint {
            key: self.key.clone(),
            cluster: self.cluster.clone(),
            host: self.host.clone(),
            encrypted: self.encrypted,
        }
    }
}

/// Which channels to subscribe to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSettings {
    pub organization_ids: Vec<String>,
    pub location_ids: Vec<String>,
    pub notifications: bool,
}

/// Linear reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// Retries scheduled after a failed connect before the supervisor gives
    /// up. The initial attempt does not count.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5000),
            max_attempts: 10,
        }
    }
}

/// Where decoded events go. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSelection {
    Broker { brokers: String, topic: String },
    File { path: PathBuf },
    Console,
}

/// Everything the bridge needs to run.
///
/// Built by the binary from the environment, passed to `Bridge`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// API base URL, may carry a path prefix.
    pub base_url: Url,
    pub pusher: PusherSettings,
    pub credential: Credential,
    pub channels: ChannelSettings,
    pub reconnect: ReconnectPolicy,
    pub sink: SinkSelection,
    /// HTTP request timeout for auth calls.
    pub timeout: Duration,
    /// Extra CA certificate (PEM) trusted for the auth API.
    pub ca_cert: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_in_attempt() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(250),
            max_attempts: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(750));
    }

    #[test]
    fn endpoint_carries_host_override() {
        let settings = PusherSettings {
            key: "k".into(),
            cluster: "eu".into(),
            host: Some("127.0.0.1:6001".into()),
            encrypted: false,
        };
        let endpoint = settings.endpoint();
        assert_eq!(endpoint.host.as_deref(), Some("127.0.0.1:6001"));
        assert!(!endpoint.encrypted);
    }
}
