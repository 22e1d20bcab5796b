//! Environment configuration for the BMS event bridge.
//!
//! Reads the process environment through figment, applies defaults, and
//! validates the result into a `bmsbridge_core::BridgeConfig` plus the
//! binary-only settings (health port). Nothing here touches the network.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use bmsbridge_core::{
    BridgeConfig, ChannelSettings, Credential, PusherSettings, ReconnectPolicy, SinkKind,
    SinkSelection,
};

/// Every variable the bridge reads. Anything else in the environment is
/// ignored.
pub const ENV_VARS: &[&str] = &[
    "BMS_BASE_URL",
    "PUSHER_KEY",
    "PUSHER_CLUSTER",
    "PUSHER_HOST",
    "BMS_BEARER_TOKEN",
    "BMS_USERNAME",
    "BMS_PASSWORD",
    "BMS_CA_CERT",
    "ORGANIZATION_IDS",
    "LOCATION_IDS",
    "SUBSCRIBE_NOTIFICATIONS",
    "RECONNECT_DELAY_MS",
    "MAX_RECONNECT_ATTEMPTS",
    "OUTPUT_SINK",
    "KAFKA_BROKERS",
    "KAFKA_TOPIC",
    "OUTPUT_FILE",
    "HTTP_TIMEOUT_SECS",
    "HEALTH_PORT",
];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {var}")]
    Missing { var: &'static str },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("no credentials configured: set BMS_BEARER_TOKEN or BMS_USERNAME and BMS_PASSWORD")]
    MissingCredentials,

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Loaded configuration ────────────────────────────────────────────

pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Everything the binary needs: the bridge itself plus process-level
/// settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    /// `None` when the health endpoint is disabled (`HEALTH_PORT=0`).
    pub health_port: Option<u16>,
}

// ── Raw environment shape ───────────────────────────────────────────

/// Keys are the lowercased variable names. Every value stays the string
/// the environment holds; numbers and flags are parsed in `validate`.
#[derive(Debug, Deserialize, Serialize)]
struct RawEnv {
    bms_base_url: Option<String>,
    pusher_key: Option<String>,
    pusher_cluster: String,
    pusher_host: Option<String>,
    bms_bearer_token: Option<String>,
    bms_username: Option<String>,
    bms_password: Option<String>,
    bms_ca_cert: Option<String>,
    organization_ids: Option<String>,
    location_ids: Option<String>,
    subscribe_notifications: String,
    reconnect_delay_ms: String,
    max_reconnect_attempts: String,
    output_sink: String,
    kafka_brokers: String,
    kafka_topic: String,
    output_file: String,
    http_timeout_secs: String,
    health_port: String,
}

impl Default for RawEnv {
    fn default() -> Self {
        Self {
            bms_base_url: None,
            pusher_key: None,
            pusher_cluster: "eu".into(),
            pusher_host: None,
            bms_bearer_token: None,
            bms_username: None,
            bms_password: None,
            bms_ca_cert: None,
            organization_ids: None,
            location_ids: None,
            subscribe_notifications: "false".into(),
            reconnect_delay_ms: "5000".into(),
            max_reconnect_attempts: "10".into(),
            output_sink: "console".into(),
            kafka_brokers: "localhost:9092".into(),
            kafka_topic: "bms-events".into(),
            output_file: "events.csv".into(),
            http_timeout_secs: "30".into(),
            health_port: DEFAULT_HEALTH_PORT.to_string(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// Defaults merged with the bridge's environment variables.
///
/// The variables are read as raw strings and handed to figment as a
/// serialized map, so values such as `0123` or `1e5` keep their exact text.
pub fn figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(RawEnv::default()))
        .merge(Serialized::defaults(env_strings()))
}

/// The bridge's variables from the process environment, verbatim.
fn env_strings() -> BTreeMap<String, String> {
    Env::raw()
        .only(ENV_VARS)
        .iter()
        .map(|(key, value)| (key.as_str().to_ascii_lowercase(), value))
        .collect()
}

/// Load and validate configuration from the process environment.
pub fn load() -> Result<AppConfig, ConfigError> {
    from_figment(&figment())
}

/// Validate configuration from an arbitrary figment.
pub fn from_figment(figment: &Figment) -> Result<AppConfig, ConfigError> {
    let raw: RawEnv = figment.extract()?;
    validate(raw)
}

fn validate(raw: RawEnv) -> Result<AppConfig, ConfigError> {
    let base_url = text(raw.bms_base_url).ok_or(ConfigError::Missing {
        var: "BMS_BASE_URL",
    })?;
    let base_url = Url::parse(&base_url).map_err(|e| ConfigError::Validation {
        field: "BMS_BASE_URL",
        reason: format!("{e}: {base_url}"),
    })?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation {
            field: "BMS_BASE_URL",
            reason: format!("expected an http(s) URL, got scheme '{}'", base_url.scheme()),
        });
    }

    let pusher = pusher_settings(
        text(raw.pusher_key).ok_or(ConfigError::Missing { var: "PUSHER_KEY" })?,
        text(Some(raw.pusher_cluster)).unwrap_or_else(|| "eu".into()),
        text(raw.pusher_host),
    )?;

    let credential = credential(
        text(raw.bms_bearer_token),
        text(raw.bms_username),
        secret(raw.bms_password),
    )?;

    let channels = ChannelSettings {
        organization_ids: id_list(raw.organization_ids),
        location_ids: id_list(raw.location_ids),
        notifications: flag("SUBSCRIBE_NOTIFICATIONS", &raw.subscribe_notifications)?,
    };

    let max_attempts: u32 = number("MAX_RECONNECT_ATTEMPTS", &raw.max_reconnect_attempts)?;
    if max_attempts == 0 {
        return Err(ConfigError::Validation {
            field: "MAX_RECONNECT_ATTEMPTS",
            reason: "must be at least 1".into(),
        });
    }
    let reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(number("RECONNECT_DELAY_MS", &raw.reconnect_delay_ms)?),
        max_attempts,
    };

    let sink = sink_selection(
        &raw.output_sink,
        raw.kafka_brokers,
        raw.kafka_topic,
        raw.output_file,
    )?;

    let timeout_secs: u64 = number("HTTP_TIMEOUT_SECS", &raw.http_timeout_secs)?;
    if timeout_secs == 0 {
        return Err(ConfigError::Validation {
            field: "HTTP_TIMEOUT_SECS",
            reason: "must be at least 1".into(),
        });
    }
    let health_port: u16 = number("HEALTH_PORT", &raw.health_port)?;

    Ok(AppConfig {
        bridge: BridgeConfig {
            base_url,
            pusher,
            credential,
            channels,
            reconnect,
            sink,
            timeout: Duration::from_secs(timeout_secs),
            ca_cert: text(raw.bms_ca_cert).map(PathBuf::from),
        },
        health_port: (health_port != 0).then_some(health_port),
    })
}

// ── Field helpers ───────────────────────────────────────────────────

/// Trimmed text, with empty values treated as unset.
fn text(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Like [`text`] but untrimmed: surrounding spaces may be part of a password.
fn secret(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn number<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| ConfigError::Validation {
        field,
        reason: format!("{e}: '{value}'"),
    })
}

fn id_list(value: Option<String>) -> Vec<String> {
    text(value)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn flag(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(ConfigError::Validation {
            field,
            reason: format!("expected true/false/1/0, got '{other}'"),
        }),
    }
}

/// `PUSHER_HOST` may carry a `ws://` or `wss://` scheme; `ws://` turns
/// TLS off. A bare host keeps TLS on.
fn pusher_settings(
    key: String,
    cluster: String,
    host: Option<String>,
) -> Result<PusherSettings, ConfigError> {
    let (host, encrypted) = match host {
        None => (None, true),
        Some(h) => {
            let (rest, encrypted) = if let Some(rest) = h.strip_prefix("ws://") {
                (rest, false)
            } else if let Some(rest) = h.strip_prefix("wss://") {
                (rest, true)
            } else if h.contains("://") {
                return Err(ConfigError::Validation {
                    field: "PUSHER_HOST",
                    reason: format!("unsupported scheme in '{h}', expected ws:// or wss://"),
                });
            } else {
                (h.as_str(), true)
            };
            let rest = rest.trim_end_matches('/');
            if rest.is_empty() {
                return Err(ConfigError::Validation {
                    field: "PUSHER_HOST",
                    reason: "host is empty".into(),
                });
            }
            (Some(rest.to_owned()), encrypted)
        }
    };

    Ok(PusherSettings {
        key,
        cluster,
        host,
        encrypted,
    })
}

fn credential(
    bearer: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<Credential, ConfigError> {
    match (bearer, username, password) {
        (Some(token), username, password) => {
            if username.is_some() || password.is_some() {
                warn!("both BMS_BEARER_TOKEN and BMS_USERNAME/BMS_PASSWORD are set, using the bearer token");
            }
            Ok(Credential::BearerToken(SecretString::from(token)))
        }
        (None, Some(username), Some(password)) => Ok(Credential::Password {
            username,
            password: SecretString::from(password),
        }),
        (None, Some(_), None) => Err(ConfigError::Missing {
            var: "BMS_PASSWORD",
        }),
        (None, None, Some(_)) => Err(ConfigError::Missing {
            var: "BMS_USERNAME",
        }),
        (None, None, None) => Err(ConfigError::MissingCredentials),
    }
}

fn sink_selection(
    kind: &str,
    brokers: String,
    topic: String,
    file: String,
) -> Result<SinkSelection, ConfigError> {
    let kind: SinkKind = kind.trim().parse().map_err(|_| ConfigError::Validation {
        field: "OUTPUT_SINK",
        reason: format!("expected broker, file or console, got '{kind}'"),
    })?;

    let required = |field: &'static str, value: String| {
        text(Some(value)).ok_or(ConfigError::Validation {
            field,
            reason: "must not be empty".into(),
        })
    };

    Ok(match kind {
        SinkKind::Broker => SinkSelection::Broker {
            brokers: required("KAFKA_BROKERS", brokers)?,
            topic: required("KAFKA_TOPIC", topic)?,
        },
        SinkKind::File => SinkSelection::File {
            path: PathBuf::from(required("OUTPUT_FILE", file)?),
        },
        SinkKind::Console => SinkSelection::Console,
    })
}
