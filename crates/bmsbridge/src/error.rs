//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use bmsbridge_config::ConfigError;
use bmsbridge_core::{CoreError, DecodeError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONFIG: i32 = 4;
    pub const DECODE: i32 = 5;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Missing required setting {var}")]
    #[diagnostic(
        code(bmsbridge::config_missing),
        help("Export {var} before starting the bridge. Run: bmsbridge check-config")
    )]
    MissingSetting { var: &'static str },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(bmsbridge::config_invalid))]
    InvalidSetting { field: String, reason: String },

    #[error("No credentials configured")]
    #[diagnostic(
        code(bmsbridge::no_credentials),
        help("Set BMS_BEARER_TOKEN, or BMS_USERNAME and BMS_PASSWORD.")
    )]
    NoCredentials,

    #[error("No channels configured")]
    #[diagnostic(
        code(bmsbridge::no_channels),
        help("Set ORGANIZATION_IDS and/or LOCATION_IDS (comma-separated), or SUBSCRIBE_NOTIFICATIONS=true.")
    )]
    NoChannels,

    #[error(transparent)]
    #[diagnostic(code(bmsbridge::config))]
    Config(Box<figment::Error>),

    // ── Authentication ───────────────────────────────────────────────

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(bmsbridge::auth_failed),
        help("Verify BMS_BEARER_TOKEN or the BMS_USERNAME/BMS_PASSWORD pair.")
    )]
    AuthFailed { message: String },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error("Could not start the bridge: {message}")]
    #[diagnostic(code(bmsbridge::startup))]
    Startup { message: String },

    #[error("Health server failed on port {port}")]
    #[diagnostic(
        code(bmsbridge::health_server),
        help("Pick a free port with HEALTH_PORT or --health-port, or disable it with 0.")
    )]
    HealthServer {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    // ── Decode ───────────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(
        code(bmsbridge::decode),
        help("Wire payloads are base64-encoded gzip of a JSON document.")
    )]
    Decode(#[from] DecodeError),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(bmsbridge::json))]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingSetting { .. }
            | Self::InvalidSetting { .. }
            | Self::NoCredentials
            | Self::NoChannels
            | Self::Config(_) => exit_code::CONFIG,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::HealthServer { .. } => exit_code::CONNECTION,
            Self::Decode(_) => exit_code::DECODE,
            Self::Json(_) => exit_code::USAGE,
            Self::Startup { .. } | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { var } => CliError::MissingSetting { var },
            ConfigError::Validation { field, reason } => CliError::InvalidSetting {
                field: field.into(),
                reason,
            },
            ConfigError::MissingCredentials => CliError::NoCredentials,
            ConfigError::Figment(err) => CliError::Config(err),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NoChannels => CliError::NoChannels,
            CoreError::Authentication { message } => CliError::AuthFailed { message },
            CoreError::Decode(e) => CliError::Decode(e),
            CoreError::Config { message } => CliError::InvalidSetting {
                field: "OUTPUT_SINK".into(),
                reason: message,
            },
            other => CliError::Startup {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_share_an_exit_code() {
        let missing: CliError = ConfigError::Missing { var: "PUSHER_KEY" }.into();
        assert_eq!(missing.exit_code(), exit_code::CONFIG);

        let channels: CliError = CoreError::NoChannels.into();
        assert!(matches!(channels, CliError::NoChannels));
        assert_eq!(channels.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn auth_failures_exit_with_auth_code() {
        let err: CliError = CoreError::Authentication {
            message: "bad password".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::AUTH);
        assert!(err.to_string().contains("bad password"));
    }
}
