//! Clap derive structures for the `bmsbridge` binary.

use clap::{Args, Parser, Subcommand, ValueEnum};

use bmsbridge_core::SinkKind;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// bmsbridge -- forward BMS real-time events to Kafka, CSV or the log
#[derive(Debug, Parser)]
#[command(
    name = "bmsbridge",
    version,
    about = "Bridge BMS real-time events into an output sink",
    long_about = "Subscribes to organization, location and notification channels on the \
        BMS real-time service, decodes each event and forwards it to one output sink.\n\n\
        All connection settings come from the environment (BMS_BASE_URL, PUSHER_KEY, ...).",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and forward events until interrupted (default)
    Run(RunArgs),

    /// Validate configuration and print the channel plan without connecting
    CheckConfig,

    /// Decode one wire payload (base64 of gzipped JSON) and print it
    Decode(DecodeArgs),
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Override OUTPUT_SINK
    #[arg(long, value_parser = parse_sink)]
    pub sink: Option<SinkKind>,

    /// Override HEALTH_PORT (0 disables the health server)
    #[arg(long)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Wire payload; read from stdin when omitted
    pub payload: Option<String>,

    /// Print compact JSON
    #[arg(long)]
    pub compact: bool,
}

fn parse_sink(value: &str) -> Result<SinkKind, String> {
    value
        .parse()
        .map_err(|_| format!("expected broker, file or console, got '{value}'"))
}
