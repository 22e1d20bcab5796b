mod cli;
mod error;
mod health;

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use figment::providers::Serialized;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bmsbridge_config::AppConfig;
use bmsbridge_core::{Bridge, BridgeSignal, ChannelPlan, SinkKind, SinkSelection, codec};

use crate::cli::{Cli, Command, DecodeArgs, LogFormat, RunArgs};
use crate::error::CliError;
use crate::health::HealthServer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.log_format);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => serve(args).await,
        Command::CheckConfig => check_config(),
        Command::Decode(args) => decode(args),
    }
}

// ── run ──────────────────────────────────────────────────────────────

fn load_config(args: &RunArgs) -> Result<AppConfig, CliError> {
    let mut figment = bmsbridge_config::figment();
    if let Some(sink) = args.sink {
        figment = figment.merge(Serialized::default("output_sink", sink.as_ref()));
    }
    let mut config = bmsbridge_config::from_figment(&figment)?;
    if let Some(port) = args.health_port {
        config.health_port = (port != 0).then_some(port);
    }
    Ok(config)
}

async fn serve(args: RunArgs) -> Result<(), CliError> {
    let config = load_config(&args)?;
    let bridge = Arc::new(Bridge::from_config(&config.bridge)?);

    info!(
        base_url = %config.bridge.base_url,
        auth = config.bridge.credential.mode(),
        sink = %SinkKind::from(&config.bridge.sink),
        "starting bridge"
    );

    let health = match config.health_port {
        Some(port) => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let server = HealthServer::start(addr, Arc::clone(&bridge))
                .await
                .map_err(|source| CliError::HealthServer { port, source })?;
            Some(server)
        }
        None => None,
    };

    let watcher = tokio::spawn(log_signals(bridge.signals()));
    bridge.connect().await;

    shutdown_signal().await;
    info!("shutdown requested");

    bridge.shutdown().await;
    watcher.abort();
    if let Some(server) = health {
        server.stop().await;
    }

    let metrics = bridge.metrics();
    info!(
        received = metrics.events_received,
        bytes = metrics.bytes_received,
        delivered = metrics.events_delivered,
        decode_failures = metrics.decode_failures,
        delivery_failures = metrics.delivery_failures,
        "bridge stopped"
    );
    Ok(())
}

/// Surface the terminal halt loudly; everything else is already logged
/// by the supervisor.
async fn log_signals(mut signals: broadcast::Receiver<BridgeSignal>) {
    loop {
        match signals.recv().await {
            Ok(BridgeSignal::MaxReconnectAttemptsExceeded { attempts }) => {
                error!(
                    attempts,
                    "reconnect attempts exhausted, bridge halted until restarted"
                );
            }
            Ok(BridgeSignal::ConnectionRejected { reason }) => {
                error!(%reason, "server rejected the bridge, halted until restarted");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "signal watcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ── check-config ─────────────────────────────────────────────────────

fn check_config() -> Result<(), CliError> {
    let config = bmsbridge_config::load()?;
    let bridge = &config.bridge;
    let plan = ChannelPlan::from_settings(&bridge.channels)?;

    println!("API:          {}", bridge.base_url);
    println!("Auth:         {}", bridge.credential.mode());
    match bridge.pusher.endpoint().url() {
        Ok(url) => println!("Realtime:     {url}"),
        Err(e) => {
            return Err(CliError::InvalidSetting {
                field: "PUSHER_HOST".into(),
                reason: e.to_string(),
            });
        }
    }
    println!(
        "Reconnect:    {}ms base, {} attempts",
        bridge.reconnect.base_delay.as_millis(),
        bridge.reconnect.max_attempts
    );
    match &bridge.sink {
        SinkSelection::Broker { brokers, topic } => {
            println!("Sink:         broker {brokers} -> {topic}");
        }
        SinkSelection::File { path } => println!("Sink:         file {}", path.display()),
        SinkSelection::Console => println!("Sink:         console"),
    }
    match config.health_port {
        Some(port) => println!("Health:       :{port}"),
        None => println!("Health:       disabled"),
    }

    println!("Channels ({}):", plan.len());
    for channel in plan.channels() {
        println!(
            "  {:<40} {:<14} {}",
            channel.name,
            channel.kind.to_string(),
            channel.kind.bound_events().join(", ")
        );
    }
    Ok(())
}

// ── decode ───────────────────────────────────────────────────────────

fn decode(args: DecodeArgs) -> Result<(), CliError> {
    let payload = match args.payload {
        Some(payload) => payload,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let value = codec::decode(&payload)?;
    let rendered = if args.compact {
        serde_json::to_string(&value)?
    } else {
        serde_json::to_string_pretty(&value)?
    };
    println!("{rendered}");
    Ok(())
}
