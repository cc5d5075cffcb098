//! RatoNet Relay - bonded ingest, health scoring and restreaming
//!
//! Opens a receive session for every configured streamer, scores its uplink,
//! drives the production scene and publishes the feed to each enabled
//! destination.
//!
//! Examples:
//!   rato-server --print-example > relay.toml
//!   rato-server --config relay.toml
//!   SRT_BASE_PORT=7000 RTMP_PRIMARY_URL=rtmp://... rato-server

use anyhow::Context;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use rato_cli::config::{Config, RelaySection};
use rato_cli::stats::display_sessions;
use rato::relay::RelayEvent;
use rato::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rato-server")]
#[command(about = "Bonded uplink relay with health-driven scene control", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,

    /// Only open these streamers (default: every configured streamer)
    #[arg(long)]
    open: Vec<String>,

    /// Keep a session closed after its uplink goes idle
    #[arg(long)]
    no_reopen: bool,

    /// Statistics interval in seconds
    #[arg(long, default_value = "10")]
    stats: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::Receive {
            streamer_id, state, ..
        } => info!(streamer = %streamer_id, state = %state, "Receive state"),
        RelayEvent::Health(t) => info!(
            streamer = %t.streamer_id,
            from = %t.from,
            to = %t.to,
            score = t.score,
            "Health transition"
        ),
        RelayEvent::Relay {
            streamer_id,
            platform,
            state,
            restarts,
            ..
        } => info!(
            streamer = %streamer_id,
            destination = %platform,
            state = %state,
            restarts,
            "Publisher state"
        ),
        RelayEvent::Failed {
            streamer_id,
            platform,
            restarts,
            last_exit,
            ..
        } => error!(
            streamer = %streamer_id,
            destination = %platform,
            restarts,
            last_exit = last_exit.as_deref().unwrap_or("-"),
            "Publisher gave up"
        ),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.print_example {
        print!("{}", toml::to_string_pretty(&Config::example_relay())?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.relay.get_or_insert_with(RelaySection::default);
    config.apply_env().context("Invalid environment override")?;
    config.validate()?;

    let Some(relay) = config.relay.as_mut() else {
        anyhow::bail!("Configuration has no [relay] section");
    };
    if args.no_reopen {
        relay.ingest.auto_reopen = false;
    }

    tracing::info!("RatoNet relay starting...");
    let server = RelayServer::spawn(
        relay.relay_config()?,
        Arc::new(relay.directory()),
        Arc::new(relay.launcher()),
        relay.switcher()?,
    )
    .context("Cannot start relay server")?;
    let handle = server.handle();
    let events = handle.subscribe()?;

    let streamers: Vec<String> = if args.open.is_empty() {
        relay.streamers.iter().map(|s| s.id.clone()).collect()
    } else {
        args.open.clone()
    };
    if streamers.is_empty() {
        warn!("No streamers configured; nothing to receive");
    }
    for streamer in &streamers {
        match handle.open(streamer) {
            Ok(port) => info!(streamer = %streamer, port, "Session open"),
            Err(e) => warn!(streamer = %streamer, error = %e, "Cannot open session"),
        }
    }

    let stats_interval = Duration::from_secs(args.stats.max(1));
    let mut last_stats = Instant::now();
    loop {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => log_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_stats.elapsed() >= stats_interval {
            match handle.snapshot() {
                Ok(sessions) => display_sessions(&sessions),
                Err(e) => {
                    warn!(error = %e, "Relay server stopped answering");
                    break;
                }
            }
            last_stats = Instant::now();
        }
    }

    server.shutdown();
    Ok(())
}
