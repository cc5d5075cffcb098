//! RatoNet Field - bond every available uplink towards the relay
//!
//! Discovers network interfaces, probes them and keeps a bonded session to
//! the relay alive. The encoder pushes to the ingest URL printed at startup.
//!
//! Examples:
//!   rato-field --print-example > field.toml
//!   rato-field --config field.toml
//!   FIELD_INTERFACES=wwan0,wlan0 rato-field --config field.toml --native

use anyhow::Context;
use clap::Parser;
use crossbeam::channel;
use rato::{BondingEngine, LinkMonitor};
use rato_cli::config::Config;
use rato_cli::stats::display_bonding_status;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rato-field")]
#[command(about = "Bonded multi-link uplink for field streaming", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,

    /// Never use the dedicated bonding sender
    #[arg(long)]
    native: bool,

    /// Relay receive port (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

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

/// Run id distinguishing this session from earlier ones of the same streamer
fn new_run_id() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
        .max(1)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.print_example {
        print!("{}", toml::to_string_pretty(&Config::example_field())?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.field.get_or_insert_with(Default::default);
    config.apply_env().context("Invalid environment override")?;

    let Some(field) = config.field.as_mut() else {
        anyhow::bail!("Configuration has no [field] section");
    };
    if args.native {
        field.dedicated_sender = None;
    }
    if let Some(port) = args.port {
        field.server_port = port;
    }
    field.validate()?;

    tracing::info!("RatoNet field agent starting...");
    let (events_tx, events_rx) = channel::unbounded();
    let mut monitor = LinkMonitor::spawn(
        field.monitor_config()?,
        Arc::new(field.probe()),
        Arc::new(field.interface_source()),
        events_tx,
    )
    .context("Cannot start link monitor")?;

    let run_id = new_run_id();
    let mut engine = BondingEngine::spawn(field.engine_config()?, run_id, events_rx)
        .context("Cannot start bonding engine")?;

    let stats_interval = field.stats_interval();
    let mut last_stats = Instant::now();
    let mut announced: Option<String> = None;
    while !engine.is_finished() {
        thread::sleep(Duration::from_millis(250));

        let url = engine.ingest_url();
        if url.is_some() && url != announced {
            if let Some(url) = &url {
                info!(ingest = %url, "Encoder ingest ready");
            }
            announced = url;
        }

        if last_stats.elapsed() >= stats_interval {
            display_bonding_status(&engine.status());
            last_stats = Instant::now();
        }
    }

    let status = engine.status();
    if let Some(failure) = &status.last_failure {
        warn!(lifecycle = %status.lifecycle, failure = %failure, "Bonding session ended");
    } else {
        info!(lifecycle = %status.lifecycle, "Bonding session ended");
    }
    monitor.stop();
    engine.stop();
    Ok(())
}
