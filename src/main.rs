// Allow dead code - some operations are kept for API completeness
// (manual override entry points are driven by external tooling)
#![allow(dead_code)]

//! Azazel Gateway
//!
//! Network-edge defensive gateway daemon. Ingests intrusion-sensor and
//! honeypot events, scores the threat level of each source, drives the
//! posture state machine and enforces the resulting posture on live traffic.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     AZAZEL GATEWAY                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sensor tailers        ←── eve.json / honeypot log          │
//! │  Threat evaluator      ←── exception → rules → deep         │
//! │  Posture machine       ←── EWMA + hysteresis                │
//! │  Traffic enforcer      ←── iptables / tc, persisted state   │
//! │  Decision recorder     ←── decisions.log + status.json      │
//! │  Notifier              ←── webhook sinks, cooldown dedup    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod config;
mod daemon;
mod enforcer;
mod evaluator;
mod ingest;
mod notify;
mod posture;
mod recorder;
mod types;

use config::{AzazelConfig, ConfigHandle};
use daemon::AzazelDaemon;
use enforcer::{SystemRunner, TrafficEnforcer};
use ingest::{parse_canary_line, LogTailer, SuricataNormalizer};
use notify::CompositeNotifier;
use recorder::DecisionRecorder;
use types::{Clock, SystemClock};

/// Azazel - network-edge defensive gateway
#[derive(Parser, Debug)]
#[command(name = "azazel-gateway")]
#[command(author = "Azazel Contributors")]
#[command(version)]
#[command(about = "Defensive gateway: sensor ingest, threat scoring, posture control, traffic enforcement", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the long-lived daemon
    Serve {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the egress interface from the config
        #[arg(long)]
        interface: Option<String>,
    },

    /// Process the configuration's `events:` feed once and exit
    Events {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the current posture snapshot
    Status {
        /// Path to the YAML configuration file (defaults apply if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Raw JSON output
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    match args.command {
        Command::Serve { config, interface } => serve(config, interface).await,
        Command::Events { config } => run_feed(config).await,
        Command::Status { config, json } => status(config, json),
    }
}

/// Load, override and validate the configuration; fatal on error.
fn load_config(path: &PathBuf, interface: Option<String>) -> anyhow::Result<AzazelConfig> {
    let config = AzazelConfig::load(path)?.with_interface(interface);
    config.validate()?;
    Ok(config)
}

fn build_daemon(handle: Arc<ConfigHandle>, clock: Arc<dyn Clock>) -> Arc<AzazelDaemon> {
    let config = handle.get();
    let enforcer =
        Arc::new(TrafficEnforcer::new(handle.clone(), Arc::new(SystemRunner), clock.clone()));
    let recorder = Arc::new(DecisionRecorder::new(&config.paths));
    let notifier = CompositeNotifier::from_config(&config.notify, clock.clone());
    Arc::new(AzazelDaemon::new(handle, enforcer, recorder, notifier, clock))
}

async fn serve(config_path: PathBuf, interface: Option<String>) -> anyhow::Result<()> {
    let config = load_config(&config_path, interface)?;

    info!("🛡️ Azazel Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("⚙️  Configuration:");
    info!("   Interface: {}", config.network.interface);
    info!("   Thresholds: t0={} t1={} t2={}", config.thresholds.t0_normal, config.thresholds.t1_shield, config.thresholds.t2_lockdown);
    info!("   Sensor log: {:?}", config.paths.suricata_eve);
    info!("   Honeypot log: {:?}", config.paths.opencanary_log);
    info!("   Decision log: {:?}", config.paths.decisions_log);

    let handle = Arc::new(ConfigHandle::new(config.clone(), Some(config_path)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let daemon = build_daemon(handle.clone(), clock);

    if !daemon.initialize().await {
        warn!("Traffic-control setup reported failures; continuing degraded");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(1024);

    // Intrusion sensor: tail + normalize + category filter
    let suricata = SuricataNormalizer::new(&config.soc);
    spawn_sensor(
        LogTailer::new(config.paths.suricata_eve.clone(), true),
        event_tx.clone(),
        stop_rx.clone(),
        move |line| suricata.parse_line(&line),
    );

    // Honeypot: tail + normalize
    spawn_sensor(
        LogTailer::new(config.paths.opencanary_log.clone(), true),
        event_tx.clone(),
        stop_rx.clone(),
        |line| parse_canary_line(&line),
    );
    drop(event_tx);

    let pipeline = tokio::spawn(daemon.clone().event_loop(event_rx, stop_rx.clone()));
    let decay = tokio::spawn(daemon.clone().decay_writer(stop_rx.clone()));
    let trend = tokio::spawn(daemon.clone().trend_sampler(stop_rx.clone()));
    let cleanup = tokio::spawn(daemon.clone().cleanup_task(stop_rx.clone()));
    let deep = tokio::spawn(daemon.clone().deep_worker(stop_rx.clone()));

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    #[cfg(unix)]
    {
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
                _ = hangup.recv() => {
                    info!("🔄 SIGHUP: reloading configuration");
                    if handle.reload() {
                        info!("Configuration reloaded");
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("🛑 Shutdown signal received");
    }

    let _ = stop_tx.send(true);
    for (name, task) in [
        ("pipeline", pipeline),
        ("decay", decay),
        ("trend", trend),
        ("cleanup", cleanup),
        ("deep", deep),
    ] {
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(3), task).await {
            error!("{} task did not stop cleanly: {}", name, e);
        }
    }

    info!("👋 Azazel Gateway shutting down");
    Ok(())
}

/// Spawn one sensor pipeline: raw lines from the tailer, normalized into
/// events for the daemon.
fn spawn_sensor<F>(
    tailer: LogTailer,
    events: mpsc::Sender<types::Event>,
    stop: watch::Receiver<bool>,
    normalize: F,
) where
    F: Fn(String) -> Option<types::Event> + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    tokio::spawn(async move { tailer.run(line_tx, stop).await });
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Some(event) = normalize(line) {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    });
}

async fn run_feed(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path, None)?;
    let handle = Arc::new(ConfigHandle::new(config, None));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
    let daemon = build_daemon(handle, clock);

    daemon.initialize().await;
    let processed = daemon.process_feed().await;
    info!("Processed {} feed event(s)", processed);
    Ok(())
}

fn status(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => load_config(&path, None)?,
        None => AzazelConfig::default(),
    };

    let status_file = config.paths.status_file();
    let Some(snapshot) = recorder::read_status(&status_file) else {
        println!("No snapshot available at {:?} (is the daemon running?)", status_file);
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string(&snapshot)?);
        return Ok(());
    }

    let age = recorder::epoch_now() - snapshot.timestamp;
    println!("Mode:     {}", snapshot.mode);
    println!("Average:  {:.2}", snapshot.average);
    println!("Age:      {:.0}s", age.max(0.0));
    if age > 2.0 * config.trend.sample_interval_secs {
        println!("Warning:  snapshot is stale");
    }
    Ok(())
}
