//! # fakedev-exporter
//!
//! Entrypoint wiring: load the device identity config, build the simulation
//! engine, admit the optional baseline workload files, then run the
//! Unix-socket workload listener and the HTTP scrape endpoint until a
//! termination signal arrives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::info;

use fakedev_config::DevInfo;
use fakedev_engine::{admission_queue, encode, SimulationEngine};
use fakedev_server::{listen_for_workloads, listen_metrics};
use fakedev_telemetry::EventLogger;

#[derive(Parser, Debug)]
#[command(version, about = "Simulates a fleet of devices for metrics-exporter testing")]
struct Args {
    /// Address to listen on for metric queries
    #[arg(long, default_value = "0.0.0.0:9999")]
    address: String,

    /// Number of devices (of the configured type) to simulate
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// JSON config file for device type labels + metric limits
    #[arg(long, default_value = "devtype.json")]
    devtype: PathBuf,

    /// JSON config file for per-device instance labels
    #[arg(long, default_value = "devlist.json")]
    devlist: PathBuf,

    /// JSON config file for metric exporter identity
    #[arg(long, default_value = "identity.json")]
    identity: PathBuf,

    /// Unix socket for workload communication
    #[arg(long, default_value = "/tmp/fakedev-exporter")]
    socket: PathBuf,

    /// JSON file specifying a baseline workload for even numbered devices
    #[arg(long)]
    wl_even: Option<PathBuf>,

    /// JSON file specifying a baseline workload for odd numbered devices
    #[arg(long)]
    wl_odd: Option<PathBuf>,

    /// JSON file specifying a baseline workload for all devices
    #[arg(long)]
    wl_all: Option<PathBuf>,

    /// Stand-in duration for activity segments with zero/missing seconds
    #[arg(long, default_value_t = 86400)]
    fallback_seconds: u64,

    /// Seed for the fluctuation randomness; omit for a random run
    #[arg(long)]
    seed: Option<u64>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    EventLogger::init();
    let args = Args::parse();
    info!("{} v{}", encode::PROJECT, encode::VERSION);

    let devinfo = Arc::new(DevInfo::load(
        args.count,
        &args.devtype,
        &args.devlist,
        &args.identity,
    )?);
    for (dev, labels) in devinfo.device_labels.iter().enumerate() {
        for label in labels {
            info!(dev, name = %label.name, value = %label.value, "device label");
        }
    }

    let (queue_tx, queue_rx) = admission_queue();
    let mut engine = SimulationEngine::new(
        Arc::clone(&devinfo),
        queue_rx,
        args.seed,
        Duration::from_secs(args.fallback_seconds),
    );

    let devcount = devinfo.device_count();
    load_baseline(&mut engine, args.wl_even.as_deref(), devcount, |i| i % 2 == 0).await?;
    load_baseline(&mut engine, args.wl_odd.as_deref(), devcount, |i| i % 2 != 0).await?;
    load_baseline(&mut engine, args.wl_all.as_deref(), devcount, |_| true).await?;

    let engine = Arc::new(Mutex::new(engine));
    let socket = args.socket.clone();
    let ipc = tokio::spawn(async move { listen_for_workloads(&socket, queue_tx).await });
    let address = args.address.clone();
    let http = tokio::spawn(async move { listen_metrics(&address, engine).await });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = sigint.recv() => info!("got SIGINT, terminating"),
        _ = sigterm.recv() => info!("got SIGTERM, terminating"),
        _ = sighup.recv() => info!("got SIGHUP, terminating"),
        result = ipc => result??,
        result = http => result??,
    }
    Ok(())
}

/// Admits a baseline workload file against the devices passing the filter.
/// An unreadable file aborts startup; an invalid descriptor is only logged,
/// like any other rejected submission.
async fn load_baseline(
    engine: &mut SimulationEngine,
    path: Option<&Path>,
    devcount: usize,
    select: impl Fn(usize) -> bool,
) -> Result<(), BoxError> {
    let Some(path) = path else {
        return Ok(());
    };
    let text = std::fs::read(path)
        .map_err(|err| format!("unable to read workload file '{}': {err}", path.display()))?;
    let preset: HashSet<usize> = (0..devcount).filter(|&i| select(i)).collect();
    engine.admit(&text, Some(preset), None).await;
    Ok(())
}
