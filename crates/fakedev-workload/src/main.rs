//! # fakedev-workload
//!
//! Companion workload client: builds a workload descriptor from flags or a
//! JSON file, submits it to the exporter's Unix socket, then blocks until
//! the server sends the single status byte and exits with that code. The
//! server only settles the connection when a scrape drives its engine, so
//! this client may wait for as long as the workload runs.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::info;

use fakedev_engine::{ProfileSpec, WorkloadSpec};
use fakedev_telemetry::EventLogger;

#[derive(Parser, Debug)]
#[command(version, about = "Registers a simulated workload with fakedev-exporter")]
struct Args {
    /// Workload / pod name
    #[arg(long, default_value = "Workload")]
    name: String,

    /// How many times the activity is simulated, 0 = forever
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Comma separated list of '<load>:<fluctuation>:<seconds>' device
    /// utilization percentages and duration
    #[arg(long, default_value = "98:1:0")]
    activity: String,

    /// Comma separated list of device file names to simulate activity on;
    /// empty leaves device selection to the server
    #[arg(long)]
    devnames: Option<String>,

    /// Unix socket for workload communication
    #[arg(long, default_value = "/tmp/fakedev-exporter")]
    socket: PathBuf,

    /// JSON workload spec file, alternative way of providing name, repeat
    /// and activity information
    #[arg(long)]
    json: Option<PathBuf>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Parses one 'load:fluctuation:seconds' triple per comma-separated item.
fn parse_activity(spec: &str) -> Result<Vec<ProfileSpec>, BoxError> {
    let mut profile = Vec::new();
    for act in spec.split(',') {
        let parts: Vec<&str> = act.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("profile '{act}' is not 3 colon-separated integers").into());
        }
        let load: i64 = parts[0].parse()?;
        let fluctuation: i64 = parts[1].parse()?;
        let seconds: u64 = parts[2].parse()?;
        if !(0..=100).contains(&load) || fluctuation > load {
            return Err(format!(
                "invalid load ({load} not within 0-100) or fluctuation ({fluctuation} > load) in '{act}'"
            )
            .into());
        }
        profile.push(ProfileSpec {
            load,
            fluctuation,
            seconds,
        });
    }
    Ok(profile)
}

fn build_spec(args: &Args) -> Result<WorkloadSpec, BoxError> {
    let mut spec = match &args.json {
        // The JSON file provides the whole descriptor; flags below only
        // fill in what it leaves empty.
        Some(path) => {
            let text = std::fs::read(path)
                .map_err(|err| format!("unable to read spec file '{}': {err}", path.display()))?;
            serde_json::from_slice(&text)
                .map_err(|err| format!("unmarshaling spec file '{}' failed: {err}", path.display()))?
        }
        None => {
            let mut spec = WorkloadSpec {
                name: args.name.clone(),
                repeat: args.repeat,
                ..Default::default()
            };
            spec.profile = parse_activity(&args.activity)?;
            spec
        }
    };
    if let Some(devnames) = &args.devnames {
        spec.devices = devnames.split(',').map(str::to_string).collect();
    }
    if spec.name.is_empty() {
        return Err("workload name is missing".into());
    }
    if spec.profile.is_empty() {
        return Err("no workload activity specified".into());
    }
    Ok(spec)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    EventLogger::init();
    let args = Args::parse();

    let spec = build_spec(&args)?;
    let msg = serde_json::to_vec_pretty(&spec)?;
    info!(workload = %String::from_utf8_lossy(&msg), "submitting workload");

    let mut conn = UnixStream::connect(&args.socket).await.map_err(|err| {
        format!(
            "connection to exporter unix socket '{}' failed: {err}",
            args.socket.display()
        )
    })?;
    conn.write_all(&msg).await?;

    // Wait until the server tells us to exit with the given code.
    let mut buf = [0u8; 8];
    let n = conn.read(&mut buf).await?;
    if n == 0 {
        return Err("exporter closed the connection without a status code".into());
    }
    let code: i32 = std::str::from_utf8(&buf[..n])?.trim().parse()?;
    info!(code, "exiting with code returned by server");
    std::process::exit(code);
}
