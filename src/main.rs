use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use telemetry_stream_rs::adapters::VehicleProfile;
use telemetry_stream_rs::{
    detect_sources, DataStreamController, Snapshot, SourceConfig, TelemetryConfig,
};

#[derive(Parser, Debug)]
#[command(name = "telemetry_stream")]
#[command(about = "Vehicle telemetry acquisition with Kalman sensor fusion", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON configuration file; without one a simulated vehicle is used
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Output directory for the snapshot log
    #[arg(long, default_value = "telemetry_sessions")]
    output_dir: PathBuf,

    /// Override the IMU bias settling window
    #[arg(long)]
    settle_secs: Option<f64>,

    /// Override the poll period
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Seconds between status lines
    #[arg(long, default_value = "2")]
    status_interval: u64,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let mut config = match &args.config {
        Some(path) => TelemetryConfig::load(path)?,
        None => TelemetryConfig::default(),
    };
    if let Some(settle) = args.settle_secs {
        config.fusion.settle_secs = settle;
    }
    if let Some(poll_ms) = args.poll_ms {
        config.pipeline.poll_period_ms = poll_ms;
    }
    if config.sources.is_empty() {
        // Park the simulated vehicle a little longer than the settling window
        let profile = VehicleProfile {
            still_secs: config.fusion.settle_secs + 5.0,
            ..VehicleProfile::default()
        };
        config.sources.push(SourceConfig::Simulated {
            profile,
            gps_id: "gps".to_string(),
            imu_id: "imu".to_string(),
            can_id: Some("can".to_string()),
        });
    }

    println!("[{}] Telemetry stream starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Poll period: {} ms", config.pipeline.poll_period_ms);
    println!("  Settle window: {:.0} s", config.fusion.settle_secs);
    println!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let log_path = args
        .output_dir
        .join(format!("telemetry_{}.jsonl", ts_now_clean()));
    let mut out = BufWriter::new(
        File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?,
    );

    let adapters = detect_sources(&config.sources);
    let controller = DataStreamController::new(config, adapters)?;
    let (subscriber, snapshots) = controller.subscribe_channel(64);
    controller.start().context("Failed to start poll thread")?;

    let start = Instant::now();
    let run_for = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let status_every = Duration::from_secs(args.status_interval.max(1));
    let mut last_status = Instant::now();
    let mut written = 0u64;

    loop {
        if run_for.is_some_and(|limit| start.elapsed() >= limit) {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }

        match snapshots.recv_timeout(Duration::from_millis(200)) {
            Ok(snapshot) => {
                serde_json::to_writer(&mut out, &snapshot)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_status.elapsed() >= status_every {
            println!("[{}] {}", ts_now(), status_line(&controller.get_latest_snapshot()));
            let health: Vec<String> = controller
                .get_health()
                .iter()
                .map(|(id, state)| format!("{} {}", id, state))
                .collect();
            println!("           Health: {}", health.join(" | "));
            last_status = Instant::now();
        }
    }

    controller.stop();
    out.flush()?;

    let stats = controller.subscriber_stats(subscriber).unwrap_or_default();
    println!("\n=== Final Stats ===");
    println!("Snapshots published: {}", controller.store().sequence());
    println!("Snapshots written: {} ({} dropped) to {}", written, stats.dropped, log_path.display());
    for report in controller.get_health_report() {
        println!(
            "  {:<8} {:<11} reads {:>6}  timeouts {:>6}  errors {:>4}  rejected {:>4}  reconnects {}",
            report.source_id,
            report.state.to_string(),
            report.reads,
            report.timeouts,
            report.errors,
            report.rejected,
            report.reconnects
        );
    }
    Ok(())
}

/// One-line summary of a snapshot. `Heading` is already in degrees.
fn status_line(snapshot: &Snapshot) -> String {
    let channel = |name: &str| snapshot.sample.get(name).unwrap_or(f64::NAN);
    format!(
        "#{} {} | speed {:.2} m/s heading {:.1}° ±{:.1} m | rpm {:.0}",
        snapshot.sequence,
        snapshot.fusion_status,
        channel("Speed"),
        channel("Heading"),
        channel("PositionUncertainty"),
        channel("RPM")
    )
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use telemetry_stream_rs::{CanonicalSample, FusionStatus};

    #[test]
    fn test_status_line_prints_heading_degrees() {
        let channels: BTreeMap<String, f64> = [
            ("Speed", 27.0),
            ("Heading", 90.0),
            ("PositionUncertainty", 3.25),
            ("RPM", 2400.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let snapshot = Snapshot {
            sequence: 7,
            timestamp: 1.0,
            fusion_status: FusionStatus::Tracking,
            sample: CanonicalSample {
                timestamp: 1.0,
                channels,
                raw: BTreeMap::new(),
            },
        };
        let line = status_line(&snapshot);
        assert!(line.starts_with("#7 "), "{}", line);
        assert!(line.contains("speed 27.00 m/s heading 90.0°"), "{}", line);
        assert!(line.contains("rpm 2400"), "{}", line);
    }
}
