use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::ledger::DAY_FORMAT;
use rollcall_core::{AttendanceLedger, CancelToken, SamplerLimits};
use rollcall_hw::CameraSource;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

mod config;
mod engine;

use config::Config;
use engine::VideoInput;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the encoding cache from the enrollment corpus
    Enroll,
    /// Mark attendance from still photos
    Photo {
        /// Image files to process
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Mark attendance from a camera or a directory of frames
    Video {
        /// Directory of frame images, read in name order
        #[arg(long, conflicts_with = "device")]
        frames: Option<PathBuf>,
        /// V4L2 device (defaults to the configured camera)
        #[arg(long)]
        device: Option<String>,
        /// Analyse every Nth frame (defaults to the configured interval)
        #[arg(long)]
        interval: Option<usize>,
        /// Stop after this many decoded frames
        #[arg(long)]
        max_frames: Option<usize>,
        /// Stop after this many seconds
        #[arg(long)]
        max_seconds: Option<u64>,
    },
    /// List V4L2 capture devices usable with `video --device`
    Devices,
    /// Print a day's attendance records
    Report {
        /// Day as YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Serialize)]
struct PhotoOutcome {
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<rollcall_core::SessionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct DeviceEntry {
    path: String,
    card: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll => {
            let engine = engine::spawn_engine(&config)?;
            let summary = engine.enroll().await?;
            for warning in &summary.warnings {
                eprintln!("warning: {warning}");
            }
            print_json(&summary)?;
        }
        Commands::Photo { paths } => {
            let engine = engine::spawn_engine(&config)?;
            let mut outcomes = Vec::with_capacity(paths.len());
            for path in paths {
                let outcome = match engine.photo(path.clone()).await {
                    Ok(report) => PhotoOutcome { path, report: Some(report), error: None },
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "photo skipped");
                        PhotoOutcome { path, report: None, error: Some(e.to_string()) }
                    }
                };
                outcomes.push(outcome);
            }
            print_json(&outcomes)?;
        }
        Commands::Video {
            frames,
            device,
            interval,
            max_frames,
            max_seconds,
        } => {
            let input = match frames {
                Some(dir) => VideoInput::Frames(dir),
                None => VideoInput::Device(device.unwrap_or_else(|| config.camera_device.clone())),
            };
            let cancel = CancelToken::new();
            let limits = SamplerLimits {
                max_frames,
                max_duration: max_seconds.map(Duration::from_secs),
                cancel: Some(cancel.clone()),
            };

            let engine = engine::spawn_engine(&config)?;
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received; stopping video session");
                    cancel.cancel();
                }
            });

            let interval = interval.unwrap_or(config.settings.frame_interval);
            let report = engine.video(input, interval, limits).await?;
            if let Some(error) = &report.source_error {
                eprintln!("video source failed: {error}");
            }
            print_json(&report)?;
        }
        Commands::Devices => {
            let devices: Vec<DeviceEntry> = CameraSource::list_devices()
                .into_iter()
                .map(|(path, card)| DeviceEntry { path, card })
                .collect();
            if devices.is_empty() {
                tracing::warn!("no V4L2 capture devices found");
            }
            print_json(&devices)?;
        }
        Commands::Report { date } => {
            let day = match date {
                Some(d) => NaiveDate::parse_from_str(&d, DAY_FORMAT)
                    .with_context(|| format!("invalid date {d:?}, expected YYYY-MM-DD"))?,
                None => chrono::Local::now().date_naive(),
            };
            let ledger = AttendanceLedger::new(&config.settings.ledger_dir);
            let records = ledger
                .records(day)
                .with_context(|| format!("reading {}", ledger.segment_path(day).display()))?;
            print_json(&records)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
