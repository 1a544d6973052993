//! `bloom-scan`: command-line driver for the scan capture orchestrator.
//!
//! Runs one rotational scan against the hardware backend subprocess (or a
//! built-in simulated backend with `--mock`), streams progress to stderr via
//! the log, and exits non-zero if the scan does not complete.

use anyhow::{bail, Context, Result};
use bloom_scan::config::Settings;
use bloom_scan::events::{EventKind, ScanEvent};
use bloom_scan::metadata::{Experiment, InMemoryMetadataStore, MetadataStore, Phenotyper};
use bloom_scan::orchestrator::ScanOrchestrator;
use bloom_scan::scan::ScanRequest;
use bloom_scan::storage::FsScanStore;
use bloom_scan::transport::{ProcessTransportFactory, SimulatedTransportFactory, TransportFactory};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "bloom-scan", about = "Run one rotational plant scan")]
struct Cli {
    /// Path to a TOML settings file layered over config/default.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the built-in simulated hardware backend instead of spawning the
    /// real subprocess.
    #[arg(long)]
    mock: bool,

    #[arg(long, default_value = "EXP-042")]
    experiment_id: String,

    #[arg(long, default_value = "PH-7")]
    phenotyper_id: String,

    #[arg(long, default_value = "PLT-000123")]
    plant_barcode: String,

    /// Accession name; resolved from the barcode when omitted.
    #[arg(long)]
    accession_name: Option<String>,

    /// Camera exposure in microseconds.
    #[arg(long, default_value_t = 12_000)]
    exposure_us: u32,

    #[arg(long, default_value_t = 1.0)]
    gain: f64,

    #[arg(long)]
    brightness: Option<f64>,

    #[arg(long)]
    contrast: Option<f64>,

    #[arg(long, default_value_t = 1.0)]
    gamma: f64,

    /// Seconds for one full turntable rotation.
    #[arg(long, default_value_t = 7.2)]
    rotation_seconds: f64,

    /// Frames to capture over the rotation.
    #[arg(long, default_value_t = 72)]
    frames_total: u32,

    #[arg(long)]
    wave_number: Option<u32>,

    #[arg(long)]
    plant_age_days: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings =
        Settings::new(cli.config.as_deref()).context("failed to load settings")?;

    // The CLI is a manual driver: register the operator-provided identities
    // so request validation passes without a lab database connection.
    let metadata = InMemoryMetadataStore::new();
    metadata.insert_experiment(Experiment {
        id: cli.experiment_id.clone(),
        name: cli.experiment_id.clone(),
        species: None,
    });
    metadata.insert_phenotyper(Phenotyper {
        id: cli.phenotyper_id.clone(),
        name: cli.phenotyper_id.clone(),
        email: None,
    });
    if let Some(name) = &cli.accession_name {
        metadata.insert_accession(cli.plant_barcode.as_str(), name.as_str());
    }
    let metadata = Arc::new(metadata);

    let accession_name = match &cli.accession_name {
        Some(name) => name.clone(),
        None => metadata
            .accession_name(&cli.plant_barcode)
            .await?
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let request = ScanRequest {
        experiment_id: cli.experiment_id,
        phenotyper_id: cli.phenotyper_id,
        plant_barcode: cli.plant_barcode,
        accession_name,
        exposure_us: cli.exposure_us,
        gain: cli.gain,
        brightness: cli.brightness,
        contrast: cli.contrast,
        gamma: cli.gamma,
        rotation_seconds: cli.rotation_seconds,
        frames_total: cli.frames_total,
        wave_number: cli.wave_number,
        plant_age_days: cli.plant_age_days,
    };

    let factory: Box<dyn TransportFactory> = if cli.mock {
        let frame_interval = Duration::from_secs_f64(
            (request.rotation_seconds / f64::from(request.frames_total)).min(0.05),
        );
        Box::new(SimulatedTransportFactory {
            default_frames: request.frames_total,
            frame_interval,
        })
    } else {
        Box::new(ProcessTransportFactory::new(settings.transport.clone()))
    };

    let handle = ScanOrchestrator::spawn(
        settings,
        factory,
        Arc::new(FsScanStore::new()),
        metadata,
    );

    // Event handlers are sync; forward into a channel so main can await the
    // terminal event.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ScanEvent>();
    let mut tokens = Vec::new();
    for kind in [
        EventKind::Progress,
        EventKind::Complete,
        EventKind::Error,
        EventKind::Cancelled,
    ] {
        let tx = event_tx.clone();
        tokens.push(handle.on(kind, move |event| {
            let _ = tx.send(event.clone());
        }));
    }
    drop(event_tx);

    let session_id = handle.start_scan(request).await?;
    info!("scan {session_id} started");

    let outcome = loop {
        let Some(event) = event_rx.recv().await else {
            bail!("orchestrator stopped before the scan finished");
        };
        match event {
            ScanEvent::Progress {
                frames_captured,
                frames_total,
            } => info!("captured {frames_captured}/{frames_total}"),
            terminal => break terminal,
        }
    };

    for token in tokens {
        handle.off(token);
    }

    let result = match outcome {
        ScanEvent::Complete {
            output_path,
            frames_captured,
            ..
        } => {
            info!(
                "scan complete: {frames_captured} frames at {}",
                output_path.display()
            );
            Ok(())
        }
        ScanEvent::Cancelled { frames_captured } => Err(anyhow::anyhow!(
            "scan cancelled after {frames_captured} frames"
        )),
        ScanEvent::Error { message } => Err(anyhow::anyhow!("scan failed: {message}")),
        ScanEvent::Progress { .. } => unreachable!("progress handled above"),
    };

    handle.shutdown().await;
    result
}
