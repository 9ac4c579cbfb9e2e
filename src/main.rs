//! Smart-gate daemon: ANPR gate control over a serial-attached controller.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use smart_gate::recognition::{CommandDetector, CommandReader};
use smart_gate::{
    FirebaseStore, GateConfig, GateOrchestrator, Pipeline, PlateReader, RemoteStore, SerialLink,
    V4L2Camera,
};

#[derive(Parser, Debug)]
#[command(name = "smart-gate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); missing files fall back to defaults.
    #[arg(short, long, default_value = "smart-gate.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Serial port, overriding the configuration.
    #[arg(short, long)]
    port: Option<String>,
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if let Err(err) = run(&args) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = GateConfig::load(Some(&args.config)).context("loading configuration")?;
    if let Some(port) = &args.port {
        config.serial.port.clone_from(port);
        config.validate()?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    watch_interrupt(Arc::clone(&shutdown)).context("installing interrupt handler")?;

    let store: Arc<dyn RemoteStore> =
        Arc::new(FirebaseStore::new(&config.remote, &config.gate.id)?);
    let pipeline = build_pipeline(&config)?;

    let link = SerialLink::open(&config.serial)
        .context("connecting to gate controller")?
        .with_sentinel(&config.gate.detection_sentinel);
    GateOrchestrator::new(Arc::new(link), store, pipeline, &config).run(&shutdown)?;

    info!("Shutdown complete");
    Ok(())
}

fn build_pipeline(config: &GateConfig) -> Result<Pipeline> {
    let recognition = &config.recognition;
    let detector = CommandDetector::new(
        recognition.detector_command.clone(),
        Duration::from_millis(recognition.detect_timeout_ms),
    )?;
    let reader: Arc<dyn PlateReader> = if recognition.ocr_command.is_empty() {
        tesseract_reader(config)?
    } else {
        Arc::new(CommandReader::new(
            recognition.ocr_command.clone(),
            Duration::from_millis(recognition.ocr_timeout_ms),
        )?)
    };
    Ok(Pipeline {
        camera: Arc::new(V4L2Camera::new(&config.capture)),
        detector: Arc::new(detector),
        reader,
    })
}

#[cfg(feature = "ocr")]
#[allow(clippy::unnecessary_wraps)]
fn tesseract_reader(config: &GateConfig) -> Result<Arc<dyn PlateReader>> {
    Ok(Arc::new(smart_gate::recognition::TesseractReader::new(
        config.recognition.tessdata.as_deref(),
    )))
}

#[cfg(not(feature = "ocr"))]
fn tesseract_reader(_config: &GateConfig) -> Result<Arc<dyn PlateReader>> {
    anyhow::bail!("recognition.ocr_command is empty and the `ocr` feature is disabled")
}

/// Set `shutdown` on the first Ctrl-C.
fn watch_interrupt(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("interrupt".to_owned())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Program interrupted, cleaning up");
                        shutdown.store(true, Ordering::SeqCst);
                    }
                    Err(err) => warn!("Cannot listen for interrupts: {err}"),
                }
            });
        })?;
    Ok(())
}
