//! Foreground detection loop.
//!
//! Each poll reads at most one line from the controller. On the detection
//! sentinel a frame is captured, the plate is located and read, and the
//! canonical plate is checked against the allow-list. No state survives a
//! cycle: every poll starts from idle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{now_millis, GateCommand, LogRecord};
use crate::config::{GateConfig, RecognitionConfig};
use crate::error::{GateError, Result};
use crate::normalizer;
use crate::recognition::{preprocess_plate, save_frame, with_deadline};
use crate::retry::RetryPolicy;
use crate::serial_link::SerialLink;
use crate::traits::{FrameSource, PlateDetector, PlateReader, RemoteStore};

/// What one poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No detection signal.
    Idle,
    /// Capture, detection or OCR failed or ran past its deadline.
    CaptureFailed,
    /// The detector found no plate.
    NoRegion,
    /// No OCR candidate normalized to a plate.
    NoPlate,
    /// Allowed plate; the open was recorded remotely.
    Authorized(String),
    /// Unknown or disallowed plate.
    Unauthorized(String),
    /// The authorization path failed; nothing was opened.
    Error,
}

/// Recognition stages, shared with deadline worker threads.
pub struct Pipeline {
    /// Camera.
    pub camera: Arc<dyn FrameSource>,
    /// Plate locator.
    pub detector: Arc<dyn PlateDetector>,
    /// OCR.
    pub reader: Arc<dyn PlateReader>,
}

#[derive(Debug, Clone)]
struct LoopSettings {
    sentinel: String,
    poll_interval: Duration,
    read_timeout: Duration,
    direct_open: bool,
    response_timeout: Duration,
    output_dir: PathBuf,
    capture_timeout: Duration,
    recognition: RecognitionConfig,
}

/// Detection loop bound to the shared serial link.
pub struct DetectionLoop {
    link: Arc<SerialLink>,
    store: Arc<dyn RemoteStore>,
    pipeline: Pipeline,
    retry: RetryPolicy,
    settings: LoopSettings,
}

impl DetectionLoop {
    /// Build the loop from the runtime configuration.
    pub fn new(
        link: Arc<SerialLink>,
        store: Arc<dyn RemoteStore>,
        pipeline: Pipeline,
        config: &GateConfig,
    ) -> Self {
        Self {
            link,
            store,
            pipeline,
            retry: RetryPolicy::from(&config.retry),
            settings: LoopSettings {
                sentinel: config.gate.detection_sentinel.clone(),
                poll_interval: Duration::from_millis(config.detection.poll_interval_ms),
                read_timeout: Duration::from_millis(config.detection.read_timeout_ms),
                direct_open: config.detection.direct_open,
                response_timeout: config.gate.response_timeout(),
                output_dir: config.capture.output_dir.clone(),
                capture_timeout: Duration::from_millis(config.capture.timeout_ms),
                recognition: config.recognition.clone(),
            },
        }
    }

    /// Poll until `stop` is set. Only link failures end the loop early.
    pub fn run(&self, stop: &AtomicBool) -> Result<()> {
        info!("Listening for vehicle detection");
        while !stop.load(Ordering::SeqCst) {
            let outcome = self.poll_once()?;
            if outcome != CycleOutcome::Idle {
                debug!(?outcome, "Detection cycle finished");
            }
            thread::sleep(self.settings.poll_interval);
        }
        info!("Detection loop stopped");
        Ok(())
    }

    /// Run one poll cycle.
    ///
    /// Errors are returned only when the serial link itself fails; every
    /// other failure is contained in the returned outcome.
    pub fn poll_once(&self) -> Result<CycleOutcome> {
        match self.link.try_receive_line(self.settings.read_timeout)? {
            Some(line) if line == self.settings.sentinel => {}
            Some(line) => {
                debug!(line = %line, "Ignoring controller output");
                return Ok(CycleOutcome::Idle);
            }
            None => return Ok(CycleOutcome::Idle),
        }
        info!("Vehicle detected, capturing image");

        let plate = match self.recognize() {
            Ok(plate) => plate,
            Err(GateError::NoRegionDetected) => {
                info!("No license plate detected");
                return Ok(CycleOutcome::NoRegion);
            }
            Err(GateError::NoPlausibleCandidate) => {
                info!("No valid plate detected");
                return Ok(CycleOutcome::NoPlate);
            }
            Err(err) if err.is_local() => {
                warn!("Recognition failed: {err}");
                return Ok(CycleOutcome::CaptureFailed);
            }
            Err(err) => return Err(err),
        };
        info!(plate = %plate, "OCR result");

        match self.authorize(&plate) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(plate = %plate, "Error processing plate authorization: {err}");
                Ok(CycleOutcome::Error)
            }
        }
    }

    fn recognize(&self) -> Result<String> {
        let settings = &self.settings;
        let recognition = &settings.recognition;

        let camera = Arc::clone(&self.pipeline.camera);
        let frame = with_deadline("capture", settings.capture_timeout, move || camera.capture())?;
        let image_path = save_frame(&frame, &settings.output_dir)
            .map_err(|err| GateError::CaptureFailure(format!("save frame: {err}")))?;

        let detector = Arc::clone(&self.pipeline.detector);
        let confidence = recognition.confidence;
        let boxes = with_deadline(
            "detect",
            Duration::from_millis(recognition.detect_timeout_ms),
            move || detector.detect(&image_path, confidence),
        )?;
        let region = boxes.first().ok_or(GateError::NoRegionDetected)?;
        let plate_image = preprocess_plate(&frame, region, recognition.threshold)?;

        let reader = Arc::clone(&self.pipeline.reader);
        let candidates = with_deadline(
            "ocr",
            Duration::from_millis(recognition.ocr_timeout_ms),
            move || reader.read_text(&plate_image),
        )?;
        debug!(?candidates, "OCR candidates");
        normalizer::select_plate(&candidates).ok_or(GateError::NoPlausibleCandidate)
    }

    fn authorize(&self, plate: &str) -> Result<CycleOutcome> {
        let allowed = self
            .store
            .allow_entry(plate)?
            .is_some_and(|entry| entry.allowed);
        if !allowed {
            info!(plate, "Unauthorized or unknown plate");
            if let Err(err) = self
                .store
                .append_log(&LogRecord::unauthorized(plate, now_millis()))
            {
                warn!("Failed to log unauthorized attempt: {err}");
            }
            return Ok(CycleOutcome::Unauthorized(plate.to_owned()));
        }

        info!(plate, "Plate is authorized");
        let timestamp = now_millis();
        let command = GateCommand::anpr_open(plate, timestamp);
        self.retry
            .run("publish open command", || self.store.publish_command(&command))?;
        let record = LogRecord::anpr_opened(plate, timestamp);
        self.retry
            .run("append open log", || self.store.append_log(&record))?;

        if self.settings.direct_open {
            match self
                .link
                .send_and_await_response("OPEN", self.settings.response_timeout)
            {
                Ok(response) => info!(response = %response, "Direct open acknowledged"),
                Err(err) => warn!(plate, "Direct open failed: {err}"),
            }
        }
        Ok(CycleOutcome::Authorized(plate.to_owned()))
    }
}
