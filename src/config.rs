//! Runtime configuration.
//!
//! Every field has a default, so an empty file (or none at all) yields the
//! reference setup: 9600 baud, gate `main-gate`, 5 s hardware timeout,
//! 200 ms poll period, three write attempts one second apart. Environment
//! variables such as `SMART_GATE__SERIAL__PORT` override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SMART_GATE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Serial link to the gate controller.
    pub serial: SerialConfig,
    /// Gate identity and hardware protocol.
    pub gate: GateSettings,
    /// Remote database.
    pub remote: RemoteConfig,
    /// Durable-write retry policy.
    pub retry: RetryConfig,
    /// Camera capture.
    pub capture: CaptureConfig,
    /// Plate detection and OCR.
    pub recognition: RecognitionConfig,
    /// Detection loop behaviour.
    pub detection: DetectionConfig,
    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,
}

impl GateConfig {
    /// Load from an optional TOML file, then apply `SMART_GATE__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let loaded: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|err| GateError::Config(err.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(GateError::Config("serial.port must not be empty".to_owned()));
        }
        if self.gate.id.trim().is_empty() {
            return Err(GateError::Config("gate.id must not be empty".to_owned()));
        }
        if self.remote.database_url.trim().is_empty() {
            return Err(GateError::Config(
                "remote.database_url must not be empty".to_owned(),
            ));
        }
        if self.detection.poll_interval_ms == 0 {
            return Err(GateError::Config(
                "detection.poll_interval_ms must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Serial port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path or name (`/dev/ttyACM0`, `COM7`).
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Pause after opening, while the controller resets.
    pub settle_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_owned(),
            baud_rate: 9600,
            settle_delay_ms: 2000,
        }
    }
}

impl SerialConfig {
    /// Settle delay as a duration.
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Gate identity and hardware protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Gate id used in remote paths.
    pub id: String,
    /// How long to wait for a hardware acknowledgment.
    pub response_timeout_ms: u64,
    /// Line the controller sends when a vehicle is present.
    pub detection_sentinel: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            id: "main-gate".to_owned(),
            response_timeout_ms: 5000,
            detection_sentinel: "DETECTED".to_owned(),
        }
    }
}

impl GateSettings {
    /// Acknowledgment timeout as a duration.
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Remote database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Realtime database root URL.
    pub database_url: String,
    /// Database secret or ID token, sent as the `auth` query parameter.
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
    /// Upper bound for the feed reconnect backoff.
    pub max_reconnect_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            database_url: "http://localhost:9000".to_owned(),
            auth_token: None,
            request_timeout_ms: 10_000,
            max_reconnect_delay_ms: 30_000,
        }
    }
}

/// Retry policy for authorization-path writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

/// Camera capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 device index (`/dev/videoN`).
    pub device_index: u32,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Frames to discard while exposure settles.
    pub warmup_frames: u32,
    /// Directory captured frames are written to.
    pub output_dir: PathBuf,
    /// Deadline for one capture.
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            warmup_frames: 3,
            output_dir: PathBuf::from("captured"),
            timeout_ms: 5000,
        }
    }
}

/// Plate detection and OCR settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Minimum detector confidence.
    pub confidence: f32,
    /// Detector program and arguments; `{image}` and `{confidence}` are
    /// substituted.
    pub detector_command: Vec<String>,
    /// OCR program and arguments; `{image}` is substituted. When empty the
    /// Tesseract backend is used (requires the `ocr` feature).
    pub ocr_command: Vec<String>,
    /// Tesseract data directory.
    pub tessdata: Option<PathBuf>,
    /// Deadline for plate detection.
    pub detect_timeout_ms: u64,
    /// Deadline for OCR.
    pub ocr_timeout_ms: u64,
    /// Binarization threshold applied to the upscaled plate.
    pub threshold: u8,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            confidence: 0.4,
            detector_command: Vec::new(),
            ocr_command: Vec::new(),
            tessdata: None,
            detect_timeout_ms: 10_000,
            ocr_timeout_ms: 10_000,
            threshold: 100,
        }
    }
}

/// Detection loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Pause between polls.
    pub poll_interval_ms: u64,
    /// How long one poll may wait for a line.
    pub read_timeout_ms: u64,
    /// Also send `OPEN` directly after publishing the remote command.
    pub direct_open: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            read_timeout_ms: 10,
            direct_open: true,
        }
    }
}

/// Shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Bounded wait for the listener thread to finish.
    pub listener_join_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            listener_join_timeout_ms: 3000,
        }
    }
}
