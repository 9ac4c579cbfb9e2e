//! Error taxonomy for gate control.

use std::time::Duration;
use thiserror::Error;

/// Error type for gate operations.
///
/// Steady-state variants are contained within a single detection or command
/// cycle. Only [`GateError::LinkEstablishment`] and errors escaping the main
/// loop are fatal.
#[derive(Debug, Error)]
pub enum GateError {
    /// Hardware did not answer within the bound.
    #[error("no response from gate hardware within {0:?}")]
    HardwareTimeout(Duration),

    /// Remote command payload is missing or has an invalid `action`.
    #[error("malformed gate command: {0}")]
    MalformedCommand(String),

    /// Frame capture failed.
    #[error("capture failed: {0}")]
    CaptureFailure(String),

    /// Detector returned no plate region.
    #[error("no license plate region detected")]
    NoRegionDetected,

    /// No OCR candidate normalized to a canonical plate.
    #[error("no plausible plate candidate")]
    NoPlausibleCandidate,

    /// Write to the remote store failed.
    #[error("remote write failed: {0}")]
    RemoteWriteFailure(String),

    /// Read from the remote store failed.
    #[error("remote read failed: {0}")]
    RemoteRead(String),

    /// Serial link could not be opened.
    #[error("failed to establish hardware link: {0}")]
    LinkEstablishment(String),

    /// Serial link was used after being closed.
    #[error("hardware link is closed")]
    LinkClosed,

    /// External call exceeded its deadline.
    #[error("{stage} exceeded deadline of {limit:?}")]
    Deadline {
        /// Pipeline stage that timed out.
        stage: &'static str,
        /// Configured deadline.
        limit: Duration,
    },

    /// Detector or OCR backend failed.
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Whether the error belongs to the local capture/recognition class that
    /// ends a detection cycle with no side effects.
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::CaptureFailure(_)
                | Self::NoRegionDetected
                | Self::NoPlausibleCandidate
                | Self::Deadline { .. }
                | Self::Recognition(_)
        )
    }
}

impl From<image::ImageError> for GateError {
    fn from(err: image::ImageError) -> Self {
        Self::CaptureFailure(err.to_string())
    }
}

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
