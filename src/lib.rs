//! Smart-Gate: ANPR gate control for a serial-attached gate controller
//!
//! One serial link is shared between a listener executing remote gate
//! commands and a detection loop that captures, reads and authorizes plates
//! when the controller reports a vehicle. Every hardware action is followed
//! by a status update and a log record in the remote database.

pub mod command;
pub mod config;
pub mod detection;
pub mod device;
pub mod error;
pub mod listener;
pub mod normalizer;
pub mod orchestrator;
pub mod recognition;
pub mod retry;
pub mod serial_link;
pub mod store;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use command::{GateAction, GateCommand, GateStatus, LogRecord, PlateAllowEntry};
pub use config::GateConfig;
pub use detection::{CycleOutcome, DetectionLoop, Pipeline};
pub use device::V4L2Camera;
pub use error::{GateError, Result};
pub use listener::{CommandListener, CommandOutcome};
pub use orchestrator::GateOrchestrator;
pub use serial_link::SerialLink;
pub use store::FirebaseStore;
pub use traits::{
    BoundingBox, CommandSubscription, FrameSource, LineTransport, PlateDetector, PlateReader,
    RemoteStore,
};
