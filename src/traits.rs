//! Core traits and types at the seams between the orchestrator and the
//! hardware, the remote store and the recognition pipeline.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbImage};
use serde_json::Value;

use crate::command::{GateCommand, GateStatus, LogRecord, PlateAllowEntry};
use crate::error::Result;

/// Line-oriented byte transport to the gate controller.
///
/// Implementations are not required to be thread-safe; [`crate::SerialLink`]
/// provides the mutual exclusion.
pub trait LineTransport: Send {
    /// Write raw bytes.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read one newline-terminated line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if no complete line arrived in time. The returned
    /// line excludes the terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Abstraction over the remote database.
pub trait RemoteStore: Send + Sync {
    /// Look up the allow-list entry for a canonical plate.
    fn allow_entry(&self, plate: &str) -> Result<Option<PlateAllowEntry>>;

    /// Overwrite the gate status.
    fn write_status(&self, status: GateStatus) -> Result<()>;

    /// Append a record to the action log.
    fn append_log(&self, record: &LogRecord) -> Result<()>;

    /// Overwrite the gate's command slot.
    fn publish_command(&self, command: &GateCommand) -> Result<()>;

    /// Subscribe to changes of the gate's command slot.
    fn subscribe_commands(&self) -> Result<CommandSubscription>;
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Live subscription to remote command payloads.
///
/// Payloads are delivered raw; validation happens in the listener. Dropping
/// the subscription cancels it.
pub struct CommandSubscription {
    events: Receiver<Value>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CommandSubscription {
    /// Wrap a delivery channel, its cancellation flag and the delivery thread.
    pub fn new(
        events: Receiver<Value>,
        cancel: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            cancel,
            worker,
        }
    }

    /// Wait up to `timeout` for the next payload.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Value, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Ask the delivery side to stop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Cancel and join the delivery thread, waiting at most `timeout`.
    ///
    /// Returns `false` if the thread was still running at the deadline; it
    /// is then left detached.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.cancel();
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SHUTDOWN_POLL);
        }
        worker.join().is_ok()
    }
}

impl Drop for CommandSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Source of still frames.
pub trait FrameSource: Send + Sync {
    /// Capture one frame.
    fn capture(&self) -> Result<RgbImage>;
}

/// Axis-aligned plate region in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BoundingBox {
    /// Create a box from corner coordinates.
    #[must_use]
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncate to integer pixels and clamp to an image of the given size.
    ///
    /// Returns `(x, y, width, height)`, or `None` if nothing of the box lies
    /// inside the image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |value: f32, limit: u32| -> u32 {
            if value.is_nan() || value <= 0.0 {
                0
            } else {
                (value as u32).min(limit)
            }
        };
        let (x1, x2) = (clamp(self.x1, width), clamp(self.x2, width));
        let (y1, y2) = (clamp(self.y1, height), clamp(self.y2, height));
        (x2 > x1 && y2 > y1).then_some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Plate region detector.
pub trait PlateDetector: Send + Sync {
    /// Detect plate regions in the image at `image_path`.
    fn detect(&self, image_path: &Path, confidence: f32) -> Result<Vec<BoundingBox>>;
}

/// OCR engine.
pub trait PlateReader: Send + Sync {
    /// Read candidate text strings, in engine order, from a preprocessed plate.
    fn read_text(&self, plate: &GrayImage) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_clamps_to_image() {
        let region = BoundingBox::new(-5.0, 10.7, 700.0, 40.2);
        assert_eq!(region.clamp_to(640, 480), Some((0, 10, 640, 30)));
    }

    #[test]
    fn test_box_outside_image() {
        let region = BoundingBox::new(700.0, 10.0, 800.0, 40.0);
        assert_eq!(region.clamp_to(640, 480), None);
    }

    #[test]
    fn test_subscription_cancels_worker_on_drop() {
        let (tx, rx) = std::sync::mpsc::channel::<Value>();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let worker = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            drop(tx);
        });
        let subscription = CommandSubscription::new(rx, Arc::clone(&cancel), Some(worker));
        assert!(!subscription.is_cancelled());

        drop(subscription);
        assert!(cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_subscription_shutdown_joins_worker() {
        let (tx, rx) = std::sync::mpsc::channel::<Value>();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let exited = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&exited);
        let worker = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            drop(tx);
            done.store(true, Ordering::SeqCst);
        });
        let subscription = CommandSubscription::new(rx, cancel, Some(worker));
        assert!(subscription.shutdown(Duration::from_secs(1)));
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_subscription_shutdown_gives_up_on_stuck_worker() {
        let (_tx, rx) = std::sync::mpsc::channel::<Value>();
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let worker = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let subscription =
            CommandSubscription::new(rx, Arc::new(AtomicBool::new(false)), Some(worker));
        let started = Instant::now();
        assert!(!subscription.shutdown(Duration::from_millis(30)));
        assert!(started.elapsed() < Duration::from_secs(1));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_subscription_without_worker() {
        let (_tx, rx) = std::sync::mpsc::channel::<Value>();
        let subscription = CommandSubscription::new(rx, Arc::new(AtomicBool::new(false)), None);
        assert_eq!(
            subscription.recv_timeout(Duration::from_millis(1)),
            Err(RecvTimeoutError::Timeout)
        );
        subscription.cancel();
        assert!(subscription.is_cancelled());
        assert!(subscription.shutdown(Duration::ZERO));
    }

    #[test]
    fn test_degenerate_box() {
        let region = BoundingBox::new(10.0, 10.0, 10.0, 40.0);
        assert_eq!(region.clamp_to(640, 480), None);
    }
}
