//! Test doubles for the hardware, the remote store and the recognition
//! pipeline.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use serde_json::Value;

use crate::command::{GateCommand, GateStatus, LogRecord, PlateAllowEntry};
use crate::error::{GateError, Result};
use crate::traits::{
    BoundingBox, CommandSubscription, FrameSource, LineTransport, PlateDetector, PlateReader,
    RemoteStore,
};

type Responder = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Operation observed on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WireOp {
    Write(ThreadId),
    Read(ThreadId),
}

struct Wire {
    pending: VecDeque<(Instant, String)>,
    partial: Vec<u8>,
    written: Vec<String>,
    ops: Vec<WireOp>,
    responder: Option<Responder>,
    reply_delay: Duration,
    fail_writes: bool,
}

/// Simulated gate controller behind a [`LineTransport`].
///
/// By default it acknowledges `OPEN` with `Gate opened` and `CLOSE` with
/// `Gate closed`.
#[derive(Clone)]
pub struct MockHardware {
    wire: Arc<Mutex<Wire>>,
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHardware {
    /// Controller with the default acknowledgments.
    #[must_use]
    pub fn new() -> Self {
        let responder: Responder = Box::new(|command| match command {
            "OPEN" => Some("Gate opened".to_owned()),
            "CLOSE" => Some("Gate closed".to_owned()),
            _ => None,
        });
        Self {
            wire: Arc::new(Mutex::new(Wire {
                pending: VecDeque::new(),
                partial: Vec::new(),
                written: Vec::new(),
                ops: Vec::new(),
                responder: Some(responder),
                reply_delay: Duration::ZERO,
                fail_writes: false,
            })),
        }
    }

    /// Replace the acknowledgment logic.
    #[must_use]
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        self.wire.lock().responder = Some(Box::new(responder));
        self
    }

    /// Never acknowledge anything.
    #[must_use]
    pub fn silent(self) -> Self {
        self.wire.lock().responder = None;
        self
    }

    /// Delay every acknowledgment.
    #[must_use]
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        self.wire.lock().reply_delay = delay;
        self
    }

    /// Fail every write with an I/O error.
    #[must_use]
    pub fn with_write_failure(self) -> Self {
        self.wire.lock().fail_writes = true;
        self
    }

    /// Queue an unsolicited line from the controller.
    pub fn push_line(&self, line: &str) {
        self.wire
            .lock()
            .pending
            .push_back((Instant::now(), line.to_owned()));
    }

    /// Lines written to the controller so far.
    pub fn written(&self) -> Vec<String> {
        self.wire.lock().written.clone()
    }

    /// Whether every write that was followed by a read on the same thread
    /// saw no other thread's traffic in between.
    pub fn exchanges_are_serialized(&self) -> bool {
        let ops = self.wire.lock().ops.clone();
        ops.iter().enumerate().all(|(idx, op)| {
            let WireOp::Write(writer) = op else {
                return true;
            };
            let Some(offset) = ops.iter().skip(idx + 1).position(|next| match next {
                WireOp::Write(thread) | WireOp::Read(thread) => thread == writer,
            }) else {
                return true;
            };
            let own_next = ops.get(idx + 1 + offset);
            if own_next != Some(&WireOp::Read(*writer)) {
                return true;
            }
            offset == 0
        })
    }

    /// Transport handle to give to a [`crate::SerialLink`].
    pub fn transport(&self) -> Box<dyn LineTransport> {
        Box::new(MockTransport {
            wire: Arc::clone(&self.wire),
        })
    }
}

struct MockTransport {
    wire: Arc<Mutex<Wire>>,
}

impl LineTransport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut wire = self.wire.lock();
        if wire.fail_writes {
            return Err(GateError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        wire.partial.extend_from_slice(bytes);
        while let Some(end) = wire.partial.iter().position(|&byte| byte == b'\n') {
            let raw: Vec<u8> = wire.partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_owned();
            wire.ops.push(WireOp::Write(thread::current().id()));
            let reply = wire.responder.as_ref().and_then(|respond| respond(&line));
            wire.written.push(line);
            if let Some(reply) = reply {
                let ready_at = Instant::now() + wire.reply_delay;
                wire.pending.push_back((ready_at, reply));
            }
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut wire = self.wire.lock();
                let ready = wire
                    .pending
                    .front()
                    .is_some_and(|(ready_at, _)| *ready_at <= Instant::now());
                if ready {
                    if let Some((_, line)) = wire.pending.pop_front() {
                        wire.ops.push(WireOp::Read(thread::current().id()));
                        return Ok(Some(line));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            thread::sleep(remaining.min(Duration::from_millis(2)));
        }
    }
}

#[derive(Default)]
struct StoreState {
    status: Option<GateStatus>,
    logs: Vec<LogRecord>,
    commands: Vec<GateCommand>,
    allow: HashMap<String, PlateAllowEntry>,
    failing_writes: u32,
    failing_reads: bool,
    write_attempts: u32,
}

/// In-memory remote store with failure injection.
///
/// Like the real database, publishing a command notifies every subscriber.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<Sender<Value>>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allow-list entry.
    #[must_use]
    pub fn with_plate(self, plate: &str, allowed: bool) -> Self {
        self.state
            .lock()
            .allow
            .insert(plate.to_owned(), PlateAllowEntry { allowed });
        self
    }

    /// Set the initial status.
    #[must_use]
    pub fn with_status(self, status: GateStatus) -> Self {
        self.state.lock().status = Some(status);
        self
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Fail every allow-list read.
    pub fn fail_reads(&self) {
        self.state.lock().failing_reads = true;
    }

    /// Deliver a raw payload to subscribers, as a remote caller would.
    pub fn push_command(&self, payload: Value) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(payload.clone()).is_ok());
    }

    /// Number of live command subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Current status.
    pub fn status(&self) -> Option<GateStatus> {
        self.state.lock().status
    }

    /// Appended log records.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.state.lock().logs.clone()
    }

    /// Published commands.
    pub fn commands(&self) -> Vec<GateCommand> {
        self.state.lock().commands.clone()
    }

    /// Write attempts, including failed ones.
    pub fn write_attempts(&self) -> u32 {
        self.state.lock().write_attempts
    }

    fn begin_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.write_attempts += 1;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(GateError::RemoteWriteFailure("injected failure".to_owned()));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryStore {
    fn allow_entry(&self, plate: &str) -> Result<Option<PlateAllowEntry>> {
        let state = self.state.lock();
        if state.failing_reads {
            return Err(GateError::RemoteRead("injected failure".to_owned()));
        }
        Ok(state.allow.get(plate).copied())
    }

    fn write_status(&self, status: GateStatus) -> Result<()> {
        self.begin_write()?;
        self.state.lock().status = Some(status);
        Ok(())
    }

    fn append_log(&self, record: &LogRecord) -> Result<()> {
        self.begin_write()?;
        self.state.lock().logs.push(record.clone());
        Ok(())
    }

    fn publish_command(&self, command: &GateCommand) -> Result<()> {
        self.begin_write()?;
        self.state.lock().commands.push(command.clone());
        let payload = serde_json::to_value(command)
            .map_err(|err| GateError::RemoteWriteFailure(err.to_string()))?;
        self.push_command(payload);
        Ok(())
    }

    fn subscribe_commands(&self) -> Result<CommandSubscription> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        Ok(CommandSubscription::new(
            rx,
            Arc::new(AtomicBool::new(false)),
            None,
        ))
    }
}

/// Frame source returning a blank frame, or failing.
pub struct StaticFrameSource {
    fail: bool,
    delay: Duration,
    captures: AtomicUsize,
}

impl StaticFrameSource {
    /// Always succeeds.
    #[must_use]
    pub const fn working() -> Self {
        Self {
            fail: false,
            delay: Duration::ZERO,
            captures: AtomicUsize::new(0),
        }
    }

    /// Always fails.
    #[must_use]
    pub const fn failing() -> Self {
        Self {
            fail: true,
            delay: Duration::ZERO,
            captures: AtomicUsize::new(0),
        }
    }

    /// Sleep before each capture.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of capture calls.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl FrameSource for StaticFrameSource {
    fn capture(&self) -> Result<RgbImage> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.fail {
            return Err(GateError::CaptureFailure("camera unavailable".to_owned()));
        }
        Ok(RgbImage::from_pixel(64, 48, image::Rgb([200, 200, 200])))
    }
}

/// Detector returning fixed boxes.
pub struct ScriptedDetector {
    boxes: Vec<BoundingBox>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    /// Detector that returns `boxes` on every call.
    #[must_use]
    pub const fn new(boxes: Vec<BoundingBox>) -> Self {
        Self {
            boxes,
            calls: AtomicUsize::new(0),
        }
    }

    /// Detector that finds a plate in the middle of a 64x48 frame.
    #[must_use]
    pub fn one_plate() -> Self {
        Self::new(vec![BoundingBox::new(8.0, 16.0, 56.0, 32.0)])
    }

    /// Number of detect calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PlateDetector for ScriptedDetector {
    fn detect(&self, image_path: &Path, _confidence: f32) -> Result<Vec<BoundingBox>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !image_path.exists() {
            return Err(GateError::Recognition(format!(
                "missing frame {}",
                image_path.display()
            )));
        }
        Ok(self.boxes.clone())
    }
}

/// OCR returning fixed candidates.
pub struct ScriptedReader {
    candidates: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedReader {
    /// Reader that returns `candidates` on every call.
    #[must_use]
    pub fn new(candidates: &[&str]) -> Self {
        Self {
            candidates: candidates.iter().map(|&text| text.to_owned()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of read calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PlateReader for ScriptedReader {
    fn read_text(&self, plate: &GrayImage) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if plate.width() == 0 || plate.height() == 0 {
            return Err(GateError::Recognition("empty plate image".to_owned()));
        }
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_hardware_acknowledges_commands() {
        let hardware = MockHardware::new();
        let mut transport = hardware.transport();
        transport.write_all(b"OPEN\n").expect("write");
        let reply = transport
            .read_line(Duration::from_millis(10))
            .expect("read");
        assert_eq!(reply.as_deref(), Some("Gate opened"));
        assert_eq!(hardware.written(), vec!["OPEN".to_owned()]);
    }

    #[test]
    fn test_memory_store_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.write_status(GateStatus::Open).is_err());
        assert!(store.write_status(GateStatus::Open).is_ok());
        assert_eq!(store.status(), Some(GateStatus::Open));
        assert_eq!(store.write_attempts(), 2);
    }

    #[test]
    fn test_memory_store_broadcasts_published_commands() {
        let store = MemoryStore::new();
        let subscription = store.subscribe_commands().expect("subscribe");
        store
            .publish_command(&GateCommand::anpr_open("ABC123DE", 1))
            .expect("publish");
        let payload = subscription
            .recv_timeout(Duration::from_millis(10))
            .expect("delivered");
        assert_eq!(payload["triggeredBy"], "ANPR");
    }
}
