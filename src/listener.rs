//! Remote command listener.
//!
//! Consumes the gate's command feed on its own thread. Each valid command is
//! driven through the serial link, and the hardware's answer (not the
//! requested action) decides the status written back. Writes on this path
//! are single-attempt; failures are logged locally.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::command::{now_millis, GateCommand, GateStatus, LogRecord};
use crate::error::Result;
use crate::serial_link::SerialLink;
use crate::traits::{CommandSubscription, RemoteStore};

/// How often the listener re-checks its stop flag while idle.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long the listener waits for the feed thread to exit.
const FEED_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of handling one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Payload failed validation; nothing was sent or recorded.
    Discarded,
    /// Hardware acknowledged and the status was written.
    Completed(GateStatus),
    /// Exchange or status write failed; a failure record was attempted.
    Failed,
}

/// Executes remote gate commands against the hardware.
pub struct CommandListener {
    link: Arc<SerialLink>,
    store: Arc<dyn RemoteStore>,
    response_timeout: Duration,
}

impl CommandListener {
    /// Create a listener sharing `link` with the detection loop.
    pub fn new(
        link: Arc<SerialLink>,
        store: Arc<dyn RemoteStore>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            link,
            store,
            response_timeout,
        }
    }

    /// Validate and execute one raw payload.
    pub fn handle_payload(&self, payload: &Value) -> CommandOutcome {
        let command = match GateCommand::from_payload(payload) {
            Ok(command) => command,
            Err(err) => {
                debug!("No valid command received: {err}");
                return CommandOutcome::Discarded;
            }
        };
        info!(
            action = command.raw_action(),
            triggered_by = command.triggered_by.as_deref().unwrap_or("unknown"),
            "Received remote command"
        );

        match self.dispatch(&command) {
            Ok(status) => {
                let record = LogRecord::command_completed(&command, status, now_millis());
                if let Err(err) = self.store.append_log(&record) {
                    warn!("Failed to log completed command: {err}");
                }
                CommandOutcome::Completed(status)
            }
            Err(err) => {
                warn!("Error processing remote command: {err}");
                let record = LogRecord::command_failed(&command, now_millis());
                if let Err(err) = self.store.append_log(&record) {
                    warn!("Failed to log failed command: {err}");
                }
                CommandOutcome::Failed
            }
        }
    }

    fn dispatch(&self, command: &GateCommand) -> Result<GateStatus> {
        let response = self
            .link
            .send_and_await_response(command.action.wire(), self.response_timeout)?;
        let status = GateStatus::from_response(&response);
        self.store.write_status(status)?;
        info!(%status, response = %response, "Gate status updated");
        Ok(status)
    }

    /// Handle payloads until `stop` is set or the feed disconnects.
    pub fn run(&self, subscription: &CommandSubscription, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) && !subscription.is_cancelled() {
            match subscription.recv_timeout(STOP_CHECK_INTERVAL) {
                Ok(payload) => {
                    self.handle_payload(&payload);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Command feed disconnected");
                    break;
                }
            }
        }
        debug!("Command listener stopped");
    }

    /// Run on a dedicated thread. On exit the subscription is cancelled and
    /// its feed thread joined.
    pub fn spawn(
        self,
        subscription: CommandSubscription,
        stop: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("command-listener".to_owned())
            .spawn(move || {
                self.run(&subscription, &stop);
                if !subscription.shutdown(FEED_JOIN_TIMEOUT) {
                    warn!("Command feed did not stop in time, abandoning it");
                }
            })
    }
}
