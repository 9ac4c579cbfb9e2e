//! Top-level wiring: one serial link shared by the command listener thread
//! and the foreground detection loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::GateConfig;
use crate::detection::{DetectionLoop, Pipeline};
use crate::error::Result;
use crate::listener::CommandListener;
use crate::serial_link::SerialLink;
use crate::traits::RemoteStore;

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Runs the gate until shutdown is requested or the link fails.
pub struct GateOrchestrator {
    link: Arc<SerialLink>,
    store: Arc<dyn RemoteStore>,
    detection: DetectionLoop,
    response_timeout: Duration,
    join_timeout: Duration,
}

impl GateOrchestrator {
    /// Wire the listener and detection loop onto an open link.
    pub fn new(
        link: Arc<SerialLink>,
        store: Arc<dyn RemoteStore>,
        pipeline: Pipeline,
        config: &GateConfig,
    ) -> Self {
        let detection = DetectionLoop::new(Arc::clone(&link), Arc::clone(&store), pipeline, config);
        Self {
            link,
            store,
            detection,
            response_timeout: config.gate.response_timeout(),
            join_timeout: Duration::from_millis(config.shutdown.listener_join_timeout_ms),
        }
    }

    /// Run until `shutdown` is set. The serial link is closed before
    /// returning, on success and on error.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        let result = self.run_tasks(shutdown);
        self.link.close();
        result
    }

    fn run_tasks(&self, shutdown: &AtomicBool) -> Result<()> {
        let subscription = self.store.subscribe_commands()?;
        let listener_stop = Arc::new(AtomicBool::new(false));
        let listener = CommandListener::new(
            Arc::clone(&self.link),
            Arc::clone(&self.store),
            self.response_timeout,
        )
        .spawn(subscription, Arc::clone(&listener_stop))?;
        info!("Command listener started");

        let result = self.detection.run(shutdown);

        listener_stop.store(true, Ordering::SeqCst);
        join_bounded(listener, self.join_timeout);
        result
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise leave it
/// detached.
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(?timeout, "Command listener did not stop in time, abandoning it");
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("Command listener panicked");
    } else {
        info!("Command listener stopped");
    }
}
