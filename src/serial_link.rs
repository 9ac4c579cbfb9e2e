//! Exclusive-access serial link to the gate controller.

use std::collections::VecDeque;
use std::io::Read as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::{GateError, Result};
use crate::traits::LineTransport;

/// Upper bound on a single blocking read, so deadlines are honoured closely.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Line the controller sends unprompted when a vehicle is present.
pub const DETECTION_SENTINEL: &str = "DETECTED";

/// Serial link shared by the command listener and the detection loop.
///
/// Every operation holds one lock for its whole duration, so a
/// write-then-await exchange is atomic with respect to any other reader or
/// writer. The lock is released on every return path, including timeouts.
///
/// A detection sentinel that arrives while an exchange awaits its reply is
/// not an acknowledgment. It is held back and returned by the next
/// [`Self::try_receive_line`].
pub struct SerialLink {
    state: Mutex<LinkState>,
    sentinel: String,
}

struct LinkState {
    transport: Option<Box<dyn LineTransport>>,
    held: VecDeque<String>,
}

impl LinkState {
    fn transport(&mut self) -> Result<&mut Box<dyn LineTransport>> {
        self.transport.as_mut().ok_or(GateError::LinkClosed)
    }
}

impl SerialLink {
    /// Wrap an already-open transport.
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self {
            state: Mutex::new(LinkState {
                transport: Some(transport),
                held: VecDeque::new(),
            }),
            sentinel: DETECTION_SENTINEL.to_owned(),
        }
    }

    /// Use `sentinel` instead of [`DETECTION_SENTINEL`].
    #[must_use]
    pub fn with_sentinel(mut self, sentinel: &str) -> Self {
        sentinel.clone_into(&mut self.sentinel);
        self
    }

    /// Open the configured serial port and wait for the controller to settle.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(|err| GateError::LinkEstablishment(format!("{}: {err}", config.port)))?;
        std::thread::sleep(config.settle_delay());
        info!(port = %config.port, baud = config.baud_rate, "Serial connection established");
        Ok(Self::new(Box::new(SerialPortTransport::new(port))))
    }

    /// Write raw bytes.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.state.lock().transport()?.write_all(bytes)
    }

    /// Read one line if it arrives within `timeout`. Lines held back by an
    /// exchange come first.
    pub fn try_receive_line(&self, timeout: Duration) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.transport()?;
        if let Some(held) = state.held.pop_front() {
            return Ok(Some(held));
        }
        Ok(state
            .transport()?
            .read_line(timeout)?
            .map(|line| line.trim().to_owned()))
    }

    /// Send `command` as one line and wait for the first non-empty reply
    /// that is not the detection sentinel.
    pub fn send_and_await_response(&self, command: &str, timeout: Duration) -> Result<String> {
        let mut state = self.state.lock();
        let LinkState { transport, held } = &mut *state;
        let transport = transport.as_mut().ok_or(GateError::LinkClosed)?;

        transport.write_all(format!("{command}\n").as_bytes())?;
        debug!(command, "Sent to controller");

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GateError::HardwareTimeout(timeout));
            }
            if let Some(line) = transport.read_line(remaining)? {
                let line = line.trim();
                if line == self.sentinel {
                    debug!("Detection signal during exchange, holding it for the next poll");
                    held.push_back(line.to_owned());
                } else if !line.is_empty() {
                    debug!(response = line, "Controller response");
                    return Ok(line.to_owned());
                }
            }
        }
    }

    /// Release the underlying handle. Later operations fail with
    /// [`GateError::LinkClosed`].
    pub fn close(&self) {
        if self.state.lock().transport.take().is_some() {
            info!("Serial port closed");
        }
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().transport.is_none()
    }
}

/// [`LineTransport`] over a `serialport` handle.
pub struct SerialPortTransport {
    port: Box<dyn serialport::SerialPort>,
    buffer: Vec<u8>,
}

impl SerialPortTransport {
    /// Wrap an open port.
    pub fn new(port: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            port,
            buffer: Vec::with_capacity(128),
        }
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&byte| byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        )
    }

    fn fill(&mut self, wait: Duration) -> Result<()> {
        self.port
            .set_timeout(wait.max(Duration::from_millis(1)))
            .map_err(|err| GateError::Io(err.into()))?;
        let mut chunk = [0u8; 64];
        match self.port.read(&mut chunk) {
            Ok(count) => {
                self.buffer.extend(chunk.iter().take(count));
                Ok(())
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl LineTransport for SerialPortTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, bytes)?;
        std::io::Write::flush(&mut self.port)?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let pending = self
                    .port
                    .bytes_to_read()
                    .map_err(|err| GateError::Io(err.into()))?;
                if pending == 0 {
                    return Ok(None);
                }
                self.fill(Duration::from_millis(1))?;
                return Ok(self.take_buffered_line());
            }
            self.fill(remaining.min(READ_SLICE))?;
        }
    }
}
