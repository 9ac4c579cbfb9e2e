//! [`RemoteStore`] over the Firebase Realtime Database REST API.
//!
//! Layout under the database root:
//!
//! - `gates/<gate>/status`: `"open"` or `"closed"`
//! - `gates/<gate>/command`: last published command
//! - `logs/<push id>`: action log
//! - `licensePlates/<plate>`: `{ "allowed": bool }`
//!
//! The command feed uses the streaming endpoint (`text/event-stream`) and
//! delivers the full command snapshot after every change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eventsource_stream::{Event, Eventsource as _};
use futures::{Stream, StreamExt as _};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::command::{GateCommand, GateStatus, LogRecord, PlateAllowEntry};
use crate::config::RemoteConfig;
use crate::error::{GateError, Result};
use crate::traits::{CommandSubscription, RemoteStore};

/// Remote store backed by a Firebase Realtime Database.
pub struct FirebaseStore {
    client: Client,
    stream_client: reqwest::Client,
    base_url: String,
    gate_id: String,
    auth_token: Option<String>,
    max_reconnect_delay: Duration,
}

impl FirebaseStore {
    /// Create a store for `gate_id`.
    pub fn new(config: &RemoteConfig, gate_id: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| GateError::Config(format!("HTTP client: {err}")))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| GateError::Config(format!("HTTP client: {err}")))?;
        Ok(Self {
            client,
            stream_client,
            base_url: config.database_url.trim_end_matches('/').to_owned(),
            gate_id: gate_id.to_owned(),
            auth_token: config.auth_token.clone(),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}.json", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.query(&[("auth", token)]),
            None => request,
        }
    }

    fn status_path(&self) -> String {
        format!("gates/{}/status", self.gate_id)
    }

    fn command_path(&self) -> String {
        format!("gates/{}/command", self.gate_id)
    }

    fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        self.authorize(self.client.put(self.url(path)).json(body))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|err| GateError::RemoteWriteFailure(format!("PUT {path}: {err}")))?;
        Ok(())
    }
}

impl RemoteStore for FirebaseStore {
    fn allow_entry(&self, plate: &str) -> Result<Option<PlateAllowEntry>> {
        let path = format!("licensePlates/{plate}");
        let value: Value = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(reqwest::blocking::Response::json)
            .map_err(|err| GateError::RemoteRead(format!("GET {path}: {err}")))?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| GateError::RemoteRead(format!("{path}: {err}")))
    }

    fn write_status(&self, status: GateStatus) -> Result<()> {
        self.put(&self.status_path(), &status)
    }

    fn append_log(&self, record: &LogRecord) -> Result<()> {
        self.authorize(self.client.post(self.url("logs")).json(record))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|err| GateError::RemoteWriteFailure(format!("POST logs: {err}")))?;
        Ok(())
    }

    fn publish_command(&self, command: &GateCommand) -> Result<()> {
        self.put(&self.command_path(), command)
    }

    fn subscribe_commands(&self) -> Result<CommandSubscription> {
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let feed = CommandFeed {
            client: self.stream_client.clone(),
            url: self.url(&self.command_path()),
            auth_token: self.auth_token.clone(),
            cancel: Arc::clone(&cancel),
            max_reconnect_delay: self.max_reconnect_delay,
        };
        let worker = thread::Builder::new()
            .name("command-feed".to_owned())
            .spawn(move || feed.run(&tx))?;
        Ok(CommandSubscription::new(rx, cancel, Some(worker)))
    }
}

/// How often a waiting feed re-checks its cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Streaming reader for the command slot, reconnecting with backoff.
struct CommandFeed {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    cancel: Arc<AtomicBool>,
    max_reconnect_delay: Duration,
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Cancelled,
    ReceiverGone,
    Reconnect,
}

impl CommandFeed {
    fn run(&self, tx: &Sender<Value>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("Cannot start command feed runtime: {err}");
                return;
            }
        };
        runtime.block_on(self.run_until_cancelled(tx));
        debug!("Command feed stopped");
    }

    async fn run_until_cancelled(&self, tx: &Sender<Value>) {
        let mut retry_delay = Duration::from_secs(1);
        while !self.is_cancelled() {
            match self.stream_once(tx, &mut retry_delay).await {
                Ok(StreamEnd::Cancelled | StreamEnd::ReceiverGone) => return,
                Ok(StreamEnd::Reconnect) => info!("Command feed closed by server, reconnecting"),
                Err(err) => warn!("Command feed error: {err}"),
            }
            warn!(?retry_delay, "Command feed reconnect pending");
            if !self.pause(retry_delay).await {
                return;
            }
            retry_delay = (retry_delay * 2).min(self.max_reconnect_delay);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
    async fn pause(&self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        while tokio::time::Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(remaining.min(CANCEL_POLL)).await;
        }
        !self.is_cancelled()
    }

    async fn stream_once(
        &self,
        tx: &Sender<Value>,
        retry_delay: &mut Duration,
    ) -> Result<StreamEnd> {
        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.auth_token {
            request = request.query(&[("auth", token)]);
        }
        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| GateError::RemoteRead(format!("command stream: {err}")))?;
        info!("Command feed connected");
        *retry_delay = Duration::from_secs(1);

        forward_events(response.bytes_stream().eventsource(), tx, &self.cancel).await
    }
}

/// Fold `put`/`patch` events into a snapshot and deliver it after every
/// change.
async fn forward_events<S, E>(
    events: S,
    tx: &Sender<Value>,
    cancel: &AtomicBool,
) -> Result<StreamEnd>
where
    S: Stream<Item = std::result::Result<Event, E>>,
    E: std::fmt::Display,
{
    let mut events = std::pin::pin!(events);
    let mut snapshot = Value::Null;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(StreamEnd::Cancelled);
        }
        let Ok(next) = tokio::time::timeout(CANCEL_POLL, events.next()).await else {
            continue;
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(err)) => {
                return Err(GateError::RemoteRead(format!("command stream: {err}")));
            }
            None => return Ok(StreamEnd::Reconnect),
        };
        let name = if event.event.is_empty() {
            "message"
        } else {
            event.event.as_str()
        };
        match name {
            "put" | "patch" => {
                if event.data.is_empty() {
                    debug!(event = name, "Skipping event without data");
                    continue;
                }
                if !apply_event(&mut snapshot, name, &event.data) {
                    warn!(data = %event.data, "Unparseable command feed event");
                    continue;
                }
                if tx.send(snapshot.clone()).is_err() {
                    return Ok(StreamEnd::ReceiverGone);
                }
            }
            "keep-alive" => {}
            "cancel" | "auth_revoked" => {
                warn!(event = name, "Command feed revoked by server");
                return Ok(StreamEnd::Reconnect);
            }
            other => debug!(event = other, "Ignoring command feed event"),
        }
    }
}

/// Apply a `put`/`patch` event to the local snapshot.
fn apply_event(snapshot: &mut Value, name: &str, data: &str) -> bool {
    let Ok(Value::Object(mut body)) = serde_json::from_str::<Value>(data) else {
        return false;
    };
    let Some(Value::String(path)) = body.remove("path") else {
        return false;
    };
    let data = body.remove("data").unwrap_or(Value::Null);
    if name == "patch" {
        let Value::Object(fields) = data else {
            return false;
        };
        for (key, value) in fields {
            set_at(snapshot, &format!("{path}/{key}"), value);
        }
    } else {
        set_at(snapshot, &path, data);
    }
    true
}

/// Replace the value at a `/`-separated path; `null` removes it.
fn set_at(root: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(last) = segments.pop() else {
        *root = value;
        return;
    };
    let mut node = root;
    for segment in segments {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = node {
        if value.is_null() {
            map.remove(last);
        } else {
            map.insert(last.to_owned(), value);
        }
    }
}
