//! Gate data model: commands, status, log records and allow-list entries.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GateError, Result};

/// Subject id used for commands and records produced by plate recognition.
pub const ANPR_SUBJECT: &str = "ANPR";

/// Action requested of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    /// Open the gate.
    Open,
    /// Close the gate.
    Close,
}

impl GateAction {
    /// Parse an action name, ignoring case and surrounding whitespace.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSE" => Some(Self::Close),
            _ => None,
        }
    }

    /// Hardware protocol form (uppercase, no terminator).
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
        }
    }
}

/// A validated gate command.
///
/// Remote payloads only become a `GateCommand` through
/// [`GateCommand::from_payload`]; anything that fails validation is dropped
/// at the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCommand {
    /// Requested action.
    pub action: GateAction,
    /// Issue time in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Subject that issued the command (user id or `ANPR`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// Plate associated with the command, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    /// Action text exactly as received, used in failure records.
    #[serde(skip)]
    raw_action: String,
}

impl GateCommand {
    /// Build the command published when a recognized plate is authorized.
    pub fn anpr_open(plate: &str, timestamp: i64) -> Self {
        Self {
            action: GateAction::Open,
            timestamp: Some(timestamp),
            triggered_by: Some(ANPR_SUBJECT.to_owned()),
            plate: Some(plate.to_owned()),
            raw_action: "open".to_owned(),
        }
    }

    /// Validate a remote payload.
    ///
    /// The payload must be an object with a non-empty string `action` naming
    /// `open` or `close` (any case). Optional fields of the wrong type are
    /// rejected rather than ignored.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let Value::Object(fields) = payload else {
            return Err(GateError::MalformedCommand(
                "payload is not an object".to_owned(),
            ));
        };

        let raw_action = match fields.get("action") {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_owned(),
            Some(_) => {
                return Err(GateError::MalformedCommand(
                    "action must be a non-empty string".to_owned(),
                ))
            }
            None => return Err(GateError::MalformedCommand("missing action".to_owned())),
        };
        let action = GateAction::parse(&raw_action)
            .ok_or_else(|| GateError::MalformedCommand(format!("unknown action {raw_action:?}")))?;

        Ok(Self {
            action,
            timestamp: optional_i64(fields.get("timestamp"), "timestamp")?,
            triggered_by: optional_string(fields.get("triggeredBy"), "triggeredBy")?,
            plate: optional_string(fields.get("plate"), "plate")?,
            raw_action,
        })
    }

    /// Action text as originally received.
    pub fn raw_action(&self) -> &str {
        &self.raw_action
    }
}

fn optional_string(value: Option<&Value>, field: &str) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(GateError::MalformedCommand(format!(
            "{field} must be a string"
        ))),
    }
}

fn optional_i64(value: Option<&Value>, field: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| GateError::MalformedCommand(format!("{field} must be an integer"))),
        Some(_) => Err(GateError::MalformedCommand(format!(
            "{field} must be an integer"
        ))),
    }
}

/// Current gate state as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    /// Gate is open.
    Open,
    /// Gate is closed.
    Closed,
}

impl GateStatus {
    /// Derive status from a hardware acknowledgment line.
    ///
    /// Only the hardware's own report counts: any line mentioning "opened"
    /// means open, everything else means closed.
    pub fn from_response(response: &str) -> Self {
        if response.to_lowercase().contains("opened") {
            Self::Open
        } else {
            Self::Closed
        }
    }

    /// Lowercase name, as stored remotely.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only action log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Plate involved, or `manual`.
    pub plate: String,
    /// Human-readable action description.
    pub action: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Subject id, or `unknown`.
    pub user_id: String,
    /// Whether the attempt succeeded.
    pub success: bool,
}

impl LogRecord {
    /// Record for a command the hardware acknowledged.
    pub fn command_completed(command: &GateCommand, status: GateStatus, timestamp: i64) -> Self {
        Self {
            plate: plate_or_manual(command),
            action: format!("Gate {status}"),
            timestamp,
            user_id: user_or_unknown(command),
            success: true,
        }
    }

    /// Record for a command whose exchange or status write failed.
    pub fn command_failed(command: &GateCommand, timestamp: i64) -> Self {
        Self {
            plate: plate_or_manual(command),
            action: format!("Gate {} failed", command.raw_action()),
            timestamp,
            user_id: user_or_unknown(command),
            success: false,
        }
    }

    /// Record for an authorized plate opening the gate.
    pub fn anpr_opened(plate: &str, timestamp: i64) -> Self {
        Self {
            plate: plate.to_owned(),
            action: "Gate opened by ANPR".to_owned(),
            timestamp,
            user_id: ANPR_SUBJECT.to_owned(),
            success: true,
        }
    }

    /// Record for a plate that is unknown or not allowed.
    pub fn unauthorized(plate: &str, timestamp: i64) -> Self {
        Self {
            plate: plate.to_owned(),
            action: "Unauthorized plate attempt".to_owned(),
            timestamp,
            user_id: ANPR_SUBJECT.to_owned(),
            success: false,
        }
    }
}

fn plate_or_manual(command: &GateCommand) -> String {
    command.plate.clone().unwrap_or_else(|| "manual".to_owned())
}

fn user_or_unknown(command: &GateCommand) -> String {
    command
        .triggered_by
        .clone()
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Allow-list entry keyed by canonical plate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PlateAllowEntry {
    /// Whether the plate may open the gate.
    #[serde(default)]
    pub allowed: bool,
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
