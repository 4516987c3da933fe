// Wire protocol types for the line-oriented device link
//
// Every command is a single newline-terminated ASCII line. The device answers
// each one with a single line; the expected acknowledgement is a substring
// of that line (e.g. "ACTION:MOVE_FORWARD:SPEED:40" acknowledges MOVE_FORWARD).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::COMMAND_TIMEOUT;

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const STOP: &str = "STOP";
pub const STATUS: &str = "STATUS";
pub const READ_SENSORS: &str = "READ_SENSORS";

pub const ACK_STOP: &str = "ACTION:STOP";
pub const ACK_SPEED_SET: &str = "ACTION:SPEED_SET";
pub const ACK_LED_PATTERN: &str = "ACTION:LED_PATTERN";

pub const STATUS_PREFIX: &str = "STATUS:";
pub const SENSORS_PREFIX: &str = "SENSORS:";
pub const ERROR_PREFIX: &str = "ERROR:";

/// A single request line, built per call and never stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub expects_response: bool,
    pub timeout: Duration,
}

impl Command {
    /// Command that waits up to `timeout` for a reply line
    pub fn request(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            expects_response: true,
            timeout,
        }
    }

    /// Command with the default steady-state timeout
    pub fn new(text: impl Into<String>) -> Self {
        Self::request(text, COMMAND_TIMEOUT)
    }

    pub fn led_pattern(pattern: u8, timeout: Duration) -> Self {
        Self::request(format!("LED_PATTERN:{}", pattern), timeout)
    }
}

/// Outcome of one round trip. A missing response is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub response: Option<String>,
    pub elapsed: Duration,
}

impl CommandResult {
    /// True if the reply contains the acknowledgement token
    pub fn acknowledged(&self, token: &str) -> bool {
        self.response
            .as_deref()
            .is_some_and(|line| line.contains(token))
    }

    pub fn timed_out(&self) -> bool {
        self.response.is_none()
    }
}

/// Return the text after `prefix`, wherever it appears in the line
pub fn payload_after<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.split_once(prefix).map(|(_, rest)| rest.trim())
}

/// Telemetry reported by the device in reply to STATUS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    #[serde(default)]
    pub speed: Option<u8>,
    /// Milliseconds since device boot
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub free_memory: Option<u64>,
    /// Any fields the firmware adds beyond the known ones
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Device status reply, tagged by what the device actually sent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Well-formed `STATUS:<json>`
    Parsed(DeviceTelemetry),
    /// A line without the STATUS prefix
    Raw(String),
    /// `ERROR:<reason>` reported by the firmware
    Error(String),
}

/// Payload of `SENSORS:<json>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    #[serde(default)]
    pub distance: Option<f32>,
    #[serde(default)]
    pub light: Vec<f32>,
}
