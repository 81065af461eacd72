//! Wire protocol between the hub and its clients
//!
//! Every frame is one JSON object terminated by `\n`. A connection carries
//! exactly one [`Request`] and one [`Response`], except `subscribe`, which
//! is followed by zero or more [`Push`] frames until either side closes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BroodError, ErrorKind, Result};
use crate::types::{HelperId, HelperStatus, LogRecord, Recipients, SpawnBudget};

/// Maximum accepted frame size; longer lines are a protocol error
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Filters for reading the message log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Only records with `sequence >= from_sequence`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_sequence: Option<u64>,
    /// Only records sent by (or, for control records, about) this helper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<HelperId>,
    /// Keep only the last N matching records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_n: Option<usize>,
}

/// One request per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Spawn {
        parent: HelperId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        breadth: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depth: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Register {
        identity: HelperId,
    },
    Running {
        identity: HelperId,
    },
    Subscribe {
        identity: HelperId,
    },
    Send {
        from: HelperId,
        to: HelperId,
        content: String,
    },
    Broadcast {
        from: HelperId,
        content: String,
    },
    Stop {
        identity: HelperId,
    },
    Respawn {
        identity: HelperId,
    },
    Cleanup {
        identity: HelperId,
        #[serde(default)]
        cascade: bool,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<HelperId>,
    },
    LogQuery(LogQuery),
    Shutdown,
}

impl Request {
    /// Command name as it appears on the wire
    pub fn command(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Register { .. } => "register",
            Self::Running { .. } => "running",
            Self::Subscribe { .. } => "subscribe",
            Self::Send { .. } => "send",
            Self::Broadcast { .. } => "broadcast",
            Self::Stop { .. } => "stop",
            Self::Respawn { .. } => "respawn",
            Self::Cleanup { .. } => "cleanup",
            Self::Status { .. } => "status",
            Self::LogQuery(_) => "log_query",
            Self::Shutdown => "shutdown",
        }
    }

    /// Requests that never mutate registry or log
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::LogQuery(_))
    }
}

/// Error body of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
        }
    }

    pub fn with_data<T: Serialize>(data: &T) -> Result<Self> {
        Ok(Self {
            ok: true,
            data: Some(serde_json::to_value(data)?),
            error: None,
        })
    }

    pub fn failure(err: &BroodError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(WireError {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    /// Turn a failed response into a [`BroodError::Hub`]
    pub fn into_result(self) -> Result<Option<serde_json::Value>> {
        if self.ok {
            return Ok(self.data);
        }
        let error = self.error.unwrap_or(WireError {
            kind: ErrorKind::Internal,
            message: "hub reported failure without detail".to_string(),
        });
        Err(BroodError::Hub {
            kind: error.kind,
            message: error.message,
        })
    }

    /// Decode the data payload of a successful response
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.into_result()?.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(data)?)
    }
}

/// Frames pushed to a subscribed helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Push {
    Message {
        sequence: u64,
        timestamp: DateTime<Utc>,
        from: HelperId,
        recipients: Recipients,
        content: String,
    },
}

impl From<&LogRecord> for Push {
    fn from(record: &LogRecord) -> Self {
        Self::Message {
            sequence: record.sequence,
            timestamp: record.timestamp,
            from: record.sender,
            recipients: record.recipients.clone(),
            content: record.content.clone(),
        }
    }
}

/// Result of a `spawn`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    pub identity: HelperId,
    pub parent: HelperId,
    pub budget: SpawnBudget,
    /// Live siblings a peer channel was opened with
    pub peers: Vec<HelperId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Result of a `send` or `broadcast`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub sequence: u64,
    /// Number of subscribers the message was pushed to
    pub delivered: usize,
}

/// Result of a `cleanup`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    /// Cleaned identities, deepest first
    pub removed: Vec<HelperId>,
}

/// One row of `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSummary {
    pub identity: HelperId,
    pub parent: Option<HelperId>,
    pub status: HelperStatus,
    pub budget: SpawnBudget,
    pub subscribed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Result of `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub helpers: Vec<HelperSummary>,
    /// Sequence of the most recent log record (0 when empty)
    pub last_sequence: u64,
}

/// Serialize a frame, newline-terminated
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one frame (with or without its trailing newline)
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.len() > MAX_FRAME_BYTES {
        return Err(BroodError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            trimmed.len()
        )));
    }
    serde_json::from_str(trimmed).map_err(|e| BroodError::Protocol(format!("malformed frame: {}", e)))
}
