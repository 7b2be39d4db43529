//! The wire contract between the relay and its consumers.
//!
//! Server-Sent-Events framing with exactly three named events:
//!
//! | event       | `id:` line                   | data                                   |
//! |-------------|------------------------------|----------------------------------------|
//! | `activity`  | cursor after record          | `{id, timestamp, source, message, kind?, execution_id, status?}` |
//! | `heartbeat` | cursor after all sent so far | `{status: "alive", timestamp}`         |
//! | `error`     | none                         | `{code, message}`                      |
//!
//! A heartbeat's `id:` is omitted only before the first backlog read of a
//! fresh subscription. A consumer that has seen no activity can still resume
//! from it instead of falling back to a backlog.
//!
//! A frame without an `event:` line is not part of the contract. Consumers
//! reject it loudly instead of guessing, and producers never emit one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cursor::Cursor;
use crate::error::Error;
use crate::model::{ExecutionId, ExecutionStatus};

/// Version of this contract. Changes to the event set or payload shapes
/// bump it.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// The named events both sides recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Activity,
    Heartbeat,
    Error,
}

impl EventName {
    pub const ALL: [EventName; 3] = [EventName::Activity, EventName::Heartbeat, EventName::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Activity => "activity",
            EventName::Heartbeat => "heartbeat",
            EventName::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == name)
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Which subsequence a delivered record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// An execution status transition.
    Status,
    /// A line of execution output.
    Output,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Status => "status",
            Source::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// Stable record id; consumers dedup on it.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    pub message: String,
    /// Execution kind, e.g. the command that was run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPayload {
    pub fn alive(timestamp: DateTime<Utc>) -> Self {
        Self {
            status: "alive".to_string(),
            timestamp,
        }
    }
}

/// Machine-readable reason carried by an `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidRequest,
    InvalidCursor,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidCursor => "invalid_cursor",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::Internal => "internal",
        }
    }

    /// Will reconnecting with the same parameters ever help?
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCode::NotFound | ErrorCode::InvalidCursor | ErrorCode::InvalidRequest
        )
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidCursor(_) => ErrorCode::InvalidCursor,
            Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
            e if e.is_transient() => ErrorCode::StoreUnavailable,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    /// For logs and diagnostics, not end-user phrasing.
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            code: err.into(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing events
// ---------------------------------------------------------------------------

/// An event produced by a subscription, before framing.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Activity {
        /// Cursor that resumes right after this record.
        cursor: Cursor,
        payload: ActivityPayload,
    },
    Heartbeat {
        /// Position after everything sent before this heartbeat, once known.
        cursor: Option<Cursor>,
        payload: HeartbeatPayload,
    },
    Error(ErrorPayload),
}

impl StreamEvent {
    pub fn heartbeat(cursor: Option<Cursor>) -> Self {
        StreamEvent::Heartbeat {
            cursor,
            payload: HeartbeatPayload::alive(Utc::now()),
        }
    }

    pub fn name(&self) -> EventName {
        match self {
            StreamEvent::Activity { .. } => EventName::Activity,
            StreamEvent::Heartbeat { .. } => EventName::Heartbeat,
            StreamEvent::Error(_) => EventName::Error,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let (id, data) = match self {
            StreamEvent::Activity { cursor, payload } => {
                (Some(cursor.encode()), serde_json::to_string(payload))
            }
            StreamEvent::Heartbeat { cursor, payload } => {
                (cursor.map(|c| c.encode()), serde_json::to_string(payload))
            }
            StreamEvent::Error(payload) => (None, serde_json::to_string(payload)),
        };
        Frame {
            event: Some(self.name().as_str().to_string()),
            id,
            // Payloads are plain structs of strings, timestamps and enums.
            data: data.unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// One SSE frame as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl Frame {
    /// Render the frame in SSE text format, terminated by a blank line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental SSE parser. Feed it bytes as they arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame { event, id, data })
    }
}

// ---------------------------------------------------------------------------
// Incoming events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame has no event name")]
    Unnamed,

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("malformed {event} payload: {source}")]
    Payload {
        event: EventName,
        source: serde_json::Error,
    },
}

/// An event as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Activity {
        /// Opaque resume token from the `id:` line.
        cursor: Option<String>,
        payload: ActivityPayload,
    },
    Heartbeat {
        /// Resume token, absent before the server's first read.
        cursor: Option<String>,
        payload: HeartbeatPayload,
    },
    Error(ErrorPayload),
}

impl TryFrom<Frame> for Incoming {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> std::result::Result<Self, ProtocolError> {
        let name = frame.event.ok_or(ProtocolError::Unnamed)?;
        let event = EventName::parse(&name).ok_or(ProtocolError::UnknownEvent(name))?;
        let payload_err = |source| ProtocolError::Payload { event, source };

        Ok(match event {
            EventName::Activity => Incoming::Activity {
                cursor: frame.id,
                payload: serde_json::from_str(&frame.data).map_err(payload_err)?,
            },
            EventName::Heartbeat => Incoming::Heartbeat {
                cursor: frame.id,
                payload: serde_json::from_str(&frame.data).map_err(payload_err)?,
            },
            EventName::Error => {
                Incoming::Error(serde_json::from_str(&frame.data).map_err(payload_err)?)
            }
        })
    }
}
