//! Progress events streamed from `POST /tasks/run`.
//!
//! The stream is newline-delimited JSON. The first line is always
//! [`ProgressEvent::Started`]; the last is either `Completed` or `Error`.

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WireResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// Execution has begun; the Busy Record is set.
    #[serde(rename_all = "camelCase")]
    Started {
        task_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// One message produced by the execution engine.
    #[serde(rename_all = "camelCase")]
    Message {
        content: serde_json::Value,
        message_count: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Completed {
        message: String,
        total_messages: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn started(task_id: impl Into<String>) -> Self {
        Self::Started {
            task_id: task_id.into(),
            message: "Starting task execution".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn message(content: serde_json::Value, message_count: u64) -> Self {
        Self::Message {
            content,
            message_count,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(total_messages: u64) -> Self {
        Self::Completed {
            message: "Task completed successfully".to_string(),
            total_messages,
            timestamp: Utc::now(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    /// Serializes the event as one NDJSON line, newline included.
    pub fn to_line(&self) -> WireResult<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

/// Incremental NDJSON decoder.
///
/// Network chunks do not respect line boundaries, so partial lines are kept
/// until the newline arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every complete event it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireResult<ProgressEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<WireResult<ProgressEvent>> {
        let rest = self.buffer.split();
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<WireResult<ProgressEvent>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(Into::into))
}
