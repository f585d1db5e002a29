//! Records handed to external consumers.
//!
//! Every poll cycle produces one [`Record::Snapshot`] or
//! [`Record::PollFailure`]; every write or reset invocation produces one
//! [`WriteResult`]. Sinks are append-only consumers of these records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::snapshot::DeviceSnapshot;

/// Outcome of one write, control or reset invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResult {
    pub timestamp: DateTime<Utc>,
    /// Register name, or the operation for multi-step sequences.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WriteResult {
    pub fn succeeded(target: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            timestamp: Utc::now(),
            target: target.into(),
            value,
            success: true,
            reason: None,
        }
    }

    pub fn failed(target: impl Into<String>, value: Option<f64>, reason: impl ToString) -> Self {
        Self {
            timestamp: Utc::now(),
            target: target.into(),
            value,
            success: false,
            reason: Some(reason.to_string()),
        }
    }

    /// Build from the result of an operation.
    pub fn from_result<T, E: ToString>(
        target: impl Into<String>,
        value: Option<f64>,
        result: &Result<T, E>,
    ) -> Self {
        match result {
            Ok(_) => Self::succeeded(target, value),
            Err(e) => Self::failed(target, value, e.to_string()),
        }
    }
}

/// A record emitted to a sink.
#[derive(Debug, Clone)]
pub enum Record {
    Snapshot(DeviceSnapshot),
    PollFailure {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    Write(WriteResult),
    Reset(WriteResult),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Snapshot(_) => "snapshot",
            Record::PollFailure { .. } => "poll_failure",
            Record::Write(_) => "write",
            Record::Reset(_) => "reset",
        }
    }

    /// Flat JSON object with a `type` field.
    pub fn to_json(&self) -> JsonValue {
        let mut object = match self {
            Record::Snapshot(snapshot) => JsonValue::Object(snapshot.to_record()),
            Record::PollFailure { timestamp, reason } => json!({
                "timestamp": timestamp.to_rfc3339(),
                "reason": reason,
            }),
            Record::Write(result) | Record::Reset(result) => {
                serde_json::to_value(result).unwrap_or_else(|_| json!({}))
            }
        };
        if let Some(map) = object.as_object_mut() {
            map.insert("type".to_string(), JsonValue::from(self.kind()));
        }
        object
    }
}

/// Append-only consumer of records.
pub trait RecordSink: Send {
    fn emit(&mut self, record: &Record);
}

/// Logs records through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn emit(&mut self, record: &Record) {
        match record {
            Record::Snapshot(snapshot) => {
                let faults = snapshot.active_faults();
                if faults.is_empty() {
                    info!(
                        timestamp = %snapshot.timestamp(),
                        values = snapshot.values().len(),
                        "Snapshot"
                    );
                } else {
                    let faults: Vec<String> = faults.iter().map(ToString::to_string).collect();
                    warn!(
                        timestamp = %snapshot.timestamp(),
                        values = snapshot.values().len(),
                        faults = %faults.join("; "),
                        "Snapshot with active faults"
                    );
                }
            }
            Record::PollFailure { reason, .. } => {
                warn!(reason = %reason, "Poll cycle produced no snapshot");
            }
            Record::Write(result) | Record::Reset(result) => {
                if result.success {
                    info!(kind = record.kind(), target = %result.target, value = ?result.value, "Succeeded");
                } else {
                    warn!(
                        kind = record.kind(),
                        target = %result.target,
                        value = ?result.value,
                        reason = result.reason.as_deref().unwrap_or(""),
                        "Failed"
                    );
                }
            }
        }
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, record: &Record) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, &record.to_json())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl RecordSink for JsonLinesSink {
    fn emit(&mut self, record: &Record) {
        if let Err(e) = self.write_line(record) {
            warn!(error = %e, kind = record.kind(), "Failed to append record");
        }
    }
}

/// Collects records in memory.
impl RecordSink for Vec<Record> {
    fn emit(&mut self, record: &Record) {
        self.push(record.clone());
    }
}

/// Emits to both sinks in order.
impl<A: RecordSink, B: RecordSink> RecordSink for (A, B) {
    fn emit(&mut self, record: &Record) {
        self.0.emit(record);
        self.1.emit(record);
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn emit(&mut self, record: &Record) {
        (**self).emit(record);
    }
}
