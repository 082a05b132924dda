//! Line-oriented progress protocol.
//!
//! Every call to [`ProgressReporter::emit_progress`] produces one standalone
//! JSON record:
//!
//! ```json
//! {"type":"progress","stage":"resolving","percent":60.0,"message":"...","details":{...}}
//! ```
//!
//! Records go through a [`ProgressSink`]; the default sink writes them to
//! stdout and flushes after every line so a supervising process can tail them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Pipeline stages, in the only order they may be reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    DetectingConflicts,
    Resolving,
    Validating,
    Complete,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyzing => "analyzing",
            Stage::DetectingConflicts => "detecting_conflicts",
            Stage::Resolving => "resolving",
            Stage::Validating => "validating",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Stage::Analyzing => 0,
            Stage::DetectingConflicts => 1,
            Stage::Resolving => 2,
            Stage::Validating => 3,
            Stage::Complete => 4,
            Stage::Error => 5,
        }
    }

    /// Whether a record for `next` may follow a record for `self`.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Stage::Error || next.rank() >= self.rank()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub stage: Stage,
    pub percent: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ProgressRecord {
    pub fn new(
        stage: Stage,
        percent: f64,
        message: impl Into<String>,
        details: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            record_type: "progress".to_string(),
            stage,
            percent: clamp_percent(percent),
            message: message.into(),
            details: details.filter(|d| !d.is_empty()),
        }
    }
}

/// Clamp to `[0, 100]`; fractional values pass through, NaN becomes 0.
pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to write progress record: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode progress record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid stage transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },
    #[error("progress channel closed")]
    ChannelClosed,
}

/// Destination for progress records.
pub trait ProgressSink: Send {
    fn emit(&mut self, record: &ProgressRecord) -> Result<(), ProgressError>;
}

/// Writes one JSON object per line and flushes after each record.
pub struct JsonLineSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLineSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ProgressSink for JsonLineSink<W> {
    fn emit(&mut self, record: &ProgressRecord) -> Result<(), ProgressError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        // One write per record keeps lines whole.
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards records to an async consumer.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProgressRecord>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<ProgressRecord>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&mut self, record: &ProgressRecord) -> Result<(), ProgressError> {
        self.tx
            .send(record.clone())
            .map_err(|_| ProgressError::ChannelClosed)
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ProgressRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProgressRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressSink for MemorySink {
    fn emit(&mut self, record: &ProgressRecord) -> Result<(), ProgressError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

/// Emits progress records in stage order.
pub struct ProgressReporter {
    sink: Box<dyn ProgressSink>,
    current: Option<Stage>,
    last_percent: f64,
}

impl ProgressReporter {
    pub fn new(sink: impl ProgressSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            current: None,
            last_percent: 0.0,
        }
    }

    /// Reporter writing JSON lines to the process's stdout.
    pub fn stdout() -> Self {
        Self::new(JsonLineSink::stdout())
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.current
    }

    /// Start a new stage sequence, e.g. for the next file.
    pub fn restart(&mut self) {
        self.current = None;
        self.last_percent = 0.0;
    }

    /// Emit one record. Backward moves and anything after `complete` or
    /// `error` are rejected without writing.
    pub fn emit_progress(
        &mut self,
        stage: Stage,
        percent: f64,
        message: impl Into<String>,
        details: Option<Map<String, Value>>,
    ) -> Result<(), ProgressError> {
        if let Some(current) = self.current {
            if !current.can_advance_to(stage) {
                return Err(ProgressError::InvalidTransition {
                    from: current,
                    to: stage,
                });
            }
        }

        let record = ProgressRecord::new(stage, percent, message, details);
        tracing::debug!(stage = %record.stage, percent = record.percent, "{}", record.message);
        self.sink.emit(&record)?;
        self.current = Some(stage);
        self.last_percent = record.percent;
        Ok(())
    }

    /// Report a terminal failure at the last percent emitted.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        details: Option<Map<String, Value>>,
    ) -> Result<(), ProgressError> {
        self.emit_progress(Stage::Error, self.last_percent, message, details)
    }
}
