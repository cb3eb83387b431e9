//! Output formatting for emitted signals
//!
//! Renders an emission either as the human-readable text line
//! `[YYYY-MM-DD HH:MM:SS.mmm] VSS: <path> = <value> [<quality>]` or as the
//! JSON record `{path, value, quality}`. Value rendering defers to the
//! canonical forms of the value model. Interval and change gating happen
//! upstream in the evaluator; this module is presentation only.

use crate::processor::EmittedSignal;
use chrono::{DateTime, Local};
use std::io::Write;
use tracing::warn;

/// Rendering style for emitted signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Format an emission as the standard text line, timestamped with the
/// emission's wall clock in local time.
pub fn format_text(signal: &EmittedSignal) -> String {
    let local: DateTime<Local> = signal.timestamp.into();
    format!(
        "[{}] VSS: {} = {} [{}]",
        local.format("%Y-%m-%d %H:%M:%S%.3f"),
        signal.path,
        signal.value.to_text(),
        signal.quality
    )
}

/// Format an emission as a JSON record.
pub fn format_json(signal: &EmittedSignal) -> String {
    format!(
        "{{\"path\":{},\"value\":{},\"quality\":\"{}\"}}",
        serde_json::to_string(&signal.path).unwrap_or_else(|_| "\"\"".to_string()),
        signal.value.to_json(),
        signal.quality.as_str()
    )
}

/// Writes emitted signals to a configurable sink.
pub struct SignalWriter {
    format: OutputFormat,
    sink: Box<dyn Write + Send>,
}

impl SignalWriter {
    pub fn new(format: OutputFormat, sink: Box<dyn Write + Send>) -> Self {
        Self { format, sink }
    }

    /// The default sink: stderr.
    pub fn stderr(format: OutputFormat) -> Self {
        Self::new(format, Box::new(std::io::stderr()))
    }

    pub fn write(&mut self, signal: &EmittedSignal) {
        let line = match self.format {
            OutputFormat::Text => format_text(signal),
            OutputFormat::Json => format_json(signal),
        };
        if let Err(e) = writeln!(self.sink, "{}", line) {
            warn!("failed to write output: {}", e);
        }
    }
}
