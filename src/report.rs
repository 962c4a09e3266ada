//! Per-fetch outcome records and the run report.
//!
//! One record arrives per (task, output format) completion. The reporter
//! detects global completion exactly once: on the record that makes every
//! per-format counter equal the expected task total.

use std::path::Path;

use chrono::{DateTime, Local};
use log::info;

use crate::error::DumpError;
use crate::query::Format;

pub const STATUS_OK: &str = "ok";

/// One reported result row for a single (task, output format) execution.
/// Immutable once recorded.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub task_key: String,
    pub format: Format,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_ms: u64,
    pub open_at_start: usize,
    pub open_at_end: usize,
    /// Size of the written artifact, re-stat'ed after the stream; -1 on failure.
    pub byte_size: i64,
    pub mime_type: &'static str,
    /// `"ok"` or an error description.
    pub status: String,
    /// Resolved URI with the access token masked.
    pub resolved_uri: String,
    pub filter_summary: String,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

pub struct Reporter {
    expected: usize,
    counters: Vec<(Format, usize)>,
    records: Vec<Outcome>,
    complete: bool,
}

impl Reporter {
    pub fn new(expected_tasks: usize, formats: &[Format]) -> Self {
        Self {
            expected: expected_tasks,
            counters: formats.iter().map(|format| (*format, 0)).collect(),
            records: Vec::new(),
            complete: false,
        }
    }

    /// Append a record; returns `true` exactly once, on the record that
    /// completes the batch. Recording past completion is a contract
    /// violation: the scheduler emits exactly one record per task and format.
    pub fn record(&mut self, outcome: Outcome) -> bool {
        debug_assert!(!self.complete, "outcome recorded after batch completion");
        if let Some(counter) = self
            .counters
            .iter_mut()
            .find(|(format, _)| *format == outcome.format)
        {
            counter.1 += 1;
        }
        self.records.push(outcome);

        if !self.complete
            && self
                .counters
                .iter()
                .all(|(_, count)| *count == self.expected)
        {
            self.complete = true;
            info!(
                "all {} outcomes recorded across {} formats",
                self.records.len(),
                self.counters.len()
            );
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn records(&self) -> &[Outcome] {
        &self.records
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.records.iter().filter(|outcome| !outcome.is_ok())
    }

    /// Write the ordered report table.
    pub fn write_csv(&self, path: &Path) -> Result<(), DumpError> {
        let mut writer = csv::WriterBuilder::new().from_path(path)?;

        writer.write_record([
            "task",
            "format",
            "started_at",
            "finished_at",
            "duration_ms",
            "open_at_start",
            "open_at_end",
            "bytes",
            "mime_type",
            "status",
            "uri",
            "filters",
        ])?;

        for outcome in &self.records {
            writer.write_record([
                outcome.task_key.clone(),
                outcome.format.wire_name().to_string(),
                outcome.started_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                outcome.finished_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                outcome.duration_ms.to_string(),
                outcome.open_at_start.to_string(),
                outcome.open_at_end.to_string(),
                outcome.byte_size.to_string(),
                outcome.mime_type.to_string(),
                outcome.status.clone(),
                outcome.resolved_uri.clone(),
                outcome.filter_summary.clone(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }
}
