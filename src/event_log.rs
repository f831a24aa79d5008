//! Per-machine event records and the sinks they are written to.
//!
//! The on-disk format is one file per machine:
//!
//! ```text
//! Machine 0 initialized with clock rate 4
//!
//! Time,Event,Queue Length,Logical Clock
//! 2026-01-01 12:00:00.250,internal,0,1
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::message::MachineId;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
pub const CSV_HEADER: [&str; 4] = ["Time", "Event", "Queue Length", "Logical Clock"];

#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Internal,
    Send,
    Receive,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Internal => "internal",
            EventKind::Send => "send",
            EventKind::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// One event on a machine's local timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
    /// Pending messages after the event.
    pub queue_length: usize,
    /// Logical clock after the event.
    pub clock: u64,
}

impl EventRecord {
    pub fn now(kind: EventKind, queue_length: usize, clock: u64) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            queue_length,
            clock,
        }
    }
}

/// Append-only destination for a machine's records.
pub trait EventSink: Send {
    fn record(&mut self, record: &EventRecord) -> Result<(), LogError>;
    fn flush(&mut self) -> Result<(), LogError>;
}

#[derive(Debug, Serialize)]
struct CsvRow {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Event")]
    event: EventKind,
    #[serde(rename = "Queue Length")]
    queue_length: usize,
    #[serde(rename = "Logical Clock")]
    clock: u64,
}

/// `machine_<id>.log` in a log directory.
pub struct CsvEventLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvEventLog {
    pub fn file_name(id: MachineId) -> String {
        format!("machine_{}.log", id.0)
    }

    /// Create (truncating) the log for `id` and write its preamble and header.
    pub fn create(dir: &Path, id: MachineId, rate: u32) -> Result<Self, LogError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(id));
        let mut file = File::create(&path)?;
        writeln!(file, "Machine {} initialized with clock rate {}", id, rate)?;
        writeln!(file)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        tracing::debug!("Event log for machine {} at {}", id, path.display());
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for CsvEventLog {
    fn record(&mut self, record: &EventRecord) -> Result<(), LogError> {
        self.writer.serialize(CsvRow {
            time: record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            event: record.kind,
            queue_length: record.queue_length,
            clock: record.clock,
        })?;
        // Keep the file readable while the run is still going.
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LogError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for MemoryEventLog {
    fn record(&mut self, record: &EventRecord) -> Result<(), LogError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LogError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_csv_log_layout() {
        let dir = tempdir().unwrap();
        let mut log = CsvEventLog::create(dir.path(), MachineId(2), 4).unwrap();
        log.record(&EventRecord::now(EventKind::Internal, 0, 1)).unwrap();
        log.record(&EventRecord::now(EventKind::Receive, 3, 9)).unwrap();
        log.flush().unwrap();

        let text = fs::read_to_string(dir.path().join("machine_2.log")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Machine 2 initialized with clock rate 4");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "Time,Event,Queue Length,Logical Clock");
        assert!(lines[3].ends_with(",internal,0,1"));
        assert!(lines[4].ends_with(",receive,3,9"));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_memory_log_shares_records() {
        let log = MemoryEventLog::new();
        let mut sink = log.clone();
        sink.record(&EventRecord::now(EventKind::Send, 0, 1)).unwrap();
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.records()[0].kind, EventKind::Send);
    }
}
