//! # Log analysis
//!
//! Reads the `machine_<id>.log` files a run leaves behind, re-checks the
//! clock invariants offline and summarises each machine: event counts per
//! kind, final clock, queue lengths, plus the clock drift across machines.

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::event_log::{EventKind, EventRecord, CSV_HEADER, TIMESTAMP_FORMAT};
use crate::machine::guard::check_transition;
use crate::message::MachineId;

pub const REPORT_FILE: &str = "analysis_report.txt";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("Malformed log {path}: {detail}")]
    Format { path: PathBuf, detail: String },
    #[error("No machine logs found in {0}")]
    NoLogs(PathBuf),
}

/// One parsed log file.
#[derive(Debug, Clone)]
pub struct MachineLog {
    pub id: MachineId,
    pub rate: Option<u32>,
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
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

/// `machine_7.log` -> 7.
pub fn machine_id_from_file_name(name: &str) -> Option<MachineId> {
    name.strip_prefix("machine_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
        .map(MachineId)
}

pub fn parse_log_file(path: &Path) -> Result<MachineLog, AnalysisError> {
    let format_error = |detail: String| AnalysisError::Format { path: path.to_path_buf(), detail };
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let id = machine_id_from_file_name(name)
        .ok_or_else(|| format_error(format!("unexpected file name '{}'", name)))?;
    let text = fs::read_to_string(path)?;

    let rate = text
        .lines()
        .next()
        .and_then(|line| line.rsplit_once("clock rate "))
        .and_then(|(_, rate)| rate.trim().parse().ok());

    let header = CSV_HEADER.join(",");
    let start = text
        .find(&header)
        .ok_or_else(|| format_error("missing CSV header".to_string()))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text[start..].as_bytes());
    let mut records: Vec<EventRecord> = Vec::new();
    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.map_err(|source| AnalysisError::Csv { path: path.to_path_buf(), source })?;
        let naive = NaiveDateTime::parse_from_str(&row.time, TIMESTAMP_FORMAT)
            .map_err(|e| format_error(format!("row {}: bad time '{}': {}", line + 1, row.time, e)))?;
        let previous = records.last().map(|r| r.timestamp);
        let timestamp = resolve_local(Local.from_local_datetime(&naive), previous)
            .ok_or_else(|| format_error(format!("row {}: time '{}' does not exist locally", line + 1, row.time)))?;
        records.push(EventRecord {
            timestamp,
            kind: row.event,
            queue_length: row.queue_length,
            clock: row.clock,
        });
    }
    Ok(MachineLog { id, rate, records })
}

/// Pick an instant for a logged local time.
///
/// Times repeated by a daylight-saving fall-back are ambiguous; the earlier
/// reading is used unless it would put the record before `previous`.
pub fn resolve_local<Tz: TimeZone>(
    mapped: LocalResult<DateTime<Tz>>,
    previous: Option<DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    match mapped {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(early, late) => match previous {
            Some(prev) if early < prev => Some(late),
            _ => Some(early),
        },
        LocalResult::None => None,
    }
}

/// Every `machine_<id>.log` in `dir`, ordered by id.
pub fn load_logs(dir: &Path) -> Result<Vec<MachineLog>, AnalysisError> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(machine_id_from_file_name)
            .is_some();
        if is_log {
            let log = parse_log_file(&path)?;
            tracing::info!("Parsed {} events for machine {}", log.records.len(), log.id);
            logs.push(log);
        }
    }
    if logs.is_empty() {
        return Err(AnalysisError::NoLogs(dir.to_path_buf()));
    }
    logs.sort_by_key(|l| l.id);
    Ok(logs)
}

/// Offline invariant check of one machine's timeline.
///
/// The transmitted clock of a receive is not logged, so receives are only
/// checked for a strict increase.
pub fn validate_records(records: &[EventRecord]) -> Vec<String> {
    let mut violations = Vec::new();
    let mut previous = 0;
    let mut last_time = None;
    for (i, record) in records.iter().enumerate() {
        if let Err(e) = check_transition(previous, record.kind, record.clock, None) {
            violations.push(format!("record {}: {}", i + 1, e));
        }
        if let Some(last) = last_time {
            if record.timestamp < last {
                violations.push(format!("record {}: timestamp goes backwards", i + 1));
            }
        }
        previous = record.clock;
        last_time = Some(record.timestamp);
    }
    violations
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineAnalysis {
    pub id: MachineId,
    pub rate: Option<u32>,
    pub total_events: usize,
    pub events_by_kind: BTreeMap<EventKind, usize>,
    pub final_clock: u64,
    pub average_queue_length: f64,
    pub max_queue_length: usize,
    pub violations: Vec<String>,
}

impl MachineAnalysis {
    pub fn from_log(log: &MachineLog) -> Self {
        let mut events_by_kind = BTreeMap::new();
        for record in &log.records {
            *events_by_kind.entry(record.kind).or_insert(0) += 1;
        }
        let total_events = log.records.len();
        let queue_sum: usize = log.records.iter().map(|r| r.queue_length).sum();
        Self {
            id: log.id,
            rate: log.rate,
            total_events,
            events_by_kind,
            final_clock: log.records.iter().map(|r| r.clock).max().unwrap_or(0),
            average_queue_length: if total_events == 0 { 0.0 } else { queue_sum as f64 / total_events as f64 },
            max_queue_length: log.records.iter().map(|r| r.queue_length).max().unwrap_or(0),
            violations: validate_records(&log.records),
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub machines: Vec<MachineAnalysis>,
    pub max_clock: Option<(MachineId, u64)>,
    pub min_clock: Option<(MachineId, u64)>,
    pub clock_drift: u64,
}

impl AnalysisReport {
    pub fn from_logs(logs: &[MachineLog]) -> Self {
        let machines: Vec<MachineAnalysis> = logs.iter().map(MachineAnalysis::from_log).collect();
        let max_clock = machines.iter().max_by_key(|m| m.final_clock).map(|m| (m.id, m.final_clock));
        let min_clock = machines.iter().min_by_key(|m| m.final_clock).map(|m| (m.id, m.final_clock));
        let clock_drift = match (max_clock, min_clock) {
            (Some((_, max)), Some((_, min))) => max - min,
            _ => 0,
        };
        Self { machines, max_clock, min_clock, clock_drift }
    }

    pub fn is_valid(&self) -> bool {
        self.machines.iter().all(|m| m.violations.is_empty())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let rule = "-".repeat(50);
        let _ = writeln!(out, "=== Distributed System Simulation Analysis ===\n");
        let _ = writeln!(out, "Machine Statistics:\n{}", rule);
        for m in &self.machines {
            let _ = writeln!(out, "Machine {}:", m.id);
            if let Some(rate) = m.rate {
                let _ = writeln!(out, "  Clock rate: {} ticks/second", rate);
            }
            let _ = writeln!(out, "  Total events: {}", m.total_events);
            for (kind, count) in &m.events_by_kind {
                let _ = writeln!(out, "  {} events: {}", kind, count);
            }
            let _ = writeln!(out, "  Final logical clock value: {}", m.final_clock);
            let _ = writeln!(out, "  Average queue length: {:.2}", m.average_queue_length);
            let _ = writeln!(out, "  Maximum queue length: {}", m.max_queue_length);
            if m.violations.is_empty() {
                let _ = writeln!(out, "  Invariants: ok");
            } else {
                let _ = writeln!(out, "  Invariant violations: {}", m.violations.len());
                for v in &m.violations {
                    let _ = writeln!(out, "    {}", v);
                }
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "Global Observations:\n{}", rule);
        if let (Some((max_id, max)), Some((min_id, min))) = (self.max_clock, self.min_clock) {
            let _ = writeln!(out, "Maximum logical clock: {} (Machine {})", max, max_id);
            let _ = writeln!(out, "Minimum logical clock: {} (Machine {})", min, min_id);
        }
        let _ = writeln!(out, "Clock drift between machines: {}", self.clock_drift);
        out
    }

    /// Write the text report next to the logs and return its path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, AnalysisError> {
        let path = dir.join(REPORT_FILE);
        fs::write(&path, self.render_text())?;
        tracing::info!("Analysis report saved to {}", path.display());
        Ok(path)
    }
}

/// Load every log in `dir` and analyse it.
pub fn analyze_dir(dir: &Path) -> Result<AnalysisReport, AnalysisError> {
    let logs = load_logs(dir)?;
    Ok(AnalysisReport::from_logs(&logs))
}
