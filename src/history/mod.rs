//! Capped on-disk history of host metrics.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] io::Error),
    #[error("history encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Metric kinds with a history file of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Cpu,
    Memory,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(MetricKind::Cpu),
            "memory" | "mem" => Ok(MetricKind::Memory),
            other => Err(format!("unknown metric: {}", other)),
        }
    }
}

/// One recorded value, `time` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub time: i64,
    pub value: f64,
}

/// Append-only log per metric kind, keeping the newest `capacity` samples.
pub struct HistoryLog {
    dir: PathBuf,
    capacity: usize,
    write_lock: Mutex<()>,
    warned: Mutex<HashSet<MetricKind>>,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity: capacity.max(1),
            write_lock: Mutex::new(()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self, kind: MetricKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.as_str()))
    }

    pub fn record(&self, kind: MetricKind, value: f64) -> Result<(), HistoryError> {
        self.record_at(kind, Utc::now().timestamp_millis(), value)
    }

    pub fn record_at(&self, kind: MetricKind, time: i64, value: f64) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock();

        let mut samples = self.load(kind);
        samples.push(HistorySample { time, value });
        if samples.len() > self.capacity {
            let excess = samples.len() - self.capacity;
            samples.drain(..excess);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.path(kind);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&samples)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Current log for `kind`. A missing or unreadable file reads as empty.
    pub fn load(&self, kind: MetricKind) -> Vec<HistorySample> {
        let path = self.path(kind);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                self.warn_once(kind, &path, &e.to_string());
                return Vec::new();
            }
        };

        match serde_json::from_slice(&data) {
            Ok(samples) => samples,
            Err(e) => {
                self.warn_once(kind, &path, &e.to_string());
                Vec::new()
            }
        }
    }

    fn warn_once(&self, kind: MetricKind, path: &Path, reason: &str) {
        if self.warned.lock().insert(kind) {
            tracing::warn!("History: ignoring unreadable {}: {}", path.display(), reason);
        }
    }
}
