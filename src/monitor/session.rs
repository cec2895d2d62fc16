//! Per-target rolling latency statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::db::Target;
use crate::display::StatusTier;
use crate::probe::ProbeResult;

/// Weight of the running average when folding in a new sample.
const AVG_HISTORY_WEIGHT: f64 = 0.7;
/// Weight of the new sample.
const AVG_SAMPLE_WEIGHT: f64 = 0.3;

/// Latency statistics over every successful probe of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub last: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Exponentially weighted moving average.
    pub avg: Option<f64>,
}

/// Live monitoring state for one target.
#[derive(Debug, Clone)]
pub struct MonitoringSession {
    target_id: i64,
    address: String,
    running: bool,
    epoch: u64,
    packets_sent: u64,
    packets_received: u64,
    stats: LatencyStats,
    history: VecDeque<f64>,
    capacity: usize,
    last_error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl MonitoringSession {
    /// A stopped session with empty counters keeping at most `capacity` samples.
    pub fn new(target: &Target, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            target_id: target.id,
            address: target.address.clone(),
            running: false,
            epoch: 0,
            packets_sent: 0,
            packets_received: 0,
            stats: LatencyStats::default(),
            history: VecDeque::with_capacity(capacity),
            capacity,
            last_error: None,
            updated_at: None,
        }
    }

    /// Fold one probe result into the counters, stats and history.
    pub fn apply(&mut self, result: ProbeResult) {
        debug_assert_eq!(result.target_id, self.target_id);
        self.packets_sent += 1;
        self.updated_at = Some(result.timestamp);

        let Some(rtt) = result.rtt_ms() else {
            self.last_error = result.error();
            return;
        };

        self.packets_received += 1;
        self.last_error = None;

        let stats = &mut self.stats;
        stats.last = Some(rtt);
        stats.min = Some(stats.min.map_or(rtt, |m| m.min(rtt)));
        stats.max = Some(stats.max.map_or(rtt, |m| m.max(rtt)));
        stats.avg = Some(match stats.avg {
            None => rtt,
            Some(avg) => avg * AVG_HISTORY_WEIGHT + rtt * AVG_SAMPLE_WEIGHT,
        });

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rtt);
    }

    /// Apply a result produced by the periodic run identified by `epoch`.
    ///
    /// Returns false, leaving the session untouched, when that run has been
    /// stopped in the meantime.
    pub fn apply_if_current(&mut self, epoch: u64, result: ProbeResult) -> bool {
        if !self.running || self.epoch != epoch {
            return false;
        }
        self.apply(result);
        true
    }

    /// Mark the session running and return the epoch of the new run.
    pub fn begin_run(&mut self) -> u64 {
        self.epoch += 1;
        self.running = true;
        self.epoch
    }

    /// Freeze the session; results of the current run are discarded from now on.
    pub fn halt(&mut self) {
        if self.running {
            self.running = false;
            self.epoch += 1;
        }
    }

    pub fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Share of sent probes that got no usable reply, 0 before the first probe.
    pub fn loss_percent(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (self.packets_sent - self.packets_received) as f64 / self.packets_sent as f64 * 100.0
    }

    /// Point-in-time copy for viewers.
    pub fn snapshot(&self) -> LatencySnapshot {
        let loss_percent = self.loss_percent();
        LatencySnapshot {
            target: self.target_id,
            address: self.address.clone(),
            running: self.running,
            sent: self.packets_sent,
            received: self.packets_received,
            last_latency_ms: if self.last_error.is_some() { None } else { self.stats.last },
            min_latency_ms: self.stats.min,
            max_latency_ms: self.stats.max,
            avg_latency_ms: self.stats.avg,
            loss_percent,
            history_ms: self.history.iter().copied().collect(),
            status: StatusTier::classify(loss_percent, self.stats.avg),
            error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Serializable copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub target: i64,
    pub address: String,
    pub running: bool,
    pub sent: u64,
    pub received: u64,
    /// Null when the most recent probe failed.
    pub last_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub loss_percent: f64,
    pub history_ms: Vec<f64>,
    pub status: StatusTier,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LatencySnapshot {
    /// Snapshot of a target that has never been probed.
    pub fn empty(target: &Target) -> Self {
        MonitoringSession::new(target, 1).snapshot()
    }
}
