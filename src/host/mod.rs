//! Host resource sampling for the stats feed and the history log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::feed::Publisher;
use crate::history::{HistoryLog, HistorySample, MetricKind};

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub name: String,
    pub mount: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// Traffic counters of one network interface since boot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub name: String,
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

/// A single reading of the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReading {
    /// Global CPU usage in percent.
    pub cpu: f64,
    /// Memory usage in percent.
    pub memory: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disks: Vec<DiskInfo>,
    pub networks: Vec<NetworkInfo>,
}

/// Host stats pushed to viewers: the latest reading plus persisted history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    #[serde(flatten)]
    pub reading: HostReading,
    pub cpu_history: Vec<HistorySample>,
    pub memory_history: Vec<HistorySample>,
    pub updated_at: DateTime<Utc>,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Reads host CPU, memory, disk and network figures.
pub struct HostSampler {
    sys: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }

    /// CPU usage is measured since the previous call.
    pub fn sample(&mut self) -> HostReading {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let memory_used = self.sys.used_memory();
        let memory_total = self.sys.total_memory();

        let disks = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|d| {
                let total = d.total_space();
                let available = d.available_space();
                DiskInfo {
                    name: d.name().to_string_lossy().into_owned(),
                    mount: d.mount_point().display().to_string(),
                    total_bytes: total,
                    available_bytes: available,
                    usage_percent: percent(total.saturating_sub(available), total),
                }
            })
            .collect();

        let mut networks: Vec<NetworkInfo> = Networks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|(name, data)| NetworkInfo {
                name: name.clone(),
                received_bytes: data.total_received(),
                transmitted_bytes: data.total_transmitted(),
            })
            .collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));

        HostReading {
            cpu: self.sys.global_cpu_usage() as f64,
            memory: percent(memory_used, memory_total),
            memory_used,
            memory_total,
            disks,
            networks,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples the host on the stats tick, pushes [`HostStats`] to viewers and
/// appends CPU and memory to the history log on the slower history tick.
pub struct HostMonitor {
    log: Arc<HistoryLog>,
    publisher: Arc<Publisher>,
}

impl HostMonitor {
    pub fn new(log: Arc<HistoryLog>, publisher: Arc<Publisher>) -> Self {
        Self { log, publisher }
    }

    pub fn start(self, stats_interval: Duration, history_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sampler = HostSampler::new();
            let mut latest: Option<HostReading> = None;

            let mut stats_tick = tokio::time::interval(stats_interval);
            stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut history_tick = tokio::time::interval(history_interval);
            history_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // Both fire at once; CPU usage has no baseline yet.
            stats_tick.tick().await;
            history_tick.tick().await;

            loop {
                tokio::select! {
                    _ = stats_tick.tick() => {
                        let reading = sampler.sample();
                        latest = Some(reading.clone());
                        self.push(reading).await;
                    }
                    _ = history_tick.tick() => {
                        if let Some(reading) = &latest {
                            self.record(reading.cpu, reading.memory).await;
                        }
                    }
                }
            }
        })
    }

    async fn push(&self, reading: HostReading) {
        let log = self.log.clone();
        let histories = tokio::task::spawn_blocking(move || {
            (log.load(MetricKind::Cpu), log.load(MetricKind::Memory))
        })
        .await;

        let (cpu_history, memory_history) = match histories {
            Ok(h) => h,
            Err(e) => {
                tracing::error!("Host: history reader failed: {}", e);
                (Vec::new(), Vec::new())
            }
        };

        let stats = self.publisher.publish_host(HostStats {
            reading,
            cpu_history,
            memory_history,
            updated_at: Utc::now(),
        });
        if stats.dropped > 0 || stats.closed > 0 {
            tracing::debug!(
                "Host stats: {} delivered, {} dropped, {} closed",
                stats.delivered,
                stats.dropped,
                stats.closed
            );
        }
    }

    async fn record(&self, cpu: f64, memory: f64) {
        let log = self.log.clone();
        let written = tokio::task::spawn_blocking(move || {
            log.record(MetricKind::Cpu, cpu)?;
            log.record(MetricKind::Memory, memory)
        })
        .await;

        match written {
            Ok(Ok(())) => tracing::debug!("History: cpu {:.1}%, memory {:.1}%", cpu, memory),
            Ok(Err(e)) => tracing::error!("History: failed to record sample: {}", e),
            Err(e) => tracing::error!("History: writer task failed: {}", e),
        }
    }
}
