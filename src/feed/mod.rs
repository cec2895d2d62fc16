//! Live feed of latency snapshots and host stats to connected viewers.
//!
//! Each viewer owns a bounded channel. A publish tick snapshots every
//! viewed target and offers it without waiting: a viewer that has fallen
//! behind misses that update, and a viewer that went away is forgotten.
//! Host stats reach their viewers the same way when the host monitor
//! pushes a new reading.

use crate::host::HostStats;
use crate::monitor::{LatencySnapshot, MonitorError, Registry};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A message pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FeedMessage {
    LatencyUpdate(LatencySnapshot),
    HostStats(HostStats),
}

/// What a viewer is watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedTopic {
    Target(i64),
    Host,
}

/// A viewer's end of the feed.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub topic: FeedTopic,
    pub rx: mpsc::Receiver<FeedMessage>,
}

/// Outcome of one publish tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

struct Viewer {
    topic: FeedTopic,
    tx: mpsc::Sender<FeedMessage>,
}

fn offer(
    id: u64,
    tx: &mpsc::Sender<FeedMessage>,
    message: FeedMessage,
    stats: &mut PublishStats,
    gone: &mut Vec<u64>,
) {
    match tx.try_send(message) {
        Ok(()) => stats.delivered += 1,
        Err(TrySendError::Full(_)) => {
            tracing::debug!("Feed: viewer {} is behind, dropping update", id);
            stats.dropped += 1;
        }
        Err(TrySendError::Closed(_)) => {
            stats.closed += 1;
            gone.push(id);
        }
    }
}

pub struct Publisher {
    registry: Arc<Registry>,
    buffer: usize,
    next_id: AtomicU64,
    viewers: Mutex<HashMap<u64, Viewer>>,
    latest_host: Mutex<Option<HostStats>>,
}

impl Publisher {
    pub fn new(registry: Arc<Registry>, buffer: usize) -> Self {
        Self {
            registry,
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            viewers: Mutex::new(HashMap::new()),
            latest_host: Mutex::new(None),
        }
    }

    fn register(&self, topic: FeedTopic, first: Option<FeedMessage>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Some(message) = first {
            // The channel is fresh and holds at least one message.
            let _ = tx.try_send(message);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.viewers.lock().insert(id, Viewer { topic, tx });
        tracing::debug!("Feed: viewer {} subscribed to {:?}", id, topic);

        Subscription { id, topic, rx }
    }

    /// Register a viewer of `target_id`. The current snapshot is queued at once.
    pub fn subscribe(&self, target_id: i64) -> Result<Subscription, MonitorError> {
        let snapshot = self.registry.snapshot(target_id)?;
        Ok(self.register(
            FeedTopic::Target(target_id),
            Some(FeedMessage::LatencyUpdate(snapshot)),
        ))
    }

    /// Register a viewer of host stats. The latest reading, if any, is queued at once.
    pub fn subscribe_host(&self) -> Subscription {
        let latest = self.latest_host.lock().clone();
        self.register(FeedTopic::Host, latest.map(FeedMessage::HostStats))
    }

    pub fn unsubscribe(&self, viewer_id: u64) {
        if self.viewers.lock().remove(&viewer_id).is_some() {
            tracing::debug!("Feed: viewer {} unsubscribed", viewer_id);
        }
    }

    /// Drop every viewer of a target. Their receivers see the channel close.
    pub fn disconnect_target(&self, target_id: i64) -> usize {
        let mut viewers = self.viewers.lock();
        let before = viewers.len();
        viewers.retain(|_, v| v.topic != FeedTopic::Target(target_id));
        before - viewers.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    fn forget(&self, gone: Vec<u64>) {
        if !gone.is_empty() {
            let mut viewers = self.viewers.lock();
            for id in gone {
                viewers.remove(&id);
            }
        }
    }

    fn senders(&self, host: bool) -> Vec<(u64, FeedTopic, mpsc::Sender<FeedMessage>)> {
        self.viewers
            .lock()
            .iter()
            .filter(|(_, v)| (v.topic == FeedTopic::Host) == host)
            .map(|(id, v)| (*id, v.topic, v.tx.clone()))
            .collect()
    }

    /// Offer the latest snapshot to every target viewer without blocking.
    pub fn publish_tick(&self) -> PublishStats {
        let mut stats = PublishStats::default();
        let mut snapshots: HashMap<i64, Option<LatencySnapshot>> = HashMap::new();
        let mut gone = Vec::new();

        for (id, topic, tx) in self.senders(false) {
            let FeedTopic::Target(target_id) = topic else {
                continue;
            };
            let snapshot = snapshots
                .entry(target_id)
                .or_insert_with(|| self.registry.snapshot(target_id).ok());
            let Some(snapshot) = snapshot else {
                // Target no longer exists.
                stats.closed += 1;
                gone.push(id);
                continue;
            };

            let message = FeedMessage::LatencyUpdate(snapshot.clone());
            offer(id, &tx, message, &mut stats, &mut gone);
        }

        self.forget(gone);
        stats
    }

    /// Keep `host` as the latest reading and offer it to every host viewer.
    pub fn publish_host(&self, host: HostStats) -> PublishStats {
        *self.latest_host.lock() = Some(host.clone());

        let mut stats = PublishStats::default();
        let mut gone = Vec::new();
        for (id, _, tx) in self.senders(true) {
            offer(id, &tx, FeedMessage::HostStats(host.clone()), &mut stats, &mut gone);
        }

        self.forget(gone);
        stats
    }

    /// Spawn the periodic publish loop.
    pub fn start(self: Arc<Self>, interval_duration: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let stats = self.publish_tick();
                if stats.dropped > 0 || stats.closed > 0 {
                    tracing::debug!(
                        "Feed tick: {} delivered, {} dropped, {} closed, {} viewers left",
                        stats.delivered,
                        stats.dropped,
                        stats.closed,
                        self.viewer_count()
                    );
                }
            }
        })
    }
}
