//! Synthetic probe that fabricates plausible replies without touching the network.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{ProbeError, ProbeResult, Prober};
use crate::db::Target;

/// Generates uniformly distributed latencies and random loss.
#[derive(Debug, Clone)]
pub struct SyntheticProber {
    timeout: Duration,
    min_ms: f64,
    max_ms: f64,
    loss_ratio: f64,
}

impl SyntheticProber {
    /// Latencies in 0–100 ms, no loss.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            min_ms: 0.0,
            max_ms: 100.0,
            loss_ratio: 0.0,
        }
    }

    /// Share of probes reported as lost, clamped to 0.0..=1.0.
    pub fn with_loss_ratio(mut self, ratio: f64) -> Self {
        self.loss_ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn with_latency_range(mut self, min_ms: f64, max_ms: f64) -> Self {
        self.min_ms = min_ms.max(0.0);
        self.max_ms = max_ms.max(self.min_ms);
        self
    }

    /// Draw one outcome; `None` means the probe is lost.
    fn draw(&self) -> Option<f64> {
        let mut rng = rand::thread_rng();
        if self.loss_ratio > 0.0 && rng.gen_bool(self.loss_ratio) {
            return None;
        }
        if self.max_ms > self.min_ms {
            Some(rng.gen_range(self.min_ms..self.max_ms))
        } else {
            Some(self.min_ms)
        }
    }
}

#[async_trait]
impl Prober for SyntheticProber {
    async fn probe(&self, target: &Target) -> ProbeResult {
        match self.draw() {
            Some(rtt_ms) if rtt_ms < self.timeout.as_secs_f64() * 1000.0 => {
                tokio::time::sleep(Duration::from_secs_f64(rtt_ms / 1000.0)).await;
                ProbeResult::reply(target.id, rtt_ms)
            }
            _ => {
                tokio::time::sleep(self.timeout).await;
                ProbeResult::failed(target.id, ProbeError::Timeout(self.timeout))
            }
        }
    }
}
