//! Probe module for reachability checks.
//!
//! A probe never fails its caller: every error is folded into a failed
//! [`ProbeResult`]. Two strategies implement [`Prober`]: real ICMP ping and a
//! synthetic generator for demos and development.

mod ping;
mod synthetic;

pub use ping::*;
pub use synthetic::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::db::Target;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("reply received but latency could not be parsed: {0}")]
    Unparseable(String),
}

/// What happened to a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Reply { rtt_ms: f64 },
    Failed { error: String },
}

/// One outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub target_id: i64,
    pub timestamp: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn reply(target_id: i64, rtt_ms: f64) -> Self {
        Self {
            target_id,
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Reply { rtt_ms },
        }
    }

    pub fn failed(target_id: i64, error: impl fmt::Display) -> Self {
        Self {
            target_id,
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Failed {
                error: error.to_string(),
            },
        }
    }

    /// Round-trip time of a well-formed reply.
    ///
    /// Negative or non-finite latencies count as no reply at all.
    pub fn rtt_ms(&self) -> Option<f64> {
        match self.outcome {
            ProbeOutcome::Reply { rtt_ms } if rtt_ms.is_finite() && rtt_ms >= 0.0 => Some(rtt_ms),
            _ => None,
        }
    }

    /// Human-readable failure cause, if the probe did not produce a usable reply.
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            ProbeOutcome::Failed { error } => Some(error.clone()),
            ProbeOutcome::Reply { rtt_ms } if self.rtt_ms().is_none() => {
                Some(format!("malformed round-trip time: {}", rtt_ms))
            }
            ProbeOutcome::Reply { .. } => None,
        }
    }
}

/// A strategy for checking whether a target answers.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe the target once. Must return within the prober's timeout.
    async fn probe(&self, target: &Target) -> ProbeResult;
}

/// Which prober the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Ping,
    Synthetic,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ping" | "icmp" => Ok(Self::Ping),
            "synthetic" | "mock" => Ok(Self::Synthetic),
            other => Err(format!("unknown probe mode: {}", other)),
        }
    }
}

/// Build the prober selected by the configuration.
pub fn build_prober(cfg: &ServerConfig) -> Arc<dyn Prober> {
    match cfg.probe_mode {
        ProbeMode::Ping => Arc::new(PingProber::new(cfg.probe_timeout)),
        ProbeMode::Synthetic => Arc::new(
            SyntheticProber::new(cfg.probe_timeout)
                .with_loss_ratio(cfg.synthetic_loss)
                .with_latency_range(cfg.synthetic_min_ms, cfg.synthetic_max_ms),
        ),
    }
}
