//! Configuration module for pingboard.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::probe::ProbeMode;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API and live feed (default: 3001)
    pub http_port: u16,
    /// Path to the SQLite database holding targets (default: "pingboard.db")
    pub db_path: String,
    /// Which probe strategy to run (default: real ping)
    pub probe_mode: ProbeMode,
    /// Time between two probes of the same target (default: 1s)
    pub probe_interval: Duration,
    /// Upper bound on a single probe (default: 5s)
    pub probe_timeout: Duration,
    /// Number of latency samples kept per session (default: 20)
    pub latency_window: usize,
    /// Time between two live feed pushes (default: 1s)
    pub publish_interval: Duration,
    /// Messages a viewer may have queued before new ones are dropped (default: 16)
    pub viewer_buffer: usize,
    /// Directory holding the host metric history files (default: "history")
    pub history_dir: PathBuf,
    /// Samples kept per host metric (default: 100)
    pub history_capacity: usize,
    /// Time between two host metric samples (default: 5s)
    pub history_interval: Duration,
    /// Time between two host stats pushes to viewers (default: 1s)
    pub host_stats_interval: Duration,
    /// Share of synthetic probes reported as lost, 0.0..=1.0 (default: 0.0)
    pub synthetic_loss: f64,
    /// Lowest synthetic latency in milliseconds (default: 0)
    pub synthetic_min_ms: f64,
    /// Highest synthetic latency in milliseconds (default: 100)
    pub synthetic_max_ms: f64,
    /// Start monitoring every stored target on boot (default: true)
    pub autostart: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3001,
            db_path: "pingboard.db".to_string(),
            probe_mode: ProbeMode::Ping,
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(5000),
            latency_window: 20,
            publish_interval: Duration::from_millis(1000),
            viewer_buffer: 16,
            history_dir: PathBuf::from("history"),
            history_capacity: 100,
            history_interval: Duration::from_millis(5000),
            host_stats_interval: Duration::from_millis(1000),
            synthetic_loss: 0.0,
            synthetic_min_ms: 0.0,
            synthetic_max_ms: 100.0,
            autostart: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field can be overridden with a `PINGBOARD_*` variable; values
    /// that fail to parse leave the default in place.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| parse_value(key, &v))
        }

        if let Some(port) = parsed(&lookup, "PINGBOARD_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("PINGBOARD_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(mode) = parsed(&lookup, "PINGBOARD_PROBE_MODE") {
            cfg.probe_mode = mode;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PINGBOARD_PROBE_INTERVAL_MS") {
            cfg.probe_interval = millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PINGBOARD_PROBE_TIMEOUT_MS") {
            cfg.probe_timeout = millis(ms);
        }
        if let Some(n) = parsed::<usize>(&lookup, "PINGBOARD_LATENCY_WINDOW") {
            cfg.latency_window = n.max(1);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PINGBOARD_PUBLISH_INTERVAL_MS") {
            cfg.publish_interval = millis(ms);
        }
        if let Some(n) = parsed::<usize>(&lookup, "PINGBOARD_VIEWER_BUFFER") {
            cfg.viewer_buffer = n.max(1);
        }
        if let Some(dir) = lookup("PINGBOARD_HISTORY_DIR") {
            cfg.history_dir = PathBuf::from(dir);
        }
        if let Some(n) = parsed::<usize>(&lookup, "PINGBOARD_HISTORY_CAPACITY") {
            cfg.history_capacity = n.max(1);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PINGBOARD_HISTORY_INTERVAL_MS") {
            cfg.history_interval = millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PINGBOARD_HOST_STATS_INTERVAL_MS") {
            cfg.host_stats_interval = millis(ms);
        }
        if let Some(loss) = parsed::<f64>(&lookup, "PINGBOARD_SYNTHETIC_LOSS") {
            if (0.0..=1.0).contains(&loss) {
                cfg.synthetic_loss = loss;
            }
        }
        let min_ms = parsed::<f64>(&lookup, "PINGBOARD_SYNTHETIC_MIN_MS").unwrap_or(cfg.synthetic_min_ms);
        let max_ms = parsed::<f64>(&lookup, "PINGBOARD_SYNTHETIC_MAX_MS").unwrap_or(cfg.synthetic_max_ms);
        if min_ms.is_finite() && max_ms.is_finite() && 0.0 <= min_ms && min_ms <= max_ms {
            cfg.synthetic_min_ms = min_ms;
            cfg.synthetic_max_ms = max_ms;
        } else {
            tracing::warn!(
                "Ignoring synthetic latency range {}..{} ms",
                min_ms,
                max_ms
            );
        }
        if let Some(autostart) = parsed(&lookup, "PINGBOARD_AUTOSTART") {
            cfg.autostart = autostart;
        }

        cfg
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}
