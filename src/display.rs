//! Helpers that let a dumb renderer draw a target without doing any math.

use serde::Serialize;

/// Health tier derived from loss and average latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTier {
    Normal,
    Warning,
    Critical,
}

impl StatusTier {
    /// Normal below 70 ms and 5 % loss, critical above 100 ms or 10 % loss.
    pub fn classify(loss_percent: f64, avg_latency_ms: Option<f64>) -> Self {
        let avg = avg_latency_ms.unwrap_or(0.0);
        if loss_percent > 10.0 || avg > 100.0 {
            StatusTier::Critical
        } else if loss_percent >= 5.0 || avg >= 70.0 {
            StatusTier::Warning
        } else {
            StatusTier::Normal
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            StatusTier::Normal => "#00C851",
            StatusTier::Warning => "#ffbb33",
            StatusTier::Critical => "#ff4444",
        }
    }
}

/// A point in the 0–100 chart coordinate space, y growing downwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Normalize a series into chart coordinates with 10 % headroom above the peak.
///
/// Needs at least two values to draw a line.
pub fn sparkline(values: &[f64]) -> Vec<Point> {
    if values.len() < 2 {
        return Vec::new();
    }

    let peak = values.iter().cloned().fold(0.0_f64, f64::max) * 1.1;
    let step = 100.0 / (values.len() - 1) as f64;

    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let y = if peak > 0.0 { 100.0 - v / peak * 100.0 } else { 100.0 };
            Point {
                x: i as f64 * step,
                y: y.clamp(0.0, 100.0),
            }
        })
        .collect()
}
