//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    /// IPv4/IPv6 literal or DNS hostname.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Free-form link speed label, e.g. "100 Mbps".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            provider: None,
            speed: None,
            created_at: Utc::now(),
        }
    }
}
