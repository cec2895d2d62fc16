//! Target registry and live monitoring sessions.
//!
//! The [`Registry`] is created once in `main` and shared by the scheduler,
//! the feed publisher and the web handlers. It owns the target catalogue
//! (backed by the SQLite [`Store`]) and every [`MonitoringSession`].

mod session;

pub use session::*;

use chrono::{SubsecRound, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{DbError, Store, Target};
use crate::probe::validate_address;

/// Shared, lockable handle to one session.
pub type SessionHandle = Arc<Mutex<MonitoringSession>>;

/// Errors surfaced to callers of the control surface.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("unknown target {0}")]
    UnknownTarget(i64),
    #[error("target {0} is being monitored")]
    TargetInUse(i64),
    #[error("storage error: {0}")]
    Store(#[from] DbError),
}

/// Fields accepted when creating or editing a target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTarget {
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub speed: Option<String>,
}

impl NewTarget {
    /// Trim and check the fields; an empty name falls back to the address.
    fn normalize(self) -> Result<NewTarget, MonitorError> {
        let address = self.address.trim().to_string();
        if address.is_empty() {
            return Err(MonitorError::InvalidTarget("address is required".to_string()));
        }
        validate_address(&address).map_err(|e| MonitorError::InvalidTarget(e.to_string()))?;

        let name = match self.name.trim() {
            "" => address.clone(),
            name => name.to_string(),
        };
        Ok(NewTarget {
            name,
            address,
            provider: non_empty(self.provider),
            speed: non_empty(self.speed),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Process-wide owner of targets and sessions.
pub struct Registry {
    store: Store,
    sessions: RwLock<HashMap<i64, SessionHandle>>,
    latency_window: usize,
}

impl Registry {
    pub fn new(store: Store, latency_window: usize) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            latency_window: latency_window.max(1),
        }
    }

    // --- Targets ---

    pub fn list_targets(&self) -> Result<Vec<Target>, MonitorError> {
        Ok(self.store.get_targets()?)
    }

    pub fn target(&self, id: i64) -> Result<Target, MonitorError> {
        self.store.get_target(id).map_err(|e| match e {
            DbError::NotFound => MonitorError::UnknownTarget(id),
            other => MonitorError::Store(other),
        })
    }

    pub fn add_target(&self, new: NewTarget) -> Result<Target, MonitorError> {
        let new = new.normalize()?;
        let mut target = Target {
            name: new.name,
            address: new.address,
            provider: new.provider,
            speed: new.speed,
            // The store keeps whole seconds.
            created_at: Utc::now().trunc_subsecs(0),
            ..Default::default()
        };
        self.store.add_target(&mut target)?;
        tracing::info!("Registry: added target {} ({})", target.name, target.address);
        Ok(target)
    }

    /// Rewrite a target. A live session keeps its counters and probes the new address.
    pub fn update_target(&self, id: i64, new: NewTarget) -> Result<Target, MonitorError> {
        let new = new.normalize()?;
        let existing = self.target(id)?;
        let updated = Target {
            name: new.name,
            address: new.address,
            provider: new.provider,
            speed: new.speed,
            ..existing
        };
        self.store.update_target(&updated)?;

        if let Some(session) = self.session(id) {
            session.lock().set_address(&updated.address);
        }
        Ok(updated)
    }

    /// Delete a target that is not being monitored, dropping its frozen session.
    pub fn remove_target(&self, id: i64) -> Result<(), MonitorError> {
        if self.is_running(id) {
            return Err(MonitorError::TargetInUse(id));
        }
        if !self.store.delete_target(id)? {
            return Err(MonitorError::UnknownTarget(id));
        }
        self.sessions.write().remove(&id);
        tracing::info!("Registry: removed target {}", id);
        Ok(())
    }

    // --- Sessions ---

    pub fn session(&self, id: i64) -> Option<SessionHandle> {
        self.sessions.read().get(&id).cloned()
    }

    /// Return the target's session, creating a stopped one if needed.
    pub fn ensure_session(&self, target: &Target) -> SessionHandle {
        self.sessions
            .write()
            .entry(target.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(MonitoringSession::new(target, self.latency_window)))
            })
            .clone()
    }

    pub fn is_running(&self, id: i64) -> bool {
        self.session(id).is_some_and(|s| s.lock().is_running())
    }

    /// Current snapshot of a target, empty if it was never probed.
    pub fn snapshot(&self, id: i64) -> Result<LatencySnapshot, MonitorError> {
        if let Some(session) = self.session(id) {
            return Ok(session.lock().snapshot());
        }
        let target = self.target(id)?;
        Ok(LatencySnapshot::empty(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeResult;

    fn registry() -> Registry {
        Registry::new(Store::in_memory().unwrap(), 20)
    }

    fn new_target(address: &str) -> NewTarget {
        NewTarget {
            name: String::new(),
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_target_normalizes_fields() {
        let registry = registry();
        let target = registry
            .add_target(NewTarget {
                name: "  ".to_string(),
                address: " 10.0.0.1 ".to_string(),
                provider: Some(" ".to_string()),
                speed: Some("20 Mbps".to_string()),
            })
            .unwrap();
        assert_eq!(target.name, "10.0.0.1");
        assert_eq!(target.address, "10.0.0.1");
        assert_eq!(target.provider, None);
        assert_eq!(target.speed.as_deref(), Some("20 Mbps"));
        assert_eq!(registry.list_targets().unwrap(), vec![target]);
    }

    #[test]
    fn test_add_target_rejects_bad_addresses() {
        let registry = registry();
        for bad in ["", "   ", "10.0.0.1; rm -rf /", "-f flood"] {
            assert!(matches!(
                registry.add_target(new_target(bad)),
                Err(MonitorError::InvalidTarget(_))
            ));
        }
        assert!(registry.list_targets().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_target() {
        let registry = registry();
        assert!(matches!(registry.target(77), Err(MonitorError::UnknownTarget(77))));
        assert!(matches!(registry.snapshot(77), Err(MonitorError::UnknownTarget(77))));
        assert!(matches!(
            registry.remove_target(77),
            Err(MonitorError::UnknownTarget(77))
        ));
    }

    #[test]
    fn test_ensure_session_is_shared() {
        let registry = registry();
        let target = registry.add_target(new_target("10.0.0.2")).unwrap();
        let a = registry.ensure_session(&target);
        let b = registry.ensure_session(&target);
        assert!(Arc::ptr_eq(&a, &b));

        a.lock().apply(ProbeResult::reply(target.id, 9.0));
        assert_eq!(registry.snapshot(target.id).unwrap().received, 1);
    }

    #[test]
    fn test_snapshot_without_session_is_empty() {
        let registry = registry();
        let target = registry.add_target(new_target("10.0.0.3")).unwrap();
        let snap = registry.snapshot(target.id).unwrap();
        assert_eq!(snap.target, target.id);
        assert_eq!(snap.sent, 0);
    }

    #[test]
    fn test_delete_refuses_running_target() {
        let registry = registry();
        let target = registry.add_target(new_target("10.0.0.4")).unwrap();
        let session = registry.ensure_session(&target);
        session.lock().begin_run();

        assert!(matches!(
            registry.remove_target(target.id),
            Err(MonitorError::TargetInUse(_))
        ));

        session.lock().halt();
        registry.remove_target(target.id).unwrap();
        assert!(registry.session(target.id).is_none());
        assert!(matches!(
            registry.target(target.id),
            Err(MonitorError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_update_target_moves_session_address() {
        let registry = registry();
        let target = registry.add_target(new_target("10.0.0.5")).unwrap();
        registry.ensure_session(&target);
        let stored = registry.target(target.id).unwrap();

        let updated = registry
            .update_target(
                target.id,
                NewTarget {
                    name: "Backup link".to_string(),
                    address: "10.0.1.5".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Backup link");
        assert_eq!(updated.created_at, stored.created_at);
        assert_eq!(registry.snapshot(target.id).unwrap().address, "10.0.1.5");
    }
}
