//! Scheduler module for running periodic probes.

use crate::db::Target;
use crate::monitor::{MonitorError, Registry, SessionHandle};
use crate::probe::{ProbeResult, Prober};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Held across one probe and the application of its result.
///
/// Waiters are served in arrival order, so results land in the order the
/// probes were issued.
type ProbeGate = Arc<Mutex<()>>;

/// A running probe loop and the means to end it.
struct ProbeRun {
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives one probe loop per monitored target.
pub struct Scheduler {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    runs: Mutex<HashMap<i64, ProbeRun>>,
    gates: parking_lot::Mutex<HashMap<i64, ProbeGate>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, prober: Arc<dyn Prober>, interval: Duration) -> Self {
        Self {
            registry,
            prober,
            interval,
            runs: Mutex::new(HashMap::new()),
            gates: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, id: i64) -> ProbeGate {
        self.gates.lock().entry(id).or_default().clone()
    }

    /// Start monitoring every stored target. Returns how many were started.
    pub async fn start_all(&self) -> Result<usize, MonitorError> {
        let targets = self.registry.list_targets()?;
        tracing::info!("Starting scheduler with {} targets", targets.len());

        for target in &targets {
            self.start_monitor(target.id).await?;
        }
        Ok(targets.len())
    }

    /// Begin probing a target. Starting a running target is a no-op.
    pub async fn start_monitor(&self, id: i64) -> Result<(), MonitorError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&id) {
            return Ok(());
        }
        // Looked up under the lock so a concurrent removal cannot slip in.
        let target = self.registry.target(id)?;

        let session = self.registry.ensure_session(&target);
        let epoch = session.lock().begin_run();
        let (stop_tx, stop_rx) = broadcast::channel(1);

        tracing::info!("Scheduler: monitoring {} ({})", target.name, target.address);

        let task = tokio::spawn(run_probe_loop(
            target,
            session,
            self.gate(id),
            epoch,
            self.prober.clone(),
            self.interval,
            stop_rx,
        ));
        runs.insert(id, ProbeRun { stop_tx, task });
        Ok(())
    }

    /// Stop probing a target and wait for its loop to finish.
    ///
    /// Returns false if the target was not being monitored. Once this returns,
    /// no further result is applied to the session.
    pub async fn stop_monitor(&self, id: i64) -> Result<bool, MonitorError> {
        let run = {
            let mut runs = self.runs.lock().await;
            let run = runs.remove(&id);
            if run.is_some() {
                if let Some(session) = self.registry.session(id) {
                    session.lock().halt();
                }
            }
            run
        };

        let Some(run) = run else {
            // Distinguish a stopped target from one that does not exist.
            self.registry.target(id)?;
            return Ok(false);
        };

        finish(run).await;
        tracing::info!("Scheduler: stopped monitoring target {}", id);
        Ok(true)
    }

    /// Delete a target together with its session.
    ///
    /// A monitored target is refused with `TargetInUse` unless `force` is set,
    /// in which case its loop is stopped first. No start can interleave with
    /// the removal.
    pub async fn remove_target(&self, id: i64, force: bool) -> Result<(), MonitorError> {
        let (run, removed) = {
            let mut runs = self.runs.lock().await;
            let run = if runs.contains_key(&id) {
                if !force {
                    return Err(MonitorError::TargetInUse(id));
                }
                if let Some(session) = self.registry.session(id) {
                    session.lock().halt();
                }
                runs.remove(&id)
            } else {
                None
            };

            let removed = self.registry.remove_target(id);
            if removed.is_ok() {
                self.gates.lock().remove(&id);
            }
            (run, removed)
        };

        if let Some(run) = run {
            finish(run).await;
            tracing::info!("Scheduler: stopped monitoring target {}", id);
        }
        removed
    }

    /// Probe a target once outside the periodic schedule and apply the result.
    ///
    /// The running state of the target is left as it is. The probe waits for
    /// any probe already in flight for the target.
    pub async fn probe_once(&self, id: i64) -> Result<ProbeResult, MonitorError> {
        let (target, session, gate) = {
            let _runs = self.runs.lock().await;
            let target = self.registry.target(id)?;
            let session = self.registry.ensure_session(&target);
            (target, session, self.gate(id))
        };

        let _turn = gate.lock().await;
        let result = self.prober.probe(&target).await;
        session.lock().apply(result.clone());
        Ok(result)
    }

    pub async fn is_running(&self, id: i64) -> bool {
        self.runs.lock().await.contains_key(&id)
    }

    pub async fn running_targets(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.runs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every probe loop.
    pub async fn shutdown(&self) {
        let runs: Vec<(i64, ProbeRun)> = {
            let mut runs = self.runs.lock().await;
            let drained: Vec<_> = runs.drain().collect();
            for (id, _) in &drained {
                if let Some(session) = self.registry.session(*id) {
                    session.lock().halt();
                }
            }
            drained
        };

        tracing::info!("Scheduler: shutting down {} probe loops", runs.len());
        for (_, run) in runs {
            finish(run).await;
        }
    }
}

async fn finish(run: ProbeRun) {
    let _ = run.stop_tx.send(());
    if let Err(e) = run.task.await {
        tracing::warn!("Probe loop ended abnormally: {}", e);
    }
}

/// Probe one target on a fixed interval until told to stop.
///
/// Each probe holds the target's gate, so a target never has more than one
/// probe in flight; ticks that pass while a probe is pending are skipped.
async fn run_probe_loop(
    target: Target,
    session: SessionHandle,
    gate: ProbeGate,
    epoch: u64,
    prober: Arc<dyn Prober>,
    interval_duration: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
        }

        let applied = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            applied = async {
                let _turn = gate.lock().await;
                let result = prober.probe(&target).await;
                session.lock().apply_if_current(epoch, result)
            } => applied,
        };

        if !applied {
            tracing::debug!("Discarding late result for {}", target.name);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::monitor::{LatencySnapshot, NewTarget};
    use crate::probe::ProbeError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script of outcomes, then hangs forever.
    struct ScriptedProber {
        script: parking_lot::Mutex<VecDeque<Option<f64>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(script: Vec<Option<f64>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(script.into()),
                delay,
                calls: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct InFlight(Arc<AtomicUsize>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &Target) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(self.in_flight.clone());

            let step = self.script.lock().pop_front();
            match step {
                Some(outcome) => {
                    tokio::time::sleep(self.delay).await;
                    match outcome {
                        Some(rtt) => ProbeResult::reply(target.id, rtt),
                        None => ProbeResult::failed(target.id, ProbeError::Timeout(self.delay)),
                    }
                }
                None => std::future::pending().await,
            }
        }
    }

    fn setup(prober: Arc<ScriptedProber>) -> (Arc<Registry>, Scheduler, i64) {
        let registry = Arc::new(Registry::new(Store::in_memory().unwrap(), 20));
        let target = registry
            .add_target(NewTarget {
                address: "10.0.0.1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let scheduler = Scheduler::new(registry.clone(), prober, Duration::from_secs(1));
        (registry, scheduler, target.id)
    }

    async fn wait_for<F>(registry: &Registry, id: i64, done: F) -> LatencySnapshot
    where
        F: Fn(&LatencySnapshot) -> bool,
    {
        for _ in 0..10_000 {
            let snap = registry.snapshot(id).unwrap();
            if done(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached the expected state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probes_aggregate_in_order() {
        let prober = ScriptedProber::new(
            vec![Some(20.0), Some(30.0), None, Some(40.0)],
            Duration::from_millis(10),
        );
        let (registry, scheduler, id) = setup(prober.clone());

        scheduler.start_monitor(id).await.unwrap();

        let before = wait_for(&registry, id, |s| s.sent == 3).await;
        assert_eq!(before.received, 2);
        assert_eq!(before.max_latency_ms, Some(30.0));
        assert_eq!(before.last_latency_ms, None);
        assert!(before.error.is_some());

        let after = wait_for(&registry, id, |s| s.sent == 4).await;
        assert_eq!(after.received, 3);
        assert_eq!(after.last_latency_ms, Some(40.0));
        assert_eq!(after.min_latency_ms, Some(20.0));
        assert_eq!(after.max_latency_ms, Some(40.0));
        assert_eq!(after.loss_percent, 25.0);
        assert!(after.running);

        assert!(scheduler.stop_monitor(id).await.unwrap());
        let frozen = registry.snapshot(id).unwrap();
        assert!(!frozen.running);
        assert_eq!(frozen.sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_probe() {
        let prober = ScriptedProber::new(vec![Some(25.0)], Duration::from_secs(5));
        let (registry, scheduler, id) = setup(prober.clone());

        scheduler.start_monitor(id).await.unwrap();
        while prober.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(scheduler.stop_monitor(id).await.unwrap());
        let at_stop = registry.snapshot(id).unwrap();

        // Well past the moment the pending probe would have completed.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let later = registry.snapshot(id).unwrap();

        assert_eq!(at_stop, later);
        assert_eq!(later.sent, 0);
        assert_eq!(prober.calls(), 1);
        assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_never_overlaps() {
        let script = vec![Some(5.0); 20];
        // Each probe outlasts the interval, so ticks must be skipped.
        let prober = ScriptedProber::new(script, Duration::from_millis(2500));
        let (registry, scheduler, id) = setup(prober.clone());

        scheduler.start_monitor(id).await.unwrap();
        scheduler.start_monitor(id).await.unwrap();
        assert_eq!(scheduler.running_targets().await, vec![id]);

        wait_for(&registry, id, |s| s.sent >= 4).await;
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running(id).await);
        assert!(!registry.is_running(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let prober = ScriptedProber::new(vec![], Duration::from_millis(1));
        let (_registry, scheduler, id) = setup(prober);

        assert!(!scheduler.stop_monitor(id).await.unwrap());
        scheduler.start_monitor(id).await.unwrap();
        assert!(scheduler.stop_monitor(id).await.unwrap());
        assert!(!scheduler.stop_monitor(id).await.unwrap());
        assert!(matches!(
            scheduler.stop_monitor(id + 100).await,
            Err(MonitorError::UnknownTarget(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_session() {
        let prober = ScriptedProber::new(vec![Some(10.0), Some(12.0)], Duration::from_millis(1));
        let (registry, scheduler, id) = setup(prober.clone());

        scheduler.start_monitor(id).await.unwrap();
        wait_for(&registry, id, |s| s.sent == 1).await;
        scheduler.stop_monitor(id).await.unwrap();

        scheduler.start_monitor(id).await.unwrap();
        let snap = wait_for(&registry, id, |s| s.sent == 2).await;
        assert_eq!(snap.history_ms, vec![10.0, 12.0]);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_once_leaves_state_alone() {
        let prober = ScriptedProber::new(vec![Some(33.0), None], Duration::from_millis(1));
        let (registry, scheduler, id) = setup(prober.clone());

        let result = scheduler.probe_once(id).await.unwrap();
        assert_eq!(result.rtt_ms(), Some(33.0));
        assert!(!scheduler.is_running(id).await);

        let failed = scheduler.probe_once(id).await.unwrap();
        assert!(failed.error().is_some());

        let snap = registry.snapshot(id).unwrap();
        assert_eq!(snap.sent, 2);
        assert_eq!(snap.received, 1);
        assert!(!snap.running);
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_probe_once_is_serialized() {
        let prober = ScriptedProber::new(vec![Some(7.0); 40], Duration::from_secs(2));
        let (registry, scheduler, id) = setup(prober.clone());
        let scheduler = Arc::new(scheduler);
        scheduler.start_monitor(id).await.unwrap();

        let calls: Vec<_> = (0..10)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.probe_once(id).await })
            })
            .collect();
        for call in calls {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result.rtt_ms(), Some(7.0));
        }

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(registry.snapshot(id).unwrap().sent >= 10);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_target_goes_through_scheduler() {
        let prober = ScriptedProber::new(vec![], Duration::from_millis(1));
        let (registry, scheduler, id) = setup(prober);
        scheduler.start_monitor(id).await.unwrap();

        assert!(matches!(
            scheduler.remove_target(id, false).await,
            Err(MonitorError::TargetInUse(_))
        ));
        assert!(scheduler.is_running(id).await);

        tokio_test::assert_ok!(scheduler.remove_target(id, true).await);
        assert!(scheduler.running_targets().await.is_empty());
        assert!(registry.session(id).is_none());
        assert!(matches!(
            scheduler.start_monitor(id).await,
            Err(MonitorError::UnknownTarget(_))
        ));
        assert!(registry.session(id).is_none());
        assert!(matches!(
            scheduler.remove_target(id, false).await,
            Err(MonitorError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_target_is_rejected() {
        let prober = ScriptedProber::new(vec![], Duration::from_millis(1));
        let (_registry, scheduler, _id) = setup(prober);

        assert!(matches!(
            scheduler.start_monitor(999).await,
            Err(MonitorError::UnknownTarget(999))
        ));
        assert!(matches!(
            scheduler.probe_once(999).await,
            Err(MonitorError::UnknownTarget(999))
        ));
        assert!(scheduler.running_targets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_covers_stored_targets() {
        let prober = ScriptedProber::new(vec![], Duration::from_millis(1));
        let (registry, scheduler, _id) = setup(prober);
        registry
            .add_target(NewTarget {
                address: "10.0.0.2".to_string(),
                ..Default::default()
            })
            .unwrap();

        let started = tokio_test::assert_ok!(scheduler.start_all().await);
        assert_eq!(started, 2);
        assert_eq!(scheduler.running_targets().await.len(), 2);
        scheduler.shutdown().await;
    }
}
