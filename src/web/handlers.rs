//! HTTP request handlers.

use super::{ApiError, AppState};
use crate::db::Target;
use crate::display::{sparkline, Point, StatusTier};
use crate::feed::{FeedMessage, Publisher, Subscription};
use crate::history::{HistorySample, MetricKind};
use crate::monitor::{LatencySnapshot, MonitorError, NewTarget};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// API: Targets
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TargetView {
    #[serde(flatten)]
    pub target: Target,
    pub running: bool,
}

pub async fn handle_get_targets(State(state): State<AppState>) -> ApiResult<Json<Vec<TargetView>>> {
    let targets = state.registry.list_targets()?;
    let running = state.scheduler.running_targets().await;

    let views = targets
        .into_iter()
        .map(|target| TargetView {
            running: running.contains(&target.id),
            target,
        })
        .collect();
    Ok(Json(views))
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<NewTarget>,
) -> ApiResult<(StatusCode, Json<Target>)> {
    let target = state.registry.add_target(req)?;
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<NewTarget>,
) -> ApiResult<Json<Target>> {
    let updated = state.registry.update_target(id, req)?;

    // A running loop keeps probing the old address until restarted.
    if state.scheduler.is_running(id).await {
        state.scheduler.stop_monitor(id).await?;
        state.scheduler.start_monitor(id).await?;
    }
    Ok(Json(updated))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state.scheduler.remove_target(id, query.force).await?;

    let dropped = state.publisher.disconnect_target(id);
    if dropped > 0 {
        tracing::info!("Disconnected {} viewers of removed target {}", dropped, id);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// API: Monitoring
// ============================================================================

pub async fn handle_start(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<LatencySnapshot>> {
    state.scheduler.start_monitor(id).await?;
    Ok(Json(state.registry.snapshot(id)?))
}

pub async fn handle_stop(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<LatencySnapshot>> {
    state.scheduler.stop_monitor(id).await?;
    Ok(Json(state.registry.snapshot(id)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handle_probe(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProbeReply>> {
    let result = state.scheduler.probe_once(id).await?;
    Ok(Json(ProbeReply {
        latency_ms: result.rtt_ms(),
        error: result.error(),
    }))
}

pub async fn handle_snapshot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<LatencySnapshot>> {
    Ok(Json(state.registry.snapshot(id)?))
}

#[derive(Debug, Serialize)]
pub struct SparklineView {
    pub points: Vec<Point>,
    pub status: StatusTier,
    pub color: &'static str,
}

pub async fn handle_sparkline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SparklineView>> {
    let snapshot = state.registry.snapshot(id)?;
    Ok(Json(SparklineView {
        points: sparkline(&snapshot.history_ms),
        status: snapshot.status,
        color: snapshot.status.color(),
    }))
}

// ============================================================================
// API: History
// ============================================================================

pub async fn handle_history(
    State(state): State<AppState>,
    Path(metric): Path<String>,
) -> ApiResult<Json<Vec<HistorySample>>> {
    let kind: MetricKind = metric.parse().map_err(ApiError::BadRequest)?;
    let log = state.history.clone();

    let samples = tokio::task::spawn_blocking(move || log.load(kind))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(samples))
}

// ============================================================================
// Live feed
// ============================================================================

pub const CLOSE_TARGET_REQUIRED: u16 = 4000;
pub const CLOSE_UNKNOWN_TARGET: u16 = 4004;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub target: Option<String>,
}

pub async fn handle_feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let publisher = state.publisher.clone();
    ws.on_upgrade(move |mut socket| async move {
        match open_feed(&publisher, query.target.as_deref()) {
            Ok(sub) => serve_viewer(socket, publisher, sub).await,
            Err(frame) => {
                let _ = socket.send(Message::Close(Some(frame))).await;
            }
        }
    })
    .into_response()
}

/// Host stats feed; needs no parameters.
pub async fn handle_stats_feed(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let publisher = state.publisher.clone();
    ws.on_upgrade(move |socket| async move {
        let sub = publisher.subscribe_host();
        serve_viewer(socket, publisher, sub).await
    })
    .into_response()
}

/// Subscribe a viewer, or describe why its socket must be closed.
pub fn open_feed(publisher: &Publisher, target: Option<&str>) -> Result<Subscription, CloseFrame> {
    let Some(id) = target.and_then(|t| t.trim().parse::<i64>().ok()) else {
        return Err(CloseFrame {
            code: CLOSE_TARGET_REQUIRED,
            reason: "target id is required".into(),
        });
    };

    publisher.subscribe(id).map_err(|e| match e {
        MonitorError::UnknownTarget(_) => CloseFrame {
            code: CLOSE_UNKNOWN_TARGET,
            reason: "unknown target".into(),
        },
        other => {
            tracing::error!("Feed: cannot subscribe to target {}: {}", id, other);
            CloseFrame {
                code: CLOSE_INTERNAL,
                reason: "internal error".into(),
            }
        }
    })
}

enum ViewerStep {
    Update(Option<FeedMessage>),
    Incoming(Option<Result<Message, axum::Error>>),
}

async fn serve_viewer(mut socket: WebSocket, publisher: Arc<Publisher>, mut sub: Subscription) {
    tracing::debug!("Feed: viewer {} connected to {:?}", sub.id, sub.topic);

    loop {
        let step = tokio::select! {
            update = sub.rx.recv() => ViewerStep::Update(update),
            incoming = socket.recv() => ViewerStep::Incoming(incoming),
        };

        match step {
            ViewerStep::Update(Some(message)) => {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Feed: failed to encode update: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            // Publisher dropped us; only a removed target does that.
            ViewerStep::Update(None) => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_UNKNOWN_TARGET,
                        reason: "target removed".into(),
                    })))
                    .await;
                break;
            }
            ViewerStep::Incoming(None)
            | ViewerStep::Incoming(Some(Err(_)))
            | ViewerStep::Incoming(Some(Ok(Message::Close(_)))) => break,
            ViewerStep::Incoming(Some(Ok(_))) => {}
        }
    }

    publisher.unsubscribe(sub.id);
    tracing::debug!("Feed: viewer {} disconnected", sub.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::feed::FeedTopic;
    use crate::history::HistoryLog;
    use crate::monitor::Registry;
    use crate::probe::SyntheticProber;
    use crate::scheduler::Scheduler;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> AppState {
        let registry = Arc::new(Registry::new(Store::in_memory().unwrap(), 20));
        let prober = Arc::new(
            SyntheticProber::new(Duration::from_secs(1)).with_latency_range(1.0, 2.0),
        );
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            prober,
            Duration::from_millis(50),
        ));
        let publisher = Arc::new(Publisher::new(registry.clone(), 8));
        let history = Arc::new(HistoryLog::new(dir.path(), 10));

        AppState {
            config: ServerConfig::default(),
            registry,
            scheduler,
            publisher,
            history,
        }
    }

    fn new_target(address: &str) -> NewTarget {
        NewTarget {
            name: "Branch".to_string(),
            address: address.to_string(),
            ..Default::default()
        }
    }

    async fn create(state: &AppState, address: &str) -> Target {
        let (status, Json(target)) =
            handle_create_target(State(state.clone()), Json(new_target(address)))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        target
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.1").await;

        let Json(views) = handle_get_targets(State(state.clone())).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].target, target);
        assert!(!views[0].running);

        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["address"], "10.0.0.1");
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_address() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let err = handle_create_target(State(state), Json(new_target("not a host!")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_running_target_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.2").await;
        let mut viewer = state.publisher.subscribe(target.id).unwrap();

        handle_start(State(state.clone()), Path(target.id)).await.unwrap();
        let err = handle_delete_target(
            State(state.clone()),
            Path(target.id),
            Query(DeleteQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let status = handle_delete_target(
            State(state.clone()),
            Path(target.id),
            Query(DeleteQuery { force: true }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.scheduler.is_running(target.id).await);
        assert_eq!(state.publisher.viewer_count(), 0);

        // Drain what was queued, then the channel reports closed.
        while viewer.rx.recv().await.is_some() {}

        let err = handle_snapshot(State(state), Path(target.id)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_stop_round() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.3").await;

        let Json(started) = handle_start(State(state.clone()), Path(target.id)).await.unwrap();
        assert!(started.running);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let Json(stopped) = handle_stop(State(state.clone()), Path(target.id)).await.unwrap();
        assert!(!stopped.running);
        assert!(stopped.sent >= 1);

        // Stopping again is harmless.
        handle_stop(State(state.clone()), Path(target.id)).await.unwrap();

        let err = handle_start(State(state), Path(target.id + 10)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_probe_and_sparkline() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.4").await;

        for _ in 0..3 {
            let Json(reply) = handle_probe(State(state.clone()), Path(target.id)).await.unwrap();
            assert!(reply.latency_ms.is_some());
            assert!(reply.error.is_none());
        }

        let Json(snapshot) = handle_snapshot(State(state.clone()), Path(target.id))
            .await
            .unwrap();
        assert_eq!(snapshot.sent, 3);
        assert!(!snapshot.running);

        let Json(view) = handle_sparkline(State(state), Path(target.id)).await.unwrap();
        assert_eq!(view.points.len(), 3);
        assert_eq!(view.status, StatusTier::Normal);
        assert_eq!(view.color, "#00C851");
    }

    #[tokio::test]
    async fn test_update_restarts_running_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.5").await;
        handle_start(State(state.clone()), Path(target.id)).await.unwrap();

        let Json(updated) = handle_update_target(
            State(state.clone()),
            Path(target.id),
            Json(new_target("10.0.0.6")),
        )
        .await
        .unwrap();
        assert_eq!(updated.address, "10.0.0.6");
        assert!(state.scheduler.is_running(target.id).await);

        let Json(snapshot) = handle_snapshot(State(state.clone()), Path(target.id))
            .await
            .unwrap();
        assert_eq!(snapshot.address, "10.0.0.6");
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        state.history.record_at(MetricKind::Cpu, 10, 55.0).unwrap();

        let Json(samples) = handle_history(State(state.clone()), Path("cpu".to_string()))
            .await
            .unwrap();
        assert_eq!(samples, vec![HistorySample { time: 10, value: 55.0 }]);

        let err = handle_history(State(state), Path("disk".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_feed_close_codes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.7").await;

        for missing in [None, Some(""), Some("abc")] {
            let frame = open_feed(&state.publisher, missing).unwrap_err();
            assert_eq!(frame.code, CLOSE_TARGET_REQUIRED);
        }

        let frame = open_feed(&state.publisher, Some("999")).unwrap_err();
        assert_eq!(frame.code, CLOSE_UNKNOWN_TARGET);

        let id = target.id.to_string();
        let mut sub = open_feed(&state.publisher, Some(id.as_str())).unwrap();
        assert_eq!(sub.topic, FeedTopic::Target(target.id));
        assert!(sub.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_forced_delete_blocks_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let target = create(&state, "10.0.0.8").await;
        handle_start(State(state.clone()), Path(target.id)).await.unwrap();

        let (deleted, restarted) = tokio::join!(
            handle_delete_target(
                State(state.clone()),
                Path(target.id),
                Query(DeleteQuery { force: true }),
            ),
            handle_start(State(state.clone()), Path(target.id)),
        );
        assert_eq!(deleted.unwrap(), StatusCode::NO_CONTENT);
        // A start either ran first (and was stopped by the delete) or found no target.
        if let Err(err) = restarted {
            assert_eq!(err.status(), StatusCode::NOT_FOUND);
        }

        assert!(state.scheduler.running_targets().await.is_empty());
        assert!(state.registry.session(target.id).is_none());
    }
}
