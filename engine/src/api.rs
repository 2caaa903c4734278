use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{ListenerHub, ListenerMessage, TransitionEvent};
use crate::catalog::{Catalog, Submitter};
use crate::error::EngineError;
use crate::scheduler::{PlaybackScheduler, SchedulerPhase, SchedulerStats};
use crate::staging::{StagingCache, StagingEntry, StagingStatus};

// HTTP surface. Handlers read from the core and never hold one component's
// lock while calling into another.

/// How long `/file/{id}` waits for staging before giving up.
const FILE_WAIT_INTERVAL: Duration = Duration::from_millis(250);
const FILE_WAIT_ATTEMPTS: u32 = 120;

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub scheduler: Arc<PlaybackScheduler>,
    pub cache: Arc<StagingCache>,
    pub hub: Arc<ListenerHub>,
    pub catalog: Arc<tokio::sync::RwLock<Catalog>>,
    pub ingest_dir: PathBuf,
}

pub fn build_router(state: AppState, public_dir: PathBuf) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/staging/:id", get(staging_status))
        .route("/api/v1/submitters", get(submitters))
        .route("/api/v1/catalog/resync", post(catalog_resync))
        .route("/file/:id", get(file))
        .route("/ws", get(ws_upgrade))
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct NextUp {
    id: String,
    title: String,
    artist: String,
    staging: Option<StagingStatus>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    phase: SchedulerPhase,
    current: Option<TransitionEvent>,
    next: Option<NextUp>,
    listeners: usize,
    catalog_size: usize,
    stats: SchedulerStats,
    staging_outstanding: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snap = state.scheduler.snapshot().await;
    let current = snap.event();
    let next = snap.next.map(|t| NextUp {
        staging: state.cache.get_status(&t.id).map(|e| e.status),
        id: t.id.clone(),
        title: t.title.clone(),
        artist: t.artist.clone(),
    });
    let catalog_size = state.catalog.read().await.len();

    Json(StatusResponse {
        version: state.version.clone(),
        phase: state.scheduler.phase(),
        current,
        next,
        listeners: state.hub.listener_count(),
        catalog_size,
        stats: state.scheduler.stats(),
        staging_outstanding: state.cache.outstanding(),
    })
}

async fn staging_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StagingEntry>, StatusCode> {
    state
        .cache
        .get_status(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn submitters(State(state): State<AppState>) -> Json<Vec<Submitter>> {
    Json(state.catalog.read().await.submitters().to_vec())
}

async fn catalog_resync(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let dir = state.ingest_dir.clone();
    let loaded = tokio::task::spawn_blocking(move || Catalog::load_dir(&dir))
        .await
        .map_err(|e| {
            warn!("catalog reload join failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            warn!("catalog reload failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if loaded.is_empty() {
        // Keep playing the old catalog rather than starving the rotation.
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let tracks = loaded.tracks().to_vec();
    let count = tracks.len();
    *state.catalog.write().await = loaded;
    state.scheduler.resync(tracks);
    info!("catalog resynced: {count} tracks");

    Ok(Json(json!({ "ok": true, "tracks": count })))
}

/// Serve a track's audio, waiting for staging when needed.
async fn file(State(state): State<AppState>, Path(id): Path<String>, req: Request) -> Response {
    let Some(track) = state.catalog.read().await.lookup(&id) else {
        return (StatusCode::NOT_FOUND, "Song not found").into_response();
    };

    match state.cache.ensure_staged(&track) {
        Ok(_) => {}
        Err(EngineError::QueueFull | EngineError::ShutDown) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Staging unavailable").into_response();
        }
        Err(e) => {
            warn!(track_id = %id, "cannot stage for file request: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue download").into_response();
        }
    }

    let entry = state
        .cache
        .wait_settled(&id, FILE_WAIT_INTERVAL, FILE_WAIT_ATTEMPTS)
        .await;

    match entry {
        Some(entry) if entry.is_ready() => {
            debug!(track_id = %id, "serving {}", entry.local_path.display());
            match ServeFile::new(&entry.local_path).oneshot(req).await {
                Ok(res) => res.map(axum::body::Body::new).into_response(),
                Err(e) => match e {},
            }
        }
        Some(entry) if entry.status == StagingStatus::Failed => {
            (StatusCode::BAD_GATEWAY, "Download failed").into_response()
        }
        Some(_) => (StatusCode::GATEWAY_TIMEOUT, "Still downloading").into_response(),
        None => (StatusCode::NOT_FOUND, "Song not found").into_response(),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| listener_session(socket, state.hub))
}

async fn listener_session(mut socket: WebSocket, hub: Arc<ListenerHub>) {
    let session = Uuid::new_v4();
    let (replay, mut rx) = hub.join();
    info!(%session, "listener connected ({} total)", hub.listener_count());

    if let Some(event) = replay {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            recv = rx.recv() => match recv {
                Ok(event) => {
                    if send_event(&mut socket, event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(%session, "listener lagged, {n} events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(%session, "listener disconnected");
}

async fn send_event(socket: &mut WebSocket, event: TransitionEvent) -> Result<(), ()> {
    let text = serde_json::to_string(&ListenerMessage::CurrentSong(event)).map_err(|_| ())?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RotationConfig, SchedulerConfig, StagingConfig};
    use crate::rotation::RotationQueue;
    use crate::staging::acquire::{Acquired, Acquirer};
    use crate::track::Track;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tokio_util::sync::CancellationToken;

    struct NeverAcquirer;

    #[async_trait]
    impl Acquirer for NeverAcquirer {
        async fn acquire(&self, source_uri: &str, _: &std::path::Path) -> crate::Result<Acquired> {
            Err(EngineError::AcquisitionFailed {
                uri: source_uri.into(),
                reason: "offline".into(),
            })
        }
    }

    fn app(dir: &std::path::Path) -> Router {
        let track = Track::new("Song", "Artist", "", "https://youtu.be/known").unwrap();
        let catalog = Catalog::from_tracks([track]);
        let cache = Arc::new(
            StagingCache::start(
                &StagingConfig {
                    cache_dir: dir.join("cache"),
                    ..StagingConfig::default()
                },
                Arc::new(NeverAcquirer),
                &CancellationToken::new(),
            )
            .unwrap(),
        );
        let rotation = Arc::new(RotationQueue::new(
            &RotationConfig::default(),
            catalog.tracks().to_vec(),
        ));
        let hub = Arc::new(ListenerHub::new(4));
        let scheduler = Arc::new(PlaybackScheduler::new(
            cache.clone(),
            rotation,
            hub.clone(),
            SchedulerConfig::default(),
        ));
        let state = AppState {
            version: "test".into(),
            scheduler,
            cache,
            hub,
            catalog: Arc::new(tokio::sync::RwLock::new(catalog)),
            ingest_dir: dir.join("ingest"),
        };
        build_router(state, dir.join("public"))
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_answers_before_priming() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        assert_eq!(get(app, "/health").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_unprimed_scheduler() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let res = get(app, "/api/v1/status").await;
        assert_eq!(res.status(), StatusCode::OK);

        let v = body_json(res).await;
        assert_eq!(v["phase"], "uninitialized");
        assert!(v["current"].is_null());
        assert_eq!(v["catalog_size"], 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        assert_eq!(
            get(app.clone(), "/file/nope").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(app, "/api/v1/staging/nope").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn failed_download_is_bad_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        assert_eq!(
            get(app.clone(), "/file/known").await.status(),
            StatusCode::BAD_GATEWAY
        );

        let v = body_json(get(app, "/api/v1/staging/known").await).await;
        assert_eq!(v["status"], "failed");
    }

    #[tokio::test]
    async fn resync_with_empty_ingest_keeps_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("ingest")).unwrap();
        let app = app(tmp.path());

        let res = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/v1/catalog/resync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let v = body_json(get(app, "/api/v1/status").await).await;
        assert_eq!(v["catalog_size"], 1);
    }

    #[tokio::test]
    async fn in_memory_catalog_has_no_submitters() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let res = get(app, "/api/v1/submitters").await;
        assert_eq!(body_json(res).await, serde_json::json!([]));
    }
}
