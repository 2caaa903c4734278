use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crowdradio_engine::api::{build_router, AppState};
use crowdradio_engine::broadcast::ListenerHub;
use crowdradio_engine::catalog::Catalog;
use crowdradio_engine::config::EngineConfig;
use crowdradio_engine::rotation::RotationQueue;
use crowdradio_engine::scheduler::PlaybackScheduler;
use crowdradio_engine::staging::acquire::YtDlpAcquirer;
use crowdradio_engine::staging::StagingCache;

// crowdradio engine
//
// One process, one channel:
//   - ingest the submitted song lists into a catalog
//   - stage audio in the background (yt-dlp into the cache dir)
//   - keep a wall-clock schedule of what is on air and push every change
//     to listeners over a websocket
//
// Nothing but the cache directory survives a restart; the rotation is
// rebuilt from the catalog every time.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let config = EngineConfig::from_env()?;

    let ingest_dir = config.ingest_dir.clone();
    let catalog = tokio::task::spawn_blocking(move || Catalog::load_dir(&ingest_dir))
        .await?
        .with_context(|| format!("failed to ingest {}", config.ingest_dir.display()))?;

    if catalog.is_empty() {
        anyhow::bail!(
            "no playable tracks found in {}; nothing to put on air",
            config.ingest_dir.display()
        );
    }

    let shutdown = CancellationToken::new();

    let cache = Arc::new(
        StagingCache::start(
            &config.staging,
            Arc::new(YtDlpAcquirer::new(config.staging.ytdlp.clone())),
            &shutdown,
        )
        .context("failed to start staging cache")?,
    );
    let rotation = Arc::new(RotationQueue::new(
        &config.rotation,
        catalog.tracks().to_vec(),
    ));
    let hub = Arc::new(ListenerHub::new(64));
    let scheduler = Arc::new(PlaybackScheduler::new(
        cache.clone(),
        rotation,
        hub.clone(),
        config.scheduler.clone(),
    ));

    let state = AppState {
        version: version.clone(),
        scheduler: scheduler.clone(),
        cache: cache.clone(),
        hub,
        catalog: Arc::new(tokio::sync::RwLock::new(catalog)),
        ingest_dir: config.ingest_dir.clone(),
    };
    let app = build_router(state, config.public_dir.clone());

    // Serve while priming so /health and the static UI answer right away.
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("crowdradio engine {version} listening on http://{}", config.bind);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let mut start_error = None;
    let playout = match scheduler.start(shutdown.clone()).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("scheduler failed to start: {e}");
            shutdown.cancel();
            start_error = Some(e);
            None
        }
    };

    shutdown.cancelled().await;

    if let Some(handle) = playout {
        if let Err(e) = handle.await {
            warn!("scheduler task ended abnormally: {e}");
        }
    }
    cache.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("http server error: {e}"),
        Err(e) => warn!("http server task failed: {e}"),
    }

    info!("crowdradio engine stopped");
    match start_error {
        // A signal during priming is an orderly stop, not a failure.
        Some(crowdradio_engine::EngineError::ShutDown) | None => Ok(()),
        Some(e) => Err(e.into()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
