// Staging cache.
//
// Makes sure a track's audio is on local disk before the scheduler may put it
// on air. Requests are deduplicated by track id under one lock and serviced by
// a fixed pool of workers pulling from a bounded queue.
//
// On disk, per track id:
//   {id}.mp3   audio as written by the acquirer
//   {id}.json  metadata sidecar (id, title, duration, source uri)
//   .partial/{id}/  acquirer output while a job runs; removed when it ends
//
// Entry lifecycle: Pending -> InFlight -> Ready | Failed.
// Failed is terminal unless `retry_failed` is set or the entry is evicted.

pub mod acquire;
pub mod sidecar;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StagingConfig;
use crate::error::{EngineError, Result};
use crate::track::{is_safe_id, Track};

use acquire::{Acquired, Acquirer};
use sidecar::TrackMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    InFlight,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingEntry {
    pub track_id: String,
    pub local_path: PathBuf,
    /// Known once `Ready`.
    pub duration: Option<u32>,
    pub status: StagingStatus,
    pub error: Option<String>,
}

impl StagingEntry {
    fn pending(dir: &Path, id: &str) -> Self {
        Self {
            track_id: id.to_string(),
            local_path: sidecar::audio_path(dir, id),
            duration: None,
            status: StagingStatus::Pending,
            error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == StagingStatus::Ready
    }
}

/// Result of an `ensure_staged` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A job was queued for this call.
    Enqueued,
    /// The id was already known; nothing was queued.
    Known(StagingStatus),
}

struct Inner {
    dir: PathBuf,
    index: Mutex<HashMap<String, StagingEntry>>,
    jobs_tx: Mutex<Option<mpsc::Sender<Arc<Track>>>>,
    jobs_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Track>>>,
    outstanding: AtomicUsize,
    drained: Notify,
    acquirer: Arc<dyn Acquirer>,
    retry_failed: bool,
    stop: CancellationToken,
}

pub struct StagingCache {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StagingCache {
    /// Create the cache directory and spawn the worker pool.
    ///
    /// Must be called inside a tokio runtime. Cancelling `shutdown` stops job
    /// intake the same way [`StagingCache::shutdown`] does.
    pub fn start(
        config: &StagingConfig,
        acquirer: Arc<dyn Acquirer>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            dir: config.cache_dir.clone(),
            index: Mutex::new(HashMap::new()),
            jobs_tx: Mutex::new(Some(tx)),
            jobs_rx: tokio::sync::Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            acquirer,
            retry_failed: config.retry_failed,
            stop: shutdown.child_token(),
        });

        let workers = (0..config.workers.max(1))
            .map(|n| tokio::spawn(worker_loop(n, inner.clone())))
            .collect();

        info!(
            "staging cache at {} with {} workers",
            config.cache_dir.display(),
            config.workers.max(1)
        );

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Idempotent, non-blocking request to stage `track`.
    ///
    /// Check-and-insert happens under the index lock, so concurrent callers
    /// for one id queue at most one job between them.
    pub fn ensure_staged(&self, track: &Arc<Track>) -> Result<EnsureOutcome> {
        if self.inner.stop.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        if !is_safe_id(&track.id) {
            return Err(EngineError::InvalidTrackId(track.id.clone()));
        }

        let mut index = lock(&self.inner.index);
        let previous = match index.get(&track.id) {
            Some(entry) if entry.status == StagingStatus::Failed && self.inner.retry_failed => {
                debug!(track_id = %track.id, "retrying failed entry");
                Some(entry.clone())
            }
            Some(entry) => return Ok(EnsureOutcome::Known(entry.status)),
            None => None,
        };
        index.insert(
            track.id.clone(),
            StagingEntry::pending(&self.inner.dir, &track.id),
        );

        match self.inner.enqueue(track.clone()) {
            Ok(()) => Ok(EnsureOutcome::Enqueued),
            Err(e) => {
                match previous {
                    Some(prev) => index.insert(track.id.clone(), prev),
                    None => index.remove(&track.id),
                };
                Err(e)
            }
        }
    }

    /// Lock-protected lookup; never touches the disk.
    pub fn get_status(&self, track_id: &str) -> Option<StagingEntry> {
        lock(&self.inner.index).get(track_id).cloned()
    }

    /// Explicit cache clear for one id: forget the entry and delete its files.
    ///
    /// Refused (returns `false`) while a job for the id is queued or running.
    pub fn evict(&self, track_id: &str) -> bool {
        let mut index = lock(&self.inner.index);
        if let Some(entry) = index.get(track_id) {
            if matches!(
                entry.status,
                StagingStatus::Pending | StagingStatus::InFlight
            ) {
                return false;
            }
        }
        index.remove(track_id);
        drop(index);

        if is_safe_id(track_id) {
            for path in [
                sidecar::audio_path(&self.inner.dir, track_id),
                sidecar::sidecar_path(&self.inner.dir, track_id),
            ] {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("evict {track_id}: cannot remove {}: {e}", path.display());
                    }
                }
            }
        }
        info!(track_id, "evicted from staging cache");
        true
    }

    /// Re-stage a track whose last attempt failed. A no-op `ensure_staged`
    /// for any other state.
    pub fn retry(&self, track: &Arc<Track>) -> Result<EnsureOutcome> {
        if self
            .get_status(&track.id)
            .is_some_and(|e| e.status == StagingStatus::Failed)
        {
            self.evict(&track.id);
        }
        self.ensure_staged(track)
    }

    /// Jobs queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Poll `get_status` until the entry settles (`Ready` or `Failed`).
    ///
    /// Returns the last observed entry, `None` if the id is unknown.
    pub async fn wait_settled(
        &self,
        track_id: &str,
        interval: Duration,
        attempts: u32,
    ) -> Option<StagingEntry> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            last = self.get_status(track_id);
            match &last {
                None => return None,
                Some(e) if matches!(e.status, StagingStatus::Ready | StagingStatus::Failed) => {
                    return last;
                }
                Some(_) => tokio::time::sleep(interval).await,
            }
        }
        last
    }

    /// Stop intake, let running jobs finish, drop queued ones.
    pub async fn shutdown(&self) {
        // A running job may be halfway through writing audio, so it is
        // awaited. Queued jobs have not touched the disk yet; dropping them
        // costs nothing but a re-download on the next start, and waiting on
        // them could hold the process for minutes per track.
        self.inner.stop.cancel();
        lock(&self.inner.jobs_tx).take();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("staging worker ended abnormally: {e}");
            }
        }

        let mut rx = self.inner.jobs_rx.lock().await;
        let mut dropped = 0usize;
        while let Ok(track) = rx.try_recv() {
            lock(&self.inner.index).remove(&track.id);
            self.inner.finish_job();
            dropped += 1;
        }
        info!("staging cache stopped ({dropped} queued jobs dropped)");
    }
}

impl Inner {
    fn enqueue(&self, track: Arc<Track>) -> Result<()> {
        let tx = lock(&self.jobs_tx);
        let Some(tx) = tx.as_ref() else {
            return Err(EngineError::ShutDown);
        };

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(track) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.finish_job();
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => EngineError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => EngineError::ShutDown,
                })
            }
        }
    }

    fn finish_job(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn set_status(&self, id: &str, update: impl FnOnce(&mut StagingEntry)) {
        if let Some(entry) = lock(&self.index).get_mut(id) {
            update(entry);
        }
    }

    async fn run_job(&self, worker: usize, track: &Track) {
        self.set_status(&track.id, |e| e.status = StagingStatus::InFlight);
        debug!(worker, track_id = %track.id, "staging started");

        match self.stage(track).await {
            Ok(meta) => {
                info!(
                    worker,
                    track_id = %track.id,
                    "staged \"{}\" ({}s)",
                    meta.title,
                    meta.duration
                );
                let path = sidecar::audio_path(&self.dir, &track.id);
                self.set_status(&track.id, |e| {
                    e.status = StagingStatus::Ready;
                    e.duration = Some(meta.duration);
                    e.local_path = path;
                    e.error = None;
                });
            }
            Err(err) => {
                warn!(worker, track_id = %track.id, "staging failed: {err}");
                sidecar::remove_temp(&self.dir, &track.id).await;
                self.set_status(&track.id, |e| {
                    e.status = StagingStatus::Failed;
                    e.error = Some(err.to_string());
                });
            }
        }
    }

    async fn stage(&self, track: &Track) -> Result<TrackMetadata> {
        let audio = sidecar::audio_path(&self.dir, &track.id);

        if tokio::fs::metadata(&audio).await.is_ok() {
            match sidecar::read(&self.dir, &track.id).await {
                Ok(Some(meta)) => {
                    debug!(track_id = %track.id, "adopting cached artifact");
                    return Ok(meta);
                }
                Ok(None) => debug!(track_id = %track.id, "audio without sidecar, re-acquiring"),
                Err(e) => warn!(track_id = %track.id, "{e}; treating as cache miss"),
            }
        }

        let scratch = sidecar::scratch_dir(&self.dir, &track.id);
        // Leftovers from a crashed run would otherwise be mistaken for output.
        remove_scratch(&scratch).await;
        tokio::fs::create_dir_all(&scratch).await?;

        let acquired = self.acquire_into(track, &scratch, &audio).await;
        remove_scratch(&scratch).await;
        let acquired = acquired?;

        let meta = TrackMetadata {
            id: track.id.clone(),
            title: if acquired.title.is_empty() {
                track.title.clone()
            } else {
                acquired.title
            },
            duration: acquired.duration,
            source_uri: track.source_uri.clone(),
        };
        sidecar::write(&self.dir, &meta).await?;
        Ok(meta)
    }

    /// Run the acquirer inside `scratch` and move its audio to `audio`.
    async fn acquire_into(&self, track: &Track, scratch: &Path, audio: &Path) -> Result<Acquired> {
        let acquired = self.acquirer.acquire(&track.source_uri, scratch).await?;

        if !is_safe_id(&acquired.id) {
            return Err(EngineError::AcquisitionFailed {
                uri: track.source_uri.clone(),
                reason: format!("acquirer returned unusable id {:?}", acquired.id),
            });
        }
        if acquired.id != track.id {
            debug!(track_id = %track.id, resolved = %acquired.id, "acquirer resolved a different id");
        }

        let produced = sidecar::audio_path(scratch, &acquired.id);
        tokio::fs::rename(&produced, audio)
            .await
            .map_err(|e| EngineError::AcquisitionFailed {
                uri: track.source_uri.clone(),
                reason: format!("no audio at {}: {e}", produced.display()),
            })?;
        Ok(acquired)
    }
}

async fn remove_scratch(scratch: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("cannot remove {}: {e}", scratch.display());
        }
    }
}

async fn worker_loop(worker: usize, inner: Arc<Inner>) {
    loop {
        let job = {
            let mut rx = inner.jobs_rx.lock().await;
            tokio::select! {
                biased;
                _ = inner.stop.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(track) = job else {
            debug!(worker, "staging worker exiting");
            return;
        };

        // Not raced against `stop`: a started job always runs to completion.
        inner.run_job(worker, &track).await;
        inner.finish_job();
    }
}
