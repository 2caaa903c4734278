// Playback scheduler.
//
// The only authority on what is on air. Phases:
//   Uninitialized -> Priming -> Steady -> ShuttingDown (terminal)
//
// current/next/start/end live behind one RwLock. Readers (status endpoint,
// websocket replay) take the read lock; a transition holds the write lock for
// the whole commit so nobody sees a half-updated state. The rotation queue and
// the staging cache are only ever called with that lock released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, TransitionEvent};
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::rotation::RotationQueue;
use crate::staging::{StagingCache, StagingStatus};
use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Uninitialized,
    Priming,
    Steady,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: Arc<Track>,
    pub duration: u32,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    pub current: Option<NowPlaying>,
    /// May not be staged yet.
    pub next: Option<Arc<Track>>,
}

impl PlaybackState {
    pub fn event(&self) -> Option<TransitionEvent> {
        self.current
            .as_ref()
            .map(|c| TransitionEvent::new(&c.track, c.duration, c.start, c.end))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub commits: u64,
    pub stall_checks: u64,
    pub next_failures: u64,
    pub next_replaced: u64,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    stall_checks: AtomicU64,
    next_failures: AtomicU64,
    next_replaced: AtomicU64,
}

/// Consecutive staging failures seen for the current `next`.
#[derive(Default)]
struct FailureTally {
    track_id: String,
    count: u32,
}

/// What one expiry check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    NotPrimed,
    NotDue(Duration),
    Committed,
    Stalled,
}

pub struct PlaybackScheduler {
    cache: Arc<StagingCache>,
    rotation: Arc<RotationQueue>,
    broadcaster: Arc<dyn Broadcaster>,
    config: SchedulerConfig,
    state: RwLock<PlaybackState>,
    phase: Mutex<SchedulerPhase>,
    failures: Mutex<FailureTally>,
    counters: Counters,
}

fn to_std(d: time::Duration) -> Duration {
    Duration::try_from(d).unwrap_or(Duration::ZERO)
}

impl PlaybackScheduler {
    pub fn new(
        cache: Arc<StagingCache>,
        rotation: Arc<RotationQueue>,
        broadcaster: Arc<dyn Broadcaster>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cache,
            rotation,
            broadcaster,
            config,
            state: RwLock::new(PlaybackState::default()),
            phase: Mutex::new(SchedulerPhase::Uninitialized),
            failures: Mutex::new(FailureTally::default()),
            counters: Counters::default(),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, to: SchedulerPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == SchedulerPhase::ShuttingDown {
            return;
        }
        debug!("scheduler phase {:?} -> {:?}", *phase, to);
        *phase = to;
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            stall_checks: self.counters.stall_checks.load(Ordering::Relaxed),
            next_failures: self.counters.next_failures.load(Ordering::Relaxed),
            next_replaced: self.counters.next_replaced.load(Ordering::Relaxed),
        }
    }

    /// Consistent copy of the playback state (read lock).
    pub async fn snapshot(&self) -> PlaybackState {
        self.state.read().await.clone()
    }

    /// The event a newly connecting listener should get.
    pub async fn current_event(&self) -> Option<TransitionEvent> {
        self.state.read().await.event()
    }

    /// Prime, then spawn the steady-state loop.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        self.prime(&shutdown).await?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run(shutdown).await }))
    }

    /// Draw `current` and `next`, stage both, and wait (bounded) for `current`.
    pub async fn prime(&self, shutdown: &CancellationToken) -> Result<()> {
        self.set_phase(SchedulerPhase::Priming);

        let mut current = self.rotation.next_track()?;
        let mut next = self.rotation.next_track()?;
        self.request(&current);
        self.request(&next);
        info!(track_id = %current.id, "priming with \"{}\"", current.title);

        let attempts = self.config.prime_attempts.max(1);
        for attempt in 1..=attempts {
            match self.cache.get_status(&current.id) {
                Some(entry) if entry.is_ready() => {
                    if let Some(duration) = entry.duration {
                        self.commit_first(current, next, duration).await;
                        return Ok(());
                    }
                }
                Some(entry) if entry.status == StagingStatus::Failed => {
                    warn!(
                        track_id = %current.id,
                        "first track failed to stage ({}), promoting the next one",
                        entry.error.as_deref().unwrap_or("unknown error")
                    );
                    current = next;
                    next = self.rotation.next_track()?;
                    self.request(&current);
                    self.request(&next);
                }
                Some(_) => {}
                None => self.request(&current),
            }

            if attempt % 10 == 0 {
                info!(track_id = %current.id, attempt, "still waiting for the first track");
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.set_phase(SchedulerPhase::ShuttingDown);
                    return Err(EngineError::ShutDown);
                }
                _ = tokio::time::sleep(self.config.prime_interval) => {}
            }
        }

        error!(track_id = %current.id, "priming gave up after {attempts} attempts");
        Err(EngineError::StagingTimeout {
            track_id: current.id.clone(),
            attempts,
        })
    }

    async fn commit_first(&self, current: Arc<Track>, next: Arc<Track>, duration: u32) {
        let event = {
            let mut st = self.state.write().await;
            let start = OffsetDateTime::now_utc();
            st.current = Some(NowPlaying {
                track: current,
                duration,
                start,
                end: start + time::Duration::seconds(i64::from(duration)),
            });
            st.next = Some(next);
            st.event()
        };
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        self.set_phase(SchedulerPhase::Steady);
        if let Some(event) = event {
            info!(track_id = %event.id, "on air: {} - {} ({}s)", event.artist, event.title, event.duration);
            self.broadcaster.publish(event);
        }
    }

    /// Steady-state loop. Returns when `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.set_phase(SchedulerPhase::Steady);

        loop {
            let wait = match self.step().await {
                Step::NotPrimed => self.config.tick,
                // Wake at the end of the track, or at the next tick if that comes first.
                Step::NotDue(remaining) => remaining.min(self.config.tick),
                Step::Committed => Duration::ZERO,
                Step::Stalled => self.config.stall_backoff,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.set_phase(SchedulerPhase::ShuttingDown);
        info!("scheduler stopped");
    }

    async fn step(&self) -> Step {
        let (next, overdue) = {
            let st = self.state.read().await;
            let Some(current) = st.current.as_ref() else {
                return Step::NotPrimed;
            };
            (st.next.clone(), OffsetDateTime::now_utc() - current.end)
        };

        if overdue.is_negative() {
            // A next that failed while current still has airtime is retried
            // now, so its attempts are not all spent after current ends.
            if let Some(next) = &next {
                self.recover_next(next).await;
            }
            return Step::NotDue(to_std(-overdue));
        }

        let Some(next) = next else {
            // Rotation was empty at the last commit; try again.
            match self.rotation.next_track() {
                Ok(track) => {
                    self.request(&track);
                    self.state.write().await.next = Some(track);
                }
                Err(e) => warn!(
                    "holding current track {:.1}s past its end: rotation has no next track: {e}",
                    overdue.as_seconds_f64()
                ),
            }
            return Step::Stalled;
        };

        let entry = match self.cache.get_status(&next.id) {
            Some(entry) => entry,
            None => {
                self.request(&next);
                return self.stalled(&next, "not queued", overdue);
            }
        };

        match entry.status {
            StagingStatus::Ready => match entry.duration {
                Some(duration) => self.commit(next, duration).await,
                None => self.stalled(&next, "ready without duration", overdue),
            },
            StagingStatus::Failed => {
                self.next_failed(&next, entry.error.as_deref().unwrap_or("unknown error"))
                    .await;
                Step::Stalled
            }
            StagingStatus::Pending => self.stalled(&next, "pending", overdue),
            StagingStatus::InFlight => self.stalled(&next, "in flight", overdue),
        }
    }

    /// Requeue or retry `next` ahead of time. Never commits.
    async fn recover_next(&self, next: &Arc<Track>) {
        match self.cache.get_status(&next.id) {
            None => self.request(next),
            Some(entry) if entry.status == StagingStatus::Failed => {
                self.next_failed(next, entry.error.as_deref().unwrap_or("unknown error"))
                    .await;
            }
            Some(_) => {}
        }
    }

    fn stalled(&self, next: &Track, why: &str, overdue: time::Duration) -> Step {
        let n = self.counters.stall_checks.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            track_id = %next.id,
            stall_checks = n,
            "holding current track {:.1}s past its end: next is {why}",
            overdue.as_seconds_f64()
        );
        Step::Stalled
    }

    async fn next_failed(&self, next: &Arc<Track>, reason: &str) {
        self.counters.next_failures.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut tally = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if tally.track_id != next.id {
                tally.track_id = next.id.clone();
                tally.count = 0;
            }
            tally.count += 1;
            tally.count
        };

        let limit = self.config.next_failure_limit.max(1);
        warn!(
            track_id = %next.id,
            "next track failed to stage ({count}/{limit}): {reason}"
        );

        if count < limit {
            if let Err(e) = self.cache.retry(next) {
                warn!(track_id = %next.id, "cannot retry staging: {e}");
            }
            return;
        }

        let Ok(replacement) = self.rotation.next_track() else {
            return;
        };
        self.request(&replacement);
        let mut st = self.state.write().await;
        if st.next.as_ref().is_some_and(|n| n.id == next.id) {
            info!(
                track_id = %next.id,
                "giving up on \"{}\", next is now \"{}\"",
                next.title,
                replacement.title
            );
            st.next = Some(replacement);
            self.counters.next_replaced.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn commit(&self, next: Arc<Track>, duration: u32) -> Step {
        // Drawn before taking the state lock, handed back if the commit does
        // not happen.
        let follower = match self.rotation.next_track() {
            Ok(track) => Some(track),
            Err(e) => {
                warn!("no follower for the next track: {e}");
                None
            }
        };

        let outcome = {
            let mut st = self.state.write().await;
            let now = OffsetDateTime::now_utc();

            let blocked = match st.current.as_ref() {
                Some(current) if now < current.end => {
                    Some(Step::NotDue(to_std(current.end - now)))
                }
                Some(_) if !st.next.as_ref().is_some_and(|n| n.id == next.id) => {
                    Some(Step::Stalled)
                }
                Some(_) => None,
                None => Some(Step::NotPrimed),
            };

            match blocked {
                Some(step) => Err(step),
                None => {
                    let previous_end = st.current.as_ref().map_or(now, |c| c.end);
                    st.current = Some(NowPlaying {
                        track: next,
                        duration,
                        start: now,
                        end: now + time::Duration::seconds(i64::from(duration)),
                    });
                    st.next = follower.clone();
                    Ok((st.event(), previous_end))
                }
            }
        };

        let (event, previous_end) = match outcome {
            Ok(committed) => committed,
            Err(step) => {
                if let Some(follower) = &follower {
                    self.rotation.unread(follower);
                }
                return step;
            }
        };
        if let Some(follower) = &follower {
            self.request(follower);
        }

        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner) = FailureTally::default();

        if let Some(event) = event {
            info!(
                track_id = %event.id,
                late_by = (event.start_time - previous_end).as_seconds_f64(),
                "on air: {} - {} ({}s)",
                event.artist,
                event.title,
                event.duration
            );
            self.broadcaster.publish(event);
        }
        Step::Committed
    }

    /// Replace the rotation catalog. `current` and `next` are left alone.
    pub fn resync(&self, tracks: Vec<Arc<Track>>) {
        self.rotation.sync_catalog(tracks);
    }

    fn request(&self, track: &Arc<Track>) {
        if let Err(e) = self.cache.ensure_staged(track) {
            warn!(track_id = %track.id, "cannot queue staging: {e}");
        }
    }
}
