use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

// Engine configuration.
//
// Everything is read once from `CROWDRADIO_*` environment variables at startup.
// Each component gets its own slice so tests can build one without the others.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub ingest_dir: PathBuf,
    pub public_dir: PathBuf,
    pub staging: StagingConfig,
    pub rotation: RotationConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub cache_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Binary used by the yt-dlp acquirer.
    pub ytdlp: String,
    /// When set, `ensure_staged` on a `Failed` entry re-enqueues it.
    pub retry_failed: bool,
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Share of each shuffled order that becomes the playable active queue.
    pub active_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub prime_attempts: u32,
    pub prime_interval: Duration,
    pub tick: Duration,
    pub stall_backoff: Duration,
    pub next_failure_limit: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            workers: 4,
            queue_capacity: 100,
            ytdlp: "yt-dlp".to_string(),
            retry_failed: false,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self { active_fraction: 2.0 / 3.0 }
    }
}

impl RotationConfig {
    /// Clamp into (0, 1]; anything unusable falls back to the default.
    pub fn normalized_fraction(&self) -> f64 {
        let f = self.active_fraction;
        if !f.is_finite() || f <= 0.0 {
            return RotationConfig::default().active_fraction;
        }
        f.min(1.0)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prime_attempts: 60,
            prime_interval: Duration::from_secs(1),
            tick: Duration::from_millis(100),
            stall_backoff: Duration::from_secs(1),
            next_failure_limit: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let staging_defaults = StagingConfig::default();
        let rotation_defaults = RotationConfig::default();
        let sched_defaults = SchedulerConfig::default();

        let staging = StagingConfig {
            cache_dir: env_or("CROWDRADIO_CACHE_DIR", staging_defaults.cache_dir)?,
            workers: env_or("CROWDRADIO_WORKERS", staging_defaults.workers)?.max(1),
            queue_capacity: env_or("CROWDRADIO_QUEUE_CAPACITY", staging_defaults.queue_capacity)?
                .max(1),
            ytdlp: env_or("CROWDRADIO_YTDLP", staging_defaults.ytdlp)?,
            retry_failed: env_or("CROWDRADIO_RETRY_FAILED", staging_defaults.retry_failed)?,
        };

        let rotation = RotationConfig {
            active_fraction: env_or("CROWDRADIO_ACTIVE_FRACTION", rotation_defaults.active_fraction)?,
        };

        let scheduler = SchedulerConfig {
            prime_attempts: env_or("CROWDRADIO_PRIME_ATTEMPTS", sched_defaults.prime_attempts)?,
            prime_interval: env_millis("CROWDRADIO_PRIME_INTERVAL_MS", sched_defaults.prime_interval)?,
            tick: env_millis("CROWDRADIO_TICK_MS", sched_defaults.tick)?,
            stall_backoff: env_millis("CROWDRADIO_STALL_BACKOFF_MS", sched_defaults.stall_backoff)?,
            next_failure_limit: env_or(
                "CROWDRADIO_NEXT_FAILURE_LIMIT",
                sched_defaults.next_failure_limit,
            )?
            .max(1),
        };

        Ok(Self {
            bind: env_or("CROWDRADIO_BIND", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            ingest_dir: env_or("CROWDRADIO_INGEST_DIR", PathBuf::from("./ingest"))?,
            public_dir: env_or("CROWDRADIO_PUBLIC_DIR", PathBuf::from("./public"))?,
            staging,
            rotation,
            scheduler,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

/// Loop intervals. Zero would turn a sleep into a busy spin, so 1ms is the floor.
fn env_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let ms: u64 = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms.max(1)))
}
