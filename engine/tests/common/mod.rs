//! Shared fixtures: a scripted acquirer and small builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crowdradio_engine::config::StagingConfig;
use crowdradio_engine::staging::acquire::{Acquired, Acquirer};
use crowdradio_engine::staging::sidecar;
use crowdradio_engine::track::{is_safe_id, track_id_from_uri, Track};
use crowdradio_engine::{EngineError, Result};

/// Deterministic stand-in for yt-dlp.
///
/// Writes a tiny fake mp3 and returns a canned duration. Per-URI failure
/// budgets make the first N calls for that URI fail.
pub struct FakeAcquirer {
    calls: AtomicU32,
    per_uri: Mutex<HashMap<String, u32>>,
    fail_budget: Mutex<HashMap<String, u32>>,
    durations: Mutex<HashMap<String, u32>>,
    resolved: Mutex<HashMap<String, String>>,
    default_duration: u32,
    delay: Duration,
}

impl FakeAcquirer {
    pub fn new(default_duration: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            per_uri: Mutex::new(HashMap::new()),
            fail_budget: Mutex::new(HashMap::new()),
            durations: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            default_duration,
            delay,
        })
    }

    pub fn fail_times(&self, uri: &str, times: u32) {
        self.fail_budget.lock().unwrap().insert(uri.to_string(), times);
    }

    pub fn set_duration(&self, uri: &str, secs: u32) {
        self.durations.lock().unwrap().insert(uri.to_string(), secs);
    }

    /// Report `id` as the resolved id for `uri`, the way yt-dlp reports the
    /// upstream video id rather than the catalog's.
    pub fn resolve_as(&self, uri: &str, id: &str) {
        self.resolved
            .lock()
            .unwrap()
            .insert(uri.to_string(), id.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, uri: &str) -> u32 {
        self.per_uri.lock().unwrap().get(uri).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Acquirer for FakeAcquirer {
    async fn acquire(&self, source_uri: &str, cache_dir: &Path) -> Result<Acquired> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_uri
            .lock()
            .unwrap()
            .entry(source_uri.to_string())
            .or_default() += 1;

        tokio::time::sleep(self.delay).await;

        let should_fail = {
            let mut budget = self.fail_budget.lock().unwrap();
            match budget.get_mut(source_uri) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(EngineError::AcquisitionFailed {
                uri: source_uri.to_string(),
                reason: "scripted failure".into(),
            });
        }

        let id = self
            .resolved
            .lock()
            .unwrap()
            .get(source_uri)
            .cloned()
            .unwrap_or_else(|| track_id_from_uri(source_uri).expect("fixture uri"));
        if is_safe_id(&id) {
            tokio::fs::write(sidecar::audio_path(cache_dir, &id), b"ID3fake")
                .await
                .map_err(EngineError::from)?;
        }

        let duration = self
            .durations
            .lock()
            .unwrap()
            .get(source_uri)
            .copied()
            .unwrap_or(self.default_duration);

        Ok(Acquired {
            id,
            title: format!("fetched {source_uri}"),
            duration,
        })
    }
}

pub fn track(id: &str, artist: &str) -> Arc<Track> {
    Arc::new(Track::new(format!("Song {id}"), artist, "", uri(id)).expect("fixture uri"))
}

pub fn uri(id: &str) -> String {
    format!("https://youtu.be/{id}")
}

pub fn staging_config(dir: &Path) -> StagingConfig {
    StagingConfig {
        cache_dir: dir.to_path_buf(),
        workers: 3,
        queue_capacity: 32,
        ..StagingConfig::default()
    }
}
