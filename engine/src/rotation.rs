use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::config::RotationConfig;
use crate::error::{EngineError, Result};
use crate::track::Track;

// Rotation queue.
//
// The catalog is shuffled with the declustering shuffle below and split into
// an active queue (played in order) and a reserve pool (held back). When the
// cursor runs off the end of the active queue, active and reserve are merged
// and reshuffled as a whole, so the reserve always re-enters the mix.

struct RotationState {
    catalog: Vec<Arc<Track>>,
    active: Vec<Arc<Track>>,
    reserve: Vec<Arc<Track>>,
    cursor: usize,
    rng: fastrand::Rng,
}

pub struct RotationQueue {
    state: Mutex<RotationState>,
    fraction: f64,
}

/// Copy of the queue for status output.
#[derive(Debug, Clone)]
pub struct RotationSnapshot {
    pub active: Vec<Arc<Track>>,
    pub reserve: Vec<Arc<Track>>,
    pub cursor: usize,
}

impl RotationQueue {
    pub fn new(config: &RotationConfig, tracks: Vec<Arc<Track>>) -> Self {
        Self::with_rng(config, tracks, fastrand::Rng::new())
    }

    /// Deterministic queue for a given seed.
    pub fn with_seed(config: &RotationConfig, tracks: Vec<Arc<Track>>, seed: u64) -> Self {
        Self::with_rng(config, tracks, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(config: &RotationConfig, tracks: Vec<Arc<Track>>, rng: fastrand::Rng) -> Self {
        let queue = Self {
            state: Mutex::new(RotationState {
                catalog: dedup(tracks),
                active: Vec::new(),
                reserve: Vec::new(),
                cursor: 0,
                rng,
            }),
            fraction: config.normalized_fraction(),
        };
        queue.reshuffle();
        queue
    }

    fn lock(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next track in rotation, reshuffling first when the active queue is spent.
    pub fn next_track(&self) -> Result<Arc<Track>> {
        let mut st = self.lock();
        if st.catalog.is_empty() {
            return Err(EngineError::EmptyCatalog);
        }
        if st.cursor >= st.active.len() {
            self.reshuffle_locked(&mut st);
        }
        let track = st
            .active
            .get(st.cursor)
            .cloned()
            .ok_or(EngineError::EmptyCatalog)?;
        st.cursor += 1;
        Ok(track)
    }

    /// Hand back `track` if it was the most recent draw, so the following
    /// `next_track` returns it again. Returns false when something else was
    /// drawn since or the queue was reshuffled.
    pub fn unread(&self, track: &Track) -> bool {
        let mut st = self.lock();
        match st.cursor.checked_sub(1) {
            Some(prev) if st.active.get(prev).is_some_and(|t| t.id == track.id) => {
                st.cursor = prev;
                true
            }
            _ => false,
        }
    }

    /// Recompute active queue and reserve pool from the working catalog.
    pub fn reshuffle(&self) {
        let mut st = self.lock();
        self.reshuffle_locked(&mut st);
    }

    fn reshuffle_locked(&self, st: &mut RotationState) {
        // Every cycle reshuffles the whole catalog rather than swapping only
        // part of the reserve in. A track that lands in reserve is then held
        // back for one cycle at most, and declustering sees every artist at
        // once instead of a partial slice. The price is that a track played
        // late in one cycle can come up early in the next.
        // Active + reserve is always the catalog in some order; after
        // `sync_catalog` it is empty and the catalog is used directly.
        let mut merged = std::mem::take(&mut st.active);
        merged.append(&mut st.reserve);
        if merged.len() != st.catalog.len() {
            merged = st.catalog.clone();
        }

        let mut order = decluster_shuffle(&merged, &mut st.rng);
        let active_len = active_len(order.len(), self.fraction);
        st.reserve = order.split_off(active_len);
        st.active = order;
        st.cursor = 0;

        info!(
            "rotation reshuffled: {} active, {} in reserve",
            st.active.len(),
            st.reserve.len()
        );
    }

    /// Replace the working catalog and reshuffle.
    pub fn sync_catalog(&self, tracks: Vec<Arc<Track>>) {
        let mut st = self.lock();
        st.catalog = dedup(tracks);
        st.active.clear();
        st.reserve.clear();
        self.reshuffle_locked(&mut st);
        debug!("rotation catalog synced: {} tracks", st.catalog.len());
    }

    pub fn len(&self) -> usize {
        self.lock().catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        let st = self.lock();
        RotationSnapshot {
            active: st.active.clone(),
            reserve: st.reserve.clone(),
            cursor: st.cursor,
        }
    }
}

fn dedup(tracks: Vec<Arc<Track>>) -> Vec<Arc<Track>> {
    let mut seen = HashSet::new();
    tracks
        .into_iter()
        .filter(|t| seen.insert(t.id.clone()))
        .collect()
}

fn active_len(total: usize, fraction: f64) -> usize {
    if total == 0 {
        return 0;
    }
    // Small epsilon so 3 * (2/3) lands on 2, not 1.
    ((total as f64 * fraction + 1e-9).floor() as usize).clamp(1, total)
}

/// Shuffle that spreads tracks by the same artist apart.
///
/// Tracks are grouped by case-insensitive artist and each group is permuted.
/// A track at index `i` of a group of size `n` gets the position
/// `i/n + offset + jitter`, with one `offset` in `[0, 1/n)` per group and a
/// per-track `jitter` in `[-0.1/n, 0.1/n)`. Sorting by position interleaves
/// the groups while keeping each artist's tracks roughly `1/n` apart.
pub fn decluster_shuffle(tracks: &[Arc<Track>], rng: &mut fastrand::Rng) -> Vec<Arc<Track>> {
    // BTreeMap keeps group iteration order stable so a seeded rng reproduces.
    let mut groups: BTreeMap<String, Vec<Arc<Track>>> = BTreeMap::new();
    for track in tracks {
        groups
            .entry(track.artist_key())
            .or_default()
            .push(track.clone());
    }

    let mut positioned: Vec<(f64, Arc<Track>)> = Vec::with_capacity(tracks.len());
    for (_, mut group) in groups {
        rng.shuffle(&mut group);

        let n = group.len() as f64;
        let offset = rng.f64() / n;
        for (idx, track) in group.into_iter().enumerate() {
            let jitter = rng.f64() * (0.2 / n) - 0.1 / n;
            positioned.push((idx as f64 / n + offset + jitter, track));
        }
    }

    positioned.sort_by(|a, b| a.0.total_cmp(&b.0));
    positioned.into_iter().map(|(_, t)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: &str, artist: &str) -> Arc<Track> {
        Arc::new(Track {
            id: id.into(),
            title: id.to_uppercase(),
            artist: artist.into(),
            art_url: String::new(),
            source_uri: format!("https://youtu.be/{id}"),
        })
    }

    fn full_queue() -> RotationConfig {
        RotationConfig {
            active_fraction: 1.0,
        }
    }

    #[test]
    fn three_tracks_each_once_before_reshuffle() {
        let catalog = vec![t("a", "X"), t("b", "Y"), t("c", "X")];
        let q = RotationQueue::with_seed(&full_queue(), catalog, 7);

        let mut got: Vec<String> = (0..3).map(|_| q.next_track().unwrap().id.clone()).collect();
        assert_eq!(q.snapshot().cursor, 3);
        got.sort();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn unread_returns_only_the_latest_draw() {
        let catalog = vec![t("a", "X"), t("b", "Y"), t("c", "Z"), t("d", "W")];
        let q = RotationQueue::with_seed(&full_queue(), catalog, 4);

        let first = q.next_track().unwrap();
        assert!(q.unread(&first));
        assert_eq!(q.next_track().unwrap().id, first.id);

        let second = q.next_track().unwrap();
        q.next_track().unwrap();
        assert!(!q.unread(&second));
        assert_eq!(q.snapshot().cursor, 3);
    }

    #[test]
    fn unread_after_resync_is_ignored() {
        let q = RotationQueue::with_seed(&full_queue(), vec![t("a", "X"), t("b", "Y")], 4);
        let drawn = q.next_track().unwrap();
        q.sync_catalog(vec![t("c", "Z")]);
        assert!(!q.unread(&drawn));
        assert_eq!(q.next_track().unwrap().id, "c");
    }

    #[test]
    fn empty_catalog_is_an_error() {
        let q = RotationQueue::new(&RotationConfig::default(), Vec::new());
        assert!(matches!(q.next_track(), Err(EngineError::EmptyCatalog)));
    }

    #[test]
    fn single_track_catalog_repeats() {
        let q = RotationQueue::new(&RotationConfig::default(), vec![t("solo", "X")]);
        for _ in 0..5 {
            assert_eq!(q.next_track().unwrap().id, "solo");
        }
    }

    #[test]
    fn split_covers_catalog_exactly() {
        let catalog: Vec<_> = (0..10).map(|i| t(&format!("s{i}"), &format!("a{}", i % 3))).collect();
        let q = RotationQueue::with_seed(&RotationConfig::default(), catalog, 1);

        for _ in 0..25 {
            let snap = q.snapshot();
            assert_eq!(snap.active.len(), 6);
            assert_eq!(snap.reserve.len(), 4);
            assert!(snap.cursor <= snap.active.len());

            let mut ids: Vec<_> = snap
                .active
                .iter()
                .chain(snap.reserve.iter())
                .map(|t| t.id.clone())
                .collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 10);

            q.next_track().unwrap();
        }
    }

    #[test]
    fn same_seed_same_order() {
        let catalog: Vec<_> = (0..12).map(|i| t(&format!("s{i}"), &format!("a{}", i % 4))).collect();
        let a = RotationQueue::with_seed(&full_queue(), catalog.clone(), 99);
        let b = RotationQueue::with_seed(&full_queue(), catalog, 99);
        for _ in 0..30 {
            assert_eq!(a.next_track().unwrap().id, b.next_track().unwrap().id);
        }
    }

    #[test]
    fn sync_catalog_replaces_tracks_and_drops_duplicates() {
        let q = RotationQueue::with_seed(&full_queue(), vec![t("a", "X")], 3);
        q.sync_catalog(vec![t("b", "Y"), t("c", "Z"), t("b", "Y")]);
        assert_eq!(q.len(), 2);

        let mut got: Vec<_> = (0..2).map(|_| q.next_track().unwrap().id.clone()).collect();
        got.sort();
        assert_eq!(got, vec!["b", "c"]);
    }

    #[test]
    fn shuffle_keeps_every_track() {
        let mut rng = fastrand::Rng::with_seed(5);
        let catalog: Vec<_> = (0..50).map(|i| t(&format!("s{i}"), &format!("a{}", i % 7))).collect();
        let out = decluster_shuffle(&catalog, &mut rng);
        let mut ids: Vec<_> = out.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        let mut want: Vec<_> = catalog.iter().map(|t| t.id.clone()).collect();
        want.sort();
        assert_eq!(ids, want);
    }

    #[test]
    fn active_len_never_zero_for_non_empty() {
        assert_eq!(active_len(0, 0.66), 0);
        assert_eq!(active_len(1, 0.66), 1);
        assert_eq!(active_len(3, 2.0 / 3.0), 2);
        assert_eq!(active_len(3, 1.0), 3);
    }
}
