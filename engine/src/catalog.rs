use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::track::Track;

// Catalog ingest.
//
// Submitters drop one JSON song list each into the ingest directory:
//
//   { "name": "...", "pfp_url": "...",
//     "songs": [ { "artist": "...", "title": "...", "art_url": "...", "url": "..." } ] }
//
// A broken file is logged and skipped; it never takes the station down.

#[derive(Debug, Clone, Deserialize)]
struct SongList {
    name: String,
    #[serde(default)]
    pfp_url: String,
    #[serde(default)]
    songs: Vec<SongEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SongEntry {
    #[serde(default)]
    artist: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    art_url: String,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submitter {
    pub name: String,
    pub pfp_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tracks: Vec<Arc<Track>>,
    by_id: HashMap<String, Arc<Track>>,
    submitters: Vec<Submitter>,
}

impl Catalog {
    /// Build a catalog from tracks, dropping repeated ids (first one wins).
    pub fn from_tracks(tracks: impl IntoIterator<Item = Track>) -> Self {
        let mut catalog = Catalog::default();
        for track in tracks {
            catalog.insert(track);
        }
        catalog
    }

    fn insert(&mut self, track: Track) -> bool {
        if self.by_id.contains_key(&track.id) {
            debug!(track_id = %track.id, "duplicate submission ignored");
            return false;
        }
        let track = Arc::new(track);
        self.by_id.insert(track.id.clone(), track.clone());
        self.tracks.push(track);
        true
    }

    /// Read every `*.json` song list in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|ent| ent.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();

        let mut catalog = Catalog::default();
        for path in &files {
            match load_song_list(path) {
                Ok(list) => catalog.absorb(list, path),
                Err(e) => warn!("skipping song list {}: {e}", path.display()),
            }
        }

        info!(
            "catalog loaded: {} tracks from {} submitters ({} files)",
            catalog.tracks.len(),
            catalog.submitters.len(),
            files.len()
        );
        Ok(catalog)
    }

    fn absorb(&mut self, list: SongList, path: &Path) {
        let mut added = 0usize;
        for song in list.songs {
            match Track::new(song.title, song.artist, song.art_url, song.url.clone()) {
                Some(track) => {
                    if self.insert(track) {
                        added += 1;
                    }
                }
                None => warn!(
                    "{}: no usable id in {:?}, song skipped",
                    path.display(),
                    song.url
                ),
            }
        }
        debug!("{}: {added} tracks from {}", path.display(), list.name);

        if !self.submitters.iter().any(|s| s.name == list.name) {
            self.submitters.push(Submitter {
                name: list.name,
                pfp_url: list.pfp_url,
            });
        }
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Track>> {
        self.by_id.get(id).cloned()
    }

    pub fn submitters(&self) -> &[Submitter] {
        &self.submitters
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

fn load_song_list(path: &Path) -> Result<SongList> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}
