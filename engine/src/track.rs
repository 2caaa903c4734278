use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A submitted song. Immutable once ingested; shared as `Arc<Track>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub art_url: String,
    pub source_uri: String,
}

impl Track {
    /// Build a track, deriving its id from `source_uri`.
    ///
    /// Returns `None` when no id can be derived (unparseable URI).
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        art_url: impl Into<String>,
        source_uri: impl Into<String>,
    ) -> Option<Self> {
        let source_uri = source_uri.into();
        let id = track_id_from_uri(&source_uri)?;
        Some(Self {
            id,
            title: title.into(),
            artist: artist.into(),
            art_url: art_url.into(),
            source_uri,
        })
    }

    /// Lowercased artist, the grouping key for the declustering shuffle.
    pub fn artist_key(&self) -> String {
        self.artist.to_lowercase()
    }
}

/// Derive a stable, filesystem-safe id from a source URI.
///
/// YouTube links map to their video id so the same video submitted through
/// different link shapes lands on one cache entry. Anything else gets a
/// truncated SHA-256 of the URI.
pub fn track_id_from_uri(uri: &str) -> Option<String> {
    let uri = uri.trim();
    let parsed = Url::parse(uri).ok()?;

    let video_id = match parsed.host_str() {
        Some("www.youtube.com" | "youtube.com" | "m.youtube.com" | "music.youtube.com") => parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned()),
        Some("youtu.be") => parsed
            .path_segments()
            .and_then(|mut segs| segs.next())
            .map(str::to_string),
        _ => None,
    };

    match video_id {
        Some(id) if is_safe_id(&id) => Some(id),
        Some(_) => None,
        None => {
            let digest = Sha256::digest(uri.as_bytes());
            Some(hex::encode(&digest[..8]))
        }
    }
}

/// Ids become file names in the cache directory.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_watch_and_short_links_share_an_id() {
        let a = track_id_from_uri("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42").unwrap();
        let b = track_id_from_uri("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(a, "dQw4w9WgXcQ");
        assert_eq!(a, b);
    }

    #[test]
    fn other_uris_hash_stably() {
        let a = track_id_from_uri("https://soundcloud.com/someone/a-song").unwrap();
        let b = track_id_from_uri("  https://soundcloud.com/someone/a-song ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(is_safe_id(&a));
    }

    #[test]
    fn garbage_has_no_id() {
        assert!(track_id_from_uri("not a url").is_none());
        assert!(track_id_from_uri("https://youtu.be/").is_none());
        assert!(track_id_from_uri("https://www.youtube.com/watch?v=../../etc").is_none());
    }

    #[test]
    fn youtube_without_video_falls_back_to_hash() {
        let id = track_id_from_uri("https://www.youtube.com/channel/abc").unwrap();
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn artist_key_is_case_insensitive() {
        let a = Track::new("t", "The Band", "", "https://youtu.be/x1").unwrap();
        let b = Track::new("t", "THE BAND", "", "https://youtu.be/x2").unwrap();
        assert_eq!(a.artist_key(), b.artist_key());
    }
}
