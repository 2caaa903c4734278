use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{EngineError, Result};

/// What the acquisition tool reports back for one source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Id the tool filed the audio under (`{cache_dir}/{id}.mp3`).
    pub id: String,
    pub title: String,
    pub duration: u32,
}

/// Fetches the audio behind a source URI into the cache directory.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, source_uri: &str, cache_dir: &Path) -> Result<Acquired>;
}

/// Acquirer backed by the `yt-dlp` command line tool.
pub struct YtDlpAcquirer {
    bin: String,
}

impl YtDlpAcquirer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpJson {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[async_trait]
impl Acquirer for YtDlpAcquirer {
    async fn acquire(&self, source_uri: &str, cache_dir: &Path) -> Result<Acquired> {
        let template = cache_dir.join("%(id)s.%(ext)s");

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-x");
        cmd.arg("--audio-format").arg("mp3");
        cmd.arg("--no-playlist");
        cmd.arg("--print-json");
        cmd.arg("-o").arg(&template);
        cmd.arg(source_uri);
        cmd.stdin(std::process::Stdio::null());

        debug!("running {} for {source_uri}", self.bin);
        let out = cmd.output().await.map_err(|e| EngineError::AcquisitionFailed {
            uri: source_uri.to_string(),
            reason: format!("failed to spawn {}: {e}", self.bin),
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(EngineError::AcquisitionFailed {
                uri: source_uri.to_string(),
                reason: format!("{} exited with {}: {}", self.bin, out.status, last_line(&stderr)),
            });
        }

        parse_ytdlp_output(source_uri, &out.stdout)
    }
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// `--print-json` emits one JSON document per line; the last one is ours.
fn parse_ytdlp_output(source_uri: &str, stdout: &[u8]) -> Result<Acquired> {
    let text = String::from_utf8_lossy(stdout);
    let line = last_line(&text);

    let parsed: YtDlpJson =
        serde_json::from_str(line).map_err(|e| EngineError::AcquisitionFailed {
            uri: source_uri.to_string(),
            reason: format!("unparseable yt-dlp output: {e}"),
        })?;

    let duration = parsed
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d.round().max(1.0) as u32)
        .ok_or_else(|| EngineError::AcquisitionFailed {
            uri: source_uri.to_string(),
            reason: "yt-dlp reported no duration".into(),
        })?;

    Ok(Acquired {
        id: parsed.id,
        title: parsed.title,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_json_line() {
        let out = b"[youtube] noise\n{\"id\":\"abc\",\"title\":\"T\",\"duration\":212.6,\"_filename\":\"x\"}\n";
        let got = parse_ytdlp_output("u", out).unwrap();
        assert_eq!(
            got,
            Acquired {
                id: "abc".into(),
                title: "T".into(),
                duration: 213
            }
        );
    }

    #[test]
    fn missing_duration_is_a_failure() {
        let out = b"{\"id\":\"abc\",\"title\":\"live\"}";
        assert!(matches!(
            parse_ytdlp_output("u", out),
            Err(EngineError::AcquisitionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_an_acquisition_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let acq = YtDlpAcquirer::new("crowdradio-no-such-binary");
        let err = acq
            .acquire("https://youtu.be/abc", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AcquisitionFailed { .. }));
    }
}
