use anyhow::{Context, Result};
use async_process::Command;
use async_trait::async_trait;
use serenity::model::id::UserId;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

use super::{Platform, Resolved, Track, TrackResolver};

const AUDIO_EXTENSIONS: [&str; 7] = [".mp3", ".wav", ".ogg", ".opus", ".flac", ".m4a", ".webm"];

/// Resolver para URLs http(s) directas y ficheros locales.
#[derive(Debug, Clone, Default)]
pub struct DirectResolver {
    ffprobe_path: Option<String>,
}

impl DirectResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usa ffprobe para averiguar la duración al resolver.
    pub fn with_probe(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: Some(ffprobe_path.into()),
        }
    }

    async fn probe_duration(&self, locator: &str) -> Option<u64> {
        let ffprobe = self.ffprobe_path.as_ref()?;
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
                locator,
            ])
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                text.trim().parse::<f64>().ok().map(|secs| secs.round() as u64)
            }
            Ok(output) => {
                debug!("ffprobe falló para {}: {}", locator, output.status);
                None
            }
            Err(e) => {
                warn!("No se pudo ejecutar ffprobe: {}", e);
                None
            }
        }
    }
}

fn file_title(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

#[async_trait]
impl TrackResolver for DirectResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_resolve(&self, locator: &str) -> bool {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return true;
        }
        let lower = locator.to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }

    async fn resolve(&self, locator: &str, requester: UserId) -> Result<Resolved> {
        let locator = locator.trim();
        let track = if locator.starts_with("http://") || locator.starts_with("https://") {
            let url = Url::parse(locator).with_context(|| format!("URL inválida: {locator}"))?;
            let host = url.host_str().unwrap_or_default().to_string();
            let last = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default();
            Track::new(file_title(last), locator, Platform::Direct, requester)
                .with_author(host.clone(), format!("{}://{}", url.scheme(), host))
        } else {
            let metadata = tokio::fs::metadata(locator)
                .await
                .with_context(|| format!("Archivo no encontrado: {locator}"))?;
            if !metadata.is_file() {
                anyhow::bail!("No es un archivo: {}", locator);
            }
            Track::new(file_title(locator), locator, Platform::Local, requester).with_author("Local", "")
        };

        let track = match self.probe_duration(locator).await {
            Some(secs) => track.with_duration(secs),
            None => track,
        };
        Ok(Resolved::Track(track.with_media_url(locator)))
    }

    async fn media_url(&self, track: &Track) -> Result<String> {
        Ok(track.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_http_locator() {
        let resolver = DirectResolver::new();
        assert!(resolver.can_resolve("https://example.com/music/song.mp3"));
        let tracks = resolver
            .resolve("https://example.com/music/song.mp3", UserId::new(5))
            .await
            .unwrap()
            .into_tracks();
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.title, "song");
        assert_eq!(track.platform, Platform::Direct);
        assert_eq!(track.author.title, "example.com");
        assert_eq!(track.media_url(), Some("https://example.com/music/song.mp3"));
    }

    #[tokio::test]
    async fn resolves_local_file_and_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.ogg");
        std::fs::write(&path, b"OggS").unwrap();
        let path = path.to_string_lossy().to_string();

        let resolver = DirectResolver::new();
        let tracks = resolver.resolve(&path, UserId::new(5)).await.unwrap().into_tracks();
        assert_eq!(tracks[0].title, "tune");
        assert_eq!(tracks[0].platform, Platform::Local);

        assert!(resolver.resolve("/definitely/missing.mp3", UserId::new(5)).await.is_err());
        assert!(!resolver.can_resolve("some search words"));
    }
}
