//! # Sources
//!
//! Track descriptors and the resolver interface that turns a user-supplied
//! locator into tracks. Catalog integrations live outside this crate; only
//! the direct URL / local file resolver ships here.

pub mod direct_url;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub use direct_url::DirectResolver;

/// Plataforma de origen de un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Soundcloud,
    Spotify,
    Tidal,
    Direct,
    Local,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Youtube => "youtube",
            Platform::Soundcloud => "soundcloud",
            Platform::Spotify => "spotify",
            Platform::Tidal => "tidal",
            Platform::Direct => "direct",
            Platform::Local => "local",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub title: String,
    pub url: String,
}

/// Descriptor inmutable de un track.
///
/// Sólo el media locator se rellena más tarde, una única vez, y lo
/// comparten todos los clones del track.
#[derive(Debug, Clone)]
pub struct Track {
    pub title: String,
    pub url: String,
    /// Duración en segundos; 0 si es desconocida (directos, streams)
    pub duration: u64,
    pub requester: UserId,
    pub author: Author,
    pub platform: Platform,
    pub added_at: DateTime<Utc>,
    media_url: Arc<OnceLock<String>>,
}

impl Track {
    pub fn new(title: impl Into<String>, url: impl Into<String>, platform: Platform, requester: UserId) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            duration: 0,
            requester,
            author: Author::default(),
            platform,
            added_at: Utc::now(),
            media_url: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_author(mut self, title: impl Into<String>, url: impl Into<String>) -> Self {
        self.author = Author {
            title: title.into(),
            url: url.into(),
        };
        self
    }

    pub fn with_media_url(self, media_url: impl Into<String>) -> Self {
        let _ = self.media_url.set(media_url.into());
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    pub fn media_url(&self) -> Option<&str> {
        self.media_url.get().map(String::as_str)
    }

    /// Adjunta el media locator resuelto. `false` si ya tenía uno.
    pub fn attach_media_url(&self, media_url: String) -> bool {
        self.media_url.set(media_url).is_ok()
    }
}

/// Resultado de resolver un locator
#[derive(Debug, Clone)]
pub enum Resolved {
    Track(Track),
    Playlist { title: String, tracks: Vec<Track> },
}

impl Resolved {
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Resolved::Track(track) => vec![track],
            Resolved::Playlist { tracks, .. } => tracks,
        }
    }
}

/// Colaborador que traduce locators en tracks y tracks en media locators.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_resolve(&self, locator: &str) -> bool;

    async fn resolve(&self, locator: &str, requester: UserId) -> Result<Resolved>;

    /// Media locator que ffmpeg puede abrir.
    async fn media_url(&self, track: &Track) -> Result<String>;
}

/// Devuelve el media locator del track, resolviéndolo la primera vez.
pub async fn ensure_media_url(resolver: &dyn TrackResolver, track: &Track) -> Result<String> {
    if let Some(url) = track.media_url() {
        return Ok(url.to_string());
    }
    let url = resolver.media_url(track).await?;
    track.attach_media_url(url.clone());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_url_is_shared_and_set_once() {
        let track = Track::new("Song", "https://example.com/song", Platform::Direct, UserId::new(1));
        let copy = track.clone();
        assert!(track.media_url().is_none());
        assert!(copy.attach_media_url("https://cdn.example.com/a.webm".to_string()));
        assert!(!track.attach_media_url("https://other".to_string()));
        assert_eq!(track.media_url(), Some("https://cdn.example.com/a.webm"));
    }

    #[test]
    fn platform_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Platform::Soundcloud).unwrap(), "\"soundcloud\"");
        assert_eq!(Platform::Youtube.to_string(), "youtube");
    }
}
