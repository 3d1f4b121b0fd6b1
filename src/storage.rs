use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::sources::{Author, Platform, Track};

/// Entrada del historial de escucha
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title: String,
    pub url: String,
    pub author: Author,
    pub platform: Platform,
    pub total: u64,
}

/// Documento de historial de un servidor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildHistory {
    pub tracks: Vec<HistoryEntry>,
}

impl GuildHistory {
    /// Suma una reproducción y reordena por total descendente.
    pub fn record(&mut self, track: &Track) -> u64 {
        let total = match self.tracks.iter_mut().find(|entry| entry.url == track.url) {
            Some(entry) => {
                entry.total += 1;
                entry.title = track.title.clone();
                entry.author = track.author.clone();
                entry.total
            }
            None => {
                self.tracks.push(HistoryEntry {
                    title: track.title.clone(),
                    url: track.url.clone(),
                    author: track.author.clone(),
                    platform: track.platform,
                    total: 1,
                });
                1
            }
        };
        // sort_by es estable: los empates conservan el orden previo
        self.tracks.sort_by(|a, b| b.total.cmp(&a.total));
        total
    }

    pub fn top(&self, limit: usize) -> &[HistoryEntry] {
        &self.tracks[..limit.min(self.tracks.len())]
    }
}

/// Historial de escucha persistido como un JSON por servidor
pub struct HistoryStore {
    history_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let history_dir = data_dir.join("history");
        fs::create_dir_all(&history_dir)
            .await
            .with_context(|| format!("creating {}", history_dir.display()))?;

        info!("📁 Historial inicializado en: {}", history_dir.display());

        Ok(Self {
            history_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, guild_id: GuildId) -> PathBuf {
        self.history_dir.join(format!("{}.json", guild_id.get()))
    }

    /// Carga el historial; vacío si aún no existe.
    pub async fn load(&self, guild_id: GuildId) -> Result<GuildHistory> {
        let path = self.path_for(guild_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GuildHistory::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        match serde_json::from_str(&content) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!("⚠️ Historial corrupto para guild {}, se reinicia: {}", guild_id, e);
                Ok(GuildHistory::default())
            }
        }
    }

    /// Registra una reproducción y guarda el documento.
    pub async fn record(&self, guild_id: GuildId, track: &Track) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let mut history = self.load(guild_id).await?;
        let total = history.record(track);

        let path = self.path_for(guild_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&history)?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).await?;

        debug!("📝 Historial guild {}: '{}' x{}", guild_id, track.title, total);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn track(title: &str) -> Track {
        Track::new(title, format!("https://example.com/{title}"), Platform::Direct, UserId::new(1))
            .with_author("Artist", "https://example.com")
    }

    #[test]
    fn record_sorts_by_total() {
        let mut history = GuildHistory::default();
        history.record(&track("a"));
        history.record(&track("b"));
        history.record(&track("b"));
        history.record(&track("c"));

        let order: Vec<_> = history.tracks.iter().map(|e| (e.title.as_str(), e.total)).collect();
        assert_eq!(order, vec![("b", 2), ("a", 1), ("c", 1)]);
        assert_eq!(history.top(1).len(), 1);
        assert_eq!(history.top(10).len(), 3);
    }

    #[tokio::test]
    async fn persists_document_per_guild() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(42);

        assert!(store.load(guild).await.unwrap().tracks.is_empty());
        store.record(guild, &track("song")).await.unwrap();
        assert_eq!(store.record(guild, &track("song")).await.unwrap(), 2);
        store.record(guild, &track("other")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("history/42.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["tracks"][0]["title"], "song");
        assert_eq!(json["tracks"][0]["total"], 2);
        assert_eq!(json["tracks"][0]["platform"], "direct");
        assert_eq!(json["tracks"][0]["author"]["title"], "Artist");
        assert_eq!(json["tracks"][1]["total"], 1);

        assert!(store.load(GuildId::new(7)).await.unwrap().tracks.is_empty());
    }
}
