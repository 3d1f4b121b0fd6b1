//! # Cache Module
//!
//! Best-effort download cache for played tracks.
//!
//! Downloads run one at a time through a single-mode [`CycleScheduler`].
//! Each file is written as `<root>/<author>/<title>.partial` and renamed to
//! `.final` once complete, so a status query never reports a partial file
//! as complete. Failures are logged and dropped; playback never sees them.

use anyhow::{Context, Result};
use async_process::Command;
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::scheduler::{CycleHandler, CycleMode, CycleScheduler};
use crate::sources::Track;

const PARTIAL_EXT: &str = "partial";
const FINAL_EXT: &str = "final";
const MAX_COMPONENT_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub author: String,
    pub title: String,
}

/// Convierte autor/título en nombres de fichero seguros.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    unsafe_chars: Regex,
    whitespace: Regex,
}

impl NameNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            unsafe_chars: Regex::new(r"[^\p{L}\p{N} _\-]+")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn normalize(&self, value: &str) -> String {
        let cleaned = self.unsafe_chars.replace_all(value, "");
        let collapsed = self.whitespace.replace_all(cleaned.trim(), "_");
        let normalized: String = collapsed.to_lowercase().chars().take(MAX_COMPONENT_LEN).collect();
        if normalized.is_empty() {
            "unknown".to_string()
        } else {
            normalized
        }
    }

    pub fn key(&self, track: &Track) -> CacheKey {
        CacheKey {
            author: self.normalize(&track.author.title),
            title: self.normalize(&track.title),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Downloading(PathBuf),
    Complete(PathBuf),
}

/// Descarga `source` a `dest` (ya en formato reproducible).
#[async_trait]
pub trait CacheFetcher: Send + Sync + 'static {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()>;
}

/// Descarga con ffmpeg a Ogg/Opus.
pub struct FfmpegFetcher {
    ffmpeg_path: String,
    bitrate: u32,
}

impl FfmpegFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            bitrate: config.opus_bitrate,
        }
    }
}

#[async_trait]
impl CacheFetcher for FfmpegFetcher {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        let bitrate = self.bitrate.to_string();
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i", source])
            .args(["-vn", "-ac", "2", "-ar", "48000", "-c:a", "libopus", "-b:a", &bitrate, "-f", "ogg"])
            .arg(dest)
            .output()
            .await
            .context("No se pudo ejecutar ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg terminó con {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }
}

pub struct CacheJob {
    key: CacheKey,
    source: String,
    title: String,
}

type JobMap = Arc<DashMap<CacheKey, Option<PathBuf>>>;

struct CacheWorker {
    root: PathBuf,
    fetcher: Arc<dyn CacheFetcher>,
    jobs: JobMap,
}

#[async_trait]
impl CycleHandler<CacheJob> for CacheWorker {
    async fn execute(&self, job: Arc<CacheJob>) -> Result<()> {
        let (partial, complete) = paths(&self.root, &job.key);
        let result = async {
            if let Some(dir) = partial.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            self.jobs.insert(job.key.clone(), Some(partial.clone()));
            debug!("⬇️ Descargando a caché: {}", job.title);

            self.fetcher.fetch(&job.source, &partial).await?;
            tokio::fs::rename(&partial, &complete)
                .await
                .with_context(|| format!("No se pudo renombrar {}", partial.display()))?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        self.jobs.remove(&job.key);
        match result {
            Ok(()) => {
                info!("💾 En caché: {}", job.title);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e.context(format!("descarga de '{}' fallida", job.title)))
            }
        }
    }
}

fn paths(root: &Path, key: &CacheKey) -> (PathBuf, PathBuf) {
    let base = root.join(&key.author).join(&key.title);
    (base.with_extension(PARTIAL_EXT), base.with_extension(FINAL_EXT))
}

/// Caché de descargas por (autor, título) normalizados.
pub struct DownloadCache {
    root: PathBuf,
    names: NameNormalizer,
    enabled: bool,
    max_duration: Duration,
    jobs: JobMap,
    scheduler: CycleScheduler<CacheJob>,
}

impl DownloadCache {
    pub fn new(config: &Config, fetcher: Arc<dyn CacheFetcher>) -> Result<Self> {
        let jobs: JobMap = Arc::new(DashMap::new());
        let worker = CacheWorker {
            root: config.cache_dir.clone(),
            fetcher,
            jobs: jobs.clone(),
        };
        Ok(Self {
            root: config.cache_dir.clone(),
            names: NameNormalizer::new()?,
            enabled: config.enable_cache,
            max_duration: Duration::from_secs(config.cache_max_duration),
            jobs,
            // Un tick corto: el ritmo lo marca la propia descarga
            scheduler: CycleScheduler::new(
                "cache",
                Duration::from_millis(250),
                CycleMode::Single,
                Arc::new(worker),
            ),
        })
    }

    pub fn state(&self, track: &Track) -> CacheState {
        let key = self.names.key(track);
        let (partial, complete) = paths(&self.root, &key);
        if complete.is_file() {
            return CacheState::Complete(complete);
        }
        match self.jobs.get(&key).as_deref() {
            Some(Some(_)) => CacheState::Downloading(partial),
            _ => CacheState::Absent,
        }
    }

    /// Ruta del fichero si la descarga terminó.
    pub fn cached_path(&self, track: &Track) -> Option<PathBuf> {
        match self.state(track) {
            CacheState::Complete(path) => Some(path),
            _ => None,
        }
    }

    /// Encola la descarga. `false` si está desactivada, no aplica o ya existe.
    pub fn enqueue(&self, track: &Track, source: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if track.duration == 0 || track.duration() > self.max_duration {
            debug!(
                "Caché omitida para '{}' ({}s, máximo {}s)",
                track.title,
                track.duration,
                self.max_duration.as_secs()
            );
            return false;
        }
        if self.state(track) != CacheState::Absent {
            return false;
        }

        let key = self.names.key(track);
        if self.jobs.contains_key(&key) {
            return false;
        }
        self.jobs.insert(key.clone(), None);
        self.scheduler.add(Arc::new(CacheJob {
            key,
            source: source.to_string(),
            title: track.title.clone(),
        }));
        true
    }

    /// Descargas encoladas o en curso
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }
}
