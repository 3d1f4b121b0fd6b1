use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Muestras por milisegundo a 48kHz (estándar de Discord)
pub const SAMPLES_PER_MS: u32 = 48;
pub const SAMPLE_RATE: u32 = SAMPLES_PER_MS * 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Audio
    pub ffmpeg_path: String,
    pub opus_bitrate: u32,
    pub frame_duration_ms: u32,
    pub frame_buffer: usize,
    pub max_queue_size: usize,

    // Voz
    pub heartbeat_miss_limit: u32,
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde_compat")]
    pub keepalive_interval: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub resource_ready_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub idle_timeout: Duration,

    // Caché
    pub enable_cache: bool,
    pub cache_max_duration: u64, // En segundos

    // Rendimiento
    pub worker_threads: usize,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Audio
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "96000".to_string()) // 96kbps (Discord default)
                .parse()?,
            frame_duration_ms: std::env::var("FRAME_DURATION_MS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            frame_buffer: std::env::var("FRAME_BUFFER")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,

            // Voz
            heartbeat_miss_limit: std::env::var("HEARTBEAT_MISS_LIMIT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            max_reconnect_attempts: std::env::var("MAX_RECONNECT_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            keepalive_interval: env_duration("KEEPALIVE_INTERVAL", "5s")?,
            resource_ready_timeout: env_duration("RESOURCE_READY_TIMEOUT", "20s")?,
            idle_timeout: env_duration("IDLE_TIMEOUT", "5m")?,

            // Caché
            enable_cache: std::env::var("ENABLE_CACHE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            cache_max_duration: std::env::var("CACHE_MAX_DURATION")
                .unwrap_or_else(|_| "1800".to_string()) // 30 minutos
                .parse()?,

            // Rendimiento
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "/app/cache".to_string())
                .into(),
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("creating {}", config.cache_dir.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Opus bitrate must be within 8kbps..=510kbps (Discord limit)
    /// - Frame duration must be one Opus supports for 48kHz (10/20/40/60 ms)
    /// - Buffers, queue size and retry limits must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.opus_bitrate > 510000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if ![10, 20, 40, 60].contains(&self.frame_duration_ms) {
            anyhow::bail!(
                "Frame duration must be 10, 20, 40 or 60 ms, got: {}",
                self.frame_duration_ms
            );
        }

        if self.frame_buffer == 0 {
            anyhow::bail!("Frame buffer must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.heartbeat_miss_limit == 0 {
            anyhow::bail!("Heartbeat miss limit must be greater than 0");
        }

        if self.resource_ready_timeout.is_zero() {
            anyhow::bail!("Resource ready timeout must be greater than 0");
        }

        Ok(())
    }

    /// Duración de un frame de audio
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    /// Muestras por canal en un frame (960 para 20ms @ 48kHz)
    pub fn samples_per_frame(&self) -> u32 {
        self.frame_duration_ms * SAMPLES_PER_MS
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes anything sensitive; safe to print at startup.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}kbps, {}ms frames, {} frames buffered, ffmpeg='{}'\n  \
            Voice: {} missed heartbeats, {} reconnects, keepalive {}, idle {}\n  \
            Cache: enabled={}, max {}s per track\n  \
            Limits: {} queue, ready timeout {}",
            self.opus_bitrate / 1000,
            self.frame_duration_ms,
            self.frame_buffer,
            self.ffmpeg_path,
            self.heartbeat_miss_limit,
            self.max_reconnect_attempts,
            humantime::format_duration(self.keepalive_interval),
            humantime::format_duration(self.idle_timeout),
            self.enable_cache,
            self.cache_max_duration,
            self.max_queue_size,
            humantime::format_duration(self.resource_ready_timeout),
        )
    }
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("invalid duration in {key}: '{raw}'"))
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            opus_bitrate: 96000, // 96kbps (Discord default)
            frame_duration_ms: 20,
            frame_buffer: 50,
            max_queue_size: 1000,

            heartbeat_miss_limit: 3,
            max_reconnect_attempts: 5,
            keepalive_interval: Duration::from_secs(5),
            resource_ready_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(300),

            enable_cache: true,
            cache_max_duration: 1800,

            worker_threads: num_cpus::get(),

            data_dir: "/app/data".into(),
            cache_dir: "/app/cache".into(),
        }
    }
}

/// Serializa duraciones como texto legible ("20s", "5m")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
