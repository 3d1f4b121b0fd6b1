use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{error, info, warn};

use open_voice::{
    cache::{DownloadCache, FfmpegFetcher},
    config::Config,
    error::VoiceError,
    manager::GuildManager,
    sources::DirectResolver,
    storage::HistoryStore,
    voice::{GatewayBridge, VoiceServerInfo},
};

/// Sin gateway principal conectado: el proceso sólo expone el núcleo.
struct DetachedGateway;

#[async_trait]
impl GatewayBridge for DetachedGateway {
    async fn request_join(&self, guild_id: GuildId, _channel_id: ChannelId) -> Result<VoiceServerInfo, VoiceError> {
        Err(VoiceError::Join(format!("no gateway attached for guild {guild_id}")))
    }

    async fn request_leave(&self, _guild_id: GuildId) -> Result<(), VoiceError> {
        Ok(())
    }
}

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_voice=debug".parse()?)
                .add_directive("serenity=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Voice v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let history = Arc::new(HistoryStore::new(config.data_dir.clone()).await?);
    let cache = if config.enable_cache {
        Some(Arc::new(DownloadCache::new(&config, Arc::new(FfmpegFetcher::new(&config)))?))
    } else {
        info!("Caché de descargas desactivada");
        None
    };

    let manager = GuildManager::new(
        config.clone(),
        Arc::new(DetachedGateway),
        Arc::new(DirectResolver::with_probe("ffprobe")),
        cache,
        Some(history),
    );

    info!("🚀 Motor de voz listo");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error al registrar Ctrl+C: {}", e);
    }

    warn!("⚠️ Señal de shutdown recibida, cerrando...");
    manager.shutdown().await;
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("ffmpeg no disponible en '{}'", config.ffmpeg_path);
    }
}
