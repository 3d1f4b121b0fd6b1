//! # Guild Manager
//!
//! Explicit registry of per-guild sessions. A session bundles the guild's
//! [`VoiceConnection`], its [`Player`] and its [`Queue`]; the manager owns
//! the shared frame scheduler, the download cache and the listen history,
//! and is the only place where playback policy lives:
//!
//! - a natural finish advances the queue according to its loop mode
//! - a recoverable error skips the current track
//! - a fatal error or a destroyed connection tears the whole session down
//! - an empty queue schedules an idle disconnect after `IDLE_TIMEOUT`

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    audio::{
        filters::FilterChain,
        player::{frame_scheduler, PlayOutcome, Player, PlayerEvent, PlayerEventKind, PlayerStatus},
        queue::{LoopMode, Queue, QueueInfo},
    },
    cache::DownloadCache,
    config::Config,
    error::PlaybackError,
    scheduler::CycleScheduler,
    sources::{ensure_media_url, Platform, Track, TrackResolver},
    storage::HistoryStore,
    voice::{ConnectionEvent, FrameSink, GatewayBridge, VoiceConnection},
};

/// Estado de un guild con sesión de voz.
pub struct GuildSession {
    guild_id: GuildId,
    connection: Arc<VoiceConnection>,
    player: Arc<Player>,
    queue: Arc<RwLock<Queue>>,
    /// La cabeza de la cola ya fue entregada al reproductor
    active: AtomicBool,
    failures: AtomicUsize,
    idle: Mutex<Option<CancellationToken>>,
}

impl GuildSession {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn connection(&self) -> &Arc<VoiceConnection> {
        &self.connection
    }

    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    pub fn queue(&self) -> QueueInfo {
        self.queue.read().info()
    }

    fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
            || matches!(self.player.status(), PlayerStatus::Playing | PlayerStatus::Pause)
    }

    /// ¿Sigue `url` en la cabeza de la cola?
    fn is_head(&self, url: Option<&str>) -> bool {
        let queue = self.queue.read();
        matches!((queue.current(), url), (Some(head), Some(url)) if head.url == url)
    }

    fn cancel_idle(&self) {
        if let Some(token) = self.idle.lock().take() {
            token.cancel();
        }
    }
}

/// Lo que está sonando ahora mismo
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: Track,
    pub status: PlayerStatus,
    pub position: Duration,
    pub duration: Duration,
}

pub struct GuildManager {
    config: Arc<Config>,
    bridge: Arc<dyn GatewayBridge>,
    resolver: Arc<dyn TrackResolver>,
    cache: Option<Arc<DownloadCache>>,
    history: Option<Arc<HistoryStore>>,
    frames: CycleScheduler<Player>,
    sessions: DashMap<GuildId, Arc<GuildSession>>,
    player_events: mpsc::UnboundedSender<PlayerEvent>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    this: Weak<GuildManager>,
}

impl GuildManager {
    /// Crea el registro y lanza su bucle de eventos. Requiere un runtime de tokio.
    pub fn new(
        config: Arc<Config>,
        bridge: Arc<dyn GatewayBridge>,
        resolver: Arc<dyn TrackResolver>,
        cache: Option<Arc<DownloadCache>>,
        history: Option<Arc<HistoryStore>>,
    ) -> Arc<Self> {
        let (player_events, player_rx) = mpsc::unbounded_channel();
        let (connection_events, connection_rx) = mpsc::unbounded_channel();

        let manager = Arc::new_cyclic(|this| Self {
            frames: frame_scheduler(&config),
            config,
            bridge,
            resolver,
            cache,
            history,
            sessions: DashMap::new(),
            player_events,
            connection_events,
            this: this.clone(),
        });

        tokio::spawn(run_events(Arc::downgrade(&manager), player_rx, connection_rx));
        info!("🎛️ GuildManager inicializado");
        manager
    }

    pub fn session(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    fn require(&self, guild_id: GuildId) -> Result<Arc<GuildSession>> {
        self.session(guild_id)
            .ok_or_else(|| anyhow::anyhow!("No hay sesión de voz en guild {}", guild_id))
    }

    fn open_session(&self, guild_id: GuildId, sink: Option<Arc<dyn FrameSink>>) -> Arc<GuildSession> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                let connection = VoiceConnection::new(
                    guild_id,
                    self.config.clone(),
                    self.bridge.clone(),
                    self.connection_events.clone(),
                );
                let sink = sink.unwrap_or_else(|| connection.clone() as Arc<dyn FrameSink>);
                let player = Player::new(
                    guild_id,
                    self.config.clone(),
                    sink,
                    self.frames.clone(),
                    self.player_events.clone(),
                );
                debug!("🆕 Sesión creada para guild {}", guild_id);
                Arc::new(GuildSession {
                    guild_id,
                    connection,
                    player,
                    queue: Arc::new(RwLock::new(Queue::new(self.config.max_queue_size))),
                    active: AtomicBool::new(false),
                    failures: AtomicUsize::new(0),
                    idle: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Conecta el guild a un canal de voz, creando la sesión si no existe.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        let session = self.open_session(guild_id, None);
        if let Err(e) = session.connection.join(channel_id).await {
            error!("❌ No se pudo conectar al canal {} en guild {}: {}", channel_id, guild_id, e);
            self.teardown(guild_id, "join failed").await;
            return Err(e).context("No se pudo conectar al canal de voz");
        }
        info!("✅ Conectado al canal {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    /// Resuelve `locator` y agrega el resultado a la cola.
    ///
    /// Si no había nada sonando, arranca la reproducción.
    pub async fn enqueue(&self, guild_id: GuildId, locator: &str, requester: UserId) -> Result<Vec<Track>> {
        let session = self.require(guild_id)?;
        if !self.resolver.can_resolve(locator) {
            anyhow::bail!("Fuente no soportada: {}", locator);
        }

        let tracks = self
            .resolver
            .resolve(locator, requester)
            .await
            .with_context(|| format!("No se pudo resolver '{locator}'"))?
            .into_tracks();
        if tracks.is_empty() {
            anyhow::bail!("No se encontraron canciones para: {}", locator);
        }

        self.enqueue_tracks(&session, tracks).await
    }

    async fn enqueue_tracks(&self, session: &Arc<GuildSession>, tracks: Vec<Track>) -> Result<Vec<Track>> {
        let added: Vec<Track> = {
            let mut queue = session.queue.write();
            let count = queue.push_many(tracks.clone());
            tracks.into_iter().take(count).collect()
        };
        if added.is_empty() {
            anyhow::bail!("La cola está llena (máximo {} canciones)", self.config.max_queue_size);
        }

        session.cancel_idle();
        if !session.active.swap(true, Ordering::AcqRel) {
            self.start_current(session).await;
        }
        Ok(added)
    }

    /// Reproduce la cabeza de la cola, saltando las que fallen.
    async fn start_current(&self, session: &Arc<GuildSession>) {
        session.active.store(true, Ordering::Release);
        loop {
            let head = session.queue.read().current().cloned();
            let Some(track) = head else {
                self.go_idle(session);
                return;
            };

            match self.play_track(session, &track).await {
                Ok(PlayOutcome::Started) => {
                    session.failures.store(0, Ordering::Release);
                    return;
                }
                // Otra llamada ya controla el reproductor
                Ok(PlayOutcome::Superseded) => return,
                Err(e) if e.is_fatal() => {
                    error!("💥 Error fatal en guild {}: {}", session.guild_id, e);
                    self.teardown(session.guild_id, &e.to_string()).await;
                    return;
                }
                Err(e) => {
                    warn!("⚠️ Saltando '{}' en guild {}: {}", track.title, session.guild_id, e);
                    if !self.skip_failed(session) {
                        return;
                    }
                }
            }
        }
    }

    async fn play_track(&self, session: &GuildSession, track: &Track) -> Result<PlayOutcome, PlaybackError> {
        let cached = self.cache.as_ref().and_then(|cache| cache.cached_path(track));
        let from_cache = cached.is_some();
        let locator = match cached {
            Some(path) => {
                debug!("💾 Reproduciendo desde caché: {}", path.display());
                path.to_string_lossy().into_owned()
            }
            None => ensure_media_url(self.resolver.as_ref(), track)
                .await
                .map_err(|e| PlaybackError::Recoverable(format!("{e:#}")))?,
        };

        let outcome = session
            .player
            .play(track.clone(), locator.clone(), Duration::ZERO)
            .await?;
        if outcome == PlayOutcome::Superseded {
            return Ok(outcome);
        }

        if !from_cache && track.platform != Platform::Local {
            if let Some(cache) = &self.cache {
                cache.enqueue(track, &locator);
            }
        }
        if let Some(history) = &self.history {
            if let Err(e) = history.record(session.guild_id, track).await {
                warn!("No se pudo guardar el historial de guild {}: {:#}", session.guild_id, e);
            }
        }
        Ok(outcome)
    }

    /// Descarta (o rota) la cabeza tras un fallo. `false` si ya no hay nada que intentar.
    fn skip_failed(&self, session: &Arc<GuildSession>) -> bool {
        let failures = session.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let exhausted = {
            let mut queue = session.queue.write();
            queue.skip(1);
            // En bucle nada se descarta: se para tras una vuelta completa
            let rotating = queue.loop_mode() == LoopMode::Songs || queue.is_radio();
            queue.is_empty() || (rotating && failures >= queue.len())
        };

        if exhausted {
            warn!("⚠️ Ninguna canción de la cola se pudo reproducir en guild {}", session.guild_id);
            session.failures.store(0, Ordering::Release);
            self.go_idle(session);
            return false;
        }
        true
    }

    fn go_idle(&self, session: &Arc<GuildSession>) {
        session.active.store(false, Ordering::Release);

        let token = CancellationToken::new();
        if let Some(previous) = session.idle.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = self.this.clone();
        let guild_id = session.guild_id;
        let timeout = self.config.idle_timeout;
        debug!(
            "⏲️ Guild {} inactivo, desconexión en {}",
            guild_id,
            humantime::format_duration(timeout)
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_idle_timeout(guild_id).await;
                    }
                }
            }
        });
    }

    async fn on_idle_timeout(&self, guild_id: GuildId) {
        let Some(session) = self.session(guild_id) else {
            return;
        };
        if session.is_busy() {
            return;
        }
        info!("💤 Guild {} sin actividad, desconectando", guild_id);
        self.teardown(guild_id, "idle timeout").await;
    }

    async fn on_player_event(&self, event: PlayerEvent) {
        let Some(session) = self.session(event.guild_id) else {
            return;
        };

        match event.kind {
            PlayerEventKind::Finished => {
                // Un skip/remove concurrente pudo avanzar la cola ya
                if !session.is_head(event.url.as_deref()) {
                    debug!("Fin de pista obsoleto en guild {}, ignorado", event.guild_id);
                    return;
                }
                session.queue.write().on_track_finished();
                self.start_current(&session).await;
            }
            PlayerEventKind::Stopped => trace!("Player de guild {} detenido", event.guild_id),
            PlayerEventKind::Error(e) if e.is_fatal() => {
                error!("💥 Error fatal de reproducción en guild {}: {}", event.guild_id, e);
                self.teardown(event.guild_id, &e.to_string()).await;
            }
            PlayerEventKind::Error(e) => {
                warn!("⚠️ Error de reproducción en guild {}: {}", event.guild_id, e);
                if !session.is_head(event.url.as_deref()) {
                    return;
                }
                if self.skip_failed(&session) {
                    self.start_current(&session).await;
                }
            }
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Destroyed { guild_id, reason } => {
                warn!("🔌 Conexión de voz perdida en guild {}: {}", guild_id, reason);
                self.teardown(guild_id, &reason).await;
            }
        }
    }

    /// Salta `count` canciones y reproduce la siguiente.
    pub async fn skip(&self, guild_id: GuildId, count: usize) -> Result<usize> {
        let session = self.require(guild_id)?;
        let (skipped, empty) = {
            let mut queue = session.queue.write();
            let skipped = queue.skip(count.max(1));
            (skipped, queue.is_empty())
        };
        if skipped == 0 {
            anyhow::bail!("No hay canciones en la cola");
        }

        session.failures.store(0, Ordering::Release);
        if empty {
            session.player.stop();
        }
        self.start_current(&session).await;
        Ok(skipped)
    }

    pub fn pause(&self, guild_id: GuildId) -> Result<bool> {
        Ok(self.require(guild_id)?.player.pause())
    }

    pub fn resume(&self, guild_id: GuildId) -> Result<bool> {
        Ok(self.require(guild_id)?.player.resume())
    }

    /// Detiene la reproducción y vacía la cola.
    pub fn stop(&self, guild_id: GuildId) -> Result<bool> {
        let session = self.require(guild_id)?;
        session.queue.write().clear_all();
        let stopped = session.player.stop();
        self.go_idle(&session);
        Ok(stopped)
    }

    pub async fn seek(&self, guild_id: GuildId, position: Duration) -> Result<()> {
        let session = self.require(guild_id)?;
        let result = session.player.seek(position).await.map(|_| ());
        self.after_restart(&session, result).await
    }

    pub async fn set_filters(&self, guild_id: GuildId, filters: FilterChain) -> Result<()> {
        let session = self.require(guild_id)?;
        let result = session.player.set_filters(filters).await;
        self.after_restart(&session, result).await
    }

    /// Un seek o cambio de filtros reinicia el decodificador; si falla, la
    /// pista se trata igual que cualquier otro fallo de reproducción.
    async fn after_restart(&self, session: &Arc<GuildSession>, result: Result<(), PlaybackError>) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };
        match &e {
            PlaybackError::Rejected(_) => {}
            PlaybackError::Fatal(_) => {
                error!("💥 Error fatal reiniciando la pista en guild {}: {}", session.guild_id, e);
                self.teardown(session.guild_id, &e.to_string()).await;
            }
            PlaybackError::Recoverable(_) => {
                warn!("⚠️ No se pudo reiniciar la pista en guild {}: {}", session.guild_id, e);
                if self.skip_failed(session) {
                    self.start_current(session).await;
                }
            }
        }
        Err(e.into())
    }

    /// Quita una canción. Quitar la actual equivale a saltarla.
    pub async fn remove(&self, guild_id: GuildId, index: usize) -> Result<Track> {
        let session = self.require(guild_id)?;
        if index == 0 {
            let current = session
                .queue
                .read()
                .current()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("No hay canciones en la cola"))?;
            // Se descarta aunque la cola esté en bucle
            session.queue.write().remove(0)?;
            session.failures.store(0, Ordering::Release);
            if session.queue.read().is_empty() {
                session.player.stop();
            }
            self.start_current(&session).await;
            return Ok(current);
        }
        let removed = session.queue.write().remove(index);
        removed
    }

    pub fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> Result<()> {
        self.require(guild_id)?.queue.write().move_track(from, to)
    }

    /// Limpia las próximas canciones, sin tocar la actual
    pub fn clear(&self, guild_id: GuildId) -> Result<usize> {
        Ok(self.require(guild_id)?.queue.write().clear())
    }

    pub fn remove_duplicates(&self, guild_id: GuildId) -> Result<usize> {
        Ok(self.require(guild_id)?.queue.write().remove_duplicates())
    }

    pub fn shuffle(&self, guild_id: GuildId) -> Result<()> {
        self.require(guild_id)?.queue.write().shuffle_upcoming();
        Ok(())
    }

    pub fn toggle_shuffle(&self, guild_id: GuildId) -> Result<bool> {
        Ok(self.require(guild_id)?.queue.write().toggle_shuffle())
    }

    pub fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> Result<()> {
        self.require(guild_id)?.queue.write().set_loop_mode(mode);
        Ok(())
    }

    pub fn toggle_radio(&self, guild_id: GuildId) -> Result<bool> {
        Ok(self.require(guild_id)?.queue.write().toggle_radio())
    }

    pub fn queue(&self, guild_id: GuildId) -> Result<QueueInfo> {
        Ok(self.require(guild_id)?.queue())
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<NowPlaying> {
        let session = self.session(guild_id)?;
        let track = session.player.current_track()?;
        Some(NowPlaying {
            track,
            status: session.player.status(),
            position: session.player.position(),
            duration: session.player.duration(),
        })
    }

    /// Sale del canal y destruye la sesión.
    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        if self.session(guild_id).is_none() {
            anyhow::bail!("No hay sesión de voz en guild {}", guild_id);
        }
        self.teardown(guild_id, "leave").await;
        Ok(())
    }

    /// Cierra todas las sesiones
    pub async fn shutdown(&self) {
        for guild_id in self.active_guilds() {
            self.teardown(guild_id, "shutdown").await;
        }
    }

    async fn teardown(&self, guild_id: GuildId, reason: &str) {
        let Some((_, session)) = self.sessions.remove(&guild_id) else {
            return;
        };
        session.cancel_idle();
        session.active.store(false, Ordering::Release);
        // Sin cola de silencio: la conexión se destruye a continuación
        session.player.stop_silent();
        session.connection.disconnect().await;
        info!("🧹 Sesión de guild {} cerrada: {}", guild_id, reason);
    }
}

async fn run_events(
    manager: Weak<GuildManager>,
    mut players: mpsc::UnboundedReceiver<PlayerEvent>,
    mut connections: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            Some(event) = players.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                tokio::spawn(async move { manager.on_player_event(event).await });
            }
            Some(event) = connections.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                tokio::spawn(async move { manager.on_connection_event(event).await });
            }
            else => break,
        }
    }
    debug!("Bucle de eventos del GuildManager terminado");
}
