use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::{
    audio::{
        filters::FilterChain,
        resource::{AudioResource, ResourceRequest},
    },
    config::Config,
    error::PlaybackError,
    scheduler::{CycleHandler, CycleScheduler},
    sources::Track,
    voice::FrameSink,
};

/// Frame Opus de silencio
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
const SILENCE_FRAMES: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Wait,
    Playing,
    Pause,
    Error,
}

#[derive(Debug, Clone)]
pub enum PlayerEventKind {
    /// El recurso se agotó de forma natural
    Finished,
    /// `stop()` explícito
    Stopped,
    Error(PlaybackError),
}

#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub guild_id: GuildId,
    /// URL del track que sonaba cuando se emitió el evento
    pub url: Option<String>,
    pub kind: PlayerEventKind,
}

/// Resultado de un `play` que no falló.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// Un `play`/`stop` posterior lo reemplazó antes de sonar
    Superseded,
}

/// Reproductor de un guild: a lo sumo un recurso de audio activo.
pub struct Player {
    guild_id: GuildId,
    config: Arc<Config>,
    sink: Arc<dyn FrameSink>,
    scheduler: CycleScheduler<Player>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    this: Weak<Player>,

    status: Mutex<PlayerStatus>,
    resource: Mutex<Option<Arc<AudioResource>>>,
    current: Mutex<Option<(Track, String)>>,
    filters: Mutex<FilterChain>,
    generation: AtomicU64,
    silence_left: AtomicU8,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        config: Arc<Config>,
        sink: Arc<dyn FrameSink>,
        scheduler: CycleScheduler<Player>,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            guild_id,
            config,
            sink,
            scheduler,
            events,
            this: this.clone(),
            status: Mutex::new(PlayerStatus::Wait),
            resource: Mutex::new(None),
            current: Mutex::new(None),
            filters: Mutex::new(FilterChain::new()),
            generation: AtomicU64::new(0),
            silence_left: AtomicU8::new(0),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn status(&self) -> PlayerStatus {
        *self.status.lock()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.current.lock().as_ref().map(|(track, _)| track.clone())
    }

    /// Posición actual dentro de la pista
    pub fn position(&self) -> Duration {
        self.resource
            .lock()
            .as_ref()
            .map(|r| r.elapsed())
            .unwrap_or_default()
    }

    /// Duración efectiva: la del track dividida por la velocidad de los filtros
    pub fn duration(&self) -> Duration {
        let speed = self.filters.lock().speed();
        self.current
            .lock()
            .as_ref()
            .map(|(track, _)| track.duration().div_f64(speed.max(f64::EPSILON)))
            .unwrap_or_default()
    }

    pub fn filters(&self) -> FilterChain {
        self.filters.lock().clone()
    }

    /// Reproduce `track` desde `locator`, reemplazando lo que hubiera.
    ///
    /// Vuelve cuando el recurso es legible (o falla). Un `play`/`stop`
    /// posterior invalida este intento y lo devuelve como [`PlayOutcome::Superseded`].
    pub async fn play(&self, track: Track, locator: String, seek: Duration) -> Result<PlayOutcome, PlaybackError> {
        let generation = self.begin_attempt();
        let request = ResourceRequest {
            locator: locator.clone(),
            seek,
            filters: self.filters.lock().clone(),
        };

        match AudioResource::spawn(&self.config, &request) {
            Ok(resource) => self.start(generation, (track, locator), resource).await,
            Err(e) => Err(self.fail_start(generation, e.into())),
        }
    }

    /// Igual que [`Player::play`] pero con un recurso ya construido.
    pub async fn play_resource(
        &self,
        track: Track,
        locator: String,
        resource: AudioResource,
    ) -> Result<PlayOutcome, PlaybackError> {
        let generation = self.begin_attempt();
        self.start(generation, (track, locator), resource).await
    }

    fn begin_attempt(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.release_resource();
        *self.current.lock() = None;
        *self.status.lock() = PlayerStatus::Wait;
        generation
    }

    async fn start(
        &self,
        generation: u64,
        current: (Track, String),
        resource: AudioResource,
    ) -> Result<PlayOutcome, PlaybackError> {
        let resource = Arc::new(resource);
        *self.resource.lock() = Some(resource.clone());

        let ready = resource.wait_readable(self.config.resource_ready_timeout).await;

        // Otro play/stop llegó mientras esperábamos
        if self.generation.load(Ordering::Acquire) != generation {
            resource.destroy();
            debug!("Reproducción de '{}' reemplazada en guild {}", current.0.title, self.guild_id);
            return Ok(PlayOutcome::Superseded);
        }

        if let Err(e) = ready {
            self.release_resource();
            return Err(self.fail_start(generation, e.into()));
        }

        info!("🎵 Reproduciendo en guild {}: {}", self.guild_id, current.0.title);
        *self.current.lock() = Some(current);
        *self.status.lock() = PlayerStatus::Playing;
        self.silence_left.store(0, Ordering::Release);
        self.sink.set_speaking(true);
        self.register();
        Ok(PlayOutcome::Started)
    }

    fn fail_start(&self, generation: u64, err: PlaybackError) -> PlaybackError {
        if self.generation.load(Ordering::Acquire) == generation {
            *self.status.lock() = if err.is_fatal() {
                PlayerStatus::Error
            } else {
                PlayerStatus::Wait
            };
        }
        warn!("⚠️ No se pudo iniciar la reproducción en guild {}: {}", self.guild_id, err);
        err
    }

    /// Pausa. Sólo tiene efecto si está reproduciendo.
    pub fn pause(&self) -> bool {
        {
            let mut status = self.status.lock();
            if *status != PlayerStatus::Playing {
                return false;
            }
            *status = PlayerStatus::Pause;
        }
        self.begin_silence();
        info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
        true
    }

    /// Reanuda. Sólo tiene efecto si está en pausa.
    pub fn resume(&self) -> bool {
        {
            let mut status = self.status.lock();
            if *status != PlayerStatus::Pause {
                return false;
            }
            *status = PlayerStatus::Playing;
        }
        self.silence_left.store(0, Ordering::Release);
        self.sink.set_speaking(true);
        self.register();
        info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
        true
    }

    /// Destruye el recurso y vuelve a `Wait`. Devuelve si había algo que parar.
    pub fn stop(&self) -> bool {
        self.halt(true)
    }

    /// Como [`Player::stop`] pero sin cola de silencio: el player sale del
    /// scheduler y no vuelve. Para cuando la conexión se va a destruir.
    pub fn stop_silent(&self) -> bool {
        self.halt(false)
    }

    fn halt(&self, silence_tail: bool) -> bool {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let previous = std::mem::replace(&mut *self.status.lock(), PlayerStatus::Wait);
        let had_resource = self.release_resource();
        let url = self.current.lock().take().map(|(track, _)| track.url);

        if silence_tail && previous == PlayerStatus::Playing {
            self.begin_silence();
        } else if !silence_tail {
            self.silence_left.store(0, Ordering::Release);
        }
        if had_resource || previous != PlayerStatus::Wait {
            debug!("⏹️ Reproducción detenida en guild {}", self.guild_id);
            self.emit(url, PlayerEventKind::Stopped);
            return true;
        }
        false
    }

    /// Reinicia la pista actual en `position`.
    pub async fn seek(&self, position: Duration) -> Result<PlayOutcome, PlaybackError> {
        let Some((track, locator)) = self.current.lock().clone() else {
            return Err(PlaybackError::Rejected("nothing is playing".to_string()));
        };
        if track.duration > 0 && position >= track.duration() {
            return Err(PlaybackError::Rejected(format!(
                "position {}s is past the end of the track",
                position.as_secs()
            )));
        }
        info!("⏩ Seek a {}s en guild {}", position.as_secs(), self.guild_id);
        self.play(track, locator, position).await
    }

    /// Cambia los filtros; si hay algo sonando se reinicia en la posición actual.
    pub async fn set_filters(&self, filters: FilterChain) -> Result<(), PlaybackError> {
        let position = self.position();
        *self.filters.lock() = filters;
        match self.status() {
            PlayerStatus::Playing | PlayerStatus::Pause => self.seek(position).await.map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Quita el recurso del scheduler y lo destruye, en ese orden.
    fn release_resource(&self) -> bool {
        if let Some(this) = self.this.upgrade() {
            self.scheduler.remove(&this);
        }
        match self.resource.lock().take() {
            Some(resource) => {
                resource.destroy();
                true
            }
            None => false,
        }
    }

    fn register(&self) {
        if let Some(this) = self.this.upgrade() {
            self.scheduler.add(this);
        }
    }

    fn begin_silence(&self) {
        self.silence_left.store(SILENCE_FRAMES, Ordering::Release);
        self.register();
    }

    fn current_url(&self) -> Option<String> {
        self.current.lock().as_ref().map(|(track, _)| track.url.clone())
    }

    fn emit(&self, url: Option<String>, kind: PlayerEventKind) {
        let _ = self.events.send(PlayerEvent {
            guild_id: self.guild_id,
            url,
            kind,
        });
    }

    /// ¿Hay algo que hacer en este tick?
    fn wants_tick(&self) -> bool {
        if self.silence_left.load(Ordering::Acquire) > 0 {
            return true;
        }
        self.status() == PlayerStatus::Playing && self.sink.is_ready()
    }

    /// Un tick del scheduler: como mucho un frame hacia la conexión.
    pub async fn tick(&self) -> Result<(), PlaybackError> {
        if self.silence_left.load(Ordering::Acquire) > 0 && self.status() != PlayerStatus::Playing {
            let _ = self.sink.send_frame(&SILENCE_FRAME).await;
            if self.silence_left.fetch_sub(1, Ordering::AcqRel) == 1 && self.status() != PlayerStatus::Playing {
                if let Some(this) = self.this.upgrade() {
                    self.scheduler.remove(&this);
                }
                self.sink.set_speaking(false);
            }
            return Ok(());
        }

        if self.status() != PlayerStatus::Playing {
            return Ok(());
        }
        let Some(resource) = self.resource.lock().clone() else {
            return Ok(());
        };

        match resource.pull() {
            Some(frame) => {
                if let Err(e) = self.sink.send_frame(&frame).await {
                    error!("❌ Error enviando audio en guild {}: {}", self.guild_id, e);
                    let err = PlaybackError::from(e);
                    self.release_resource();
                    *self.status.lock() = PlayerStatus::Error;
                    self.emit(self.current_url(), PlayerEventKind::Error(err.clone()));
                    return Err(err);
                }
            }
            None if resource.is_ended() => self.finish(&resource),
            None => trace!("Sin frame disponible en guild {}", self.guild_id),
        }
        Ok(())
    }

    fn finish(&self, resource: &Arc<AudioResource>) {
        // Sólo si sigue siendo el recurso activo
        let is_current = self
            .resource
            .lock()
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(r, resource));
        if !is_current {
            return;
        }

        let error = resource.take_error();
        self.release_resource();
        let url = self.current.lock().take().map(|(track, _)| track.url);
        *self.status.lock() = PlayerStatus::Wait;
        self.begin_silence();

        match error {
            Some(e) => {
                warn!("⚠️ Stream terminado con error en guild {}: {}", self.guild_id, e);
                self.emit(url, PlayerEventKind::Error(e.into()));
            }
            None => {
                debug!("✅ Pista terminada en guild {}", self.guild_id);
                self.emit(url, PlayerEventKind::Finished);
            }
        }
    }
}

/// Handler del scheduler de frames: un frame por reproductor y tick.
pub struct FrameTicker;

#[async_trait]
impl CycleHandler<Player> for FrameTicker {
    fn filter(&self, player: &Player) -> bool {
        player.wants_tick()
    }

    async fn execute(&self, player: Arc<Player>) -> anyhow::Result<()> {
        player.tick().await?;
        Ok(())
    }
}

pub fn frame_scheduler(config: &Config) -> CycleScheduler<Player> {
    CycleScheduler::new(
        "frames",
        config.frame_duration(),
        crate::scheduler::CycleMode::Multi,
        Arc::new(FrameTicker),
    )
}
