//! Audio resource pipeline.
//!
//! An ffmpeg subprocess decodes, filters and re-encodes the input to Ogg/Opus
//! on stdout; a reader task demuxes it into 20 ms frames and buffers a few of
//! them ahead of the player in a bounded channel.

use bytes::Bytes;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::filters::FilterChain;
use super::ogg::OggDemuxer;
use crate::config::{Config, SAMPLE_RATE};
use crate::error::PipelineError;

/// Qué reproducir y cómo.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub locator: String,
    pub seek: Duration,
    pub filters: FilterChain,
}

/// Argumentos de ffmpeg para una petición.
pub fn ffmpeg_args(config: &Config, request: &ResourceRequest) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if request.locator.starts_with("http://") || request.locator.starts_with("https://") {
        args.extend(
            ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    if !request.seek.is_zero() {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", request.seek.as_secs_f64()));
    }
    args.push("-i".to_string());
    args.push(request.locator.clone());
    args.push("-vn".to_string());
    if let Some(chain) = request.filters.to_ffmpeg_arg() {
        args.push("-af".to_string());
        args.push(chain);
    }
    args.extend([
        "-ac".to_string(),
        "2".to_string(),
        "-ar".to_string(),
        SAMPLE_RATE.to_string(),
        "-c:a".to_string(),
        "libopus".to_string(),
        "-b:a".to_string(),
        config.opus_bitrate.to_string(),
        "-frame_duration".to_string(),
        config.frame_duration_ms.to_string(),
        "-application".to_string(),
        "audio".to_string(),
        "-f".to_string(),
        "ogg".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

#[derive(Default)]
struct Shared {
    error: Mutex<Option<PipelineError>>,
}

/// Fuente de frames Opus para una reproducción concreta.
pub struct AudioResource {
    frames: flume::Receiver<Bytes>,
    readable: watch::Receiver<bool>,
    shared: Arc<Shared>,
    ended: AtomicBool,
    pulled: AtomicU64,
    frame_duration: Duration,
    offset: Duration,
    speed: f64,
    cancel: CancellationToken,
}

impl AudioResource {
    /// Lanza ffmpeg para `request`. Falla sólo si el proceso no arranca.
    pub fn spawn(config: &Config, request: &ResourceRequest) -> Result<Self, PipelineError> {
        let args = ffmpeg_args(config, request);
        trace!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PipelineError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Decode("ffmpeg stdout not captured".to_string()))?;
        let stderr = child.stderr.take();
        debug!("🎵 ffmpeg lanzado para {}", request.locator);

        Ok(Self::start(
            stdout,
            Some((child, stderr)),
            config,
            request.seek,
            request.filters.speed(),
        ))
    }

    /// Crea un recurso a partir de un stream Ogg/Opus ya codificado.
    pub fn from_reader<R>(reader: R, config: &Config, speed: f64) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::start(reader, None, config, Duration::ZERO, speed)
    }

    fn start<R>(
        reader: R,
        child: Option<(Child, Option<ChildStderr>)>,
        config: &Config,
        offset: Duration,
        speed: f64,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, frames) = flume::bounded(config.frame_buffer.max(1));
        let (readable_tx, readable) = watch::channel(false);
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();

        tokio::spawn(pump(reader, child, tx, readable_tx, shared.clone(), cancel.clone()));

        Self {
            frames,
            readable,
            shared,
            ended: AtomicBool::new(false),
            pulled: AtomicU64::new(0),
            frame_duration: config.frame_duration(),
            offset,
            speed,
            cancel,
        }
    }

    /// Espera al primer frame. Error si no llega a tiempo o el proceso falla antes.
    pub async fn wait_readable(&self, timeout: Duration) -> Result<(), PipelineError> {
        let mut readable = self.readable.clone();
        let outcome = tokio::time::timeout(timeout, readable.wait_for(|r| *r))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self
                .take_error()
                .unwrap_or_else(|| PipelineError::Decode("no audio produced".to_string()))),
            Err(_) => Err(PipelineError::StreamTimeout(timeout)),
        }
    }

    pub fn is_readable(&self) -> bool {
        *self.readable.borrow()
    }

    /// Siguiente frame disponible, `None` si todavía no hay ninguno o si terminó.
    pub fn pull(&self) -> Option<Bytes> {
        if self.ended.load(Ordering::Acquire) {
            return None;
        }
        match self.frames.try_recv() {
            Ok(frame) => {
                self.pulled.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                self.ended.store(true, Ordering::Release);
                None
            }
        }
    }

    /// `true` cuando ya no se producirán más frames.
    pub fn is_ended(&self) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return true;
        }
        if self.frames.is_disconnected() && self.frames.is_empty() {
            self.ended.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Error que terminó el stream, si lo hubo.
    pub fn take_error(&self) -> Option<PipelineError> {
        self.shared.error.lock().take()
    }

    pub fn frames_pulled(&self) -> u64 {
        self.pulled.load(Ordering::Relaxed)
    }

    /// Posición en la pista: offset inicial + frames × duración × velocidad.
    pub fn elapsed(&self) -> Duration {
        let played = self.frame_duration.as_nanos() as f64 * self.frames_pulled() as f64 * self.speed;
        self.offset + Duration::from_nanos(played.round() as u64)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Mata el proceso y libera el buffer. Idempotente.
    pub fn destroy(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.ended.store(true, Ordering::Release);
        self.cancel.cancel();
        let dropped = self.frames.drain().count();
        trace!("Recurso destruido ({} frames descartados)", dropped);
    }
}

impl Drop for AudioResource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump<R>(
    reader: R,
    child: Option<(Child, Option<ChildStderr>)>,
    tx: flume::Sender<Bytes>,
    readable: watch::Sender<bool>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let (mut child, stderr) = match child {
        Some((child, stderr)) => (Some(child), stderr),
        None => (None, None),
    };
    let stderr_task = stderr.map(|stderr| tokio::spawn(read_stderr(stderr)));

    let mut demuxer = OggDemuxer::new(reader);
    let mut produced: u64 = 0;
    let mut result: Result<(), PipelineError> = loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            packet = demuxer.next_packet() => packet,
        };
        match packet {
            Ok(Some(frame)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    sent = tx.send_async(frame) => if sent.is_err() { break Ok(()) },
                }
                produced += 1;
                if produced == 1 {
                    readable.send_replace(true);
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Some(child) = child.as_mut() {
        if cancel.is_cancelled() {
            let _ = child.start_kill();
        }
        match child.wait().await {
            Ok(status) if !status.success() && !cancel.is_cancelled() && result.is_ok() => {
                let detail = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                result = Err(PipelineError::Decode(format!(
                    "ffmpeg exited with {status}: {}",
                    detail.trim()
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("No se pudo esperar a ffmpeg: {}", e),
        }
    }

    if result.is_ok() && produced == 0 && !cancel.is_cancelled() {
        result = Err(PipelineError::Decode("no audio frames produced".to_string()));
    }
    if let Err(e) = result {
        debug!("Pipeline terminado con error: {}", e);
        *shared.error.lock() = Some(e);
    } else {
        trace!("Pipeline terminado ({} frames)", produced);
    }
}

/// Lee stderr completo y devuelve el final (ffmpeg con -loglevel error es breve).
async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf).await;
    let text = String::from_utf8_lossy(&buf);
    let start = text.len().saturating_sub(512);
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}
