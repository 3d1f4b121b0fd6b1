//! Error types for the voice transport and playback engine.
//!
//! Low-level components (codec, transport, signaling) only return these
//! typed errors; retry/skip/destroy policy lives in the voice connection
//! and the player.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("secret key must be 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("unsupported encryption mode: {0}")]
    UnsupportedMode(String),

    #[error("packet too short to hold a nonce")]
    PacketTooShort,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("UDP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IP discovery failed: {0}")]
    Discovery(String),

    #[error("transport has no session key yet")]
    NoSession,

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected packet: {0}")]
    Unexpected(String),

    #[error("signaling channel closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("join failed: {0}")]
    Join(String),

    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),

    #[error("closed by server with code {0}")]
    FatalClose(u16),

    #[error("connection destroyed")]
    Destroyed,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to spawn decoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("stream timeout: no audio after {0:?}")]
    StreamTimeout(Duration),

    #[error("resource destroyed")]
    Destroyed,
}

impl PipelineError {
    /// Spawn, decode and readiness failures only cost the current track.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Spawn(_) | PipelineError::Decode(_) | PipelineError::StreamTimeout(_)
        )
    }
}

/// Error reportado por el reproductor, ya clasificado.
#[derive(Error, Debug, Clone)]
pub enum PlaybackError {
    /// Saltar la canción actual y continuar con la cola
    #[error("recoverable playback error: {0}")]
    Recoverable(String),

    /// Desmontar toda la sesión del guild
    #[error("fatal playback error: {0}")]
    Fatal(String),

    /// Petición inválida (seek fuera de rango, nada sonando); no toca la reproducción
    #[error("rejected: {0}")]
    Rejected(String),
}

impl PlaybackError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlaybackError::Fatal(_))
    }
}

impl From<PipelineError> for PlaybackError {
    fn from(err: PipelineError) -> Self {
        if err.is_recoverable() {
            PlaybackError::Recoverable(err.to_string())
        } else {
            PlaybackError::Fatal(err.to_string())
        }
    }
}

impl From<VoiceError> for PlaybackError {
    fn from(err: VoiceError) -> Self {
        PlaybackError::Fatal(err.to_string())
    }
}
