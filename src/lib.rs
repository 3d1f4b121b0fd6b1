//! # Open Voice
//!
//! Voice transport and playback core for a Discord music bot: a native
//! voice gateway client (signaling WebSocket plus encrypted UDP), an
//! ffmpeg-backed Opus pipeline, per-guild players and queues driven by a
//! drift-free frame scheduler, and a best-effort download cache.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod voice;
