//! # Audio Module
//!
//! Everything between a media locator and the Opus frames handed to a voice
//! connection.
//!
//! ### [`resource`] - Audio Resource
//! - Spawns ffmpeg with the seek offset and filter chain
//! - Demuxes its Ogg output ([`ogg`]) into a bounded frame buffer
//! - Signals readiness on the first frame, times out otherwise
//!
//! ### [`player`] - Playback Engine
//! - `wait` / `playing` / `pause` / `error` per guild
//! - Pulls one frame per scheduler tick and sends it to the [`FrameSink`](crate::voice::FrameSink)
//! - Classifies failures as recoverable (skip) or fatal (tear down)
//!
//! ### [`queue`] - Queue Engine
//! - Index 0 is always the track being played
//! - Loop modes, shuffle and radio
//!
//! ### [`filters`]
//! - ffmpeg audio filter catalog; some filters change playback speed
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo
//! - **Codec**: Opus, 20ms frames by default

pub mod filters;
pub mod ogg;
pub mod player;
pub mod queue;
pub mod resource;
