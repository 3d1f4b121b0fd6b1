//! # Voice Module
//!
//! Native implementation of the platform's voice protocol.
//!
//! - [`ws`]: signaling WebSocket with heartbeats
//! - [`udp`]: UDP media transport (IP discovery, keep-alive, RTP)
//! - [`crypto`]: packet encryption for the negotiated mode
//! - [`connection`]: per-guild state machine that ties them together

pub mod connection;
pub mod crypto;
pub mod payload;
pub mod udp;
pub mod ws;

pub use connection::{
    ConnectionEvent, ConnectionStatus, FrameSink, GatewayBridge, VoiceConnection, VoiceServerInfo,
};
