//! Voice gateway (v8) wire messages.
//!
//! Field names follow the platform's JSON exactly; do not rename.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

pub const GATEWAY_VERSION: u8 = 8;

pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

/// Código de cierre local usado cuando se pierden demasiados heartbeats.
pub const HEARTBEAT_TIMEOUT_CODE: u16 = 4900;

/// Qué hacer tras un cierre del canal de señalización
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Reintentar con Resume usando la sesión anterior
    Resume,
    /// El servidor descartó la sesión: Identify completo
    Reidentify,
    /// No reintentar
    Fatal,
}

pub fn classify_close(code: u16) -> CloseClass {
    match code {
        // Session no longer valid / session timeout
        4006 | 4009 => CloseClass::Reidentify,
        // Auth failed / server not found / disconnected / unknown encryption mode
        4004 | 4011 | 4014 | 4016 => CloseClass::Fatal,
        _ => CloseClass::Resume,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub t: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}

/// Mensaje tipado del canal de señalización
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePacket {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat(Heartbeat),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck { nonce: u64 },
    Resume(Resume),
    Hello(Hello),
    Resumed,
    ClientDisconnect(ClientDisconnect),
    Unknown { op: u8, d: Value },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
}

impl VoicePacket {
    pub fn op(&self) -> u8 {
        match self {
            VoicePacket::Identify(_) => opcode::IDENTIFY,
            VoicePacket::SelectProtocol(_) => opcode::SELECT_PROTOCOL,
            VoicePacket::Ready(_) => opcode::READY,
            VoicePacket::Heartbeat(_) => opcode::HEARTBEAT,
            VoicePacket::SessionDescription(_) => opcode::SESSION_DESCRIPTION,
            VoicePacket::Speaking(_) => opcode::SPEAKING,
            VoicePacket::HeartbeatAck { .. } => opcode::HEARTBEAT_ACK,
            VoicePacket::Resume(_) => opcode::RESUME,
            VoicePacket::Hello(_) => opcode::HELLO,
            VoicePacket::Resumed => opcode::RESUMED,
            VoicePacket::ClientDisconnect(_) => opcode::CLIENT_DISCONNECT,
            VoicePacket::Unknown { op, .. } => *op,
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        let d = match self {
            VoicePacket::Identify(p) => serde_json::to_value(p)?,
            VoicePacket::SelectProtocol(p) => serde_json::to_value(p)?,
            VoicePacket::Ready(p) => serde_json::to_value(p)?,
            VoicePacket::Heartbeat(p) => serde_json::to_value(p)?,
            VoicePacket::SessionDescription(p) => serde_json::to_value(p)?,
            VoicePacket::Speaking(p) => serde_json::to_value(p)?,
            VoicePacket::HeartbeatAck { nonce } => serde_json::json!({ "t": nonce }),
            VoicePacket::Resume(p) => serde_json::to_value(p)?,
            VoicePacket::Hello(p) => serde_json::to_value(p)?,
            VoicePacket::Resumed => Value::Null,
            VoicePacket::ClientDisconnect(p) => serde_json::to_value(p)?,
            VoicePacket::Unknown { d, .. } => d.clone(),
        };
        let envelope = Envelope {
            op: self.op(),
            d,
            seq: None,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parsea un mensaje de texto; devuelve también el `seq` si venía.
    pub fn from_json(text: &str) -> Result<(VoicePacket, Option<i64>), SignalingError> {
        let Envelope { op, d, seq } = serde_json::from_str(text)?;
        let packet = match op {
            opcode::IDENTIFY => VoicePacket::Identify(serde_json::from_value(d)?),
            opcode::SELECT_PROTOCOL => VoicePacket::SelectProtocol(serde_json::from_value(d)?),
            opcode::READY => VoicePacket::Ready(serde_json::from_value(d)?),
            opcode::HEARTBEAT => VoicePacket::Heartbeat(serde_json::from_value(d)?),
            opcode::SESSION_DESCRIPTION => {
                VoicePacket::SessionDescription(serde_json::from_value(d)?)
            }
            opcode::SPEAKING => VoicePacket::Speaking(serde_json::from_value(d)?),
            opcode::HEARTBEAT_ACK => {
                // v4 manda el nonce tal cual, v8 lo envuelve en {"t": nonce}
                let nonce = d
                    .as_u64()
                    .or_else(|| d.get("t").and_then(Value::as_u64))
                    .ok_or_else(|| SignalingError::Unexpected(format!("heartbeat ack without nonce: {d}")))?;
                VoicePacket::HeartbeatAck { nonce }
            }
            opcode::RESUME => VoicePacket::Resume(serde_json::from_value(d)?),
            opcode::HELLO => VoicePacket::Hello(serde_json::from_value(d)?),
            opcode::RESUMED => VoicePacket::Resumed,
            opcode::CLIENT_DISCONNECT => VoicePacket::ClientDisconnect(serde_json::from_value(d)?),
            op => VoicePacket::Unknown { op, d },
        };
        Ok((packet, seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn as_value(packet: &VoicePacket) -> Value {
        serde_json::from_str(&packet.to_json().unwrap()).unwrap()
    }

    #[test]
    fn identify_wire_format() {
        let packet = VoicePacket::Identify(Identify {
            server_id: "41771983423143937".into(),
            user_id: "104694319306248192".into(),
            session_id: "my_session_id".into(),
            token: "my_token".into(),
        });
        assert_eq!(
            as_value(&packet),
            json!({"op": 0, "d": {
                "server_id": "41771983423143937",
                "user_id": "104694319306248192",
                "session_id": "my_session_id",
                "token": "my_token"
            }})
        );
    }

    #[test]
    fn select_protocol_wire_format() {
        let packet = VoicePacket::SelectProtocol(SelectProtocol {
            protocol: "udp".into(),
            data: SelectProtocolData {
                address: "127.0.0.1".into(),
                port: 1337,
                mode: "xsalsa20_poly1305_lite".into(),
            },
        });
        assert_eq!(
            as_value(&packet),
            json!({"op": 1, "d": {"protocol": "udp", "data": {
                "address": "127.0.0.1", "port": 1337, "mode": "xsalsa20_poly1305_lite"
            }}})
        );
    }

    #[test]
    fn parses_ready_and_session_description() {
        let (packet, seq) = VoicePacket::from_json(
            r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":1234,"modes":["xsalsa20_poly1305"],"heartbeat_interval":1}}"#,
        )
        .unwrap();
        assert_eq!(seq, None);
        assert!(matches!(packet, VoicePacket::Ready(Ready { ssrc: 1, port: 1234, .. })));

        let (packet, seq) = VoicePacket::from_json(
            r#"{"op":4,"seq":7,"d":{"mode":"xsalsa20_poly1305_lite","secret_key":[1,2,3]}}"#,
        )
        .unwrap();
        assert_eq!(seq, Some(7));
        assert_eq!(
            packet,
            VoicePacket::SessionDescription(SessionDescription {
                mode: "xsalsa20_poly1305_lite".into(),
                secret_key: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn heartbeat_ack_accepts_both_versions() {
        let (v4, _) = VoicePacket::from_json(r#"{"op":6,"d":1501184119561}"#).unwrap();
        let (v8, _) = VoicePacket::from_json(r#"{"op":6,"d":{"t":1501184119561}}"#).unwrap();
        assert_eq!(v4, VoicePacket::HeartbeatAck { nonce: 1501184119561 });
        assert_eq!(v4, v8);
    }

    #[test]
    fn resumed_and_unknown_ops() {
        let (packet, _) = VoicePacket::from_json(r#"{"op":9,"d":null}"#).unwrap();
        assert_eq!(packet, VoicePacket::Resumed);
        let (packet, _) = VoicePacket::from_json(r#"{"op":18,"d":{"any":1}}"#).unwrap();
        assert_eq!(packet.op(), 18);
    }

    #[test]
    fn close_codes_are_classified() {
        assert_eq!(classify_close(4006), CloseClass::Reidentify);
        assert_eq!(classify_close(4009), CloseClass::Reidentify);
        assert_eq!(classify_close(4014), CloseClass::Fatal);
        assert_eq!(classify_close(4004), CloseClass::Fatal);
        assert_eq!(classify_close(1006), CloseClass::Resume);
        assert_eq!(classify_close(4015), CloseClass::Resume);
        assert_eq!(classify_close(HEARTBEAT_TIMEOUT_CODE), CloseClass::Resume);
    }
}
