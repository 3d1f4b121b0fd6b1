//! WebSocket signaling channel for one voice session.
//!
//! Owns the socket, heartbeats once `Hello` arrives and reports everything
//! upward as [`SignalingEvent`]s. It never reconnects on its own.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::payload::{Heartbeat, VoicePacket, GATEWAY_VERSION, HEARTBEAT_TIMEOUT_CODE};
use crate::error::SignalingError;

/// Eventos emitidos por el canal de señalización
#[derive(Debug)]
pub enum SignalingEvent {
    Open,
    Packet(VoicePacket),
    Close { code: u16, reason: String },
    Error(SignalingError),
}

enum Outbound {
    Message(Message),
    Close(u16, String),
}

/// Handle to a running signaling connection.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    last_seq: Arc<AtomicI64>,
    ping_ms: Arc<AtomicU64>,
}

/// Intervalo de heartbeat más largo que se acepta en `Hello`
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(600);
const PROTOCOL_ERROR_CODE: u16 = 1002;

/// Convierte el `heartbeat_interval` (ms) de `Hello` en un periodo válido.
pub fn heartbeat_period(interval_ms: f64) -> Result<Duration, SignalingError> {
    let invalid = || SignalingError::Unexpected(format!("invalid heartbeat_interval {interval_ms}"));
    if !interval_ms.is_finite() || interval_ms <= 0.0 {
        return Err(invalid());
    }
    let period = Duration::try_from_secs_f64(interval_ms / 1000.0).map_err(|_| invalid())?;
    if period.is_zero() || period > MAX_HEARTBEAT_INTERVAL {
        return Err(invalid());
    }
    Ok(period)
}

/// Construye la URL del gateway de voz a partir del endpoint recibido.
pub fn endpoint_url(endpoint: &str) -> Result<Url, SignalingError> {
    let mut url = if endpoint.contains("://") {
        Url::parse(endpoint)?
    } else {
        Url::parse(&format!("wss://{}", endpoint.trim_end_matches(":80")))?
    };
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &GATEWAY_VERSION.to_string());
    Ok(url)
}

impl SignalingChannel {
    /// Abre el WebSocket y arranca la tarea que lo atiende.
    pub async fn connect(
        endpoint: &str,
        miss_limit: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let url = endpoint_url(endpoint)?;
        debug!("📡 Conectando al gateway de voz: {}", url);
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let last_seq = Arc::new(AtomicI64::new(-1));
        let ping_ms = Arc::new(AtomicU64::new(0));

        let _ = events_tx.send(SignalingEvent::Open);

        let driver = Driver {
            events: events_tx,
            last_seq: last_seq.clone(),
            ping_ms: ping_ms.clone(),
            miss_limit,
            heartbeat: None,
            nonce: 0,
            unacked: 0,
            sent_at: None,
        };
        tokio::spawn(driver.run(stream, outbound_rx, cancel.clone()));

        Ok((
            Self {
                outbound: outbound_tx,
                cancel,
                last_seq,
                ping_ms,
            },
            events_rx,
        ))
    }

    pub fn send(&self, packet: &VoicePacket) -> Result<(), SignalingError> {
        let json = packet.to_json()?;
        trace!("➡️ op {}: {}", packet.op(), json);
        self.outbound
            .send(Outbound::Message(Message::Text(json.into())))
            .map_err(|_| SignalingError::Closed)
    }

    /// Cierra el socket con el código indicado.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
    }

    /// Último `seq` recibido del servidor (para Resume/heartbeats).
    pub fn last_seq(&self) -> Option<i64> {
        match self.last_seq.load(Ordering::Relaxed) {
            seq if seq >= 0 => Some(seq),
            _ => None,
        }
    }

    /// Latencia del último heartbeat confirmado, en ms.
    pub fn ping(&self) -> Option<u64> {
        match self.ping_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    events: mpsc::UnboundedSender<SignalingEvent>,
    last_seq: Arc<AtomicI64>,
    ping_ms: Arc<AtomicU64>,
    miss_limit: u32,
    heartbeat: Option<Interval>,
    nonce: u64,
    unacked: u32,
    sent_at: Option<Instant>,
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

impl Driver {
    async fn run<S>(
        mut self,
        stream: S,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();

        let (code, reason) = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(close_message(1000, "client closed")).await;
                    break (1000, "client closed".to_string());
                }
                Some(out) = outbound.recv() => match out {
                    Outbound::Message(msg) => {
                        if let Err(e) = write.send(msg).await {
                            warn!("Error escribiendo en el gateway de voz: {}", e);
                            let _ = self.events.send(SignalingEvent::Error(e.into()));
                            break (1006, "write failed".to_string());
                        }
                    }
                    Outbound::Close(code, reason) => {
                        let _ = write.send(close_message(code, &reason)).await;
                        break (code, reason);
                    }
                },
                _ = next_heartbeat(&mut self.heartbeat) => {
                    if self.unacked >= self.miss_limit {
                        warn!("💔 {} heartbeats sin respuesta, cerrando", self.unacked);
                        let _ = write.send(close_message(HEARTBEAT_TIMEOUT_CODE, "heartbeat timeout")).await;
                        break (HEARTBEAT_TIMEOUT_CODE, "heartbeat timeout".to_string());
                    }
                    if let Err(e) = self.send_heartbeat(&mut write).await {
                        let _ = self.events.send(SignalingEvent::Error(e));
                        break (1006, "write failed".to_string());
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = self.handle_text(text.as_str()) {
                            warn!("❌ Error de protocolo en el gateway de voz: {}", e);
                            let reason = e.to_string();
                            let _ = self.events.send(SignalingEvent::Error(e));
                            let _ = write.send(close_message(PROTOCOL_ERROR_CODE, "protocol error")).await;
                            break (PROTOCOL_ERROR_CODE, reason);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (1005, String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = self.events.send(SignalingEvent::Error(e.into()));
                        break (1006, "read failed".to_string());
                    }
                    None => break (1006, "stream ended".to_string()),
                },
            }
        };

        debug!("📡 Gateway de voz cerrado: code={} reason='{}'", code, reason);
        let _ = self.events.send(SignalingEvent::Close { code, reason });
    }

    async fn send_heartbeat<W>(&mut self, write: &mut W) -> Result<(), SignalingError>
    where
        W: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        self.nonce += 1;
        let seq = self.last_seq.load(Ordering::Relaxed);
        let packet = VoicePacket::Heartbeat(Heartbeat {
            t: self.nonce,
            seq_ack: (seq >= 0).then_some(seq),
        });
        write.send(Message::Text(packet.to_json()?.into())).await?;
        self.unacked += 1;
        self.sent_at = Some(Instant::now());
        trace!("💓 heartbeat {} enviado", self.nonce);
        Ok(())
    }

    /// Procesa un mensaje de texto. `Err` sólo si la sesión no puede continuar.
    fn handle_text(&mut self, text: &str) -> Result<(), SignalingError> {
        let (packet, seq) = match VoicePacket::from_json(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Mensaje de voz inválido: {} - {}", e, text);
                let _ = self.events.send(SignalingEvent::Error(e));
                return Ok(());
            }
        };
        if let Some(seq) = seq {
            self.last_seq.store(seq, Ordering::Relaxed);
        }

        match &packet {
            VoicePacket::Hello(hello) => {
                let period = heartbeat_period(hello.heartbeat_interval)?;
                debug!("👋 Hello: heartbeat cada {:?}", period);
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
                self.unacked = 0;
            }
            VoicePacket::HeartbeatAck { nonce } if *nonce == self.nonce => {
                self.unacked = 0;
                if let Some(sent) = self.sent_at.take() {
                    let ms = sent.elapsed().as_millis().max(1) as u64;
                    self.ping_ms.store(ms, Ordering::Relaxed);
                }
            }
            VoicePacket::HeartbeatAck { nonce } => {
                trace!("ACK de heartbeat viejo ({} != {})", nonce, self.nonce);
            }
            _ => {}
        }

        let _ = self.events.send(SignalingEvent::Packet(packet));
        Ok(())
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::payload::{opcode, Hello};
    use tokio::net::TcpListener;

    async fn serve<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    fn hello(ms: f64) -> Message {
        let json = VoicePacket::Hello(Hello { heartbeat_interval: ms }).to_json().unwrap();
        Message::Text(json.into())
    }

    async fn next_close(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> (u16, Vec<u8>) {
        let mut ops = Vec::new();
        loop {
            match rx.recv().await.expect("channel ended without close") {
                SignalingEvent::Close { code, .. } => return (code, ops),
                SignalingEvent::Packet(p) => ops.push(p.op()),
                _ => {}
            }
        }
    }

    #[test]
    fn builds_versioned_endpoint() {
        // El puerto por defecto de wss desaparece; los demás se conservan
        let url = endpoint_url("eu-west123.discord.media:443").unwrap();
        assert_eq!(url.as_str(), "wss://eu-west123.discord.media/?v=8");
        let url = endpoint_url("eu-west123.discord.media:2053").unwrap();
        assert_eq!(url.as_str(), "wss://eu-west123.discord.media:2053/?v=8");
        assert_eq!(url.port(), Some(2053));
        let url = endpoint_url("ws://127.0.0.1:9000").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/?v=8");
    }

    #[test]
    fn rejects_unusable_heartbeat_intervals() {
        assert_eq!(heartbeat_period(41_250.0).unwrap(), Duration::from_millis(41_250));
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY, 1e300] {
            assert!(heartbeat_period(bad).is_err(), "{bad} accepted");
        }
    }

    #[tokio::test]
    async fn invalid_hello_closes_with_protocol_error() {
        let endpoint = serve(|mut ws| async move {
            ws.send(hello(-5.0)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (_channel, mut rx) = SignalingChannel::connect(&endpoint, 3).await.unwrap();
        let mut saw_error = false;
        let code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.expect("channel ended without close") {
                    SignalingEvent::Error(SignalingError::Unexpected(_)) => saw_error = true,
                    SignalingEvent::Close { code, .. } => return code,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_error);
        assert_eq!(code, PROTOCOL_ERROR_CODE);
    }

    #[tokio::test]
    async fn closes_after_missed_heartbeats() {
        let endpoint = serve(|mut ws| async move {
            ws.send(hello(20.0)).await.unwrap();
            // Nunca responde a los heartbeats
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let (_channel, mut rx) = SignalingChannel::connect(&endpoint, 3).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SignalingEvent::Open)));
        let (code, ops) = tokio::time::timeout(Duration::from_secs(5), next_close(&mut rx))
            .await
            .unwrap();
        assert_eq!(code, HEARTBEAT_TIMEOUT_CODE);
        assert_eq!(ops, vec![opcode::HELLO]);
    }

    #[tokio::test]
    async fn acknowledged_heartbeats_keep_session_alive() {
        let endpoint = serve(|mut ws| async move {
            ws.send(hello(10.0)).await.unwrap();
            let mut acked = 0;
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let (packet, _) = VoicePacket::from_json(text.as_str()).unwrap();
                if let VoicePacket::Heartbeat(hb) = packet {
                    let ack = VoicePacket::HeartbeatAck { nonce: hb.t }.to_json().unwrap();
                    ws.send(Message::Text(ack.into())).await.unwrap();
                    acked += 1;
                    if acked == 6 {
                        ws.close(Some(CloseFrame {
                            code: CloseCode::from(4006),
                            reason: "done".into(),
                        }))
                        .await
                        .unwrap();
                        break;
                    }
                }
            }
        })
        .await;

        let (channel, mut rx) = SignalingChannel::connect(&endpoint, 3).await.unwrap();
        let (code, ops) = tokio::time::timeout(Duration::from_secs(5), next_close(&mut rx))
            .await
            .unwrap();
        assert_eq!(code, 4006);
        assert_eq!(ops.iter().filter(|op| **op == opcode::HEARTBEAT_ACK).count(), 6);
        assert!(channel.ping().is_some());
    }
}
