//! Voice connection: one signaling channel plus one datagram transport per guild.
//!
//! The driver task owns the retry policy. A close first tries `Resume`
//! (keeping the UDP transport and its RTP counters), then falls back to a
//! full `Identify` with a fresh transport, up to `max_reconnect_attempts`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serenity::all::{ChannelId, GuildId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::crypto::{Cipher, EncryptionMode};
use super::payload::{
    classify_close, CloseClass, Identify, Resume, SelectProtocol, SelectProtocolData, Speaking,
    VoicePacket,
};
use super::udp::DatagramTransport;
use super::ws::{SignalingChannel, SignalingEvent};
use crate::config::Config;
use crate::error::{CryptoError, TransportError, VoiceError};

/// Estado de la conexión de voz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Signaling,
    Connecting,
    Ready,
    Disconnected,
    Resuming,
    Destroyed,
}

/// Datos del servidor de voz que entrega el gateway principal.
#[derive(Debug, Clone)]
pub struct VoiceServerInfo {
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
    pub user_id: String,
}

/// Puente hacia el gateway principal (voice state / voice server update).
#[async_trait]
pub trait GatewayBridge: Send + Sync {
    async fn request_join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceServerInfo, VoiceError>;

    async fn request_leave(&self, guild_id: GuildId) -> Result<(), VoiceError>;
}

/// Destino de los frames Opus ya codificados.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// `Ok(false)` cuando la conexión no está lista y el frame se descarta.
    async fn send_frame(&self, frame: &[u8]) -> Result<bool, VoiceError>;

    /// Puede aceptar frames ahora mismo.
    fn is_ready(&self) -> bool;

    fn set_speaking(&self, speaking: bool);
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Destroyed { guild_id: GuildId, reason: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryAction {
    Resume,
    Reidentify { attempt: u32 },
    GiveUp(u16, u32),
}

/// Política de reconexión tras un cierre del canal de señalización.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
    consecutive_failures: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            consecutive_failures: 0,
        }
    }

    /// La sesión volvió a estar lista: se restablece el presupuesto.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.consecutive_failures = 0;
    }

    pub fn next(&mut self, code: u16, was_resuming: bool, can_resume: bool) -> RetryAction {
        let class = classify_close(code);
        if class == CloseClass::Fatal {
            return RetryAction::GiveUp(code, self.attempts);
        }

        self.consecutive_failures += 1;
        if class == CloseClass::Resume
            && can_resume
            && !was_resuming
            && self.consecutive_failures == 1
        {
            return RetryAction::Resume;
        }

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            RetryAction::GiveUp(code, self.max_attempts)
        } else {
            RetryAction::Reidentify {
                attempt: self.attempts,
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Closed {
        code: u16,
        reached_ready: bool,
        seq: Option<i64>,
    },
    Transport(TransportError),
}

pub struct VoiceConnection {
    guild_id: GuildId,
    channel_id: Mutex<Option<ChannelId>>,
    config: Arc<Config>,
    bridge: Arc<dyn GatewayBridge>,
    status: watch::Sender<ConnectionStatus>,
    transport: RwLock<Option<Arc<DatagramTransport>>>,
    signaling: Mutex<Option<Arc<SignalingChannel>>>,
    ssrc: AtomicU32,
    session_cancel: Mutex<CancellationToken>,
    last_error: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl VoiceConnection {
    pub fn new(
        guild_id: GuildId,
        config: Arc<Config>,
        bridge: Arc<dyn GatewayBridge>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            guild_id,
            channel_id: Mutex::new(None),
            config,
            bridge,
            status,
            transport: RwLock::new(None),
            signaling: Mutex::new(None),
            ssrc: AtomicU32::new(0),
            session_cancel: Mutex::new(CancellationToken::new()),
            last_error: Mutex::new(None),
            events,
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.channel_id.lock()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Une la conexión a un canal y espera hasta que esté lista.
    pub async fn join(self: &Arc<Self>, channel_id: ChannelId) -> Result<(), VoiceError> {
        if self.status() == ConnectionStatus::Destroyed {
            return Err(VoiceError::Destroyed);
        }
        if self.channel_id() == Some(channel_id) && self.status() == ConnectionStatus::Ready {
            return Ok(());
        }

        let info = self.bridge.request_join(self.guild_id, channel_id).await?;
        info!(
            "🎤 Uniendo guild {} al canal {} ({})",
            self.guild_id, channel_id, info.endpoint
        );

        // Un join nuevo reemplaza cualquier sesión anterior
        let cancel = {
            let mut current = self.session_cancel.lock();
            current.cancel();
            *current = CancellationToken::new();
            current.clone()
        };
        self.drop_transport();
        *self.channel_id.lock() = Some(channel_id);
        self.set_status(ConnectionStatus::Signaling);
        tokio::spawn(self.clone().drive(info, cancel));

        let mut rx = self.subscribe();
        let status = *rx
            .wait_for(|s| matches!(s, ConnectionStatus::Ready | ConnectionStatus::Destroyed))
            .await
            .map_err(|_| VoiceError::Destroyed)?;

        if status == ConnectionStatus::Destroyed {
            let reason = self
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "connection destroyed".to_string());
            return Err(VoiceError::Join(reason));
        }
        Ok(())
    }

    /// Destruye la conexión. Es terminal.
    pub async fn disconnect(&self) {
        if self.status() == ConnectionStatus::Destroyed {
            return;
        }
        self.session_cancel.lock().cancel();
        self.set_status(ConnectionStatus::Destroyed);
        self.drop_transport();
        self.signaling.lock().take();

        if let Err(e) = self.bridge.request_leave(self.guild_id).await {
            warn!("No se pudo salir del canal de voz en guild {}: {}", self.guild_id, e);
        }
        info!("👋 Conexión de voz destruida en guild {}", self.guild_id);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("🔀 Voz guild {}: {:?} -> {:?}", self.guild_id, previous, status);
        }
    }

    fn drop_transport(&self) {
        if let Some(transport) = self.transport.write().take() {
            transport.close();
        }
    }

    fn destroy_with(&self, err: VoiceError) {
        error!("❌ Conexión de voz en guild {} perdida: {}", self.guild_id, err);
        *self.last_error.lock() = Some(err.to_string());
        self.set_status(ConnectionStatus::Destroyed);
        self.drop_transport();
        self.signaling.lock().take();
        let _ = self.events.send(ConnectionEvent::Destroyed {
            guild_id: self.guild_id,
            reason: err.to_string(),
        });
    }

    async fn drive(self: Arc<Self>, info: VoiceServerInfo, cancel: CancellationToken) {
        let mut policy = RetryPolicy::new(self.config.max_reconnect_attempts);
        let mut resume = false;
        let mut last_seq = None;

        loop {
            self.set_status(if resume {
                ConnectionStatus::Resuming
            } else {
                ConnectionStatus::Signaling
            });

            let (code, reached_ready) = match self.run_session(&info, resume, last_seq, &cancel).await {
                SessionEnd::Cancelled => return,
                SessionEnd::Transport(e) => {
                    if !cancel.is_cancelled() {
                        self.destroy_with(e.into());
                    }
                    return;
                }
                SessionEnd::Closed {
                    code,
                    reached_ready,
                    seq,
                } => {
                    last_seq = seq.or(last_seq);
                    (code, reached_ready)
                }
            };
            if cancel.is_cancelled() {
                return;
            }
            if reached_ready {
                policy.reset();
            }
            self.set_status(ConnectionStatus::Disconnected);

            let can_resume = self.transport.read().is_some();
            match policy.next(code, resume, can_resume) {
                RetryAction::Resume => {
                    info!("🔄 Reanudando sesión de voz en guild {} (code {})", self.guild_id, code);
                    resume = true;
                }
                RetryAction::Reidentify { attempt } => {
                    warn!(
                        "🔄 Re-identificando voz en guild {} (code {}, intento {}/{})",
                        self.guild_id, code, attempt, self.config.max_reconnect_attempts
                    );
                    self.drop_transport();
                    resume = false;
                    last_seq = None;
                    let backoff = Duration::from_millis(500 * u64::from(attempt.min(10)));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                RetryAction::GiveUp(code, attempts) => {
                    let err = if classify_close(code) == CloseClass::Fatal {
                        VoiceError::FatalClose(code)
                    } else {
                        VoiceError::RetriesExhausted(attempts)
                    };
                    self.destroy_with(err);
                    return;
                }
            }
        }
    }

    async fn run_session(
        &self,
        info: &VoiceServerInfo,
        resume: bool,
        last_seq: Option<i64>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (channel, mut events) =
            match SignalingChannel::connect(&info.endpoint, self.config.heartbeat_miss_limit).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("No se pudo conectar al gateway de voz: {}", e);
                    return SessionEnd::Closed {
                        code: 1006,
                        reached_ready: false,
                        seq: None,
                    };
                }
            };
        let channel = Arc::new(channel);
        *self.signaling.lock() = Some(channel.clone());
        let mut reached_ready = false;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    channel.close(1000, "disconnect");
                    return SessionEnd::Cancelled;
                }
                event = events.recv() => event,
            };

            let packet = match event {
                None => {
                    return SessionEnd::Closed {
                        code: 1006,
                        reached_ready,
                        seq: channel.last_seq(),
                    }
                }
                Some(SignalingEvent::Close { code, reason }) => {
                    debug!("Gateway de voz cerrado ({}): {}", code, reason);
                    return SessionEnd::Closed {
                        code,
                        reached_ready,
                        seq: channel.last_seq(),
                    };
                }
                Some(SignalingEvent::Error(e)) => {
                    warn!("Error de señalización en guild {}: {}", self.guild_id, e);
                    continue;
                }
                Some(SignalingEvent::Open) => {
                    let hello = if resume {
                        VoicePacket::Resume(Resume {
                            server_id: self.guild_id.to_string(),
                            session_id: info.session_id.clone(),
                            token: info.token.clone(),
                            seq_ack: last_seq,
                        })
                    } else {
                        VoicePacket::Identify(Identify {
                            server_id: self.guild_id.to_string(),
                            user_id: info.user_id.clone(),
                            session_id: info.session_id.clone(),
                            token: info.token.clone(),
                        })
                    };
                    if let Err(e) = channel.send(&hello) {
                        warn!("No se pudo enviar op {}: {}", hello.op(), e);
                    }
                    continue;
                }
                Some(SignalingEvent::Packet(packet)) => packet,
            };

            match packet {
                VoicePacket::Ready(ready) => {
                    self.set_status(ConnectionStatus::Connecting);
                    let mode = match EncryptionMode::negotiate(&ready.modes) {
                        Some(mode) => mode,
                        None => {
                            return SessionEnd::Transport(
                                CryptoError::UnsupportedMode(ready.modes.join(",")).into(),
                            )
                        }
                    };
                    let remote: SocketAddr = match ready.ip.parse() {
                        Ok(ip) => SocketAddr::new(ip, ready.port),
                        Err(_) => {
                            return SessionEnd::Transport(TransportError::Discovery(format!(
                                "invalid voice server address '{}'",
                                ready.ip
                            )))
                        }
                    };

                    let transport = match DatagramTransport::open(remote, self.config.samples_per_frame()).await {
                        Ok(transport) => Arc::new(transport),
                        Err(e) => return SessionEnd::Transport(e),
                    };
                    transport.start_keepalive(self.config.keepalive_interval);
                    self.drop_transport();
                    *self.transport.write() = Some(transport.clone());
                    self.ssrc.store(ready.ssrc, Ordering::Relaxed);

                    let discovered = tokio::select! {
                        _ = cancel.cancelled() => return SessionEnd::Cancelled,
                        found = transport.discover_ip(ready.ssrc) => found,
                    };
                    let (ip, port) = match discovered {
                        Ok(found) => found,
                        Err(e) => return SessionEnd::Transport(e),
                    };

                    let select = VoicePacket::SelectProtocol(SelectProtocol {
                        protocol: "udp".to_string(),
                        data: SelectProtocolData {
                            address: ip.to_string(),
                            port,
                            mode: mode.as_str().to_string(),
                        },
                    });
                    if let Err(e) = channel.send(&select) {
                        warn!("No se pudo enviar SelectProtocol: {}", e);
                    }
                }
                VoicePacket::SessionDescription(description) => {
                    let cipher = description
                        .mode
                        .parse::<EncryptionMode>()
                        .and_then(|mode| Cipher::new(mode, &description.secret_key));
                    let cipher = match cipher {
                        Ok(cipher) => cipher,
                        Err(e) => return SessionEnd::Transport(e.into()),
                    };
                    let Some(transport) = self.transport.read().clone() else {
                        warn!("SessionDescription sin transporte en guild {}", self.guild_id);
                        continue;
                    };
                    info!(
                        "✅ Voz lista en guild {} (ssrc {}, {})",
                        self.guild_id,
                        self.ssrc.load(Ordering::Relaxed),
                        cipher.mode()
                    );
                    transport.set_session(self.ssrc.load(Ordering::Relaxed), cipher);
                    reached_ready = true;
                    self.set_status(ConnectionStatus::Ready);
                    self.set_speaking(true);
                }
                VoicePacket::Resumed => {
                    let resumable = self
                        .transport
                        .read()
                        .as_ref()
                        .is_some_and(|t| t.has_session());
                    if resumable {
                        info!("✅ Sesión de voz reanudada en guild {}", self.guild_id);
                        reached_ready = true;
                        self.set_status(ConnectionStatus::Ready);
                        self.set_speaking(true);
                    }
                }
                other => trace!("op {} ignorado", other.op()),
            }
        }
    }
}

#[async_trait]
impl FrameSink for VoiceConnection {
    async fn send_frame(&self, frame: &[u8]) -> Result<bool, VoiceError> {
        if self.status() != ConnectionStatus::Ready {
            return Ok(false);
        }
        let Some(transport) = self.transport.read().clone() else {
            return Ok(false);
        };
        match transport.send(frame).await {
            Ok(()) => Ok(true),
            // La sesión se está renegociando
            Err(TransportError::Closed | TransportError::NoSession) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    fn set_speaking(&self, speaking: bool) {
        let Some(channel) = self.signaling.lock().clone() else {
            return;
        };
        let packet = VoicePacket::Speaking(Speaking {
            speaking: u8::from(speaking),
            delay: 0,
            ssrc: self.ssrc.load(Ordering::Relaxed),
        });
        if let Err(e) = channel.send(&packet) {
            debug!("Speaking no enviado: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::crypto::KEY_LEN;
    use crate::voice::payload::{opcode, Hello, Ready, SessionDescription};
    use crate::voice::udp::{DISCOVERY_PACKET_LEN, KEEPALIVE_PACKET_LEN, RTP_HEADER_LEN};
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    const KEY: [u8; KEY_LEN] = [3u8; KEY_LEN];

    struct FakeBridge {
        endpoint: String,
    }

    #[async_trait]
    impl GatewayBridge for FakeBridge {
        async fn request_join(&self, _: GuildId, _: ChannelId) -> Result<VoiceServerInfo, VoiceError> {
            Ok(VoiceServerInfo {
                endpoint: self.endpoint.clone(),
                token: "token".into(),
                session_id: "session".into(),
                user_id: "1".into(),
            })
        }

        async fn request_leave(&self, _: GuildId) -> Result<(), VoiceError> {
            Ok(())
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, packet: VoicePacket) {
        ws.send(Message::Text(packet.to_json().unwrap().into())).await.unwrap();
    }

    async fn expect_op(ws: &mut WebSocketStream<TcpStream>, op: u8) -> VoicePacket {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let (packet, _) = VoicePacket::from_json(text.as_str()).unwrap();
                if packet.op() == op {
                    return packet;
                }
            }
        }
        panic!("socket closed before op {op}");
    }

    async fn close(ws: &mut WebSocketStream<TcpStream>, code: u16) {
        ws.close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "test".into(),
        }))
        .await
        .unwrap();
    }

    /// Servidor UDP que responde al discovery y reenvía los paquetes RTP.
    async fn udp_server() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                if n == DISCOVERY_PACKET_LEN && buf[1] == 1 {
                    let mut reply = [0u8; DISCOVERY_PACKET_LEN];
                    reply[1] = 2;
                    reply[3] = 70;
                    reply[8..17].copy_from_slice(b"127.0.0.1");
                    reply[72..74].copy_from_slice(&peer.port().to_be_bytes());
                    socket.send_to(&reply, peer).await.unwrap();
                } else if n > KEEPALIVE_PACKET_LEN && buf[1] == 0x78 {
                    let _ = tx.send(buf[..n].to_vec());
                }
            }
        });
        (port, rx)
    }

    async fn handshake(ws: &mut WebSocketStream<TcpStream>, udp_port: u16) -> VoicePacket {
        send(ws, VoicePacket::Hello(Hello { heartbeat_interval: 30_000.0 })).await;
        let identify = expect_op(ws, opcode::IDENTIFY).await;
        send(
            ws,
            VoicePacket::Ready(Ready {
                ssrc: 7,
                ip: "127.0.0.1".into(),
                port: udp_port,
                modes: vec!["xsalsa20_poly1305".into(), "xsalsa20_poly1305_lite".into()],
            }),
        )
        .await;
        let select = expect_op(ws, opcode::SELECT_PROTOCOL).await;
        if let VoicePacket::SelectProtocol(select) = &select {
            assert_eq!(select.data.mode, "xsalsa20_poly1305_lite");
            assert_eq!(select.data.address, "127.0.0.1");
        }
        send(
            ws,
            VoicePacket::SessionDescription(SessionDescription {
                mode: "xsalsa20_poly1305_lite".into(),
                secret_key: KEY.to_vec(),
            }),
        )
        .await;
        identify
    }

    fn sequence_of(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    fn connection(endpoint: String) -> (Arc<VoiceConnection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = VoiceConnection::new(
            GuildId::new(42),
            Arc::new(Config::default()),
            Arc::new(FakeBridge { endpoint }),
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn resume_is_tried_once_before_reidentify() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(policy.next(1006, false, true), RetryAction::Resume);
        assert_eq!(policy.next(1006, true, true), RetryAction::Reidentify { attempt: 1 });
        assert_eq!(policy.next(1006, false, true), RetryAction::Reidentify { attempt: 2 });
        assert_eq!(policy.next(1006, false, true), RetryAction::GiveUp(1006, 2));
    }

    #[test]
    fn session_invalidation_skips_resume() {
        let mut policy = RetryPolicy::new(5);
        assert_eq!(policy.next(4006, false, true), RetryAction::Reidentify { attempt: 1 });
        policy.reset();
        assert_eq!(policy.next(4014, false, true), RetryAction::GiveUp(4014, 0));
        policy.reset();
        assert_eq!(policy.next(4000, false, false), RetryAction::Reidentify { attempt: 1 });
    }

    #[tokio::test]
    async fn resume_keeps_rtp_counters() {
        let (udp_port, mut rtp) = udp_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, mut resume_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let identify = handshake(&mut ws, udp_port).await;
            assert!(matches!(identify, VoicePacket::Identify(Identify { ref server_id, .. }) if server_id == "42"));
            drop_rx.await.unwrap();
            close(&mut ws, 4000).await;

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            send(&mut ws, VoicePacket::Hello(Hello { heartbeat_interval: 30_000.0 })).await;
            let resume = expect_op(&mut ws, opcode::RESUME).await;
            resume_tx.send(resume).unwrap();
            send(&mut ws, VoicePacket::Resumed).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (conn, _events) = connection(endpoint);
        conn.join(ChannelId::new(9)).await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Ready);

        assert!(conn.send_frame(b"first").await.unwrap());
        let first = rtp.recv().await.unwrap();
        assert_eq!(sequence_of(&first), 0);
        assert_eq!(&first[8..12], &7u32.to_be_bytes());
        let reader = Cipher::new(EncryptionMode::Lite, &KEY).unwrap();
        let (header, body) = first.split_at(RTP_HEADER_LEN);
        assert_eq!(reader.open(header, body).unwrap(), b"first");

        drop_tx.send(()).unwrap();
        let resume = resume_rx.recv().await.unwrap();
        assert!(matches!(resume, VoicePacket::Resume(Resume { ref session_id, .. }) if session_id == "session"));

        let mut status = conn.subscribe();
        status
            .wait_for(|s| *s == ConnectionStatus::Ready)
            .await
            .unwrap();
        assert!(conn.send_frame(b"second").await.unwrap());
        let second = rtp.recv().await.unwrap();
        assert_eq!(sequence_of(&second), 1);
        assert_eq!(&second[second.len() - 4..], &2u32.to_be_bytes());

        conn.disconnect().await;
        assert_eq!(conn.status(), ConnectionStatus::Destroyed);
        assert!(!conn.send_frame(b"late").await.unwrap());
    }

    #[tokio::test]
    async fn reidentify_starts_fresh_rtp_counters() {
        let (udp_port, mut rtp) = udp_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();
        let (again_tx, again_rx) = tokio::sync::oneshot::channel::<VoicePacket>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handshake(&mut ws, udp_port).await;
            drop_rx.await.unwrap();
            // Sesión invalidada: no se puede reanudar
            close(&mut ws, 4006).await;

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let identify = handshake(&mut ws, udp_port).await;
            again_tx.send(identify).unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (conn, _events) = connection(endpoint);
        conn.join(ChannelId::new(9)).await.unwrap();
        assert!(conn.send_frame(b"one").await.unwrap());
        assert!(conn.send_frame(b"two").await.unwrap());
        let first = rtp.recv().await.unwrap();
        let second = rtp.recv().await.unwrap();
        assert_eq!(sequence_of(&second), 1);

        drop_tx.send(()).unwrap();
        let identify = again_rx.await.unwrap();
        assert!(matches!(identify, VoicePacket::Identify(_)));
        conn.subscribe()
            .wait_for(|s| *s == ConnectionStatus::Ready)
            .await
            .unwrap();

        assert!(conn.send_frame(b"three").await.unwrap());
        let fresh = rtp.recv().await.unwrap();
        // Secuencia, timestamp y nonce vuelven a empezar
        assert_eq!(sequence_of(&fresh), 0);
        assert_eq!(&fresh[4..8], &first[4..8]);
        assert_eq!(&fresh[fresh.len() - 4..], &first[first.len() - 4..]);
        assert_eq!(&first[first.len() - 4..], &1u32.to_be_bytes());

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn fatal_close_destroys_connection() {
        let (udp_port, _rtp) = udp_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handshake(&mut ws, udp_port).await;
            expect_op(&mut ws, opcode::SPEAKING).await;
            close(&mut ws, 4014).await;
        });

        let (conn, mut events) = connection(endpoint);
        conn.join(ChannelId::new(9)).await.unwrap();

        let ConnectionEvent::Destroyed { guild_id, reason } = events.recv().await.unwrap();
        assert_eq!(guild_id, GuildId::new(42));
        assert!(reason.contains("4014"));
        assert_eq!(conn.status(), ConnectionStatus::Destroyed);
        assert!(!conn.send_frame(b"x").await.unwrap());
        assert!(matches!(conn.join(ChannelId::new(9)).await, Err(VoiceError::Destroyed)));
    }
}
