//! UDP media transport: IP discovery, keep-alive and RTP framing.

use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::crypto::Cipher;
use crate::error::TransportError;

pub const RTP_HEADER_LEN: usize = 12;
pub const DISCOVERY_PACKET_LEN: usize = 74;
pub const KEEPALIVE_PACKET_LEN: usize = 8;

const RTP_VERSION_FLAGS: u8 = 0x80;
const RTP_PAYLOAD_TYPE: u8 = 0x78;
const DISCOVERY_REQUEST: u16 = 1;
const DISCOVERY_RESPONSE: u16 = 2;

/// Contadores RTP; sólo se reinician creando un transporte nuevo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpCounters {
    pub sequence: u16,
    pub timestamp: u32,
}

impl RtpCounters {
    /// Devuelve los valores para el frame actual y avanza al siguiente.
    pub fn advance(&mut self, samples: u32) -> (u16, u32) {
        let current = (self.sequence, self.timestamp);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        current
    }
}

/// Cabecera RTP de 12 bytes.
pub fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_VERSION_FLAGS;
    header[1] = RTP_PAYLOAD_TYPE;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

pub fn discovery_packet(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parses an IP discovery reply. `Ok(None)` means "not a discovery response".
pub fn parse_discovery_reply(buf: &[u8]) -> Result<Option<(Ipv4Addr, u16)>, TransportError> {
    if buf.len() < 2 || u16::from_be_bytes([buf[0], buf[1]]) != DISCOVERY_RESPONSE {
        return Ok(None);
    }
    if buf.len() < DISCOVERY_PACKET_LEN {
        return Err(TransportError::Discovery(format!(
            "reply too short ({} bytes)",
            buf.len()
        )));
    }

    let raw_ip = &buf[8..72];
    let end = raw_ip.iter().position(|b| *b == 0).unwrap_or(raw_ip.len());
    let ip_str = std::str::from_utf8(&raw_ip[..end])
        .map_err(|_| TransportError::Discovery("address is not valid UTF-8".to_string()))?;
    let ip: Ipv4Addr = ip_str
        .parse()
        .map_err(|_| TransportError::Discovery(format!("not an IPv4 address: '{ip_str}'")))?;
    let port = u16::from_be_bytes([buf[72], buf[73]]);

    Ok(Some((ip, port)))
}

pub fn keepalive_packet(counter: u32) -> [u8; KEEPALIVE_PACKET_LEN] {
    let mut packet = [0u8; KEEPALIVE_PACKET_LEN];
    packet[0..4].copy_from_slice(&counter.to_le_bytes());
    packet
}

struct SendState {
    ssrc: u32,
    counters: RtpCounters,
    cipher: Option<Cipher>,
}

/// Socket UDP conectado al servidor de voz.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    samples_per_frame: u32,
    state: Mutex<SendState>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl DatagramTransport {
    pub async fn open(remote: SocketAddr, samples_per_frame: u32) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        debug!("🔌 UDP abierto hacia {}", remote);

        Ok(Self {
            socket: Arc::new(socket),
            remote,
            samples_per_frame,
            state: Mutex::new(SendState {
                ssrc: 0,
                counters: RtpCounters::default(),
                cipher: None,
            }),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Descubre la IP/puerto externos tal como los ve el servidor.
    ///
    /// No tiene timeout propio: termina cuando llega una respuesta válida o
    /// cuando el transporte se cierra.
    pub async fn discover_ip(&self, ssrc: u32) -> Result<(Ipv4Addr, u16), TransportError> {
        self.socket.send(&discovery_packet(ssrc)).await?;

        let mut buf = [0u8; 128];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Closed),
                res = self.socket.recv(&mut buf) => res?,
            };
            match parse_discovery_reply(&buf[..n])? {
                Some(found) => {
                    debug!("🌐 IP externa descubierta: {}:{}", found.0, found.1);
                    return Ok(found);
                }
                None => trace!("Ignorando datagrama de {} bytes durante discovery", n),
            }
        }
    }

    /// Instala el SSRC y la clave de la sesión.
    pub fn set_session(&self, ssrc: u32, cipher: Cipher) {
        let mut state = self.state.lock();
        state.ssrc = ssrc;
        state.cipher = Some(cipher);
    }

    pub fn has_session(&self) -> bool {
        self.state.lock().cipher.is_some()
    }

    pub fn counters(&self) -> RtpCounters {
        self.state.lock().counters
    }

    /// Envía un datagrama de 8 bytes cada `interval` para mantener el NAT abierto.
    pub fn start_keepalive(&self, interval: Duration) {
        let socket = self.socket.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut counter: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send(&keepalive_packet(counter)).await {
                            warn!("Keep-alive UDP falló: {}", e);
                            break;
                        }
                        counter = counter.wrapping_add(1);
                    }
                }
            }
        });
    }

    /// Cifra y envía un frame Opus ya codificado.
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let packet = {
            let mut state = self.state.lock();
            if state.cipher.is_none() {
                return Err(TransportError::NoSession);
            }
            let ssrc = state.ssrc;
            let (sequence, timestamp) = state.counters.advance(self.samples_per_frame);
            let header = rtp_header(sequence, timestamp, ssrc);
            let cipher = state.cipher.as_mut().ok_or(TransportError::NoSession)?;
            let sealed = cipher.close(&header, frame)?;

            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + sealed.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&sealed);
            packet
        };

        self.socket.send(&packet).await?;
        Ok(())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            debug!("🔌 UDP cerrado ({})", self.remote);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::crypto::{EncryptionMode, KEY_LEN};

    async fn server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn discovery_reply(ip: &str, port: u16) -> Vec<u8> {
        let mut reply = vec![0u8; DISCOVERY_PACKET_LEN];
        reply[0..2].copy_from_slice(&DISCOVERY_RESPONSE.to_be_bytes());
        reply[2..4].copy_from_slice(&70u16.to_be_bytes());
        reply[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
        reply[72..74].copy_from_slice(&port.to_be_bytes());
        reply
    }

    #[test]
    fn header_layout() {
        let header = rtp_header(0x0102, 0x03040506, 0x0708090a);
        assert_eq!(
            header,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
    }

    #[test]
    fn counters_wrap_at_field_width() {
        let mut counters = RtpCounters {
            sequence: u16::MAX,
            timestamp: u32::MAX - 100,
        };
        assert_eq!(counters.advance(960), (u16::MAX, u32::MAX - 100));
        assert_eq!(counters.advance(960), (0, 859));
        assert_eq!(counters.advance(960), (1, 1819));
    }

    #[test]
    fn discovery_rejects_non_ipv4() {
        let reply = discovery_reply("::1", 1234);
        assert!(parse_discovery_reply(&reply).is_err());
        let reply = discovery_reply("not-an-ip", 1234);
        assert!(parse_discovery_reply(&reply).is_err());
        assert!(parse_discovery_reply(&[0, 1, 0, 70]).unwrap().is_none());
    }

    #[test]
    fn keepalive_counter_layout() {
        assert_eq!(keepalive_packet(1), [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(keepalive_packet(u32::MAX), [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn discovers_external_address() {
        let (server, addr) = server().await;
        let transport = DatagramTransport::open(addr, 960).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, DISCOVERY_PACKET_LEN);
            assert_eq!(&buf[4..8], &42u32.to_be_bytes());
            // Un datagrama que no es de discovery se ignora
            server.send_to(&[9, 9, 9], peer).await.unwrap();
            server
                .send_to(&discovery_reply("203.0.113.7", 50004), peer)
                .await
                .unwrap();
        });

        let (ip, port) = transport.discover_ip(42).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(port, 50004);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn frames_carry_monotonic_counters() {
        let (server, addr) = server().await;
        let transport = DatagramTransport::open(addr, 960).await.unwrap();
        let key = [7u8; KEY_LEN];
        transport.set_session(99, Cipher::new(EncryptionMode::Normal, &key).unwrap());

        for _ in 0..3 {
            transport.send(b"opus").await.unwrap();
        }

        let reader = Cipher::new(EncryptionMode::Normal, &key).unwrap();
        let mut buf = [0u8; 256];
        for i in 0..3u32 {
            let (n, _) = server.recv_from(&mut buf).await.unwrap();
            let (header, body) = buf[..n].split_at(RTP_HEADER_LEN);
            assert_eq!(u16::from_be_bytes([header[2], header[3]]), i as u16);
            assert_eq!(
                u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
                i * 960
            );
            assert_eq!(&header[8..12], &99u32.to_be_bytes());
            assert_eq!(reader.open(header, body).unwrap(), b"opus");
        }
        assert_eq!(transport.counters().sequence, 3);
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let (_server, addr) = server().await;
        let transport = DatagramTransport::open(addr, 960).await.unwrap();
        assert!(matches!(transport.send(b"x").await, Err(TransportError::NoSession)));
        transport.close();
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
    }
}
