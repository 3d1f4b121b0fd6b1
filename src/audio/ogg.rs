//! Incremental Ogg demuxer for ffmpeg's Opus output.
//!
//! Yields one Opus packet (one frame) at a time and drops the `OpusHead`
//! and `OpusTags` headers. CRCs are not checked: the stream comes from a
//! local pipe.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PipelineError;

const CAPTURE: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;
const CONTINUED_PACKET: u8 = 0x01;

pub struct OggDemuxer<R> {
    reader: R,
    packets: VecDeque<Bytes>,
    partial: BytesMut,
}

impl<R: AsyncRead + Unpin> OggDemuxer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            packets: VecDeque::new(),
            partial: BytesMut::new(),
        }
    }

    /// Siguiente paquete Opus, o `None` al final del stream.
    pub async fn next_packet(&mut self) -> Result<Option<Bytes>, PipelineError> {
        loop {
            while let Some(packet) = self.packets.pop_front() {
                if !is_header(&packet) {
                    return Ok(Some(packet));
                }
            }
            if !self.read_page().await? {
                return Ok(None);
            }
        }
    }

    async fn read_page(&mut self) -> Result<bool, PipelineError> {
        let mut header = [0u8; PAGE_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            // Fin del stream (o página truncada al matar el proceso)
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(PipelineError::Decode(e.to_string())),
        }
        if &header[..4] != CAPTURE {
            return Err(PipelineError::Decode("lost Ogg page sync".to_string()));
        }

        let flags = header[5];
        let segments = header[26] as usize;
        let mut lacing = vec![0u8; segments];
        self.read_body(&mut lacing).await?;
        let body_len: usize = lacing.iter().map(|l| *l as usize).sum();
        let mut body = vec![0u8; body_len];
        self.read_body(&mut body).await?;

        if flags & CONTINUED_PACKET == 0 && !self.partial.is_empty() {
            // Paquete anterior incompleto: se descarta
            self.partial.clear();
        }

        let mut offset = 0;
        for len in lacing {
            let len = len as usize;
            self.partial.extend_from_slice(&body[offset..offset + len]);
            offset += len;
            if len < 255 {
                let packet = self.partial.split().freeze();
                if !packet.is_empty() {
                    self.packets.push_back(packet);
                }
            }
        }
        Ok(true)
    }

    async fn read_body(&mut self, buf: &mut [u8]) -> Result<(), PipelineError> {
        self.reader
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Decode(format!("truncated Ogg page: {e}")))
    }
}

fn is_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn skips_headers_and_yields_frames() {
        let stream = opus_stream(&[b"frame-1", b"frame-2"]);
        let mut demuxer = OggDemuxer::new(Cursor::new(stream));
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap(), &b"frame-1"[..]);
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap(), &b"frame-2"[..]);
        assert!(demuxer.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn joins_packets_spanning_segments() {
        let big = vec![7u8; 600];
        let mut stream = page(0, 0, &[b"a", &big, b"b"]);
        stream.extend_from_slice(&page(1, 0, &[b"c"]));
        let mut demuxer = OggDemuxer::new(Cursor::new(stream));
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap(), &b"a"[..]);
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap().len(), 600);
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap(), &b"b"[..]);
        assert_eq!(demuxer.next_packet().await.unwrap().unwrap(), &b"c"[..]);
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let mut demuxer = OggDemuxer::new(Cursor::new(vec![0u8; 64]));
        assert!(matches!(demuxer.next_packet().await, Err(PipelineError::Decode(_))));
    }
}
