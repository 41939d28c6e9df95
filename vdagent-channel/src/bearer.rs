//! Bearer transports and carrier-frame buffering for the main channel
//!
//! A frame is a 6-octet little-endian header `(kind, size)` followed by
//! `size` octets of body. The buffer reads are cancel-safe so the session
//! loop can select over them.

use std::net::SocketAddr;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{error, trace};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub const FRAME_HEADER_LEN: usize = 6;

/// Ceiling on a single frame body; carrier frames are small.
pub const MAX_FRAME_PAYLOAD: u32 = 1024 * 1024;

const BUFFER_LEN: usize = 1024 * 10;

pub type FrameKind = u16;

#[derive(Debug)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub size: u32,
}

impl From<&[u8]> for FrameHeader {
    fn from(value: &[u8]) -> Self {
        let kind = LittleEndian::read_u16(&value[0..2]);
        let size = LittleEndian::read_u32(&value[2..6]);

        Self { kind, size }
    }
}

impl From<FrameHeader> for [u8; FRAME_HEADER_LEN] {
    fn from(value: FrameHeader) -> Self {
        let mut out = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u16(&mut out[0..2], value.kind);
        LittleEndian::write_u32(&mut out[2..6], value.size);

        out
    }
}

#[cfg(not(unix))]
pub enum Bearer {
    Tcp(TcpStream),
}

#[cfg(unix)]
pub enum Bearer {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Bearer {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self, tokio::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::Tcp(stream))
    }

    pub async fn accept_tcp(listener: &TcpListener) -> tokio::io::Result<(Self, SocketAddr)> {
        let (stream, addr) = listener.accept().await?;
        Ok((Self::Tcp(stream), addr))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, tokio::io::Error> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::Unix(stream))
    }

    #[cfg(unix)]
    pub async fn accept_unix(
        listener: &UnixListener,
    ) -> tokio::io::Result<(Self, tokio::net::unix::SocketAddr)> {
        let (stream, addr) = listener.accept().await?;
        Ok((Self::Unix(stream), addr))
    }

    pub async fn readable(&self) -> tokio::io::Result<()> {
        match self {
            Bearer::Tcp(x) => x.readable().await,
            #[cfg(unix)]
            Bearer::Unix(x) => x.readable().await,
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> tokio::io::Result<usize> {
        match self {
            Bearer::Tcp(x) => x.try_read(buf),
            #[cfg(unix)]
            Bearer::Unix(x) => x.try_read(buf),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> tokio::io::Result<()> {
        match self {
            Bearer::Tcp(x) => x.write_all(buf).await,
            #[cfg(unix)]
            Bearer::Unix(x) => x.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> tokio::io::Result<()> {
        match self {
            Bearer::Tcp(x) => x.flush().await,
            #[cfg(unix)]
            Bearer::Unix(x) => x.flush().await,
        }
    }
}

#[derive(Debug, Error)]
pub enum BearerError {
    #[error("no data available in bearer to complete frame")]
    EmptyBearer,

    #[error("bearer I/O error")]
    Io(#[source] tokio::io::Error),

    #[error("frame of {0} octets exceeds the frame ceiling")]
    FrameTooLarge(u32),
}

pub struct FrameBuffer(Bearer, Vec<u8>);

impl FrameBuffer {
    pub fn new(bearer: Bearer) -> Self {
        Self(bearer, Vec::with_capacity(BUFFER_LEN))
    }

    /// Cancel-safe loop that reads from the bearer until a certain length
    /// is buffered. Zero-payload frames are already satisfied by their
    /// header, so the length check comes before any waiting.
    async fn cancellable_read(&mut self, required: usize) -> Result<(), BearerError> {
        loop {
            if self.1.len() >= required {
                break Ok(());
            }

            self.0.readable().await.map_err(BearerError::Io)?;

            let remaining = required - self.1.len();
            let mut buf = vec![0u8; remaining];

            match self.0.try_read(&mut buf) {
                Ok(0) => {
                    error!("empty bearer");
                    break Err(BearerError::EmptyBearer);
                }
                Ok(n) => {
                    trace!(n, "found data on bearer");
                    self.1.extend_from_slice(&buf[0..n]);
                }
                Err(ref e) if e.kind() == tokio::io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(err) => {
                    error!(?err, "bearer IO error");
                    break Err(BearerError::Io(err));
                }
            }
        }
    }

    async fn peek_header(&mut self) -> Result<FrameHeader, BearerError> {
        self.cancellable_read(FRAME_HEADER_LEN).await?;

        Ok(FrameHeader::from(&self.1[..FRAME_HEADER_LEN]))
    }

    /// Cancel-safe read of a full frame from the bearer.
    pub async fn read_frame(&mut self) -> Result<(FrameKind, Vec<u8>), BearerError> {
        let header = self.peek_header().await?;

        if header.size > MAX_FRAME_PAYLOAD {
            return Err(BearerError::FrameTooLarge(header.size));
        }

        let frame_size = FRAME_HEADER_LEN + header.size as usize;
        self.cancellable_read(frame_size).await?;

        let frame = self.1.drain(..frame_size);
        let payload = frame.skip(FRAME_HEADER_LEN).collect();

        Ok((header.kind, payload))
    }

    pub async fn write_frame(
        &mut self,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<(), std::io::Error> {
        let header = FrameHeader {
            kind,
            size: payload.len() as u32,
        };

        let buf: [u8; FRAME_HEADER_LEN] = header.into();
        self.0.write_all(&buf).await?;
        self.0.write_all(payload).await?;

        self.0.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let bearer = Bearer::connect_tcp(addr).await.unwrap();
            let mut buf = FrameBuffer::new(bearer);
            buf.write_frame(7, b"hello").await.unwrap();
            buf.write_frame(8, &[]).await.unwrap();
            buf.read_frame().await.unwrap()
        });

        let (bearer, _) = Bearer::accept_tcp(&listener).await.unwrap();
        let mut buf = FrameBuffer::new(bearer);

        let (kind, payload) = buf.read_frame().await.unwrap();
        assert_eq!((kind, payload.as_slice()), (7, b"hello".as_slice()));

        let (kind, payload) = buf.read_frame().await.unwrap();
        assert_eq!((kind, payload.len()), (8, 0));

        buf.write_frame(9, b"bye").await.unwrap();
        let (kind, payload) = client.await.unwrap();
        assert_eq!((kind, payload.as_slice()), (9, b"bye".as_slice()));
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader { kind: 0x0102, size: 5 };
        let wire: [u8; FRAME_HEADER_LEN] = header.into();

        assert_eq!(wire, [0x02, 0x01, 5, 0, 0, 0]);

        let back = FrameHeader::from(&wire[..]);
        assert_eq!(back.kind, 0x0102);
        assert_eq!(back.size, 5);
    }
}
