//! Message-framed transport.
//!
//! Frames are a 4-byte big-endian length followed by the payload. A TCP stream
//! is split into a [`FrameReader`] and a [`FrameWriter`] so inbound reads and
//! outbound writes proceed independently. The writer side is reached through
//! [`MessageSink`], which is all a session's outbound queue needs.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

/// Largest frame payload in either direction. A full snapshot (every player
/// slot and [`MAX_DUMMIES`](crate::config::MAX_DUMMIES) dummies) stays well
/// below it.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Outbound half of a message channel. Not safe for concurrent writes; callers
/// keep at most one `send_frame` in flight.
#[async_trait]
pub trait MessageSink: Send {
    async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads length-prefixed frames.
///
/// Partial input is buffered between calls, so `read_frame` may be raced in a
/// `select!` without losing bytes.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads one frame. Returns `Ok(None)` on a clean close between frames.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }
            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .context("tcp read")?;
            if n == 0 {
                anyhow::ensure!(
                    self.buf.is_empty(),
                    "connection closed mid-frame ({} bytes buffered)",
                    self.buf.len()
                );
                return Ok(None);
            }
        }
    }

    fn parse_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        let Some(header) = self.buf.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");

        if self.buf.len() < 4 + len {
            self.buf.reserve(4 + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Writes length-prefixed frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for FrameWriter<W> {
    async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            payload.len() <= MAX_FRAME_LEN,
            "frame of {} bytes exceeds limit",
            payload.len()
        );
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        self.inner.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("tcp shutdown")
    }
}

/// Splits a connected stream into framed halves.
pub fn split(stream: TcpStream) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    (FrameReader::new(r), FrameWriter::new(w))
}

/// TCP server listener.
pub struct FrameListener {
    listener: TcpListener,
}

impl FrameListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await.context("tcp accept")
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.send_frame(b"first").await?;
        writer.send_frame(b"").await?;
        writer.send_frame(b"third").await?;
        drop(writer);

        assert_eq!(reader.read_frame().await?.as_deref(), Some(&b"first"[..]));
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&b""[..]));
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&b"third"[..]));
        assert_eq!(reader.read_frame().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_before_writing() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        assert!(writer.send_frame(&vec![0u8; MAX_FRAME_LEN + 1]).await.is_err());
        // Nothing partial went out; the stream is still usable.
        writer.send_frame(b"after").await?;
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&b"after"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_frame() -> anyhow::Result<()> {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);
        a.write_all(&5u32.to_be_bytes()).await?;
        a.write_all(b"he").await?;

        let early = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.read_frame(),
        )
        .await;
        assert!(early.is_err());

        a.write_all(b"llo").await?;
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&b"hello"[..]));
        Ok(())
    }
}
