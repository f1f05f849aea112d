//! Buffered reader with non-consuming peeks.
//!
//! Sniffers look at the head of a stream through [`PeekReader::peek`], which
//! only ever appends to the internal buffer. Bytes leave the buffer through
//! [`PeekReader::take`], the body helpers, or the [`AsyncRead`] impl, so a
//! reader handed to the raw-copy path always starts with everything that
//! was inspected but not committed.

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;

const READ_CHUNK: usize = 16384;

pub struct PeekReader<R> {
    inner: R,
    buf: BytesMut,
    idle: Option<Duration>,
}

impl<R> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            idle: None,
        }
    }

    /// Makes every buffered read fail with `TimedOut` once the stream has
    /// been silent for `idle`.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Bytes read from the stream but not consumed yet.
    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Removes and returns the first `n` buffered bytes.
    #[inline]
    pub fn take(&mut self, n: usize) -> BytesMut {
        self.buf.split_to(n)
    }

    /// Removes and returns everything buffered.
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// Rebuilds a reader around `inner` with `buf` already pending.
    pub fn from_parts(inner: R, buf: BytesMut) -> Self {
        Self {
            inner,
            buf,
            idle: None,
        }
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    /// Reads once from the underlying stream into the buffer.
    ///
    /// Returns the number of bytes added; 0 means EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        let idle = self.idle;
        let read = self.inner.read_buf(&mut self.buf);
        match idle {
            Some(idle) => timeout(idle, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stream idle"))?,
            None => read.await,
        }
    }

    /// Returns the first `n` bytes without consuming them, reading more
    /// from the stream until they are available.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before enough bytes arrived",
                ));
            }
        }
        Ok(&self.buf[..n])
    }

    /// Reads and consumes exactly `n` bytes.
    pub async fn read_bytes(&mut self, n: usize) -> io::Result<BytesMut> {
        self.peek(n).await?;
        Ok(self.take(n))
    }

    /// Consumes one line including its `\n`.
    ///
    /// Fails with `InvalidData` if no newline shows up within `limit` bytes.
    pub async fn read_line(&mut self, limit: usize) -> io::Result<BytesMut> {
        let len = self.peek_line(limit).await?;
        Ok(self.take(len))
    }

    /// Length of the first buffered line including its `\n`, reading until
    /// one is complete. Nothing is consumed.
    pub async fn peek_line(&mut self, limit: usize) -> io::Result<usize> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                return Ok(scanned + pos + 1);
            }
            scanned = self.buf.len();
            if scanned >= limit {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed in the middle of a line",
                ));
            }
        }
    }

    /// Consumes up to `max` bytes, reading only when nothing is buffered.
    pub async fn read_some(&mut self, max: u64) -> io::Result<BytesMut> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed in the middle of a body",
            ));
        }
        let len = max.min(self.buf.len() as u64) as usize;
        Ok(self.take(len))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let n = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PeekReader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"hello world").await.unwrap();

        let mut reader = PeekReader::new(rx);
        assert_eq!(reader.peek(5).await.unwrap(), b"hello");
        assert_eq!(reader.peek(3).await.unwrap(), b"hel");
        assert!(reader.buffered().starts_with(b"hello"));

        let mut out = Vec::new();
        drop(tx);
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_peek_waits_for_more_data() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = PeekReader::new(rx);

        let writer = tokio::spawn(async move {
            tx.write_all(b"GE").await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"T /").await.unwrap();
            tx
        });

        assert_eq!(reader.peek(4).await.unwrap(), b"GET ");
        let _tx = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peek_eof_is_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"ab").await.unwrap();
        drop(tx);

        let mut reader = PeekReader::new(rx);
        let err = reader.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // Whatever did arrive is still there for the raw path
        assert_eq!(reader.buffered(), b"ab");
    }

    #[tokio::test]
    async fn test_read_line_and_read_some() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"5\r\nhello\r\nrest").await.unwrap();
        drop(tx);

        let mut reader = PeekReader::new(rx);
        assert_eq!(&reader.read_line(16).await.unwrap()[..], b"5\r\n");
        assert_eq!(&reader.read_some(5).await.unwrap()[..], b"hello");
        assert_eq!(&reader.read_line(16).await.unwrap()[..], b"\r\n");
        assert_eq!(reader.buffered(), b"rest");
    }

    #[tokio::test]
    async fn test_parts_keep_peeked_bytes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"\x16\x03\x01rest").await.unwrap();
        drop(tx);

        let mut reader = PeekReader::new(rx);
        reader.peek(3).await.unwrap();
        let (inner, buf) = reader.into_parts();

        let mut rebuilt = PeekReader::from_parts(inner, buf);
        let mut out = Vec::new();
        rebuilt.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\x16\x03\x01rest");
    }

    #[tokio::test]
    async fn test_idle_timeout_on_fill() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"ab").await.unwrap();

        let mut reader = PeekReader::new(rx).with_idle_timeout(Duration::from_millis(50));
        let err = reader.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(reader.buffered(), b"ab");
        drop(tx);
    }

    #[tokio::test]
    async fn test_peek_line_keeps_the_line() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"zz\r\nrest").await.unwrap();

        let mut reader = PeekReader::new(rx);
        assert_eq!(reader.peek_line(16).await.unwrap(), 4);
        assert_eq!(reader.buffered(), b"zz\r\nrest");
        drop(tx);
    }

    #[tokio::test]
    async fn test_read_line_limit() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"no newline in sight").await.unwrap();

        let mut reader = PeekReader::new(rx);
        let err = reader.read_line(8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
