use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

/// Stream adapter that replays bytes consumed during protocol sniffing.
///
/// Framing decisions (the secret line, the protocol peek, the SOCKS5
/// negotiation) run through a `BufReader`, which may pull more bytes into
/// user space than those steps consume. The adapter carries that residue:
/// reads drain it before touching the underlying stream, so a downstream
/// consumer (the HTTP engine, the relay) observes an unbroken byte
/// sequence. Writes, flush, and shutdown pass straight through.
pub(crate) struct PeekedStream<S> {
    buffered: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub(crate) fn new(reader: BufReader<S>) -> Self
    where
        S: AsyncRead,
    {
        Self {
            buffered: reader.buffer().to_vec(),
            pos: 0,
            inner: reader.into_inner(),
        }
    }

    #[cfg(test)]
    fn with_buffered(buffered: Vec<u8>, inner: S) -> Self {
        Self {
            buffered,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buffered.len() {
            let n = (this.buffered.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buffered[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buffered.len() {
                this.buffered = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn buffered_bytes_are_read_before_the_stream() {
        let (mut far, near) = duplex(64);
        far.write_all(b" tail").await.unwrap();

        let mut stream = PeekedStream::with_buffered(b"head".to_vec(), near);
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"head tail");
    }

    #[tokio::test]
    async fn short_reads_drain_the_buffer_incrementally() {
        let (_far, near) = duplex(64);
        let mut stream = PeekedStream::with_buffered(b"abcd".to_vec(), near);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"d");
    }

    #[tokio::test]
    async fn writes_pass_through_untouched() {
        let (mut far, near) = duplex(64);
        let mut stream = PeekedStream::with_buffered(b"ignored".to_vec(), near);

        stream.write_all(b"request").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");
    }

    #[tokio::test]
    async fn carries_the_bufreader_residue() {
        let (mut far, near) = duplex(64);
        far.write_all(b"first\nsecond").await.unwrap();

        let mut reader = BufReader::new(near);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "first\n");

        // "second" was pulled into the BufReader by the line read above and
        // must survive the conversion.
        let mut stream = PeekedStream::new(reader);
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");
    }
}
