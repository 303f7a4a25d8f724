//! Snappy compression for a byte stream
//!
//! Writes are buffered and compressed one block at a time when the buffer
//! fills or the stream is flushed. Each block goes on the wire as
//!
//! ```text
//! +--------+--------+--------+--------+-----------------------+
//! |   Compressed length (4B, big-endian) |  Snappy raw block  |
//! +--------+--------+--------+--------+-----------------------+
//! ```
//!
//! Both ends must agree on compression; a plain peer sees garbage.

use bytes::{Buf, BufMut, BytesMut};
use snap::raw::{decompress_len, max_compress_len, Decoder, Encoder};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest uncompressed block
pub const MAX_BLOCK: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Compressing wrapper around a reliable stream
pub struct CompStream<T> {
    inner: T,
    encoder: Encoder,
    decoder: Decoder,
    /// Plaintext waiting to be compressed
    plain_out: BytesMut,
    /// Framed blocks waiting to be written
    encoded: BytesMut,
    /// Raw bytes read but not yet decoded
    read_buf: BytesMut,
    /// Decompressed bytes not yet handed to the reader
    plain_in: BytesMut,
    eof: bool,
}

impl<T> CompStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            plain_out: BytesMut::with_capacity(MAX_BLOCK),
            encoded: BytesMut::new(),
            read_buf: BytesMut::new(),
            plain_in: BytesMut::new(),
            eof: false,
        }
    }

    /// Move buffered plaintext into one framed block
    fn seal_block(&mut self) -> io::Result<()> {
        let block = self
            .encoder
            .compress_vec(&self.plain_out)
            .map_err(invalid_data)?;
        self.encoded.put_u32(block.len() as u32);
        self.encoded.extend_from_slice(&block);
        self.plain_out.clear();
        Ok(())
    }

    /// Decode the next complete block in `read_buf`, if there is one
    fn open_block(&mut self) -> io::Result<bool> {
        if self.read_buf.len() < LEN_PREFIX {
            return Ok(false);
        }
        let len = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        if len > max_compress_len(MAX_BLOCK) {
            return Err(invalid_data(format!("compressed block of {} bytes", len)));
        }
        if self.read_buf.len() < LEN_PREFIX + len {
            return Ok(false);
        }

        self.read_buf.advance(LEN_PREFIX);
        let block = self.read_buf.split_to(len);
        let size = decompress_len(&block).map_err(invalid_data)?;
        if size > MAX_BLOCK {
            return Err(invalid_data(format!("block expands to {} bytes", size)));
        }
        let plain = self.decoder.decompress_vec(&block).map_err(invalid_data)?;
        self.plain_in.extend_from_slice(&plain);
        Ok(true)
    }
}

impl<T: AsyncWrite + Unpin> CompStream<T> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.encoded.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.encoded))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.encoded.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CompStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain_in.is_empty() {
                let n = this.plain_in.len().min(buf.remaining());
                buf.put_slice(&this.plain_in[..n]);
                this.plain_in.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.open_block()? {
                continue;
            }
            if this.eof {
                if this.read_buf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.eof = true;
            } else {
                this.read_buf.extend_from_slice(chunk_buf.filled());
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CompStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.plain_out.len() >= MAX_BLOCK {
            ready!(this.poll_drain(cx))?;
            this.seal_block()?;
        }
        let n = buf.len().min(MAX_BLOCK - this.plain_out.len());
        this.plain_out.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.plain_out.is_empty() {
            ready!(this.poll_drain(cx))?;
            this.seal_block()?;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
