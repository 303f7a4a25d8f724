//! Bidirectional copy between two byte streams
//!
//! Used for both TCP ↔ virtual stream on the client and virtual stream ↔
//! target TCP on the server. The relay ends as soon as either direction does;
//! the other direction is aborted, which drops every half and so closes both
//! endpoints.

mod buffer;

pub use buffer::{BufferPool, PooledBuffer, RELAY_BUFFER_SIZE};

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Copies between two endpoints using pooled buffers
#[derive(Clone, Default)]
pub struct Relay {
    pool: Arc<BufferPool>,
}

impl Relay {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// Pump bytes both ways until one direction finishes. `route` names
    /// the two ends in the log.
    pub async fn run<A, B>(&self, route: &str, a: A, b: B)
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!("stream opened {}", route);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let mut a_to_b = tokio::spawn(copy(a_read, b_write, self.pool.get()));
        let mut b_to_a = tokio::spawn(copy(b_read, a_write, self.pool.get()));

        let (finished, result) = tokio::select! {
            r = &mut a_to_b => {
                b_to_a.abort();
                ("a -> b", r)
            }
            r = &mut b_to_a => {
                a_to_b.abort();
                ("b -> a", r)
            }
        };

        match result {
            Ok(Ok(bytes)) => debug!("relay {} finished after {} bytes", finished, bytes),
            Ok(Err(e)) => debug!("relay {} ended: {}", finished, e),
            Err(e) => debug!("relay {} task failed: {}", finished, e),
        }
        info!("stream closed {}", route);
    }
}

async fn copy<R, W>(mut reader: R, mut writer: W, mut buf: PooledBuffer) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
