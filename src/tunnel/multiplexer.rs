//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single reliable connection. Three
//! tasks serve each session: a reader that decodes frames and routes them to
//! streams, a writer that drains the frame queue, and a keep-alive timer.
//!
//! Received data is accounted against a session-wide budget of
//! `max_receive_buffer` bytes. The reader stops pulling from the connection
//! while the budget is spent, and application reads give it back.

use super::stream::{MuxStream, StreamShared};
use super::{Frame, FrameType, MuxConfig, Session, TunnelError};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Outbound frames queued before writers wait
const FRAME_QUEUE: usize = 1024;

/// Inbound streams waiting for `accept_stream`
const ACCEPT_BACKLOG: usize = 1024;

/// Reader buffer growth step
const READ_CHUNK: usize = 64 * 1024;

/// Session state shared by the handle, its streams and its tasks
pub(super) struct SessionInner {
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    frame_tx: mpsc::Sender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    bucket: AtomicI64,
    bucket_notify: Notify,
    data_ready: AtomicBool,
    shutdown: CancellationToken,
    /// Next stream ID (odd for client, even for server)
    next_stream_id: AtomicU32,
    config: MuxConfig,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl SessionInner {
    pub(super) fn frame_sender(&self) -> mpsc::Sender<Frame> {
        self.frame_tx.clone()
    }

    pub(super) fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    pub(super) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Give consumed bytes back to the receive budget
    pub(super) fn return_tokens(&self, n: usize) {
        if n == 0 {
            return;
        }
        let before = self.bucket.fetch_add(n as i64, Ordering::AcqRel);
        if before <= 0 {
            self.bucket_notify.notify_one();
        }
    }

    pub(super) fn remove_stream(&self, id: u32, unread: usize) {
        self.streams.lock().remove(&id);
        self.return_tokens(unread);
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            stream.wake();
        }
        debug!("session {} -> {} closed", self.local_addr, self.remote_addr);
    }

    async fn wait_for_budget(&self) {
        while self.bucket.load(Ordering::Acquire) <= 0 {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.bucket_notify.notified() => {}
            }
        }
    }

    async fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> Result<(), TunnelError> {
        match frame.frame_type {
            FrameType::Syn => {
                let shared = {
                    let mut streams = self.streams.lock();
                    if streams.contains_key(&frame.stream_id) {
                        return Ok(());
                    }
                    let shared = Arc::new(StreamShared::new(frame.stream_id));
                    streams.insert(frame.stream_id, Arc::clone(&shared));
                    shared
                };
                let stream = MuxStream::new(shared, Arc::clone(self));
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    r = accept_tx.send(stream) => {
                        if r.is_err() {
                            trace!("accept queue gone, dropping stream {}", frame.stream_id);
                        }
                    }
                }
            }
            FrameType::Fin => {
                let stream = self.streams.lock().get(&frame.stream_id).cloned();
                if let Some(stream) = stream {
                    stream.remote_fin();
                }
            }
            FrameType::Psh => {
                if frame.payload.is_empty() {
                    return Ok(());
                }
                let stream = self.streams.lock().get(&frame.stream_id).cloned();
                match stream {
                    Some(stream) => {
                        self.bucket
                            .fetch_sub(frame.payload.len() as i64, Ordering::AcqRel);
                        stream.push(frame.payload);
                    }
                    None => trace!("data for unknown stream {}", frame.stream_id),
                }
            }
            FrameType::Nop => {}
        }
        Ok(())
    }

    async fn recv_loop<R>(
        self: Arc<Self>,
        mut reader: R,
        accept_tx: mpsc::Sender<MuxStream>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            while let Some(frame) = Frame::decode(&mut buf)? {
                self.data_ready.store(true, Ordering::Release);
                self.handle_frame(frame, &accept_tx).await?;
            }

            self.wait_for_budget().await;
            if self.is_closed() {
                return Ok(());
            }

            buf.reserve(READ_CHUNK);
            if reader.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn send_loop<W>(
        self: Arc<Self>,
        mut writer: W,
        mut frames: mpsc::Receiver<Frame>,
    ) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = frames.recv().await {
            writer.write_all(&frame.encode()?).await?;
            // batch whatever else is already queued before flushing
            while let Ok(frame) = frames.try_recv() {
                writer.write_all(&frame.encode()?).await?;
            }
            writer.flush().await?;
        }
        Ok(())
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config.keep_alive_interval;
        let timeout = self.config.keep_alive_timeout;
        let mut ping = time::interval_at(Instant::now() + interval, interval);
        let mut check = time::interval_at(Instant::now() + timeout, timeout);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ping.tick() => {
                    let _ = self.frame_tx.try_send(Frame::nop());
                }
                _ = check.tick() => {
                    // a paused reader is not a dead peer
                    if !self.data_ready.swap(false, Ordering::AcqRel)
                        && self.bucket.load(Ordering::Acquire) > 0
                    {
                        debug!("session {} keep-alive timeout", self.remote_addr);
                        self.close();
                        return;
                    }
                }
            }
        }
    }
}

/// A multiplexed session over one reliable connection
///
/// Dropping the handle closes the session.
pub struct MuxSession {
    inner: Arc<SessionInner>,
}

impl MuxSession {
    /// Client side: opens odd stream ids
    pub fn client<T>(
        conn: T,
        config: MuxConfig,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, 1, local_addr, remote_addr)
    }

    /// Server side: opens even stream ids
    pub fn server<T>(
        conn: T,
        config: MuxConfig,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, 2, local_addr, remote_addr)
    }

    fn new<T>(
        conn: T,
        config: MuxConfig,
        first_stream_id: u32,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let inner = Arc::new(SessionInner {
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            bucket: AtomicI64::new(config.max_receive_buffer as i64),
            bucket_notify: Notify::new(),
            data_ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            next_stream_id: AtomicU32::new(first_stream_id),
            config,
            local_addr,
            remote_addr,
        });

        let (reader, writer) = tokio::io::split(conn);

        let session = Arc::clone(&inner);
        tokio::spawn(async move {
            let token = session.shutdown.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                r = Arc::clone(&session).recv_loop(reader, accept_tx) => {
                    if let Err(e) = r {
                        debug!("session {} read error: {}", session.remote_addr, e);
                    }
                    session.close();
                }
            }
        });

        let session = Arc::clone(&inner);
        tokio::spawn(async move {
            let token = session.shutdown.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                r = Arc::clone(&session).send_loop(writer, frame_rx) => {
                    if let Err(e) = r {
                        debug!("session {} write error: {}", session.remote_addr, e);
                    }
                    session.close();
                }
            }
        });

        tokio::spawn(Arc::clone(&inner).keepalive_loop());

        Self { inner }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[async_trait]
impl Session for MuxSession {
    type Stream = MuxStream;

    async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.inner.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let id = self.inner.next_stream_id.fetch_add(2, Ordering::AcqRel);
        if id > u32::MAX - 2 {
            return Err(TunnelError::StreamIdsExhausted);
        }

        let shared = Arc::new(StreamShared::new(id));
        self.inner.streams.lock().insert(id, Arc::clone(&shared));
        let stream = MuxStream::new(shared, Arc::clone(&self.inner));

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(TunnelError::SessionClosed),
            r = self.inner.frame_tx.send(Frame::syn(id)) => {
                r.map_err(|_| TunnelError::SessionClosed)?;
                Ok(stream)
            }
        }
    }

    async fn accept_stream(&self) -> Result<MuxStream, TunnelError> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(TunnelError::SessionClosed),
            stream = accept_rx.recv() => stream.ok_or(TunnelError::SessionClosed),
        }
    }

    fn num_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }
}
