//! Reliable, encrypted connection over UDP
//!
//! A [`ReliableConn`] is a KCP byte stream. The control block writes each
//! outgoing datagram into a channel; a send task wraps it in FEC (when
//! enabled) and the packet cipher and puts it on the wire. Incoming
//! datagrams take the reverse path through the driver task, which also owns
//! the KCP update clock. The `AsyncRead`/`AsyncWrite` side only touches the
//! control block behind a short-lived lock.

use super::fec::{FecDecoder, FecEncoder, FEC_OVERHEAD};
use super::socket;
use super::stats::{self, TransportStats};
use super::TransportError;
use crate::crypto::{self, PacketCipher};
use bytes::{Buf, Bytes, BytesMut};
use kcp::Kcp;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Largest datagram read from the socket
pub(crate) const MAX_DATAGRAM: usize = 65_535;

/// Inbound datagrams queued per connection before new ones are dropped
pub(crate) const INBOUND_QUEUE: usize = 1024;

/// KCP segment header size
pub(crate) const KCP_HEADER_SIZE: usize = 24;

/// MTU of a fresh connection, before the packet overhead is taken off
const DEFAULT_MTU: usize = 1400;

/// Segments a single write may queue. KCP refuses a send that would need
/// more fragments than its receive queue holds.
const MAX_SEGMENTS_PER_WRITE: usize = 64;

const DEFAULT_INTERVAL: u32 = 100;
const DEFAULT_SND_WND: usize = 32;

/// Output sink of the control block: every datagram KCP emits goes to the
/// send task
struct KcpOutput(mpsc::UnboundedSender<Bytes>);

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn kcp_error(e: kcp::Error) -> TransportError {
    TransportError::Protocol(format!("kcp: {:?}", e))
}

fn kcp_io_error(e: kcp::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("kcp: {:?}", e))
}

struct ConnState {
    kcp: Kcp<KcpOutput>,
    fec_decoder: Option<FecDecoder>,
    /// Tail of a segment larger than the caller's buffer
    pending: BytesMut,
    mss: usize,
    snd_wnd: usize,
    interval: u32,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    ack_nodelay: bool,
    closed: bool,
}

impl ConnState {
    fn readable(&self) -> bool {
        !self.pending.is_empty() || self.kcp.peeksize().is_ok()
    }

    fn can_send(&self) -> bool {
        self.kcp.wait_snd() < 2 * self.snd_wnd
    }

    fn wake(&mut self) {
        if self.closed || self.readable() {
            if let Some(w) = self.read_waker.take() {
                w.wake();
            }
        }
        if self.closed || self.can_send() {
            if let Some(w) = self.write_waker.take() {
                w.wake();
            }
        }
    }
}

struct ConnShared {
    state: Mutex<ConnState>,
    flush_notify: Notify,
    shutdown: CancellationToken,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    /// Client sockets are connected, server connections share the listener socket
    connected: bool,
    conv: u32,
    cipher: Arc<PacketCipher>,
    fec: bool,
    stats: Arc<TransportStats>,
    epoch: Instant,
}

impl ConnShared {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Bytes the FEC header and the cipher add to every datagram
    fn overhead(&self) -> usize {
        self.cipher.overhead() + if self.fec { FEC_OVERHEAD } else { 0 }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.closed = true;
                trace!("conv {} closed", self.conv);
            }
            state.wake();
        }
        self.shutdown.cancel();
    }

    /// Feed one decrypted datagram through FEC into KCP
    fn input(&self, packet: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let payloads = match state.fec_decoder.as_mut() {
            Some(decoder) => decoder.decode(packet),
            None => vec![Bytes::copy_from_slice(packet)],
        };
        for payload in payloads {
            if let Err(e) = state.kcp.input(&payload) {
                trace!("dropping segment from {}: {:?}", self.peer, e);
            }
        }

        state.wake();
        if state.ack_nodelay {
            state.kcp.flush().map_err(kcp_error)?;
        }
        Ok(())
    }

    fn update(&self) -> Result<(), TransportError> {
        let current = self.now_ms();
        let mut state = self.state.lock();
        state.kcp.update(current).map_err(kcp_error)?;
        state.wake();
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.kcp.flush().map_err(kcp_error)?;
        state.wake();
        Ok(())
    }

    async fn send_packet(&self, packet: &[u8]) {
        let sealed = match self.cipher.seal(packet) {
            Ok(sealed) => sealed,
            Err(e) => {
                trace!("sealing datagram for {} failed: {}", self.peer, e);
                return;
            }
        };
        let sent = if self.connected {
            self.socket.send(&sealed).await
        } else {
            self.socket.send_to(&sealed, self.peer).await
        };
        match sent {
            Ok(n) => {
                stats::add(&self.stats.out_pkts, 1);
                stats::add(&self.stats.bytes_sent, n as u64);
            }
            Err(e) => trace!("send to {} failed: {}", self.peer, e),
        }
    }
}

/// Owns the KCP clock: update ticks, inbound datagrams and flush requests
async fn drive(shared: Arc<ConnShared>, mut inbound: mpsc::Receiver<Bytes>) {
    let mut interval_ms = shared.state.lock().interval;
    let mut ticker = new_ticker(interval_ms);

    loop {
        let result = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => shared.input(&packet),
                None => break,
            },
            _ = ticker.tick() => shared.update(),
            _ = shared.flush_notify.notified() => shared.flush(),
        };

        if let Err(e) = result {
            debug!("connection to {} failed: {}", shared.peer, e);
            break;
        }

        let current = shared.state.lock().interval;
        if current != interval_ms {
            interval_ms = current;
            ticker = new_ticker(interval_ms);
        }
    }

    shared.close();
}

fn new_ticker(interval_ms: u32) -> time::Interval {
    let period = Duration::from_millis(u64::from(interval_ms));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Wrap every datagram KCP emits and write it to the socket
async fn send_loop(
    shared: Arc<ConnShared>,
    mut output: mpsc::UnboundedReceiver<Bytes>,
    mut encoder: Option<FecEncoder>,
) {
    loop {
        let datagram = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            datagram = output.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };

        match encoder.as_mut() {
            Some(encoder) => {
                for packet in encoder.encode(&datagram) {
                    shared.send_packet(&packet).await;
                }
            }
            None => shared.send_packet(&datagram).await,
        }
    }
}

/// Read, decrypt and queue datagrams for a client connection
async fn recv_loop(shared: Arc<ConnShared>, inbound: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            r = shared.socket.recv(&mut buf) => match r {
                Ok(n) => n,
                // ICMP port unreachable from a restarting server
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    debug!("receive from {} failed: {}", shared.peer, e);
                    shared.close();
                    return;
                }
            },
        };

        stats::add(&shared.stats.in_pkts, 1);
        stats::add(&shared.stats.bytes_received, n as u64);

        match shared.cipher.open(&mut buf[..n]) {
            Ok(plaintext) => {
                let _ = inbound.try_send(Bytes::copy_from_slice(plaintext));
            }
            Err(e) => {
                stats::add(&shared.stats.auth_failures, 1);
                trace!("dropping datagram from {}: {}", shared.peer, e);
            }
        }
    }
}

/// Parameters shared by both ends when building a connection
pub(crate) struct ConnParams {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub connected: bool,
    pub conv: u32,
    pub cipher: Arc<PacketCipher>,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub stats: Arc<TransportStats>,
}

/// A reliable byte stream to one peer
pub struct ReliableConn {
    shared: Arc<ConnShared>,
    local_addr: SocketAddr,
}

impl ReliableConn {
    /// Build a connection and spawn its driver and send task. `on_exit` runs
    /// after the driver stops.
    pub(crate) fn start<F>(
        params: ConnParams,
        inbound: mpsc::Receiver<Bytes>,
        on_exit: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let fec_encoder =
            FecEncoder::new(params.data_shards, params.parity_shards, Arc::clone(&params.stats))?;
        let fec_decoder =
            FecDecoder::new(params.data_shards, params.parity_shards, Arc::clone(&params.stats))?;
        let fec = fec_encoder.is_some();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let kcp = Kcp::new_stream(params.conv, KcpOutput(output_tx));

        let local_addr = params.socket.local_addr()?;
        let shared = Arc::new(ConnShared {
            state: Mutex::new(ConnState {
                kcp,
                fec_decoder,
                pending: BytesMut::new(),
                mss: 0,
                snd_wnd: DEFAULT_SND_WND,
                interval: DEFAULT_INTERVAL,
                read_waker: None,
                write_waker: None,
                ack_nodelay: false,
                closed: false,
            }),
            flush_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            socket: params.socket,
            peer: params.peer,
            connected: params.connected,
            conv: params.conv,
            cipher: params.cipher,
            fec,
            stats: params.stats,
            epoch: Instant::now(),
        });

        let conn = Self { shared, local_addr };
        conn.set_mtu(DEFAULT_MTU)?;

        tokio::spawn(send_loop(Arc::clone(&conn.shared), output_rx, fec_encoder));
        let driver = Arc::clone(&conn.shared);
        tokio::spawn(async move {
            drive(driver, inbound).await;
            on_exit();
        });

        Ok(conn)
    }

    /// Conversation id shared with the peer
    pub fn conv(&self) -> u32 {
        self.shared.conv
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Stop the driver and fail pending reads and writes
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn set_nodelay(&self, nodelay: u32, interval: u32, resend: u32, nc: bool) {
        let interval = interval.clamp(10, 5000);
        {
            let mut state = self.shared.state.lock();
            state
                .kcp
                .set_nodelay(nodelay != 0, interval as i32, resend as i32, nc);
            state.interval = interval;
        }
        self.shared.flush_notify.notify_one();
    }

    pub fn set_window_size(&self, snd: u32, rcv: u32) {
        let clamp = |w: u32| w.min(u32::from(u16::MAX)) as u16;
        let mut state = self.shared.state.lock();
        state.kcp.set_wndsize(clamp(snd), clamp(rcv));
        state.snd_wnd = usize::from(clamp(snd)).max(1);
    }

    /// Set the largest datagram written to the socket
    pub fn set_mtu(&self, mtu: usize) -> Result<(), TransportError> {
        let overhead = self.shared.overhead();
        if mtu <= overhead + KCP_HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "MTU {} leaves no room after the {} byte packet overhead",
                mtu,
                overhead + KCP_HEADER_SIZE
            )));
        }
        let mut state = self.shared.state.lock();
        state.kcp.set_mtu(mtu - overhead).map_err(kcp_error)?;
        state.mss = mtu - overhead - KCP_HEADER_SIZE;
        Ok(())
    }

    pub fn set_ack_nodelay(&self, enabled: bool) {
        self.shared.state.lock().ack_nodelay = enabled;
    }

    pub fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        socket::set_dscp(&self.shared.socket, dscp)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        socket::set_read_buffer(&self.shared.socket, bytes)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        socket::set_write_buffer(&self.shared.socket, bytes)
    }
}

/// Open a connection to `addr` from a fresh ephemeral UDP socket
pub async fn dial(
    addr: &str,
    cipher: Arc<PacketCipher>,
    data_shards: usize,
    parity_shards: usize,
    stats: Arc<TransportStats>,
) -> Result<ReliableConn, TransportError> {
    let peer = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed(format!("{} did not resolve", addr)))?;

    let bind: SocketAddr = if peer.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(peer).await?;
    let socket = Arc::new(socket);

    let conv = crypto::random_u32()?;
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let conn = ReliableConn::start(
        ConnParams {
            socket,
            peer,
            connected: true,
            conv,
            cipher,
            data_shards,
            parity_shards,
            stats: Arc::clone(&stats),
        },
        rx,
        || {},
    )?;

    tokio::spawn(recv_loop(Arc::clone(&conn.shared), tx));
    stats::add(&stats.active_opens, 1);
    debug!("dialed {} conv {}", peer, conv);
    Ok(conn)
}

impl Drop for ReliableConn {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl AsyncRead for ReliableConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.pending.is_empty() {
            let size = match state.kcp.peeksize() {
                Ok(size) => size,
                Err(_) if state.closed => return Poll::Ready(Ok(())),
                Err(_) => {
                    state.read_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            };
            if size <= buf.remaining() {
                let n = state
                    .kcp
                    .recv(buf.initialize_unfilled())
                    .map_err(kcp_io_error)?;
                buf.advance(n);
            } else {
                let mut segment = BytesMut::zeroed(size);
                let n = state.kcp.recv(&mut segment).map_err(kcp_io_error)?;
                segment.truncate(n);
                state.pending = segment;
            }
        }

        if !state.pending.is_empty() {
            let n = state.pending.len().min(buf.remaining());
            buf.put_slice(&state.pending[..n]);
            state.pending.advance(n);
        }

        drop(guard);
        // the receive window may have reopened
        self.shared.flush_notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ReliableConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if !state.can_send() {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let limit = state.mss.max(1) * MAX_SEGMENTS_PER_WRITE;
        let n = state
            .kcp
            .send(&buf[..buf.len().min(limit)])
            .map_err(kcp_io_error)?;
        drop(state);
        self.shared.flush_notify.notify_one();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.flush_notify.notify_one();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close();
        Poll::Ready(Ok(()))
    }
}
