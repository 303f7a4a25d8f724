//! Multiplexed stream implementation

use super::multiplexer::SessionInner;
use super::Frame;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::PollSender;
use tracing::trace;

/// Receive side of a stream, filled by the session reader
#[derive(Default)]
pub(super) struct RecvState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    read_waker: Option<Waker>,
    remote_fin: bool,
}

/// Stream state shared with the session
pub(super) struct StreamShared {
    pub(super) id: u32,
    recv: Mutex<RecvState>,
}

impl StreamShared {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            recv: Mutex::new(RecvState::default()),
        }
    }

    /// Queue payload from a PSH frame
    pub(super) fn push(&self, data: Bytes) {
        let mut recv = self.recv.lock();
        recv.buffered += data.len();
        recv.chunks.push_back(data);
        if let Some(w) = recv.read_waker.take() {
            w.wake();
        }
    }

    /// The peer will send nothing more
    pub(super) fn remote_fin(&self) {
        let mut recv = self.recv.lock();
        recv.remote_fin = true;
        if let Some(w) = recv.read_waker.take() {
            w.wake();
        }
    }

    pub(super) fn wake(&self) {
        if let Some(w) = self.recv.lock().read_waker.take() {
            w.wake();
        }
    }
}

/// A virtual byte stream inside a [`MuxSession`](super::MuxSession)
pub struct MuxStream {
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
    sender: PollSender<Frame>,
    write_closed: bool,
}

impl MuxStream {
    pub(super) fn new(shared: Arc<StreamShared>, session: Arc<SessionInner>) -> Self {
        let sender = PollSender::new(session.frame_sender());
        Self {
            shared,
            session,
            sender,
            write_closed: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

fn broken_pipe() -> io::Error {
    io::ErrorKind::BrokenPipe.into()
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut recv = self.shared.recv.lock();

        let mut n = 0;
        while buf.remaining() > 0 {
            let Some(chunk) = recv.chunks.front_mut() else {
                break;
            };
            let take = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..take]);
            chunk.advance(take);
            n += take;
            if chunk.is_empty() {
                recv.chunks.pop_front();
            }
        }

        if n > 0 {
            recv.buffered -= n;
            drop(recv);
            self.session.return_tokens(n);
            return Poll::Ready(Ok(()));
        }

        if recv.remote_fin || self.session.is_closed() {
            return Poll::Ready(Ok(()));
        }

        recv.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed || self.session.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.sender.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let n = buf.len().min(self.session.max_frame_size());
        let frame = Frame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n]));
        self.sender.send_item(frame).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.session.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        if self.session.is_closed() {
            self.write_closed = true;
            return Poll::Ready(Ok(()));
        }

        ready!(self.sender.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let id = self.shared.id;
        self.sender.send_item(Frame::fin(id)).map_err(|_| broken_pipe())?;
        self.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let unread = {
            let mut recv = self.shared.recv.lock();
            recv.chunks.clear();
            std::mem::take(&mut recv.buffered)
        };
        self.session.remove_stream(self.shared.id, unread);

        if self.write_closed || self.session.is_closed() {
            return;
        }

        // a reservation taken by a pending write would otherwise hold a slot
        self.sender.abort_send();
        let fin = Frame::fin(self.shared.id);
        if let Err(e) = self.session.frame_sender().try_send(fin) {
            let fin = e.into_inner();
            let tx = self.session.frame_sender();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = tx.send(fin).await;
                    });
                }
                Err(_) => trace!("no runtime to send FIN for stream {}", self.shared.id),
            }
        }
    }
}
