// Logical streams carried by a mux session
// Each stream is an independent bidirectional byte pipe with its own
// credit window in each direction. Handles implement AsyncRead/AsyncWrite
// so bridges can treat them like sockets.

use crate::frame::Frame;
use crate::MAX_FRAME_PAYLOAD;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// RST error codes
pub const RST_CANCEL: u32 = 1;
pub const RST_PROTOCOL: u32 = 2;
pub const RST_REFUSED: u32 = 3;
pub const RST_SESSION_CLOSED: u32 = 4;

/// Shared per-stream state, owned by the session and referenced by the
/// stream handle
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) window: u32,
    pub(crate) inner: Mutex<StreamInner>,
    /// Receiver-side control frames (WIN_UPDATE, RST) bypass the data queue
    pub(crate) ctrl: mpsc::UnboundedSender<Frame>,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    recv_buf: VecDeque<Bytes>,
    /// Credit currently granted to the peer for this direction
    recv_window: u32,
    /// Bytes consumed by the reader since the last WIN_UPDATE
    consumed: u32,
    recv_closed: bool,
    reset: Option<u32>,
    read_waker: Option<Waker>,
    /// Credit the peer has granted us
    send_credit: u32,
    write_waker: Option<Waker>,
    write_closed: bool,
}

impl StreamShared {
    pub(crate) fn new(id: u32, window: u32, ctrl: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(StreamShared {
            id,
            window,
            ctrl,
            inner: Mutex::new(StreamInner {
                recv_buf: VecDeque::new(),
                recv_window: window,
                consumed: 0,
                recv_closed: false,
                reset: None,
                read_waker: None,
                send_credit: window,
                write_waker: None,
                write_closed: false,
            }),
        })
    }

    /// Buffer inbound DATA. Returns false on a flow-control violation
    /// (payload exceeds remaining granted credit) or data after FIN;
    /// the session answers those with RST.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        let mut st = self.inner.lock().unwrap();
        if st.reset.is_some() {
            return true; // stream already dead, drop silently
        }
        if st.recv_closed {
            return false;
        }
        if data.len() as u32 > st.recv_window {
            return false;
        }
        st.recv_window -= data.len() as u32;
        st.recv_buf.push_back(data);
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        true
    }

    pub(crate) fn recv_fin(&self) {
        let mut st = self.inner.lock().unwrap();
        st.recv_closed = true;
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
    }

    pub(crate) fn grant_credit(&self, increment: u32) {
        let mut st = self.inner.lock().unwrap();
        st.send_credit = st.send_credit.saturating_add(increment);
        if let Some(w) = st.write_waker.take() {
            w.wake();
        }
    }

    /// Abortive termination: RST received, protocol violation, or the
    /// session died underneath the stream
    pub(crate) fn fail(&self, code: u32) {
        let mut st = self.inner.lock().unwrap();
        if st.reset.is_none() {
            st.reset = Some(code);
        }
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        if let Some(w) = st.write_waker.take() {
            w.wake();
        }
    }

    fn is_fully_closed(&self) -> bool {
        let st = self.inner.lock().unwrap();
        st.reset.is_some() || (st.recv_closed && st.write_closed)
    }
}

/// Handle to one logical stream inside a mux session
pub struct MuxStream {
    shared: Arc<StreamShared>,
    data_out: PollSender<Frame>,
    drop_tx: mpsc::UnboundedSender<u32>,
    header: Bytes,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.shared.id).finish()
    }
}

impl MuxStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        data_tx: mpsc::Sender<Frame>,
        drop_tx: mpsc::UnboundedSender<u32>,
        header: Bytes,
    ) -> Self {
        MuxStream { shared, data_out: PollSender::new(data_tx), drop_tx, header }
    }

    /// Stream id within the session
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Opaque header carried in the SYN frame that opened this stream.
    /// Empty for locally opened streams.
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    /// Abortively close both directions
    pub fn close(&mut self) {
        let already_reset = {
            let mut st = self.shared.inner.lock().unwrap();
            let was = st.reset.is_some();
            if !was {
                st.reset = Some(RST_CANCEL);
            }
            was
        };
        if !already_reset {
            let _ = self.shared.ctrl.send(Frame::rst(self.shared.id, RST_CANCEL));
        }
    }

    fn reset_error(code: u32) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, format!("stream reset (code {})", code))
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        let mut st = shared.inner.lock().unwrap();

        if let Some(code) = st.reset {
            return Poll::Ready(Err(Self::reset_error(code)));
        }

        if let Some(chunk) = st.recv_buf.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            if n == chunk.len() {
                st.recv_buf.pop_front();
            } else {
                let _ = chunk.split_to(n);
            }

            // Refill the peer's credit once we've consumed half a window
            st.consumed += n as u32;
            if st.consumed >= shared.window / 2 {
                let increment = st.consumed;
                st.consumed = 0;
                st.recv_window = st.recv_window.saturating_add(increment);
                let _ = shared.ctrl.send(Frame::win_update(shared.id, increment));
            }
            return Poll::Ready(Ok(()));
        }

        if st.recv_closed {
            return Poll::Ready(Ok(()));
        }

        st.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        {
            let mut st = self.shared.inner.lock().unwrap();
            if let Some(code) = st.reset {
                return Poll::Ready(Err(Self::reset_error(code)));
            }
            if st.write_closed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write after close",
                )));
            }
            if st.send_credit == 0 {
                st.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }

        match self.data_out.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            ))),
            Poll::Ready(Ok(())) => {
                let id = self.shared.id;
                let outcome = {
                    let mut st = self.shared.inner.lock().unwrap();
                    match st.reset {
                        Some(code) => Err(code),
                        None => {
                            let n =
                                buf.len().min(st.send_credit as usize).min(MAX_FRAME_PAYLOAD);
                            st.send_credit -= n as u32;
                            Ok(n)
                        }
                    }
                };
                let n = match outcome {
                    Ok(n) => n,
                    Err(code) => {
                        self.data_out.abort_send();
                        return Poll::Ready(Err(Self::reset_error(code)));
                    }
                };
                let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
                if self.data_out.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "session closed",
                    )));
                }
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session writer as they drain
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        {
            let st = self.shared.inner.lock().unwrap();
            if st.write_closed || st.reset.is_some() {
                return Poll::Ready(Ok(()));
            }
        }
        // FIN rides the data queue so it cannot overtake queued DATA
        match self.data_out.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Ok(())) => {
                let id = self.shared.id;
                {
                    let mut st = self.shared.inner.lock().unwrap();
                    st.write_closed = true;
                }
                let _ = self.data_out.send_item(Frame::fin(id));
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.shared.is_fully_closed() {
            let mut st = self.shared.inner.lock().unwrap();
            if st.reset.is_none() {
                st.reset = Some(RST_CANCEL);
                let _ = self.shared.ctrl.send(Frame::rst(self.shared.id, RST_CANCEL));
            }
        }
        let _ = self.drop_tx.send(self.shared.id);
    }
}
