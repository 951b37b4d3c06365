// Mux session lifecycle
// One session per transport connection. A reader task decodes frames and
// dispatches to streams, a writer task drains the outbound queues (single
// writer invariant), and a keepalive task probes the peer with PINGs.

use crate::frame::{self, Frame, FrameType, FLAG_ACK};
use crate::stream::{MuxStream, StreamShared, RST_PROTOCOL, RST_REFUSED, RST_SESSION_CLOSED};
use crate::{MuxError, MuxResult, DEFAULT_WINDOW};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which end of the transport this session is; decides stream id parity
/// (client-initiated streams are odd, server-initiated even)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn first_stream_id(self) -> u32 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }

    /// Parity of stream ids the peer is allowed to open
    fn peer_ids_odd(self) -> bool {
        matches!(self, Side::Server)
    }
}

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Per-direction credit window for each stream
    pub window: u32,
    /// Send a PING when the write side has been idle this long
    pub keepalive_interval: Duration,
    /// Maximum concurrent streams
    pub max_streams: usize,
    /// Queued inbound streams before SYNs are refused
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            window: DEFAULT_WINDOW,
            keepalive_interval: Duration::from_secs(30),
            max_streams: 1024,
            accept_backlog: 64,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Local call to `close`
    Local(String),
    /// Keepalive pings went unanswered
    Timeout,
    /// Peer broke the framing contract
    Protocol(String),
    /// Transport read/write failure or EOF
    Transport(String),
}

struct SessionInner {
    streams: HashMap<u32, Arc<StreamShared>>,
    next_stream_id: u32,
    highest_peer_id: u32,
    goaway_sent: Option<u32>,
    goaway_received: Option<u32>,
    pending_pings: HashMap<u64, (Instant, oneshot::Sender<Duration>)>,
    missed_pings: u32,
    close_reason: Option<CloseReason>,
}

struct SessionShared {
    side: Side,
    config: MuxConfig,
    data_tx: mpsc::Sender<Frame>,
    ctrl_tx: mpsc::UnboundedSender<Frame>,
    drop_tx: mpsc::UnboundedSender<u32>,
    inner: Mutex<SessionInner>,
    cancel: CancellationToken,
    closed_tx: watch::Sender<bool>,
    /// Milliseconds since `started` of the last frame written
    last_write_ms: AtomicU64,
    ping_nonce: AtomicU64,
    started: Instant,
}

/// Handle to a live mux session. Cheap to clone.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<SessionShared>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
    control: Arc<Mutex<Option<MuxStream>>>,
    closed_rx: watch::Receiver<bool>,
}

impl MuxSession {
    /// Start a session over `io`, spawning its reader/writer/keepalive tasks
    pub fn new<I>(io: I, side: Side, config: MuxConfig) -> MuxSession
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let (data_tx, data_rx) = mpsc::channel::<Frame>(64);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Frame>();
        let (drop_tx, drop_rx) = mpsc::unbounded_channel::<u32>();
        let (incoming_tx, incoming_rx) = mpsc::channel::<MuxStream>(config.accept_backlog);
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            side,
            config,
            data_tx,
            ctrl_tx,
            drop_tx,
            inner: Mutex::new(SessionInner {
                streams: HashMap::new(),
                next_stream_id: side.first_stream_id(),
                highest_peer_id: 0,
                goaway_sent: None,
                goaway_received: None,
                pending_pings: HashMap::new(),
                missed_pings: 0,
                close_reason: None,
            }),
            cancel: CancellationToken::new(),
            closed_tx,
            last_write_ms: AtomicU64::new(0),
            ping_nonce: AtomicU64::new(1),
            started: Instant::now(),
        });

        // Stream 0 is implicitly open on both sides for the control protocol
        let control_shared = StreamShared::new(0, shared.config.window, shared.ctrl_tx.clone());
        shared.inner.lock().unwrap().streams.insert(0, control_shared.clone());
        let control_stream = MuxStream::new(
            control_shared,
            shared.data_tx.clone(),
            shared.drop_tx.clone(),
            Bytes::new(),
        );

        tokio::spawn(reader_task(shared.clone(), rd, incoming_tx));
        tokio::spawn(writer_task(shared.clone(), wr, data_rx, ctrl_rx));
        tokio::spawn(keepalive_task(shared.clone()));
        tokio::spawn(reaper_task(shared.clone(), drop_rx));

        MuxSession {
            shared,
            incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            control: Arc::new(Mutex::new(Some(control_stream))),
            closed_rx,
        }
    }

    pub fn client<I>(io: I, config: MuxConfig) -> MuxSession
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        MuxSession::new(io, Side::Client, config)
    }

    pub fn server<I>(io: I, config: MuxConfig) -> MuxSession
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        MuxSession::new(io, Side::Server, config)
    }

    /// Take the stream 0 handle. Returns `None` after the first call.
    pub fn take_control_stream(&self) -> Option<MuxStream> {
        self.control.lock().unwrap().take()
    }

    /// Open a new stream with an empty header
    pub async fn open_stream(&self) -> MuxResult<MuxStream> {
        self.open_stream_with_header(Bytes::new()).await
    }

    /// Open a new stream; `header` rides in the SYN payload and is
    /// surfaced by the peer's `accept_stream`
    pub async fn open_stream_with_header(&self, header: Bytes) -> MuxResult<MuxStream> {
        let (id, stream) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.close_reason.is_some() || inner.goaway_received.is_some() {
                return Err(MuxError::SessionClosed);
            }
            if inner.streams.len() >= self.shared.config.max_streams {
                return Err(MuxError::StreamLimit);
            }
            let id = inner.next_stream_id;
            inner.next_stream_id += 2;
            let shared = StreamShared::new(id, self.shared.config.window, self.shared.ctrl_tx.clone());
            inner.streams.insert(id, shared.clone());
            let stream = MuxStream::new(
                shared,
                self.shared.data_tx.clone(),
                self.shared.drop_tx.clone(),
                Bytes::new(),
            );
            (id, stream)
        };

        // SYN rides the data queue so it precedes any DATA for this stream
        self.shared
            .data_tx
            .send(Frame::syn(id, header))
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        Ok(stream)
    }

    /// Next stream the peer opened
    pub async fn accept_stream(&self) -> MuxResult<MuxStream> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(MuxError::SessionClosed)
    }

    /// Round-trip probe
    pub async fn ping(&self) -> MuxResult<Duration> {
        let nonce = self.shared.ping_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.close_reason.is_some() {
                return Err(MuxError::SessionClosed);
            }
            inner.pending_pings.insert(nonce, (Instant::now(), tx));
        }
        self.shared
            .ctrl_tx
            .send(Frame::ping(nonce, false))
            .map_err(|_| MuxError::SessionClosed)?;
        rx.await.map_err(|_| MuxError::SessionClosed)
    }

    /// Announce that no new peer-initiated streams will be accepted;
    /// existing streams drain
    pub fn goaway(&self) {
        let last = {
            let mut inner = self.shared.inner.lock().unwrap();
            let last = inner.highest_peer_id;
            inner.goaway_sent = Some(last);
            last
        };
        let _ = self.shared.ctrl_tx.send(Frame::goaway(last));
    }

    /// Close the session, failing all streams
    pub async fn close(&self, reason: &str) {
        self.goaway();
        // Give the writer a beat to flush the GOAWAY
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown(&self.shared, CloseReason::Local(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve when the session has fully closed
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Why the session closed, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.inner.lock().unwrap().close_reason.clone()
    }

    /// Number of live streams (including stream 0)
    pub fn stream_count(&self) -> usize {
        self.shared.inner.lock().unwrap().streams.len()
    }
}

fn shutdown(shared: &Arc<SessionShared>, reason: CloseReason) {
    let streams: Vec<Arc<StreamShared>> = {
        let mut inner = shared.inner.lock().unwrap();
        if inner.close_reason.is_some() {
            return;
        }
        debug!(?reason, "mux session closing");
        inner.close_reason = Some(reason);
        inner.pending_pings.clear();
        inner.streams.drain().map(|(_, s)| s).collect()
    };
    for stream in streams {
        stream.fail(RST_SESSION_CLOSED);
    }
    shared.cancel.cancel();
    let _ = shared.closed_tx.send(true);
}

async fn reader_task<R>(
    shared: Arc<SessionShared>,
    mut rd: R,
    incoming_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    // Anything larger than a window could never pass flow control
    let max_payload = shared.config.window as usize;
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            f = frame::read_frame(&mut rd, max_payload) => f,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(MuxError::Io(e)) => {
                shutdown(&shared, CloseReason::Transport(e));
                break;
            }
            Err(e) => {
                shutdown(&shared, CloseReason::Protocol(e.to_string()));
                break;
            }
        };
        if let Err(e) = handle_frame(&shared, frame, &incoming_tx) {
            shutdown(&shared, CloseReason::Protocol(e.to_string()));
            break;
        }
    }
}

fn handle_frame(
    shared: &Arc<SessionShared>,
    frame: Frame,
    incoming_tx: &mpsc::Sender<MuxStream>,
) -> MuxResult<()> {
    match frame.typ {
        FrameType::Syn => handle_syn(shared, frame, incoming_tx),
        FrameType::Data => {
            let stream = shared.inner.lock().unwrap().streams.get(&frame.stream_id).cloned();
            match stream {
                Some(s) => {
                    if !s.push_data(frame.payload) {
                        // Credit overrun or data after FIN: reset the stream
                        warn!(stream_id = frame.stream_id, "flow control violation, resetting stream");
                        s.fail(RST_PROTOCOL);
                        shared.inner.lock().unwrap().streams.remove(&frame.stream_id);
                        let _ = shared.ctrl_tx.send(Frame::rst(frame.stream_id, RST_PROTOCOL));
                    }
                }
                None => {
                    let _ = shared.ctrl_tx.send(Frame::rst(frame.stream_id, RST_REFUSED));
                }
            }
            Ok(())
        }
        FrameType::WinUpdate => {
            let increment = frame.payload_u32()?;
            let stream = shared.inner.lock().unwrap().streams.get(&frame.stream_id).cloned();
            if let Some(s) = stream {
                s.grant_credit(increment);
            }
            Ok(())
        }
        FrameType::Fin => {
            let stream = shared.inner.lock().unwrap().streams.get(&frame.stream_id).cloned();
            if let Some(s) = stream {
                s.recv_fin();
            }
            Ok(())
        }
        FrameType::Rst => {
            let code = frame.payload_u32().unwrap_or(0);
            let stream = shared.inner.lock().unwrap().streams.remove(&frame.stream_id);
            if let Some(s) = stream {
                s.fail(code);
            }
            Ok(())
        }
        FrameType::Ping => {
            if frame.flags & FLAG_ACK != 0 {
                let nonce = frame.payload_u64()?;
                let mut inner = shared.inner.lock().unwrap();
                inner.missed_pings = 0;
                if let Some((sent, tx)) = inner.pending_pings.remove(&nonce) {
                    let _ = tx.send(sent.elapsed());
                }
            } else {
                let nonce = frame.payload_u64()?;
                let _ = shared.ctrl_tx.send(Frame::ping(nonce, true));
            }
            Ok(())
        }
        FrameType::GoAway => {
            let last = frame.payload_u32()?;
            let doomed: Vec<Arc<StreamShared>> = {
                let mut inner = shared.inner.lock().unwrap();
                inner.goaway_received = Some(last);
                let ids: Vec<u32> = inner
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id != 0 && *id > last && (*id % 2 == shared.side.first_stream_id() % 2))
                    .collect();
                ids.iter().filter_map(|id| inner.streams.remove(id)).collect()
            };
            for s in doomed {
                s.fail(RST_REFUSED);
            }
            Ok(())
        }
    }
}

fn handle_syn(
    shared: &Arc<SessionShared>,
    frame: Frame,
    incoming_tx: &mpsc::Sender<MuxStream>,
) -> MuxResult<()> {
    let id = frame.stream_id;
    if id == 0 {
        return Err(MuxError::Protocol("SYN on reserved stream 0".to_string()));
    }
    let peer_odd = shared.side.peer_ids_odd();
    if (id % 2 == 1) != peer_odd {
        return Err(MuxError::Protocol(format!("SYN with wrong id parity: {}", id)));
    }

    let stream = {
        let mut inner = shared.inner.lock().unwrap();
        if id <= inner.highest_peer_id {
            return Err(MuxError::Protocol(format!("SYN reuses stream id {}", id)));
        }
        inner.highest_peer_id = id;

        if let Some(limit) = inner.goaway_sent {
            if id > limit {
                let _ = shared.ctrl_tx.send(Frame::rst(id, RST_REFUSED));
                return Ok(());
            }
        }
        if inner.streams.len() >= shared.config.max_streams {
            let _ = shared.ctrl_tx.send(Frame::rst(id, RST_REFUSED));
            return Ok(());
        }

        let stream_shared = StreamShared::new(id, shared.config.window, shared.ctrl_tx.clone());
        inner.streams.insert(id, stream_shared.clone());
        MuxStream::new(
            stream_shared,
            shared.data_tx.clone(),
            shared.drop_tx.clone(),
            frame.payload,
        )
    };

    if let Err(e) = incoming_tx.try_send(stream) {
        // Acceptor gone or backlog full; the dropped handle sends the RST
        debug!(stream_id = id, "refusing inbound stream: {}", e);
        shared.inner.lock().unwrap().streams.remove(&id);
    }
    Ok(())
}

async fn writer_task<W>(
    shared: Arc<SessionShared>,
    mut wr: W,
    mut data_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            f = ctrl_rx.recv() => f,
            f = data_rx.recv() => f,
        };
        let frame = match frame {
            Some(f) => f,
            None => break,
        };
        if let Err(e) = frame::write_frame(&mut wr, &frame).await {
            shutdown(&shared, CloseReason::Transport(e.to_string()));
            break;
        }
        shared
            .last_write_ms
            .store(shared.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
    let _ = wr.shutdown().await;
}

async fn keepalive_task(shared: Arc<SessionShared>) {
    let interval = shared.config.keepalive_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let idle_ms = (shared.started.elapsed().as_millis() as u64)
            .saturating_sub(shared.last_write_ms.load(Ordering::Relaxed));
        if idle_ms < interval.as_millis() as u64 {
            continue;
        }
        let timed_out = {
            let mut inner = shared.inner.lock().unwrap();
            if inner.missed_pings >= 3 {
                true
            } else {
                inner.missed_pings += 1;
                false
            }
        };
        if timed_out {
            shutdown(&shared, CloseReason::Timeout);
            return;
        }
        let nonce = shared.ping_nonce.fetch_add(1, Ordering::Relaxed);
        if shared.ctrl_tx.send(Frame::ping(nonce, false)).is_err() {
            return;
        }
    }
}

/// Removes dropped stream handles from the session table
async fn reaper_task(shared: Arc<SessionShared>, mut drop_rx: mpsc::UnboundedReceiver<u32>) {
    loop {
        let id = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            m = drop_rx.recv() => match m {
                Some(id) => id,
                None => return,
            },
        };
        shared.inner.lock().unwrap().streams.remove(&id);
    }
}
