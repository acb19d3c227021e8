use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, warn};

use tickwire_proto::{FrameCodec, FrameError};

use crate::error::CommsError;
use crate::event::ClientId;
use crate::queue::{MessageQueue, Queued};
use crate::stats::CommsStats;

/// A spawned worker thread plus the sender half of its stop channel.
/// Dropping the sender cancels any stop-aware sleep the worker is in.
pub(crate) struct WorkerHandle {
    pub handle: JoinHandle<()>,
    pub stop_tx: Sender<()>,
}

/// Lifecycle of one connection worker.
///
/// The read loop is folded into `Connected`: a worker that finished
/// connecting is already reading. A stopped worker parks at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            _ => Self::Idle,
        }
    }
}

/// State shared between one connection's worker thread and the tick
/// thread.
///
/// The stop flag, the notification flags and the queue are the only
/// two-party fields; everything else is owned by whichever side
/// currently holds the connection.
#[derive(Debug)]
pub(crate) struct LinkShared {
    pub id: ClientId,
    /// Log prefix, e.g. `sensor_tcp_3`.
    pub name: String,
    pub stop: AtomicBool,
    state: AtomicU8,
    pub connect_raised: AtomicBool,
    pub disconnect_raised: AtomicBool,
    /// Live socket. Doubles as the send path: sends lock this to
    /// serialize writes, and `request_stop` uses it to shut the socket
    /// down under a blocked reader.
    pub stream: Mutex<Option<Arc<TcpStream>>>,
    pub queue: Arc<MessageQueue>,
    pub stats: Arc<CommsStats>,
    pub codec: FrameCodec,
}

impl LinkShared {
    pub fn new(
        id: ClientId,
        name: String,
        queue: Arc<MessageQueue>,
        stats: Arc<CommsStats>,
        codec: FrameCodec,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            stop: AtomicBool::new(false),
            state: AtomicU8::new(LinkState::Idle as u8),
            connect_raised: AtomicBool::new(false),
            disconnect_raised: AtomicBool::new(false),
            stream: Mutex::new(None),
            queue,
            stats,
            codec,
        })
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Ask the worker to stop and unblock any in-progress blocking read
    /// by shutting the socket down.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.lock().as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Frame and write one payload on the caller's thread. Concurrent
    /// sends on the same link serialize on the stream lock, so partial
    /// writes never interleave.
    pub fn send(&self, payload: &[u8]) -> Result<(), CommsError> {
        let frame = match self.codec.encode(payload) {
            Ok(frame) => frame,
            Err(e @ FrameError::PayloadTooLarge { .. }) => {
                self.stats.record_rejected_send();
                error!(link = %self.name, "{e}; dropping send");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let guard = self.stream.lock();
        let Some(stream) = guard.as_ref() else {
            warn!(link = %self.name, "not connected, dropping message");
            return Err(CommsError::NotConnected);
        };
        let mut writer = stream.as_ref();
        if let Err(e) = writer.write_all(&frame) {
            warn!(link = %self.name, error = %e, "send failed");
            self.stats.record_stream_error();
            return Err(e.into());
        }
        self.stats.record_message_sent(frame.len());
        Ok(())
    }
}

/// Why a read loop ended.
pub(crate) enum ReadEnd {
    /// Zero-byte read: the peer shut down cleanly.
    PeerClosed,
    /// Our own stop flag was observed.
    Stopped,
    Failed(FrameError),
}

/// Counts received bytes as they stream in.
struct MeteredReader<'a> {
    inner: &'a TcpStream,
    stats: &'a CommsStats,
}

impl Read for MeteredReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut inner = self.inner;
        let n = inner.read(buf)?;
        self.stats.record_packet_received(n);
        Ok(n)
    }
}

/// Pull whole messages off the socket until stop, close, or error.
///
/// The connect flag is expected to be raised before this runs, so every
/// pushed message trails its connect notification.
pub(crate) fn read_loop(shared: &LinkShared, stream: &TcpStream) -> ReadEnd {
    let mut reader = MeteredReader {
        inner: stream,
        stats: shared.stats.as_ref(),
    };
    while !shared.stop_requested() {
        match shared.codec.read_one(&mut reader) {
            Ok(frame) => {
                shared.stats.record_message_received();
                shared.queue.push(Queued {
                    client: shared.id,
                    frame,
                });
            }
            Err(_) if shared.stop_requested() => return ReadEnd::Stopped,
            Err(FrameError::PeerClosed) => return ReadEnd::PeerClosed,
            Err(e) => return ReadEnd::Failed(e),
        }
    }
    ReadEnd::Stopped
}

/// Sleep that ends early when the stop channel fires. Returns false when
/// the worker should exit instead of retrying.
pub(crate) fn stop_aware_sleep(stop_rx: &Receiver<()>, dur: Duration) -> bool {
    match stop_rx.recv_timeout(dur) {
        Err(RecvTimeoutError::Timeout) => true,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
    }
}

/// Join a worker with a bounded wait. A thread that will not exit is
/// loudly detached rather than silently leaked; cooperative cancellation
/// via the closed socket is the primary mechanism, this is the backstop.
pub(crate) fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!(worker = name, ?timeout, "worker thread did not exit in time; detaching");
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        error!(worker = name, "worker thread panicked");
    }
}
