use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use tracing::{debug, error, info, warn};

use tickwire_proto::{Endpoint, FrameCodec};

use crate::config::Config;
use crate::error::CommsError;
use crate::event::{CommsHandler, next_client_id};
use crate::queue::MessageQueue;
use crate::stats::CommsStats;
use crate::tick::dispatch_tick;
use crate::worker::{
    LinkShared, LinkState, ReadEnd, WorkerHandle, join_with_timeout, read_loop, stop_aware_sleep,
};

/// Reconnecting TCP client.
///
/// One dedicated worker thread owns the socket: it blocks in connect,
/// reads one framed message at a time, and retries after
/// `reconnect_interval` whenever the link drops. Decoded messages and
/// connect/disconnect notifications surface through
/// [`tick`](ReliableClient::tick).
pub struct ReliableClient {
    config: Config,
    queue: Arc<MessageQueue>,
    stats: Arc<CommsStats>,
    link: Arc<LinkShared>,
    worker: Option<WorkerHandle>,
}

impl ReliableClient {
    pub fn new(config: Config) -> Self {
        let queue = Arc::new(MessageQueue::default());
        let stats = Arc::new(CommsStats::default());
        let link = LinkShared::new(
            next_client_id(),
            format!("{}_tcp_client", config.endpoint.name()),
            queue.clone(),
            stats.clone(),
            FrameCodec::new(config.schema.clone()),
        );
        Self {
            config,
            queue,
            stats,
            link,
            worker: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn stats(&self) -> Arc<CommsStats> {
        self.stats.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Current worker state; `Connected` covers the read loop.
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    /// Peer address of the live socket, if any.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    /// Spawn the connect/read worker.
    pub fn start(&mut self) -> Result<(), CommsError> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                warn!(
                    link = %self.link.name,
                    "already running; call close() first or force_reconnect() instead"
                );
                return Err(CommsError::AlreadyRunning);
            }
        }
        self.worker = None;

        let addr = self.config.endpoint.resolve()?;
        self.link.stop.store(false, Ordering::Release);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let link = self.link.clone();
        let endpoint = self.config.endpoint.clone();
        let reconnect = self.config.reconnect_interval;
        let handle = thread::Builder::new()
            .name(link.name.clone())
            .spawn(move || client_loop(link, addr, endpoint, reconnect, stop_rx))?;
        self.worker = Some(WorkerHandle { handle, stop_tx });
        Ok(())
    }

    /// Stop the worker and shut the socket down.
    ///
    /// Cancellation is cooperative: the socket shutdown unblocks an
    /// in-progress read, the stop channel cancels a reconnect sleep, and
    /// the thread is joined for at most `join_timeout`. A final
    /// [`tick`](Self::tick) after closing delivers the pending
    /// disconnect notification.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.link.request_stop();
        drop(worker.stop_tx);
        join_with_timeout(&self.link.name, worker.handle, self.config.join_timeout);
    }

    pub fn force_reconnect(&mut self) -> Result<(), CommsError> {
        self.close();
        self.start()
    }

    /// Frame and write one payload. Serialized against other senders on
    /// this link; drops (with a warning) when not connected.
    pub fn send(&self, payload: &[u8]) -> Result<(), CommsError> {
        self.link.send(payload)
    }

    /// Drain pending messages and notifications, in order.
    pub fn tick(&mut self, handler: &mut dyn CommsHandler) {
        let links = [self.link.clone()];
        dispatch_tick(&links, &self.queue, &self.stats, &self.config, handler);
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn client_loop(
    link: Arc<LinkShared>,
    addr: SocketAddr,
    endpoint: Endpoint,
    reconnect: Duration,
    stop_rx: Receiver<()>,
) {
    let mut first = true;
    while !link.stop_requested() {
        if !first && !stop_aware_sleep(&stop_rx, reconnect) {
            break;
        }
        first = false;

        link.set_state(LinkState::Connecting);
        info!(link = %link.name, endpoint = %endpoint, "connecting");
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(_) if link.stop_requested() => {
                debug!(link = %link.name, "connect cancelled");
                break;
            }
            Err(e) => {
                link.stats.record_stream_error();
                match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => error!(
                        link = %link.name,
                        "connection refused, is the server running? retrying in {:?}",
                        reconnect
                    ),
                    std::io::ErrorKind::TimedOut => error!(
                        link = %link.name,
                        "connect timed out, retrying in {:?}", reconnect
                    ),
                    _ => error!(
                        link = %link.name, error = %e,
                        "connect failed, retrying in {:?}", reconnect
                    ),
                }
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let stream = Arc::new(stream);
        *link.stream.lock() = Some(stream.clone());
        link.set_state(LinkState::Connected);
        link.connect_raised.store(true, Ordering::Release);
        link.stats.record_connection_established();
        info!(link = %link.name, endpoint = %endpoint, "connected");

        let end = read_loop(&link, &stream);

        *link.stream.lock() = None;
        link.set_state(LinkState::Disconnected);
        link.disconnect_raised.store(true, Ordering::Release);
        link.stats.record_stream_disconnect();
        match end {
            ReadEnd::PeerClosed => {
                info!(link = %link.name, "peer closed the connection, reconnecting in {:?}", reconnect);
            }
            ReadEnd::Stopped => {
                info!(link = %link.name, "disconnected");
                break;
            }
            ReadEnd::Failed(e) => {
                link.stats.record_stream_error();
                error!(link = %link.name, error = %e, "read failed, reconnecting in {:?}", reconnect);
            }
        }
    }
    link.set_state(LinkState::Idle);
    info!(link = %link.name, "worker stopped");
}
