use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use tickwire_proto::{Endpoint, FrameCodec};

use crate::config::Config;
use crate::error::CommsError;
use crate::event::{ClientId, CommsHandler, next_client_id};
use crate::queue::MessageQueue;
use crate::stats::CommsStats;
use crate::tick::dispatch_tick;
use crate::worker::{
    LinkShared, LinkState, ReadEnd, WorkerHandle, join_with_timeout, read_loop, stop_aware_sleep,
};

/// Multi-client TCP server.
///
/// One worker thread runs the bind/accept loop; every accepted client
/// gets its own reader thread and registry entry (already connected, no
/// connect phase). Bind failures retry after `listen_retry_interval`; a
/// dying client never restarts the listener.
pub struct ReliableServer {
    config: Config,
    queue: Arc<MessageQueue>,
    stats: Arc<CommsStats>,
    registry: Arc<DashMap<ClientId, Arc<LinkShared>>>,
    conn_handles: Arc<Mutex<Vec<(ClientId, JoinHandle<()>)>>>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
}

impl ReliableServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            queue: Arc::new(MessageQueue::default()),
            stats: Arc::new(CommsStats::default()),
            registry: Arc::new(DashMap::new()),
            conn_handles: Arc::new(Mutex::new(Vec::new())),
            bound_addr: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
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

    /// Actual bound address once listening (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// True while at least one accepted client is connected.
    pub fn is_connected(&self) -> bool {
        self.registry.iter().any(|e| e.value().is_connected())
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.registry.iter().map(|e| *e.key()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Spawn the listen/accept worker.
    pub fn start(&mut self) -> Result<(), CommsError> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                warn!(
                    endpoint = %self.config.endpoint,
                    "already running; call close() first or force_reconnect() instead"
                );
                return Err(CommsError::AlreadyRunning);
            }
        }
        self.worker = None;

        let addr = self.config.endpoint.resolve()?;
        self.stop.store(false, Ordering::Release);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ctx = AcceptCtx {
            endpoint: self.config.endpoint.clone(),
            addr,
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            registry: self.registry.clone(),
            conn_handles: self.conn_handles.clone(),
            bound_addr: self.bound_addr.clone(),
            stop: self.stop.clone(),
            codec: FrameCodec::new(self.config.schema.clone()),
            listen_retry: self.config.listen_retry_interval,
        };
        let handle = thread::Builder::new()
            .name(format!("{}_tcp_listen", self.config.endpoint.name()))
            .spawn(move || accept_loop(ctx, stop_rx))?;
        self.worker = Some(WorkerHandle { handle, stop_tx });
        Ok(())
    }

    /// Stop the listener and every accepted client.
    ///
    /// Client sockets are shut down to unblock their readers, the accept
    /// loop is woken with a throwaway local connection, and all threads
    /// are joined for at most `join_timeout` each. A final
    /// [`tick`](Self::tick) delivers the per-client disconnect
    /// notifications.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        drop(worker.stop_tx);

        for entry in self.registry.iter() {
            entry.value().request_stop();
        }

        // A blocking accept only notices the stop flag when something
        // arrives; give it something.
        if let Some(mut addr) = *self.bound_addr.lock() {
            if addr.ip().is_unspecified() {
                addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(50));
        }

        join_with_timeout("tcp_listen", worker.handle, self.config.join_timeout);
        let handles: Vec<_> = self.conn_handles.lock().drain(..).collect();
        for (id, handle) in handles {
            join_with_timeout(&format!("tcp_conn_{id}"), handle, self.config.join_timeout);
        }
    }

    pub fn force_reconnect(&mut self) -> Result<(), CommsError> {
        self.close();
        self.start()
    }

    /// Send one payload to every connected client, skipping dead links.
    pub fn send_all(&self, payload: &[u8]) {
        for entry in self.registry.iter() {
            if let Err(e) = entry.value().send(payload) {
                debug!(client = entry.value().id, error = %e, "skipping client in send_all");
            }
        }
    }

    pub fn send_to(&self, client: ClientId, payload: &[u8]) -> Result<(), CommsError> {
        let Some(link) = self.registry.get(&client).map(|e| e.value().clone()) else {
            return Err(CommsError::UnknownClient(client));
        };
        link.send(payload)
    }

    /// Drop one accepted client; the listener keeps accepting.
    pub fn close_client(&self, client: ClientId) -> Result<(), CommsError> {
        let Some(link) = self.registry.get(&client).map(|e| e.value().clone()) else {
            return Err(CommsError::UnknownClient(client));
        };
        link.request_stop();
        Ok(())
    }

    /// Drain pending messages and notifications, in order, and reap
    /// fully disconnected clients.
    pub fn tick(&mut self, handler: &mut dyn CommsHandler) {
        let links: Vec<Arc<LinkShared>> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        dispatch_tick(&links, &self.queue, &self.stats, &self.config, handler);

        // Registry entries whose disconnect has been delivered are gone
        // for good: accepted connections do not reconnect.
        for link in &links {
            if !link.is_connected() && !link.disconnect_raised.load(Ordering::Acquire) {
                self.registry.remove(&link.id);
            }
        }

        let mut handles = self.conn_handles.lock();
        let mut keep = Vec::with_capacity(handles.len());
        for (id, handle) in handles.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                keep.push((id, handle));
            }
        }
        *handles = keep;
    }
}

impl Drop for ReliableServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct AcceptCtx {
    endpoint: Endpoint,
    addr: SocketAddr,
    queue: Arc<MessageQueue>,
    stats: Arc<CommsStats>,
    registry: Arc<DashMap<ClientId, Arc<LinkShared>>>,
    conn_handles: Arc<Mutex<Vec<(ClientId, JoinHandle<()>)>>>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    codec: FrameCodec,
    listen_retry: Duration,
}

fn accept_loop(ctx: AcceptCtx, stop_rx: Receiver<()>) {
    let mut first = true;
    while !ctx.stop.load(Ordering::Acquire) {
        if !first && !stop_aware_sleep(&stop_rx, ctx.listen_retry) {
            break;
        }
        first = false;

        let listener = match TcpListener::bind(ctx.addr) {
            Ok(listener) => listener,
            Err(e) => {
                ctx.stats.record_stream_error();
                error!(
                    endpoint = %ctx.endpoint, error = %e,
                    "bind failed, retrying in {:?}", ctx.listen_retry
                );
                continue;
            }
        };
        let bound = listener.local_addr().ok();
        *ctx.bound_addr.lock() = bound;
        info!(endpoint = %ctx.endpoint, ?bound, "listening");

        while !ctx.stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if ctx.stop.load(Ordering::Acquire) {
                        break;
                    }
                    spawn_conn(&ctx, stream, peer);
                }
                Err(e) => {
                    if ctx.stop.load(Ordering::Acquire) {
                        break;
                    }
                    ctx.stats.record_stream_error();
                    error!(endpoint = %ctx.endpoint, error = %e, "accept failed");
                }
            }
        }
        *ctx.bound_addr.lock() = None;
    }
    info!(endpoint = %ctx.endpoint, "listener stopped");
}

fn spawn_conn(ctx: &AcceptCtx, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let id = next_client_id();
    let link = LinkShared::new(
        id,
        format!("{}_tcp_{}", ctx.endpoint.name(), id),
        ctx.queue.clone(),
        ctx.stats.clone(),
        ctx.codec.clone(),
    );

    let stream = Arc::new(stream);
    *link.stream.lock() = Some(stream.clone());
    link.set_state(LinkState::Connected);
    link.connect_raised.store(true, Ordering::Release);
    ctx.stats.record_connection_established();
    ctx.registry.insert(id, link.clone());
    info!(link = %link.name, %peer, "client connected");

    let worker_link = link.clone();
    let spawned = thread::Builder::new()
        .name(link.name.clone())
        .spawn(move || {
            let end = read_loop(&worker_link, &stream);
            *worker_link.stream.lock() = None;
            worker_link.set_state(LinkState::Disconnected);
            worker_link.disconnect_raised.store(true, Ordering::Release);
            worker_link.stats.record_stream_disconnect();
            match end {
                ReadEnd::PeerClosed => info!(link = %worker_link.name, "client disconnected"),
                ReadEnd::Stopped => info!(link = %worker_link.name, "client connection closed"),
                ReadEnd::Failed(e) => {
                    worker_link.stats.record_stream_error();
                    error!(link = %worker_link.name, error = %e, "client read failed");
                }
            }
        });

    match spawned {
        Ok(handle) => ctx.conn_handles.lock().push((id, handle)),
        Err(e) => {
            error!(link = %link.name, error = %e, "failed to spawn connection worker");
            ctx.registry.remove(&id);
        }
    }
}
