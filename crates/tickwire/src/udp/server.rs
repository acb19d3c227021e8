use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, bounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use tickwire_proto::{Endpoint, FrameBody, FrameCodec};

use crate::config::Config;
use crate::error::CommsError;
use crate::event::{ClientId, CommsHandler, Message, convert_body, next_client_id};
use crate::queue::{MessageQueue, Queued, apply_policy};
use crate::stats::CommsStats;
use crate::udp::frame_datagram;
use crate::worker::{WorkerHandle, join_with_timeout, stop_aware_sleep};

/// Datagram server.
///
/// One worker thread blocks in `recv_from` and pushes every datagram as
/// a message. With `client_ttl` configured, each sender address gets an
/// affinity entry: not a connection, only an addressing convenience with
/// a last-seen timestamp, refreshed per datagram and evicted by a sweep
/// run once per tick. Affinity entries raise a connect notification on
/// their first datagram and a disconnect on eviction.
pub struct UnreliableServer {
    config: Config,
    queue: Arc<MessageQueue>,
    stats: Arc<CommsStats>,
    codec: FrameCodec,
    peers_by_addr: Arc<DashMap<SocketAddr, Arc<UdpPeer>>>,
    peers_by_id: Arc<DashMap<ClientId, Arc<UdpPeer>>>,
    socket: Arc<Mutex<Option<Arc<UdpSocket>>>>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
}

/// Synthetic per-sender entry; keyed by remote address, not a protocol
/// level connection.
#[derive(Debug)]
struct UdpPeer {
    id: ClientId,
    addr: SocketAddr,
    last_seen: Mutex<Instant>,
    connect_raised: AtomicBool,
}

impl UnreliableServer {
    pub fn new(config: Config) -> Self {
        let codec = FrameCodec::new(config.schema.clone());
        Self {
            config,
            queue: Arc::new(MessageQueue::default()),
            stats: Arc::new(CommsStats::default()),
            codec,
            peers_by_addr: Arc::new(DashMap::new()),
            peers_by_id: Arc::new(DashMap::new()),
            socket: Arc::new(Mutex::new(None)),
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.peers_by_id.iter().map(|e| *e.key()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.peers_by_id.len()
    }

    /// Spawn the receive worker.
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
        let ctx = RecvCtx {
            endpoint: self.config.endpoint.clone(),
            addr,
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            peers_by_addr: self.peers_by_addr.clone(),
            peers_by_id: self.peers_by_id.clone(),
            socket_slot: self.socket.clone(),
            bound_addr: self.bound_addr.clone(),
            stop: self.stop.clone(),
            affinity: self.config.client_ttl.is_some(),
            listen_retry: self.config.listen_retry_interval,
        };
        let handle = thread::Builder::new()
            .name(format!("{}_udp_listen", self.config.endpoint.name()))
            .spawn(move || recv_loop(ctx, stop_rx))?;
        self.worker = Some(WorkerHandle { handle, stop_tx });
        Ok(())
    }

    /// Stop the receive worker. The blocking `recv_from` is woken with a
    /// zero-byte datagram to our own port.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        drop(worker.stop_tx);

        let socket = self.socket.lock().clone();
        if let (Some(socket), Some(mut addr)) = (socket, *self.bound_addr.lock()) {
            if addr.ip().is_unspecified() {
                addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let _ = socket.send_to(&[], addr);
        }
        join_with_timeout("udp_listen", worker.handle, self.config.join_timeout);
    }

    pub fn force_reconnect(&mut self) -> Result<(), CommsError> {
        self.close();
        self.start()
    }

    /// Reply to one known sender.
    pub fn send_to(&self, client: ClientId, payload: &[u8]) -> Result<(), CommsError> {
        let Some(peer) = self.peers_by_id.get(&client).map(|e| e.value().clone()) else {
            return Err(CommsError::UnknownClient(client));
        };
        self.send_datagram(payload, peer.addr)
    }

    /// Reply to every known sender, skipping ones that fail.
    pub fn send_all(&self, payload: &[u8]) {
        for entry in self.peers_by_id.iter() {
            let addr = entry.value().addr;
            if let Err(e) = self.send_datagram(payload, addr) {
                debug!(client = entry.value().id, error = %e, "skipping peer in send_all");
            }
        }
    }

    fn send_datagram(&self, payload: &[u8], addr: SocketAddr) -> Result<(), CommsError> {
        let socket = self.socket.lock().clone();
        let Some(socket) = socket else {
            warn!(endpoint = %self.config.endpoint, "not listening, dropping datagram");
            return Err(CommsError::NotConnected);
        };
        let frame = frame_datagram(&self.codec, &self.stats, payload)?;
        socket.send_to(&frame, addr)?;
        self.stats.record_message_sent(frame.len());
        Ok(())
    }

    /// Drain pending messages and notifications, then run the affinity
    /// idle sweep.
    pub fn tick(&mut self, handler: &mut dyn CommsHandler) {
        let batch = self.queue.drain();

        // Connect flags are sampled after the drain: any message in the
        // batch was pushed after its peer's flag was set, so the connect
        // fires first. Collected before dispatch so no registry ref is
        // held while the handler runs.
        let connected: Vec<ClientId> = self
            .peers_by_id
            .iter()
            .filter(|e| e.value().connect_raised.swap(false, Ordering::AcqRel))
            .map(|e| e.value().id)
            .collect();
        for id in connected {
            handler.on_connect(id);
        }

        let batch = apply_policy(
            &self.queue,
            &self.stats,
            self.config.drop_accumulated,
            self.config.max_messages_per_tick,
            batch,
        );
        for item in batch {
            match convert_body(self.config.kind, false, item.frame) {
                Some(body) => handler.on_message(Message {
                    client: item.client,
                    body,
                }),
                None => self.stats.record_dropped_message(),
            }
        }

        self.sweep_idle(handler);
    }

    fn sweep_idle(&self, handler: &mut dyn CommsHandler) {
        let Some(ttl) = self.config.client_ttl else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<Arc<UdpPeer>> = self
            .peers_by_id
            .iter()
            .filter(|e| now.duration_since(*e.value().last_seen.lock()) > ttl)
            .map(|e| e.value().clone())
            .collect();
        for peer in expired {
            self.peers_by_addr.remove(&peer.addr);
            self.peers_by_id.remove(&peer.id);
            self.stats.record_stream_disconnect();
            info!(client = peer.id, addr = %peer.addr, "dropping idle datagram peer");
            handler.on_disconnect(peer.id);
        }
    }
}

impl Drop for UnreliableServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct RecvCtx {
    endpoint: Endpoint,
    addr: SocketAddr,
    queue: Arc<MessageQueue>,
    stats: Arc<CommsStats>,
    peers_by_addr: Arc<DashMap<SocketAddr, Arc<UdpPeer>>>,
    peers_by_id: Arc<DashMap<ClientId, Arc<UdpPeer>>>,
    socket_slot: Arc<Mutex<Option<Arc<UdpSocket>>>>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
    affinity: bool,
    listen_retry: Duration,
}

fn recv_loop(ctx: RecvCtx, stop_rx: Receiver<()>) {
    let mut first = true;
    let mut buf = vec![0u8; 64 * 1024];
    while !ctx.stop.load(Ordering::Acquire) {
        if !first && !stop_aware_sleep(&stop_rx, ctx.listen_retry) {
            break;
        }
        first = false;

        let socket = match UdpSocket::bind(ctx.addr) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                ctx.stats.record_stream_error();
                error!(
                    endpoint = %ctx.endpoint, error = %e,
                    "bind failed, retrying in {:?}", ctx.listen_retry
                );
                continue;
            }
        };
        *ctx.socket_slot.lock() = Some(socket.clone());
        *ctx.bound_addr.lock() = socket.local_addr().ok();
        ctx.stats.record_connection_established();
        info!(endpoint = %ctx.endpoint, "listening for datagrams");

        while !ctx.stop.load(Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    if ctx.stop.load(Ordering::Acquire) {
                        break;
                    }
                    ctx.stats.record_packet_received(n);
                    let client = if ctx.affinity { touch_peer(&ctx, peer) } else { 0 };
                    ctx.stats.record_message_received();
                    ctx.queue.push(Queued {
                        client,
                        frame: FrameBody::from_payload(Bytes::copy_from_slice(&buf[..n])),
                    });
                }
                Err(e) => {
                    if ctx.stop.load(Ordering::Acquire) {
                        break;
                    }
                    ctx.stats.record_stream_error();
                    error!(endpoint = %ctx.endpoint, error = %e, "receive failed");
                }
            }
        }
        *ctx.socket_slot.lock() = None;
        *ctx.bound_addr.lock() = None;
    }
    info!(endpoint = %ctx.endpoint, "receiver stopped");
}

/// Look up or create the affinity entry for a sender and refresh its
/// last-seen timestamp.
fn touch_peer(ctx: &RecvCtx, addr: SocketAddr) -> ClientId {
    if let Some(peer) = ctx.peers_by_addr.get(&addr) {
        *peer.last_seen.lock() = Instant::now();
        return peer.id;
    }
    let id = next_client_id();
    let peer = Arc::new(UdpPeer {
        id,
        addr,
        last_seen: Mutex::new(Instant::now()),
        connect_raised: AtomicBool::new(true),
    });
    debug!(%addr, client = id, "new datagram peer");
    ctx.peers_by_addr.insert(addr, peer.clone());
    ctx.peers_by_id.insert(id, peer);
    id
}
