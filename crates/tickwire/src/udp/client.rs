use std::net::UdpSocket;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tickwire_proto::{Endpoint, FrameCodec};

use crate::config::Config;
use crate::error::CommsError;
use crate::stats::CommsStats;
use crate::udp::frame_datagram;

/// Send-only datagram client.
///
/// No worker thread and no delivery guarantee: `send` is a synchronous
/// `send_to` on the caller's thread.
pub struct UnreliableClient {
    config: Config,
    stats: Arc<CommsStats>,
    codec: FrameCodec,
    socket: Option<UdpSocket>,
}

impl UnreliableClient {
    pub fn new(config: Config) -> Self {
        let codec = FrameCodec::new(config.schema.clone());
        Self {
            config,
            stats: Arc::new(CommsStats::default()),
            codec,
            socket: None,
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
        self.socket.is_some()
    }

    /// Bind the outbound socket.
    pub fn start(&mut self) -> Result<(), CommsError> {
        if self.socket.is_some() {
            warn!(endpoint = %self.config.endpoint, "already running");
            return Err(CommsError::AlreadyRunning);
        }
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        self.socket = Some(socket);
        info!(endpoint = %self.config.endpoint, "datagram sender ready");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            info!(endpoint = %self.config.endpoint, "datagram sender closed");
        }
    }

    /// Send one datagram to the configured endpoint.
    pub fn send(&self, payload: &[u8]) -> Result<(), CommsError> {
        self.send_to_endpoint(payload, &self.config.endpoint)
    }

    /// Send one datagram to an arbitrary endpoint.
    pub fn send_to_endpoint(&self, payload: &[u8], target: &Endpoint) -> Result<(), CommsError> {
        let Some(socket) = &self.socket else {
            warn!(endpoint = %self.config.endpoint, "not started, dropping message");
            return Err(CommsError::NotConnected);
        };
        let addr = target.socket_addr()?;
        let frame = frame_datagram(&self.codec, &self.stats, payload)?;
        debug!(bytes = frame.len(), %target, "sending datagram");
        socket.send_to(&frame, addr)?;
        self.stats.record_message_sent(frame.len());
        Ok(())
    }

    /// Send one datagram to every configured target, skipping targets
    /// that fail.
    pub fn broadcast(&self, payload: &[u8]) {
        for target in &self.config.targets {
            if let Err(e) = self.send_to_endpoint(payload, target) {
                debug!(%target, error = %e, "skipping target in broadcast");
            }
        }
    }
}

impl Drop for UnreliableClient {
    fn drop(&mut self) {
        self.close();
    }
}
