//! Optional HTTP address rendezvous.
//!
//! Both sides POST their identity to a sync server; clients get back the
//! address to connect to, servers just register their listen port and
//! wait for inbound connections.

use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::CommsError;

/// Configuration for the discovery collaborator.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Sync endpoint, e.g. `http://localhost:3000/join`.
    pub url: String,
    /// Caller identity.
    pub id: String,
    /// Shared passkey; a `403` means the server rejected it.
    pub key: String,
    /// Rendezvous room. A `404` means the server side has not registered
    /// it yet, so clients keep polling.
    pub room: String,
    pub retry_interval: Duration,
    /// None retries until the room appears.
    pub max_attempts: Option<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/join".into(),
            id: String::new(),
            key: String::new(),
            room: String::new(),
            retry_interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Which side of the rendezvous we register as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRole {
    /// Registers its listen port; the reply body is ignored.
    Server { listen_port: u16 },
    /// Receives the server's address to connect to.
    Client,
}

#[derive(Debug, Deserialize)]
struct DiscoveryReply {
    ip: String,
    port: u16,
}

/// One POST to the sync server. `Ok(None)` means "registered, nothing to
/// connect to" (the server role).
pub fn resolve_once(
    config: &DiscoveryConfig,
    role: DiscoveryRole,
) -> Result<Option<(String, u16)>, CommsError> {
    let (kind, port) = match role {
        DiscoveryRole::Server { listen_port } => ("server", listen_port.to_string()),
        DiscoveryRole::Client => ("client", String::new()),
    };
    debug!(url = %config.url, room = %config.room, "syncing with discovery server");

    let result = ureq::post(config.url.as_str()).send_form([
        ("id", config.id.as_str()),
        ("type", kind),
        ("key", config.key.as_str()),
        ("room", config.room.as_str()),
        ("port", port.as_str()),
    ]);

    match result {
        Ok(mut response) => match role {
            DiscoveryRole::Server { .. } => Ok(None),
            DiscoveryRole::Client => {
                let reply: DiscoveryReply = response
                    .body_mut()
                    .read_json()
                    .map_err(|e| CommsError::DiscoveryFailed(format!("bad reply body: {e}")))?;
                info!(ip = %reply.ip, port = reply.port, "discovered server address");
                Ok(Some((reply.ip, reply.port)))
            }
        },
        Err(ureq::Error::StatusCode(400)) => Err(CommsError::DiscoveryRejected(
            "malformed discovery request".into(),
        )),
        Err(ureq::Error::StatusCode(403)) => Err(CommsError::DiscoveryRejected(format!(
            "passkey rejected: {}",
            config.key
        ))),
        Err(ureq::Error::StatusCode(404)) => Err(CommsError::DiscoveryFailed(format!(
            "room {:?} not registered yet",
            config.room
        ))),
        Err(e) => Err(CommsError::DiscoveryFailed(e.to_string())),
    }
}

/// Retry [`resolve_once`] until it succeeds or the attempt budget runs
/// out, sleeping `retry_interval` between calls. Every non-success
/// response retries; only the budget stops it.
pub fn resolve_with_retry(
    config: &DiscoveryConfig,
    role: DiscoveryRole,
) -> Result<Option<(String, u16)>, CommsError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match resolve_once(config, role) {
            Ok(found) => return Ok(found),
            Err(e) => {
                match &e {
                    CommsError::DiscoveryRejected(reason) => {
                        error!(%reason, "discovery rejected")
                    }
                    _ => warn!(error = %e, "discovery attempt failed"),
                }
                if let Some(max) = config.max_attempts {
                    if attempt >= max {
                        return Err(e);
                    }
                }
                thread::sleep(config.retry_interval);
            }
        }
    }
}
