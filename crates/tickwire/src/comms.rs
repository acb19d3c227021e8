//! The public transport facade: a closed set of four roles.

use std::sync::Arc;

use crate::config::Config;
use crate::discovery::{self, DiscoveryConfig, DiscoveryRole};
use crate::error::CommsError;
use crate::event::{ClientId, CommsHandler};
use crate::stats::CommsStats;
use crate::tcp::{ReliableClient, ReliableServer};
use crate::udp::{UnreliableClient, UnreliableServer};

/// The four concrete transport roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ReliableServer,
    ReliableClient,
    UnreliableServer,
    UnreliableClient,
}

/// A transport instance of one of the four roles.
///
/// Lifecycle: [`start`](Comms::start) spawns the worker threads,
/// [`tick`](Comms::tick) drains received messages and notifications on
/// the caller's schedule, [`close`](Comms::close) cancels cooperatively.
/// The concrete types behind the variants are public too, for callers
/// that want a role-specific surface.
pub enum Comms {
    ReliableServer(ReliableServer),
    ReliableClient(ReliableClient),
    UnreliableServer(UnreliableServer),
    UnreliableClient(UnreliableClient),
}

impl Comms {
    /// Build the given role over `config`.
    pub fn new(role: Role, config: Config) -> Self {
        match role {
            Role::ReliableServer => Self::ReliableServer(ReliableServer::new(config)),
            Role::ReliableClient => Self::ReliableClient(ReliableClient::new(config)),
            Role::UnreliableServer => Self::UnreliableServer(UnreliableServer::new(config)),
            Role::UnreliableClient => Self::UnreliableClient(UnreliableClient::new(config)),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::ReliableServer(_) => Role::ReliableServer,
            Self::ReliableClient(_) => Role::ReliableClient,
            Self::UnreliableServer(_) => Role::UnreliableServer,
            Self::UnreliableClient(_) => Role::UnreliableClient,
        }
    }

    pub fn config(&self) -> &Config {
        match self {
            Self::ReliableServer(s) => s.config(),
            Self::ReliableClient(c) => c.config(),
            Self::UnreliableServer(s) => s.config(),
            Self::UnreliableClient(c) => c.config(),
        }
    }

    pub fn stats(&self) -> Arc<CommsStats> {
        match self {
            Self::ReliableServer(s) => s.stats(),
            Self::ReliableClient(c) => c.stats(),
            Self::UnreliableServer(s) => s.stats(),
            Self::UnreliableClient(c) => c.stats(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::ReliableServer(s) => s.is_connected(),
            Self::ReliableClient(c) => c.is_connected(),
            Self::UnreliableServer(s) => s.is_connected(),
            Self::UnreliableClient(c) => c.is_connected(),
        }
    }

    pub fn start(&mut self) -> Result<(), CommsError> {
        match self {
            Self::ReliableServer(s) => s.start(),
            Self::ReliableClient(c) => c.start(),
            Self::UnreliableServer(s) => s.start(),
            Self::UnreliableClient(c) => c.start(),
        }
    }

    /// Resolve the endpoint through the discovery collaborator, then
    /// start. Clients overwrite their endpoint with the discovered
    /// address; servers only register and wait. Blocks through the retry
    /// loop.
    pub fn start_with_discovery(&mut self, discovery: &DiscoveryConfig) -> Result<(), CommsError> {
        let role = match self {
            Self::ReliableServer(s) => DiscoveryRole::Server {
                listen_port: s.config().endpoint.port(),
            },
            Self::UnreliableServer(s) => DiscoveryRole::Server {
                listen_port: s.config().endpoint.port(),
            },
            Self::ReliableClient(_) | Self::UnreliableClient(_) => DiscoveryRole::Client,
        };
        if let Some((ip, port)) = discovery::resolve_with_retry(discovery, role)? {
            let endpoint = match self {
                Self::ReliableServer(s) => &mut s.config_mut().endpoint,
                Self::ReliableClient(c) => &mut c.config_mut().endpoint,
                Self::UnreliableServer(s) => &mut s.config_mut().endpoint,
                Self::UnreliableClient(c) => &mut c.config_mut().endpoint,
            };
            endpoint.set_address(ip);
            endpoint.set_port(port);
        }
        self.start()
    }

    pub fn close(&mut self) {
        match self {
            Self::ReliableServer(s) => s.close(),
            Self::ReliableClient(c) => c.close(),
            Self::UnreliableServer(s) => s.close(),
            Self::UnreliableClient(c) => c.close(),
        }
    }

    pub fn force_reconnect(&mut self) -> Result<(), CommsError> {
        self.close();
        self.start()
    }

    /// Drain pending messages and notifications, in order. No-op for the
    /// send-only unreliable client.
    pub fn tick(&mut self, handler: &mut dyn CommsHandler) {
        match self {
            Self::ReliableServer(s) => s.tick(handler),
            Self::ReliableClient(c) => c.tick(handler),
            Self::UnreliableServer(s) => s.tick(handler),
            Self::UnreliableClient(_) => {}
        }
    }

    /// Send one payload: clients to their endpoint, servers to every
    /// connected client.
    pub fn send(&self, payload: &[u8]) -> Result<(), CommsError> {
        match self {
            Self::ReliableClient(c) => c.send(payload),
            Self::UnreliableClient(c) => c.send(payload),
            Self::ReliableServer(s) => {
                s.send_all(payload);
                Ok(())
            }
            Self::UnreliableServer(s) => {
                s.send_all(payload);
                Ok(())
            }
        }
    }

    pub fn send_text(&self, text: &str) -> Result<(), CommsError> {
        self.send(text.as_bytes())
    }

    pub fn send_json(&self, value: &serde_json::Value) -> Result<(), CommsError> {
        self.send(value.to_string().as_bytes())
    }

    /// Fan one payload out to every connected client (servers) or the
    /// configured targets (unreliable client).
    pub fn send_all(&self, payload: &[u8]) {
        match self {
            Self::ReliableServer(s) => s.send_all(payload),
            Self::UnreliableServer(s) => s.send_all(payload),
            Self::UnreliableClient(c) => c.broadcast(payload),
            Self::ReliableClient(c) => {
                let _ = c.send(payload);
            }
        }
    }

    /// Send to one connected client by id (server roles).
    pub fn send_to(&self, client: ClientId, payload: &[u8]) -> Result<(), CommsError> {
        match self {
            Self::ReliableServer(s) => s.send_to(client, payload),
            Self::UnreliableServer(s) => s.send_to(client, payload),
            Self::ReliableClient(_) | Self::UnreliableClient(_) => {
                Err(CommsError::UnknownClient(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Comms, Role};
    use crate::config::Config;

    #[test]
    fn factory_builds_the_requested_role() {
        for role in [
            Role::ReliableServer,
            Role::ReliableClient,
            Role::UnreliableServer,
            Role::UnreliableClient,
        ] {
            let comms = Comms::new(role, Config::default());
            assert_eq!(comms.role(), role);
            assert!(!comms.is_connected());
        }
    }
}
