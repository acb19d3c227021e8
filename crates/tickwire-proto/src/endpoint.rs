use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Named address:port pair identifying one side of a connection.
///
/// The native socket address is resolved lazily and cached; changing the
/// address or port invalidates the cache. Equality compares address and
/// port only, so a renamed endpoint still matches its peer entry.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    address: String,
    port: u16,
    resolved: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            resolved: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
        self.resolved = None;
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.resolved = None;
    }

    /// Resolve to a native socket address, caching the result.
    pub fn resolve(&mut self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }
        let addr = self.socket_addr()?;
        self.resolved = Some(addr);
        Ok(addr)
    }

    /// Resolve without touching the cache.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}:{}", self.address, self.port),
                )
            })
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({}:{})", self.name, self.address, self.port)
    }
}
