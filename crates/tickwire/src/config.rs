use std::time::Duration;

use tickwire_proto::{Endpoint, FrameSchema};

/// What the consumer receives for each decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Bytes,
    Text,
    Json,
}

/// Transport configuration.
///
/// Owned by the facade; treated as read-only by the workers once a
/// connection has started.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (servers) or remote address (clients).
    pub endpoint: Endpoint,
    pub kind: MessageKind,
    pub schema: FrameSchema,
    /// Deliver only the newest message accumulated between ticks,
    /// counting the rest as dropped.
    pub drop_accumulated: bool,
    /// Upper bound on dispatches per tick; -1 means unbounded. Does not
    /// drop messages, just spreads them across ticks. Overridden by
    /// `drop_accumulated`.
    pub max_messages_per_tick: i32,
    /// Pause between reconnect attempts of a client link.
    pub reconnect_interval: Duration,
    /// Pause after a failed bind. Longer than the reconnect interval:
    /// not holding a local seat is a different failure than not reaching
    /// one remote peer.
    pub listen_retry_interval: Duration,
    /// How long `close` waits for a worker thread before escalating.
    pub join_timeout: Duration,
    /// UDP servers: drop per-sender affinity entries idle this long.
    /// None disables affinity tracking entirely.
    pub client_ttl: Option<Duration>,
    /// UDP clients: default broadcast targets.
    pub targets: Vec<Endpoint>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("0.0.0.0", 3000, "device"),
            kind: MessageKind::Bytes,
            schema: FrameSchema::default(),
            drop_accumulated: false,
            max_messages_per_tick: -1,
            reconnect_interval: Duration::from_millis(1000),
            listen_retry_interval: Duration::from_millis(5000),
            join_timeout: Duration::from_millis(100),
            client_ttl: None,
            targets: Vec::new(),
        }
    }
}

impl Config {
    pub fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }
}
