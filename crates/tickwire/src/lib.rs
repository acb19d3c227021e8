//! Tick-driven message transport over TCP and UDP.
//!
//! tickwire frames byte payloads into discrete messages, owns the
//! blocking I/O threads that connect, accept and read, and hands every
//! decoded message across a thread boundary to a consumer that drains
//! them on its own schedule with [`Comms::tick`]. The transport has no
//! opinion about how often that is.
//!
//! # Architecture
//!
//! - [`queue`]: the mutex-guarded producer/consumer message queue
//! - [`tcp`]: reconnecting client and multi-client server
//! - [`udp`]: send-only datagram client and datagram server with
//!   per-sender affinity
//! - [`discovery`]: optional HTTP address rendezvous
//! - [`stats`]: per-transport counter registry
//! - [`event`]: the observer trait and its ordering contract
//!
//! Per connection, a connect notification is always delivered before the
//! first message and the disconnect notification after the last one; no
//! ordering holds across distinct connections.

pub mod comms;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod queue;
pub mod stats;
pub mod tcp;
pub mod udp;

mod tick;
mod worker;

pub use comms::{Comms, Role};
pub use config::{Config, MessageKind};
pub use discovery::{DiscoveryConfig, DiscoveryRole};
pub use error::CommsError;
pub use event::{ClientId, CommsHandler, Message, MessageBody};
pub use stats::{CommsStats, StatsSnapshot};
pub use tcp::{ReliableClient, ReliableServer};
pub use tickwire_proto::{Endpoint, FrameBody, FrameCodec, FrameError, FrameSchema};
pub use udp::{UnreliableClient, UnreliableServer};
pub use worker::LinkState;
