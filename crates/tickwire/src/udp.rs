//! Unreliable (UDP) transport roles.
//!
//! Datagrams carry exactly one raw message payload; delivery and
//! ordering are whatever the socket gives you. The fixed-size schema
//! still applies its pad/reject rule on send, but no length prefix is
//! ever added inside a datagram.

pub mod client;
pub mod server;

pub use client::UnreliableClient;
pub use server::UnreliableServer;

use bytes::Bytes;
use tracing::error;

use tickwire_proto::{FrameCodec, FrameError, FrameSchema};

use crate::error::CommsError;
use crate::stats::CommsStats;

/// Apply the fixed-schema pad/reject rule to an outgoing datagram;
/// every other schema sends the payload as-is.
pub(crate) fn frame_datagram(
    codec: &FrameCodec,
    stats: &CommsStats,
    payload: &[u8],
) -> Result<Bytes, CommsError> {
    match codec.schema() {
        FrameSchema::Fixed(_) => match codec.encode(payload) {
            Ok(frame) => Ok(frame),
            Err(e @ FrameError::PayloadTooLarge { .. }) => {
                stats.record_rejected_send();
                error!("{e}; dropping send");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        },
        _ => Ok(Bytes::copy_from_slice(payload)),
    }
}
