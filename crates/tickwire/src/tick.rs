use std::sync::Arc;
use std::sync::atomic::Ordering;

use tickwire_proto::FrameSchema;

use crate::config::Config;
use crate::event::{CommsHandler, Message, convert_body};
use crate::queue::{MessageQueue, apply_policy};
use crate::stats::CommsStats;
use crate::worker::LinkShared;

/// One consumer tick over a set of links sharing a queue.
///
/// Flag sampling order is what upholds the per-connection ordering
/// contract without ever locking a worker out:
///
/// - Disconnect flags are sampled *before* the drain. A worker only sets
///   its flag after its last push, so a flag seen here means everything
///   that connection produced is already in the batch, and its
///   disconnect can fire after the payloads.
/// - Connect flags are sampled *after* the drain. A worker sets its flag
///   before its first push, so any message in the batch has a visible
///   connect flag by now, and the connect fires first.
pub(crate) fn dispatch_tick(
    links: &[Arc<LinkShared>],
    queue: &MessageQueue,
    stats: &CommsStats,
    config: &Config,
    handler: &mut dyn CommsHandler,
) {
    let mut disconnected = Vec::new();
    for link in links {
        if link.disconnect_raised.swap(false, Ordering::AcqRel) {
            disconnected.push(link.id);
        }
    }

    let batch = queue.drain();

    for link in links {
        if link.connect_raised.swap(false, Ordering::AcqRel) {
            handler.on_connect(link.id);
        }
    }

    let schema_driven = matches!(config.schema, FrameSchema::Fields(_));
    let batch = apply_policy(
        queue,
        stats,
        config.drop_accumulated,
        config.max_messages_per_tick,
        batch,
    );
    for item in batch {
        match convert_body(config.kind, schema_driven, item.frame) {
            Some(body) => handler.on_message(Message {
                client: item.client,
                body,
            }),
            None => stats.record_dropped_message(),
        }
    }

    for id in disconnected {
        handler.on_disconnect(id);
    }
}
