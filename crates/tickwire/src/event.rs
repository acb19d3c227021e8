use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::warn;

use tickwire_proto::FrameBody;

use crate::config::MessageKind;

/// Unique identity of one connection (or UDP affinity entry).
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A message handed to the consumer during a tick.
#[derive(Debug, Clone)]
pub struct Message {
    /// Which connection produced it. Client roles report the id of their
    /// single link across reconnects; UDP servers without affinity
    /// report 0.
    pub client: ClientId,
    pub body: MessageBody,
}

/// Decoded payload, tagged by the configured message kind.
///
/// Schema-driven frames always dispatch as `Fields`.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Fields(FrameBody),
}

/// Observer for transport notifications, driven from
/// [`Comms::tick`](crate::Comms::tick).
///
/// Ordering contract, per connection: `on_connect` is delivered before
/// the first message of that connection, and `on_disconnect` after the
/// messages dispatched in its tick. No ordering holds across distinct
/// connections.
pub trait CommsHandler {
    fn on_connect(&mut self, _client: ClientId) {}
    fn on_message(&mut self, _message: Message) {}
    fn on_disconnect(&mut self, _client: ClientId) {}
}

/// Convert a decoded frame into the configured message shape. `None`
/// means the payload could not be represented (malformed JSON) and the
/// message is dropped.
pub(crate) fn convert_body(
    kind: MessageKind,
    schema_driven: bool,
    frame: FrameBody,
) -> Option<MessageBody> {
    if schema_driven {
        return Some(MessageBody::Fields(frame));
    }
    let payload = frame.into_payload();
    match kind {
        MessageKind::Bytes => Some(MessageBody::Bytes(payload)),
        MessageKind::Text => Some(MessageBody::Text(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        MessageKind::Json => match serde_json::from_slice(&payload) {
            Ok(value) => Some(MessageBody::Json(value)),
            Err(e) => {
                warn!(error = %e, "dropping malformed json message");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use tickwire_proto::FrameBody;

    use super::{MessageBody, convert_body};
    use crate::config::MessageKind;

    #[test]
    fn json_kind_parses_payload() {
        let frame = FrameBody::from_payload(&br#"{"x": 1}"#[..]);
        let Some(MessageBody::Json(value)) = convert_body(MessageKind::Json, false, frame) else {
            panic!("expected json body");
        };
        assert_eq!(value["x"], 1);
    }

    #[test]
    fn malformed_json_is_dropped() {
        let frame = FrameBody::from_payload(&b"not json"[..]);
        assert!(convert_body(MessageKind::Json, false, frame).is_none());
    }

    #[test]
    fn schema_driven_frames_keep_their_fields() {
        let frame = FrameBody::from_payload(&b"abc"[..]);
        let Some(MessageBody::Fields(body)) = convert_body(MessageKind::Bytes, true, frame) else {
            panic!("expected fields body");
        };
        assert_eq!(body.payload(), b"abc");
    }
}
