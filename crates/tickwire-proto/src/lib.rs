//! Wire format for the tickwire transport.
//!
//! This crate knows how bytes are laid out on the wire and nothing else:
//! no sockets, no threads, no retry policy.
//!
//! - [`endpoint`]: named address:port values with cached resolution
//! - [`schema`]: the three framing conventions (length-prefixed, fixed,
//!   schema-driven) and their JSON notation
//! - [`codec`]: encoding payloads into frames and pulling one frame at a
//!   time off a blocking stream

pub mod codec;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod schema;

pub use codec::{FrameBody, FrameCodec};
pub use endpoint::Endpoint;
pub use error::FrameError;
pub use schema::{DEFAULT_FIELD, FieldLen, FieldSpec, FrameSchema};
