use thiserror::Error;

use crate::event::ClientId;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("not connected")]
    NotConnected,

    #[error("transport already running")]
    AlreadyRunning,

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error(transparent)]
    Frame(#[from] tickwire_proto::FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("discovery rejected: {0}")]
    DiscoveryRejected(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
}
