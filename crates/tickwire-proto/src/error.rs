use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Zero-byte read on a live stream: the peer shut the connection
    /// down. Not a data error.
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("payload too large for fixed frame: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("buffer too short")]
    TooShort,
    #[error("schema has no fields")]
    EmptySchema,
    #[error("duplicate schema field {0:?}")]
    DuplicateField(String),
    #[error("field {field:?} references unknown field {reference:?}")]
    UnknownLengthRef { field: String, reference: String },
    #[error("field {field:?} references {reference:?} before it is decoded")]
    ForwardLengthRef { field: String, reference: String },
    #[error("length reference {reference:?} must be a 4-byte field")]
    BadLengthRef { reference: String },
    #[error("invalid schema notation: {0}")]
    SchemaNotation(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
