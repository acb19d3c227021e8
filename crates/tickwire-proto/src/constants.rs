/// Length-prefixed framing prefix size in bytes.
///
/// A stream frame is `[u32 frame_len_le][payload]`, where `frame_len_le`
/// is the payload length in bytes.
pub const LEN_PREFIX: usize = 4;

/// Hard cap on a single decoded frame, in bytes.
/// Enforced on incoming length prefixes to avoid unbounded allocations.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default fixed-frame size when none is configured.
pub const DEFAULT_FIXED_LEN: usize = 1024;
