//! Output sinks for encoded frames
//!
//! The capture backend delivers every encoded buffer to an [`OutputSink`].
//! The event loop only touches the sink to pulse its indicator.

mod indicator;
mod stream;

pub use indicator::Indicator;
pub use stream::{OutputTarget, StreamOutput};

/// Per-frame metadata reported alongside encoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub timestamp_us: u64,
    /// Encoded size in bytes
    pub bytes: usize,
    pub keyframe: bool,
}

/// Receives encoded frames from the backend.
///
/// Called from whichever context the backend encodes on, so implementations
/// must be shareable.
pub trait OutputSink: Send + Sync {
    /// One encoded buffer is ready.
    fn output_ready(&self, data: &[u8], timestamp_us: u64, keyframe: bool);

    /// Metadata for the most recent frame is ready.
    fn metadata_ready(&self, metadata: &FrameMetadata);

    /// Pulse the auxiliary indicator. Fire and forget.
    fn signal(&self);
}
