//! Hand completed captures to the encoder and the preview path

use crate::capture::{CaptureBackend, CompletedRequest};

/// What the encoder did with a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The buffer went into the output stream.
    Accepted,
    /// The encoder is not recording yet (for example waiting for a
    /// keyframe or for another camera). Not an error.
    Deferred,
}

/// Encode `request` on the video stream, then show it on the preview path.
///
/// Preview happens whatever the encoder decided.
pub fn dispatch<B: CaptureBackend>(backend: &mut B, request: &CompletedRequest) -> DispatchOutcome {
    let stream = backend.video_stream();
    let accepted = backend.encode_buffer(request, stream);
    backend.show_preview(request, stream);
    if accepted {
        DispatchOutcome::Accepted
    } else {
        DispatchOutcome::Deferred
    }
}
