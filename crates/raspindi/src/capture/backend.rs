//! The seam between the event loop and a camera/encoder framework

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Codec;
use crate::error::Result;
use crate::output::OutputSink;

bitflags! {
    /// Flags passed when configuring the video pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VideoFlags: u32 {
        /// Full-range JPEG colourspace instead of the encoder default
        const JPEG_COLOURSPACE = 1 << 0;
    }
}

impl VideoFlags {
    /// Colourspace flags for a codec. MJPEG and raw YUV420 consumers expect
    /// full-range JPEG colour; everything else keeps the default.
    pub fn for_codec(codec: Codec) -> Self {
        match codec {
            Codec::Mjpeg | Codec::Yuv420 => VideoFlags::JPEG_COLOURSPACE,
            Codec::H264 | Codec::Libav => VideoFlags::empty(),
        }
    }
}

/// Geometry of the stream a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Bounded pool of in-flight capture buffers.
///
/// A producer needs a [`RequestSlot`] for every buffer it hands out. The
/// slot travels inside the [`CompletedRequest`] and returns to the pool when
/// the request is dropped, so a consumer that holds on to requests stalls
/// the producer.
#[derive(Debug, Clone)]
pub struct RequestPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<RequestSlot> {
        self.permits.clone().acquire_owned().await.ok().map(RequestSlot)
    }

    /// Take a free slot without waiting.
    pub fn try_acquire(&self) -> Option<RequestSlot> {
        self.permits.clone().try_acquire_owned().ok().map(RequestSlot)
    }

    /// Wake every waiting producer with `None`.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently held outside the pool.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

/// Ownership of one pool entry.
#[derive(Debug)]
pub struct RequestSlot(OwnedSemaphorePermit);

impl RequestSlot {
    /// Fill this slot with a completed buffer.
    pub fn complete(self, sequence: u64, timestamp_us: u64, buffer: Bytes) -> CompletedRequest {
        CompletedRequest {
            sequence,
            timestamp_us,
            buffer,
            _slot: self,
        }
    }
}

/// A captured buffer ready for encoding and preview.
#[derive(Debug)]
pub struct CompletedRequest {
    /// Frame sequence number assigned by the producer
    pub sequence: u64,
    /// Capture time in microseconds since the camera started
    pub timestamp_us: u64,
    pub buffer: Bytes,
    _slot: RequestSlot,
}

/// Kind of event delivered by [`CaptureBackend::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    RequestComplete,
    Timeout,
    Quit,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::RequestComplete => write!(f, "RequestComplete"),
            MsgType::Timeout => write!(f, "Timeout"),
            MsgType::Quit => write!(f, "Quit"),
        }
    }
}

/// An event from the capture framework.
///
/// Only `RequestComplete` carries a payload.
#[derive(Debug)]
pub struct Msg {
    pub kind: MsgType,
    pub payload: Option<CompletedRequest>,
}

impl Msg {
    pub fn request_complete(request: CompletedRequest) -> Self {
        Self {
            kind: MsgType::RequestComplete,
            payload: Some(request),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: MsgType::Timeout,
            payload: None,
        }
    }

    pub fn quit() -> Self {
        Self {
            kind: MsgType::Quit,
            payload: None,
        }
    }
}

/// A camera/encoder framework driven by the event loop.
///
/// Lifecycle: `open_camera` → `configure_video` → `start_encoder` →
/// `start_camera`, then `wait` until done, then `stop_camera` →
/// `stop_encoder`. The camera may be stopped and restarted while the
/// encoder keeps running.
#[allow(async_fn_in_trait)]
pub trait CaptureBackend {
    /// Route encoded output and frame metadata to `sink`.
    fn set_output(&mut self, sink: Arc<dyn OutputSink>);

    fn open_camera(&mut self) -> Result<()>;

    fn configure_video(&mut self, flags: VideoFlags) -> Result<()>;

    fn start_encoder(&mut self) -> Result<()>;

    fn start_camera(&mut self) -> Result<()>;

    fn stop_camera(&mut self) -> Result<()>;

    fn stop_encoder(&mut self) -> Result<()>;

    /// Wait for the next event. This is the only place the loop suspends.
    async fn wait(&mut self) -> Msg;

    fn video_stream(&self) -> Stream;

    /// Hand a buffer to the encoder. Returns `false` when the encoder is not
    /// yet recording and deferred the buffer.
    fn encode_buffer(&mut self, request: &CompletedRequest, stream: Stream) -> bool;

    /// Show a buffer on the preview path, if there is one.
    fn show_preview(&mut self, request: &CompletedRequest, stream: Stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colourspace_flags_follow_codec() {
        assert_eq!(VideoFlags::for_codec(Codec::Mjpeg), VideoFlags::JPEG_COLOURSPACE);
        assert_eq!(VideoFlags::for_codec(Codec::Yuv420), VideoFlags::JPEG_COLOURSPACE);
        assert!(VideoFlags::for_codec(Codec::H264).is_empty());
        assert!(VideoFlags::for_codec(Codec::Libav).is_empty());
    }

    #[test]
    fn dropping_request_returns_slot() {
        let pool = RequestPool::new(2);
        let a = pool.try_acquire().unwrap().complete(0, 0, Bytes::from_static(b"a"));
        let b = pool.try_acquire().unwrap().complete(1, 0, Bytes::from_static(b"b"));
        assert_eq!(pool.in_flight(), 2);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.in_flight(), 1);
        assert!(pool.try_acquire().is_some());
        drop(b);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_pool_yields_none() {
        let pool = RequestPool::new(1);
        let _held = pool.try_acquire().unwrap();
        pool.close();
        assert!(pool.acquire().await.is_none());
    }

    #[test]
    fn only_request_complete_has_payload() {
        assert!(Msg::timeout().payload.is_none());
        assert_eq!(Msg::quit().kind, MsgType::Quit);
        let pool = RequestPool::new(1);
        let req = pool.try_acquire().unwrap().complete(7, 0, Bytes::new());
        let msg = Msg::request_complete(req);
        assert_eq!(msg.kind, MsgType::RequestComplete);
        assert_eq!(msg.payload.map(|r| r.sequence), Some(7));
    }
}
