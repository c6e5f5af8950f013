//! Camera capture backends
//!
//! The event loop drives any [`CaptureBackend`]. Two are provided:
//!
//! - [`RpicamBackend`] runs `rpicam-vid` and reads its encoded stdout
//! - `TestBackend` (feature `test-source`) generates frames without hardware

mod backend;
mod framing;
pub mod h264;
mod rpicam;
#[cfg(feature = "test-source")]
mod test_source;

pub use backend::{
    CaptureBackend, CompletedRequest, Msg, MsgType, RequestPool, RequestSlot, Stream, VideoFlags,
};
pub use framing::{Framer, Framing};
pub use rpicam::{RpicamBackend, DEVICE_TIMEOUT, RPICAM_PROGRAM};
#[cfg(feature = "test-source")]
pub use test_source::{TestBackend, TestSourceConfig};
