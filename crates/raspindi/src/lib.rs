//! Raspindi camera capture
//!
//! Runs a camera on a Raspberry Pi and streams its output:
//! - Configuration from a TOML file, resolved once at startup
//! - Capture through `rpicam-vid` (or a synthetic test source)
//! - A single-task event loop with timeout, frame-count and stop-key handling
//! - Signals and stdin keypresses merged into control keys
//! - Encoded output to stdout, a file, or a TCP receiver, plus a status indicator

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod signal;

// Re-export commonly used types
pub use capture::{CaptureBackend, CompletedRequest, Msg, MsgType, RpicamBackend, VideoFlags};
pub use config::{Codec, Options, Overrides, ParameterResolver};
pub use dispatch::{dispatch, DispatchOutcome};
pub use error::{Error, Result};
pub use orchestrator::{run, RunReport, TerminationCause};
pub use output::{Indicator, OutputSink, OutputTarget, StreamOutput};
pub use signal::{ControlKey, ControlSource, SignalBridge};

#[cfg(feature = "test-source")]
pub use capture::{TestBackend, TestSourceConfig};
