//! Raw byte-stream output to stdout, a file, or a TCP receiver

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::{FrameMetadata, Indicator, OutputSink};
use crate::error::{Error, Result};

/// Where encoded bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
    /// Connect to a listening receiver, `host:port`
    Tcp(String),
}

impl OutputTarget {
    pub fn parse(target: &str) -> Self {
        if target == "-" || target.is_empty() {
            OutputTarget::Stdout
        } else if let Some(addr) = target.strip_prefix("tcp://") {
            OutputTarget::Tcp(addr.to_string())
        } else {
            OutputTarget::File(PathBuf::from(target))
        }
    }

    fn open(&self) -> io::Result<Box<dyn Write + Send>> {
        let writer: Box<dyn Write + Send> = match self {
            OutputTarget::Stdout => Box::new(io::stdout()),
            OutputTarget::File(path) => Box::new(BufWriter::new(File::create(path)?)),
            OutputTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr)?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };
        Ok(writer)
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "stdout"),
            OutputTarget::File(path) => write!(f, "{}", path.display()),
            OutputTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

struct Writer {
    inner: Box<dyn Write + Send>,
    /// Set after the receiver went away; further frames are dropped.
    closed: bool,
}

/// Writes every encoded buffer, back to back, to one target.
///
/// Write failures are logged and counted, never propagated: a receiver that
/// disconnects shows up as SIGPIPE/EPIPE and is handled by the control loop.
pub struct StreamOutput {
    target: OutputTarget,
    writer: Mutex<Writer>,
    indicator: Indicator,
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl StreamOutput {
    pub fn open(target: OutputTarget, indicator: Indicator) -> Result<Self> {
        let inner = target.open().map_err(|source| Error::Output {
            target: target.to_string(),
            source,
        })?;
        info!("Output opened: {}", target);
        Ok(Self::with_writer(target, inner, indicator))
    }

    pub fn with_writer(
        target: OutputTarget,
        inner: Box<dyn Write + Send>,
        indicator: Indicator,
    ) -> Self {
        Self {
            target,
            writer: Mutex::new(Writer {
                inner,
                closed: false,
            }),
            indicator,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    pub fn frames_written(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flush(&self) {
        let Ok(mut w) = self.writer.lock() else {
            return;
        };
        if !w.closed {
            if let Err(e) = w.inner.flush() {
                warn!("Failed to flush output {}: {}", self.target, e);
            }
        }
    }
}

impl OutputSink for StreamOutput {
    fn output_ready(&self, data: &[u8], _timestamp_us: u64, _keyframe: bool) {
        let Ok(mut w) = self.writer.lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if w.closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match w.inner.write_all(data) {
            Ok(()) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if e.kind() == io::ErrorKind::BrokenPipe {
                    warn!("Output {} closed by receiver", self.target);
                    w.closed = true;
                } else {
                    warn!("Failed to write to {}: {}", self.target, e);
                }
            }
        }
    }

    fn metadata_ready(&self, metadata: &FrameMetadata) {
        if metadata.sequence % 100 == 0 {
            debug!(
                "Output: frame {} ({} bytes{}), {} frames / {} bytes written",
                metadata.sequence,
                metadata.bytes,
                if metadata.keyframe { ", keyframe" } else { "" },
                self.frames_written(),
                self.bytes_written()
            );
        }
    }

    fn signal(&self) {
        self.indicator.pulse();
    }
}

impl Drop for StreamOutput {
    fn drop(&mut self) {
        self.flush();
        info!(
            "Output {} finished: {} frames, {} bytes, {} dropped",
            self.target,
            self.frames_written(),
            self.bytes_written(),
            self.frames_dropped()
        );
    }
}
