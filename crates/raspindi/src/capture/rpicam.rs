//! Capture through the `rpicam-vid` command-line tool
//!
//! `rpicam-vid` owns the camera and the encoder and writes the encoded
//! stream to stdout. A reader task cuts that stream back into frames, one
//! request per frame, and queues them for [`CaptureBackend::wait`].

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::backend::{CaptureBackend, CompletedRequest, Msg, RequestPool, Stream, VideoFlags};
use super::framing::{Framer, Framing};
use super::h264;
use crate::config::{Codec, Options};
use crate::error::{Error, Result};
use crate::output::{FrameMetadata, OutputSink};

/// Program spawned for capture.
pub const RPICAM_PROGRAM: &str = "rpicam-vid";

/// No buffer for this long means the camera has stalled.
pub const DEVICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffers that may be in flight between the reader and the event loop.
const BUFFER_COUNT: usize = 6;

/// Longest wait for a killed camera process to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between exit checks while stopping.
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lifecycle {
    Closed,
    Opened,
    Configured,
    Encoding,
}

/// A camera driven through `rpicam-vid`.
pub struct RpicamBackend {
    options: Options,
    program: String,
    device_timeout: Duration,
    lifecycle: Lifecycle,
    args: Vec<String>,
    pool: RequestPool,
    sequence: Arc<AtomicU64>,
    sink: Option<Arc<dyn OutputSink>>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    rx: Option<mpsc::Receiver<CompletedRequest>>,
    /// H.264 output only starts at a keyframe
    recording: bool,
}

impl RpicamBackend {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            program: RPICAM_PROGRAM.to_string(),
            device_timeout: DEVICE_TIMEOUT,
            lifecycle: Lifecycle::Closed,
            args: Vec::new(),
            pool: RequestPool::new(BUFFER_COUNT),
            sequence: Arc::new(AtomicU64::new(0)),
            sink: None,
            child: None,
            reader: None,
            rx: None,
            recording: false,
        }
    }

    /// Run a different program with the same arguments.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Arguments the camera process will be started with.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    fn require(&self, at_least: Lifecycle, what: &'static str) -> Result<()> {
        if self.lifecycle < at_least {
            return Err(Error::NotReady(what));
        }
        Ok(())
    }
}

/// Build the `rpicam-vid` command line for `options`.
///
/// `rpicam-vid` can only flip, so any transform involving a transpose is
/// rejected.
pub fn command_args(options: &Options) -> Result<Vec<String>> {
    let transform = options.transform;
    if transform.transpose {
        return Err(Error::UnsupportedTransform(transform.to_string()));
    }

    let mut args = vec![
        "-t".to_string(),
        "0".to_string(), // Run until killed
        "--width".to_string(),
        options.width.to_string(),
        "--height".to_string(),
        options.height.to_string(),
        "--framerate".to_string(),
        options.framerate.to_string(),
        "--codec".to_string(),
        options.codec.to_string(),
        "--awb".to_string(),
        options.awb.clone(),
        "--saturation".to_string(),
        options.saturation.to_string(),
        "--sharpness".to_string(),
        options.sharpness.to_string(),
        "--contrast".to_string(),
        options.contrast.to_string(),
        "--brightness".to_string(),
        options.brightness.to_string(),
        "--exposure".to_string(),
        options.exposure.clone(),
        "--metering".to_string(),
        options.metering.clone(),
        "--denoise".to_string(),
        options.denoise.clone(),
    ];

    // Zero gains leave white balance to the AWB algorithm
    if options.awb_gain_r != 0.0 || options.awb_gain_b != 0.0 {
        args.push("--awbgains".to_string());
        args.push(format!("{},{}", options.awb_gain_r, options.awb_gain_b));
    }
    if transform.hflip {
        args.push("--hflip".to_string());
    }
    if transform.vflip {
        args.push("--vflip".to_string());
    }
    if options.nopreview {
        args.push("--nopreview".to_string());
    }
    if options.codec == Codec::H264 {
        args.push("--inline".to_string());
    }

    args.push("-o".to_string());
    args.push("-".to_string());
    args.push("--flush".to_string());
    Ok(args)
}

/// Turn the camera stream into completed requests.
///
/// Each request holds exactly one frame. Waits for a free pool slot before
/// reading the next frame, so a slow consumer pauses reading and
/// `rpicam-vid` blocks on its pipe.
async fn read_requests<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<CompletedRequest>,
    pool: RequestPool,
    framing: Framing,
    sequence: Arc<AtomicU64>,
) {
    let mut framer = Framer::new(framing);
    let started = Instant::now();
    let mut buffers = 0u64;
    let mut total_bytes = 0u64;

    loop {
        let Some(slot) = pool.acquire().await else {
            break;
        };
        let buffer = match framer.next_frame(&mut reader).await {
            Ok(Some(buffer)) => buffer,
            Ok(None) => {
                info!("Camera stream ended (EOF)");
                break;
            }
            Err(e) => {
                error!("Error reading camera stream: {}", e);
                break;
            }
        };

        buffers += 1;
        total_bytes += buffer.len() as u64;
        if buffers % 100 == 0 {
            debug!("Camera capture: {} buffers, {} bytes total", buffers, total_bytes);
        }

        let seq = sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_us = started.elapsed().as_micros() as u64;
        if tx.send(slot.complete(seq, timestamp_us, buffer)).await.is_err() {
            debug!("Request receiver dropped, stopping reader");
            break;
        }
    }

    info!(
        "Camera reader finished: {} buffers, {} bytes",
        buffers, total_bytes
    );
}

/// Kill `child` and wait, bounded by [`STOP_TIMEOUT`], until it has exited.
///
/// The camera is held until the old process is gone.
fn reap(program: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill {}: {}", program, e);
    }
    let deadline = std::time::Instant::now() + STOP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited: {}", program, status);
                return;
            }
            Ok(None) if std::time::Instant::now() < deadline => std::thread::sleep(STOP_POLL),
            Ok(None) => {
                warn!("{} still running {:?} after kill", program, STOP_TIMEOUT);
                return;
            }
            Err(e) => {
                warn!("Failed to wait for {}: {}", program, e);
                return;
            }
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(program: String, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", program, line);
    }
}

impl CaptureBackend for RpicamBackend {
    fn set_output(&mut self, sink: Arc<dyn OutputSink>) {
        self.sink = Some(sink);
    }

    fn open_camera(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Closed {
            warn!("Camera already open");
            return Ok(());
        }
        self.lifecycle = Lifecycle::Opened;
        debug!("Camera opened via {}", self.program);
        Ok(())
    }

    fn configure_video(&mut self, flags: VideoFlags) -> Result<()> {
        self.require(Lifecycle::Opened, "open")?;
        let framing = Framing::for_options(&self.options);
        if self.options.frames.is_some() && !framing.is_frame_delimited() {
            return Err(Error::FrameLimitUnsupported(self.options.codec.as_str()));
        }
        self.args = command_args(&self.options)?;
        self.lifecycle = self.lifecycle.max(Lifecycle::Configured);
        debug!("Video configured ({:?}): {:?}", flags, self.args);
        Ok(())
    }

    fn start_encoder(&mut self) -> Result<()> {
        self.require(Lifecycle::Configured, "configured")?;
        self.lifecycle = Lifecycle::Encoding;
        self.recording = self.options.codec != Codec::H264;
        Ok(())
    }

    fn start_camera(&mut self) -> Result<()> {
        self.require(Lifecycle::Encoding, "encoding")?;
        if self.child.is_some() {
            return Ok(());
        }

        info!(
            "Starting {}: {}x{} @ {}fps",
            self.program, self.options.width, self.options.height, self.options.framerate
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(Error::NotReady("readable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.program.clone(), stderr));
        }

        let (tx, rx) = mpsc::channel(BUFFER_COUNT);
        self.reader = Some(tokio::spawn(read_requests(
            stdout,
            tx,
            self.pool.clone(),
            Framing::for_options(&self.options),
            self.sequence.clone(),
        )));
        self.rx = Some(rx);
        self.child = Some(child);
        Ok(())
    }

    fn stop_camera(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // Dropping queued requests returns their slots.
        self.rx = None;
        if let Some(mut child) = self.child.take() {
            info!("Stopping {}", self.program);
            reap(&self.program, &mut child);
        }
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Encoding {
            self.lifecycle = Lifecycle::Configured;
        }
        self.recording = false;
        debug!("Encoder stopped");
        Ok(())
    }

    async fn wait(&mut self) -> Msg {
        let Some(rx) = self.rx.as_mut() else {
            return Msg::quit();
        };
        match tokio::time::timeout(self.device_timeout, rx.recv()).await {
            Ok(Some(request)) => Msg::request_complete(request),
            Ok(None) => {
                info!("{} stopped producing frames", self.program);
                Msg::quit()
            }
            Err(_) => Msg::timeout(),
        }
    }

    fn video_stream(&self) -> Stream {
        Stream {
            width: self.options.width,
            height: self.options.height,
            stride: self.options.width,
        }
    }

    fn encode_buffer(&mut self, request: &CompletedRequest, _stream: Stream) -> bool {
        let keyframe = match self.options.codec {
            Codec::H264 => h264::contains_keyframe(&request.buffer),
            _ => true,
        };
        if !self.recording {
            if !keyframe {
                trace!("Waiting for keyframe, deferring buffer {}", request.sequence);
                return false;
            }
            info!("Recording from buffer {}", request.sequence);
            if self.options.codec == Codec::H264 && !h264::contains_sps(&request.buffer) {
                warn!("First keyframe carries no SPS; receivers may not decode until the next one");
            }
            self.recording = true;
        }

        let Some(sink) = &self.sink else {
            return false;
        };
        sink.output_ready(&request.buffer, request.timestamp_us, keyframe);
        sink.metadata_ready(&FrameMetadata {
            sequence: request.sequence,
            timestamp_us: request.timestamp_us,
            bytes: request.buffer.len(),
            keyframe,
        });
        true
    }

    fn show_preview(&mut self, request: &CompletedRequest, _stream: Stream) {
        if !self.options.nopreview {
            trace!("Preview is not available, skipping buffer {}", request.sequence);
        }
    }
}

impl Drop for RpicamBackend {
    fn drop(&mut self) {
        let _ = self.stop_camera();
    }
}
