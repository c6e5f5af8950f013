//! The capture event loop
//!
//! Brings the camera and encoder up, feeds every completed capture through
//! [`dispatch`], and decides once per frame whether to keep going:
//!
//! - device timeouts restart the camera and are otherwise ignored
//! - a quit from the framework ends the run
//! - a time limit applies only when no frame limit is set
//! - a frame limit ends the run once that many frames were encoded
//! - a stop key (stdin `x`, SIGINT, or SIGUSR2/SIGPIPE in signal mode) ends the run
//!
//! Shutdown always stops the camera before the encoder, so buffers the
//! encoder is still draining are not lost.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureBackend, MsgType, VideoFlags};
use crate::config::Options;
use crate::dispatch::{dispatch, DispatchOutcome};
use crate::error::{Error, Result};
use crate::output::OutputSink;
use crate::signal::{ControlKey, ControlSource};

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The configured time limit elapsed.
    Timeout,
    /// The configured number of frames was encoded.
    FrameCount,
    /// A stop key or stop signal arrived.
    StopKey,
    /// The capture framework asked to quit.
    Quit,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Timeout => write!(f, "timeout"),
            TerminationCause::FrameCount => write!(f, "frame count reached"),
            TerminationCause::StopKey => write!(f, "stop requested"),
            TerminationCause::Quit => write!(f, "capture quit"),
        }
    }
}

/// Counters the loop uses to decide when to stop.
///
/// `frame_count` and `start_time` only ever reset together: while the
/// encoder defers buffers the run has not really started yet.
#[derive(Debug, Clone, Copy)]
pub struct RunState {
    frame_count: u64,
    start_time: Instant,
}

impl RunState {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            start_time: now,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Account for one dispatched frame.
    pub fn record(&mut self, outcome: DispatchOutcome, now: Instant) {
        match outcome {
            DispatchOutcome::Accepted => self.frame_count += 1,
            DispatchOutcome::Deferred => {
                self.frame_count = 0;
                self.start_time = now;
            }
        }
    }

    /// Checks made before a frame is dispatched: time limit, then stop key.
    ///
    /// The time limit is ignored whenever a frame limit is configured.
    pub fn check_before_dispatch(
        &self,
        options: &Options,
        key: ControlKey,
        now: Instant,
    ) -> Option<TerminationCause> {
        if options.frames.is_none() {
            if let Some(limit) = options.timeout {
                if now.duration_since(self.start_time) >= limit {
                    info!("Halting: reached timeout of {} milliseconds.", limit.as_millis());
                    return Some(TerminationCause::Timeout);
                }
            }
        }
        if key.is_stop() {
            info!("Halting: stop requested");
            return Some(TerminationCause::StopKey);
        }
        None
    }

    /// Check made after a frame is dispatched: frame limit.
    pub fn check_after_dispatch(&self, options: &Options) -> Option<TerminationCause> {
        match options.frames {
            Some(limit) if self.frame_count >= limit => {
                info!("Halting: reached {} frames.", limit);
                Some(TerminationCause::FrameCount)
            }
            _ => None,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub cause: TerminationCause,
    /// Frames the encoder accepted
    pub frames: u64,
    /// Frames the encoder deferred
    pub deferred: u64,
    /// Camera restarts after device timeouts
    pub restarts: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Tally {
    frames: u64,
    deferred: u64,
    restarts: u64,
}

/// Run the camera until a termination condition holds, then shut down.
///
/// The sink is registered with the backend before the camera opens and is
/// pulsed on [`ControlKey::Trigger`].
pub async fn run<B, C>(
    backend: &mut B,
    sink: Arc<dyn OutputSink>,
    controls: &mut C,
    options: &Options,
) -> Result<RunReport>
where
    B: CaptureBackend,
    C: ControlSource,
{
    backend.set_output(sink.clone());
    backend.open_camera()?;
    backend.configure_video(VideoFlags::for_codec(options.codec))?;
    backend.start_encoder()?;
    if let Err(e) = backend.start_camera() {
        if let Err(stop_err) = backend.stop_encoder() {
            warn!("Stopping encoder after failed start also failed: {}", stop_err);
        }
        return Err(e);
    }

    let started = Instant::now();
    let mut tally = Tally::default();
    let outcome = event_loop(backend, sink.as_ref(), controls, options, &mut tally).await;

    let stopped = shutdown(backend);
    let cause = match outcome {
        Ok(cause) => {
            stopped?;
            cause
        }
        Err(e) => {
            if let Err(stop_err) = stopped {
                warn!("Shutdown after error also failed: {}", stop_err);
            }
            return Err(e);
        }
    };

    let report = RunReport {
        cause,
        frames: tally.frames,
        deferred: tally.deferred,
        restarts: tally.restarts,
        elapsed: started.elapsed(),
    };
    info!(
        "Capture finished ({}): {} frames encoded, {} deferred, {} camera restarts in {:.1}s",
        report.cause,
        report.frames,
        report.deferred,
        report.restarts,
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

async fn event_loop<B, C>(
    backend: &mut B,
    sink: &dyn OutputSink,
    controls: &mut C,
    options: &Options,
    tally: &mut Tally,
) -> Result<TerminationCause>
where
    B: CaptureBackend,
    C: ControlSource,
{
    let mut state = RunState::new(Instant::now());

    loop {
        let msg = backend.wait().await;
        match msg.kind {
            MsgType::Timeout => {
                error!("Device timeout detected, attempting a restart");
                backend.stop_camera()?;
                backend.start_camera()?;
                tally.restarts += 1;
                continue;
            }
            MsgType::Quit => return Ok(TerminationCause::Quit),
            MsgType::RequestComplete => {}
        }
        let request = msg
            .payload
            .ok_or(Error::UnrecognisedMessage("request complete without a buffer"))?;

        let key = controls.poll_control_key();
        if key == ControlKey::Trigger {
            sink.signal();
        }

        if state.frame_count() % 100 == 0 {
            debug!("Viewfinder frame {}", state.frame_count());
        }

        let now = Instant::now();
        if let Some(cause) = state.check_before_dispatch(options, key, now) {
            return Ok(cause);
        }

        let outcome = dispatch(backend, &request);
        state.record(outcome, now);
        match outcome {
            DispatchOutcome::Accepted => tally.frames += 1,
            DispatchOutcome::Deferred => tally.deferred += 1,
        }
        // Return the buffer to the framework before asking for the next one.
        drop(request);

        if let Some(cause) = state.check_after_dispatch(options) {
            return Ok(cause);
        }
    }
}

fn shutdown<B: CaptureBackend>(backend: &mut B) -> Result<()> {
    let camera = backend.stop_camera();
    let encoder = backend.stop_encoder();
    camera.and(encoder)
}
