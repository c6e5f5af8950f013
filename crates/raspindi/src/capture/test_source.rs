//! Synthetic capture backend for development without a camera

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

use super::backend::{CaptureBackend, CompletedRequest, Msg, RequestPool, Stream, VideoFlags};
use super::rpicam::DEVICE_TIMEOUT;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::output::{FrameMetadata, OutputSink};

/// Configuration for the test source
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Generated frame size in bytes
    pub frame_size: usize,
    /// Mark every Nth frame as a keyframe
    pub keyframe_interval: u32,
    /// Frames the encoder defers after it starts
    pub warmup_frames: u64,
    /// Stop producing after this many frames, then quit
    pub limit: Option<u64>,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 25,
            frame_size: 10000,
            keyframe_interval: 25,
            warmup_frames: 0,
            limit: None,
        }
    }
}

impl TestSourceConfig {
    /// Match the geometry and rate of `options`.
    pub fn from_options(options: &Options) -> Self {
        let fps = options.framerate.round().max(1.0) as u32;
        Self {
            width: options.width,
            height: options.height,
            fps,
            frame_size: options.raw_frame_len().unwrap_or(10000),
            keyframe_interval: fps,
            ..Default::default()
        }
    }
}

/// Generates patterned frames at a fixed rate
pub struct TestBackend {
    config: TestSourceConfig,
    pool: RequestPool,
    sink: Option<Arc<dyn OutputSink>>,
    opened: bool,
    encoding: bool,
    /// Buffers seen since the encoder started
    encoder_frames: u64,
    producer: Option<JoinHandle<()>>,
    rx: Option<mpsc::Receiver<CompletedRequest>>,
    next_sequence: u64,
}

impl TestBackend {
    pub fn new(config: TestSourceConfig) -> Self {
        Self {
            config,
            pool: RequestPool::new(4),
            sink: None,
            opened: false,
            encoding: false,
            encoder_frames: 0,
            producer: None,
            rx: None,
            next_sequence: 0,
        }
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }
}

fn test_frame(config: &TestSourceConfig, sequence: u64, timestamp_us: u64) -> Bytes {
    let is_keyframe = sequence % config.keyframe_interval.max(1) as u64 == 0;

    let mut data = Vec::with_capacity(config.frame_size);
    data.extend_from_slice(&sequence.to_be_bytes());
    data.push(if is_keyframe { 0x01 } else { 0x00 });
    data.extend_from_slice(&timestamp_us.to_be_bytes());
    data.resize(config.frame_size.max(data.len()), (sequence & 0xFF) as u8);
    data.truncate(config.frame_size);
    Bytes::from(data)
}

async fn produce(
    config: TestSourceConfig,
    pool: RequestPool,
    tx: mpsc::Sender<CompletedRequest>,
    mut sequence: u64,
) {
    let mut ticker = interval(Duration::from_micros(1_000_000 / config.fps.max(1) as u64));
    let start = Instant::now();
    let mut produced = 0u64;

    info!(
        "Test source started: {}x{} @ {}fps, {}B frames",
        config.width, config.height, config.fps, config.frame_size
    );

    while config.limit.map_or(true, |limit| produced < limit) {
        ticker.tick().await;
        let Some(slot) = pool.acquire().await else {
            break;
        };
        let timestamp_us = start.elapsed().as_micros() as u64;
        let buffer = test_frame(&config, sequence, timestamp_us);
        if tx.send(slot.complete(sequence, timestamp_us, buffer)).await.is_err() {
            break;
        }
        sequence += 1;
        produced += 1;
        if produced % 300 == 0 {
            debug!("Test source: {} frames generated", produced);
        }
    }

    info!("Test source stopped after {} frames", produced);
}

impl CaptureBackend for TestBackend {
    fn set_output(&mut self, sink: Arc<dyn OutputSink>) {
        self.sink = Some(sink);
    }

    fn open_camera(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn configure_video(&mut self, flags: VideoFlags) -> Result<()> {
        if !self.opened {
            return Err(Error::NotReady("open"));
        }
        debug!("Test source configured ({:?})", flags);
        Ok(())
    }

    fn start_encoder(&mut self) -> Result<()> {
        if !self.opened {
            return Err(Error::NotReady("open"));
        }
        self.encoding = true;
        self.encoder_frames = 0;
        Ok(())
    }

    fn start_camera(&mut self) -> Result<()> {
        if !self.encoding {
            return Err(Error::NotReady("encoding"));
        }
        if self.producer.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.pool.capacity());
        self.producer = Some(tokio::spawn(produce(
            self.config.clone(),
            self.pool.clone(),
            tx,
            self.next_sequence,
        )));
        self.rx = Some(rx);
        Ok(())
    }

    fn stop_camera(&mut self) -> Result<()> {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.rx = None;
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<()> {
        self.encoding = false;
        Ok(())
    }

    async fn wait(&mut self) -> Msg {
        let Some(rx) = self.rx.as_mut() else {
            return Msg::quit();
        };
        match tokio::time::timeout(DEVICE_TIMEOUT, rx.recv()).await {
            Ok(Some(request)) => {
                self.next_sequence = request.sequence + 1;
                Msg::request_complete(request)
            }
            Ok(None) => Msg::quit(),
            Err(_) => Msg::timeout(),
        }
    }

    fn video_stream(&self) -> Stream {
        Stream {
            width: self.config.width,
            height: self.config.height,
            stride: self.config.width,
        }
    }

    fn encode_buffer(&mut self, request: &CompletedRequest, _stream: Stream) -> bool {
        self.encoder_frames += 1;
        if self.encoder_frames <= self.config.warmup_frames {
            return false;
        }
        let Some(sink) = &self.sink else {
            return false;
        };
        let keyframe = request.buffer.get(8) == Some(&0x01);
        sink.output_ready(&request.buffer, request.timestamp_us, keyframe);
        sink.metadata_ready(&FrameMetadata {
            sequence: request.sequence,
            timestamp_us: request.timestamp_us,
            bytes: request.buffer.len(),
            keyframe,
        });
        true
    }

    fn show_preview(&mut self, _request: &CompletedRequest, _stream: Stream) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Indicator, OutputTarget, StreamOutput};

    #[test]
    fn frames_carry_header_and_size() {
        let config = TestSourceConfig {
            frame_size: 32,
            keyframe_interval: 10,
            ..Default::default()
        };
        let key = test_frame(&config, 10, 400);
        assert_eq!(key.len(), 32);
        assert_eq!(&key[..8], &10u64.to_be_bytes());
        assert_eq!(key[8], 0x01);
        assert_eq!(test_frame(&config, 11, 440)[8], 0x00);
    }

    #[tokio::test(start_paused = true)]
    async fn produces_until_limit_then_quits() {
        let mut backend = TestBackend::new(TestSourceConfig {
            frame_size: 64,
            warmup_frames: 2,
            limit: Some(5),
            ..Default::default()
        });
        backend.set_output(Arc::new(StreamOutput::with_writer(
            OutputTarget::Stdout,
            Box::new(std::io::sink()),
            Indicator::new("/nonexistent/neopixel.state"),
        )));
        backend.open_camera().unwrap();
        backend.configure_video(VideoFlags::empty()).unwrap();
        backend.start_encoder().unwrap();
        backend.start_camera().unwrap();

        let stream = backend.video_stream();
        let mut accepted = Vec::new();
        loop {
            let msg = backend.wait().await;
            let Some(request) = msg.payload else {
                assert_eq!(msg.kind, crate::capture::MsgType::Quit);
                break;
            };
            accepted.push(backend.encode_buffer(&request, stream));
        }
        assert_eq!(accepted, vec![false, false, true, true, true]);
        assert_eq!(backend.pool().in_flight(), 0);
    }
}
