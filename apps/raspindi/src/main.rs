//! Raspindi Camera Binary
//!
//! Runs a Pi camera and writes its encoded stream to stdout, a file, or a
//! TCP receiver until a time limit, a frame limit, or a stop key.
//!
//! ## Usage
//!
//! ```bash
//! # Stream YUV420 frames to stdout using /etc/raspindi.toml
//! raspindi > frames.yuv
//!
//! # Ten seconds of H.264 to a receiver, with SIGUSR1/SIGUSR2 control
//! raspindi --codec h264 --timeout 10000 --signal --output tcp://10.0.0.2:5000
//!
//! # Alternative config file
//! RASPINDI_CONFIG=./raspindi.toml raspindi --keypress
//!
//! # Run with test source (development)
//! raspindi --test-source --frames 100 --output /dev/null
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use raspindi::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use raspindi::{
    CaptureBackend, Codec, Indicator, Options, OutputSink, OutputTarget, Overrides,
    ParameterResolver, RpicamBackend, SignalBridge, StreamOutput,
};

/// Stream a Raspberry Pi camera
#[derive(Debug, Parser)]
#[command(name = "raspindi", version)]
struct Args {
    /// Config file
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many milliseconds (0 = never, ignored with --frames)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Stop after this many encoded frames (0 = never)
    #[arg(long)]
    frames: Option<u64>,

    /// Output codec: yuv420, mjpeg, h264 or libav
    #[arg(long)]
    codec: Option<Codec>,

    /// Output target: `-` for stdout, a file path, or tcp://host:port
    #[arg(short, long)]
    output: Option<String>,

    /// Read commands from stdin (`x` stops, an empty line pulses the indicator)
    #[arg(short, long)]
    keypress: bool,

    /// React to SIGUSR1 (pulse) and SIGUSR2 (stop)
    #[arg(short, long)]
    signal: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Use a synthetic frame source instead of the camera
    #[arg(long)]
    test_source: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            timeout_ms: self.timeout,
            frames: self.frames,
            codec: self.codec,
            output: self.output.clone(),
            keypress: self.keypress,
            signal: self.signal,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout may carry the video stream.
    let directive = if args.verbose { "raspindi=debug" } else { "raspindi=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();

    match start(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ERROR: *** {:#} ***", e);
            ExitCode::FAILURE
        }
    }
}

async fn start(args: Args) -> Result<()> {
    let cfg = ParameterResolver::load(&args.config)?;
    let options = Options::resolve(&cfg, &args.overrides())?;

    info!("Raspindi starting");
    info!("  Config: {}", args.config.display());
    options.log_summary();
    info!("  Test source: {}", args.test_source);

    let output = StreamOutput::open(
        OutputTarget::parse(&options.output),
        Indicator::new(&options.neopixel_path),
    )?;
    let sink: Arc<dyn OutputSink> = Arc::new(output);

    let mut controls = SignalBridge::install(options.keypress, options.signal)
        .context("Failed to set up control signals")?;

    if args.test_source {
        #[cfg(feature = "test-source")]
        {
            info!("Starting test video source");
            let backend = raspindi::TestBackend::new(raspindi::TestSourceConfig::from_options(&options));
            return capture(backend, sink, &mut controls, &options).await;
        }
        #[cfg(not(feature = "test-source"))]
        {
            anyhow::bail!("Test source not enabled. Rebuild with --features test-source");
        }
    }

    capture(RpicamBackend::new(options.clone()), sink, &mut controls, &options).await
}

async fn capture<B: CaptureBackend>(
    mut backend: B,
    sink: Arc<dyn OutputSink>,
    controls: &mut SignalBridge,
    options: &Options,
) -> Result<()> {
    let report = raspindi::run(&mut backend, sink, controls, options).await?;
    info!("Raspindi stopped: {}", report.cause);
    Ok(())
}
