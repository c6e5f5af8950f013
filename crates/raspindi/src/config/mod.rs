//! Runtime configuration
//!
//! Settings are read once at startup from a TOML file through the
//! [`ParameterResolver`], then overlaid with command-line overrides. The
//! resulting [`Options`] never change while the camera runs.

mod resolver;
mod transform;

pub use resolver::{Bounded, ParameterResolver, Setting};
pub use transform::Transform;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;

/// Config file read when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/raspindi.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "RASPINDI_CONFIG";

/// State file the status indicator writes to.
pub const DEFAULT_NEOPIXEL_PATH: &str = "/tmp/neopixel.state";

/// Encoded output format requested from the camera pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Raw planar YUV 4:2:0 frames
    #[default]
    Yuv420,
    /// One JPEG per frame
    Mjpeg,
    /// H.264 Annex B elementary stream
    H264,
    /// Container output through libav
    Libav,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Yuv420 => "yuv420",
            Codec::Mjpeg => "mjpeg",
            Codec::H264 => "h264",
            Codec::Libav => "libav",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yuv420" => Ok(Codec::Yuv420),
            "mjpeg" => Ok(Codec::Mjpeg),
            "h264" => Ok(Codec::H264),
            "libav" => Ok(Codec::Libav),
            other => Err(format!("unknown codec '{other}'")),
        }
    }
}

/// Values supplied on the command line. `None` leaves the file setting.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub timeout_ms: Option<u64>,
    pub frames: Option<u64>,
    pub codec: Option<Codec>,
    pub output: Option<String>,
    pub keypress: bool,
    pub signal: bool,
}

/// Fully resolved camera and run settings.
#[derive(Debug, Clone)]
pub struct Options {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    /// White balance mode
    pub awb: String,
    pub awb_gain_b: f64,
    pub awb_gain_r: f64,
    pub saturation: f64,
    pub sharpness: f64,
    pub contrast: f64,
    /// Brightness in -1.0..=1.0
    pub brightness: f64,
    pub exposure: String,
    pub metering: String,
    pub transform: Transform,
    pub codec: Codec,
    pub denoise: String,
    pub nopreview: bool,
    /// Stop after this long. Ignored when `frames` is set.
    pub timeout: Option<Duration>,
    /// Stop after this many dispatched frames.
    pub frames: Option<u64>,
    /// Read single-line commands from stdin
    pub keypress: bool,
    /// React to SIGUSR1/SIGUSR2/SIGPIPE
    pub signal: bool,
    pub neopixel_path: PathBuf,
    /// Output target: `-`, a file path, or `tcp://host:port`
    pub output: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 25.0,
            awb: "auto".into(),
            awb_gain_b: 0.0,
            awb_gain_r: 0.0,
            saturation: 1.0,
            sharpness: 1.0,
            contrast: 1.0,
            brightness: 0.0,
            exposure: "auto".into(),
            metering: "average".into(),
            transform: Transform::IDENTITY,
            codec: Codec::Yuv420,
            denoise: "off".into(),
            nopreview: true,
            timeout: None,
            frames: None,
            keypress: false,
            signal: false,
            neopixel_path: PathBuf::from(DEFAULT_NEOPIXEL_PATH),
            output: "-".into(),
        }
    }
}

impl Options {
    /// Resolve options from config settings and command-line overrides.
    ///
    /// Fails only for an illegal rotation.
    pub fn resolve(cfg: &ParameterResolver, overrides: &Overrides) -> Result<Self> {
        let d = Options::default();

        let width = cfg.get_bounded("width", d.width.into(), 1, 16384).or(d.width.into());
        let height = cfg.get_bounded("height", d.height.into(), 1, 16384).or(d.height.into());

        // 0..=100 maps onto -1.0..=1.0 with 50 as neutral
        let brightness = cfg.get_bounded("brightness", 50, 0, 100).or(50) as f64 / 50.0 - 1.0;

        let transform = Transform::from_mirror(&cfg.get("mirror", "none".to_string()))
            .then(Transform::from_rotation(cfg.get("rotation", 0_i64))?);

        let codec = match overrides.codec {
            Some(codec) => codec,
            None => {
                let name = cfg.get("codec", d.codec.to_string());
                name.parse().unwrap_or_else(|e| {
                    warn!("Invalid value for codec: {}", e);
                    d.codec
                })
            }
        };

        let timeout_ms = match overrides.timeout_ms {
            Some(ms) => ms as i64,
            None => cfg.get("timeout", 0_i64),
        };
        let frames = match overrides.frames {
            Some(n) => n as i64,
            None => cfg.get("frames", 0_i64),
        };

        Ok(Self {
            width: width as u32,
            height: height as u32,
            framerate: cfg.get("framerate", d.framerate),
            awb: cfg.get("awb", d.awb),
            awb_gain_b: cfg.get("b_gain", d.awb_gain_b),
            awb_gain_r: cfg.get("r_gain", d.awb_gain_r),
            saturation: cfg.get("saturation", d.saturation),
            sharpness: cfg.get("sharpness", d.sharpness),
            contrast: cfg.get("contrast", d.contrast),
            brightness,
            exposure: cfg.get("exposuremode", d.exposure),
            metering: cfg.get("meteringmode", d.metering),
            transform,
            codec,
            denoise: d.denoise,
            nopreview: d.nopreview,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64)),
            frames: (frames > 0).then_some(frames as u64),
            keypress: overrides.keypress || cfg.get("keypress", d.keypress),
            signal: overrides.signal || cfg.get("signal", d.signal),
            neopixel_path: PathBuf::from(cfg.get(
                "neopixel_path",
                DEFAULT_NEOPIXEL_PATH.to_string(),
            )),
            output: overrides
                .output
                .clone()
                .unwrap_or_else(|| cfg.get("output", d.output)),
        })
    }

    /// Bytes in one raw frame for the configured geometry, if uncompressed.
    pub fn raw_frame_len(&self) -> Option<usize> {
        match self.codec {
            Codec::Yuv420 => {
                let w = self.width as usize;
                let h = self.height as usize;
                Some(w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)))
            }
            _ => None,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "  Video: {}x{} @ {}fps, codec {}",
            self.width, self.height, self.framerate, self.codec
        );
        info!(
            "  AWB: {} (r={}, b={}), exposure {}, metering {}",
            self.awb, self.awb_gain_r, self.awb_gain_b, self.exposure, self.metering
        );
        info!(
            "  Tuning: saturation={} sharpness={} contrast={} brightness={:.2}",
            self.saturation, self.sharpness, self.contrast, self.brightness
        );
        info!("  Transform: {}", self.transform);
        match (self.frames, self.timeout) {
            (Some(frames), _) => info!("  Stop after {} frames", frames),
            (None, Some(timeout)) => info!("  Stop after {:?}", timeout),
            (None, None) => info!("  Run until stopped"),
        }
        info!(
            "  Keypress: {}, signals: {}",
            if self.keypress { "enabled" } else { "disabled" },
            if self.signal { "enabled" } else { "disabled" }
        );
        info!("  Output: {}", self.output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn resolve(text: &str) -> Result<Options> {
        let cfg = ParameterResolver::parse(text, "test.toml")?;
        Options::resolve(&cfg, &Overrides::default())
    }

    #[test]
    fn defaults_without_config() {
        let opts = Options::resolve(&ParameterResolver::empty(), &Overrides::default()).unwrap();
        assert_eq!((opts.width, opts.height), (1280, 720));
        assert_eq!(opts.framerate, 25.0);
        assert_eq!(opts.awb, "auto");
        assert_eq!(opts.metering, "average");
        assert_eq!(opts.brightness, 0.0);
        assert_eq!(opts.codec, Codec::Yuv420);
        assert_eq!(opts.denoise, "off");
        assert!(opts.nopreview);
        assert!(opts.timeout.is_none());
        assert!(opts.frames.is_none());
        assert_eq!(opts.neopixel_path, PathBuf::from(DEFAULT_NEOPIXEL_PATH));
        assert_eq!(opts.output, "-");
    }

    #[test]
    fn settings_from_file() {
        let opts = resolve(
            r#"
            width = 1920
            height = 1080
            framerate = 30
            awb = "daylight"
            b_gain = 1.2
            r_gain = 1.8
            saturation = 2
            exposuremode = "sport"
            meteringmode = "spot"
            brightness = 75
            neopixel_path = "/run/tally.state"
            "#,
        )
        .unwrap();
        assert_eq!((opts.width, opts.height), (1920, 1080));
        assert_eq!(opts.framerate, 30.0);
        assert_eq!(opts.awb, "daylight");
        assert_eq!(opts.awb_gain_b, 1.2);
        assert_eq!(opts.awb_gain_r, 1.8);
        assert_eq!(opts.saturation, 2.0);
        assert_eq!(opts.exposure, "sport");
        assert_eq!(opts.metering, "spot");
        assert_eq!(opts.brightness, 0.5);
        assert_eq!(opts.neopixel_path, PathBuf::from("/run/tally.state"));
    }

    #[test]
    fn brightness_over_range_falls_back_to_neutral() {
        let opts = resolve("brightness = 150").unwrap();
        assert_eq!(opts.brightness, 0.0);
    }

    #[test]
    fn brightness_below_range_is_darkest() {
        let opts = resolve("brightness = -5").unwrap();
        assert_eq!(opts.brightness, -1.0);
    }

    #[test]
    fn mirror_and_rotation_combine() {
        let opts = resolve("mirror = \"horizontal\"\nrotation = 180").unwrap();
        assert_eq!(opts.transform, Transform::VFLIP);
    }

    #[test]
    fn illegal_rotation_is_fatal() {
        assert!(matches!(
            resolve("rotation = 45"),
            Err(Error::IllegalRotation(45))
        ));
    }

    #[test]
    fn codec_names_are_case_insensitive() {
        assert_eq!("YUV420".parse::<Codec>().unwrap(), Codec::Yuv420);
        assert_eq!("MJPEG".parse::<Codec>().unwrap(), Codec::Mjpeg);
        assert!("vp9".parse::<Codec>().is_err());
    }

    #[test]
    fn unknown_codec_uses_default() {
        assert_eq!(resolve("codec = \"vp9\"").unwrap().codec, Codec::Yuv420);
        assert_eq!(resolve("codec = \"h264\"").unwrap().codec, Codec::H264);
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let opts = resolve("timeout = 0\nframes = 0").unwrap();
        assert!(opts.timeout.is_none());
        assert!(opts.frames.is_none());

        let opts = resolve("timeout = 5000\nframes = 10").unwrap();
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.frames, Some(10));
    }

    #[test]
    fn overrides_win() {
        let cfg = ParameterResolver::parse(
            "codec = \"mjpeg\"\ntimeout = 1000\noutput = \"/tmp/a.yuv\"",
            "test.toml",
        )
        .unwrap();
        let overrides = Overrides {
            timeout_ms: Some(0),
            frames: Some(3),
            codec: Some(Codec::H264),
            output: Some("tcp://10.0.0.2:5000".into()),
            keypress: true,
            signal: true,
        };
        let opts = Options::resolve(&cfg, &overrides).unwrap();
        assert_eq!(opts.codec, Codec::H264);
        assert!(opts.timeout.is_none());
        assert_eq!(opts.frames, Some(3));
        assert_eq!(opts.output, "tcp://10.0.0.2:5000");
        assert!(opts.keypress && opts.signal);
    }

    #[test]
    fn raw_frame_len_for_yuv420() {
        let opts = Options {
            width: 4,
            height: 2,
            ..Default::default()
        };
        assert_eq!(opts.raw_frame_len(), Some(8 + 2 * 2));

        let opts = Options {
            codec: Codec::H264,
            ..Default::default()
        };
        assert_eq!(opts.raw_frame_len(), None);
    }
}
