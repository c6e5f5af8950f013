//! Error type shared by every stage of the capture pipeline

use std::path::PathBuf;

/// Fatal conditions surfaced to the process boundary.
///
/// Recoverable conditions (device timeouts, out-of-range settings, output
/// write failures) are handled where they occur and never become an `Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not open config file {}: {source}", .path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {}{}: {message}", .path.display(), location(.line, .column))]
    ConfigParse {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("illegal rotation value {0}")]
    IllegalRotation(i64),

    #[error("transform {0} is not supported by the camera")]
    UnsupportedTransform(String),

    #[error("a frame limit needs frame-delimited output, codec {0} has none")]
    FrameLimitUnsupported(&'static str),

    #[error("unrecognised message: {0}")]
    UnrecognisedMessage(&'static str),

    #[error("failed to spawn {program}: {source}. Is it installed?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("camera is not {0}")]
    NotReady(&'static str),

    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("output {target}: {source}")]
    Output {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(":{line}:{column}"),
        (Some(line), None) => format!(":{line}"),
        _ => String::new(),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
