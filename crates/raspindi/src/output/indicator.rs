//! Status light driven through a state file
//!
//! A separate daemon watches the file and drives the LED.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

pub struct Indicator {
    path: PathBuf,
    lit: AtomicBool,
}

impl Indicator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lit: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::Relaxed)
    }

    /// Toggle the light and write the new state.
    pub fn pulse(&self) {
        let lit = !self.lit.fetch_xor(true, Ordering::Relaxed);
        let state = if lit { "on\n" } else { "off\n" };
        match std::fs::write(&self.path, state) {
            Ok(()) => debug!("Indicator {}", state.trim_end()),
            Err(e) => warn!("Failed to write indicator state {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_toggles_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neopixel.state");
        let indicator = Indicator::new(&path);

        indicator.pulse();
        assert!(indicator.is_lit());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "on\n");

        indicator.pulse();
        assert!(!indicator.is_lit());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "off\n");
    }

    #[test]
    fn unwritable_path_still_toggles() {
        let indicator = Indicator::new("/nonexistent/dir/neopixel.state");
        indicator.pulse();
        assert!(indicator.is_lit());
    }
}
