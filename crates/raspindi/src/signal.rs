//! Process signals and stdin keypresses merged into one control key
//!
//! Signal handlers only store the signal number in an atomic. The control
//! loop polls [`SignalBridge::poll_control_key`] once per frame, which reads
//! (and, in signal mode, clears) that value and checks stdin without
//! blocking. Stdin bytes are buffered until a whole line is present.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Last signal received, 0 when none is pending.
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Most bytes taken from stdin per poll.
const READ_CHUNK: usize = 256;

/// Signals the bridge installs handlers for.
pub const HANDLED_SIGNALS: [libc::c_int; 4] =
    [libc::SIGINT, libc::SIGUSR1, libc::SIGUSR2, libc::SIGPIPE];

/// Async-signal-safe: a single atomic store.
extern "C" fn record_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
}

/// What the operator asked for during one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    None,
    /// Stop capturing and shut down
    Stop,
    /// Pulse the output indicator
    Trigger,
    /// Any other single-character command
    Raw(char),
}

impl ControlKey {
    /// Map the first character of a stdin line.
    pub fn from_char(c: char) -> Self {
        match c {
            '\n' => ControlKey::Trigger,
            'x' | 'X' => ControlKey::Stop,
            c => ControlKey::Raw(c),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, ControlKey::Stop)
    }
}

/// Something the control loop can poll for a key each iteration.
pub trait ControlSource {
    fn poll_control_key(&mut self) -> ControlKey;
}

/// Combine a pending signal with a stdin key.
///
/// Returns the key and whether the pending signal was consumed.
fn merge(pending: i32, typed: Option<char>, signal_mode: bool) -> (ControlKey, bool) {
    if pending == libc::SIGINT {
        return (ControlKey::Stop, false);
    }
    let mut key = typed.map_or(ControlKey::None, ControlKey::from_char);
    if signal_mode {
        if pending == libc::SIGUSR1 {
            key = ControlKey::Trigger;
        } else if pending == libc::SIGUSR2 || pending == libc::SIGPIPE {
            key = ControlKey::Stop;
        }
        return (key, true);
    }
    (key, false)
}

/// Remove the first complete line from `pending` and return its first character.
fn take_key(pending: &mut Vec<u8>) -> Option<char> {
    let end = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=end).collect();
    String::from_utf8_lossy(&line).chars().next()
}

/// Owns signal handling and stdin polling for the control loop.
pub struct SignalBridge {
    keypress: bool,
    signal: bool,
    input: RawFd,
    stdin_open: bool,
    /// Bytes read from `input` that do not yet end a line
    line: Vec<u8>,
}

impl SignalBridge {
    /// Install handlers for [`HANDLED_SIGNALS`].
    ///
    /// SIGPIPE is caught rather than left at its default so that a receiver
    /// disconnecting turns into an orderly stop instead of killing the
    /// process.
    pub fn install(keypress: bool, signal: bool) -> Result<Self> {
        for &signum in &HANDLED_SIGNALS {
            // SAFETY: `record_signal` only performs an atomic store.
            let previous = unsafe {
                libc::signal(signum, record_signal as *const () as libc::sighandler_t)
            };
            if previous == libc::SIG_ERR {
                return Err(Error::SignalInstall {
                    signal: signum,
                    source: io::Error::last_os_error(),
                });
            }
        }
        debug!("Signal handlers installed for {:?}", HANDLED_SIGNALS);
        Ok(Self::new(keypress, signal))
    }

    /// A bridge that reads the signal state without installing handlers.
    pub fn new(keypress: bool, signal: bool) -> Self {
        Self {
            keypress,
            signal,
            input: libc::STDIN_FILENO,
            stdin_open: true,
            line: Vec::new(),
        }
    }

    /// Read keypresses from `fd` instead of stdin.
    pub fn with_input(mut self, fd: RawFd) -> Self {
        self.input = fd;
        self
    }

    /// The pending signal number, if any.
    pub fn pending(&self) -> Option<i32> {
        match LAST_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signum => Some(signum),
        }
    }

    /// First character of a line from stdin, if a whole one is ready right now.
    fn read_key(&mut self) -> Option<char> {
        if let Some(key) = take_key(&mut self.line) {
            return Some(key);
        }
        if !self.stdin_open {
            return None;
        }
        let mut fds = [libc::pollfd {
            fd: self.input,
            events: libc::POLLIN,
            revents: 0,
        }];
        // SAFETY: `fds` is a valid array of one pollfd for the whole call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        if ready <= 0 || fds[0].revents & (libc::POLLIN | libc::POLLHUP) == 0 {
            return None;
        }

        let mut buf = [0u8; READ_CHUNK];
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes. Poll reported
        // the descriptor readable, so this returns without waiting.
        let n = unsafe { libc::read(self.input, buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => {
                info!("stdin closed, keypress commands disabled");
                self.stdin_open = false;
                // An unterminated last line still counts.
                let rest = std::mem::take(&mut self.line);
                String::from_utf8_lossy(&rest).chars().next()
            }
            n if n > 0 => {
                self.line.extend_from_slice(&buf[..n as usize]);
                take_key(&mut self.line)
            }
            _ => {
                let e = io::Error::last_os_error();
                if !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                    warn!("Failed to read stdin: {}", e);
                }
                None
            }
        }
    }
}

impl ControlSource for SignalBridge {
    fn poll_control_key(&mut self) -> ControlKey {
        let pending = LAST_SIGNAL.load(Ordering::SeqCst);
        let typed = if self.keypress && pending != libc::SIGINT {
            self.read_key()
        } else {
            None
        };
        let (key, consumed) = merge(pending, typed, self.signal);
        if consumed {
            if pending != 0 {
                info!("Received signal {}", pending);
            }
            // Only clear the value we read; a signal arriving meanwhile stays pending.
            let _ = LAST_SIGNAL.compare_exchange(pending, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
        if key != ControlKey::None {
            debug!("Control key: {:?}", key);
        }
        key
    }
}
