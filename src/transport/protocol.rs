//! Framing for the backend wire protocol.
//!
//! Every message in either direction is UTF-8 text followed by a single
//! `0x00` byte. The backend sends short control frames back on the same
//! socket to regulate the client's send rate.

use tracing::{error, warn};

/// Byte that ends every frame.
pub const TERMINATOR: u8 = 0x00;

/// Sent once per connection by a client that honours flow control.
pub const CMD_ACCEPT_BACK_PRESSURE: &str = "PRELERT_CMD_ABP";

/// Slow down, optionally followed by a delay in milliseconds.
pub const CMD_SLOW_DOWN: &str = "PRELERT_CMD_SD";

/// Cancel any slow-down in effect.
pub const CMD_SPEED_UP: &str = "PRELERT_CMD_SU";

/// Longest control frame the client will buffer.
pub const MAX_COMMAND_LEN: usize = 128;

/// Delay applied for a slow-down frame carrying no number.
pub const DEFAULT_SLOW_DOWN_MS: u64 = 100;

/// Append `text` as one frame to `buf`.
#[inline]
pub fn encode_frame(text: &str, buf: &mut Vec<u8>) {
    buf.reserve(text.len() + 1);
    buf.extend_from_slice(text.as_bytes());
    buf.push(TERMINATOR);
}

/// A decoded control frame received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    SlowDown { millis: u64 },
    SpeedUp,
    /// Anything else. Treated the same as a speed-up.
    Unrecognized(String),
}

impl ControlCommand {
    /// Decode one frame, without its terminator.
    pub fn parse(frame: &[u8]) -> Self {
        let command = String::from_utf8_lossy(frame);

        if let Some(arg) = command.strip_prefix(CMD_SLOW_DOWN) {
            if arg.is_empty() {
                return Self::SlowDown {
                    millis: DEFAULT_SLOW_DOWN_MS,
                };
            }

            let millis = match arg.parse::<u64>() {
                Ok(millis) => millis,
                Err(e) => {
                    error!(
                        command = %command,
                        error = %e,
                        default_ms = DEFAULT_SLOW_DOWN_MS,
                        "cannot decode slow down milliseconds",
                    );
                    DEFAULT_SLOW_DOWN_MS
                }
            };

            return Self::SlowDown { millis };
        }

        if command == CMD_SPEED_UP {
            Self::SpeedUp
        } else {
            Self::Unrecognized(command.into_owned())
        }
    }

    /// Slow-down delay this command leaves in effect.
    pub fn delay_ms(&self) -> u64 {
        match self {
            Self::SlowDown { millis } => *millis,
            Self::SpeedUp | Self::Unrecognized(_) => 0,
        }
    }
}

/// Reassembles control frames from arbitrary read chunks.
///
/// At most `MAX_COMMAND_LEN` bytes are held while waiting for a terminator.
/// A full buffer with no terminator is junk and gets dropped.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_COMMAND_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len),
            max_len,
        }
    }

    /// Feed a chunk of socket input, returning every frame it completes.
    /// Empty frames (consecutive terminators) are skipped.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in data {
            if byte == TERMINATOR {
                if !self.buf.is_empty() {
                    frames.push(std::mem::take(&mut self.buf));
                    self.buf.reserve(self.max_len);
                }
                continue;
            }

            if self.buf.len() >= self.max_len {
                warn!(
                    bytes = self.buf.len(),
                    "valid command not found in socket input, discarding",
                );
                self.buf.clear();
            }
            self.buf.push(byte);
        }

        frames
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
