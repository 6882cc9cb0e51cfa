//! Owl servo wire protocol.
//!
//! Every frame is bracketed ASCII terminated by a newline:
//!
//! ```text
//! [m,1,<p1>,2,<p2>,3,<p3>]   set the three servo positions
//! [n] / [f]                  torque on / off
//! [v,<speed>]                servo speed
//! [g]                        query positions, device answers with one line
//! ```

use std::fmt;

use thiserror::Error;

/// Servo rest position. All gesture deltas are relative to it.
pub const NEUTRAL_POSITION: u16 = 2045;

/// Lowest position the head accepts without binding.
pub const POSITION_MIN: u16 = 1955;

/// Highest position the head accepts without binding.
pub const POSITION_MAX: u16 = 2135;

/// Number of servo channels on the head.
pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("channel {channel} position {position} is outside 1955..=2135")]
    OutOfRange { channel: usize, position: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty response")]
    Empty,
    #[error("response is not ASCII")]
    NotAscii,
    #[error("unexpected response: {0}")]
    Malformed(String),
}

// ─── Motor frames ──────────────────────────────────────────────────────────

/// Target positions for the three servos, always within the valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotorFrame {
    positions: [u16; CHANNELS],
}

impl MotorFrame {
    pub const NEUTRAL: MotorFrame = MotorFrame {
        positions: [NEUTRAL_POSITION; CHANNELS],
    };

    /// Validate absolute positions.
    pub fn new(positions: [i32; CHANNELS]) -> Result<Self, FrameError> {
        let mut checked = [NEUTRAL_POSITION; CHANNELS];
        for (channel, &position) in positions.iter().enumerate() {
            if position < POSITION_MIN as i32 || position > POSITION_MAX as i32 {
                return Err(FrameError::OutOfRange {
                    channel: channel + 1,
                    position,
                });
            }
            checked[channel] = position as u16;
        }
        Ok(Self { positions: checked })
    }

    /// Offset every channel from neutral, saturating at the range limits.
    pub fn offset(deltas: [i16; CHANNELS]) -> Self {
        let mut positions = [NEUTRAL_POSITION; CHANNELS];
        for (slot, delta) in positions.iter_mut().zip(deltas) {
            let target = NEUTRAL_POSITION as i32 + delta as i32;
            *slot = target.clamp(POSITION_MIN as i32, POSITION_MAX as i32) as u16;
        }
        Self { positions }
    }

    pub fn positions(&self) -> [u16; CHANNELS] {
        self.positions
    }

    /// Signed distance of each channel from neutral.
    pub fn deltas(&self) -> [i32; CHANNELS] {
        self.positions.map(|p| p as i32 - NEUTRAL_POSITION as i32)
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────

/// One wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetPositions(MotorFrame),
    Torque(bool),
    Speed(u32),
    QueryPositions,
}

impl Command {
    /// Encode as the exact bytes written to the port, newline included.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    /// Whether the device answers this command with a line.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::QueryPositions)
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::SetPositions(_) => "positions",
            Command::Torque(true) => "torque-on",
            Command::Torque(false) => "torque-off",
            Command::Speed(_) => "speed",
            Command::QueryPositions => "query",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetPositions(frame) => {
                let [p1, p2, p3] = frame.positions();
                write!(f, "[m,1,{p1},2,{p2},3,{p3}]")
            }
            Command::Torque(true) => f.write_str("[n]"),
            Command::Torque(false) => f.write_str("[f]"),
            Command::Speed(value) => write!(f, "[v,{value}]"),
            Command::QueryPositions => f.write_str("[g]"),
        }
    }
}

// ─── Responses ─────────────────────────────────────────────────────────────

/// Decode one raw response line: strip the line ending, require non-empty ASCII.
pub fn decode_line(raw: &[u8]) -> Result<String, DecodeError> {
    if !raw.is_ascii() {
        return Err(DecodeError::NotAscii);
    }
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(line.to_string())
}

/// Extract the three positions from a query response.
///
/// Accepts the echo form `[m,1,<p1>,2,<p2>,3,<p3>]` (any leading tag letter)
/// and the bare form `<p1>,<p2>,<p3>`.
pub fn parse_positions(line: &str) -> Result<[u16; CHANNELS], DecodeError> {
    let body = line.trim().trim_start_matches('[').trim_end_matches(']');
    let mut fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields
        .first()
        .is_some_and(|f| f.chars().all(|c| c.is_ascii_alphabetic()) && !f.is_empty())
    {
        fields.remove(0);
    }

    let numbers: Vec<u16> = fields
        .iter()
        .map(|f| f.parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| DecodeError::Malformed(line.to_string()))?;

    match numbers.as_slice() {
        [1, p1, 2, p2, 3, p3] => Ok([*p1, *p2, *p3]),
        [p1, p2, p3] => Ok([*p1, *p2, *p3]),
        _ => Err(DecodeError::Malformed(line.to_string())),
    }
}
