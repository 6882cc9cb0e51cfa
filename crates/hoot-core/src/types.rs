//! Shared types for the hoot owl driver.
//!
//! Used across hoot-lib and hoot-cli. Keeping them here means consumers can
//! depend on the vocabulary without pulling in tokio, serialport or axum.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::protocol::MotorFrame;

/// Distance in servo units every gesture moves away from neutral.
pub const GESTURE_MAGNITUDE: i16 = 90;

/// Longest wait a batch entry may request after its gesture.
pub const MAX_BATCH_PAUSE: Duration = Duration::from_secs(60);

// ─── Gestures ──────────────────────────────────────────────────────────────

/// The six head gestures the owl can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovementType {
    TiltFront,
    TiltBack,
    RotateRight,
    RotateLeft,
    TiltRight,
    TiltLeft,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown movement: {0}")]
pub struct UnknownMovement(pub String);

impl MovementType {
    pub const ALL: [MovementType; 6] = [
        MovementType::TiltFront,
        MovementType::TiltBack,
        MovementType::RotateRight,
        MovementType::RotateLeft,
        MovementType::TiltRight,
        MovementType::TiltLeft,
    ];

    /// Marker code used in annotated text, e.g. `[TLTFRONT,1.0]`.
    pub fn code(self) -> &'static str {
        match self {
            MovementType::TiltFront => "TLTFRONT",
            MovementType::TiltBack => "TLTBACK",
            MovementType::RotateRight => "ROTRIGHT",
            MovementType::RotateLeft => "ROTLEFT",
            MovementType::TiltRight => "TLTRIGHT",
            MovementType::TiltLeft => "TLTLEFT",
        }
    }

    /// Numeric id used by the command API (1–6).
    pub fn id(self) -> u8 {
        match self {
            MovementType::TiltFront => 1,
            MovementType::TiltBack => 2,
            MovementType::RotateRight => 3,
            MovementType::RotateLeft => 4,
            MovementType::TiltRight => 5,
            MovementType::TiltLeft => 6,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.id() == id)
    }

    /// Look up a marker code. Exact, upper-case only.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Per-channel offset from neutral.
    pub fn deltas(self) -> [i16; 3] {
        const M: i16 = GESTURE_MAGNITUDE;
        match self {
            MovementType::TiltFront => [0, M, -M],
            MovementType::TiltBack => [0, -M, M],
            MovementType::RotateRight => [-M, -M, -M],
            MovementType::RotateLeft => [M, M, M],
            MovementType::TiltRight => [M, 0, -M],
            MovementType::TiltLeft => [-M, 0, M],
        }
    }

    /// The frame that moves the head into this gesture.
    pub fn frame(self) -> MotorFrame {
        MotorFrame::offset(self.deltas())
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Accepts marker codes in any case, snake_case names and numeric ids.
impl FromStr for MovementType {
    type Err = UnknownMovement;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(id) = trimmed.parse::<u8>() {
            return Self::from_id(id).ok_or_else(|| UnknownMovement(s.to_string()));
        }
        let normalized = trimmed.to_ascii_uppercase().replace(['_', '-'], "");
        let normalized = normalized
            .replace("TILT", "TLT")
            .replace("ROTATE", "ROT");
        Self::from_code(&normalized).ok_or_else(|| UnknownMovement(s.to_string()))
    }
}

impl Serialize for MovementType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MovementRepr {
    Id(u8),
    Name(String),
}

impl<'de> Deserialize<'de> for MovementType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match MovementRepr::deserialize(deserializer)? {
            MovementRepr::Id(id) => Self::from_id(id)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown movement id {id}"))),
            MovementRepr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ─── Segments ──────────────────────────────────────────────────────────────

/// One step of a synchronized speech/movement sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Segment {
    Speech {
        text: String,
    },
    Movement {
        #[serde(rename = "type")]
        movement: MovementType,
        duration: f32,
    },
}

impl Segment {
    /// Speech segment, `None` when the text is blank.
    pub fn speech(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Segment::Speech {
            text: trimmed.to_string(),
        })
    }

    /// Movement segment, `None` when the duration is negative or not finite.
    pub fn movement(movement: MovementType, duration: f32) -> Option<Self> {
        if !duration.is_finite() || duration < 0.0 {
            return None;
        }
        Some(Segment::Movement { movement, duration })
    }

    pub fn is_speech(&self) -> bool {
        matches!(self, Segment::Speech { .. })
    }

    pub fn is_movement(&self) -> bool {
        matches!(self, Segment::Movement { .. })
    }
}

/// One entry of a movement-only batch: perform `movement`, then wait `duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementRequest {
    #[serde(rename = "type")]
    pub movement: MovementType,
    #[serde(default = "default_batch_duration")]
    pub duration: f32,
}

fn default_batch_duration() -> f32 {
    1.0
}

impl MovementRequest {
    pub fn new(movement: MovementType, duration: f32) -> Self {
        Self { movement, duration }
    }

    /// Wait after the gesture. Negative and non-finite values count as zero,
    /// anything longer than [`MAX_BATCH_PAUSE`] is capped.
    pub fn pause(&self) -> Duration {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f32(self.duration)
            .map_or(MAX_BATCH_PAUSE, |d| d.min(MAX_BATCH_PAUSE))
    }
}

// ─── Macros ────────────────────────────────────────────────────────────────

/// Named movement batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Macro {
    Happy,
    Greeting,
}

impl Macro {
    pub fn batch(self) -> Vec<MovementRequest> {
        use MovementType::*;
        let moves: &[MovementType] = match self {
            Macro::Happy => &[TiltRight, TiltLeft, TiltRight, TiltLeft, TiltRight, TiltLeft],
            Macro::Greeting => &[RotateRight, RotateLeft, TiltFront],
        };
        moves.iter().map(|&m| MovementRequest::new(m, 1.0)).collect()
    }
}

impl FromStr for Macro {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "happy" => Ok(Macro::Happy),
            "greeting" | "greet" => Ok(Macro::Greeting),
            other => Err(format!("unknown macro: {other}")),
        }
    }
}

// ─── Link state ────────────────────────────────────────────────────────────

/// Serial link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Degraded,
}

/// Events that move the link between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The port opened.
    Opened,
    /// Opening the port failed.
    OpenFailed,
    /// A write or read on an open port failed.
    Fault,
    /// A command completed end to end.
    Delivered,
    /// The link was shut down on request.
    Closed,
}

impl ConnectionState {
    /// Apply one event.
    ///
    /// A degraded link stays degraded after a successful reopen and only
    /// recovers once a command is delivered.
    pub fn on(self, event: LinkEvent) -> Self {
        match (self, event) {
            (_, LinkEvent::Closed) => ConnectionState::Disconnected,
            (_, LinkEvent::Delivered) => ConnectionState::Connected,
            (_, LinkEvent::OpenFailed | LinkEvent::Fault) => ConnectionState::Degraded,
            (ConnectionState::Degraded, LinkEvent::Opened) => ConnectionState::Degraded,
            (_, LinkEvent::Opened) => ConnectionState::Connected,
        }
    }
}

// ─── Sequence runs ─────────────────────────────────────────────────────────

/// Lifecycle of one sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub state: RunState,
    /// Segments taken from the list before the run stopped.
    pub dispatched: usize,
    /// Calls made to the speech player.
    pub utterances: usize,
    /// Gestures started.
    pub gestures: usize,
    pub gesture_failures: usize,
    pub speech_failures: usize,
}

impl RunReport {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            dispatched: 0,
            utterances: 0,
            gestures: 0,
            gesture_failures: 0,
            speech_failures: 0,
        }
    }
}

/// Status snapshot served by the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwlStatus {
    pub link: ConnectionState,
    pub port: String,
    pub active_runs: usize,
    pub motion_enabled: bool,
    /// An utterance is playing.
    pub speaking: bool,
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Per-operation port timeout.
    pub timeout: Duration,
    /// Wait after each write before the next frame may go out.
    pub settle: Duration,
    /// Hard bound on one command, queueing included.
    pub deadline: Duration,
    /// Reopen attempts made before a command gives up.
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    /// The controller resets when the port opens; nothing is written until this passes.
    pub open_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 57_600,
            timeout: Duration::from_secs(1),
            settle: Duration::from_millis(100),
            deadline: Duration::from_secs(2),
            reconnect_attempts: 2,
            reconnect_backoff: Duration::from_millis(250),
            open_grace: Duration::from_secs(2),
        }
    }
}

/// Gesture timing.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Time the head holds a gesture before returning to neutral.
    pub dwell: Duration,
    /// Upper bound for per-segment dwell overrides.
    pub max_dwell: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_secs(1),
            max_dwell: Duration::from_secs(5),
        }
    }
}

/// Remote TTS server the owl speaks through.
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub tts_url: String,
    pub poll_interval: Duration,
    /// Give up waiting for playback to finish after this long.
    pub max_playback: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            tts_url: "http://localhost:2003".into(),
            poll_interval: Duration::from_millis(150),
            max_playback: Duration::from_secs(120),
        }
    }
}

/// OpenAI-compatible chat completion endpoint used to annotate text.
#[derive(Debug, Clone)]
pub struct AnnotatorConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            timeout: Duration::from_secs(20),
        }
    }
}
