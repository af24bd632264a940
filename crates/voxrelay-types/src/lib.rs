//! Shared types and constants for the voxrelay workspace.
//!
//! This crate holds the data model that crosses crate boundaries: transcript
//! and synthesis events produced by the vendor layer, the per-session state
//! machine states, and the outbound event union routed to clients.
//!
//! Nothing in here performs I/O. Keeping it dependency-light lets both the
//! vendor crate and the server crate share it without cycles.

pub mod audio;

use serde::{Deserialize, Serialize};

pub use audio::{AudioFrame, FRAME_BYTES, FRAME_INTERVAL, SAMPLE_RATE_HZ};

/// WebSocket close code for a normal, client-requested shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code used when the server tears a session down on failure.
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Whether a transcript is an interim hypothesis or a settled utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptKind {
    /// Interim result; later messages may revise it.
    Partial,
    /// Settled result for one utterance.
    Final,
}

impl TranscriptKind {
    /// Returns the wire label for this kind.
    pub fn label(self) -> &'static str {
        match self {
            Self::Partial => "PARTIAL",
            Self::Final => "FINAL",
        }
    }
}

/// A normalized recognition result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }
}

/// Position of a chunk within one synthesis stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Start,
    Middle,
    End,
}

impl ChunkStatus {
    /// Maps the vendor's numeric status code (`0`, `1`, `2`).
    ///
    /// Unknown codes are treated as `Middle` so that a stream is only ever
    /// terminated by an explicit end marker.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Start,
            2 => Self::End,
            _ => Self::Middle,
        }
    }

    /// Returns the numeric code for this status.
    pub fn code(self) -> u8 {
        match self {
            Self::Start => 0,
            Self::Middle => 1,
            Self::End => 2,
        }
    }
}

/// One piece of synthesized audio.
///
/// `seq` is assigned by the synthesis vendor and is forwarded untouched;
/// the relay never renumbers or reorders chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisChunk {
    pub payload: Vec<u8>,
    pub seq: u64,
    pub status: ChunkStatus,
}

impl SynthesisChunk {
    pub fn is_end(&self) -> bool {
        self.status == ChunkStatus::End
    }
}

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Connected, no recognition connection held.
    Init,
    /// Recognition connection held and started.
    Active,
    /// Shutdown requested; resources are being released.
    Ending,
    /// All resources released. Terminal.
    Closed,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Active => "ACTIVE",
            Self::Ending => "ENDING",
            Self::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ending | Self::Closed)
    }
}

/// Transport-level control instructions carried on the outbound route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Close the client channel with the given WebSocket close code.
    Close { code: u16, reason: String },
}

/// Everything the relay sends back to a client, in one tagged union.
///
/// Ordering is preserved within a variant, never across variants. Clients
/// discriminate by tag and reassemble audio by `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Transcript(TranscriptEvent),
    ReplyToken(String),
    AudioChunk { seq: u64, payload: Vec<u8> },
    Error(String),
    Control(ControlSignal),
}

impl OutboundEvent {
    /// Builds a close instruction.
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Control(ControlSignal::Close {
            code,
            reason: reason.into(),
        })
    }

    /// Short tag used in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Transcript(event) => event.kind.label(),
            Self::ReplyToken(_) => "REPLY",
            Self::AudioChunk { .. } => "AUDIO",
            Self::Error(_) => "ERROR",
            Self::Control(_) => "CONTROL",
        }
    }
}
