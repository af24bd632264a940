//! Vendor integrations for the voxrelay speech relay.
//!
//! Two external vendors sit behind this crate: a streaming speech-recognition
//! service and a streaming speech-synthesis service. Both speak JSON over
//! long-lived WebSockets authenticated by signed URLs, so both are reached
//! through the same [`ConnectionPool`]; only the signer and message codec
//! differ.
//!
//! - [`signing`]: per-vendor signed connection URLs.
//! - [`transport`]: the [`Dialer`] seam and its `tokio-tungstenite` implementation.
//! - [`pool`]: bounded, exclusive-checkout connection pool.
//! - [`frames`]: fixed-cadence audio framing for the recognition uplink.
//! - [`asr`]: recognition control messages and the transcript parser.
//! - [`tts`]: synthesis request/response codec and the pooled synthesizer.

pub mod asr;
pub mod config;
pub mod error;
pub mod frames;
pub mod pool;
pub mod signing;
pub mod transport;
pub mod tts;

pub use asr::TranscriptParser;
pub use config::{PoolSettings, RecognitionConfig, SynthesisConfig, VoiceParams};
pub use error::VoiceError;
pub use frames::{split_frames, FrameScheduler};
pub use pool::{ConnectionPool, ConnectionSender, ConnectionState, PoolStats, PooledConnection};
pub use signing::{RecognitionSigner, SynthesisSigner, UrlSigner};
pub use transport::{Dialer, RemoteEnd, VendorChannel, VendorMessage, WsDialer};
pub use tts::{SynthesisCodec, Synthesizer, VendorSynthesizer};
