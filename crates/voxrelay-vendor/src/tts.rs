use crate::config::{SynthesisConfig, VoiceParams};
use crate::error::VoiceError;
use crate::pool::{ConnectionPool, ConnectionSender, PooledConnection};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::OptionFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use voxrelay_types::{ChunkStatus, SynthesisChunk};

/// Segment terminators. Text is sent to the vendor one clause at a time.
const SEGMENT_TERMINATORS: &[char] = &['，', '。', '！', '？', '；'];

/// Punctuation kept by [`sanitize_text`] in addition to letters and digits.
const KEPT_PUNCTUATION: &[char] = &[
    '，', '。', '！', '？', '；', '：', '、', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}', '（',
    '）',
];

/// Longest clause buffered before it is flushed without a terminator.
const MAX_SEGMENT_CHARS: usize = 120;

/// How long to wait for the next vendor response once all text is sent.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Strips characters the synthesis vendor cannot voice.
///
/// Keeps CJK ideographs, ASCII letters and digits, common Chinese
/// punctuation, and whitespace (collapsed to single spaces, trimmed).
pub fn sanitize_text(text: &str) -> String {
    let kept: String = text
        .chars()
        .filter(|c| {
            ('\u{4e00}'..='\u{9fa5}').contains(c)
                || c.is_ascii_alphanumeric()
                || KEPT_PUNCTUATION.contains(c)
                || c.is_whitespace()
        })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accumulates reply tokens into clauses ready for synthesis.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buf: String,
}

impl SentenceSegmenter {
    /// Adds a token and returns every clause it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let mut ready = Vec::new();
        for c in token.chars() {
            self.buf.push(c);
            if SEGMENT_TERMINATORS.contains(&c) || self.buf.chars().count() >= MAX_SEGMENT_CHARS {
                if let Some(segment) = self.take() {
                    ready.push(segment);
                }
            }
        }
        ready
    }

    /// Flushes whatever is left.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let segment = sanitize_text(&std::mem::take(&mut self.buf));
        (!segment.is_empty()).then_some(segment)
    }
}

/// Result of decoding one synthesis response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub chunk: Option<SynthesisChunk>,
    /// The vendor marked the stream as complete.
    pub finished: bool,
}

#[derive(Debug, Deserialize)]
struct ResponseFrame {
    header: ResponseHeader,
    #[serde(default)]
    payload: Option<ResponsePayload>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: String,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    audio: Option<ResponseAudio>,
}

#[derive(Debug, Deserialize)]
struct ResponseAudio {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    status: Option<i64>,
}

/// Builds synthesis requests and decodes synthesis responses.
#[derive(Debug, Clone)]
pub struct SynthesisCodec {
    app_id: String,
    voice: VoiceParams,
}

impl SynthesisCodec {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            voice: config.voice.clone(),
        }
    }

    /// One request frame. `text` is omitted on the end frame.
    pub fn request(&self, status: ChunkStatus, seq: u64, text: Option<&str>) -> String {
        let mut text_payload = json!({
            "encoding": "utf8",
            "compress": "raw",
            "format": "json",
            "status": status.code(),
            "seq": seq,
        });
        if let Some(text) = text {
            text_payload["text"] = Value::String(STANDARD.encode(text.as_bytes()));
        }

        json!({
            "header": {
                "app_id": self.app_id,
                "status": status.code(),
            },
            "parameter": {
                "tts": {
                    "vcn": self.voice.vcn,
                    "speed": self.voice.speed,
                    "volume": self.voice.volume,
                    "pitch": self.voice.pitch,
                    "bgs": 0,
                    "reg": 0,
                    "rdn": 0,
                    "rhy": 0,
                    "audio": {
                        "encoding": self.voice.encoding,
                        "sample_rate": self.voice.sample_rate,
                        "channels": 1,
                        "bit_depth": 16,
                        "frame_size": 0,
                    },
                },
            },
            "payload": { "text": text_payload },
        })
        .to_string()
    }

    /// Decodes one response frame.
    ///
    /// # Errors
    ///
    /// `VendorProtocol` when the header carries a non-zero code, `Malformed`
    /// when the frame or its audio cannot be decoded.
    pub fn decode(&self, raw: &str) -> Result<DecodedResponse, VoiceError> {
        let frame: ResponseFrame = serde_json::from_str(raw)
            .map_err(|e| VoiceError::Malformed(format!("synthesis response: {}", e)))?;

        if frame.header.code != 0 {
            tracing::warn!(
                code = frame.header.code,
                sid = %frame.header.sid,
                "synthesis vendor returned an error"
            );
            return Err(VoiceError::VendorProtocol {
                code: frame.header.code,
                message: frame.header.message,
            });
        }

        let finished = frame.header.status == ChunkStatus::End.code() as i64;
        let chunk = match frame.payload.and_then(|p| p.audio) {
            Some(ResponseAudio {
                audio: Some(encoded),
                seq,
                status,
            }) => {
                let payload = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| VoiceError::Malformed(format!("synthesis audio: {}", e)))?;
                let status = if finished {
                    ChunkStatus::End
                } else {
                    ChunkStatus::from_code(status.unwrap_or(frame.header.status))
                };
                Some(SynthesisChunk {
                    payload,
                    seq,
                    status,
                })
            }
            _ => None,
        };

        let finished = finished || chunk.as_ref().is_some_and(SynthesisChunk::is_end);
        Ok(DecodedResponse { chunk, finished })
    }
}

/// Turns a stream of reply tokens into a stream of audio chunks.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        session_id: &str,
        tokens: BoxStream<'static, String>,
    ) -> Result<BoxStream<'static, Result<SynthesisChunk, VoiceError>>, VoiceError>;
}

/// [`Synthesizer`] backed by the pooled synthesis vendor.
#[derive(Debug, Clone)]
pub struct VendorSynthesizer {
    pool: ConnectionPool,
    codec: SynthesisCodec,
}

impl VendorSynthesizer {
    pub fn new(pool: ConnectionPool, codec: SynthesisCodec) -> Self {
        Self { pool, codec }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Sends clauses as they complete, then the end frame.
///
/// Returns whether any text reached the vendor.
async fn feed_text(
    session_id: String,
    mut tokens: BoxStream<'static, String>,
    sender: ConnectionSender,
    codec: SynthesisCodec,
) -> Result<bool, VoiceError> {
    let mut segmenter = SentenceSegmenter::default();
    let mut seq = 0u64;

    while let Some(token) = tokens.next().await {
        for segment in segmenter.push(&token) {
            let status = if seq == 0 {
                ChunkStatus::Start
            } else {
                ChunkStatus::Middle
            };
            sender.send_text(codec.request(status, seq, Some(&segment))).await?;
            seq += 1;
        }
    }
    if let Some(segment) = segmenter.finish() {
        let status = if seq == 0 {
            ChunkStatus::Start
        } else {
            ChunkStatus::Middle
        };
        sender.send_text(codec.request(status, seq, Some(&segment))).await?;
        seq += 1;
    }

    if seq == 0 {
        tracing::debug!(session_id = %session_id, "no speakable text in reply");
        return Ok(false);
    }
    sender.send_text(codec.request(ChunkStatus::End, seq, None)).await?;
    tracing::debug!(session_id = %session_id, segments = seq, "synthesis text sent");
    Ok(true)
}

struct SynthesisStream {
    session_id: String,
    pool: ConnectionPool,
    codec: SynthesisCodec,
    conn: Option<PooledConnection>,
    inbound: mpsc::UnboundedReceiver<String>,
    feeder: Option<JoinHandle<Result<bool, VoiceError>>>,
    done: bool,
}

impl SynthesisStream {
    fn complete(&mut self) {
        self.done = true;
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    fn fail(&mut self, err: VoiceError) -> VoiceError {
        tracing::warn!(session_id = %self.session_id, "synthesis stream failed: {}", err);
        self.done = true;
        // Dropping the connection closes it; it never returns to the pool.
        self.conn.take();
        err
    }

    async fn next_chunk(&mut self) -> Option<Result<SynthesisChunk, VoiceError>> {
        loop {
            if self.done {
                return None;
            }

            let feeding = self.feeder.is_some();
            tokio::select! {
                message = self.inbound.recv() => match message {
                    Some(raw) => match self.codec.decode(&raw) {
                        Ok(decoded) => {
                            if decoded.finished {
                                self.complete();
                            }
                            if let Some(chunk) = decoded.chunk {
                                return Some(Ok(chunk));
                            }
                        }
                        Err(VoiceError::Malformed(reason)) => {
                            tracing::warn!(session_id = %self.session_id, "ignoring malformed synthesis response: {}", reason);
                        }
                        Err(e) => return Some(Err(self.fail(e))),
                    },
                    None => {
                        return Some(Err(self.fail(VoiceError::Transport(
                            "synthesis connection closed mid-stream".to_string(),
                        ))));
                    }
                },
                Some(joined) = OptionFuture::from(self.feeder.as_mut()), if feeding => {
                    self.feeder = None;
                    match joined {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => {
                            self.complete();
                            return None;
                        }
                        Ok(Err(e)) => return Some(Err(self.fail(e))),
                        Err(e) => {
                            return Some(Err(self.fail(VoiceError::Transport(format!(
                                "synthesis feeder stopped: {}",
                                e
                            )))));
                        }
                    }
                }
                _ = tokio::time::sleep(RESPONSE_TIMEOUT), if !feeding => {
                    return Some(Err(self.fail(VoiceError::Transport(format!(
                        "no synthesis response within {}s",
                        RESPONSE_TIMEOUT.as_secs()
                    )))));
                }
            }
        }
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

#[async_trait]
impl Synthesizer for VendorSynthesizer {
    async fn synthesize(
        &self,
        session_id: &str,
        tokens: BoxStream<'static, String>,
    ) -> Result<BoxStream<'static, Result<SynthesisChunk, VoiceError>>, VoiceError> {
        let conn = self.pool.acquire().await?;
        let inbound = conn.subscribe();
        let sender = conn.sender()?;
        tracing::debug!(session_id = %session_id, conn_id = conn.id(), "synthesis started");

        let feeder = tokio::spawn(feed_text(
            session_id.to_string(),
            tokens,
            sender,
            self.codec.clone(),
        ));

        let state = SynthesisStream {
            session_id: session_id.to_string(),
            pool: self.pool.clone(),
            codec: self.codec.clone(),
            conn: Some(conn),
            inbound,
            feeder: Some(feeder),
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            let item = state.next_chunk().await?;
            Some((item, state))
        })
        .boxed())
    }
}
