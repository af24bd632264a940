//! Recognition vendor messages.
//!
//! Outbound control messages mark the start and end of a recognition cycle;
//! audio itself travels as binary frames. Inbound messages are either
//! `action` notices (which carry the vendor-side session id) or `result`
//! messages with the nested sentence / segment / word-group / word layout
//! decoded by [`TranscriptParser`].

use crate::config::RecognitionConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use voxrelay_types::TranscriptEvent;

const RESULT_MESSAGE: &str = "result";
const ACTION_MESSAGE: &str = "action";

/// Discriminator value marking an interim result.
const INTERIM_TYPE: i64 = 1;

/// Message that opens a recognition cycle.
pub fn start_message(config: &RecognitionConfig) -> String {
    json!({
        "start": true,
        "audio_encode": config.audio_encode,
        "lang": config.lang,
        "samplerate": config.sample_rate.to_string(),
    })
    .to_string()
}

/// Message that closes a recognition cycle. The vendor session id is echoed
/// back when it is known.
pub fn end_message(vendor_session_id: Option<&str>) -> String {
    let mut message = json!({ "end": true });
    if let Some(id) = vendor_session_id.filter(|id| !id.is_empty()) {
        message["sessionId"] = Value::String(id.to_string());
    }
    message.to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    cn: ResultCn,
}

#[derive(Debug, Deserialize)]
struct ResultCn {
    st: Sentence,
}

#[derive(Debug, Deserialize)]
struct Sentence {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    rt: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    ws: Vec<WordGroup>,
}

#[derive(Debug, Deserialize)]
struct WordGroup {
    #[serde(default)]
    cw: Vec<Word>,
}

#[derive(Debug, Deserialize)]
struct Word {
    #[serde(default)]
    w: String,
}

/// The discriminator arrives as either a number or a numeric string.
fn is_interim(kind: Option<&Value>) -> bool {
    match kind {
        Some(Value::Number(n)) => n.as_i64() == Some(INTERIM_TYPE),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok() == Some(INTERIM_TYPE),
        _ => false,
    }
}

/// Decodes recognition vendor messages into [`TranscriptEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptParser;

impl TranscriptParser {
    /// Parses one vendor message.
    ///
    /// Returns `None` for non-result messages, for results with no text, and
    /// for malformed input (which is logged).
    pub fn parse(&self, raw: &str) -> Option<TranscriptEvent> {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("ignoring malformed recognition message: {}", e);
                return None;
            }
        };

        if envelope.msg_type.as_deref() != Some(RESULT_MESSAGE) {
            return None;
        }

        let data = match envelope.data.map(serde_json::from_value::<ResultData>) {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                tracing::warn!("ignoring recognition result with unexpected layout: {}", e);
                return None;
            }
            None => {
                tracing::warn!("ignoring recognition result without data");
                return None;
            }
        };

        let sentence = data.cn.st;
        let text: String = sentence
            .rt
            .iter()
            .flat_map(|segment| segment.ws.iter())
            .flat_map(|group| group.cw.iter())
            .map(|word| word.w.as_str())
            .collect();
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if is_interim(sentence.kind.as_ref()) {
            Some(TranscriptEvent::partial(text))
        } else {
            Some(TranscriptEvent::final_result(text))
        }
    }

    /// Extracts the vendor session id from an `action` message.
    pub fn parse_action_session_id(&self, raw: &str) -> Option<String> {
        let envelope: Envelope = serde_json::from_str(raw).ok()?;
        if envelope.msg_type.as_deref() != Some(ACTION_MESSAGE) {
            return None;
        }
        envelope
            .data?
            .get("sessionId")?
            .as_str()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}
