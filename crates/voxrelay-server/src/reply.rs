//! Reply generation boundary.
//!
//! A FINAL transcript becomes a [`ReplyRequest`]; the generator answers with
//! a stream of text tokens. [`HttpReplyGenerator`] reads tokens from a
//! server-sent-event endpoint.

use crate::config::ReplyConfig;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use voxrelay_vendor::VoiceError;

/// Marker event that ends a token stream.
const DONE_MARKER: &str = "[DONE]";

/// Input to a reply generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub session_id: String,
    pub app_id: Option<String>,
    #[serde(rename = "message")]
    pub text: String,
}

pub type TokenStream = BoxStream<'static, Result<String, VoiceError>>;

/// Produces reply tokens for a finished utterance.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: ReplyRequest) -> Result<TokenStream, VoiceError>;
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Only `data` fields are used. Multi-line data is joined with `\n`; one
/// event yields one token.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
    done: bool,
}

impl SseDecoder {
    /// Feeds raw body bytes and returns the tokens completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut tokens = Vec::new();
        if self.done {
            return tokens;
        }
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            self.line(&line, &mut tokens);
            if self.done {
                self.buf.clear();
                break;
            }
        }
        tokens
    }

    /// Flushes whatever is left once the body ends.
    pub fn finish(&mut self) -> Vec<String> {
        let mut tokens = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.line(line.trim_end_matches('\r'), &mut tokens);
        }
        if !self.done {
            self.dispatch(&mut tokens);
        }
        self.done = true;
        tokens
    }

    /// Whether the `[DONE]` marker or end of body has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn line(&mut self, line: &str, tokens: &mut Vec<String>) {
        if line.is_empty() {
            self.dispatch(tokens);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self, tokens: &mut Vec<String>) {
        if self.data.is_empty() {
            return;
        }
        let event = self.data.join("\n");
        self.data.clear();
        if event == DONE_MARKER {
            self.done = true;
        } else {
            tokens.push(event);
        }
    }
}

/// Reply generator backed by a streaming HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReplyGenerator {
    pub fn new(config: &ReplyConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| VoiceError::Config(format!("reply client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate(&self, request: ReplyRequest) -> Result<TokenStream, VoiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Reply(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Reply(format!(
                "reply endpoint returned {}",
                status
            )));
        }
        tracing::debug!(session_id = %request.session_id, "reply stream opened");

        let body = response.bytes_stream().boxed();
        let tokens = stream::unfold(
            (body, SseDecoder::default()),
            |(mut body, mut decoder)| async move {
                if decoder.is_done() {
                    return None;
                }
                let batch: Vec<Result<String, VoiceError>> = match body.next().await {
                    Some(Ok(bytes)) => decoder.feed(&bytes).into_iter().map(Ok).collect(),
                    Some(Err(e)) => {
                        decoder.finish();
                        vec![Err(VoiceError::Reply(format!("reply stream failed: {}", e)))]
                    }
                    None => decoder.finish().into_iter().map(Ok).collect(),
                };
                Some((stream::iter(batch), (body, decoder)))
            },
        )
        .flatten();

        Ok(tokens.boxed())
    }
}
