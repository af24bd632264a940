//! Client WebSocket endpoint.
//!
//! Binary frames carry PCM audio in; text frames carry `START`, `END` and
//! `{"type":"segment_end"}`. Everything sent back is an [`OutboundEvent`]
//! encoded by [`encode_event`].

use crate::config::AudioFraming;
use crate::registry::SessionHandle;
use crate::session::{ClientControl, SessionCoordinator, SessionInput};
use crate::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use voxrelay_types::{ControlSignal, OutboundEvent};

/// Depth of the client-to-coordinator input queue.
const INPUT_QUEUE: usize = 256;

/// Query parameters accepted on `/ws/audio`.
#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    #[serde(rename = "appId")]
    pub app_id: Option<String>,
    pub audio: Option<AudioFraming>,
}

/// Maps a client text frame to a control message.
///
/// Unknown text yields `None`.
pub fn parse_client_text(text: &str) -> Option<ClientControl> {
    match text {
        "START" => Some(ClientControl::Start),
        "END" => Some(ClientControl::End),
        other => {
            let value: serde_json::Value = serde_json::from_str(other).ok()?;
            (value.get("type")?.as_str()? == "segment_end").then_some(ClientControl::SegmentEnd)
        }
    }
}

/// Encodes one outbound event as a WebSocket frame.
pub fn encode_event(event: OutboundEvent, framing: AudioFraming) -> AxumMessage {
    match event {
        OutboundEvent::Transcript(t) => {
            AxumMessage::Text(format!("{}:{}", t.kind.label(), t.text).into())
        }
        OutboundEvent::ReplyToken(token) => AxumMessage::Text(format!("REPLY:{}", token).into()),
        OutboundEvent::AudioChunk { seq, payload } => match framing {
            AudioFraming::Tagged => {
                AxumMessage::Text(format!("AUDIO:{}:{}", seq, STANDARD.encode(payload)).into())
            }
            AudioFraming::Binary => AxumMessage::Binary(payload.into()),
        },
        OutboundEvent::Error(message) => AxumMessage::Text(format!("ERROR:{}", message).into()),
        OutboundEvent::Control(ControlSignal::Close { code, reason }) => {
            AxumMessage::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }))
        }
    }
}

/// Upgrades `/ws/audio` to a relay session.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let framing = params.audio.unwrap_or(state.session.audio_framing);
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.app_id, framing))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    app_id: Option<String>,
    framing: AudioFraming,
) {
    let session_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow client backs up its own producers only.
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<OutboundEvent>(state.session.outbound_queue.max(1));
    let (inputs_tx, inputs_rx) = mpsc::channel::<SessionInput>(INPUT_QUEUE);

    let (coordinator, state_rx) =
        SessionCoordinator::new(session_id.clone(), app_id.clone(), state.services.clone());
    state
        .services
        .registry
        .insert(
            session_id.clone(),
            SessionHandle::new(outbound_tx, state_rx, app_id),
        )
        .await;
    tracing::info!(session_id = %session_id, ?framing, "client connected");

    let writer_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let closing = matches!(event, OutboundEvent::Control(_));
            if let Err(e) = sender.send(encode_event(event, framing)).await {
                tracing::debug!(session_id = %writer_session, "client write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let session_task = tokio::spawn(coordinator.run(inputs_rx));

    while let Some(frame) = receiver.next().await {
        let input = match frame {
            Ok(AxumMessage::Binary(bytes)) => SessionInput::Audio(bytes.to_vec()),
            Ok(AxumMessage::Text(text)) => match parse_client_text(text.as_str()) {
                Some(control) => SessionInput::Control(control),
                None => {
                    tracing::debug!(session_id = %session_id, "ignoring unrecognized text frame");
                    continue;
                }
            },
            Ok(AxumMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                let _ = inputs_tx.send(SessionInput::TransportError(e.to_string())).await;
                break;
            }
        };
        if inputs_tx.send(input).await.is_err() {
            break;
        }
    }

    let _ = inputs_tx.send(SessionInput::Disconnect).await;
    drop(inputs_tx);
    match session_task.await {
        Ok(final_state) => {
            tracing::info!(session_id = %session_id, state = final_state.label(), "client disconnected")
        }
        Err(e) => tracing::error!(session_id = %session_id, "session task failed: {}", e),
    }

    state.services.registry.remove(&session_id).await;
    // The registry held the last outbound sender; the writer drains and exits.
    if let Err(e) = send_task.await {
        tracing::debug!(session_id = %session_id, "writer task ended abnormally: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxrelay_types::TranscriptEvent;

    fn text_of(message: AxumMessage) -> String {
        match message {
            AxumMessage::Text(text) => text.to_string(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn parses_control_frames() {
        assert_eq!(parse_client_text("START"), Some(ClientControl::Start));
        assert_eq!(parse_client_text("END"), Some(ClientControl::End));
        assert_eq!(
            parse_client_text(r#"{"type":"segment_end"}"#),
            Some(ClientControl::SegmentEnd)
        );
        assert_eq!(parse_client_text("start"), None);
        assert_eq!(parse_client_text(r#"{"type":"other"}"#), None);
        assert_eq!(parse_client_text("hello"), None);
    }

    #[test]
    fn encodes_text_events_with_tags() {
        assert_eq!(
            text_of(encode_event(
                OutboundEvent::Transcript(TranscriptEvent::partial("你")),
                AudioFraming::Tagged
            )),
            "PARTIAL:你"
        );
        assert_eq!(
            text_of(encode_event(
                OutboundEvent::Transcript(TranscriptEvent::final_result("你好")),
                AudioFraming::Tagged
            )),
            "FINAL:你好"
        );
        assert_eq!(
            text_of(encode_event(OutboundEvent::ReplyToken("嗨".into()), AudioFraming::Tagged)),
            "REPLY:嗨"
        );
        assert_eq!(
            text_of(encode_event(OutboundEvent::Error("boom".into()), AudioFraming::Tagged)),
            "ERROR:boom"
        );
    }

    #[test]
    fn encodes_audio_per_framing() {
        let chunk = || OutboundEvent::AudioChunk {
            seq: 7,
            payload: vec![1, 2, 3],
        };
        assert_eq!(text_of(encode_event(chunk(), AudioFraming::Tagged)), "AUDIO:7:AQID");
        match encode_event(chunk(), AudioFraming::Binary) {
            AxumMessage::Binary(bytes) => assert_eq!(&bytes[..], &[1, 2, 3]),
            other => panic!("Expected binary frame, got {:?}", other),
        }
    }

    #[test]
    fn encodes_close_control() {
        match encode_event(OutboundEvent::close(1000, "session ended"), AudioFraming::Tagged) {
            AxumMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "session ended");
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
