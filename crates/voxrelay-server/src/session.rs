//! Per-session control loop.
//!
//! One [`SessionCoordinator`] task owns everything a client session borrows:
//! the recognition connection, its frame scheduler and the reply/synthesis
//! fan-out. Client input and vendor messages are both consumed here, one at
//! a time, so session state never needs a lock.

use crate::capture::AudioCapture;
use crate::registry::{RouteError, SessionRegistry};
use crate::reply::{ReplyGenerator, ReplyRequest};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use voxrelay_types::{
    OutboundEvent, SessionState, CLOSE_NORMAL, CLOSE_SERVER_ERROR, FRAME_BYTES,
    FRAME_INTERVAL,
};
use voxrelay_vendor::asr::{end_message, start_message};
use voxrelay_vendor::{
    ConnectionPool, FrameScheduler, PooledConnection, RecognitionConfig, Synthesizer,
    TranscriptParser, VoiceError,
};

/// Control messages a client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControl {
    /// Start, or restart, a recognition cycle.
    Start,
    /// End the session.
    End,
    /// The client believes the utterance is over. Logged only.
    SegmentEnd,
}

/// Everything the client side feeds into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Audio(Vec<u8>),
    Control(ClientControl),
    Disconnect,
    TransportError(String),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub recognition: RecognitionConfig,
    pub frame_bytes: usize,
    pub frame_interval: Duration,
    /// Reply tokens buffered per fan-out before a slow consumer lags.
    pub token_buffer: usize,
}

impl SessionSettings {
    pub fn new(recognition: RecognitionConfig) -> Self {
        Self {
            recognition,
            frame_bytes: FRAME_BYTES,
            frame_interval: FRAME_INTERVAL,
            token_buffer: 4096,
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionServices {
    pub registry: SessionRegistry,
    pub recognition: ConnectionPool,
    pub reply: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub capture: Option<AudioCapture>,
    pub settings: SessionSettings,
}

/// Outbound route for one session, shared with its fan-out tasks.
///
/// A failed delivery means the client writer is gone; it is reported once
/// on `faults` so the coordinator can end the session.
#[derive(Clone)]
struct SessionRoute {
    session_id: String,
    registry: SessionRegistry,
    faults: mpsc::UnboundedSender<RouteError>,
}

impl SessionRoute {
    async fn send(&self, event: OutboundEvent) -> bool {
        match self.registry.route(&self.session_id, event).await {
            Ok(()) => true,
            Err(e) => {
                let _ = self.faults.send(e);
                false
            }
        }
    }
}

/// One recognition cycle: start message sent, audio flowing, end pending.
struct RecognitionCycle {
    conn: PooledConnection,
    inbound: mpsc::UnboundedReceiver<String>,
    scheduler: FrameScheduler,
    vendor_session_id: Option<String>,
    last_audio: Option<Instant>,
    /// End message already sent; results are still read until the vendor
    /// closes the connection.
    ended: bool,
}

/// Reply and synthesis tasks started by one FINAL transcript.
struct Fanout {
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Fanout {
    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.abort();
    }
}

pub struct SessionCoordinator {
    session_id: String,
    app_id: Option<String>,
    services: SessionServices,
    route: SessionRoute,
    faults: mpsc::UnboundedReceiver<RouteError>,
    state: watch::Sender<SessionState>,
    parser: TranscriptParser,
    cycle: Option<RecognitionCycle>,
    fanout: Option<Fanout>,
    generation: u64,
    route_failed: bool,
    /// Close event held back while queued audio is still being paced out
    /// after END.
    closing: Option<OutboundEvent>,
}

/// What the current recognition cycle produced next.
enum CycleEvent {
    Message(String),
    Closed,
    Paced,
}

impl SessionCoordinator {
    /// Creates a coordinator in INIT along with a receiver for its state.
    pub fn new(
        session_id: impl Into<String>,
        app_id: Option<String>,
        services: SessionServices,
    ) -> (Self, watch::Receiver<SessionState>) {
        let session_id = session_id.into();
        let (state, state_rx) = watch::channel(SessionState::Init);
        let (faults_tx, faults) = mpsc::unbounded_channel();
        let route = SessionRoute {
            session_id: session_id.clone(),
            registry: services.registry.clone(),
            faults: faults_tx,
        };
        let coordinator = Self {
            session_id,
            app_id,
            services,
            route,
            faults,
            state,
            parser: TranscriptParser,
            cycle: None,
            fanout: None,
            generation: 0,
            route_failed: false,
            closing: None,
        };
        (coordinator, state_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Drives the session until the client side goes away, returning the
    /// final state.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<SessionInput>) -> SessionState {
        tracing::info!(session_id = %self.session_id, app_id = ?self.app_id, "session started");
        self.activate().await;

        loop {
            let idle_at = self.idle_deadline();
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Audio(buf)) => self.on_audio(buf).await,
                    Some(SessionInput::Control(control)) => self.on_control(control).await,
                    Some(SessionInput::TransportError(reason)) => {
                        tracing::warn!(session_id = %self.session_id, "client transport error: {}", reason);
                        self.shutdown(Some(OutboundEvent::close(CLOSE_SERVER_ERROR, "transport error")))
                            .await;
                    }
                    Some(SessionInput::Disconnect) | None => {
                        self.shutdown(None).await;
                        break;
                    }
                },
                event = next_cycle_event(&mut self.cycle, self.closing.is_some()) => match event {
                    CycleEvent::Message(raw) => self.on_vendor_message(&raw).await,
                    CycleEvent::Closed => self.on_recognition_closed().await,
                    CycleEvent::Paced => {
                        let close = self.closing.take();
                        self.shutdown(close).await;
                    }
                },
                Some(fault) = self.faults.recv() => {
                    tracing::debug!(session_id = %self.session_id, "{}", fault);
                    self.route_failed = true;
                }
                _ = tokio::time::sleep_until(idle_at.unwrap_or_else(Instant::now)), if idle_at.is_some() => {
                    self.on_idle().await;
                }
            }

            if self.route_failed && self.state() != SessionState::Closed {
                tracing::warn!(session_id = %self.session_id, "client route failed; ending session");
                self.shutdown(None).await;
            }
        }

        tracing::info!(session_id = %self.session_id, "session finished");
        self.state()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(
                session_id = %self.session_id,
                from = previous.label(),
                to = next.label(),
                "session state changed"
            );
        }
    }

    async fn emit(&mut self, event: OutboundEvent) {
        if !self.route.send(event).await {
            self.route_failed = true;
        }
    }

    async fn emit_error(&mut self, message: String) {
        self.emit(OutboundEvent::Error(message)).await;
    }

    /// INIT → ACTIVE. On failure the session stays in INIT and the client
    /// is told why.
    async fn activate(&mut self) {
        match self.open_cycle().await {
            Ok(()) => self.set_state(SessionState::Active),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "failed to start recognition: {}", e);
                self.emit_error(format!("recognition unavailable: {}", e)).await;
            }
        }
    }

    async fn open_cycle(&mut self) -> Result<(), VoiceError> {
        let settings = &self.services.settings;
        let conn = self.services.recognition.acquire().await?;
        let inbound = conn.subscribe();
        let sender = conn.sender()?;
        sender.send_text(start_message(&settings.recognition)).await?;
        let scheduler = FrameScheduler::spawn(sender, settings.frame_bytes, settings.frame_interval);

        tracing::debug!(session_id = %self.session_id, conn_id = conn.id(), "recognition cycle opened");
        self.cycle = Some(RecognitionCycle {
            conn,
            inbound,
            scheduler,
            vendor_session_id: None,
            last_audio: None,
            ended: false,
        });
        Ok(())
    }

    /// Ends the current cycle and returns its connection to the pool
    /// without waiting for the vendor to acknowledge. Frames still queued
    /// are dropped.
    async fn close_cycle(&mut self) {
        let Some(cycle) = self.cycle.take() else {
            return;
        };
        cycle.scheduler.cancel();
        if !cycle.ended && cycle.conn.is_open() {
            let message = end_message(cycle.vendor_session_id.as_deref());
            if let Err(e) = cycle.conn.send_text(message).await {
                tracing::debug!(session_id = %self.session_id, "could not send end message: {}", e);
            }
        }
        tracing::debug!(session_id = %self.session_id, conn_id = cycle.conn.id(), "recognition cycle closed");
        self.services.recognition.release(cycle.conn);
    }

    async fn on_control(&mut self, control: ClientControl) {
        match (control, self.state()) {
            (_, SessionState::Ending | SessionState::Closed) => {
                tracing::debug!(session_id = %self.session_id, ?control, "ignoring control after session end");
            }
            (ClientControl::Start, SessionState::Init) => self.activate().await,
            (ClientControl::Start, SessionState::Active) => self.restart().await,
            (ClientControl::End, _) => self.end_session().await,
            (ClientControl::SegmentEnd, _) => {
                tracing::info!(session_id = %self.session_id, "client marked end of utterance");
            }
        }
    }

    /// START while ACTIVE. A cycle that has not carried audio yet is kept.
    async fn restart(&mut self) {
        let fresh = self
            .cycle
            .as_ref()
            .is_some_and(|cycle| !cycle.ended && cycle.last_audio.is_none());
        if fresh {
            tracing::debug!(session_id = %self.session_id, "recognition cycle already fresh");
            return;
        }
        self.close_cycle().await;
        if let Err(e) = self.open_cycle().await {
            tracing::warn!(session_id = %self.session_id, "failed to restart recognition: {}", e);
            self.set_state(SessionState::Init);
            self.emit_error(format!("recognition unavailable: {}", e)).await;
        }
    }

    async fn on_audio(&mut self, buf: Vec<u8>) {
        match self.state() {
            SessionState::Active => {}
            SessionState::Init => {
                tracing::warn!(session_id = %self.session_id, bytes = buf.len(), "dropping audio before recognition started");
                return;
            }
            SessionState::Ending | SessionState::Closed => {
                tracing::warn!(session_id = %self.session_id, bytes = buf.len(), "dropping audio after session end");
                return;
            }
        }

        let needs_cycle = self.cycle.as_ref().map_or(true, |cycle| cycle.ended);
        if needs_cycle {
            self.close_cycle().await;
            if let Err(e) = self.open_cycle().await {
                tracing::warn!(session_id = %self.session_id, "failed to reopen recognition: {}", e);
                self.set_state(SessionState::Init);
                self.emit_error(format!("recognition unavailable: {}", e)).await;
                return;
            }
        }

        if let Some(cycle) = self.cycle.as_mut() {
            cycle.last_audio = Some(Instant::now());
            if !cycle.scheduler.submit(buf) {
                tracing::warn!(session_id = %self.session_id, "frame scheduler stopped; audio dropped");
            }
        }
    }

    async fn on_vendor_message(&mut self, raw: &str) {
        tracing::trace!(session_id = %self.session_id, "recognition message: {}", raw);

        if let Some(vendor_id) = self.parser.parse_action_session_id(raw) {
            if let Some(cycle) = self.cycle.as_mut() {
                tracing::debug!(session_id = %self.session_id, vendor_session_id = %vendor_id, "recognition session acknowledged");
                cycle.vendor_session_id = Some(vendor_id);
            }
            return;
        }

        let Some(event) = self.parser.parse(raw) else {
            return;
        };
        tracing::debug!(session_id = %self.session_id, kind = event.kind.label(), text = %event.text, "transcript");
        let final_text = event.is_final().then(|| event.text.clone());
        self.emit(OutboundEvent::Transcript(event)).await;

        if let Some(text) = final_text {
            if self.state() == SessionState::Active {
                self.start_fanout(text);
            } else {
                tracing::debug!(session_id = %self.session_id, "session ending; no reply for late transcript");
            }
        }
    }

    /// The recognition connection's inbound channel closed.
    async fn on_recognition_closed(&mut self) {
        let Some(cycle) = self.cycle.take() else {
            return;
        };
        // The connection is dropped rather than released, so it is discarded.
        if self.closing.is_some() {
            tracing::debug!(session_id = %self.session_id, conn_id = cycle.conn.id(), "recognition closed while ending");
            drop(cycle);
            let close = self.closing.take();
            self.shutdown(close).await;
            return;
        }
        if cycle.ended {
            tracing::debug!(session_id = %self.session_id, conn_id = cycle.conn.id(), "vendor closed finished recognition cycle");
            return;
        }
        tracing::warn!(session_id = %self.session_id, conn_id = cycle.conn.id(), "recognition connection lost");
        drop(cycle);
        if self.state() == SessionState::Active {
            self.set_state(SessionState::Init);
        }
        self.emit_error("recognition connection lost".to_string()).await;
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.closing.is_some() {
            return None;
        }
        let timeout = self.services.settings.recognition.idle_timeout()?;
        let cycle = self.cycle.as_ref().filter(|cycle| !cycle.ended)?;
        cycle.last_audio.map(|at| at + timeout)
    }

    /// No audio for the configured idle timeout: ask the vendor to finalize
    /// the pending utterance. Results keep flowing until it closes.
    async fn on_idle(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        cycle.ended = true;
        let message = end_message(cycle.vendor_session_id.as_deref());
        tracing::info!(session_id = %self.session_id, conn_id = cycle.conn.id(), "recognition idle; ending cycle");
        if let Err(e) = cycle.conn.send_text(message).await {
            tracing::debug!(session_id = %self.session_id, "could not send end message: {}", e);
        }
    }

    /// Starts reply generation and synthesis for a FINAL transcript,
    /// superseding any fan-out still in flight.
    fn start_fanout(&mut self, text: String) {
        if let Some(mut previous) = self.fanout.take() {
            tracing::info!(session_id = %self.session_id, generation = previous.generation, "superseding previous reply");
            previous.abort();
        }
        self.generation += 1;
        let generation = self.generation;

        let capacity = self.services.settings.token_buffer.max(1);
        let (tokens_tx, _) = broadcast::channel::<String>(capacity);
        let reply_rx = tokens_tx.subscribe();
        let synthesis_rx = tokens_tx.subscribe();

        let request = ReplyRequest {
            session_id: self.session_id.clone(),
            app_id: self.app_id.clone(),
            text,
        };

        let tasks = vec![
            tokio::spawn(forward_reply_tokens(self.route.clone(), reply_rx, generation)),
            tokio::spawn(forward_synthesis(
                self.route.clone(),
                self.services.synthesizer.clone(),
                self.services.capture.clone(),
                synthesis_rx,
                generation,
            )),
            tokio::spawn(produce_reply(
                self.route.clone(),
                self.services.reply.clone(),
                request,
                tokens_tx,
                generation,
            )),
        ];
        tracing::debug!(session_id = %self.session_id, generation, "reply fan-out started");
        self.fanout = Some(Fanout { generation, tasks });
    }

    /// END from the client: ACTIVE → ENDING. Audio already queued is
    /// paced out first; the session closes once the scheduler is done.
    async fn end_session(&mut self) {
        let close = OutboundEvent::close(CLOSE_NORMAL, "session ended");
        let Some(cycle) = self.cycle.as_mut().filter(|cycle| !cycle.ended) else {
            self.shutdown(Some(close)).await;
            return;
        };
        cycle.scheduler.close();
        self.set_state(SessionState::Ending);
        self.closing = Some(close);
    }

    /// → ENDING → CLOSED. Idempotent. Cancels pacing still running from an
    /// earlier END; `close` replaces the close event END was holding.
    async fn shutdown(&mut self, close: Option<OutboundEvent>) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.closing = None;
        self.set_state(SessionState::Ending);
        self.close_cycle().await;
        if let Some(mut fanout) = self.fanout.take() {
            fanout.abort();
        }
        if let Some(capture) = &self.services.capture {
            // The write finishes in the background.
            let _ = capture.finish(&self.session_id);
        }
        if let Some(event) = close {
            if !self.route.send(event).await {
                tracing::debug!(session_id = %self.session_id, "client gone before close");
            }
        }
        self.set_state(SessionState::Closed);
    }
}

/// Next vendor message for the current cycle or, while `pacing` is set,
/// the end of queued audio. Pending when there is no cycle to watch.
async fn next_cycle_event(cycle: &mut Option<RecognitionCycle>, pacing: bool) -> CycleEvent {
    let Some(cycle) = cycle else {
        return if pacing {
            CycleEvent::Paced
        } else {
            std::future::pending().await
        };
    };
    tokio::select! {
        biased;
        message = cycle.inbound.recv() => match message {
            Some(raw) => CycleEvent::Message(raw),
            None => CycleEvent::Closed,
        },
        () = cycle.scheduler.finished(), if pacing => CycleEvent::Paced,
    }
}

/// Pulls reply tokens and broadcasts them to both consumers.
async fn produce_reply(
    route: SessionRoute,
    generator: Arc<dyn ReplyGenerator>,
    request: ReplyRequest,
    tokens: broadcast::Sender<String>,
    generation: u64,
) {
    let session_id = request.session_id.clone();
    let mut stream = match generator.generate(request).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(session_id = %session_id, generation, "reply generation failed: {}", e);
            route.send(OutboundEvent::Error(e.to_string())).await;
            return;
        }
    };

    let mut count = 0usize;
    while let Some(item) = stream.next().await {
        match item {
            Ok(token) => {
                count += 1;
                if tokens.send(token).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, generation, "reply stream failed: {}", e);
                route.send(OutboundEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    tracing::debug!(session_id = %session_id, generation, tokens = count, "reply stream finished");
}

async fn forward_reply_tokens(
    route: SessionRoute,
    mut tokens: broadcast::Receiver<String>,
    generation: u64,
) {
    loop {
        match tokens.recv().await {
            Ok(token) => {
                if !route.send(OutboundEvent::ReplyToken(token)).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %route.session_id, generation, skipped, "reply forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn forward_synthesis(
    route: SessionRoute,
    synthesizer: Arc<dyn Synthesizer>,
    capture: Option<AudioCapture>,
    tokens: broadcast::Receiver<String>,
    generation: u64,
) {
    let session_id = route.session_id.clone();
    let lag_session = session_id.clone();
    let text = stream::unfold(tokens, move |mut tokens| {
        let session_id = lag_session.clone();
        async move {
            loop {
                match tokens.recv().await {
                    Ok(token) => return Some((token, tokens)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session_id, generation, skipped, "synthesis feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    })
    .boxed();

    let mut chunks = match synthesizer.synthesize(&session_id, text).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!(session_id = %session_id, generation, "synthesis unavailable: {}", e);
            route.send(OutboundEvent::Error(format!("synthesis unavailable: {}", e))).await;
            return;
        }
    };

    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) => {
                let end = chunk.is_end();
                tracing::trace!(session_id = %session_id, seq = chunk.seq, bytes = chunk.payload.len(), "audio chunk");
                if let Some(capture) = &capture {
                    capture.append(&session_id, &chunk.payload);
                }
                let event = OutboundEvent::AudioChunk {
                    seq: chunk.seq,
                    payload: chunk.payload,
                };
                if !route.send(event).await || end {
                    break;
                }
            }
            Err(e) => {
                route.send(OutboundEvent::Error(format!("synthesis failed: {}", e))).await;
                break;
            }
        }
    }
}
