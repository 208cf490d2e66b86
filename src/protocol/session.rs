//! # Session Protocol State Machine
//!
//! Owns the transport handle for one conversation and maps server events onto
//! playback, transcript and context updates.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing connected yet
//! 2. **Connecting**: transport handed over, waiting for the open event
//! 3. **Open**: settings sent, audio may flow both ways
//! 4. **Closing**: `disconnect()` asked the transport to close
//! 5. **Closed**: terminal for this connection; `connect()` starts over
//!
//! ## Collaborators:
//! The transport, the playback pipeline and the context store sit behind the
//! `Transport`, `PlaybackSink` and `ContextSink` traits so the state machine
//! can be driven directly in tests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::audio::transmit::FrameSink;
use crate::error::{AppError, AppResult};
use crate::protocol::messages::{parse_frame, settings_frame, InboundMessage};
use crate::protocol::transcript::{LogEntry, MessageLog, Sender, TranscriptAccumulator};

/// WebSocket close code for a connection lost without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const NOTICE_OPEN: &str = "Connection established. You can start speaking.";
pub const NOTICE_CLOSED: &str = "Connection closed.";
pub const NOTICE_MISSING_API_KEY: &str = "Connection failed. Please set your API key in the settings.";
pub const NOTICE_ERROR: &str = "An error occurred with the connection.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Connecting or open, i.e. a transport is live.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

/// Why playback is being told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The agent finished its turn: let queued audio drain
    TurnComplete,
    /// The user barged in: drop queued audio now
    Interrupted,
}

/// Outgoing half of a duplex connection.
pub trait Transport {
    fn send_text(&mut self, text: String) -> AppResult<()>;
    fn close(&mut self) -> AppResult<()>;
}

/// Receives the agent's audio.
pub trait PlaybackSink {
    /// Queue one Base64 PCM16 frame.
    fn enqueue(&mut self, base64: &str) -> AppResult<()>;
    fn stop(&mut self, reason: StopReason);
}

/// Receives server-side context updates.
pub trait ContextSink {
    fn update(&mut self, context: Map<String, Value>);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn abnormal() -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// Values the surrounding application provides to a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Sent as the first frame once the socket opens
    pub settings: Option<Value>,
    /// Whether the user has configured a model API key. Only read to word the
    /// notice after an abnormal close.
    pub api_key_configured: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    /// Text frames accepted while open, including ones that failed to parse
    pub frames_received: u64,
    /// Frames handed to the transport (settings and audio)
    pub frames_sent: u64,
    pub audio_frames_received: u64,
    /// Malformed JSON frames plus audio frames with malformed Base64
    pub decode_errors: u64,
    /// Objects with no recognized shape and non-object JSON
    pub unknown_frames: u64,
    pub turns_completed: u64,
    /// Barge-ins reported by the server
    pub interruptions: u64,
}

pub struct SessionProtocol<T: Transport> {
    config: SessionConfig,
    state: SessionState,
    transport: Option<T>,
    close_requested: bool,
    finished: bool,
    close_info: Option<CloseInfo>,
    opened_at: Option<DateTime<Utc>>,
    transcript: TranscriptAccumulator,
    log: MessageLog,
    stats: ProtocolStats,
}

impl<T: Transport> SessionProtocol<T> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            transport: None,
            close_requested: false,
            finished: false,
            close_info: None,
            opened_at: None,
            transcript: TranscriptAccumulator::new(),
            log: MessageLog::new(),
            stats: ProtocolStats::default(),
        }
    }

    /// Take ownership of a freshly created transport and enter `Connecting`.
    ///
    /// A live previous connection is disconnected first.
    pub fn connect(&mut self, transport: T) {
        if self.state.is_live() {
            warn!(state = self.state.as_str(), "Replacing live connection");
            self.disconnect();
        }

        self.transport = Some(transport);
        self.state = SessionState::Connecting;
        self.close_requested = false;
        self.finished = false;
        self.close_info = None;
        self.opened_at = None;
        self.transcript.clear();
        debug!("Session connecting");
    }

    /// The transport reported that the socket is open.
    pub fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = self.state.as_str(), "Ignoring open event");
            return;
        }
        self.state = SessionState::Open;
        self.opened_at = Some(Utc::now());

        if let Some(frame) = self.config.settings.as_ref().map(settings_frame) {
            match self.send_frame(frame) {
                Ok(()) => debug!("Settings sent to server"),
                Err(e) => warn!(error = %e, "Failed to send settings"),
            }
        }

        self.notice(NOTICE_OPEN);
    }

    /// Handle one inbound text frame.
    pub fn on_text<P, C>(&mut self, text: &str, playback: &mut P, context: &mut C)
    where
        P: PlaybackSink + ?Sized,
        C: ContextSink + ?Sized,
    {
        if self.state != SessionState::Open {
            debug!(state = self.state.as_str(), "Dropping frame received while not open");
            return;
        }
        self.stats.frames_received += 1;

        let messages = match parse_frame(text) {
            Ok(messages) => messages,
            Err(AppError::ProtocolViolation(reason)) => {
                self.stats.unknown_frames += 1;
                debug!(reason = %reason, "Ignoring frame that is not an object");
                return;
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        for message in messages {
            debug!(kind = message.kind(), "Inbound message");
            self.dispatch(message, playback, context);
        }
    }

    fn dispatch<P, C>(&mut self, message: InboundMessage, playback: &mut P, context: &mut C)
    where
        P: PlaybackSink + ?Sized,
        C: ContextSink + ?Sized,
    {
        match message {
            InboundMessage::ContextUpdate(map) => {
                debug!(keys = map.len(), "Context updated");
                context.update(map);
            }
            InboundMessage::TurnComplete => {
                self.stats.turns_completed += 1;
                self.transcript.end_turn();
                playback.stop(StopReason::TurnComplete);
                debug!("Turn complete");
            }
            InboundMessage::Interrupted => {
                self.stats.interruptions += 1;
                playback.stop(StopReason::Interrupted);
                debug!("Agent interrupted");
            }
            InboundMessage::AudioFrame(data) => {
                self.stats.audio_frames_received += 1;
                if let Err(e) = playback.enqueue(&data) {
                    if matches!(e, AppError::Decode(_)) {
                        self.stats.decode_errors += 1;
                    }
                    warn!(error = %e, kind = e.kind(), "Dropping audio frame");
                }
            }
            InboundMessage::TranscriptDelta { role, text, is_final } => {
                let update = self.transcript.append(role, &text, is_final);
                self.log.append_to_turn(Sender::from(role), update.message_id, &text);
                info!(
                    role = role.header(),
                    new_block = update.new_block,
                    is_final,
                    text = %text,
                    "Transcript"
                );
            }
            InboundMessage::SystemNotice(text) => {
                self.notice(&text);
            }
            InboundMessage::Unknown => {
                self.stats.unknown_frames += 1;
                debug!("Ignoring frame with unknown shape");
            }
        }
    }

    /// The transport closed. Recorded once per connection.
    pub fn on_close(&mut self, info: CloseInfo) {
        if self.close_info.is_some() {
            return;
        }

        // Without a configured key the server usually drops the socket before
        // completing the handshake, which surfaces as 1006.
        let notice = if info.code == ABNORMAL_CLOSURE && !self.config.api_key_configured {
            NOTICE_MISSING_API_KEY
        } else {
            NOTICE_CLOSED
        };

        info!(
            code = info.code,
            reason = %info.reason,
            was_clean = info.was_clean,
            "Connection closed"
        );
        self.close_info = Some(info);
        self.state = SessionState::Closed;
        self.transport = None;
        self.notice(notice);
    }

    /// The transport failed. No reconnect is attempted.
    pub fn on_error(&mut self, message: &str) {
        warn!(error = %message, "Connection error");
        self.state = SessionState::Closed;
        self.notice(NOTICE_ERROR);
    }

    /// Close the connection if it is live and mark the session finished.
    /// Safe in any state; the transport is asked to close at most once.
    pub fn disconnect(&mut self) {
        if self.state.is_live() && !self.close_requested {
            self.state = SessionState::Closing;
            self.close_requested = true;
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.close() {
                    warn!(error = %e, "Failed to request close");
                }
            }
        }
        self.state = SessionState::Closed;
        self.finished = true;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn close_info(&self) -> Option<&CloseInfo> {
        self.close_info.as_ref()
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    pub fn log(&self) -> &[LogEntry] {
        self.log.entries()
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    fn notice(&mut self, text: &str) {
        info!(notice = %text, "System");
        self.log.push(Sender::System, text);
    }
}

impl<T: Transport> FrameSink for SessionProtocol<T> {
    fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.transport.is_some()
    }

    fn send_frame(&mut self, frame: String) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::Transport(format!(
                "Cannot send while {}",
                self.state.as_str()
            )));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AppError::Transport("No transport".to_string()))?;
        transport.send_text(frame)?;
        self.stats.frames_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::AudioChunk;
    use crate::audio::transmit::{FlushOutcome, TransmitBuffer};
    use crate::protocol::messages::Role;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        sent: Vec<String>,
        close_calls: Rc<Cell<usize>>,
    }

    impl Transport for MockTransport {
        fn send_text(&mut self, text: String) -> AppResult<()> {
            self.sent.push(text);
            Ok(())
        }

        fn close(&mut self) -> AppResult<()> {
            self.close_calls.set(self.close_calls.get() + 1);
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    enum PlaybackCall {
        Enqueue(String),
        Stop(StopReason),
    }

    #[derive(Default)]
    struct MockPlayback {
        calls: Vec<PlaybackCall>,
    }

    impl PlaybackSink for MockPlayback {
        fn enqueue(&mut self, base64: &str) -> AppResult<()> {
            self.calls.push(PlaybackCall::Enqueue(base64.to_string()));
            Ok(())
        }

        fn stop(&mut self, reason: StopReason) {
            self.calls.push(PlaybackCall::Stop(reason));
        }
    }

    #[derive(Default)]
    struct MockContext {
        updates: Vec<Map<String, Value>>,
    }

    impl ContextSink for MockContext {
        fn update(&mut self, context: Map<String, Value>) {
            self.updates.push(context);
        }
    }

    fn open_session(config: SessionConfig) -> SessionProtocol<MockTransport> {
        let mut session = SessionProtocol::new(config);
        session.connect(MockTransport::default());
        session.on_open();
        session
    }

    fn sent(session: &SessionProtocol<MockTransport>) -> &[String] {
        &session.transport().unwrap().sent
    }

    #[test]
    fn test_connect_and_open_transitions() {
        let mut session: SessionProtocol<MockTransport> = SessionProtocol::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Idle);

        session.connect(MockTransport::default());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_open());

        session.on_open();
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.is_open());
        assert_eq!(session.log().last().unwrap().text, NOTICE_OPEN);
        // No settings configured, nothing sent
        assert!(sent(&session).is_empty());
    }

    #[test]
    fn test_settings_are_the_first_frame() {
        let session = open_session(SessionConfig {
            settings: Some(json!({"voice": "Puck"})),
            api_key_configured: true,
        });
        let frames = sent(&session);
        assert_eq!(frames.len(), 1);
        let value: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["type"], "settings");
        assert_eq!(value["settings"]["voice"], "Puck");
    }

    #[test]
    fn test_audio_then_turn_complete() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text(r#"{"output_transcription":{"text":"Hi"}}"#, &mut playback, &mut context);
        assert!(session.transcript().active_message_id().is_some());

        session.on_text(r#"{"mime_type":"audio/pcm","data":"QUFB"}"#, &mut playback, &mut context);
        session.on_text(r#"{"mime_type":"audio/pcm","data":"QkJC"}"#, &mut playback, &mut context);
        session.on_text(r#"{"turn_complete":true}"#, &mut playback, &mut context);

        assert_eq!(
            playback.calls,
            vec![
                PlaybackCall::Enqueue("QUFB".into()),
                PlaybackCall::Enqueue("QkJC".into()),
                PlaybackCall::Stop(StopReason::TurnComplete),
            ]
        );
        assert_eq!(session.transcript().active_message_id(), None);
        assert!(context.updates.is_empty());
    }

    #[test]
    fn test_interrupted_only_stops_playback() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text(r#"{"output_transcription":{"text":"Hi"}}"#, &mut playback, &mut context);
        let active = session.transcript().active_message_id();
        session.on_text(r#"{"interrupted":true}"#, &mut playback, &mut context);

        assert_eq!(playback.calls, vec![PlaybackCall::Stop(StopReason::Interrupted)]);
        assert_eq!(session.transcript().active_message_id(), active);
    }

    #[test]
    fn test_transcript_deltas_share_one_header() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text(r#"{"output_transcription":{"text":"He"}}"#, &mut playback, &mut context);
        session.on_text(r#"{"output_transcription":{"text":"llo"}}"#, &mut playback, &mut context);

        let blocks = session.transcript().blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].role, Role::Agent);
        assert_eq!(blocks[0].text, "Hello");
        assert_eq!(session.transcript().notes().matches("**Agent:**").count(), 1);
    }

    #[test]
    fn test_each_agent_turn_gets_its_own_log_entry() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text(r#"{"mime_type":"text/plain","data":"Hel"}"#, &mut playback, &mut context);
        session.on_text(r#"{"mime_type":"text/plain","data":"lo."}"#, &mut playback, &mut context);
        session.on_text(r#"{"turn_complete":true}"#, &mut playback, &mut context);
        session.on_text(r#"{"mime_type":"text/plain","data":"Bye."}"#, &mut playback, &mut context);

        let agent: Vec<&LogEntry> = session.log().iter().filter(|e| e.sender == Sender::Agent).collect();
        assert_eq!(agent.len(), 2);
        assert_eq!(agent[0].text, "Hello.");
        assert_eq!(agent[1].text, "Bye.");
        assert_ne!(agent[0].turn_id, agent[1].turn_id);
        assert_eq!(agent[1].turn_id, session.transcript().active_message_id());
    }

    #[test]
    fn test_context_update_reaches_sink() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text(
            r#"{"type":"context_updated","context_dict":{"company":"Acme"}}"#,
            &mut playback,
            &mut context,
        );

        assert_eq!(context.updates.len(), 1);
        assert_eq!(context.updates[0]["company"], "Acme");
        assert!(playback.calls.is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_frames_are_not_fatal() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();

        session.on_text("{oops", &mut playback, &mut context);
        session.on_text(r#"{"hello":"world"}"#, &mut playback, &mut context);
        session.on_text("[1,2]", &mut playback, &mut context);
        session.on_text(r#"{"interrupted":true}"#, &mut playback, &mut context);

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.stats().decode_errors, 1);
        assert_eq!(session.stats().unknown_frames, 2);
        assert_eq!(playback.calls.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_before_open_drops_audio() {
        let mut session: SessionProtocol<MockTransport> = SessionProtocol::new(SessionConfig::default());
        session.connect(MockTransport::default());

        let mut buffer = TransmitBuffer::new(Duration::from_millis(200));
        buffer.push(AudioChunk::new(vec![1, 2]));
        buffer.push(AudioChunk::new(vec![3, 4]));

        assert_eq!(buffer.flush(&mut session), FlushOutcome::Dropped { bytes: 4, chunks: 2 });
        assert!(sent(&session).is_empty());
        assert_eq!(buffer.pending_chunks(), 0);
    }

    #[tokio::test]
    async fn test_flush_while_open_sends_one_frame() {
        let mut session = open_session(SessionConfig::default());
        let mut buffer = TransmitBuffer::new(Duration::from_millis(200));
        buffer.push(AudioChunk::new(vec![1, 2]));

        assert_eq!(buffer.flush(&mut session), FlushOutcome::Sent { bytes: 2, chunks: 1 });
        assert_eq!(sent(&session).len(), 1);
        assert_eq!(session.stats().frames_sent, 1);
    }

    #[test]
    fn test_double_disconnect_closes_once() {
        let mut session = open_session(SessionConfig::default());
        session.disconnect();
        session.disconnect();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_finished());
        assert_eq!(session.transport().unwrap().close_calls.get(), 1);
    }

    #[test]
    fn test_disconnect_from_idle() {
        let mut session: SessionProtocol<MockTransport> = SessionProtocol::new(SessionConfig::default());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_finished());
    }

    #[test]
    fn test_abnormal_close_without_api_key() {
        let mut session = open_session(SessionConfig { settings: None, api_key_configured: false });
        session.on_close(CloseInfo::abnormal());

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.log().last().unwrap().text, NOTICE_MISSING_API_KEY);
        assert_eq!(session.close_info().unwrap().code, ABNORMAL_CLOSURE);
    }

    #[test]
    fn test_abnormal_close_with_api_key() {
        let mut session = open_session(SessionConfig { settings: None, api_key_configured: true });
        session.on_close(CloseInfo::abnormal());
        assert_eq!(session.log().last().unwrap().text, NOTICE_CLOSED);
    }

    #[test]
    fn test_clean_close_reports_closed_once() {
        let mut session = open_session(SessionConfig::default());
        session.disconnect();
        let close = CloseInfo { code: 1000, reason: "bye".into(), was_clean: true };
        session.on_close(close.clone());
        session.on_close(close);

        let closed_notices = session.log().iter().filter(|e| e.text == NOTICE_CLOSED).count();
        assert_eq!(closed_notices, 1);
    }

    #[test]
    fn test_error_closes_session() {
        let mut session = open_session(SessionConfig::default());
        session.on_error("connection reset");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_open());
        assert_eq!(session.log().last().unwrap().text, NOTICE_ERROR);
    }

    #[test]
    fn test_frames_after_close_are_ignored() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();
        session.disconnect();

        session.on_text(r#"{"mime_type":"audio/pcm","data":"QUFB"}"#, &mut playback, &mut context);
        assert!(playback.calls.is_empty());
    }

    #[test]
    fn test_reconnect_resets_finished_and_transcript() {
        let mut session = open_session(SessionConfig::default());
        let mut playback = MockPlayback::default();
        let mut context = MockContext::default();
        session.on_text(r#"{"input_transcription":{"text":"hi"}}"#, &mut playback, &mut context);
        session.disconnect();

        session.connect(MockTransport::default());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_finished());
        assert!(session.transcript().blocks().is_empty());
        assert!(session.close_info().is_none());
    }

    #[test]
    fn test_connect_while_open_closes_previous_transport() {
        let first_closes = Rc::new(Cell::new(0));
        let mut session = SessionProtocol::new(SessionConfig::default());
        session.connect(MockTransport { sent: Vec::new(), close_calls: first_closes.clone() });
        session.on_open();

        session.connect(MockTransport::default());

        assert_eq!(first_closes.get(), 1);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.transport().unwrap().close_calls.get(), 0);
        assert!(!session.is_finished());
    }
}
