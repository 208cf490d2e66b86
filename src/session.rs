//! # Voice Session
//!
//! Sequences one conversation: socket, speakers, microphone, and the loop
//! that moves data between them.
//!
//! ## Lifecycle:
//! 1. **start**: connect and wait for the socket to open, then start playback,
//!    then capture. A failure at any step stops whatever already started.
//! 2. **run**: one `tokio::select!` loop over socket events, captured chunks,
//!    the transmit timer and an external stop signal
//! 3. **stop**: capture → transmit timer → socket → playback. Safe to call
//!    in any state and more than once.
//!
//! Device threads never touch the protocol; everything they produce arrives
//! here through channels, so protocol state has a single owner.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::analyser::SpectrumFrame;
use crate::audio::capture::{AudioChunk, CaptureConfig, CapturePipeline};
use crate::audio::playback::{PlaybackConfig, PlaybackPipeline};
use crate::audio::transmit::{FlushOutcome, TransmitBuffer};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::session::{CloseInfo, SessionConfig, SessionProtocol};
use crate::state::ClientState;
use crate::websocket::{TransportEvent, WsTransport};

/// How long `stop` waits for the server to answer a close request.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One wakeup of the session loop.
enum Step {
    Shutdown,
    Event(TransportEvent),
    Chunk(AudioChunk),
    Flush,
}

pub struct VoiceSession {
    config: AppConfig,
    state: ClientState,
    protocol: SessionProtocol<WsTransport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    capture: CapturePipeline,
    chunks: mpsc::Receiver<AudioChunk>,
    playback: PlaybackPipeline,
    transmit: TransmitBuffer,
}

impl VoiceSession {
    pub fn new(config: AppConfig, session: SessionConfig, state: ClientState) -> Self {
        let (capture, chunks) = CapturePipeline::new(CaptureConfig::from(&config.audio));
        let playback = PlaybackPipeline::new(PlaybackConfig::from(&config.audio));
        let transmit = TransmitBuffer::new(Duration::from_millis(config.audio.flush_interval_ms));

        Self {
            config,
            state,
            protocol: SessionProtocol::new(session),
            events: None,
            capture,
            chunks,
            playback,
            transmit,
        }
    }

    /// Connect, then bring up playback and capture.
    ///
    /// ## Errors:
    /// - `AppError::Transport` when the socket fails or does not open within
    ///   `server.connect_timeout_ms`
    /// - `AppError::Device` when either audio device cannot be opened
    ///
    /// On error nothing is left running.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.is_active() {
            info!("Stopping previous session before starting a new one");
            self.stop().await;
        }

        let session_id = self.open_connection().await?;

        if let Err(e) = self.playback.start().await {
            self.stop().await;
            return Err(e);
        }
        if let Err(e) = self.capture.start().await {
            self.stop().await;
            return Err(e);
        }

        info!(session_id = %session_id, "Voice session live");
        Ok(())
    }

    /// Drive the session until it closes or `shutdown` completes, then stop.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> AppResult<()> {
        tokio::pin!(shutdown);

        loop {
            let Some(events) = self.events.as_mut() else {
                break;
            };

            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                event = events.recv() => {
                    Step::Event(event.unwrap_or(TransportEvent::Closed(CloseInfo::abnormal())))
                }
                Some(chunk) = self.chunks.recv() => Step::Chunk(chunk),
                _ = self.transmit.tick() => Step::Flush,
            };

            match step {
                Step::Shutdown => {
                    info!("Stop requested");
                    break;
                }
                Step::Event(event) => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Step::Chunk(chunk) => self.transmit.push(chunk),
                Step::Flush => self.flush_transmit(),
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Release everything in dependency order. Safe in any state.
    pub async fn stop(&mut self) {
        self.capture.stop();
        self.state.set_capture_chunks_dropped(self.capture.chunks_dropped());
        while self.chunks.try_recv().is_ok() {}

        if self.transmit.pending_chunks() > 0 {
            debug!(
                chunks = self.transmit.pending_chunks(),
                bytes = self.transmit.pending_bytes(),
                "Discarding unsent audio"
            );
        }
        self.transmit.stop();
        self.protocol.disconnect();
        self.playback.stop();

        if let Some(mut events) = self.events.take() {
            let protocol = &mut self.protocol;
            let wait_for_close = async {
                while let Some(event) = events.recv().await {
                    if let TransportEvent::Closed(info) = event {
                        protocol.on_close(info);
                        break;
                    }
                }
            };
            if tokio::time::timeout(CLOSE_GRACE, wait_for_close).await.is_err() {
                debug!("Server did not answer the close request in time");
            }
        }
    }

    /// Whether anything is still connected or running.
    pub fn is_active(&self) -> bool {
        self.protocol.state().is_live() || self.capture.is_running() || self.playback.is_running()
    }

    pub fn protocol(&self) -> &SessionProtocol<WsTransport> {
        &self.protocol
    }

    /// Microphone spectrum frames, for level meters.
    pub fn spectrum(&self) -> watch::Receiver<SpectrumFrame> {
        self.capture.spectrum()
    }

    /// Connect the socket and wait for it to open. Returns the session id.
    async fn open_connection(&mut self) -> AppResult<String> {
        let session_id = self.config.session_id();
        let url = self.config.websocket_url(&session_id);
        info!(session_id = %session_id, url = %url, "Starting voice session");

        self.state.clear_context();
        let (transport, events) = WsTransport::connect(url);
        self.protocol.connect(transport);
        self.events = Some(events);
        self.state.increment_sessions_started();

        let timeout_ms = self.config.server.connect_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.await_open()).await {
            Ok(Ok(())) => Ok(session_id),
            Ok(Err(e)) => {
                self.stop().await;
                Err(e)
            }
            Err(_) => {
                warn!(timeout_ms, "Connection did not open in time");
                self.stop().await;
                Err(AppError::Transport(format!(
                    "Connection did not open within {}ms",
                    timeout_ms
                )))
            }
        }
    }

    async fn await_open(&mut self) -> AppResult<()> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| AppError::Internal("No connection in progress".to_string()))?;
        let mut last_error = None;

        loop {
            match events.recv().await {
                Some(TransportEvent::Opened) => {
                    self.protocol.on_open();
                    return Ok(());
                }
                Some(TransportEvent::Error(message)) => {
                    self.protocol.on_error(&message);
                    last_error = Some(message);
                }
                Some(TransportEvent::Closed(info)) => {
                    let code = info.code;
                    self.protocol.on_close(info);
                    return Err(AppError::Transport(match last_error {
                        Some(message) => format!("Connection failed: {}", message),
                        None => format!("Connection closed before opening (code {})", code),
                    }));
                }
                Some(TransportEvent::Text(_)) => debug!("Ignoring frame received before open"),
                None => {
                    return Err(AppError::Transport("Socket task exited before opening".to_string()));
                }
            }
        }
    }

    /// Apply one socket event. Returns false once the connection is gone.
    fn handle_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Opened => {
                debug!("Unexpected open event");
                true
            }
            TransportEvent::Text(text) => {
                self.state.record_frame_received();
                self.protocol.on_text(&text, &mut self.playback, &mut self.state);
                self.state.set_decode_errors(self.protocol.stats().decode_errors);
                true
            }
            TransportEvent::Error(message) => {
                self.protocol.on_error(&message);
                true
            }
            TransportEvent::Closed(info) => {
                self.protocol.on_close(info);
                self.events = None;
                false
            }
        }
    }

    fn flush_transmit(&mut self) {
        let outcome = self.transmit.flush(&mut self.protocol);
        if let FlushOutcome::Dropped { bytes, chunks } = outcome {
            debug!(bytes, chunks, state = self.protocol.state().as_str(), "Audio dropped");
        }
        self.state.record_flush(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::base64_decode;
    use crate::protocol::session::{SessionState, NOTICE_CLOSED, NOTICE_ERROR, NOTICE_MISSING_API_KEY, NOTICE_OPEN};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;

    async fn config_for(listener: &TcpListener, timeout_ms: u64) -> AppConfig {
        let addr = listener.local_addr().unwrap();
        let mut config = AppConfig::default();
        config.server.host = addr.ip().to_string();
        config.server.port = addr.port();
        config.server.connect_timeout_ms = timeout_ms;
        config
    }

    #[tokio::test]
    async fn test_start_fails_cleanly_when_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener, 5000).await;
        drop(listener);

        let state = ClientState::new();
        let mut session = VoiceSession::new(config, SessionConfig::default(), state.clone());
        let err = session.start().await.unwrap_err();

        assert!(matches!(err, AppError::Transport(_)));
        assert!(!session.is_active());
        assert_eq!(session.protocol().state(), SessionState::Closed);
        assert!(session.protocol().close_info().is_some());
        assert_eq!(state.get_metrics_snapshot().sessions_started, 1);
    }

    #[tokio::test]
    async fn test_start_times_out_when_handshake_never_completes() {
        // TCP is accepted via the backlog but no WebSocket handshake happens
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener, 200).await;

        let mut session = VoiceSession::new(config, SessionConfig::default(), ClientState::new());
        let err = session.start().await.unwrap_err();

        assert!(err.to_string().contains("200ms"));
        assert!(!session.is_active());
        assert_eq!(session.protocol().state(), SessionState::Closed);
        let info = session.protocol().close_info().unwrap();
        assert_eq!(info.reason, "aborted");
    }

    #[tokio::test]
    async fn test_stop_and_run_without_start() {
        let mut session = VoiceSession::new(AppConfig::default(), SessionConfig::default(), ClientState::new());
        session.stop().await;
        session.stop().await;
        session.run(std::future::pending()).await.unwrap();

        assert!(!session.is_active());
        assert!(session.protocol().is_finished());
        assert!(session.protocol().close_info().is_none());
    }

    /// Session connected to a local server, with a test-owned chunk channel
    /// standing in for the microphone.
    async fn connected_session(
        config: AppConfig,
        session_config: SessionConfig,
        state: ClientState,
    ) -> (VoiceSession, mpsc::Sender<AudioChunk>) {
        let mut session = VoiceSession::new(config, session_config, state);
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        session.chunks = chunk_rx;
        session.open_connection().await.unwrap();
        (session, chunk_tx)
    }

    #[tokio::test]
    async fn test_run_streams_audio_and_ends_on_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener, 5000).await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => received.push(serde_json::from_str::<Value>(&text).unwrap()),
                    Some(Ok(_)) => {}
                    other => panic!("unexpected {:?}", other),
                }
            }
            for frame in [
                json!({"mime_type": "audio/pcm", "data": "AAAA"}),
                json!({"output_transcription": {"text": "Hi"}}),
                json!({"turn_complete": true}),
            ] {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            ws.close(Some(CloseFrame { code: CloseCode::Normal, reason: "bye".into() }))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
            received
        });

        let state = ClientState::new();
        let session_config = SessionConfig {
            settings: Some(json!({"voice": "Puck"})),
            api_key_configured: true,
        };
        let (mut session, chunk_tx) = connected_session(config, session_config, state.clone()).await;
        chunk_tx.send(AudioChunk::new(vec![1, 2])).await.unwrap();
        chunk_tx.send(AudioChunk::new(vec![3, 4])).await.unwrap();

        timeout(Duration::from_secs(5), session.run(std::future::pending()))
            .await
            .expect("run did not end on server close")
            .unwrap();

        // Settings first, then both chunks merged into one frame on the first tick
        let received = server.await.unwrap();
        assert_eq!(received[0]["type"], "settings");
        assert_eq!(received[0]["settings"]["voice"], "Puck");
        assert_eq!(received[1]["mime_type"], "audio/pcm");
        assert_eq!(base64_decode(received[1]["data"].as_str().unwrap()).unwrap(), vec![1, 2, 3, 4]);

        let protocol = session.protocol();
        let info = protocol.close_info().unwrap();
        assert_eq!((info.code, info.reason.as_str(), info.was_clean), (1000, "bye", true));
        assert_eq!(protocol.state(), SessionState::Closed);
        assert_eq!(protocol.transcript().notes(), "**Agent:** Hi");
        assert_eq!(protocol.stats().audio_frames_received, 1);
        assert_eq!(protocol.stats().turns_completed, 1);
        assert_eq!(protocol.log().first().unwrap().text, NOTICE_OPEN);
        assert_eq!(protocol.log().last().unwrap().text, NOTICE_CLOSED);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.bytes_sent, 4);
        assert_eq!(metrics.frames_received, 3);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_run_reports_dropped_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener, 5000).await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            drop(ws);
        });

        let (mut session, _chunk_tx) =
            connected_session(config, SessionConfig::default(), ClientState::new()).await;
        timeout(Duration::from_secs(5), session.run(std::future::pending()))
            .await
            .expect("run did not end on dropped connection")
            .unwrap();

        let protocol = session.protocol();
        assert_eq!(protocol.close_info().unwrap().code, 1006);
        assert_eq!(protocol.state(), SessionState::Closed);

        // Any error notice comes before the close notice
        let log = protocol.log();
        assert_eq!(log.last().unwrap().text, NOTICE_MISSING_API_KEY);
        if let Some(error_at) = log.iter().position(|e| e.text == NOTICE_ERROR) {
            assert!(error_at < log.len() - 1);
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_socket_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener, 5000).await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // Keep reading so the close frame gets answered
            while ws.next().await.is_some() {}
        });

        let (mut session, _chunk_tx) =
            connected_session(config, SessionConfig::default(), ClientState::new()).await;
        session.run(async {}).await.unwrap();

        let protocol = session.protocol();
        assert!(protocol.is_finished());
        assert_eq!(protocol.state(), SessionState::Closed);
        assert_eq!(protocol.close_info().unwrap().code, 1000);
        assert!(!session.is_active());
    }
}
