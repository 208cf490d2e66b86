//! # WebSocket Transport
//!
//! Client side of the duplex connection to the voice server.
//!
//! ## Structure:
//! A spawned tokio task owns the socket. The rest of the client talks to it
//! through two channels:
//! - **commands** (`WsTransport` → task): send a text frame, or close
//! - **events** (task → session loop): opened, text frame, closed, error
//!
//! ## Close Semantics:
//! - A close frame from the server yields `Closed` with its code and reason.
//! - A connection lost without a close frame yields `Closed` with code 1006
//!   and `was_clean = false`, preceded by `Error` when a read failed.
//! - A close requested while the handshake is still running aborts it.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::protocol::session::{CloseInfo, Transport};

/// Close code used when the server's close frame carries no status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Closed(CloseInfo),
    Error(String),
}

#[derive(Debug)]
enum TransportCommand {
    Send(String),
    Close,
}

/// Handle to a socket task. Dropping it asks the task to close the socket.
pub struct WsTransport {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
}

impl WsTransport {
    /// Start connecting to `url` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(url: String) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url, cmd_rx, event_tx));
        (Self { cmd_tx }, event_rx)
    }
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: String) -> AppResult<()> {
        self.cmd_tx
            .send(TransportCommand::Send(text))
            .map_err(|_| AppError::Transport("Socket task has exited".to_string()))
    }

    fn close(&mut self) -> AppResult<()> {
        self.cmd_tx
            .send(TransportCommand::Close)
            .map_err(|_| AppError::Transport("Socket task has exited".to_string()))
    }
}

async fn run_socket(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    debug!(url = %url, "Connecting");

    let ws = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((ws, response)) => {
                info!(url = %url, status = %response.status(), "WebSocket connected");
                ws
            }
            Err(e) => {
                warn!(url = %url, error = %e, "WebSocket connect failed");
                let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                let _ = event_tx.send(TransportEvent::Closed(CloseInfo::abnormal()));
                return;
            }
        },
        _ = wait_for_close(&mut cmd_rx) => {
            debug!("Connect aborted by close request");
            let _ = event_tx.send(TransportEvent::Closed(CloseInfo {
                reason: "aborted".to_string(),
                ..CloseInfo::abnormal()
            }));
            return;
        }
    };

    let _ = event_tx.send(TransportEvent::Opened);
    let (mut sink, mut stream) = ws.split();
    let mut close_sent = false;

    let close_info = loop {
        tokio::select! {
            command = cmd_rx.recv(), if !close_sent => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "WebSocket send failed");
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break CloseInfo::abnormal();
                    }
                }
                // None: the handle was dropped
                Some(TransportCommand::Close) | None => {
                    close_sent = true;
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Close frame not sent");
                        break CloseInfo::abnormal();
                    }
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(TransportEvent::Text(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let info = match frame {
                        Some(frame) => CloseInfo {
                            code: u16::from(frame.code),
                            reason: frame.reason.to_string(),
                            was_clean: true,
                        },
                        None => CloseInfo {
                            code: NO_STATUS_RECEIVED,
                            reason: String::new(),
                            was_clean: true,
                        },
                    };
                    // Flushes the close reply tungstenite queued for us
                    let _ = sink.close().await;
                    break info;
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    break CloseInfo::abnormal();
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                    break CloseInfo::abnormal();
                }
            },
        }
    };

    debug!(code = close_info.code, was_clean = close_info.was_clean, "Socket task finished");
    let _ = event_tx.send(TransportEvent::Closed(close_info));
}

/// Completes when a close is requested or the handle is dropped. Frames sent
/// before the socket opened are discarded.
async fn wait_for_close(cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>) {
    loop {
        match cmd_rx.recv().await {
            Some(TransportCommand::Send(_)) => debug!("Dropping frame sent before open"),
            Some(TransportCommand::Close) | None => return,
        }
    }
}
