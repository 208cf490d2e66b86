//! # Client State
//!
//! State shared between the session loop and whoever observes it (the
//! terminal front end in `main`, tests).
//!
//! ## Contents:
//! - **Context store**: the latest server-side conversation context, written
//!   by `context_updated` frames
//! - **Metrics**: counters for frames and audio in both directions
//!
//! ## Thread Safety:
//! Both live behind `Arc<RwLock<T>>`; `ClientState` is cheap to clone and
//! every clone sees the same data. Locks are held only for the duration of a
//! single read or update, never across an `.await`.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::audio::transmit::FlushOutcome;
use crate::protocol::session::ContextSink;

#[derive(Debug, Clone)]
pub struct ClientState {
    /// Latest context published by the server, merged key by key
    pub context: Arc<RwLock<Map<String, Value>>>,

    /// Counters updated by the session loop
    pub metrics: Arc<RwLock<ClientMetrics>>,

    /// When this client state was created
    pub start_time: Instant,
}

/// Session counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMetrics {
    /// Audio frames handed to the transport
    pub frames_sent: u64,
    /// PCM bytes inside those frames
    pub bytes_sent: u64,
    /// Captured PCM bytes discarded because the transport was not open
    pub audio_bytes_dropped: u64,
    /// Capture chunks lost because the orchestrator fell behind
    pub capture_chunks_dropped: u64,
    /// Text frames delivered by the transport
    pub frames_received: u64,
    /// Running total copied from the protocol after each frame
    pub decode_errors: u64,
    /// `context_updated` frames merged into the context store
    pub context_updates: u64,
    /// Connection attempts, successful or not
    pub sessions_started: u64,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            context: Arc::new(RwLock::new(Map::new())),
            metrics: Arc::new(RwLock::new(ClientMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current context.
    pub fn get_context(&self) -> Map<String, Value> {
        self.context.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Merge `update` into the stored context; keys in `update` win.
    pub fn merge_context(&self, update: Map<String, Value>) {
        if let Ok(mut context) = self.context.write() {
            context.extend(update);
        }
        self.with_metrics(|m| m.context_updates += 1);
    }

    pub fn clear_context(&self) {
        if let Ok(mut context) = self.context.write() {
            context.clear();
        }
    }

    /// Fold one transmit flush into the counters.
    pub fn record_flush(&self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => {}
            FlushOutcome::Sent { bytes, .. } => self.with_metrics(|m| {
                m.frames_sent += 1;
                m.bytes_sent += bytes as u64;
            }),
            FlushOutcome::Dropped { bytes, .. } => self.with_metrics(|m| {
                m.audio_bytes_dropped += bytes as u64;
            }),
        }
    }

    pub fn record_frame_received(&self) {
        self.with_metrics(|m| m.frames_received += 1);
    }

    /// Overwrite the decode error count with the protocol's running total.
    pub fn set_decode_errors(&self, total: u64) {
        self.with_metrics(|m| m.decode_errors = total);
    }

    pub fn set_capture_chunks_dropped(&self, total: u64) {
        self.with_metrics(|m| m.capture_chunks_dropped = total);
    }

    pub fn increment_sessions_started(&self) {
        self.with_metrics(|m| m.sessions_started += 1);
    }

    /// Consistent copy of all counters.
    pub fn get_metrics_snapshot(&self) -> ClientMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn with_metrics(&self, update: impl FnOnce(&mut ClientMetrics)) {
        if let Ok(mut metrics) = self.metrics.write() {
            update(&mut metrics);
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextSink for ClientState {
    fn update(&mut self, context: Map<String, Value>) {
        self.merge_context(context);
    }
}
