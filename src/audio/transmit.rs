//! # Transmit Buffer
//!
//! Accumulates captured PCM chunks and flushes them to the server as a single
//! framed message every flush interval (200ms by default).
//!
//! ## Key Features:
//! - **Lazy timer**: the flush timer starts on the first pushed chunk, not on
//!   construction, and runs until `stop()`
//! - **Arrival order**: chunks are concatenated in the order they were pushed
//! - **Drop, don't retry**: the pending audio is cleared on every flush
//!   attempt. If the transport is not open the audio is discarded.
//!
//! ## Backpressure:
//! The buffer is the only place in the client that drops data. Holding audio
//! back while the socket is down would replay stale speech once it recovers.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::audio::capture::AudioChunk;
use crate::audio::codec::base64_encode;
use crate::error::AppResult;
use crate::protocol::messages::OutboundAudio;

/// Where flushed frames go. Implemented by the session protocol.
pub trait FrameSink {
    /// Whether the transport can accept frames right now.
    fn is_open(&self) -> bool;

    /// Send one serialized text frame.
    fn send_frame(&mut self, frame: String) -> AppResult<()>;
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// One frame was handed to the sink
    Sent { bytes: usize, chunks: usize },
    /// Pending audio was discarded (transport not open or send failed)
    Dropped { bytes: usize, chunks: usize },
}

pub struct TransmitBuffer {
    pending: Vec<AudioChunk>,
    flush_interval: Duration,
    timer: Option<Interval>,
}

impl TransmitBuffer {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            flush_interval,
            timer: None,
        }
    }

    /// Append a chunk, starting the flush timer if it is not running.
    /// Empty chunks are ignored.
    pub fn push(&mut self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        if self.timer.is_none() {
            // interval_at so the first tick is one period away, not immediate
            let mut timer = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.timer = Some(timer);
            debug!(interval_ms = self.flush_interval.as_millis() as u64, "Transmit timer started");
        }
        self.pending.push(chunk);
    }

    /// Completes on the next flush tick. Never completes while the timer is
    /// not running, so it can sit in a `select!` from the start.
    pub async fn tick(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Concatenate pending chunks and send them as one audio frame.
    ///
    /// The pending sequence is empty afterwards whatever the outcome.
    pub fn flush<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::Empty;
        }

        let chunks = std::mem::take(&mut self.pending);
        let count = chunks.len();
        let bytes: usize = chunks.iter().map(|c| c.len()).sum();

        if !sink.is_open() {
            debug!(bytes, chunks = count, "Transport not open, dropping buffered audio");
            return FlushOutcome::Dropped { bytes, chunks: count };
        }

        let mut joined = Vec::with_capacity(bytes);
        for chunk in &chunks {
            joined.extend_from_slice(chunk.as_bytes());
        }

        let frame = OutboundAudio::pcm(base64_encode(&joined)).to_json();
        match sink.send_frame(frame) {
            Ok(()) => FlushOutcome::Sent { bytes, chunks: count },
            Err(e) => {
                warn!(error = %e, bytes, "Failed to send audio frame, dropping");
                FlushOutcome::Dropped { bytes, chunks: count }
            }
        }
    }

    /// Stop the timer and discard anything pending.
    pub fn stop(&mut self) {
        if self.timer.take().is_some() {
            debug!(discarded = self.pending.len(), "Transmit timer stopped");
        }
        self.pending.clear();
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|c| c.len()).sum()
    }
}
