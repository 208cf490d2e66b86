//! # Playback Pipeline
//!
//! Renders the agent's 24 kHz PCM16 speech on the output device.
//!
//! ## Components:
//! - **Worker thread** (`audio-playback`): builds and owns the `cpal` output
//!   stream, receives commands over a std channel, converts PCM16 to f32 and
//!   resamples 24 kHz to the device rate before queueing.
//! - **PlaybackQueue**: FIFO of decoded segments plus end-of-stream markers,
//!   shared between the worker and the device callback behind a short mutex.
//! - **Device callback**: drains the queue back-to-back, duplicating mono to
//!   every output channel, and renders silence when nothing is queued.
//!
//! ## Ordering:
//! Every operation after `start()` goes through the worker's command channel,
//! so a `flush()` discards exactly the audio enqueued before it, never audio
//! that arrives afterwards.

use std::collections::VecDeque;
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::audio::codec::{base64_decode, pcm16_to_float};
use crate::audio::resample::LinearResampler;
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::session::{PlaybackSink, StopReason};

/// Playback settings derived from the `[audio]` configuration section.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate of the PCM the server sends (24000)
    pub sample_rate: u32,
    /// Output device name; `None` uses the host default
    pub device_name: Option<String>,
}

impl From<&AudioConfig> for PlaybackConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.playback_sample_rate,
            device_name: config.output_device.clone(),
        }
    }
}

/// Counters describing what the device callback has rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub segments_queued: u64,
    /// Mono samples rendered (at the device rate)
    pub samples_played: u64,
    /// Callbacks that ran dry before reaching an end-of-stream marker
    pub underruns: u64,
    pub end_of_stream_reached: u64,
    pub flushes: u64,
}

#[derive(Debug)]
enum QueueItem {
    Segment { samples: Vec<f32>, pos: usize },
    EndOfStream,
}

/// FIFO of decoded segments consumed by the device callback.
#[derive(Debug)]
pub struct PlaybackQueue {
    items: VecDeque<QueueItem>,
    /// True once the queue ran to an end-of-stream marker (or was never fed),
    /// so trailing silence is expected rather than an underrun.
    drained: bool,
    stats: PlaybackStats,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            drained: true,
            stats: PlaybackStats::default(),
        }
    }
}

impl PlaybackQueue {
    pub fn push_segment(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        self.items.push_back(QueueItem::Segment { samples, pos: 0 });
        self.drained = false;
        self.stats.segments_queued += 1;
    }

    pub fn push_end_of_stream(&mut self) {
        self.items.push_back(QueueItem::EndOfStream);
    }

    /// Discard everything queued, including pending end-of-stream markers.
    pub fn clear(&mut self) {
        self.items.clear();
        self.drained = true;
        self.stats.flushes += 1;
    }

    /// Mono samples still waiting to be rendered.
    pub fn queued_samples(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                QueueItem::Segment { samples, pos } => samples.len() - pos,
                QueueItem::EndOfStream => 0,
            })
            .sum()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats.clone()
    }

    /// Fill an interleaved output buffer, writing each mono sample to every
    /// channel. Frames past the end of the queued audio are silent.
    pub fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mut starved = false;
        for frame in out.chunks_mut(channels) {
            let sample = match self.next_sample() {
                Some(sample) => sample,
                None => {
                    starved |= !self.drained;
                    0.0
                }
            };
            frame.fill(sample);
        }
        if starved {
            self.stats.underruns += 1;
        }
    }

    fn next_sample(&mut self) -> Option<f32> {
        loop {
            match self.items.front_mut() {
                Some(QueueItem::Segment { samples, pos }) => {
                    if let Some(&sample) = samples.get(*pos) {
                        *pos += 1;
                        self.stats.samples_played += 1;
                        return Some(sample);
                    }
                    self.items.pop_front();
                }
                Some(QueueItem::EndOfStream) => {
                    self.items.pop_front();
                    self.stats.end_of_stream_reached += 1;
                    // Audio queued after the marker belongs to the next turn
                    self.drained = self.items.is_empty();
                }
                None => return None,
            }
        }
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Segment(Vec<u8>),
    EndOfStream,
    Flush,
    Shutdown,
}

struct PlaybackWorker {
    cmd_tx: Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

pub struct PlaybackPipeline {
    config: PlaybackConfig,
    queue: Arc<Mutex<PlaybackQueue>>,
    worker: Option<PlaybackWorker>,
}

impl PlaybackPipeline {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            queue: Arc::new(Mutex::new(PlaybackQueue::default())),
            worker: None,
        }
    }

    /// Open the output device and start the worker.
    ///
    /// ## Errors:
    /// `AppError::Device` when no usable output device exists.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.worker.is_some() {
            debug!("Playback already running");
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let queue = self.queue.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || run_playback_thread(config, queue, ready_tx, cmd_rx))
            .map_err(|e| AppError::Internal(format!("Failed to spawn playback thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok((device, rate, channels))) => {
                info!(
                    device = %device,
                    device_rate = rate,
                    device_channels = channels,
                    source_rate = self.config.sample_rate,
                    "Audio playback started"
                );
                self.worker = Some(PlaybackWorker { cmd_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                error!(error = %e, "Failed to start audio playback");
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::Internal("Playback thread exited before reporting".to_string()))
            }
        }
    }

    /// Decode one Base64 PCM16 frame and queue it behind earlier frames.
    ///
    /// ## Errors:
    /// `AppError::Decode` for malformed Base64; the frame is dropped.
    pub fn enqueue(&self, base64: &str) -> AppResult<()> {
        let bytes = base64_decode(base64)?;
        self.send(WorkerCommand::Segment(bytes))
    }

    /// Let queued audio finish, then render silence.
    pub fn signal_end_of_stream(&self) -> AppResult<()> {
        self.send(WorkerCommand::EndOfStream)
    }

    /// Drop everything queued so far.
    pub fn flush(&self) -> AppResult<()> {
        self.send(WorkerCommand::Flush)
    }

    /// Release the worker and device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.cmd_tx.send(WorkerCommand::Shutdown);
        if worker.handle.join().is_err() {
            warn!("Playback thread panicked during shutdown");
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.items.clear();
            queue.drained = true;
        }
        info!("Audio playback stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.queue.lock().map(|q| q.stats()).unwrap_or_default()
    }

    fn send(&self, command: WorkerCommand) -> AppResult<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| AppError::Internal("Playback is not running".to_string()))?;
        worker
            .cmd_tx
            .send(command)
            .map_err(|_| AppError::Internal("Playback worker has exited".to_string()))
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlaybackSink for PlaybackPipeline {
    fn enqueue(&mut self, base64: &str) -> AppResult<()> {
        PlaybackPipeline::enqueue(self, base64)
    }

    fn stop(&mut self, reason: StopReason) {
        let result = match reason {
            StopReason::TurnComplete => self.signal_end_of_stream(),
            StopReason::Interrupted => self.flush(),
        };
        if let Err(e) = result {
            debug!(error = %e, reason = ?reason, "Playback stop ignored");
        }
    }
}

/// Converts wire PCM into device-rate samples, keeping resampler phase
/// continuous across segments.
struct SegmentConverter {
    resampler: LinearResampler,
}

impl SegmentConverter {
    fn new(source_rate: u32, device_rate: u32) -> Self {
        Self {
            resampler: LinearResampler::new(source_rate, device_rate),
        }
    }

    fn convert(&mut self, pcm: &[u8]) -> Vec<f32> {
        self.resampler.process(&pcm16_to_float(pcm))
    }

    fn reset(&mut self) {
        self.resampler.reset();
    }
}

type ReadyResult = AppResult<(String, u32, u16)>;

fn run_playback_thread(
    config: PlaybackConfig,
    queue: Arc<Mutex<PlaybackQueue>>,
    ready: oneshot::Sender<ReadyResult>,
    cmd_rx: Receiver<WorkerCommand>,
) {
    let (stream, device_rate) = match open_output_stream(&config, queue.clone()) {
        Ok((stream, name, rate, channels)) => {
            if ready.send(Ok((name, rate, channels))).is_err() {
                return;
            }
            (stream, rate)
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut converter = SegmentConverter::new(config.sample_rate, device_rate);

    // A closed channel means the pipeline was dropped
    while let Ok(command) = cmd_rx.recv() {
        match command {
            WorkerCommand::Segment(bytes) => {
                let samples = converter.convert(&bytes);
                if let Ok(mut q) = queue.lock() {
                    q.push_segment(samples);
                }
            }
            WorkerCommand::EndOfStream => {
                if let Ok(mut q) = queue.lock() {
                    q.push_end_of_stream();
                }
            }
            WorkerCommand::Flush => {
                converter.reset();
                if let Ok(mut q) = queue.lock() {
                    let discarded = q.queued_samples();
                    q.clear();
                    debug!(discarded, "Playback flushed");
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }

    drop(stream);
    debug!("Playback stream released");
}

fn open_output_stream(
    config: &PlaybackConfig,
    queue: Arc<Mutex<PlaybackQueue>>,
) -> AppResult<(cpal::Stream, String, u32, u16)> {
    let host = cpal::default_host();
    let device = select_output_device(&host, config.device_name.as_deref())?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = choose_output_config(&device, config.sample_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &stream_config, queue)?,
        SampleFormat::I16 => build_output::<i16>(&device, &stream_config, queue)?,
        SampleFormat::U16 => build_output::<u16>(&device, &stream_config, queue)?,
        other => {
            return Err(AppError::Device(format!("Unsupported output sample format: {:?}", other)));
        }
    };
    stream.play()?;

    Ok((stream, name, stream_config.sample_rate.0, stream_config.channels))
}

fn select_output_device(host: &cpal::Host, name: Option<&str>) -> AppResult<cpal::Device> {
    match name {
        Some(wanted) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AppError::Device(format!("Output device '{}' not found", wanted))),
        None => host
            .default_output_device()
            .ok_or_else(|| AppError::Device("No output device available".to_string())),
    }
}

fn choose_output_config(device: &cpal::Device, source_rate: u32) -> AppResult<cpal::SupportedStreamConfig> {
    let rate = cpal::SampleRate(source_rate);
    if let Ok(ranges) = device.supported_output_configs() {
        let exact = ranges
            .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16))
            .find(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate());
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(rate));
        }
    }
    debug!(source_rate, "No native output config at source rate, resampling");
    Ok(device.default_output_config()?)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<Mutex<PlaybackQueue>>,
) -> AppResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.clear();
            scratch.resize(data.len(), 0.0);
            if let Ok(mut q) = queue.lock() {
                q.fill(&mut scratch, channels);
            }
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| error!(error = %err, "Audio playback stream error"),
        None,
    )?;
    Ok(stream)
}
