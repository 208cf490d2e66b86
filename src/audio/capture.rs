//! # Capture Pipeline
//!
//! Owns the microphone input stream and turns device-native audio blocks into
//! 16 kHz mono PCM16 chunks for the transmit buffer.
//!
//! ## Threading:
//! A `cpal::Stream` is not `Send`, so the stream is built and kept alive on a
//! dedicated `audio-capture` thread. `start()` waits on a oneshot for that
//! thread to report whether the device opened; `stop()` signals the thread
//! over a std channel and joins it, which drops the stream and releases the
//! device.
//!
//! ## Data Path (per device callback):
//! ```text
//! device block (f32/i16/u16, N channels, device rate)
//!   → downmix to mono ─┬→ spectrum analyser (visualization only)
//!                      └→ resample to 16 kHz → PCM16 → AudioChunk → try_send
//! ```
//! The callback never blocks: when the chunk channel is full the chunk is
//! dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::audio::analyser::{SpectrumAnalyser, SpectrumFrame};
use crate::audio::codec::PcmOverflow;
use crate::audio::resample::{downmix_to_mono, LinearResampler};
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};

/// One capture interval of PCM16 LE mono samples at the capture rate.
///
/// Immutable once built; ownership moves from the capture callback to the
/// transmit buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    data: Vec<u8>,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Capture settings derived from the `[audio]` configuration section.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of the emitted PCM (16000)
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    /// FFT size of the analyser tap; 0 disables it
    pub analyser_fft_size: usize,
    pub pcm_overflow: PcmOverflow,
    /// Input device name; `None` uses the host default
    pub device_name: Option<String>,
    /// Capacity of the chunk channel to the orchestrator
    pub queue_capacity: usize,
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.capture_sample_rate,
            echo_cancellation: config.echo_cancellation,
            analyser_fft_size: config.analyser_fft_size,
            pcm_overflow: config.pcm_overflow,
            device_name: config.input_device.clone(),
            queue_capacity: config.capture_queue_capacity,
        }
    }
}

/// Device parameters the capture thread ended up with.
#[derive(Debug, Clone)]
pub struct CaptureInfo {
    pub device_name: String,
    pub device_sample_rate: u32,
    pub device_channels: u16,
    pub sample_format: SampleFormat,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    chunks_emitted: AtomicU64,
    chunks_dropped: AtomicU64,
}

struct CaptureWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct CapturePipeline {
    config: CaptureConfig,
    chunk_tx: mpsc::Sender<AudioChunk>,
    spectrum: Arc<watch::Sender<SpectrumFrame>>,
    counters: Arc<CaptureCounters>,
    worker: Option<CaptureWorker>,
}

impl CapturePipeline {
    /// Create a stopped pipeline and the receiving end of its chunk channel.
    pub fn new(config: CaptureConfig) -> (Self, mpsc::Receiver<AudioChunk>) {
        let (chunk_tx, chunk_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (spectrum_tx, _) = watch::channel(SpectrumFrame::default());
        let pipeline = Self {
            config,
            chunk_tx,
            spectrum: Arc::new(spectrum_tx),
            counters: Arc::new(CaptureCounters::default()),
            worker: None,
        };
        (pipeline, chunk_rx)
    }

    /// Open the input device and start emitting chunks.
    ///
    /// ## Errors:
    /// `AppError::Device` when the device is missing, busy, or refuses every
    /// stream configuration. Nothing stays acquired on failure.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.worker.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        if self.config.echo_cancellation {
            // cpal has no AEC switch; platform input processing applies if enabled
            debug!("Echo cancellation requested, relying on the platform input chain");
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();
        let processor = CaptureProcessor::new(
            self.chunk_tx.clone(),
            self.counters.clone(),
            self.config.pcm_overflow,
            self.config.sample_rate,
            self.analyser(),
        );
        let device_name = self.config.device_name.clone();
        let target_rate = self.config.sample_rate;

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(device_name, target_rate, processor, ready_tx, stop_rx))
            .map_err(|e| AppError::Internal(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(info)) => {
                info!(
                    device = %info.device_name,
                    device_rate = info.device_sample_rate,
                    device_channels = info.device_channels,
                    format = ?info.sample_format,
                    target_rate,
                    "Audio capture started"
                );
                self.worker = Some(CaptureWorker { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                error!(error = %e, "Failed to start audio capture");
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::Internal("Capture thread exited before reporting".to_string()))
            }
        }
    }

    /// Stop capturing and release the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            warn!("Capture thread panicked during shutdown");
        }
        info!(
            emitted = self.counters.chunks_emitted.load(Ordering::Relaxed),
            dropped = self.counters.chunks_dropped.load(Ordering::Relaxed),
            "Audio capture stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Latest analyser frames. Stays valid across restarts.
    pub fn spectrum(&self) -> watch::Receiver<SpectrumFrame> {
        self.spectrum.subscribe()
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.counters.chunks_emitted.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.counters.chunks_dropped.load(Ordering::Relaxed)
    }

    fn analyser(&self) -> Option<SpectrumAnalyser> {
        (self.config.analyser_fft_size > 0)
            .then(|| SpectrumAnalyser::with_publisher(self.config.analyser_fft_size, self.spectrum.clone()))
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The part of the pipeline that runs inside the device callback.
struct CaptureProcessor {
    chunk_tx: mpsc::Sender<AudioChunk>,
    counters: Arc<CaptureCounters>,
    overflow: PcmOverflow,
    target_rate: u32,
    channels: usize,
    resampler: LinearResampler,
    analyser: Option<SpectrumAnalyser>,
}

impl CaptureProcessor {
    fn new(
        chunk_tx: mpsc::Sender<AudioChunk>,
        counters: Arc<CaptureCounters>,
        overflow: PcmOverflow,
        target_rate: u32,
        analyser: Option<SpectrumAnalyser>,
    ) -> Self {
        Self {
            chunk_tx,
            counters,
            overflow,
            target_rate,
            channels: 1,
            resampler: LinearResampler::new(target_rate, target_rate),
            analyser,
        }
    }

    /// Adapt to the format the device was actually opened with.
    fn configure(&mut self, device_rate: u32, channels: u16) {
        self.channels = channels.max(1) as usize;
        self.resampler = LinearResampler::new(device_rate, self.target_rate);
    }

    fn process(&mut self, data: &[f32]) {
        let mono = downmix_to_mono(data, self.channels);
        if let Some(analyser) = self.analyser.as_mut() {
            analyser.push(&mono);
        }

        let resampled = self.resampler.process(&mono);
        if resampled.is_empty() {
            return;
        }

        let chunk = AudioChunk::new(self.overflow.encode(&resampled));
        match self.chunk_tx.try_send(chunk) {
            Ok(()) => {
                self.counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn run_capture_thread(
    device_name: Option<String>,
    target_rate: u32,
    processor: CaptureProcessor,
    ready: oneshot::Sender<AppResult<CaptureInfo>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let stream = match open_input_stream(device_name.as_deref(), target_rate, processor) {
        Ok((stream, info)) => {
            if ready.send(Ok(info)).is_err() {
                // start() was cancelled; release the device right away
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Park until stop() or the pipeline is dropped
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Capture stream released");
}

fn open_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    mut processor: CaptureProcessor,
) -> AppResult<(cpal::Stream, CaptureInfo)> {
    let host = cpal::default_host();
    let device = select_input_device(&host, device_name)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = choose_input_config(&device, target_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();
    processor.configure(stream_config.sample_rate.0, stream_config.channels);

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, processor)?,
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, processor)?,
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, processor)?,
        other => {
            return Err(AppError::Device(format!("Unsupported input sample format: {:?}", other)));
        }
    };
    stream.play()?;

    let info = CaptureInfo {
        device_name: name,
        device_sample_rate: stream_config.sample_rate.0,
        device_channels: stream_config.channels,
        sample_format,
    };
    Ok((stream, info))
}

fn select_input_device(host: &cpal::Host, name: Option<&str>) -> AppResult<cpal::Device> {
    match name {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AppError::Device(format!("Input device '{}' not found", wanted))),
        None => host
            .default_input_device()
            .ok_or_else(|| AppError::Device("No input device available".to_string())),
    }
}

/// Prefer a mono config that can run at the target rate; otherwise take the
/// device default and resample.
fn choose_input_config(device: &cpal::Device, target_rate: u32) -> AppResult<cpal::SupportedStreamConfig> {
    let rate = cpal::SampleRate(target_rate);
    if let Ok(ranges) = device.supported_input_configs() {
        let exact = ranges
            .filter(|r| r.channels() == 1)
            .filter(|r| is_supported_format(r.sample_format()))
            .find(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate());
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(rate));
        }
    }
    debug!(target_rate, "No native mono config at target rate, using device default");
    Ok(device.default_input_config()?)
}

fn is_supported_format(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut processor: CaptureProcessor,
) -> AppResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            processor.process(&scratch);
        },
        |err| error!(error = %err, "Audio capture stream error"),
        None,
    )?;
    Ok(stream)
}
