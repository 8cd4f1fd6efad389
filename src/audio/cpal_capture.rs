//! cpal-based audio capture
//!
//! Uses the cpal crate for cross-platform audio input. Works with
//! PipeWire, PulseAudio, and ALSA backends.
//!
//! cpal::Stream is not Send, so the stream lives on a dedicated thread.
//! The audio callback converts to mono at the target rate and hands raw
//! chunks to that thread over an unbounded std channel (the callback must
//! never block); the thread runs framing, VAD, pre-roll, and the level
//! meter, and forwards events to the engine over a bounded tokio channel.
//!
//! Backpressure policy: Frame events block in 5 ms slices up to
//! `send_timeout_ms` before being counted as lost (dropped audio is a
//! correctness regression and is logged at error level). Level events are
//! disposable and are dropped silently when the queue is full.

use super::level::LevelMeter;
use super::vad::{EnergyVad, PrerollBuffer};
use super::{AudioCapture, AudioFrame, CaptureEvent};
use crate::config::AudioConfig;
use crate::error::AudioError;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Commands sent to the audio capture thread
enum CaptureCommand {
    Stop(oneshot::Sender<()>),
}

/// cpal-based audio capture implementation
pub struct CpalCapture {
    config: AudioConfig,
    cmd_tx: Option<std::sync::mpsc::Sender<CaptureCommand>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Result<Self, AudioError> {
        Ok(Self {
            config: config.clone(),
            cmd_tx: None,
            thread_handle: None,
        })
    }
}

/// Find an audio input device by name with flexible matching:
/// exact, then case-insensitive, then substring (case-insensitive).
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| AudioError::Stream(e.to_string()))?
        .collect();

    let search_lower = device_name.to_lowercase();

    let mut exact = None;
    let mut case_insensitive = None;
    let mut substring = None;

    for (idx, device) in devices.iter().enumerate() {
        let Ok(name) = device.name() else { continue };
        if name == device_name {
            exact = Some(idx);
            break;
        }
        if case_insensitive.is_none() && name.to_lowercase() == search_lower {
            case_insensitive = Some(idx);
        }
        if substring.is_none() && name.to_lowercase().contains(&search_lower) {
            substring = Some(idx);
        }
    }

    if let Some(idx) = exact.or(case_insensitive).or(substring) {
        let mut devices = devices;
        let device = devices.swap_remove(idx);
        tracing::debug!(
            "Matched audio device: {} (searched for: {})",
            device.name().unwrap_or_else(|_| "unknown".into()),
            device_name
        );
        return Ok(device);
    }

    Err(AudioError::DeviceNotFound(device_name.to_string()))
}

/// Framing, VAD, pre-roll, and level logic, separated from cpal plumbing
/// so it can be tested deterministically.
pub(crate) struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
    seq: u64,
    vad: EnergyVad,
    preroll: PrerollBuffer,
    level: LevelMeter,
}

impl Framer {
    pub(crate) fn new(config: &AudioConfig) -> Self {
        let frame_size =
            ((config.sample_rate as usize * config.frame_ms as usize) / 1000).max(1);
        Self {
            frame_size,
            pending: Vec::new(),
            seq: 0,
            vad: EnergyVad::new(&config.vad, config.frame_ms),
            preroll: PrerollBuffer::new(config.preroll_ms, config.sample_rate),
            level: LevelMeter::new(config.level_interval_ms, config.sample_rate),
        }
    }

    /// Process one chunk of mono samples at the target rate and produce
    /// the events it completes.
    pub(crate) fn process(&mut self, chunk: &[f32]) -> Vec<CaptureEvent> {
        let mut events: Vec<CaptureEvent> = self
            .level
            .push(chunk)
            .into_iter()
            .map(CaptureEvent::Level)
            .collect();

        self.pending.extend_from_slice(chunk);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();

            if self.vad.has_triggered() {
                events.push(CaptureEvent::Frame(self.next_frame(frame)));
            } else if self.vad.push(&frame) {
                events.push(CaptureEvent::SpeechStarted);
                // Prepend the pre-roll so onset lag does not clip speech,
                // then the triggering frame itself.
                let preroll = self.preroll.drain();
                for chunk in preroll.chunks(self.frame_size) {
                    events.push(CaptureEvent::Frame(self.next_frame(chunk.to_vec())));
                }
                events.push(CaptureEvent::Frame(self.next_frame(frame)));
            } else {
                self.preroll.push(&frame);
            }
        }

        events
    }

    fn next_frame(&mut self, samples: Vec<f32>) -> AudioFrame {
        let frame = AudioFrame {
            seq: self.seq,
            samples,
            captured_at: Instant::now(),
        };
        self.seq += 1;
        frame
    }
}

#[async_trait::async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();

        let device = if self.config.device == "default" {
            host.default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("default".to_string()))?
        } else {
            find_audio_device(&host, &self.config.device)?
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Using audio device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceBusy(device_name.clone(), e.to_string()))?;

        let source_sample_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let target_sample_rate = self.config.sample_rate;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}",
            source_sample_rate,
            source_channels,
            sample_format
        );

        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<CaptureCommand>();
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Vec<f32>>();

        let capture_config = self.config.clone();

        let thread_handle = thread::spawn(move || {
            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| tracing::error!("Audio stream error: {}", err);

            let params = StreamBuildParams {
                raw_tx,
                source_rate: source_sample_rate,
                target_rate: target_sample_rate,
                source_channels,
            };

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => {
                    build_stream::<f32>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::I16 => {
                    build_stream::<i16>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::U16 => {
                    build_stream::<u16>(&device, &stream_config, params, err_fn)
                }
                format => {
                    tracing::error!("Unsupported sample format: {:?}", format);
                    return;
                }
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to build audio stream: {}", e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!("Failed to start audio stream: {}", e);
                return;
            }

            tracing::debug!("Audio capture thread started");

            let mut framer = Framer::new(&capture_config);
            let send_timeout = Duration::from_millis(capture_config.send_timeout_ms);
            let mut lost_frames = 0u64;

            loop {
                match cmd_rx.try_recv() {
                    Ok(CaptureCommand::Stop(ack)) => {
                        drop(stream);
                        if lost_frames > 0 {
                            tracing::error!(
                                "Capture lost {} frame(s) to hand-off timeouts",
                                lost_frames
                            );
                        }
                        let _ = ack.send(());
                        break;
                    }
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                        drop(stream);
                        break;
                    }
                    Err(std::sync::mpsc::TryRecvError::Empty) => {}
                }

                match raw_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(chunk) => {
                        for event in framer.process(&chunk) {
                            forward_event(&event_tx, event, send_timeout, &mut lost_frames);
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        drop(stream);
                        break;
                    }
                }
            }

            tracing::debug!("Audio capture thread stopped");
        });

        self.cmd_tx = Some(cmd_tx);
        self.thread_handle = Some(thread_handle);

        Ok(event_rx)
    }

    async fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if cmd_tx.send(CaptureCommand::Stop(ack_tx)).is_ok() {
                match tokio::time::timeout(Duration::from_secs(2), ack_rx).await {
                    Ok(_) => {}
                    Err(_) => return Err(AudioError::StopTimeout(2)),
                }
            }
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        tracing::debug!("Audio capture stopped");
        Ok(())
    }
}

/// Deliver one event to the engine. Frames block in short slices up to the
/// configured timeout; levels are dropped when the queue is full.
fn forward_event(
    tx: &mpsc::Sender<CaptureEvent>,
    event: CaptureEvent,
    send_timeout: Duration,
    lost_frames: &mut u64,
) {
    let is_frame = !matches!(event, CaptureEvent::Level(_));
    let mut event = event;
    let deadline = Instant::now() + send_timeout;

    loop {
        match tx.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                if !is_frame {
                    return;
                }
                if Instant::now() >= deadline {
                    *lost_frames += 1;
                    tracing::error!(
                        "Frame hand-off timed out after {} ms; frame lost",
                        send_timeout.as_millis()
                    );
                    return;
                }
                event = ev;
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Parameters for building an audio input stream
struct StreamBuildParams {
    raw_tx: std::sync::mpsc::Sender<Vec<f32>>,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
}

/// Build an input stream for a specific sample type. The callback only
/// converts and forwards; it never blocks.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamBuildParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let StreamBuildParams {
        raw_tx,
        source_rate,
        target_rate,
        source_channels,
    } = params;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Convert to f32 and mix to mono
                let mono_f32: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let resampled = if source_rate != target_rate {
                    resample(&mono_f32, source_rate, target_rate)
                } else {
                    mono_f32
                };

                // Unbounded send; the capture thread absorbs any jitter
                let _ = raw_tx.send(resampled);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    Ok(stream)
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AudioConfig {
        AudioConfig::default()
    }

    fn loud_frame(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_framer_silence_emits_no_frames() {
        let mut framer = Framer::new(&test_config());
        let events = framer.process(&vec![0.0; 16000]);
        assert!(events
            .iter()
            .all(|e| matches!(e, CaptureEvent::Level(_))));
        // 1 second of silence at 50ms cadence = 20 levels
        assert_eq!(events.len(), 20);
    }

    #[test]
    fn test_framer_speech_onset_prepends_preroll() {
        let mut framer = Framer::new(&test_config());

        // 300ms silence fills the 200ms pre-roll
        let pre_events = framer.process(&vec![0.0; 4800]);
        assert!(pre_events
            .iter()
            .all(|e| matches!(e, CaptureEvent::Level(_))));

        // Sustained speech trips the VAD (needs 60ms = 3 frames)
        let events = framer.process(&loud_frame(1600));

        let started_idx = events
            .iter()
            .position(|e| matches!(e, CaptureEvent::SpeechStarted))
            .expect("speech should be detected");

        let frames: Vec<&AudioFrame> = events
            .iter()
            .skip(started_idx)
            .filter_map(|e| match e {
                CaptureEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect();

        // 200ms pre-roll = 10 frames of 20ms, plus at least the trigger frame
        assert!(frames.len() >= 11, "got {} frames", frames.len());
        // Pre-roll content is the retained silence
        assert!(frames[0].samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_framer_sequence_is_monotonic_and_gapless() {
        let mut framer = Framer::new(&test_config());
        let mut frames = Vec::new();
        for _ in 0..10 {
            for event in framer.process(&loud_frame(1600)) {
                if let CaptureEvent::Frame(f) = event {
                    frames.push(f);
                }
            }
        }
        assert!(!frames.is_empty());
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.seq, i as u64);
        }
    }

    #[test]
    fn test_framer_no_sample_loss_after_trigger() {
        let mut framer = Framer::new(&test_config());
        let total_in = 16000;
        let mut total_out = 0usize;
        for event in framer.process(&loud_frame(total_in)) {
            if let CaptureEvent::Frame(f) = event {
                total_out += f.samples.len();
            }
        }
        // Everything from the trigger frame on is delivered; the only
        // samples not in frames are the pre-trigger frames that predate
        // the pre-roll window plus the sub-frame remainder.
        assert!(total_out > 0);
        assert!(total_out <= total_in);
        assert_eq!(total_out % 320, 0); // whole 20ms frames only
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = resample(&samples, 48000, 16000);
        assert!(result.len() >= 2 && result.len() <= 4);
    }

    #[test]
    fn test_resample_upsample() {
        let samples = vec![1.0, 2.0];
        assert_eq!(resample(&samples, 8000, 16000).len(), 4);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
    }
}
