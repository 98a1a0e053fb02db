//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. The callback
//! therefore only mixes down to mono and pushes into the SPSC ring producer,
//! whose `push_slice` is wait-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. `MicCapture` must be created
//! and dropped on the same OS thread; the capture manager does both inside
//! one `spawn_blocking` closure.

pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    buffering::{AudioProducer, Producer},
    error::{BanterError, Result},
};
use tracing::{error, info, warn};

/// How the capture device is picked (spec: by index or default).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// System default input device.
    #[default]
    Default,
    /// Input device at this enumeration index.
    Index(usize),
    /// Input device with this exact name.
    Name(String),
}

/// Handle to an active microphone stream.
///
/// **Not `Send`** — bound to the OS thread that created it.
pub struct MicCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl MicCapture {
    /// Open an input device and push mono f32 frames into `producer`.
    ///
    /// Must be called from the thread that will also drop this value —
    /// in practice, inside `tokio::task::spawn_blocking`.
    ///
    /// # Errors
    /// `BanterError::NoDefaultInputDevice` when no microphone is available,
    /// `BanterError::AudioDevice` when the selector matches nothing, or
    /// `BanterError::AudioStream` if cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        selector: &DeviceSelector,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = match selector {
            DeviceSelector::Default => host
                .default_input_device()
                .ok_or(BanterError::NoDefaultInputDevice)?,
            DeviceSelector::Index(idx) => host
                .input_devices()
                .map_err(|e| BanterError::AudioDevice(e.to_string()))?
                .nth(*idx)
                .ok_or_else(|| {
                    BanterError::AudioDevice(format!("no input device at index {idx}"))
                })?,
            DeviceSelector::Name(wanted) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| BanterError::AudioDevice(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                    .ok_or_else(|| {
                        BanterError::AudioDevice(format!("no input device named `{wanted}`"))
                    })?
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".into());
        info!(device = device_name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| BanterError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            push_frames(&mut producer, data);
                            return;
                        }
                        mixdown(data, ch, &mut mix_buf, |s| s);
                        push_frames(&mut producer, &mix_buf);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        mixdown(data, ch, &mut mix_buf, |s| f32::from(s) / 32768.0);
                        push_frames(&mut producer, &mix_buf);
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(BanterError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| BanterError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| BanterError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stop: the callback no-ops from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl MicCapture {
    pub fn open(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _selector: &DeviceSelector,
    ) -> Result<Self> {
        Err(BanterError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Average interleaved channels into the reusable mono scratch buffer.
#[cfg(feature = "audio-cpal")]
fn mixdown<S: Copy>(data: &[S], channels: usize, mono: &mut Vec<f32>, to_f32: impl Fn(S) -> f32) {
    let frames = data.len() / channels;
    mono.resize(frames, 0.0);
    for f in 0..frames {
        let base = f * channels;
        let mut sum = 0f32;
        for c in 0..channels {
            sum += to_f32(data[base + c]);
        }
        mono[f] = sum / channels as f32;
    }
}

#[cfg(feature = "audio-cpal")]
fn push_frames(producer: &mut AudioProducer, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!("capture ring full: dropped {} frames", samples.len() - written);
    }
}

/// List input device names in enumeration order (index == selector index).
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, d)| d.name().unwrap_or_else(|_| format!("Input Device {idx}")))
            .collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<String> {
    Vec::new()
}
