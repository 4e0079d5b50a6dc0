//! Output device abstraction over CPAL.
//!
//! The engine renders interleaved `f32` at the source's channel count; this
//! layer owns everything device-shaped: stream construction, start/stop,
//! master volume, channel mapping (mono↔stereo, best-effort otherwise) and
//! conversion to the device sample format.
//!
//! Opening is two-phase: [`PendingOutput::configure`] picks the device and
//! stream config so the caller can size buffers against the real callback
//! quota, then [`PendingOutput::open`] builds the stream around the render
//! closure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cpal::traits::DeviceTrait;
use cpal::traits::StreamTrait;

use crate::device;
use crate::error::{Result, StreamError};
use crate::state::DEFAULT_CALLBACK_QUOTA;

/// Stream parameters requested from the device, taken from the source.
#[derive(Clone, Copy, Debug)]
pub struct OutputSpec {
    pub channels: usize,
    pub sample_rate: u32,
}

/// A selected device + config, before the stream exists.
pub struct PendingOutput {
    device: cpal::Device,
    supported: cpal::SupportedStreamConfig,
    stream_config: cpal::StreamConfig,
    channels_in: usize,
}

impl PendingOutput {
    /// Pick an output device (default, or by substring match) and the best
    /// config for the requested rate.
    pub fn configure(spec: &OutputSpec, device_hint: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, device_hint)
            .map_err(|e| StreamError::Init(format!("{e:#}")))?;
        let supported = device::pick_output_config(&device, spec.sample_rate)
            .map_err(|e| StreamError::Init(format!("{e:#}")))?;

        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buf) = device::pick_buffer_size(&supported) {
            stream_config.buffer_size = buf;
        }

        Ok(Self {
            device,
            supported,
            stream_config,
            channels_in: spec.channels,
        })
    }

    /// The rate the device will actually run at.
    pub fn sample_rate(&self) -> u32 {
        self.stream_config.sample_rate
    }

    /// Upper bound on frames requested per callback invocation.
    pub fn max_callback_frames(&self) -> usize {
        match self.stream_config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames as usize,
            cpal::BufferSize::Default => DEFAULT_CALLBACK_QUOTA,
        }
    }

    /// Build the output stream. `render` fills interleaved `f32` frames at
    /// the source channel count; it is invoked from the device's audio
    /// thread with at most [`PendingOutput::max_callback_frames`] frames
    /// per call.
    pub fn open(self, render: impl FnMut(&mut [f32]) + Send + 'static) -> Result<OutputDevice> {
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let name = self.device.description().ok().map(|d| d.to_string());
        let quota = self.max_callback_frames();

        let stream = match self.supported.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(
                &self.device,
                &self.stream_config,
                self.channels_in,
                quota,
                volume.clone(),
                render,
            ),
            cpal::SampleFormat::I16 => build_stream::<i16>(
                &self.device,
                &self.stream_config,
                self.channels_in,
                quota,
                volume.clone(),
                render,
            ),
            cpal::SampleFormat::I32 => build_stream::<i32>(
                &self.device,
                &self.stream_config,
                self.channels_in,
                quota,
                volume.clone(),
                render,
            ),
            cpal::SampleFormat::U16 => build_stream::<u16>(
                &self.device,
                &self.stream_config,
                self.channels_in,
                quota,
                volume.clone(),
                render,
            ),
            other => Err(StreamError::Init(format!(
                "unsupported sample format: {other:?}"
            ))),
        }?;

        Ok(OutputDevice {
            stream,
            volume,
            sample_rate: self.stream_config.sample_rate,
            quota,
            name,
        })
    }
}

/// An open output stream plus its controls.
///
/// Dropping the device tears the stream down; no further callbacks run
/// after the drop returns.
pub struct OutputDevice {
    stream: cpal::Stream,
    volume: Arc<AtomicU32>,
    sample_rate: u32,
    quota: usize,
    name: Option<String>,
}

impl OutputDevice {
    /// Start the device's render thread.
    pub fn start(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| StreamError::Device(format!("start: {e}")))
    }

    /// Stop the device's render thread. Control context only.
    pub fn stop(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| StreamError::Device(format!("stop: {e}")))
    }

    /// Master volume. Applied by this layer when writing device buffers;
    /// the range is not clamped.
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn get_volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn max_callback_frames(&self) -> usize {
        self.quota
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Type-specialized stream builder.
///
/// The callback pulls frames from `render` through a pre-sized `f32`
/// staging buffer (chunked by `quota`, so an oversized device request
/// still never allocates), applies the master volume, maps channels, and
/// converts to the device format.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels_in: usize,
    quota: usize,
    volume: Arc<AtomicU32>,
    mut render: impl FnMut(&mut [f32]) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let mut staging = vec![0.0f32; quota.max(1) * channels_in];

    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / channels_out;
                let gain = f32::from_bits(volume.load(Ordering::Relaxed));

                let mut done = 0usize;
                while done < frames {
                    let chunk = (frames - done).min(quota);
                    let buf = &mut staging[..chunk * channels_in];
                    render(buf);
                    write_mapped(
                        buf,
                        channels_in,
                        &mut data[done * channels_out..(done + chunk) * channels_out],
                        channels_out,
                        gain,
                    );
                    done += chunk;
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| StreamError::Init(format!("build output stream: {e}")))?;

    Ok(stream)
}

/// Write one staging chunk into the device buffer: gain, channel mapping,
/// format conversion.
fn write_mapped<T>(src: &[f32], channels_in: usize, dst: &mut [T], channels_out: usize, gain: f32)
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let frames = dst.len() / channels_out;
    for frame in 0..frames {
        for ch in 0..channels_out {
            let sample = mapped_sample(src, channels_in, frame, ch, channels_out) * gain;
            dst[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
        }
    }
}

/// Channel mapping rules:
/// - same layout: pass-through
/// - mono → anything: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
fn mapped_sample(
    src: &[f32],
    channels_in: usize,
    frame: usize,
    dst_ch: usize,
    channels_out: usize,
) -> f32 {
    let base = frame * channels_in;
    let get = |ch: usize| src.get(base + ch).copied().unwrap_or(0.0);

    match (channels_in, channels_out) {
        (i, o) if i == o => get(dst_ch),
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        _ => get(dst_ch.min(channels_in.saturating_sub(1))),
    }
}
