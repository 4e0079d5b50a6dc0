//! Playback controller.
//!
//! [`Playback`] drives one stream through its lifecycle:
//!
//! ```text
//! UNLOADED → LOADED → READY → ACTIVE ⇄ STOPPED → TERMINATED
//! ```
//!
//! All operations run on the control context. The render context (the
//! device's audio thread) only ever sees the shared [`StreamState`] and the
//! decoder it owns; coordination happens through atomic flags and the
//! swapped speed stage, never through locks the audio thread would have to
//! wait on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::decode::{AudioDecoder, PcmSource};
use crate::error::{Result, StreamError};
use crate::output::{OutputDevice, OutputSpec, PendingOutput};
use crate::render::Renderer;
use crate::state::{SpeedStage, StreamState};

/// Lifecycle position, derived from the shared flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    Unloaded,
    Loaded,
    Ready,
    Active,
    Stopped,
}

#[derive(Clone, Debug)]
struct SourceInfo {
    path: PathBuf,
    channels: usize,
    sample_rate: u32,
    total_frames: Option<u64>,
}

/// One playback stream: a decoded source wired to an output device.
pub struct Playback {
    shared: Arc<StreamState>,
    /// Held between `load` and `initialize_stream`; afterwards the decoder
    /// lives inside the render closure.
    decoder: Option<AudioDecoder>,
    source: Option<SourceInfo>,
    output: Option<OutputDevice>,
    device_hint: Option<String>,
    /// Mirror of the last known device volume.
    volume: f32,
    started: bool,
}

impl Playback {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StreamState::new()),
            decoder: None,
            source: None,
            output: None,
            device_hint: None,
            volume: 1.0,
            started: false,
        }
    }

    /// Restrict device selection to names containing `needle`. Takes
    /// effect at the next `initialize_stream`.
    pub fn select_device(&mut self, needle: Option<String>) {
        self.device_hint = needle;
    }

    /// Open `path` and record its stream parameters for the device config.
    ///
    /// Fails with [`StreamError::Load`] and leaves the state untouched if
    /// the file cannot be opened or probed. Loading over an already-loaded
    /// (but not yet initialized) source replaces it.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.shared.is_ready() {
            return Err(StreamError::Init(
                "stream already initialized; terminate it before loading".into(),
            ));
        }

        let path = path.as_ref();
        let decoder = AudioDecoder::open(path)?;
        tracing::info!(
            path = %path.display(),
            channels = decoder.channels(),
            rate_hz = decoder.sample_rate(),
            frames = ?decoder.total_frames(),
            "source loaded"
        );

        self.source = Some(SourceInfo {
            path: path.to_path_buf(),
            channels: decoder.channels(),
            sample_rate: decoder.sample_rate(),
            total_frames: decoder.total_frames(),
        });
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Open the output device and wire the render callback: `LOADED → READY`.
    ///
    /// A speed stage is installed when the playback speed is not 1.0 or the
    /// device cannot run at the source's native rate. Any failure unwinds
    /// to `LOADED`: device, stage and callback come up together or not at
    /// all.
    pub fn initialize_stream(&mut self) -> Result<()> {
        if self.shared.is_ready() {
            return Err(StreamError::Init("stream already initialized".into()));
        }
        let source = self
            .source
            .clone()
            .ok_or_else(|| StreamError::Init("no source loaded".into()))?;

        let spec = OutputSpec {
            channels: source.channels,
            sample_rate: source.sample_rate,
        };
        let pending = PendingOutput::configure(&spec, self.device_hint.as_deref())?;
        let out_rate = pending.sample_rate();

        let speed = self.shared.speed();
        if speed != 1.0 || out_rate != source.sample_rate {
            let stage = match SpeedStage::new(
                source.channels,
                source.sample_rate,
                out_rate,
                speed,
                pending.max_callback_frames(),
            ) {
                Ok(stage) => stage,
                Err(e) => {
                    let _ = self.shared.install_speed_stage(None);
                    return Err(e);
                }
            };
            let _ = self.shared.install_speed_stage(Some(stage));
        }

        let decoder = match self.decoder.take() {
            Some(decoder) => decoder,
            None => {
                let _ = self.shared.install_speed_stage(None);
                return Err(StreamError::Init("no source loaded".into()));
            }
        };
        let mut renderer = Renderer::new(decoder, self.shared.clone());
        let output = match pending.open(move |buf| renderer.render(buf)) {
            Ok(output) => output,
            Err(e) => {
                let _ = self.shared.install_speed_stage(None);
                self.reload_after_failed_open();
                return Err(e);
            }
        };

        output.set_volume(self.volume);
        tracing::info!(
            device = output.name().unwrap_or("<unknown>"),
            out_rate_hz = out_rate,
            resampling = self.shared.has_speed_stage(),
            "stream ready"
        );

        self.output = Some(output);
        self.shared.set_ready(true);
        Ok(())
    }

    /// The decoder moved into a render closure that failed to come up;
    /// reopen it from the retained path so the source stays loaded.
    fn reload_after_failed_open(&mut self) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        match AudioDecoder::open(&source.path) {
            Ok(decoder) => self.decoder = Some(decoder),
            Err(e) => {
                tracing::warn!(
                    path = %source.path.display(),
                    "could not reopen source after failed stream open: {e}"
                );
                self.source = None;
            }
        }
    }

    /// Start (or restart) the device: `READY|STOPPED → ACTIVE`.
    pub fn start(&mut self) -> Result<()> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| StreamError::Init("stream not initialized".into()))?;
        output.start()?;
        self.shared.clear_ended();
        self.shared.set_active(true);
        self.started = true;
        Ok(())
    }

    /// Stop the device: `ACTIVE → STOPPED`. Control context only; the
    /// render callback never calls this.
    pub fn stop(&mut self) -> Result<()> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| StreamError::Init("stream not initialized".into()))?;
        output.stop()?;
        self.shared.set_active(false);
        Ok(())
    }

    /// Request a reposition to `frame`. The decoder seek itself is
    /// deferred to the render callback so it lands exactly on the next
    /// buffer boundary the callback serves.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        self.shared.request_seek(frame);
        Ok(())
    }

    /// Change playback speed.
    ///
    /// Before the stream is ready this only stores the value. Afterwards
    /// it rebuilds (or removes) the speed stage: the replacement is fully
    /// built first and swapped in whole, so a concurrent render cycle sees
    /// either the old stage or the new one, never a partial state.
    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        if !(speed > 0.0) {
            return Err(StreamError::InvalidArgument(format!(
                "playback speed must be > 0 (got {speed})"
            )));
        }

        self.shared.store_speed(speed);
        if !self.shared.is_ready() {
            return Ok(());
        }

        let source = self
            .source
            .clone()
            .ok_or_else(|| StreamError::Init("no source loaded".into()))?;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| StreamError::Init("stream not initialized".into()))?;
        let out_rate = output.sample_rate();

        if speed == 1.0 && out_rate == source.sample_rate {
            let old = self.shared.install_speed_stage(None);
            drop(old);
            return Ok(());
        }

        match SpeedStage::new(
            source.channels,
            source.sample_rate,
            out_rate,
            speed,
            output.max_callback_frames(),
        ) {
            Ok(stage) => {
                let old = self.shared.install_speed_stage(Some(stage));
                drop(old);
                Ok(())
            }
            Err(e) => {
                // Stage setup failed: disable the speed path entirely
                // rather than leave a stage built for another speed.
                let old = self.shared.install_speed_stage(None);
                drop(old);
                Err(e)
            }
        }
    }

    pub fn speed(&self) -> f32 {
        self.shared.speed()
    }

    /// Pass volume through to the device, mirroring the value locally.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume;
        if let Some(output) = &self.output {
            output.set_volume(volume);
        }
        Ok(())
    }

    /// Last known device volume.
    pub fn get_volume(&mut self) -> f32 {
        if let Some(output) = &self.output {
            self.volume = output.get_volume();
        }
        self.volume
    }

    pub fn set_looping(&mut self, loops: bool) {
        self.shared.set_loops_at_end(loops);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.loops_at_end()
    }

    /// True once the render callback reached end of stream with looping
    /// off. Cleared by `start` and `terminate`.
    pub fn has_ended_naturally(&self) -> bool {
        self.shared.ended_naturally()
    }

    /// Current decode position, in source frames.
    pub fn position_frames(&self) -> u64 {
        self.shared.frame_offset()
    }

    /// Source length in frames, when the container reports it.
    pub fn duration_frames(&self) -> Option<u64> {
        self.source.as_ref()?.total_frames
    }

    /// Source sample rate, once loaded.
    pub fn sample_rate(&self) -> Option<u32> {
        self.source.as_ref().map(|s| s.sample_rate)
    }

    pub fn channels(&self) -> Option<usize> {
        self.source.as_ref().map(|s| s.channels)
    }

    pub fn status(&self) -> PlaybackStatus {
        if self.output.is_some() {
            if self.shared.is_active() {
                PlaybackStatus::Active
            } else if self.started {
                PlaybackStatus::Stopped
            } else {
                PlaybackStatus::Ready
            }
        } else if self.source.is_some() {
            PlaybackStatus::Loaded
        } else {
            PlaybackStatus::Unloaded
        }
    }

    /// Tear everything down and return to the initial state.
    ///
    /// Stops the device first (no further render callbacks), which also
    /// releases the decoder owned by the render closure, then frees the
    /// speed stage and resets all shared flags and offsets. Idempotent:
    /// safe to call from any state, any number of times.
    pub fn terminate(&mut self) -> Result<()> {
        if let Some(output) = self.output.take() {
            let _ = output.stop();
            drop(output);
        }
        self.decoder = None;
        self.source = None;
        let _ = self.shared.install_speed_stage(None);
        self.shared.reset();
        self.volume = 1.0;
        self.started = false;
        tracing::debug!("stream terminated");
        Ok(())
    }
}

impl Default for Playback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stream_is_unloaded() {
        let p = Playback::new();
        assert_eq!(p.status(), PlaybackStatus::Unloaded);
        assert_eq!(p.speed(), 1.0);
        assert!(!p.is_looping());
        assert!(!p.has_ended_naturally());
    }

    #[test]
    fn load_missing_file_keeps_state_unloaded() {
        let mut p = Playback::new();
        let err = p.load("/no/such/file.flac").unwrap_err();
        assert!(matches!(err, StreamError::Load(_)));
        assert_eq!(p.status(), PlaybackStatus::Unloaded);
    }

    #[test]
    fn initialize_without_load_is_an_init_error() {
        let mut p = Playback::new();
        let err = p.initialize_stream().unwrap_err();
        assert!(matches!(err, StreamError::Init(_)));
    }

    #[test]
    fn start_and_stop_require_an_initialized_stream() {
        let mut p = Playback::new();
        assert!(matches!(p.start(), Err(StreamError::Init(_))));
        assert!(matches!(p.stop(), Err(StreamError::Init(_))));
    }

    #[test]
    fn set_speed_rejects_nonpositive_values() {
        let mut p = Playback::new();
        for bad in [0.0f32, -1.0, f32::NAN] {
            let err = p.set_speed(bad).unwrap_err();
            assert!(matches!(err, StreamError::InvalidArgument(_)), "speed {bad}");
        }
        assert_eq!(p.speed(), 1.0, "rejected values leave the speed unchanged");
    }

    #[test]
    fn set_speed_before_ready_only_stores_the_value() {
        let mut p = Playback::new();
        p.set_speed(2.0).unwrap();
        assert_eq!(p.speed(), 2.0);
        assert!(!p.shared.has_speed_stage(), "no stage without a device");
    }

    #[test]
    fn seek_records_a_pending_request() {
        let mut p = Playback::new();
        p.seek(42).unwrap();
        assert_eq!(p.position_frames(), 42);
        assert!(p.shared.seek_pending());
    }

    #[test]
    fn volume_mirror_survives_without_a_device() {
        let mut p = Playback::new();
        p.set_volume(0.25).unwrap();
        assert_eq!(p.get_volume(), 0.25);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut p = Playback::new();
        p.set_speed(3.0).unwrap();
        p.set_looping(true);
        p.seek(99).unwrap();

        p.terminate().unwrap();
        assert_eq!(p.status(), PlaybackStatus::Unloaded);
        assert_eq!(p.speed(), 1.0);
        assert!(!p.is_looping());
        assert_eq!(p.position_frames(), 0);

        p.terminate().unwrap();
        assert_eq!(p.status(), PlaybackStatus::Unloaded);
        assert_eq!(p.speed(), 1.0);
    }
}
