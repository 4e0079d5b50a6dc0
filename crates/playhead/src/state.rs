//! Shared playback stream state.
//!
//! [`StreamState`] is the one record touched by both execution contexts:
//! the control context (load/start/stop/seek/speed/volume operations) and
//! the render context (the output device's data callback). Fields are
//! partitioned by writer:
//!
//! - `frame_offset` is advanced by the render context during playback and
//!   overwritten by the control context only through [`StreamState::request_seek`].
//! - `frame_offset_modified` is raised by the control context and lowered
//!   by the render context when the seek is serviced.
//! - Lifecycle flags: an active stream is always a ready stream; the render
//!   context only ever lowers `stream_active` (end of stream), never the
//!   device itself.
//!
//! The speed stage (resampler + scratch buffer) is replaced as a complete
//! unit under a momentary mutex; the render context takes it with
//! `try_lock` only, so it can never block behind a control operation nor
//! observe a half-built stage.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, StreamError};
use crate::resample::LinearResampler;

/// Callback quota assumed when the device does not advertise a fixed
/// buffer size.
pub const DEFAULT_CALLBACK_QUOTA: usize = 4096;

/// Scratch capacity, in frames, for one callback's worth of input at the
/// given conversion ratio.
///
/// Worst case: the interpolator needs `quota × ratio` frames to fill one
/// callback, plus two frames to prime its history after a rebuild.
pub fn scratch_frames(quota_frames: usize, ratio: f64) -> usize {
    (quota_frames as f64 * ratio).ceil() as usize + 2
}

/// Resampler plus its scratch buffer, replaced as a single unit.
///
/// Bundling the buffer, its capacity and the speed it was sized for means
/// a speed change can never leave the read sizing and the scratch capacity
/// out of step.
pub struct SpeedStage {
    pub resampler: LinearResampler,
    pub scratch: Vec<f32>,
    /// Frame capacity of `scratch`.
    pub max_frames: usize,
    /// The playback speed this stage was built for.
    pub speed: f32,
}

impl SpeedStage {
    /// Build a stage converting `native_hz × speed` to `out_hz`.
    ///
    /// Fails with [`StreamError::OutOfMemory`] if the scratch buffer cannot
    /// be reserved; nothing is partially constructed in that case.
    pub fn new(
        channels: usize,
        native_hz: u32,
        out_hz: u32,
        speed: f32,
        quota_frames: usize,
    ) -> Result<Self> {
        let effective_in_hz = f64::from(native_hz) * f64::from(speed);
        let ratio = effective_in_hz / f64::from(out_hz);
        let max_frames = scratch_frames(quota_frames, ratio);

        let mut scratch: Vec<f32> = Vec::new();
        scratch
            .try_reserve_exact(max_frames * channels)
            .map_err(|_| StreamError::OutOfMemory)?;
        scratch.resize(max_frames * channels, 0.0);

        Ok(Self {
            resampler: LinearResampler::new(channels, effective_in_hz, out_hz),
            scratch,
            max_frames,
            speed,
        })
    }
}

/// The shared mutable record describing the current stream.
pub struct StreamState {
    frame_offset: AtomicU64,
    frame_offset_modified: AtomicBool,
    /// f32 bit pattern; default 1.0.
    playback_speed: AtomicU32,
    loops_at_end: AtomicBool,
    stream_ready: AtomicBool,
    stream_active: AtomicBool,
    ended_naturally: AtomicBool,
    pub(crate) speed_stage: Mutex<Option<SpeedStage>>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            frame_offset: AtomicU64::new(0),
            frame_offset_modified: AtomicBool::new(false),
            playback_speed: AtomicU32::new(1.0f32.to_bits()),
            loops_at_end: AtomicBool::new(false),
            stream_ready: AtomicBool::new(false),
            stream_active: AtomicBool::new(false),
            ended_naturally: AtomicBool::new(false),
            speed_stage: Mutex::new(None),
        }
    }

    // Frame offset: render context advances, control context seeks.

    pub fn frame_offset(&self) -> u64 {
        self.frame_offset.load(Ordering::Acquire)
    }

    pub fn advance_frame_offset(&self, frames: u64) {
        self.frame_offset.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn store_frame_offset(&self, frame: u64) {
        self.frame_offset.store(frame, Ordering::Release);
    }

    /// Record a seek request for the render context to service before its
    /// next read. A second request before the first is serviced simply
    /// overwrites the target; the flag stays raised.
    pub fn request_seek(&self, frame: u64) {
        self.frame_offset.store(frame, Ordering::Release);
        self.frame_offset_modified.store(true, Ordering::Release);
    }

    /// Take a pending seek request, lowering the flag.
    ///
    /// The flag is lowered before the target is read: a request arriving in
    /// between re-raises the flag, and the next callback re-seeks to the
    /// same (already current) target, which is harmless.
    pub fn take_seek_request(&self) -> Option<u64> {
        if self.frame_offset_modified.swap(false, Ordering::AcqRel) {
            Some(self.frame_offset.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn seek_pending(&self) -> bool {
        self.frame_offset_modified.load(Ordering::Acquire)
    }

    // Playback settings.

    pub fn speed(&self) -> f32 {
        f32::from_bits(self.playback_speed.load(Ordering::Relaxed))
    }

    pub fn store_speed(&self, speed: f32) {
        self.playback_speed.store(speed.to_bits(), Ordering::Relaxed);
    }

    pub fn loops_at_end(&self) -> bool {
        self.loops_at_end.load(Ordering::Relaxed)
    }

    pub fn set_loops_at_end(&self, loops: bool) {
        self.loops_at_end.store(loops, Ordering::Relaxed);
    }

    // Lifecycle flags.

    pub fn is_ready(&self) -> bool {
        self.stream_ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.stream_ready.store(ready, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.stream_active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::Release);
    }

    pub fn ended_naturally(&self) -> bool {
        self.ended_naturally.load(Ordering::Acquire)
    }

    pub fn clear_ended(&self) {
        self.ended_naturally.store(false, Ordering::Release);
    }

    /// End-of-stream signal from the render context: deactivate and mark
    /// the natural end, exactly once per active run. Never touches the
    /// device; stopping it is the control context's job.
    pub fn finish_naturally(&self) {
        if self.stream_active.swap(false, Ordering::AcqRel) {
            self.ended_naturally.store(true, Ordering::Release);
        }
    }

    /// Swap in a new speed stage (or none), returning the old one.
    ///
    /// The replacement is fully built before this is called, so the render
    /// context observes either the old stage, the new stage, or (for the
    /// duration of the swap itself) a held lock, which it answers with one
    /// silent period. The old stage is dropped by the caller after the lock
    /// is released.
    #[must_use = "drop the previous stage after the lock is released"]
    pub fn install_speed_stage(&self, stage: Option<SpeedStage>) -> Option<SpeedStage> {
        let mut guard = self.speed_stage.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, stage)
    }

    pub fn has_speed_stage(&self) -> bool {
        self.speed_stage
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Reset every field to its initial value. Used by termination, after
    /// the device has stopped invoking the render callback.
    pub fn reset(&self) {
        self.frame_offset.store(0, Ordering::Release);
        self.frame_offset_modified.store(false, Ordering::Release);
        self.playback_speed.store(1.0f32.to_bits(), Ordering::Relaxed);
        self.loops_at_end.store(false, Ordering::Relaxed);
        self.stream_ready.store(false, Ordering::Release);
        self.stream_active.store(false, Ordering::Release);
        self.ended_naturally.store(false, Ordering::Release);
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
