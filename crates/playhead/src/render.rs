//! The per-buffer render routine driven by the output device.
//!
//! [`Renderer::render`] is invoked once per output period from the device's
//! audio thread and must fill its buffer completely within the period. It
//! therefore:
//!
//! - never allocates (the speed path reads into a pre-sized scratch buffer),
//! - never blocks (`try_lock` on the speed stage; a lost race against a
//!   concurrent speed change renders one silent period),
//! - never surfaces errors (any failure degrades to silence),
//! - never stops the device (end of stream only flips flags for the control
//!   context to observe; calling the device's own stop from inside its
//!   callback is unsafe on most native backends).

use std::sync::Arc;

use crate::decode::PcmSource;
use crate::state::{SpeedStage, StreamState};

/// Owns the PCM source on behalf of the audio thread and produces output
/// buffers against the shared stream state.
pub struct Renderer<S> {
    source: S,
    shared: Arc<StreamState>,
    channels: usize,
}

impl<S: PcmSource> Renderer<S> {
    pub fn new(source: S, shared: Arc<StreamState>) -> Self {
        let channels = source.channels();
        Self {
            source,
            shared,
            channels,
        }
    }

    /// Fill `out` with exactly `out.len() / channels` frames.
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = self.channels;
        let frame_count = out.len() / channels;
        if frame_count == 0 {
            return;
        }

        let source = &mut self.source;
        let shared = &self.shared;

        // Service a pending seek before reading, so the repositioning lands
        // exactly on this buffer boundary. A failed seek leaves the cursor
        // where it was and playback continues from there.
        if let Some(frame) = shared.take_seek_request() {
            let _ = source.seek_to_frame(frame);
        }

        match shared.speed_stage.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(stage) => render_resampled(source, shared, channels, stage, out, frame_count),
                None => render_direct(source, shared, channels, out, frame_count),
            },
            // A speed change is swapping the stage right now; one silent
            // period beats stalling the audio thread behind it.
            Err(_) => out.fill(0.0),
        }
    }
}

/// Normal-speed path: frames go straight from the source to the output.
fn render_direct<S: PcmSource>(
    source: &mut S,
    shared: &StreamState,
    channels: usize,
    out: &mut [f32],
    frame_count: usize,
) {
    let read = source.read_frames(out, frame_count);
    shared.advance_frame_offset(read.frames as u64);

    if read.frames < frame_count {
        out[read.frames * channels..].fill(0.0);
    }
    if read.end_of_stream {
        finish_stream(source, shared);
    }
}

/// Speed-controlled path: read ahead at the stage's ratio, interpolate down
/// (or up) to the output quota.
fn render_resampled<S: PcmSource>(
    source: &mut S,
    shared: &StreamState,
    channels: usize,
    stage: &mut SpeedStage,
    out: &mut [f32],
    frame_count: usize,
) {
    let needed = stage.resampler.input_frames_needed(frame_count);
    // Capacity covers `needed` by construction; the clamp is a guard.
    let to_read = needed.min(stage.max_frames);

    let read = source.read_frames(&mut stage.scratch[..to_read * channels], to_read);
    if read.frames > 0 {
        let (consumed, produced) = stage
            .resampler
            .process(&stage.scratch[..read.frames * channels], out);
        shared.advance_frame_offset(consumed as u64);

        if produced < frame_count {
            out[produced * channels..].fill(0.0);
        }
    } else {
        out.fill(0.0);
    }

    if read.end_of_stream {
        finish_stream(source, shared);
    }
}

/// End-of-stream: rewind when looping, otherwise flag the natural end for
/// the control context. Never stops the device.
fn finish_stream<S: PcmSource>(source: &mut S, shared: &StreamState) {
    if shared.loops_at_end() {
        if source.seek_to_frame(0).is_ok() {
            shared.store_frame_offset(0);
        }
    } else {
        shared.finish_naturally();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::FrameRead;
    use crate::error::Result;
    use crate::state::SpeedStage;

    /// Deterministic source: frame `i` holds the value `i` on every
    /// channel. Records the seeks it is asked to perform.
    struct StubSource {
        channels: usize,
        total: u64,
        pos: u64,
        seeks: Vec<u64>,
    }

    impl StubSource {
        fn new(channels: usize, total: u64) -> Self {
            Self {
                channels,
                total,
                pos: 0,
                seeks: Vec::new(),
            }
        }
    }

    impl PcmSource for StubSource {
        fn channels(&self) -> usize {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> FrameRead {
            let remaining = self.total.saturating_sub(self.pos);
            let take = (max_frames as u64).min(remaining) as usize;
            for f in 0..take {
                for c in 0..self.channels {
                    dst[f * self.channels + c] = (self.pos + f as u64) as f32;
                }
            }
            self.pos += take as u64;
            FrameRead {
                frames: take,
                end_of_stream: self.pos >= self.total && take < max_frames,
            }
        }

        fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
            self.seeks.push(frame);
            self.pos = frame.min(self.total);
            Ok(())
        }
    }

    fn active_state() -> Arc<StreamState> {
        let shared = Arc::new(StreamState::new());
        shared.set_ready(true);
        shared.set_active(true);
        shared
    }

    fn stage(channels: usize, speed: f32, quota: usize) -> SpeedStage {
        SpeedStage::new(channels, 48_000, 48_000, speed, quota).unwrap()
    }

    #[test]
    fn direct_path_plays_out_in_quotas_then_ends() {
        let shared = active_state();
        let mut renderer = Renderer::new(StubSource::new(1, 10), shared.clone());
        let mut out = [9.9f32; 4];

        renderer.render(&mut out);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(shared.frame_offset(), 4);
        assert!(shared.is_active());

        renderer.render(&mut out);
        assert_eq!(out, [4.0, 5.0, 6.0, 7.0]);

        renderer.render(&mut out);
        assert_eq!(out, [8.0, 9.0, 0.0, 0.0], "tail is silence, not stale data");
        assert_eq!(shared.frame_offset(), 10);
        assert!(!shared.is_active());
        assert!(shared.ended_naturally());
    }

    #[test]
    fn pending_seek_is_serviced_before_the_read() {
        let shared = active_state();
        let mut renderer = Renderer::new(StubSource::new(1, 100), shared.clone());
        let mut out = [0.0f32; 4];

        shared.request_seek(50);
        renderer.render(&mut out);

        assert_eq!(renderer.source.seeks, vec![50]);
        assert_eq!(out, [50.0, 51.0, 52.0, 53.0]);
        assert_eq!(shared.frame_offset(), 54);
        assert!(!shared.seek_pending());
    }

    #[test]
    fn looping_rewinds_without_ending() {
        let shared = active_state();
        shared.set_loops_at_end(true);
        let mut renderer = Renderer::new(StubSource::new(1, 6), shared.clone());
        let mut out = [0.0f32; 4];

        renderer.render(&mut out);
        renderer.render(&mut out);

        assert_eq!(renderer.source.seeks, vec![0], "end of stream rewinds to frame 0");
        assert_eq!(shared.frame_offset(), 0);
        assert!(shared.is_active());
        assert!(!shared.ended_naturally());

        renderer.render(&mut out);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0], "playback continues from the top");
    }

    #[test]
    fn natural_end_fires_once_and_only_flips_flags() {
        let shared = active_state();
        let mut renderer = Renderer::new(StubSource::new(1, 2), shared.clone());
        let mut out = [0.0f32; 4];

        renderer.render(&mut out);
        assert!(!shared.is_active());
        assert!(shared.ended_naturally());

        // Further periods keep rendering silence without disturbing flags.
        renderer.render(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert!(shared.ended_naturally());
    }

    #[test]
    fn resampled_path_fills_exact_quota() {
        for &speed in &[0.5f32, 1.5, 2.0] {
            let shared = active_state();
            let _ = shared.install_speed_stage(Some(stage(1, speed, 64)));
            let mut renderer = Renderer::new(StubSource::new(1, 100_000), shared.clone());
            let mut out = [f32::NAN; 64];

            renderer.render(&mut out);
            assert!(
                out.iter().all(|s| s.is_finite()),
                "speed {speed}: every output frame is written"
            );
            assert!(shared.is_active(), "speed {speed}");
        }
    }

    #[test]
    fn resampled_offset_advances_by_consumed_input() {
        let shared = active_state();
        let _ = shared.install_speed_stage(Some(stage(1, 2.0, 64)));
        let mut renderer = Renderer::new(StubSource::new(1, 100_000), shared.clone());
        let mut out = [0.0f32; 64];

        renderer.render(&mut out);
        // Two input frames per output frame, plus the two-frame priming.
        assert_eq!(shared.frame_offset(), 128);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn half_speed_interpolates_between_frames() {
        let shared = active_state();
        let _ = shared.install_speed_stage(Some(stage(1, 0.5, 8)));
        let mut renderer = Renderer::new(StubSource::new(1, 1_000), shared.clone());
        let mut out = [0.0f32; 8];

        renderer.render(&mut out);
        assert_eq!(&out[..4], &[0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn exhausted_source_yields_full_silence_in_speed_path() {
        let shared = active_state();
        let _ = shared.install_speed_stage(Some(stage(1, 2.0, 8)));
        let mut renderer = Renderer::new(StubSource::new(1, 0), shared.clone());
        let mut out = [7.0f32; 8];

        renderer.render(&mut out);
        assert_eq!(out, [0.0; 8]);
        assert!(!shared.is_active());
        assert!(shared.ended_naturally());
    }

    #[test]
    fn short_source_zero_fills_resampled_tail() {
        let shared = active_state();
        let _ = shared.install_speed_stage(Some(stage(1, 2.0, 8)));
        let mut renderer = Renderer::new(StubSource::new(1, 6), shared.clone());
        let mut out = [7.0f32; 8];

        renderer.render(&mut out);
        // Six input frames at double speed cannot fill eight output frames.
        assert!(out[7] == 0.0);
        assert!(shared.ended_naturally());
    }

    #[test]
    fn held_stage_lock_renders_one_silent_period() {
        let shared = active_state();
        let _ = shared.install_speed_stage(Some(stage(1, 2.0, 4)));
        let mut renderer = Renderer::new(StubSource::new(1, 100), shared.clone());
        let mut out = [5.0f32; 4];

        {
            let _held = shared.speed_stage.lock().unwrap();
            renderer.render(&mut out);
            assert_eq!(out, [0.0; 4]);
        }

        renderer.render(&mut out);
        assert!(out.iter().any(|&s| s != 0.0), "rendering resumes after the swap");
    }

    #[test]
    fn concurrent_speed_swaps_never_break_a_render_cycle() {
        let shared = active_state();
        let renderer_shared = shared.clone();

        let worker = std::thread::spawn(move || {
            let mut renderer = Renderer::new(StubSource::new(2, u64::MAX), renderer_shared);
            let mut out = [0.0f32; 256];
            for _ in 0..2_000 {
                out.fill(f32::NAN);
                renderer.render(&mut out);
                assert!(out.iter().all(|s| s.is_finite()));
            }
        });

        for i in 0..2_000u32 {
            let speed = if i % 3 == 0 { 1.5 } else { 0.75 };
            let next = if i % 5 == 0 {
                None
            } else {
                Some(stage(2, speed, 128))
            };
            let old = shared.install_speed_stage(next);
            drop(old);
        }

        worker.join().expect("render thread survives concurrent speed changes");
    }
}
