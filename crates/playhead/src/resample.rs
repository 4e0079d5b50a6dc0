//! Linear resampling for speed-controlled playback.
//!
//! Converts interleaved `f32` frames arriving at an *effective* input rate
//! (native rate × playback speed) to the device output rate by linear
//! interpolation between consecutive frames. At speeds above 1.0 the input
//! position advances faster than one frame per output frame, so less
//! wall-clock time is spent per unit of source audio; below 1.0 the
//! converse.
//!
//! The resampler is stateful: it keeps the last two input frames and a
//! fractional phase between them, so input can be fed in arbitrary chunks
//! without losing frames at chunk boundaries. Rebuilding it (on a speed
//! change) discards that history; the resulting one-buffer discontinuity is
//! accepted because speed changes are rare, user-initiated events.

/// Phase value used before any input has been consumed. The first two
/// whole steps pull real frames into the interpolation history.
const PRIME_PHASE: f64 = 2.0;

/// Streaming linear interpolator over interleaved frames.
pub struct LinearResampler {
    channels: usize,
    /// Input frames advanced per output frame.
    ratio: f64,
    /// Position of the next output frame, in input frames past `x0`.
    phase: f64,
    x0: Vec<f32>,
    x1: Vec<f32>,
}

impl LinearResampler {
    /// Create a resampler converting `effective_in_hz` to `out_hz`.
    ///
    /// `effective_in_hz` is the source's native rate scaled by the playback
    /// speed. Callers guarantee both rates are positive.
    pub fn new(channels: usize, effective_in_hz: f64, out_hz: u32) -> Self {
        debug_assert!(channels > 0);
        debug_assert!(effective_in_hz > 0.0 && out_hz > 0);
        Self {
            channels,
            ratio: effective_in_hz / f64::from(out_hz),
            phase: PRIME_PHASE,
            x0: vec![0.0; channels],
            x1: vec![0.0; channels],
        }
    }

    /// Input frames advanced per output frame.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Exact number of input frames required to produce `out_frames`
    /// output frames from the current phase.
    pub fn input_frames_needed(&self, out_frames: usize) -> usize {
        if out_frames == 0 {
            return 0;
        }
        (self.phase + (out_frames - 1) as f64 * self.ratio).floor() as usize
    }

    /// Resample `input` into `output`, both interleaved.
    ///
    /// Consumes up to `input.len() / channels` frames and produces up to
    /// `output.len() / channels` frames; the two rarely match because the
    /// conversion ratio is rarely exact. Returns `(consumed, produced)`
    /// frame counts. Input frames are consumed strictly in order and are
    /// either interpolated past or retained as history, never dropped.
    ///
    /// Does not allocate; safe to call from the render context.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> (usize, usize) {
        let ch = self.channels;
        debug_assert_eq!(input.len() % ch, 0);
        debug_assert_eq!(output.len() % ch, 0);

        let in_frames = input.len() / ch;
        let out_frames = output.len() / ch;
        let mut consumed = 0usize;
        let mut produced = 0usize;

        'produce: while produced < out_frames {
            while self.phase >= 1.0 {
                if consumed >= in_frames {
                    break 'produce;
                }
                self.x0.copy_from_slice(&self.x1);
                let start = consumed * ch;
                self.x1.copy_from_slice(&input[start..start + ch]);
                consumed += 1;
                self.phase -= 1.0;
            }

            let t = self.phase as f32;
            let base = produced * ch;
            for c in 0..ch {
                output[base + c] = self.x0[c] + (self.x1[c] - self.x0[c]) * t;
            }
            produced += 1;
            self.phase += self.ratio;
        }

        (consumed, produced)
    }

    /// Discard interpolation history, returning to the freshly-built state.
    pub fn reset(&mut self) {
        self.phase = PRIME_PHASE;
        self.x0.fill(0.0);
        self.x1.fill(0.0);
    }
}
