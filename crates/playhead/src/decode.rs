//! Decoder adapter over Symphonia.
//!
//! Wraps the probe/packet/decode machinery behind a pull interface: the
//! render context asks for up to N interleaved `f32` frames at a time and
//! gets back the count actually read plus an end-of-stream marker. Decoded
//! packets are staged in a [`SampleBuffer`] and drained across reads, so
//! request sizes never have to line up with packet sizes.
//!
//! Errors inside a read degrade to end-of-stream instead of propagating:
//! reads happen on the audio thread, which must keep its deadline no matter
//! what the source does.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::{Result, StreamError};

/// A decode error in more than this many consecutive packets ends the
/// stream rather than stalling the reader.
const MAX_DECODE_RETRIES: usize = 3;

/// Outcome of one [`PcmSource::read_frames`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRead {
    /// Frames written to the destination. Less than the request only at
    /// end of stream.
    pub frames: usize,
    /// True once the source is exhausted.
    pub end_of_stream: bool,
}

/// The seam between the render callback and whatever supplies PCM frames.
///
/// Production code uses [`AudioDecoder`]; tests drive the callback with
/// recording stubs.
pub trait PcmSource: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Read up to `max_frames` interleaved frames into `dst`.
    fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> FrameRead;

    /// Reposition the read cursor to an absolute frame index.
    fn seek_to_frame(&mut self, frame: u64) -> Result<()>;
}

/// Pull-based Symphonia decoder for one audio file.
///
/// Closing the decoder is dropping it.
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    total_frames: Option<u64>,
    /// Staged interleaved samples from the most recent decoded packet.
    buffer: Option<SampleBuffer<f32>>,
    /// Samples already drained from `buffer`.
    cursor: usize,
    /// Frames to discard after a coarse seek landed early.
    skip_frames: u64,
    eof: bool,
}

impl std::fmt::Debug for AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDecoder")
            .field("track_id", &self.track_id)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("total_frames", &self.total_frames)
            .field("cursor", &self.cursor)
            .field("skip_frames", &self.skip_frames)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl AudioDecoder {
    /// Open `path` and prepare the default audio track for decoding.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| StreamError::Load(format!("open {}: {e}", path.display())))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| StreamError::Load(format!("probe {}: {e}", path.display())))?;

        let format = probed.format;
        let track = format
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                format
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| StreamError::Load("no decodable audio track".into()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let channels = params
            .channels
            .ok_or_else(|| StreamError::Load("unknown channel count".into()))?
            .count();
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| StreamError::Load("unknown sample rate".into()))?;
        let total_frames = params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| StreamError::Load(format!("codec setup: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            total_frames,
            buffer: None,
            cursor: 0,
            skip_frames: 0,
            eof: false,
        })
    }

    /// Total frames in the source, when the container reports it.
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn buffered_samples(&self) -> usize {
        self.buffer
            .as_ref()
            .map(|b| b.samples().len().saturating_sub(self.cursor))
            .unwrap_or(0)
    }

    /// Decode packets until samples are staged or the stream ends.
    ///
    /// Returns false when no more samples will come.
    fn refill(&mut self) -> bool {
        let mut decode_errors = 0usize;

        while !self.eof {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return false;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(_) => {
                    // A broken container cannot be recovered mid-stream.
                    self.eof = true;
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => {
                    decode_errors += 1;
                    if decode_errors > MAX_DECODE_RETRIES {
                        self.eof = true;
                        return false;
                    }
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(_) => {
                    self.eof = true;
                    return false;
                }
            };
            decode_errors = 0;

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let needed = decoded.capacity() as u64;
            let fits = self
                .buffer
                .as_ref()
                .map(|b| b.capacity() >= decoded.capacity() * self.channels)
                .unwrap_or(false);
            if !fits {
                self.buffer = Some(SampleBuffer::<f32>::new(needed, spec));
            }
            let buffer = self.buffer.as_mut().unwrap();
            buffer.copy_interleaved_ref(decoded);
            self.cursor = 0;

            // Drop frames preceding a seek target that the container could
            // only approach at packet granularity.
            if self.skip_frames > 0 {
                let frames = (buffer.samples().len() / self.channels) as u64;
                let skip = self.skip_frames.min(frames);
                self.cursor = skip as usize * self.channels;
                self.skip_frames -= skip;
                if self.buffered_samples() == 0 {
                    continue;
                }
            }

            return true;
        }

        false
    }
}

impl PcmSource for AudioDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> FrameRead {
        let ch = self.channels;
        let want = max_frames.min(dst.len() / ch);
        let mut filled = 0usize;

        while filled < want {
            let available = self.buffered_samples();
            if available == 0 {
                if !self.refill() {
                    break;
                }
                continue;
            }

            let take_frames = (available / ch).min(want - filled);
            let samples = take_frames * ch;
            let buffer = self.buffer.as_ref().unwrap();
            let src = &buffer.samples()[self.cursor..self.cursor + samples];
            dst[filled * ch..filled * ch + samples].copy_from_slice(src);
            self.cursor += samples;
            filled += take_frames;
        }

        FrameRead {
            frames: filled,
            end_of_stream: self.eof && self.buffered_samples() == 0,
        }
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        let rate = u64::from(self.sample_rate);
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| StreamError::Seek(e.to_string()))?;

        self.decoder.reset();
        self.buffer = None;
        self.cursor = 0;
        // Audio track timestamps tick at the sample rate, so the shortfall
        // between the requested and landed positions is a frame count.
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.eof = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mono 16-bit WAV whose sample `i` holds the value `i`.
    fn ramp_fixture(dir: &tempfile::TempDir, frames: usize) -> std::path::PathBuf {
        assert!(frames <= i16::MAX as usize);
        let path = dir.path().join("ramp.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(i as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn as_i16(sample: f32) -> i32 {
        (sample * 32_768.0).round() as i32
    }

    #[test]
    fn open_reports_stream_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = ramp_fixture(&dir, 10);

        let dec = AudioDecoder::open(&path).unwrap();
        assert_eq!(dec.channels(), 1);
        assert_eq!(dec.sample_rate(), 48_000);
        assert_eq!(dec.total_frames(), Some(10));
    }

    #[test]
    fn open_missing_file_is_a_load_error() {
        let err = AudioDecoder::open(Path::new("/no/such/file.wav")).unwrap_err();
        assert!(matches!(err, StreamError::Load(_)));
    }

    #[test]
    fn reads_in_quotas_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = ramp_fixture(&dir, 10);
        let mut dec = AudioDecoder::open(&path).unwrap();
        let mut buf = [0.0f32; 4];

        let r1 = dec.read_frames(&mut buf, 4);
        assert_eq!(r1.frames, 4);
        assert!(!r1.end_of_stream);
        assert_eq!(as_i16(buf[0]), 0);
        assert_eq!(as_i16(buf[3]), 3);

        let r2 = dec.read_frames(&mut buf, 4);
        assert_eq!(r2.frames, 4);
        assert!(!r2.end_of_stream);
        assert_eq!(as_i16(buf[0]), 4);

        let r3 = dec.read_frames(&mut buf, 4);
        assert_eq!(r3.frames, 2);
        assert!(r3.end_of_stream);
        assert_eq!(as_i16(buf[0]), 8);
        assert_eq!(as_i16(buf[1]), 9);
    }

    #[test]
    fn oversized_request_returns_short_with_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = ramp_fixture(&dir, 10);
        let mut dec = AudioDecoder::open(&path).unwrap();
        let mut buf = [0.0f32; 32];

        let read = dec.read_frames(&mut buf, 32);
        assert_eq!(read.frames, 10);
        assert!(read.end_of_stream);

        let again = dec.read_frames(&mut buf, 4);
        assert_eq!(again.frames, 0);
        assert!(again.end_of_stream);
    }

    #[test]
    fn seek_positions_the_next_read_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = ramp_fixture(&dir, 26_000);
        let mut dec = AudioDecoder::open(&path).unwrap();
        let mut buf = [0.0f32; 3];

        // 24_000 / 48_000 Hz is a binary-exact half second.
        dec.seek_to_frame(24_000).unwrap();
        let read = dec.read_frames(&mut buf, 3);
        assert_eq!(read.frames, 3);
        assert_eq!(as_i16(buf[0]), 24_000);
        assert_eq!(as_i16(buf[1]), 24_001);
        assert_eq!(as_i16(buf[2]), 24_002);
    }

    #[test]
    fn seek_to_zero_rewinds_after_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = ramp_fixture(&dir, 8);
        let mut dec = AudioDecoder::open(&path).unwrap();
        let mut buf = [0.0f32; 8];

        let first = dec.read_frames(&mut buf, 8);
        assert!(first.end_of_stream || dec.read_frames(&mut buf, 1).end_of_stream);

        dec.seek_to_frame(0).unwrap();
        let read = dec.read_frames(&mut buf, 4);
        assert_eq!(read.frames, 4);
        assert!(!read.end_of_stream);
        assert_eq!(as_i16(buf[0]), 0);
    }

    #[test]
    fn stereo_reads_stay_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..6i16 {
            writer.write_sample(i).unwrap(); // left
            writer.write_sample(i + 1_000).unwrap(); // right
        }
        writer.finalize().unwrap();

        let mut dec = AudioDecoder::open(&path).unwrap();
        assert_eq!(dec.channels(), 2);

        let mut buf = [0.0f32; 8];
        let read = dec.read_frames(&mut buf, 4);
        assert_eq!(read.frames, 4);
        assert_eq!(as_i16(buf[0]), 0);
        assert_eq!(as_i16(buf[1]), 1_000);
        assert_eq!(as_i16(buf[2]), 1);
        assert_eq!(as_i16(buf[3]), 1_001);
    }
}
