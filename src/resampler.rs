//! Sample rate converter between the media-native and transport rates
//!
//! Wraps rubato's FFT resampler for interleaved PCM16. The FFT stage is
//! built once and kept for the converter's lifetime: its filter state must
//! carry across calls, or every 20ms chunk restarts the pipeline and
//! re-injects the FFT delay as leading silence. Inputs shorter than the
//! fixed chunk size take a stateless linear interpolation path instead.
//! One instance exists per direction, and only when the two rates differ;
//! equal rates are a pass-through at the call sites and must not construct
//! a converter at all.
//!
//! Output is sized `ceil(input_frames * output_rate / input_rate) + 1`
//! frames so a conversion pass can never truncate.

use rubato::{FftFixedIn, Resampler as RubatoResampler};

/// Floor on the FFT stage's fixed chunk size, in frames.
const MIN_FFT_FRAMES: usize = 64;

/// Error constructing a converter; fatal to session setup.
#[derive(Debug, Clone)]
pub struct ResamplerInitError(pub String);

impl std::fmt::Display for ResamplerInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to initialize resampler: {}", self.0)
    }
}

impl std::error::Error for ResamplerInitError {}

/// Streaming converter for one direction of a session.
///
/// Rates and channel count are fixed for the lifetime of the instance.
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Fixed frames per FFT pass; shorter tails go through the linear path
    chunk_frames: usize,
    /// Streaming FFT stage; state persists across calls
    fft: FftFixedIn<f64>,
    /// Per-channel deinterleave scratch, sized once at construction
    scratch: Vec<Vec<f64>>,
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("channels", &self.channels)
            .field("chunk_frames", &self.chunk_frames)
            .finish_non_exhaustive()
    }
}

impl Resampler {
    /// Create a converter for `input_rate` -> `output_rate`.
    ///
    /// `max_frames` is the upper bound on frames per call the caller expects
    /// to convert in one pass; longer inputs are processed in chunks of this
    /// size. Equal rates are rejected: the call sites pass data through
    /// unmodified in that case instead of paying a conversion pass.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        max_frames: usize,
    ) -> Result<Self, ResamplerInitError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ResamplerInitError(format!(
                "invalid sample rates {} -> {}",
                input_rate, output_rate
            )));
        }
        if input_rate == output_rate {
            return Err(ResamplerInitError(format!(
                "rates are equal ({} Hz); pass-through needs no converter",
                input_rate
            )));
        }
        if channels == 0 {
            return Err(ResamplerInitError("channel count must be at least 1".into()));
        }
        if max_frames == 0 {
            return Err(ResamplerInitError("max frame count must be at least 1".into()));
        }

        let chunk_frames = max_frames.max(MIN_FFT_FRAMES);

        let fft = FftFixedIn::<f64>::new(
            input_rate as usize,
            output_rate as usize,
            chunk_frames,
            2,
            channels,
        )
        .map_err(|e| ResamplerInitError(e.to_string()))?;

        Ok(Self {
            input_rate,
            output_rate,
            channels,
            chunk_frames,
            fft,
            scratch: vec![vec![0.0; chunk_frames]; channels],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames of output a conversion of `input_frames` may produce, plus the
    /// one-frame rounding allowance.
    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        let frames = input_frames as u64 * self.output_rate as u64;
        (frames.div_ceil(self.input_rate as u64) + 1) as usize
    }

    /// Convert interleaved PCM16 samples to the output rate.
    ///
    /// Trailing samples that do not form a whole frame are dropped.
    pub fn convert(&mut self, input: &[i16]) -> Vec<i16> {
        let total_frames = input.len() / self.channels;
        if total_frames == 0 {
            return Vec::new();
        }

        let mut out =
            Vec::with_capacity(self.max_output_frames(total_frames) * self.channels);

        let mut offset = 0;
        while offset < total_frames {
            let frames = (total_frames - offset).min(self.chunk_frames);
            let chunk = &input[offset * self.channels..(offset + frames) * self.channels];
            self.convert_chunk(chunk, frames, &mut out);
            offset += frames;
        }

        out
    }

    fn convert_chunk(&mut self, chunk: &[i16], frames: usize, out: &mut Vec<i16>) {
        // The FFT stage takes fixed-size chunks only; a shorter tail cannot
        // wait for more input, so it is interpolated without filter state
        if frames < self.chunk_frames {
            self.convert_linear(chunk, frames, out);
            return;
        }

        // Deinterleave into the pre-sized scratch
        for ch in 0..self.channels {
            let dst = &mut self.scratch[ch];
            for frame in 0..frames {
                dst[frame] = chunk[frame * self.channels + ch] as f64 / 32768.0;
            }
        }
        let planes: Vec<&[f64]> = self.scratch.iter().map(|c| &c[..frames]).collect();

        match self.fft.process(&planes, None) {
            Ok(converted) => {
                let out_frames = converted[0].len();
                for frame in 0..out_frames {
                    for plane in &converted {
                        out.push(clamp_sample(plane[frame]));
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "FFT resampling failed ({}), falling back to linear interpolation",
                    e
                );
                self.convert_linear(chunk, frames, out);
            }
        }
    }

    /// Linear interpolation path for short inputs.
    fn convert_linear(&self, chunk: &[i16], frames: usize, out: &mut Vec<i16>) {
        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let out_frames = ((frames as u64 * self.output_rate as u64
            + self.input_rate as u64 / 2)
            / self.input_rate as u64) as usize;

        for i in 0..out_frames {
            let src = i as f64 / ratio;
            let i0 = (src.floor() as usize).min(frames - 1);
            let i1 = (i0 + 1).min(frames - 1);
            let frac = src - i0 as f64;
            for ch in 0..self.channels {
                let a = chunk[i0 * self.channels + ch] as f64;
                let b = chunk[i1 * self.channels + ch] as f64;
                out.push((a + (b - a) * frac).round() as i16);
            }
        }
    }
}

fn clamp_sample(s: f64) -> i16 {
    (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Reinterpret little-endian PCM16 bytes as samples.
///
/// A trailing odd byte is ignored; media frames are always sample-aligned.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize samples back to little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_rates_rejected() {
        let err = Resampler::new(16000, 16000, 1, 160).unwrap_err();
        assert!(err.to_string().contains("pass-through"));
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(Resampler::new(0, 16000, 1, 160).is_err());
        assert!(Resampler::new(16000, 0, 1, 160).is_err());
        assert!(Resampler::new(16000, 8000, 0, 160).is_err());
    }

    #[test]
    fn test_upsample_doubles_length() {
        let mut r = Resampler::new(8000, 16000, 1, 160).unwrap();
        let input: Vec<i16> = (0..160).map(|i| ((i as f64 * 0.2).sin() * 8000.0) as i16).collect();
        let output = r.convert(&input);
        assert_eq!(output.len(), 320);
    }

    #[test]
    fn test_downsample_halves_length() {
        let mut r = Resampler::new(16000, 8000, 1, 320).unwrap();
        let input: Vec<i16> = (0..320).map(|i| ((i as f64 * 0.1).sin() * 8000.0) as i16).collect();
        let output = r.convert(&input);
        assert_eq!(output.len(), 160);
    }

    #[test]
    fn test_interleaved_stereo_length() {
        let mut r = Resampler::new(8000, 16000, 2, 160).unwrap();
        // 160 stereo frames = 320 interleaved samples
        let input: Vec<i16> = (0..320).map(|i| (i % 64) as i16 * 100).collect();
        let output = r.convert(&input);
        assert_eq!(output.len(), 640);
        assert_eq!(output.len() % 2, 0);
    }

    #[test]
    fn test_round_trip_length_tolerance() {
        let mut up = Resampler::new(8000, 16000, 1, 160).unwrap();
        let mut down = Resampler::new(16000, 8000, 1, 320).unwrap();
        let input = vec![0i16; 160];
        let wide = up.convert(&input);
        let back = down.convert(&wide);
        let diff = back.len() as i64 - input.len() as i64;
        assert!(diff.abs() <= 1, "round trip drifted by {} frames", diff);
    }

    #[test]
    fn test_filter_state_carries_across_calls() {
        let mut r = Resampler::new(8000, 16000, 1, 160).unwrap();
        let input = vec![10000i16; 160];
        // First call absorbs the pipeline delay
        r.convert(&input);
        let second = r.convert(&input);
        assert_eq!(second.len(), 320);
        let quiet = second.iter().take_while(|s| s.abs() < 5000).count();
        assert!(
            quiet < 16,
            "steady-state output started with {} near-silent samples",
            quiet
        );
    }

    #[test]
    fn test_short_input_uses_linear_path() {
        let mut r = Resampler::new(8000, 16000, 1, 160).unwrap();
        let input = vec![100i16; 10];
        let output = r.convert(&input);
        assert_eq!(output.len(), 20);
    }

    #[test]
    fn test_long_input_processed_in_chunks() {
        let mut r = Resampler::new(8000, 16000, 1, 160).unwrap();
        // Five 20ms frames worth of input in one call
        let input = vec![0i16; 800];
        let output = r.convert(&input);
        assert_eq!(output.len(), 1600);
    }

    #[test]
    fn test_bytes_samples_round_trip() {
        let bytes = vec![0x34, 0x12, 0x78, 0x56];
        let samples = bytes_to_samples(&bytes);
        assert_eq!(samples, vec![0x1234, 0x5678]);
        assert_eq!(samples_to_bytes(&samples), bytes);
    }
}
