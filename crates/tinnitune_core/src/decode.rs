//! Decoded Audio
//!
//! Therapy material imported by the host. The engine only needs interleaved
//! `f32` samples and their format; WAV decoding via `hound` is provided for
//! convenience.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use hound::{SampleFormat, WavReader};

use crate::error::{EngineError, EngineResult};

/// Interleaved sample data at its original rate
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

impl DecodedAudio {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> EngineResult<Self> {
        if sample_rate == 0 {
            return Err(EngineError::DecodeFailure("sample rate is zero".into()));
        }
        if channels == 0 {
            return Err(EngineError::DecodeFailure("no channels".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(EngineError::DecodeFailure(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            samples: samples.into(),
        })
    }

    /// Decode a WAV file from disk
    pub fn from_wav_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::DecodeFailure(format!("{}: {}", path.display(), e)))?;
        decode_wav(&bytes)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels as usize;
        if channels == 1 {
            return self.samples.to_vec();
        }
        let scale = 1.0 / channels as f32;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect()
    }
}

/// Decode a WAV byte stream (integer or float PCM, any channel count)
pub fn decode_wav(bytes: &[u8]) -> EngineResult<DecodedAudio> {
    let reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| EngineError::DecodeFailure(e.to_string()))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect(),
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(EngineError::DecodeFailure(format!(
                    "unsupported bit depth: {}",
                    spec.bits_per_sample
                )));
            }
            let scale = 1.0 / (1_u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect()
        }
    };
    let samples = samples.map_err(|e| EngineError::DecodeFailure(e.to_string()))?;

    DecodedAudio::new(spec.sample_rate, spec.channels, samples)
}
