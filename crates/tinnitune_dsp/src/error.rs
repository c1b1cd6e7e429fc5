//! DSP Error Types

use thiserror::Error;

/// Errors that can occur during DSP operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    #[error("Invalid filter coefficients for frequency {frequency}Hz at sample rate {sample_rate}Hz")]
    InvalidCoefficients { frequency: f32, sample_rate: f32 },

    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f32),

    #[error("Frequency must be positive and finite, got {0}")]
    InvalidFrequency(f32),

    #[error("Invalid periodic wave: {0}")]
    InvalidPeriodicWave(String),

    #[error("Invalid dynamics parameter {name}: {value}")]
    InvalidDynamics { name: &'static str, value: f32 },

    #[error("Analyser window must be a power of two between 32 and 32768, got {0}")]
    InvalidWindowSize(usize),

    #[error("Buffer size mismatch: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DspError::InvalidFrequency(-5.0);
        assert!(err.to_string().contains("-5"));

        let err = DspError::InvalidCoefficients {
            frequency: 30000.0,
            sample_rate: 48000.0,
        };
        assert!(err.to_string().contains("30000"));
    }

    #[test]
    fn test_window_error_mentions_size() {
        let err = DspError::InvalidWindowSize(100);
        assert!(err.to_string().contains("100"));
    }
}
