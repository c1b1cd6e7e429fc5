//! Tinnitune Core - Therapy Audio Engine
//!
//! This crate provides the engine behind the tinnitus therapy protocols:
//! - Output device enumeration and stream management (via CPAL)
//! - A pull-rendered audio graph with sample-accurate parameter automation
//! - Pure tones, generated noise and ring-modulation protocols
//! - Band-gap (notch plus peak) filtering around the tinnitus frequency
//! - Adaptive two-band equalization of imported material
//! - A limited, metered master output
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Host Thread                           │
//! │   play / stop / sessions ──▶ TherapyEngine ◀── events       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Arc<Mutex<AudioGraph>>
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Audio Thread                           │
//! │   sources ──▶ filters / gains ──▶ limiter ──▶ master ──▶ out │
//! │        (rendered in 128-frame quanta, no allocation)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod chains;
mod config;
mod decode;
mod device;
mod engine;
mod equalizer;
mod error;
mod graph;
mod master;
mod message;
mod sound;
mod stream;

pub use chains::{ChainHandle, ModulationParams, NotchPeakFilters, TherapySource};
pub use config::{
    BackendKind, EngineConfig, EqualizerConfig, MasterConfig, OutputConfig, SessionFadeConfig,
};
pub use decode::{decode_wav, DecodedAudio};
pub use device::AudioDevice;
pub use engine::{FileTherapy, TherapyEngine};
pub use equalizer::{EqualizerHandle, BAND_Q, HIGH_BAND_RATIO, LOW_BAND_RATIO};
pub use error::{EngineError, EngineResult};
pub use graph::{
    AudioGraph, Endpoint, ParamKind, SourceState, UnitId, UnitKind, RENDER_QUANTUM,
};
pub use master::{MasterChain, DEFAULT_GAIN_RAMP_SECONDS};
pub use message::{Event, SoundKind};
pub use sound::{ActiveSound, SessionProtocol, TeardownReport};
pub use stream::{DeviceFormat, DeviceOutput, HostOutput, OutputBackend};

// Re-export DSP types for convenience
pub use tinnitune_dsp::{
    db_to_linear, linear_to_db, BandBalance, BandGapParams, CompressorParams, FilterParams,
    OscillatorShape, PeriodicWave, Waveform, NUM_BINS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        // Verify public API is accessible
        let config = EngineConfig::headless(48000);
        assert!(TherapyEngine::new(config).is_ok());
        assert_eq!("pink".parse::<TherapySource>(), Ok(TherapySource::Pink));
        assert_eq!(RENDER_QUANTUM, 128);
    }
}
