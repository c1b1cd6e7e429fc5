//! Engine Configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use tinnitune_dsp::CompressorParams;

use crate::error::{EngineError, EngineResult};

/// Where rendered audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Physical output device via cpal
    Device,
    /// The host pulls audio with `TherapyEngine::render`
    Host,
}

/// Output backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub backend: BackendKind,

    /// Output device name, `None` for the system default
    pub device_name: Option<String>,

    /// Sample rate in Hz for the host backend. Devices use their own rate.
    pub sample_rate: u32,

    /// Device buffer size in frames, `None` lets the driver decide
    pub buffer_size: Option<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Device,
            device_name: None,
            sample_rate: 48000,
            buffer_size: None,
        }
    }
}

/// Master chain configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Master gain applied at initialization and restored after sessions
    pub default_gain_db: f32,

    pub limiter: CompressorParams,

    /// Master analyser window in samples
    pub analyser_window: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            default_gain_db: -18.0,
            limiter: CompressorParams::default(),
            analyser_window: 2048,
        }
    }
}

/// Adaptive equalizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerConfig {
    /// Control loop cadence in Hz
    pub control_rate_hz: f32,

    /// Analyser window of each band in samples
    pub analyser_window: usize,

    /// Optional `(min, max)` clamp for the band gains
    pub gain_bounds: Option<(f32, f32)>,
}

impl Default for EqualizerConfig {
    fn default() -> Self {
        Self {
            control_rate_hz: 60.0,
            analyser_window: 512,
            gain_bounds: None,
        }
    }
}

/// Master fade used by `end_session`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFadeConfig {
    pub floor_db: f32,
    pub duration_seconds: f32,
}

impl Default for SessionFadeConfig {
    fn default() -> Self {
        Self {
            floor_db: -60.0,
            duration_seconds: 0.4,
        }
    }
}

/// Overall engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output: OutputConfig,

    pub master: MasterConfig,

    pub equalizer: EqualizerConfig,

    /// Fade length before a stopped sound is cut
    pub declick_seconds: f32,

    pub session_fade: SessionFadeConfig,

    /// Seed for noise generation, `None` seeds from entropy
    pub noise_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            master: MasterConfig::default(),
            equalizer: EqualizerConfig::default(),
            declick_seconds: 0.02,
            session_fade: SessionFadeConfig::default(),
            noise_seed: None,
        }
    }
}

impl EngineConfig {
    /// Config for hosts that pull audio themselves (embedding, tests)
    pub fn headless(sample_rate: u32) -> Self {
        Self {
            output: OutputConfig {
                backend: BackendKind::Host,
                sample_rate,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigError(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| EngineError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        let output = &self.output;
        if output.sample_rate < 8000 || output.sample_rate > 192000 {
            return Err(EngineError::ConfigError(format!(
                "Invalid sample rate: {}",
                output.sample_rate
            )));
        }
        if let Some(size) = output.buffer_size {
            if !(32..=8192).contains(&size) {
                return Err(EngineError::ConfigError(format!(
                    "Invalid buffer size: {}",
                    size
                )));
            }
        }

        self.master
            .limiter
            .validate()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;
        for window in [self.master.analyser_window, self.equalizer.analyser_window] {
            if !window.is_power_of_two() || !(32..=32768).contains(&window) {
                return Err(EngineError::ConfigError(format!(
                    "Invalid analyser window: {}",
                    window
                )));
            }
        }

        if !(self.equalizer.control_rate_hz > 0.0 && self.equalizer.control_rate_hz <= 1000.0) {
            return Err(EngineError::ConfigError(format!(
                "Invalid equalizer control rate: {}",
                self.equalizer.control_rate_hz
            )));
        }
        if let Some((min, max)) = self.equalizer.gain_bounds {
            if !(min <= max) {
                return Err(EngineError::ConfigError(format!(
                    "Invalid equalizer gain bounds: ({}, {})",
                    min, max
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.declick_seconds) {
            return Err(EngineError::ConfigError(format!(
                "Invalid declick time: {}",
                self.declick_seconds
            )));
        }
        if !(self.session_fade.duration_seconds >= 0.0 && self.session_fade.duration_seconds <= 10.0)
        {
            return Err(EngineError::ConfigError(format!(
                "Invalid session fade duration: {}",
                self.session_fade.duration_seconds
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.output.backend, BackendKind::Device);
        assert_eq!(config.master.default_gain_db, -18.0);
        assert_eq!(config.master.analyser_window, 2048);
        assert_eq!(config.equalizer.control_rate_hz, 60.0);
        assert_eq!(config.equalizer.analyser_window, 512);
        assert!(config.equalizer.gain_bounds.is_none());
        assert_eq!(config.declick_seconds, 0.02);
        assert_eq!(config.session_fade.floor_db, -60.0);
        assert_eq!(config.session_fade.duration_seconds, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_headless_config() {
        let config = EngineConfig::headless(44100);
        assert_eq!(config.output.backend, BackendKind::Host);
        assert_eq!(config.output.sample_rate, 44100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut invalid_rate = EngineConfig::default();
        invalid_rate.output.sample_rate = 100;
        assert!(invalid_rate.validate().is_err());

        let mut invalid_buffer = EngineConfig::default();
        invalid_buffer.output.buffer_size = Some(10);
        assert!(invalid_buffer.validate().is_err());

        let mut invalid_window = EngineConfig::default();
        invalid_window.equalizer.analyser_window = 500;
        assert!(invalid_window.validate().is_err());

        let mut invalid_bounds = EngineConfig::default();
        invalid_bounds.equalizer.gain_bounds = Some((2.0, 0.0));
        assert!(invalid_bounds.validate().is_err());

        let mut invalid_limiter = EngineConfig::default();
        invalid_limiter.master.limiter.ratio = 0.0;
        assert!(matches!(
            invalid_limiter.validate(),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::headless(48000);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "output": { "backend": "host" }, "noise_seed": 9 }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.output.backend, BackendKind::Host);
        assert_eq!(config.output.sample_rate, 48000);
        assert_eq!(config.noise_seed, Some(9));
        assert_eq!(config.master.default_gain_db, -18.0);
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("tinnitune-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "declick_seconds": 0.05 }"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.declick_seconds, 0.05);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            EngineConfig::from_json_file("/nonexistent/tinnitune.json"),
            Err(EngineError::ConfigError(_))
        ));
    }
}
