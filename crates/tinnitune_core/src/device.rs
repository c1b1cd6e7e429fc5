//! Output Device Enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// An output device therapy audio can be played on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Human-readable device name, also used to select it
    pub name: String,

    /// Whether this is the system default output
    pub is_default: bool,

    /// Supported sample rates (may be empty if querying failed)
    pub sample_rates: Vec<u32>,

    /// Maximum supported channels
    pub max_channels: u16,
}

impl AudioDevice {
    /// Enumerate all output devices of the default host
    pub fn enumerate_outputs() -> EngineResult<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        let devices: Vec<AudioDevice> = host
            .output_devices()
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?
            .filter_map(|device| Self::from_cpal_device(&device, default_name.as_deref()).ok())
            .collect();

        if devices.is_empty() {
            return Err(EngineError::EngineUnavailable("no output devices found".into()));
        }
        Ok(devices)
    }

    /// The default output device
    pub fn default_output() -> EngineResult<AudioDevice> {
        let device = find_output_device(None)?;
        Self::from_cpal_device(&device, None).map(|mut d| {
            d.is_default = true;
            d
        })
    }

    fn from_cpal_device(device: &cpal::Device, default_name: Option<&str>) -> EngineResult<Self> {
        let name = device
            .name()
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?;
        let is_default = default_name == Some(name.as_str());

        let (sample_rates, max_channels) = match device.supported_output_configs() {
            Ok(configs) => extract_config_info(configs),
            Err(_) => (vec![], 2),
        };

        Ok(AudioDevice {
            name,
            is_default,
            sample_rates,
            max_channels,
        })
    }
}

/// Find an output device by name, or the default one
pub(crate) fn find_output_device(name: Option<&str>) -> EngineResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::EngineUnavailable("no default output device".into())),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| {
                EngineError::EngineUnavailable(format!("output device not found: {}", wanted))
            }),
    }
}

fn extract_config_info(
    configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
) -> (Vec<u32>, u16) {
    const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

    let mut sample_rates = Vec::new();
    let mut max_channels = 0u16;

    for config in configs {
        max_channels = max_channels.max(config.channels());

        let min = config.min_sample_rate().0;
        let max = config.max_sample_rate().0;
        for &rate in &COMMON_RATES {
            if rate >= min && rate <= max && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
    }

    sample_rates.sort_unstable();
    (sample_rates, max_channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_device_serialization() {
        let device = AudioDevice {
            name: "Headphones".to_string(),
            is_default: true,
            sample_rates: vec![44100, 48000],
            max_channels: 2,
        };

        let json = serde_json::to_string(&device).unwrap();
        let deserialized: AudioDevice = serde_json::from_str(&json).unwrap();
        assert_eq!(device, deserialized);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_enumerate_outputs() {
        let devices = AudioDevice::enumerate_outputs().unwrap();
        assert!(!devices.is_empty());
        assert!(devices.iter().all(|d| d.max_channels > 0));
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_default_output() {
        let device = AudioDevice::default_output().unwrap();
        assert!(device.is_default);
        assert!(find_output_device(Some(&device.name)).is_ok());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_missing_device_is_unavailable() {
        assert!(matches!(
            find_output_device(Some("no such device")),
            Err(EngineError::EngineUnavailable(_))
        ));
    }
}
