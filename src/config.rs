//! Device configuration.
//!
//! A `DeviceConfig` is a plain serde structure. Every field has a default so a
//! config file only needs to name the values it changes:
//!
//! ```json
//! { "frequency": 48000, "channels": "surround51", "front_stablizer": true }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MixerError, Result};
use crate::resampler::Resampler;

pub const MIN_OUTPUT_RATE: u32 = 8000;
pub const MAX_OUTPUT_RATE: u32 = 192000;
pub const DEFAULT_OUTPUT_RATE: u32 = 44100;
pub const DEFAULT_UPDATE_SIZE: u32 = 882;
pub const DEFAULT_SENDS: usize = 2;
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 511;
pub const DEFAULT_MAX_VOICES: usize = 64;
pub const DEFAULT_MAX_SLOTS: usize = 64;

/// Output channel layout of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevChannels {
    Mono,
    Stereo,
    Quad,
    Surround51,
    Surround61,
    Surround71,
    Ambi3d,
}

impl DevChannels {
    pub fn count(self, ambi_order: u32) -> usize {
        match self {
            DevChannels::Mono => 1,
            DevChannels::Stereo => 2,
            DevChannels::Quad => 4,
            DevChannels::Surround51 => 6,
            DevChannels::Surround61 => 7,
            DevChannels::Surround71 => 8,
            DevChannels::Ambi3d => ((ambi_order + 1) * (ambi_order + 1)) as usize,
        }
    }
}

/// Sample format written to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevSampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DevSampleType {
    pub fn bytes(self) -> usize {
        match self {
            DevSampleType::U8 | DevSampleType::I8 => 1,
            DevSampleType::U16 | DevSampleType::I16 => 2,
            DevSampleType::U32 | DevSampleType::I32 | DevSampleType::F32 => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, DevSampleType::F32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoEncoding {
    Basic,
    Uhj,
    Hrtf,
}

/// How positional sources are panned onto a non-HRTF output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Normal,
    Pairwise,
    Hrtf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HrtfMode {
    Full,
    Ambi1,
    Ambi2,
    Ambi3,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub frequency: u32,
    pub channels: DevChannels,
    pub sample_type: DevSampleType,
    pub update_size: u32,
    pub ambi_order: u32,
    pub stereo_encoding: StereoEncoding,
    pub render_mode: Option<RenderMode>,
    pub resampler: Resampler,
    pub sends: usize,
    pub output_limiter: Option<bool>,
    pub dither: bool,
    pub dither_depth: Option<u32>,
    pub front_stablizer: bool,
    pub hq_decoder: bool,
    pub nfc: bool,
    pub nfc_ref_distance: f32,
    pub speaker_distances: Option<Vec<f32>>,
    pub cf_level: u32,
    pub hrtf_mode: HrtfMode,
    pub hrtf_size: Option<u32>,
    pub event_queue_size: usize,
    /// Contexts start with updates held until the app releases them.
    pub hold_updates_default: bool,
    pub max_voices: usize,
    pub max_slots: usize,
    /// Stop every voice when the backend reports a disconnect.
    pub stop_voices_on_disconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_OUTPUT_RATE,
            channels: DevChannels::Stereo,
            sample_type: DevSampleType::F32,
            update_size: DEFAULT_UPDATE_SIZE,
            ambi_order: 1,
            stereo_encoding: StereoEncoding::Basic,
            render_mode: None,
            resampler: Resampler::Cubic,
            sends: DEFAULT_SENDS,
            output_limiter: None,
            dither: true,
            dither_depth: None,
            front_stablizer: false,
            hq_decoder: true,
            nfc: false,
            nfc_ref_distance: 0.0,
            speaker_distances: None,
            cf_level: 0,
            hrtf_mode: HrtfMode::Full,
            hrtf_size: None,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            hold_updates_default: false,
            max_voices: DEFAULT_MAX_VOICES,
            max_slots: DEFAULT_MAX_SLOTS,
            stop_voices_on_disconnect: true,
        }
    }
}

impl DeviceConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(text)?;
        config.sanitized()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: DeviceConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.sanitized()
    }

    /// Clamps numeric fields into their legal ranges. Values that cannot be
    /// clamped meaningfully are rejected.
    pub fn sanitized(mut self) -> Result<Self> {
        self.frequency = self.frequency.clamp(MIN_OUTPUT_RATE, MAX_OUTPUT_RATE);
        self.update_size = self.update_size.clamp(64, 8192);
        self.sends = self.sends.min(crate::audio::MAX_SENDS);
        self.cf_level = self.cf_level.min(6);
        if self.channels == DevChannels::Ambi3d && !(1..=3).contains(&self.ambi_order) {
            return Err(MixerError::InvalidValue(format!(
                "ambisonic order {} out of range (1 to 3)",
                self.ambi_order
            )));
        }
        if self.event_queue_size == 0 {
            return Err(MixerError::InvalidValue("event queue size must be positive".into()));
        }
        if self.max_voices == 0 {
            return Err(MixerError::InvalidValue("max_voices must be positive".into()));
        }
        if let Some(depth) = self.dither_depth {
            self.dither_depth = Some(depth.clamp(2, 24));
        }
        if let Some(dists) = &self.speaker_distances {
            if dists.iter().any(|d| !d.is_finite() || *d < 0.0) {
                return Err(MixerError::InvalidValue(
                    "speaker distances must be finite and non-negative".into(),
                ));
            }
        }
        Ok(self)
    }

    /// Effective output limiter switch: integer output is limited unless the
    /// config says otherwise.
    pub fn limiter_enabled(&self) -> bool {
        self.output_limiter
            .unwrap_or_else(|| self.sample_type.is_integer())
    }

    /// Dither depth as a quantization scale (`2^(bits-1)`), or 0 when off.
    pub fn dither_scale(&self) -> f32 {
        if !self.dither {
            return 0.0;
        }
        let depth = self.dither_depth.unwrap_or(match self.sample_type {
            DevSampleType::U8 | DevSampleType::I8 => 8,
            DevSampleType::U16 | DevSampleType::I16 => 16,
            _ => 0,
        });
        if depth == 0 {
            0.0
        } else {
            2.0f32.powi(depth.clamp(2, 24) as i32 - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_object() {
        let cfg = DeviceConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, DeviceConfig::default());
    }

    #[test]
    fn frequency_is_clamped() {
        let cfg = DeviceConfig::from_json_str(r#"{"frequency": 1000000}"#).unwrap();
        assert_eq!(cfg.frequency, MAX_OUTPUT_RATE);
        let cfg = DeviceConfig::from_json_str(r#"{"frequency": 10}"#).unwrap();
        assert_eq!(cfg.frequency, MIN_OUTPUT_RATE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DeviceConfig::from_json_str(r#"{"frequncy": 48000}"#);
        assert!(matches!(err, Err(MixerError::Config(_))));
    }

    #[test]
    fn integer_output_implies_limiter_and_dither() {
        let cfg = DeviceConfig::from_json_str(r#"{"sample_type": "i16"}"#).unwrap();
        assert!(cfg.limiter_enabled());
        assert_eq!(cfg.dither_scale(), 32768.0);

        let cfg = DeviceConfig::default();
        assert!(!cfg.limiter_enabled());
        assert_eq!(cfg.dither_scale(), 0.0);
    }

    #[test]
    fn bad_ambisonic_order_errors() {
        let err = DeviceConfig::from_json_str(r#"{"channels": "ambi3d", "ambi_order": 5}"#);
        assert!(matches!(err, Err(MixerError::InvalidValue(_))));
    }
}
