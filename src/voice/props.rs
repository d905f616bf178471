//! Source parameters as the application sets them.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use crate::audio::MAX_SENDS;
use crate::effect_slot::SlotId;
use crate::error::{MixerError, Result};
use crate::postprocess::DEFAULT_STEREO_WIDTH;
use crate::resampler::Resampler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceModel {
    Disable,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

/// Whether a source is positioned in 3D. `Auto` spatializes mono sources
/// only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatializeMode {
    Off,
    On,
    #[default]
    Auto,
}

/// Direct channel routing for multichannel sources: input channels go
/// straight to the matching speakers, and channels the device lacks are
/// either dropped or remixed onto the nearest speakers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectMode {
    #[default]
    Off,
    DropMismatch,
    RemixMismatch,
}

/// How stereo buffers are played: as a speaker pair, or widened into
/// first-order B-Format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoMode {
    #[default]
    Normal,
    SuperStereo,
}

/// A low/high shelf pair applied to one signal path.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterProps {
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for FilterProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: 5000.0,
            gain_lf: 1.0,
            lf_reference: 250.0,
        }
    }
}

impl FilterProps {
    pub fn clamped(mut self) -> Self {
        self.gain = self.gain.clamp(0.0, 1.0);
        self.gain_hf = self.gain_hf.clamp(0.0, 1.0);
        self.gain_lf = self.gain_lf.clamp(0.0, 1.0);
        self.hf_reference = self.hf_reference.max(1.0);
        self.lf_reference = self.lf_reference.max(1.0);
        self
    }

    fn values(&self) -> [f32; 5] {
        [self.gain, self.gain_hf, self.hf_reference, self.gain_lf, self.lf_reference]
    }
}

/// One auxiliary send: the slot it feeds and the filter on the way there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendProps {
    pub slot: Option<SlotId>,
    pub filter: FilterProps,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceProps {
    pub pitch: f32,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Cone angles in degrees.
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub outer_gain: f32,
    pub outer_gain_hf: f32,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub room_rolloff_factor: f32,
    pub air_absorption_factor: f32,
    pub doppler_factor: f32,

    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub direction: [f32; 3],
    /// Orientation of ambisonic sources.
    pub orient_at: [f32; 3],
    pub orient_up: [f32; 3],
    pub head_relative: bool,

    pub distance_model: DistanceModel,
    pub resampler: Resampler,
    pub direct_channels: DirectMode,
    pub spatialize: SpatializeMode,

    pub dry_gain_hf_auto: bool,
    pub wet_gain_auto: bool,
    pub wet_gain_hf_auto: bool,

    /// Left and right angles, in radians counter-clockwise, for stereo
    /// sources.
    pub stereo_pan: [f32; 2],
    pub radius: f32,
    /// Super stereo width.
    pub enh_width: f32,
    pub stereo_mode: StereoMode,

    pub direct: FilterProps,
    pub sends: [SendProps; MAX_SENDS],
}

impl Default for VoiceProps {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            inner_angle: 360.0,
            outer_angle: 360.0,
            outer_gain: 0.0,
            outer_gain_hf: 1.0,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            room_rolloff_factor: 0.0,
            air_absorption_factor: 0.0,
            doppler_factor: 1.0,
            position: [0.0; 3],
            velocity: [0.0; 3],
            direction: [0.0; 3],
            orient_at: [0.0, 0.0, -1.0],
            orient_up: [0.0, 1.0, 0.0],
            head_relative: false,
            distance_model: DistanceModel::default(),
            resampler: Resampler::default(),
            direct_channels: DirectMode::default(),
            spatialize: SpatializeMode::default(),
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
            stereo_pan: [PI / 6.0, -PI / 6.0],
            radius: 0.0,
            enh_width: DEFAULT_STEREO_WIDTH,
            stereo_mode: StereoMode::default(),
            direct: FilterProps::default(),
            sends: [SendProps::default(); MAX_SENDS],
        }
    }
}

impl VoiceProps {
    /// Rejects non-finite values, which clamping cannot repair.
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            self.pitch,
            self.gain,
            self.min_gain,
            self.max_gain,
            self.inner_angle,
            self.outer_angle,
            self.outer_gain,
            self.outer_gain_hf,
            self.ref_distance,
            self.rolloff_factor,
            self.room_rolloff_factor,
            self.air_absorption_factor,
            self.doppler_factor,
            self.radius,
            self.enh_width,
            self.stereo_pan[0],
            self.stereo_pan[1],
        ];
        let vectors = [
            self.position,
            self.velocity,
            self.direction,
            self.orient_at,
            self.orient_up,
        ];
        let filters = std::iter::once(&self.direct)
            .chain(self.sends.iter().map(|s| &s.filter))
            .flat_map(|f| f.values());
        let finite = scalars.iter().all(|v| v.is_finite())
            && vectors.iter().flatten().all(|v| v.is_finite())
            && filters.into_iter().all(f32::is_finite);
        // The max distance may be the float maximum but not NaN.
        if !finite || self.max_distance.is_nan() {
            return Err(MixerError::InvalidValue("source property is not finite".into()));
        }
        Ok(())
    }

    pub fn clamped(mut self) -> Self {
        self.pitch = self.pitch.max(0.0);
        self.gain = self.gain.max(0.0);
        self.min_gain = self.min_gain.max(0.0);
        self.max_gain = self.max_gain.max(0.0);
        self.inner_angle = self.inner_angle.clamp(0.0, 360.0);
        self.outer_angle = self.outer_angle.clamp(0.0, 360.0);
        self.outer_gain = self.outer_gain.clamp(0.0, 1.0);
        self.outer_gain_hf = self.outer_gain_hf.clamp(0.0, 1.0);
        self.ref_distance = self.ref_distance.max(0.0);
        self.max_distance = self.max_distance.max(0.0);
        self.rolloff_factor = self.rolloff_factor.max(0.0);
        self.room_rolloff_factor = self.room_rolloff_factor.max(0.0);
        self.air_absorption_factor = self.air_absorption_factor.clamp(0.0, 10.0);
        self.doppler_factor = self.doppler_factor.max(0.0);
        self.radius = self.radius.max(0.0);
        self.enh_width = self.enh_width.clamp(0.0, 0.7);
        self.direct = self.direct.clamped();
        for send in self.sends.iter_mut() {
            send.filter = send.filter.clamped();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_an_unfiltered_point_source() {
        let props = VoiceProps::default();
        assert_eq!(props.clone().clamped(), props);
        assert!(props.validate().is_ok());
        assert_eq!(props.sends.len(), MAX_SENDS);
        assert!(props.sends.iter().all(|s| s.slot.is_none()));
    }

    #[test]
    fn clamping_limits_cone_and_filter_ranges() {
        let mut props = VoiceProps::default();
        props.inner_angle = 400.0;
        props.outer_gain = -1.0;
        props.direct.gain_hf = 2.5;
        props.sends[1].filter.gain = 7.0;
        props.enh_width = 1.0;
        let props = props.clamped();
        assert_eq!(props.inner_angle, 360.0);
        assert_eq!(props.outer_gain, 0.0);
        assert_eq!(props.direct.gain_hf, 1.0);
        assert_eq!(props.sends[1].filter.gain, 1.0);
        assert_eq!(props.enh_width, 0.7);
    }

    #[test]
    fn nan_positions_are_rejected() {
        let mut props = VoiceProps::default();
        props.position[2] = f32::NAN;
        assert!(matches!(props.validate(), Err(MixerError::InvalidValue(_))));
        let mut props = VoiceProps::default();
        props.sends[5].filter.lf_reference = f32::INFINITY;
        assert!(props.validate().is_err());
    }

    #[test]
    fn scene_json_fills_in_defaults() {
        let props: VoiceProps = serde_json::from_str(
            r#"{"gain": 0.5, "position": [1.0, 0.0, 0.0], "distance_model": "linear_clamped",
                "sends": [{"slot": 2}, {}, {}, {}, {}, {}]}"#,
        )
        .unwrap();
        assert_eq!(props.gain, 0.5);
        assert_eq!(props.distance_model, DistanceModel::LinearClamped);
        assert_eq!(props.sends[0].slot, Some(SlotId(2)));
        assert_eq!(props.sends[0].filter, FilterProps::default());
        assert_eq!(props.pitch, 1.0);
    }
}
