//! Standard environment presets for the reverb effects.

use super::ReverbProps;

/// Preset names accepted by [`ReverbProps::preset`].
pub const REVERB_PRESET_NAMES: [&str; 7] = ["generic", "room", "hall", "cave", "arena", "hangar", "underwater"];

struct Preset {
    density: f32,
    diffusion: f32,
    gain_hf: f32,
    decay_time: f32,
    decay_hf_ratio: f32,
    reflections_gain: f32,
    reflections_delay: f32,
    late_reverb_gain: f32,
    late_reverb_delay: f32,
    decay_hf_limit: bool,
}

impl Preset {
    fn into_props(self) -> ReverbProps {
        ReverbProps {
            density: self.density,
            diffusion: self.diffusion,
            gain: 0.3162,
            gain_hf: self.gain_hf,
            gain_lf: 1.0,
            decay_time: self.decay_time,
            decay_hf_ratio: self.decay_hf_ratio,
            decay_lf_ratio: 1.0,
            reflections_gain: self.reflections_gain,
            reflections_delay: self.reflections_delay,
            late_reverb_gain: self.late_reverb_gain,
            late_reverb_delay: self.late_reverb_delay,
            echo_time: 0.25,
            echo_depth: 0.0,
            modulation_time: 0.25,
            modulation_depth: 0.0,
            air_absorption_gain_hf: 0.9943,
            hf_reference: 5000.0,
            lf_reference: 250.0,
            room_rolloff_factor: 0.0,
            decay_hf_limit: self.decay_hf_limit,
            ..ReverbProps::default()
        }
    }
}

impl ReverbProps {
    /// Looks up a standard environment preset by name, ignoring case.
    pub fn preset(name: &str) -> Option<ReverbProps> {
        let preset = match name.to_ascii_lowercase().as_str() {
            "generic" => Preset {
                density: 1.0,
                diffusion: 1.0,
                gain_hf: 0.8913,
                decay_time: 1.49,
                decay_hf_ratio: 0.83,
                reflections_gain: 0.05,
                reflections_delay: 0.007,
                late_reverb_gain: 1.2589,
                late_reverb_delay: 0.011,
                decay_hf_limit: true,
            },
            "room" => Preset {
                density: 0.4287,
                diffusion: 1.0,
                gain_hf: 0.5929,
                decay_time: 0.4,
                decay_hf_ratio: 0.83,
                reflections_gain: 0.1503,
                reflections_delay: 0.002,
                late_reverb_gain: 1.0629,
                late_reverb_delay: 0.003,
                decay_hf_limit: true,
            },
            "hall" => Preset {
                density: 1.0,
                diffusion: 1.0,
                gain_hf: 0.5623,
                decay_time: 3.92,
                decay_hf_ratio: 0.7,
                reflections_gain: 0.2427,
                reflections_delay: 0.02,
                late_reverb_gain: 0.9977,
                late_reverb_delay: 0.029,
                decay_hf_limit: true,
            },
            "cave" => Preset {
                density: 1.0,
                diffusion: 1.0,
                gain_hf: 1.0,
                decay_time: 2.91,
                decay_hf_ratio: 1.3,
                reflections_gain: 0.5,
                reflections_delay: 0.015,
                late_reverb_gain: 0.7063,
                late_reverb_delay: 0.022,
                decay_hf_limit: false,
            },
            "arena" => Preset {
                density: 1.0,
                diffusion: 1.0,
                gain_hf: 0.4477,
                decay_time: 7.24,
                decay_hf_ratio: 0.33,
                reflections_gain: 0.2612,
                reflections_delay: 0.02,
                late_reverb_gain: 1.0186,
                late_reverb_delay: 0.03,
                decay_hf_limit: true,
            },
            "hangar" => Preset {
                density: 1.0,
                diffusion: 1.0,
                gain_hf: 0.3162,
                decay_time: 10.05,
                decay_hf_ratio: 0.23,
                reflections_gain: 0.5,
                reflections_delay: 0.02,
                late_reverb_gain: 1.256,
                late_reverb_delay: 0.03,
                decay_hf_limit: true,
            },
            "underwater" => {
                let mut props = Preset {
                    density: 0.3645,
                    diffusion: 1.0,
                    gain_hf: 0.01,
                    decay_time: 1.49,
                    decay_hf_ratio: 0.1,
                    reflections_gain: 0.5963,
                    reflections_delay: 0.007,
                    late_reverb_gain: 7.0795,
                    late_reverb_delay: 0.011,
                    decay_hf_limit: true,
                }
                .into_props();
                props.modulation_time = 1.18;
                props.modulation_depth = 0.348;
                return Some(props);
            }
            _ => return None,
        };
        Some(preset.into_props())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_preset_resolves_within_range() {
        for name in REVERB_PRESET_NAMES {
            let props = ReverbProps::preset(name).unwrap();
            assert_eq!(props.clone().clamped(), props, "{} is out of range", name);
        }
    }

    #[test]
    fn lookup_ignores_case_and_rejects_unknown_names() {
        assert_eq!(ReverbProps::preset("HALL"), ReverbProps::preset("hall"));
        assert!(ReverbProps::preset("stadium").is_none());
        let cave = ReverbProps::preset("cave").unwrap();
        assert!(!cave.decay_hf_limit);
        assert_eq!(cave.decay_time, 2.91);
    }
}
