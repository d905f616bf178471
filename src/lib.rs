//! A software 3D audio mixer.
//!
//! A [`Device`] owns the output format and the render loop. Each
//! [`Context`] on it holds a listener, sources that play [`Buffer`]s and
//! auxiliary effect slots. The application drives a context from its own
//! thread while the render callback calls [`Device::render_samples`].

pub mod ambisonic;
pub mod audio;
pub mod biquad;
pub mod config;
pub mod context;
pub mod device;
pub mod effect_slot;
pub mod effects;
pub mod error;
pub mod events;
pub mod hrtf;
pub mod mixer;
pub mod postprocess;
pub mod props;
pub mod resampler;
pub mod voice;

pub use audio::{AmbiLayout, AmbiScaling, Buffer, ChannelLayout, SampleType};
pub use config::{DevChannels, DevSampleType, DeviceConfig, HrtfMode, RenderMode, StereoEncoding};
pub use context::{Context, ContextProps, SourceHandle, SourceOffset};
pub use device::{Device, DeviceClock, DeviceInfo};
pub use effect_slot::{EffectSlot, EffectSlotProps, SlotId};
pub use effects::{EffectProps, EffectType};
pub use error::{MixerError, Result};
pub use events::{Event, SourceState, WarningKind};
pub use hrtf::HrtfStore;
pub use postprocess::OutputBuffer;
pub use resampler::Resampler;
pub use voice::{DistanceModel, VoiceProps};
