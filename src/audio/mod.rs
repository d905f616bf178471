pub mod buffer;
pub mod bus;

pub use buffer::{
    AmbiLayout, AmbiScaling, Buffer, BufferCallback, BufferQueueItem, ChannelLayout, SampleType,
};
pub use bus::{MixParams, RealMixParams};

/// Number of samples processed per mixing step. Every internal bus is built
/// from lines of this length.
pub const BUFFER_LINE_SIZE: usize = 1024;

pub type FloatBufferLine = [f32; BUFFER_LINE_SIZE];

pub const MAX_SENDS: usize = 6;

/// Upper bound on output (and dry bus) channels.
pub const MAX_OUTPUT_CHANNELS: usize = 16;

/// -100 dB. Gains below this are treated as silent.
pub const GAIN_SILENCE_THRESHOLD: f32 = 0.00001;

/// +60 dB.
pub const GAIN_MIX_MAX: f32 = 1000.0;

pub const SPEED_OF_SOUND_METERS_PER_SEC: f32 = 343.3;

/// Air absorption high-frequency gain per meter (-0.05 dB).
pub const AIR_ABSORB_GAIN_HF: f32 = 0.99426;

/// -60 dB, the reference level for reverb decay times.
pub const REVERB_DECAY_GAIN: f32 = 0.001;

pub fn new_lines(count: usize) -> Vec<FloatBufferLine> {
    vec![[0.0; BUFFER_LINE_SIZE]; count]
}

pub fn clear_lines(lines: &mut [FloatBufferLine]) {
    for line in lines.iter_mut() {
        line.fill(0.0);
    }
}

/// Physical speaker positions a device channel can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    FrontLeft = 0,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
    Aux0,
    Aux1,
    Aux2,
    Aux3,
    Aux4,
    Aux5,
    Aux6,
    Aux7,
    Aux8,
    Aux9,
    Aux10,
    Aux11,
    Aux12,
    Aux13,
    Aux14,
    Aux15,
}

pub const MAX_CHANNEL_NAMES: usize = Channel::Aux15 as usize + 1;

impl Channel {
    pub fn label(self) -> &'static str {
        match self {
            Channel::FrontLeft => "front-left",
            Channel::FrontRight => "front-right",
            Channel::FrontCenter => "front-center",
            Channel::Lfe => "lfe",
            Channel::BackLeft => "back-left",
            Channel::BackRight => "back-right",
            Channel::BackCenter => "back-center",
            Channel::SideLeft => "side-left",
            Channel::SideRight => "side-right",
            _ => "aux",
        }
    }

    pub fn aux(index: usize) -> Channel {
        const AUX: [Channel; 16] = [
            Channel::Aux0,
            Channel::Aux1,
            Channel::Aux2,
            Channel::Aux3,
            Channel::Aux4,
            Channel::Aux5,
            Channel::Aux6,
            Channel::Aux7,
            Channel::Aux8,
            Channel::Aux9,
            Channel::Aux10,
            Channel::Aux11,
            Channel::Aux12,
            Channel::Aux13,
            Channel::Aux14,
            Channel::Aux15,
        ];
        AUX[index.min(15)]
    }
}

/// Clamped linear interpolation helper used throughout the mixers.
#[inline(always)]
pub fn lerpf(a: f32, b: f32, mu: f32) -> f32 {
    a + (b - a) * mu
}

/// 4-point Catmull-Rom interpolation between `val1` and `val2`.
#[inline(always)]
pub fn cubic(val0: f32, val1: f32, val2: f32, val3: f32, mu: f32) -> f32 {
    let mu2 = mu * mu;
    let mu3 = mu2 * mu;
    let a0 = -0.5 * mu3 + mu2 + -0.5 * mu;
    let a1 = 1.5 * mu3 + -2.5 * mu2 + 1.0;
    let a2 = -1.5 * mu3 + 2.0 * mu2 + 0.5 * mu;
    let a3 = 0.5 * mu3 + -0.5 * mu2;
    val0 * a0 + val1 * a1 + val2 * a2 + val3 * a3
}
