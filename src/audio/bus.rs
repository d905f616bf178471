//! Descriptions of the mix buses voices and effects render into.

use crate::ambisonic::{BFChannelConfig, MAX_AMBI_CHANNELS};

use super::{Channel, MAX_CHANNEL_NAMES};

/// An ambisonic bus: channel `i` carries the component `ambi_map[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct MixParams {
    pub ambi_map: Vec<BFChannelConfig>,
}

impl MixParams {
    /// A bus of `count` ACN/N3D channels with unit scale.
    pub fn acn_identity(count: usize) -> Self {
        Self {
            ambi_map: (0..count.min(MAX_AMBI_CHANNELS)).map(BFChannelConfig::acn).collect(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.ambi_map.len()
    }
}

/// The physical output bus: where each named speaker lives, if anywhere.
#[derive(Clone, Debug, PartialEq)]
pub struct RealMixParams {
    pub channel_index: [Option<usize>; MAX_CHANNEL_NAMES],
    pub num_channels: usize,
}

impl RealMixParams {
    pub fn new(channels: &[Channel]) -> Self {
        let mut channel_index = [None; MAX_CHANNEL_NAMES];
        for (idx, &chan) in channels.iter().enumerate() {
            channel_index[chan as usize] = Some(idx);
        }
        Self {
            channel_index,
            num_channels: channels.len(),
        }
    }

    pub fn index_of(&self, chan: Channel) -> Option<usize> {
        self.channel_index[chan as usize]
    }
}
