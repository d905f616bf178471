//! The effect of an empty slot: produces nothing.

use crate::audio::{Buffer, FloatBufferLine};
use crate::device::DeviceInfo;
use crate::error::Result;

use super::{EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams};

#[derive(Debug, Default)]
pub struct NullState;

impl EffectProcessor for NullState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        Ok(())
    }

    fn update(
        &mut self,
        _device: &DeviceInfo,
        _slot: &SlotParams,
        _props: &EffectProps,
        _target: EffectTarget<'_>,
    ) -> OutTarget {
        OutTarget::Main
    }

    fn process(&mut self, _samples_to_do: usize, _input: &[FloatBufferLine], _output: &mut [FloatBufferLine]) {}
}
