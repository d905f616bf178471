//! Stages that run on the device buses after all contexts have mixed.

pub mod bformatdec;
pub mod bs2b;
pub mod distance_comp;
pub mod limiter;
pub mod output;
pub mod uhj;

pub use bformatdec::{BFormatDec, ChannelDec, FrontStablizer};
pub use bs2b::Bs2b;
pub use distance_comp::{DistanceComp, MAX_DELAY_LENGTH};
pub use limiter::{Compressor, CompressorParams};
pub use output::{
    apply_dither, write_interleaved, write_planar, OutputBuffer, OutputSample, DITHER_RNG_SEED,
};
pub use uhj::{PhaseShifter, UhjDecoder, UhjEncoder, DEFAULT_STEREO_WIDTH, UHJ_FILTER_DELAY};

/// Delays `samples` by `delay.len()` samples through the line `delay`, which
/// holds the tail of the previous call.
pub(crate) fn delay_samples(samples: &mut [f32], delay: &mut [f32]) {
    let n = samples.len();
    let d = delay.len();
    if d == 0 {
        return;
    }
    if n >= d {
        samples.rotate_right(d);
        samples[..d].swap_with_slice(delay);
    } else {
        samples.swap_with_slice(&mut delay[..n]);
        delay.rotate_left(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_carries_across_calls() {
        let mut line = [0.0f32; 3];
        let mut a = [1.0, 2.0, 3.0, 4.0, 5.0];
        delay_samples(&mut a, &mut line);
        assert_eq!(a, [0.0, 0.0, 0.0, 1.0, 2.0]);
        assert_eq!(line, [3.0, 4.0, 5.0]);

        // Shorter than the delay.
        let mut b = [6.0, 7.0];
        delay_samples(&mut b, &mut line);
        assert_eq!(b, [3.0, 4.0]);
        assert_eq!(line, [5.0, 6.0, 7.0]);
    }
}
