pub mod biquad;
pub mod nfc;
pub mod splitter;

pub use biquad::{Biquad, BiquadType};
pub use nfc::NfcFilter;
pub use splitter::BandSplitter;
