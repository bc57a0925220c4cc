//! In-band DTMF detection and generation on 8 kHz mono PCM.
//!
//! The detector evaluates fixed-point Goertzel filters over 102-sample
//! windows and commits a digit only on the rising edge after a no-tone
//! window, so a sustained key press yields the digit exactly once.
//! The generator runs the matching recursive oscillator pair and is
//! mainly used to synthesize key presses in tests and probing tools.

mod detector;
mod generator;

pub use detector::DtmfDetector;
pub use generator::DtmfGenerator;

/// Rounded Q15 multiply of a filter coefficient with a wide
/// accumulator, decomposed into the unsigned low half and the signed
/// high half to keep the 48-bit intermediate precision of the ITU
/// reference primitives
fn mpy48sr(coeff: i16, x: i64) -> i64 {
    let lo = (((x & 0xFFFF) * i64::from(coeff)) + 0x4000) >> 15;
    let hi = (x >> 16) * i64::from(coeff);
    (hi << 1) + lo
}
