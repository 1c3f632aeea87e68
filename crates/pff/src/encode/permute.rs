//! Compressible encoding.
//!
//! Each payload byte is replaced through a fixed 256-byte permutation;
//! decoding runs the bytes through the inverse permutation. Because the
//! mapping is position-independent it preserves byte frequencies, which is
//! what keeps encoded files compressible.

use super::{KEY_DATA_I, KEY_DATA_R};

/// Encode a payload in place.
pub fn encode_data(data: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte = KEY_DATA_R[usize::from(*byte)];
    }
}

/// Decode a payload in place.
pub fn decode_data(data: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte = KEY_DATA_I[usize::from(*byte)];
    }
}
