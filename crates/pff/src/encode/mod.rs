//! Block data encodings.
//!
//! A container declares one of three encryption modes in its header. The
//! *compressible* mode is a fixed byte substitution (see [`permute`]); the
//! *high* mode is a three-table cipher keyed by the data identifier of the
//! block (see [`cyclic`]). Neither is cryptography; they exist so that the
//! file does not contain user text verbatim.

pub mod cyclic;
pub mod permute;

const KEY_DATA_R: [u8; 256] = [
    0x41, 0x36, 0x13, 0x62, 0xA8, 0x21, 0x6E, 0xBB,
    0xF4, 0x16, 0xCC, 0x04, 0x7F, 0x64, 0xE8, 0x5D,
    0x1E, 0xF2, 0xCB, 0x2A, 0x74, 0xC5, 0x5E, 0x35,
    0xD2, 0x95, 0x47, 0x9E, 0x96, 0x2D, 0x9A, 0x88,
    0x4C, 0x7D, 0x84, 0x3F, 0xDB, 0xAC, 0x31, 0xB6,
    0x48, 0x5F, 0xF6, 0xC4, 0xD8, 0x39, 0x8B, 0xE7,
    0x23, 0x3B, 0x38, 0x8E, 0xC8, 0xC1, 0xDF, 0x25,
    0xB1, 0x20, 0xA5, 0x46, 0x60, 0x4E, 0x9C, 0xFB,
    0xAA, 0xD3, 0x56, 0x51, 0x45, 0x7C, 0x55, 0x00,
    0x07, 0xC9, 0x2B, 0x9D, 0x85, 0x9B, 0x09, 0xA0,
    0x8F, 0xAD, 0xB3, 0x0F, 0x63, 0xAB, 0x89, 0x4B,
    0xD7, 0xE0, 0x66, 0xE3, 0xF0, 0x0A, 0x02, 0xB9,
    0x17, 0x82, 0x29, 0xEE, 0xD1, 0x8D, 0xEF, 0x97,
    0x87, 0x86, 0x98, 0x11, 0xDE, 0x18, 0x1C, 0x34,
    0x6F, 0xBF, 0xDA, 0xE4, 0x3D, 0x79, 0x06, 0xAE,
    0xFC, 0xE2, 0xF9, 0x6C, 0x99, 0xDD, 0x30, 0x76,
    0x3C, 0x5B, 0x6B, 0xB0, 0x2C, 0x68, 0x6A, 0x2E,
    0x83, 0xF3, 0x78, 0x77, 0xF8, 0xB2, 0xFF, 0x4F,
    0x81, 0xCF, 0x8C, 0xE1, 0x2F, 0xA7, 0xC2, 0x01,
    0x5A, 0x91, 0xEB, 0x3E, 0x67, 0x3A, 0xC7, 0xF1,
    0xDC, 0xBD, 0xE6, 0xD4, 0x1B, 0xF5, 0xE9, 0x90,
    0x9F, 0xBE, 0xB7, 0xD9, 0x19, 0xB5, 0x1F, 0xD0,
    0x0B, 0x93, 0xFD, 0x50, 0x10, 0xFA, 0x0C, 0xA1,
    0x40, 0xCD, 0x92, 0x0D, 0xD5, 0x80, 0x1A, 0x57,
    0xCA, 0x61, 0xA6, 0xEC, 0xBC, 0x15, 0x58, 0x7A,
    0x7E, 0x44, 0xC0, 0x75, 0x28, 0x65, 0x43, 0xAF,
    0xC3, 0x71, 0x26, 0xA2, 0x73, 0x52, 0xBA, 0x5C,
    0x72, 0xCE, 0x08, 0x32, 0x37, 0x22, 0xED, 0x03,
    0x4D, 0x7B, 0xB4, 0x24, 0x42, 0x69, 0x33, 0x05,
    0x94, 0x14, 0x54, 0x6D, 0x59, 0x27, 0x1D, 0x53,
    0xEA, 0x12, 0x8A, 0xE5, 0xA3, 0x0E, 0x70, 0xB8,
    0xD6, 0xA4, 0xC6, 0xF7, 0x49, 0xA9, 0x4A, 0xFE,
];

const KEY_DATA_S: [u8; 256] = [
    0x14, 0x53, 0x0F, 0x56, 0xB3, 0xC8, 0x7A, 0x9C,
    0xEB, 0x65, 0x48, 0x17, 0x16, 0x15, 0x9F, 0x02,
    0xCC, 0x54, 0x7C, 0x83, 0x00, 0x0D, 0x0C, 0x0B,
    0xA2, 0x62, 0xA8, 0x76, 0xDB, 0xD9, 0xED, 0xC7,
    0xC5, 0xA4, 0xDC, 0xAC, 0x85, 0x74, 0xD6, 0xD0,
    0xA7, 0x9B, 0xAE, 0x9A, 0x96, 0x71, 0x66, 0xC3,
    0x63, 0x99, 0xB8, 0xDD, 0x73, 0x92, 0x8E, 0x84,
    0x7D, 0xA5, 0x5E, 0xD1, 0x5D, 0x93, 0xB1, 0x57,
    0x51, 0x50, 0x80, 0x89, 0x52, 0x94, 0x4F, 0x4E,
    0x0A, 0x6B, 0xBC, 0x8D, 0x7F, 0x6E, 0x47, 0x46,
    0x41, 0x40, 0x44, 0x01, 0x11, 0xCB, 0x03, 0x3F,
    0xF7, 0xF4, 0xE1, 0xA9, 0x8F, 0x3C, 0x3A, 0xF9,
    0xD3, 0x64, 0x19, 0x30, 0x61, 0x09, 0x2E, 0xEC,
    0xC6, 0xFC, 0x8A, 0x49, 0xCF, 0xEF, 0x4D, 0xE9,
    0xE4, 0x2D, 0xE2, 0x34, 0x25, 0x91, 0x1B, 0xCE,
    0xA3, 0xB9, 0x06, 0xFE, 0x12, 0x38, 0xB5, 0x4C,
    0x42, 0xDF, 0xFF, 0x13, 0x37, 0x24, 0xB2, 0xE3,
    0xB6, 0x43, 0x6A, 0x9E, 0xE0, 0x4B, 0x36, 0x5C,
    0xE6, 0x75, 0x35, 0x3D, 0x45, 0xFD, 0x2C, 0xF5,
    0xC4, 0x31, 0x2B, 0x29, 0x07, 0xD5, 0x8B, 0x0E,
    0xD4, 0xF6, 0x18, 0x78, 0x21, 0x39, 0xF8, 0x28,
    0x1A, 0x5B, 0xAB, 0xAA, 0x23, 0xF2, 0x2A, 0xE8,
    0xBE, 0x3E, 0x86, 0x04, 0xEA, 0x7E, 0x88, 0xDE,
    0x32, 0x79, 0xF1, 0xC1, 0x4A, 0xFB, 0xB0, 0xC9,
    0xFA, 0xBB, 0xCA, 0x2F, 0x98, 0x20, 0x68, 0x1F,
    0x05, 0xBF, 0xC2, 0x55, 0x10, 0xD2, 0x77, 0x6C,
    0x27, 0x3B, 0xCD, 0x60, 0xA0, 0x9D, 0x26, 0xE7,
    0xDA, 0x1D, 0xD8, 0x1C, 0x22, 0x33, 0xB7, 0x81,
    0x8C, 0x5A, 0x72, 0x87, 0x70, 0xF3, 0x90, 0xD7,
    0xAF, 0x6F, 0xB4, 0x08, 0x67, 0x1E, 0xF0, 0x6D,
    0xEE, 0xBA, 0xAD, 0xE5, 0x59, 0x97, 0xA1, 0x58,
    0xA6, 0x5F, 0xC0, 0xBD, 0x69, 0x95, 0x7B, 0x82,
];

/// The decode table is the inverse permutation of [`KEY_DATA_R`].
const fn invert(table: &[u8; 256]) -> [u8; 256] {
    let mut inverse = [0_u8; 256];
    let mut index = 0;
    while index < 256 {
        inverse[table[index] as usize] = index as u8;
        index += 1;
    }
    inverse
}

const KEY_DATA_I: [u8; 256] = invert(&KEY_DATA_R);
