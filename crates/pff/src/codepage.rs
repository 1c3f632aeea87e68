//! ASCII codepage handling for narrow strings stored by older clients.
//!
//! The store engine itself never interprets strings, but the codepage is
//! container-wide state that property decoders read off the handle, so it is
//! validated and kept here.

use codepage_strings::Coding;

use crate::{PffError, PffResult};

/// Codepage identifiers accepted by [`crate::PffFile::set_ascii_codepage`].
const SUPPORTED_CODEPAGES: &[(u16, u16)] = &[
    (874, 874),
    (932, 932),
    (936, 936),
    (949, 949),
    (950, 950),
    (1250, 1258),
    (20127, 20127),
    (20866, 20866),
    (21866, 21866),
    (28591, 28606),
];

/// US-ASCII, the identity codepage.
pub const CODEPAGE_ASCII: u16 = 20127;

fn is_supported(codepage: u16) -> bool {
    SUPPORTED_CODEPAGES
        .iter()
        .any(|(first, last)| (*first..=*last).contains(&codepage))
}

/// A validated narrow-string codepage.
#[derive(Clone, Debug)]
pub struct AsciiCodepage {
    codepage: u16,
    coding: Option<Coding>,
}

impl AsciiCodepage {
    pub fn new(codepage: u16) -> PffResult<Self> {
        if !is_supported(codepage) {
            return Err(PffError::InvalidArgument(format!(
                "unsupported ASCII codepage: {codepage}"
            )));
        }
        let coding = if codepage == CODEPAGE_ASCII {
            None
        } else {
            Some(Coding::new(codepage).map_err(|_| {
                PffError::InvalidArgument(format!("unsupported ASCII codepage: {codepage}"))
            })?)
        };
        Ok(Self { codepage, coding })
    }

    pub fn codepage(&self) -> u16 {
        self.codepage
    }

    /// Decode a narrow string; bytes outside the codepage map to the
    /// replacement character.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match &self.coding {
            Some(coding) => coding.decode_lossy(bytes).into_owned(),
            None => bytes
                .iter()
                .map(|b| {
                    if b.is_ascii() {
                        char::from(*b)
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }
}

impl Default for AsciiCodepage {
    fn default() -> Self {
        Self {
            codepage: CODEPAGE_ASCII,
            coding: None,
        }
    }
}
