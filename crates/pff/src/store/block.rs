//! The data-block codec: framed read, footer verification, decryption and
//! decompression.
//!
//! A block occupies a stride-rounded region with its footer at the end of
//! the region. The footer back pointer must match the identifier used to
//! reach the block; that check is what distinguishes a stale extent from a
//! live one. A checksum mismatch is logged and tolerated. Each block is
//! decrypted exactly once, here.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::warn;

use super::{EncryptionMode, FileVariant, IoHandle, VariantLayout};
use crate::{
    crc::compute_weak_crc32,
    encode::{cyclic, permute},
    BadBlock, PffReader, PffResult,
};

/// The stride-rounded on-disk size of a block with `size` payload-plus-footer
/// bytes.
pub(crate) fn framed_size(size: u32, layout: &VariantLayout) -> u32 {
    let stride = layout.block_stride as u32;
    if size >= layout.maximum_block_size {
        layout.maximum_block_size
    } else {
        size.div_ceil(stride) * stride
    }
}

/// A parsed data-block footer. `uncompressed_size` is zero outside the
/// 64-bit-4k variant.
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct BlockFooter {
    pub data_size: u16,
    #[allow(dead_code)]
    pub signature: u16,
    pub checksum: u32,
    pub back_pointer: u64,
    /// Read and preserved on the 4k variant, never interpreted.
    #[allow(dead_code)]
    pub unknown1: u16,
    pub uncompressed_size: u16,
    #[allow(dead_code)]
    pub unknown2: u32,
}

impl BlockFooter {
    pub fn parse(data: &[u8], variant: FileVariant) -> PffResult<Self> {
        let mut cursor = Cursor::new(data);
        let data_size = cursor.read_u16::<LittleEndian>()?;
        let signature = cursor.read_u16::<LittleEndian>()?;
        match variant {
            FileVariant::Ansi => {
                let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
                let checksum = cursor.read_u32::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    ..Default::default()
                })
            }
            FileVariant::Unicode => {
                let checksum = cursor.read_u32::<LittleEndian>()?;
                let back_pointer = cursor.read_u64::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    ..Default::default()
                })
            }
            FileVariant::Unicode4k => {
                let checksum = cursor.read_u32::<LittleEndian>()?;
                let back_pointer = cursor.read_u64::<LittleEndian>()?;
                let unknown1 = cursor.read_u16::<LittleEndian>()?;
                let uncompressed_size = cursor.read_u16::<LittleEndian>()?;
                let unknown2 = cursor.read_u32::<LittleEndian>()?;
                Ok(Self {
                    data_size,
                    signature,
                    checksum,
                    back_pointer,
                    unknown1,
                    uncompressed_size,
                    unknown2,
                })
            }
        }
    }
}

/// Read, verify, decrypt and (on the 4k variant) decompress one block.
pub(crate) fn read_block(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    file_offset: u64,
    data_size: u32,
    expected_back_pointer: u64,
) -> PffResult<Vec<u8>> {
    let layout = &io.layout;
    if data_size == 0 || data_size > layout.maximum_data_size() {
        return Err(BadBlock::InvalidDataSize(data_size).into());
    }
    if file_offset == 0 || file_offset >= io.file_size {
        return Err(BadBlock::InvalidFileOffset(file_offset).into());
    }

    let region_size = framed_size(data_size + layout.block_footer_size as u32, layout);
    let mut region = vec![0_u8; region_size as usize];
    reader.seek(SeekFrom::Start(file_offset))?;
    reader.read_exact(&mut region)?;

    let footer = BlockFooter::parse(
        &region[region.len() - layout.block_footer_size..],
        io.variant,
    )?;

    if footer.back_pointer != expected_back_pointer {
        return Err(BadBlock::WrongBackPointer {
            expected: expected_back_pointer,
            stored: footer.back_pointer,
        }
        .into());
    }
    if u32::from(footer.data_size) != data_size {
        return Err(BadBlock::WrongDataSize {
            declared: data_size,
            stored: footer.data_size,
        }
        .into());
    }

    let mut data = region;
    data.truncate(data_size as usize);

    let calculated = compute_weak_crc32(0, &data);
    if calculated != footer.checksum {
        warn!(
            name: "PffBlockChecksumMismatch",
            offset = format_args!("0x{file_offset:08X}"),
            stored = format_args!("0x{:08X}", footer.checksum),
            calculated = format_args!("0x{calculated:08X}"),
            "Data block checksum mismatch"
        );
    }

    decrypt(&mut data, io.encryption, expected_back_pointer);

    if io.variant == FileVariant::Unicode4k
        && footer.uncompressed_size != 0
        && footer.uncompressed_size != footer.data_size
    {
        let mut decoder = flate2::read::ZlibDecoder::new(data.as_slice());
        let mut uncompressed = Vec::with_capacity(usize::from(footer.uncompressed_size));
        decoder
            .read_to_end(&mut uncompressed)
            .map_err(|error| BadBlock::Decompress(error.to_string()))?;
        data = uncompressed;
    }

    Ok(data)
}

/// Apply the container's encryption mode once. The key of the high mode is
/// the low half of the data identifier.
pub(crate) fn decrypt(data: &mut [u8], encryption: EncryptionMode, identifier: u64) {
    match encryption {
        EncryptionMode::None => {}
        EncryptionMode::Compressible => permute::decode_data(data),
        EncryptionMode::High => cyclic::transform_data(data, identifier as u32),
    }
}
