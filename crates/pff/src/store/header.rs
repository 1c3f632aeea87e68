//! Container file header.
//!
//! The header names the variant and the encryption mode, records the
//! container size, and points at the root pages of the two indexes. Only a
//! wrong magic or an unknown version fails the open: everything else is
//! logged and tolerated, because this header is routinely read from files
//! that were never closed cleanly.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::warn;

use super::{EncryptionMode, FileVariant};
use crate::{crc::compute_weak_crc32, PffError, PffReader, PffResult};

/// `!BDN`, read little-endian.
const HEADER_MAGIC: u32 = 0x4E44_4221;

const HEADER_CONTENT_TAG: u16 = 0x4D53;

const HEADER_SENTINEL: u8 = 0x80;

/// Bytes covered by the partial header checksum, starting after the magic
/// and the checksum itself.
const PARTIAL_CRC_SIZE: usize = 471;

/// Root page reference of one index.
#[derive(Copy, Clone, Default, Debug)]
pub struct IndexRoot {
    pub file_offset: u64,
    pub back_pointer: u64,
}

pub struct FileHeader {
    pub variant: FileVariant,
    pub encryption: EncryptionMode,
    /// `ibFileEof`: the container size as recorded at the last clean write.
    pub file_eof: u64,
    pub descriptors_root: IndexRoot,
    pub offsets_root: IndexRoot,
}

impl FileHeader {
    pub fn read(reader: &mut dyn PffReader) -> PffResult<Self> {
        reader.seek(SeekFrom::Start(0))?;

        // dwMagic
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != HEADER_MAGIC {
            return Err(PffError::NotPff(magic));
        }

        // dwCRCPartial
        let crc_partial = reader.read_u32::<LittleEndian>()?;

        let mut data = vec![0_u8; PARTIAL_CRC_SIZE];
        reader.read_exact(&mut data)?;
        let calculated = compute_weak_crc32(0, &data);
        if calculated != crc_partial {
            warn!(
                name: "PffHeaderChecksumMismatch",
                stored = format_args!("0x{crc_partial:08X}"),
                calculated = format_args!("0x{calculated:08X}"),
                "Header partial checksum mismatch"
            );
        }

        let mut cursor = Cursor::new(data.as_slice());

        // wMagicClient
        let content_tag = cursor.read_u16::<LittleEndian>()?;
        if content_tag != HEADER_CONTENT_TAG {
            warn!(
                name: "PffHeaderContentTagMismatch",
                content_tag = format_args!("0x{content_tag:04X}"),
                "Unexpected header content tag"
            );
        }

        // wVer
        let version = cursor.read_u16::<LittleEndian>()?;
        let variant = FileVariant::try_from(version)?;

        if variant == FileVariant::Ansi {
            Self::read_ansi(&mut cursor, variant)
        } else {
            // The 64-bit header body extends past the partial checksum
            // coverage; pull in the remainder before parsing the body.
            let mut data = data;
            let mut tail = vec![0_u8; 45];
            reader.read_exact(&mut tail)?;
            data.extend_from_slice(&tail);

            // dwCRCFull
            let crc_full = reader.read_u32::<LittleEndian>()?;
            let calculated = compute_weak_crc32(0, &data);
            if calculated != crc_full {
                warn!(
                    name: "PffHeaderChecksumMismatch",
                    stored = format_args!("0x{crc_full:08X}"),
                    calculated = format_args!("0x{calculated:08X}"),
                    "Header full checksum mismatch"
                );
            }

            Self::read_unicode(&mut Cursor::new(data.as_slice()), variant)
        }
    }

    /// Header body of the 32-bit variant. Offsets are relative to the end
    /// of the checksum field.
    fn read_ansi(cursor: &mut Cursor<&[u8]>, variant: FileVariant) -> PffResult<Self> {
        // wVerClient, bPlatformCreate, bPlatformAccess, dwReserved1,
        // dwReserved2, bidNextB, bidNextP, dwUnique, rgnid
        cursor.seek(SeekFrom::Start(156))?;

        // ROOT: dwReserved
        let _ = cursor.read_u32::<LittleEndian>()?;
        // ibFileEof
        let file_eof = u64::from(cursor.read_u32::<LittleEndian>()?);
        // ibAMapLast, cbAMapFree, cbPMapFree
        cursor.seek(SeekFrom::Current(12))?;
        // BREF of the descriptors index root
        let descriptors_root = IndexRoot {
            back_pointer: u64::from(cursor.read_u32::<LittleEndian>()?),
            file_offset: u64::from(cursor.read_u32::<LittleEndian>()?),
        };
        // BREF of the offsets index root
        let offsets_root = IndexRoot {
            back_pointer: u64::from(cursor.read_u32::<LittleEndian>()?),
            file_offset: u64::from(cursor.read_u32::<LittleEndian>()?),
        };

        // fAMapValid, bReserved, wReserved, rgbFM, rgbFP
        cursor.seek(SeekFrom::Start(452))?;

        // bSentinel
        let sentinel = cursor.read_u8()?;
        if sentinel != HEADER_SENTINEL {
            warn!(
                name: "PffHeaderSentinelMismatch",
                sentinel = format_args!("0x{sentinel:02X}"),
                "Unexpected header sentinel"
            );
        }

        // bCryptMethod
        let encryption = EncryptionMode::try_from(cursor.read_u8()?)?;

        Ok(Self {
            variant,
            encryption,
            file_eof,
            descriptors_root,
            offsets_root,
        })
    }

    /// Header body shared by the 64-bit and 64-bit-4k variants.
    fn read_unicode(cursor: &mut Cursor<&[u8]>, variant: FileVariant) -> PffResult<Self> {
        // wVerClient through rgnid and qwUnused
        cursor.seek(SeekFrom::Start(172))?;

        // ROOT: dwReserved
        let _ = cursor.read_u32::<LittleEndian>()?;
        // ibFileEof
        let file_eof = cursor.read_u64::<LittleEndian>()?;
        // ibAMapLast, cbAMapFree, cbPMapFree
        cursor.seek(SeekFrom::Current(24))?;
        let descriptors_root = IndexRoot {
            back_pointer: cursor.read_u64::<LittleEndian>()?,
            file_offset: cursor.read_u64::<LittleEndian>()?,
        };
        let offsets_root = IndexRoot {
            back_pointer: cursor.read_u64::<LittleEndian>()?,
            file_offset: cursor.read_u64::<LittleEndian>()?,
        };

        // fAMapValid, reserved, dwAlign, rgbFM, rgbFP
        cursor.seek(SeekFrom::Start(504))?;

        // bSentinel
        let sentinel = cursor.read_u8()?;
        if sentinel != HEADER_SENTINEL {
            warn!(
                name: "PffHeaderSentinelMismatch",
                sentinel = format_args!("0x{sentinel:02X}"),
                "Unexpected header sentinel"
            );
        }

        // bCryptMethod
        let encryption = EncryptionMode::try_from(cursor.read_u8()?)?;

        Ok(Self {
            variant,
            encryption,
            file_eof,
            descriptors_root,
            offsets_root,
        })
    }
}
