//! One B-tree page of the descriptors or offsets index.
//!
//! The footer layout depends on the container variant; the page layout is
//! never trusted blindly. Entry sizes and counts are recomputed from the
//! variant and the stored values are clamped to them, a CRC mismatch is
//! logged but does not fail the parse, and a corrupted type byte falls back
//! to its stored copy when only one of the two is valid.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::warn;

use super::{FileVariant, IndexType, VariantLayout};
use crate::{crc::compute_weak_crc32, BadBlock, PffReader, PffResult};

/// Leaf nodes are level 0.
pub const NODE_LEVEL_LEAF: u8 = 0;

pub struct IndexNode {
    node_type: IndexType,
    level: u8,
    number_of_entries: u16,
    maximum_number_of_entries: u16,
    entry_size: u8,
    back_pointer: u64,
    stored_checksum: u32,
    signature: u16,
    data: Vec<u8>,
}

struct Footer {
    number_of_entries: u16,
    maximum_number_of_entries: u16,
    entry_size: u8,
    level: u8,
    node_type: u8,
    node_type_copy: u8,
    signature: u16,
    back_pointer: u64,
    checksum: u32,
}

fn read_footer(data: &[u8], layout: &VariantLayout) -> PffResult<Footer> {
    let mut cursor = Cursor::new(data);
    match layout.variant {
        FileVariant::Ansi => {
            let number_of_entries = u16::from(cursor.read_u8()?);
            let maximum_number_of_entries = u16::from(cursor.read_u8()?);
            let entry_size = cursor.read_u8()?;
            let level = cursor.read_u8()?;
            let node_type = cursor.read_u8()?;
            let node_type_copy = cursor.read_u8()?;
            let signature = cursor.read_u16::<LittleEndian>()?;
            let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
            let checksum = cursor.read_u32::<LittleEndian>()?;
            Ok(Footer {
                number_of_entries,
                maximum_number_of_entries,
                entry_size,
                level,
                node_type,
                node_type_copy,
                signature,
                back_pointer,
                checksum,
            })
        }
        FileVariant::Unicode => {
            let number_of_entries = u16::from(cursor.read_u8()?);
            let maximum_number_of_entries = u16::from(cursor.read_u8()?);
            let entry_size = cursor.read_u8()?;
            let level = cursor.read_u8()?;
            // padding1
            cursor.seek(SeekFrom::Current(4))?;
            let node_type = cursor.read_u8()?;
            let node_type_copy = cursor.read_u8()?;
            let signature = cursor.read_u16::<LittleEndian>()?;
            let checksum = cursor.read_u32::<LittleEndian>()?;
            let back_pointer = cursor.read_u64::<LittleEndian>()?;
            Ok(Footer {
                number_of_entries,
                maximum_number_of_entries,
                entry_size,
                level,
                node_type,
                node_type_copy,
                signature,
                back_pointer,
                checksum,
            })
        }
        FileVariant::Unicode4k => {
            let number_of_entries = cursor.read_u16::<LittleEndian>()?;
            let maximum_number_of_entries = cursor.read_u16::<LittleEndian>()?;
            let entry_size = cursor.read_u8()?;
            let level = cursor.read_u8()?;
            // padding1
            cursor.seek(SeekFrom::Current(10))?;
            let node_type = cursor.read_u8()?;
            let node_type_copy = cursor.read_u8()?;
            let signature = cursor.read_u16::<LittleEndian>()?;
            let checksum = cursor.read_u32::<LittleEndian>()?;
            let back_pointer = cursor.read_u64::<LittleEndian>()?;
            // unknown1 is read and preserved in the page bytes, never
            // interpreted.
            cursor.seek(SeekFrom::Current(8))?;
            Ok(Footer {
                number_of_entries,
                maximum_number_of_entries,
                entry_size,
                level,
                node_type,
                node_type_copy,
                signature,
                back_pointer,
                checksum,
            })
        }
    }
}

impl IndexNode {
    /// Parse one page. `data` must be exactly `layout.page_size` bytes.
    pub fn parse(data: Vec<u8>, layout: &VariantLayout) -> PffResult<Self> {
        if data.len() < layout.page_size {
            return Err(BadBlock::TruncatedPage(data.len()).into());
        }
        let footer = read_footer(&data[layout.entries_size..], layout)?;

        let mut node_type_byte = footer.node_type;
        if footer.node_type != footer.node_type_copy {
            warn!(
                name: "PffIndexNodeTypeMismatch",
                node_type = footer.node_type,
                node_type_copy = footer.node_type_copy,
                "Index node type and its copy differ"
            );
            if IndexType::try_from(footer.node_type).is_err()
                && IndexType::try_from(footer.node_type_copy).is_ok()
            {
                node_type_byte = footer.node_type_copy;
            }
        }
        let node_type = IndexType::try_from(node_type_byte)?;

        let calculated_checksum = compute_weak_crc32(0, &data[..layout.checksum_size]);
        if calculated_checksum != footer.checksum {
            warn!(
                name: "PffIndexNodeChecksumMismatch",
                stored = format_args!("0x{:08X}", footer.checksum),
                calculated = format_args!("0x{:08X}", calculated_checksum),
                "Index node checksum mismatch"
            );
        }

        let leaf = footer.level == NODE_LEVEL_LEAF;
        let calculated_entry_size = if node_type == IndexType::Descriptor && leaf {
            layout.descriptor_entry_size
        } else {
            layout.branch_entry_size
        };
        let calculated_maximum = (layout.entries_size / usize::from(calculated_entry_size)) as u16;

        let mut entry_size = footer.entry_size;
        if entry_size != 0 && entry_size != calculated_entry_size {
            warn!(
                name: "PffIndexNodeEntrySizeMismatch",
                stored = entry_size,
                calculated = calculated_entry_size,
                "Index node entry size mismatch"
            );
            entry_size = calculated_entry_size;
        }
        if entry_size == 0 {
            entry_size = calculated_entry_size;
        }

        let mut maximum_number_of_entries = footer.maximum_number_of_entries;
        if maximum_number_of_entries != 0 && maximum_number_of_entries != calculated_maximum {
            warn!(
                name: "PffIndexNodeMaximumEntriesMismatch",
                stored = maximum_number_of_entries,
                calculated = calculated_maximum,
                "Index node maximum number of entries mismatch"
            );
            maximum_number_of_entries = calculated_maximum;
        }
        if maximum_number_of_entries == 0 {
            maximum_number_of_entries = calculated_maximum;
        }

        let mut number_of_entries = footer.number_of_entries;
        if number_of_entries > maximum_number_of_entries {
            warn!(
                name: "PffIndexNodeEntryCountClamped",
                stored = number_of_entries,
                maximum = maximum_number_of_entries,
                "Index node entry count exceeds maximum"
            );
            number_of_entries = maximum_number_of_entries;
        }

        if usize::from(number_of_entries) * usize::from(entry_size) > layout.entries_size {
            return Err(BadBlock::EntriesExceedPage {
                entries: number_of_entries,
                entry_size,
            }
            .into());
        }

        Ok(Self {
            node_type,
            level: footer.level,
            number_of_entries,
            maximum_number_of_entries,
            entry_size,
            back_pointer: footer.back_pointer,
            stored_checksum: footer.checksum,
            signature: footer.signature,
            data,
        })
    }

    /// Seek to `offset` and parse the page found there.
    pub fn read_from(
        reader: &mut dyn PffReader,
        offset: u64,
        layout: &VariantLayout,
    ) -> PffResult<Self> {
        reader.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0; layout.page_size];
        reader.read_exact(&mut data)?;
        Self::parse(data, layout)
    }

    pub fn node_type(&self) -> IndexType {
        self.node_type
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == NODE_LEVEL_LEAF
    }

    pub fn number_of_entries(&self) -> u16 {
        self.number_of_entries
    }

    pub fn maximum_number_of_entries(&self) -> u16 {
        self.maximum_number_of_entries
    }

    pub fn entry_size(&self) -> u8 {
        self.entry_size
    }

    pub fn back_pointer(&self) -> u64 {
        self.back_pointer
    }

    pub fn stored_checksum(&self) -> u32 {
        self.stored_checksum
    }

    pub fn signature(&self) -> u16 {
        self.signature
    }

    /// The raw bytes of one entry slot. Slots up to the maximum are
    /// addressable; the recovery scanner reads past `number_of_entries`.
    pub fn entry_data(&self, index: u16) -> Option<&[u8]> {
        if index >= self.maximum_number_of_entries {
            return None;
        }
        let offset = usize::from(index) * usize::from(self.entry_size);
        let end = offset + usize::from(self.entry_size);
        self.data.get(offset..end)
    }
}
