//! In-memory container builders shared by the unit tests.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use super::{EncryptionMode, FileVariant, IndexType, VariantLayout};
use crate::crc::compute_weak_crc32;
use crate::encode::{cyclic, permute};

/// A real 32-bit offsets-index leaf page: 22 entries, back pointer `0x11F`,
/// stored checksum `0xD3167F0B`.
pub(crate) fn test_index_node_32bit() -> [u8; 512] {
    TEST_INDEX_NODE_32BIT
}

const TEST_INDEX_NODE_32BIT: [u8; 512] = [
    0x0C, 0x01, 0x00, 0x00, 0x40, 0x7C, 0x00, 0x00, 0x54, 0x00, 0x02, 0x00, 0x14, 0x01, 0x00, 0x00,
    0x00, 0x69, 0x00, 0x00, 0x26, 0x00, 0x02, 0x00, 0x24, 0x01, 0x00, 0x00, 0x00, 0xA0, 0x00, 0x00,
    0x70, 0x00, 0x02, 0x00, 0x2C, 0x01, 0x00, 0x00, 0x40, 0x89, 0x00, 0x00, 0x60, 0x00, 0x02, 0x00,
    0x38, 0x01, 0x00, 0x00, 0xC0, 0x89, 0x00, 0x00, 0x60, 0x00, 0x02, 0x00, 0x44, 0x01, 0x00, 0x00,
    0x80, 0xA0, 0x00, 0x00, 0x7A, 0x03, 0x02, 0x00, 0x48, 0x01, 0x00, 0x00, 0x40, 0xA4, 0x00, 0x00,
    0x0A, 0x01, 0x02, 0x00, 0x4E, 0x01, 0x00, 0x00, 0x00, 0x67, 0x00, 0x00, 0x10, 0x00, 0x02, 0x00,
    0x54, 0x01, 0x00, 0x00, 0x40, 0x7B, 0x00, 0x00, 0x58, 0x00, 0x02, 0x00, 0x60, 0x01, 0x00, 0x00,
    0x80, 0x8B, 0x00, 0x00, 0xF4, 0x00, 0x02, 0x00, 0x64, 0x01, 0x00, 0x00, 0x80, 0x8C, 0x00, 0x00,
    0x56, 0x01, 0x02, 0x00, 0x68, 0x01, 0x00, 0x00, 0x00, 0x8E, 0x00, 0x00, 0x8A, 0x01, 0x02, 0x00,
    0x6C, 0x01, 0x00, 0x00, 0x00, 0x60, 0x00, 0x00, 0x84, 0x00, 0x02, 0x00, 0x84, 0x01, 0x00, 0x00,
    0xC0, 0x60, 0x00, 0x00, 0x8E, 0x00, 0x02, 0x00, 0x88, 0x01, 0x00, 0x00, 0x40, 0x64, 0x00, 0x00,
    0x96, 0x00, 0x02, 0x00, 0x8E, 0x01, 0x00, 0x00, 0x80, 0x61, 0x00, 0x00, 0x10, 0x00, 0x02, 0x00,
    0x90, 0x01, 0x00, 0x00, 0x80, 0xA5, 0x00, 0x00, 0x62, 0x02, 0x02, 0x00, 0xCC, 0x01, 0x00, 0x00,
    0xC0, 0x61, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00, 0xDC, 0x01, 0x00, 0x00, 0xC0, 0x7F, 0x00, 0x00,
    0x28, 0x01, 0x02, 0x00, 0xE0, 0x01, 0x00, 0x00, 0xC0, 0x5C, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00,
    0xEC, 0x01, 0x00, 0x00, 0x00, 0x81, 0x00, 0x00, 0xAC, 0x00, 0x02, 0x00, 0xF0, 0x01, 0x00, 0x00,
    0x00, 0x65, 0x00, 0x00, 0xBC, 0x00, 0x02, 0x00, 0xE8, 0x01, 0x00, 0x00, 0xC0, 0x65, 0x00, 0x00,
    0x14, 0x00, 0x02, 0x00, 0xE8, 0x01, 0x00, 0x00, 0xC0, 0x65, 0x00, 0x00, 0x14, 0x00, 0x02, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x16, 0x29, 0x0C, 0x00, 0x80, 0x80, 0x1F, 0x4B, 0x1F, 0x01, 0x00, 0x00, 0x0B, 0x7F, 0x16, 0xD3,
];

pub(crate) fn round_up(value: usize, stride: usize) -> usize {
    value.div_ceil(stride) * stride
}

/// Assemble one index page with a valid footer and checksum.
pub(crate) fn write_index_node(
    layout: &VariantLayout,
    node_type: IndexType,
    level: u8,
    entries: &[Vec<u8>],
    back_pointer: u64,
) -> Vec<u8> {
    let entry_size = if node_type == IndexType::Descriptor && level == 0 {
        layout.descriptor_entry_size
    } else {
        layout.branch_entry_size
    };
    let maximum = (layout.entries_size / usize::from(entry_size)) as u16;
    assert!(entries.len() <= usize::from(maximum));

    let mut page = vec![0_u8; layout.page_size];
    for (index, entry) in entries.iter().enumerate() {
        assert_eq!(entry.len(), usize::from(entry_size));
        let offset = index * usize::from(entry_size);
        page[offset..offset + entry.len()].copy_from_slice(entry);
    }

    let footer = layout.entries_size;
    match layout.variant {
        FileVariant::Ansi => {
            page[footer] = entries.len() as u8;
            page[footer + 1] = maximum as u8;
            page[footer + 2] = entry_size;
            page[footer + 3] = level;
            page[footer + 4] = node_type as u8;
            page[footer + 5] = node_type as u8;
            // signature left zero
            page[footer + 8..footer + 12].copy_from_slice(&(back_pointer as u32).to_le_bytes());
            let crc = compute_weak_crc32(0, &page[..layout.checksum_size]);
            page[footer + 12..footer + 16].copy_from_slice(&crc.to_le_bytes());
        }
        FileVariant::Unicode => {
            page[footer] = entries.len() as u8;
            page[footer + 1] = maximum as u8;
            page[footer + 2] = entry_size;
            page[footer + 3] = level;
            page[footer + 8] = node_type as u8;
            page[footer + 9] = node_type as u8;
            page[footer + 16..footer + 24].copy_from_slice(&back_pointer.to_le_bytes());
            let crc = compute_weak_crc32(0, &page[..layout.checksum_size]);
            page[footer + 12..footer + 16].copy_from_slice(&crc.to_le_bytes());
        }
        FileVariant::Unicode4k => {
            page[footer..footer + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
            page[footer + 2..footer + 4].copy_from_slice(&maximum.to_le_bytes());
            page[footer + 4] = entry_size;
            page[footer + 5] = level;
            page[footer + 16] = node_type as u8;
            page[footer + 17] = node_type as u8;
            page[footer + 24..footer + 32].copy_from_slice(&back_pointer.to_le_bytes());
            let crc = compute_weak_crc32(0, &page[..layout.checksum_size]);
            page[footer + 20..footer + 24].copy_from_slice(&crc.to_le_bytes());
        }
    }
    page
}

fn put_identifier(entry: &mut Vec<u8>, layout: &VariantLayout, value: u64) {
    if layout.identifier_size == 4 {
        entry.write_u32::<LittleEndian>(value as u32).unwrap();
    } else {
        entry.write_u64::<LittleEndian>(value).unwrap();
    }
}

pub(crate) fn branch_entry(
    layout: &VariantLayout,
    identifier: u64,
    back_pointer: u64,
    file_offset: u64,
) -> Vec<u8> {
    let mut entry = Vec::new();
    put_identifier(&mut entry, layout, identifier);
    put_identifier(&mut entry, layout, back_pointer);
    put_identifier(&mut entry, layout, file_offset);
    entry
}

pub(crate) fn descriptor_entry(
    layout: &VariantLayout,
    identifier: u64,
    data_identifier: u64,
    local_descriptors_identifier: u64,
    parent_identifier: u32,
) -> Vec<u8> {
    let mut entry = Vec::new();
    put_identifier(&mut entry, layout, identifier);
    put_identifier(&mut entry, layout, data_identifier);
    put_identifier(&mut entry, layout, local_descriptors_identifier);
    entry.write_u32::<LittleEndian>(parent_identifier).unwrap();
    if layout.identifier_size == 8 {
        entry.write_u32::<LittleEndian>(0).unwrap();
    }
    entry
}

pub(crate) fn offset_entry(
    layout: &VariantLayout,
    identifier: u64,
    file_offset: u64,
    data_size: u16,
    reference_count: u16,
) -> Vec<u8> {
    let mut entry = Vec::new();
    put_identifier(&mut entry, layout, identifier);
    put_identifier(&mut entry, layout, file_offset);
    entry.write_u16::<LittleEndian>(data_size).unwrap();
    entry.write_u16::<LittleEndian>(reference_count).unwrap();
    if layout.identifier_size == 8 {
        entry.write_u32::<LittleEndian>(0).unwrap();
    }
    entry
}

pub(crate) fn encode_payload(
    encryption: EncryptionMode,
    payload: &[u8],
    identifier: u64,
) -> Vec<u8> {
    let mut data = payload.to_vec();
    match encryption {
        EncryptionMode::None => {}
        EncryptionMode::Compressible => permute::encode_data(&mut data),
        EncryptionMode::High => cyclic::transform_data(&mut data, identifier as u32),
    }
    data
}

/// Frame a block: encoded payload, stride padding and a footer with a valid
/// checksum. Returns the whole stride-rounded region.
pub(crate) fn write_block(
    layout: &VariantLayout,
    encryption: EncryptionMode,
    payload: &[u8],
    identifier: u64,
) -> Vec<u8> {
    write_block_raw(layout, &encode_payload(encryption, payload, identifier), payload.len() as u16, identifier)
}

/// Frame already-encoded bytes; `uncompressed_size` equals the data size
/// unless the payload was compressed first.
pub(crate) fn write_block_raw(
    layout: &VariantLayout,
    stored: &[u8],
    uncompressed_size: u16,
    identifier: u64,
) -> Vec<u8> {
    let framed = round_up(stored.len() + layout.block_footer_size, layout.block_stride);
    let mut region = vec![0_u8; framed];
    region[..stored.len()].copy_from_slice(stored);

    let crc = compute_weak_crc32(0, stored);
    let mut footer = Vec::new();
    footer
        .write_u16::<LittleEndian>(stored.len() as u16)
        .unwrap();
    footer.write_u16::<LittleEndian>(0).unwrap();
    match layout.variant {
        FileVariant::Ansi => {
            footer.write_u32::<LittleEndian>(identifier as u32).unwrap();
            footer.write_u32::<LittleEndian>(crc).unwrap();
        }
        FileVariant::Unicode => {
            footer.write_u32::<LittleEndian>(crc).unwrap();
            footer.write_u64::<LittleEndian>(identifier).unwrap();
        }
        FileVariant::Unicode4k => {
            footer.write_u32::<LittleEndian>(crc).unwrap();
            footer.write_u64::<LittleEndian>(identifier).unwrap();
            footer.write_u16::<LittleEndian>(0).unwrap();
            footer.write_u16::<LittleEndian>(uncompressed_size).unwrap();
            footer.write_u32::<LittleEndian>(0).unwrap();
        }
    }
    let at = framed - layout.block_footer_size;
    region[at..].copy_from_slice(&footer);
    region
}

/// Frame a zlib-compressed block for the 4k variant.
pub(crate) fn write_block_compressed(
    layout: &VariantLayout,
    encryption: EncryptionMode,
    payload: &[u8],
    identifier: u64,
) -> Vec<u8> {
    assert_eq!(layout.variant, FileVariant::Unicode4k);
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).unwrap();
    let compressed = encoder.finish().unwrap();
    let stored = encode_payload(encryption, &compressed, identifier);
    write_block_raw(layout, &stored, payload.len() as u16, identifier)
}

/// Build a data-array payload (before framing).
pub(crate) fn array_payload(
    layout: &VariantLayout,
    level: u8,
    total_size: u32,
    entries: &[u64],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(0x01);
    payload.push(level);
    payload
        .write_u16::<LittleEndian>(entries.len() as u16)
        .unwrap();
    payload.write_u32::<LittleEndian>(total_size).unwrap();
    for entry in entries {
        put_identifier(&mut payload, layout, *entry);
    }
    payload
}

/// Build a local-descriptors node payload (before framing).
pub(crate) fn local_descriptors_payload(
    layout: &VariantLayout,
    level: u8,
    entries: &[Vec<u8>],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(0x02);
    payload.push(level);
    payload
        .write_u16::<LittleEndian>(entries.len() as u16)
        .unwrap();
    if layout.identifier_size == 8 {
        payload.write_u32::<LittleEndian>(0).unwrap();
    }
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    payload
}

pub(crate) fn local_descriptors_leaf_entry(
    layout: &VariantLayout,
    identifier: u64,
    data_identifier: u64,
    local_descriptors_identifier: u64,
) -> Vec<u8> {
    let mut entry = Vec::new();
    put_identifier(&mut entry, layout, identifier);
    put_identifier(&mut entry, layout, data_identifier);
    put_identifier(&mut entry, layout, local_descriptors_identifier);
    entry
}

pub(crate) fn local_descriptors_branch_entry(
    layout: &VariantLayout,
    identifier: u64,
    sub_node_identifier: u64,
) -> Vec<u8> {
    let mut entry = Vec::new();
    put_identifier(&mut entry, layout, identifier);
    put_identifier(&mut entry, layout, sub_node_identifier);
    entry
}

/// Incrementally lays out a whole test container and finishes with a valid
/// header.
pub(crate) struct ContainerBuilder {
    pub variant: FileVariant,
    pub layout: VariantLayout,
    pub encryption: EncryptionMode,
    bytes: Vec<u8>,
}

impl ContainerBuilder {
    pub fn new(variant: FileVariant, encryption: EncryptionMode) -> Self {
        let layout = variant.layout();
        let reserved = match variant {
            FileVariant::Unicode4k => 0x23000,
            _ => 0x4800,
        };
        Self {
            variant,
            layout,
            encryption,
            bytes: vec![0_u8; reserved],
        }
    }

    /// Append `data` at the next offset aligned to `align`.
    pub fn append(&mut self, data: &[u8], align: usize) -> u64 {
        let offset = round_up(self.bytes.len(), align);
        self.bytes.resize(offset + data.len(), 0);
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        offset as u64
    }

    pub fn place(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if self.bytes.len() < offset + data.len() {
            self.bytes.resize(offset + data.len(), 0);
        }
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Frame and append a data block; returns its file offset.
    pub fn add_block(&mut self, identifier: u64, payload: &[u8]) -> u64 {
        let region = write_block(&self.layout, self.encryption, payload, identifier);
        self.append(&region, self.layout.block_stride)
    }

    /// Append an index page; returns its file offset.
    pub fn add_index_page(
        &mut self,
        node_type: IndexType,
        level: u8,
        entries: &[Vec<u8>],
        back_pointer: u64,
    ) -> u64 {
        let page = write_index_node(&self.layout, node_type, level, entries, back_pointer);
        self.append(&page, self.layout.page_size)
    }

    /// Fill an allocation-table bitmap so `[offset, offset + size)` reads as
    /// allocated.
    pub fn mark_allocated(&mut self, table_offset: u64, unit: usize, offset: u64, size: u64) {
        let preamble = if self.layout.page_size == 512 { 4 } else { 0 };
        let first = (offset - table_offset) as usize / unit;
        let last = (offset + size - 1 - table_offset) as usize / unit;
        for bit in first..=last {
            let position = table_offset as usize + preamble + bit / 8;
            if self.bytes.len() <= position {
                self.bytes.resize(position + 1, 0);
            }
            self.bytes[position] |= 0x80 >> (bit % 8);
        }
    }

    /// Write the header and return the finished container.
    pub fn finish(mut self, descriptors_root: (u64, u64), offsets_root: (u64, u64)) -> Vec<u8> {
        let file_size = self.bytes.len() as u64;
        let header = write_header(
            self.variant,
            self.encryption,
            file_size,
            descriptors_root,
            offsets_root,
        );
        self.place(0, &header);
        self.bytes
    }
}

/// Assemble a file header. Roots are `(file offset, back pointer)` pairs.
pub(crate) fn write_header(
    variant: FileVariant,
    encryption: EncryptionMode,
    file_size: u64,
    descriptors_root: (u64, u64),
    offsets_root: (u64, u64),
) -> Vec<u8> {
    let mut header = vec![0_u8; if variant == FileVariant::Ansi { 512 } else { 564 }];
    header[0..4].copy_from_slice(&0x4E44_4221_u32.to_le_bytes());
    header[8..10].copy_from_slice(&0x4D53_u16.to_le_bytes());
    header[10..12].copy_from_slice(&(variant as u16).to_le_bytes());
    header[12..14].copy_from_slice(&19_u16.to_le_bytes());
    header[14] = 1;
    header[15] = 1;

    match variant {
        FileVariant::Ansi => {
            header[164..168].copy_from_slice(&0_u32.to_le_bytes());
            header[168..172].copy_from_slice(&(file_size as u32).to_le_bytes());
            header[184..188].copy_from_slice(&(descriptors_root.1 as u32).to_le_bytes());
            header[188..192].copy_from_slice(&(descriptors_root.0 as u32).to_le_bytes());
            header[192..196].copy_from_slice(&(offsets_root.1 as u32).to_le_bytes());
            header[196..200].copy_from_slice(&(offsets_root.0 as u32).to_le_bytes());
            header[200] = 0x02;
            for b in &mut header[204..460] {
                *b = 0xFF;
            }
            header[460] = 0x80;
            header[461] = encryption as u8;
        }
        _ => {
            header[184..192].copy_from_slice(&file_size.to_le_bytes());
            header[216..224].copy_from_slice(&descriptors_root.1.to_le_bytes());
            header[224..232].copy_from_slice(&descriptors_root.0.to_le_bytes());
            header[232..240].copy_from_slice(&offsets_root.1.to_le_bytes());
            header[240..248].copy_from_slice(&offsets_root.0.to_le_bytes());
            header[248] = 0x02;
            for b in &mut header[256..512] {
                *b = 0xFF;
            }
            header[512] = 0x80;
            header[513] = encryption as u8;
            let crc_full = compute_weak_crc32(0, &header[8..524]);
            header[524..528].copy_from_slice(&crc_full.to_le_bytes());
        }
    }

    let crc_partial = compute_weak_crc32(0, &header[8..479]);
    header[4..8].copy_from_slice(&crc_partial.to_le_bytes());
    header
}
