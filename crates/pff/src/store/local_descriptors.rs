//! Per-object local-descriptor sub-trees.
//!
//! One descriptor may attach further streams (attachments, recipient
//! tables, long property values) through a miniature B-tree whose pages are
//! ordinary data blocks carrying signature byte `0x02`. The root block is
//! reached by resolving the descriptor's `local_descriptors_identifier`
//! through the offsets index; branch entries point at further
//! offsets-index identifiers.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::{
    block_tree::{BlockTree, Insert},
    index_value::OffsetRecord,
    offsets::OffsetsIndex,
    FileVariant, IoHandle, DESCRIPTOR_IDENTIFIER_MASK, MAXIMUM_RECURSION_DEPTH,
};
use crate::{BadBlock, PffError, PffReader, PffResult};

/// Local-descriptors node signature byte.
const NODE_SIGNATURE: u8 = 0x02;

/// One sub-object attached to a descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LocalDescriptorRecord {
    pub identifier: u32,
    pub data_identifier: u64,
    pub local_descriptors_identifier: u64,
}

/// Resolve a whole sub-tree into its leaf records, in tree order.
pub(crate) fn read_tree(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    offsets: &OffsetsIndex,
    identifier: u64,
    recovered: bool,
) -> PffResult<Vec<LocalDescriptorRecord>> {
    let mut records = Vec::new();
    if identifier == 0 {
        return Ok(records);
    }
    let mut visited = BlockTree::new(io.layout.block_stride as u64);
    read_node(
        io,
        reader,
        offsets,
        identifier,
        recovered,
        0,
        &mut visited,
        &mut records,
    )?;
    Ok(records)
}

#[allow(clippy::too_many_arguments)]
fn read_node(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    offsets: &OffsetsIndex,
    identifier: u64,
    recovered: bool,
    depth: usize,
    visited: &mut BlockTree,
    records: &mut Vec<LocalDescriptorRecord>,
) -> PffResult<()> {
    io.check_abort()?;

    if depth > MAXIMUM_RECURSION_DEPTH {
        return Err(BadBlock::MaximumRecursionDepth(depth).into());
    }

    let record = lookup(io, reader, offsets, identifier, recovered)?
        .ok_or(BadBlock::UnresolvedLocalDescriptors(identifier))?;
    if let Insert::AlreadyPresent = visited.insert(record.file_offset) {
        return Err(PffError::CorruptTree(record.file_offset));
    }

    let data = io.read_block(
        reader,
        record.file_offset,
        u32::from(record.data_size),
        record.identifier,
    )?;
    let mut cursor = Cursor::new(data.as_slice());

    let signature = cursor.read_u8()?;
    if signature != NODE_SIGNATURE {
        return Err(BadBlock::InvalidLocalDescriptorsSignature(signature).into());
    }
    let level = cursor.read_u8()?;
    let entry_count = cursor.read_u16::<LittleEndian>()?;
    if io.variant != FileVariant::Ansi {
        // padding1
        let _ = cursor.read_u32::<LittleEndian>()?;
    }

    for _ in 0..entry_count {
        if level == 0 {
            let sub_identifier = read_identifier(&mut cursor, io.variant)?;
            let data_identifier = read_identifier(&mut cursor, io.variant)?;
            let local_descriptors_identifier = read_identifier(&mut cursor, io.variant)?;
            records.push(LocalDescriptorRecord {
                identifier: (sub_identifier & DESCRIPTOR_IDENTIFIER_MASK) as u32,
                data_identifier,
                local_descriptors_identifier,
            });
        } else {
            let _first_identifier = read_identifier(&mut cursor, io.variant)?;
            let sub_node_identifier = read_identifier(&mut cursor, io.variant)?;
            read_node(
                io,
                reader,
                offsets,
                sub_node_identifier,
                recovered,
                depth + 1,
                visited,
                records,
            )?;
        }
    }
    Ok(())
}

fn lookup(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    offsets: &OffsetsIndex,
    identifier: u64,
    recovered: bool,
) -> PffResult<Option<OffsetRecord>> {
    if recovered {
        if let Some(record) = offsets.lookup_recovered(identifier) {
            return Ok(Some(record));
        }
        offsets.lookup_live(io, reader, identifier)
    } else {
        offsets.lookup(io, reader, identifier)
    }
}

fn read_identifier(cursor: &mut Cursor<&[u8]>, variant: FileVariant) -> std::io::Result<u64> {
    if variant == FileVariant::Ansi {
        Ok(u64::from(cursor.read_u32::<LittleEndian>()?))
    } else {
        cursor.read_u64::<LittleEndian>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::*;
    use crate::store::{EncryptionMode, IndexType};
    use std::io::Cursor as IoCursor;

    struct Fixture {
        io: IoHandle,
        bytes: Vec<u8>,
        offsets: OffsetsIndex,
    }

    /// A two-level sub-tree: the root branch points at two leaf nodes, each
    /// carrying two sub-objects.
    fn tree_fixture(variant: FileVariant) -> Fixture {
        let layout = variant.layout();
        let mut builder = ContainerBuilder::new(variant, EncryptionMode::Compressible);

        let first_leaf = local_descriptors_payload(
            &layout,
            0,
            &[
                local_descriptors_leaf_entry(&layout, 0x60, 0x8004, 0),
                local_descriptors_leaf_entry(&layout, 0x64, 0x8008, 0x8022),
            ],
        );
        let second_leaf = local_descriptors_payload(
            &layout,
            0,
            &[
                local_descriptors_leaf_entry(&layout, 0x68, 0x8010, 0),
                local_descriptors_leaf_entry(&layout, 0x6C, 0x8014, 0),
            ],
        );
        let first_offset = builder.add_block(0x8032, &first_leaf);
        let second_offset = builder.add_block(0x8036, &second_leaf);

        let branch = local_descriptors_payload(
            &layout,
            1,
            &[
                local_descriptors_branch_entry(&layout, 0x60, 0x8032),
                local_descriptors_branch_entry(&layout, 0x68, 0x8036),
            ],
        );
        let branch_offset = builder.add_block(0x8042, &branch);

        let entries = vec![
            offset_entry(&layout, 0x8032, first_offset, first_leaf.len() as u16, 1),
            offset_entry(&layout, 0x8036, second_offset, second_leaf.len() as u16, 1),
            offset_entry(&layout, 0x8042, branch_offset, branch.len() as u16, 1),
        ];
        let root = builder.add_index_page(IndexType::Offset, 0, &entries, 0x2F);
        let bytes = builder.finish((0, 0), (root, 0x2F));
        let io = IoHandle::new(variant, EncryptionMode::Compressible, bytes.len() as u64);
        Fixture {
            io,
            bytes,
            offsets: OffsetsIndex::new(root, 0x2F),
        }
    }

    #[test]
    fn test_two_level_tree_in_order() {
        for variant in [FileVariant::Ansi, FileVariant::Unicode] {
            let fixture = tree_fixture(variant);
            let mut reader = IoCursor::new(fixture.bytes);
            let records =
                read_tree(&fixture.io, &mut reader, &fixture.offsets, 0x8042, false).unwrap();
            assert_eq!(
                records.iter().map(|r| r.identifier).collect::<Vec<_>>(),
                vec![0x60, 0x64, 0x68, 0x6C]
            );
            assert_eq!(records[1].data_identifier, 0x8008);
            assert_eq!(records[1].local_descriptors_identifier, 0x8022);
        }
    }

    #[test]
    fn test_zero_identifier_is_empty() {
        let fixture = tree_fixture(FileVariant::Unicode);
        let mut reader = IoCursor::new(fixture.bytes);
        let records = read_tree(&fixture.io, &mut reader, &fixture.offsets, 0, false).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let variant = FileVariant::Unicode;
        let layout = variant.layout();
        let mut builder = ContainerBuilder::new(variant, EncryptionMode::None);
        let payload = vec![0x7F_u8; 16];
        let block_offset = builder.add_block(0x8032, &payload);
        let entries = vec![offset_entry(&layout, 0x8032, block_offset, 16, 1)];
        let root = builder.add_index_page(IndexType::Offset, 0, &entries, 0x2F);
        let bytes = builder.finish((0, 0), (root, 0x2F));
        let io = IoHandle::new(variant, EncryptionMode::None, bytes.len() as u64);
        let offsets = OffsetsIndex::new(root, 0x2F);
        let mut reader = IoCursor::new(bytes);

        assert!(matches!(
            read_tree(&io, &mut reader, &offsets, 0x8032, false),
            Err(PffError::BadBlock(
                BadBlock::InvalidLocalDescriptorsSignature(0x7F)
            ))
        ));
    }

    #[test]
    fn test_branch_cycle_is_corrupt_tree() {
        let variant = FileVariant::Unicode;
        let layout = variant.layout();
        let mut builder = ContainerBuilder::new(variant, EncryptionMode::None);
        // A branch node whose single entry points back at itself.
        let branch = local_descriptors_payload(
            &layout,
            1,
            &[local_descriptors_branch_entry(&layout, 0x60, 0x8042)],
        );
        let branch_offset = builder.add_block(0x8042, &branch);
        let entries = vec![offset_entry(&layout, 0x8042, branch_offset, branch.len() as u16, 1)];
        let root = builder.add_index_page(IndexType::Offset, 0, &entries, 0x2F);
        let bytes = builder.finish((0, 0), (root, 0x2F));
        let io = IoHandle::new(variant, EncryptionMode::None, bytes.len() as u64);
        let offsets = OffsetsIndex::new(root, 0x2F);
        let mut reader = IoCursor::new(bytes);

        assert!(matches!(
            read_tree(&io, &mut reader, &offsets, 0x8042, false),
            Err(PffError::CorruptTree(_))
        ));
    }

    #[test]
    fn test_unresolved_identifier() {
        let fixture = tree_fixture(FileVariant::Unicode);
        let mut reader = IoCursor::new(fixture.bytes);
        assert!(matches!(
            read_tree(&fixture.io, &mut reader, &fixture.offsets, 0x9000, false),
            Err(PffError::BadBlock(BadBlock::UnresolvedLocalDescriptors(
                0x9000
            )))
        ));
    }
}
