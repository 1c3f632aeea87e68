//! The recovery scanner.
//!
//! Deleted objects linger in a container in three forms: index pages whose
//! slots were logically freed but not wiped, whole index pages that fell out
//! of the live trees, and orphan data blocks whose extents were dropped from
//! the offsets index. The scanner walks the file (or just its unallocated
//! ranges), salvages everything that still parses and cross-checks, and
//! files the results in the per-index recovered-value trees where lookups
//! fall back to them.
//!
//! Salvage is deterministic: offsets ascending, slots ascending within a
//! page. Duplicates of live or previously recovered entries are rejected by
//! identifier and payload fingerprint. Candidate blocks are validated on
//! their stored bytes; decryption happens later, on the read path, exactly
//! once.

use tracing::{debug, info, warn};

use super::{
    block::{framed_size, BlockFooter},
    descriptors::DescriptorsIndex,
    index_node::IndexNode,
    index_value::{DescriptorRecord, OffsetRecord},
    offsets::OffsetsIndex,
    IndexType, IoHandle,
};
use crate::{crc::compute_weak_crc32, PffReader, PffResult};
use std::io::{Read, Seek, SeekFrom};

/// Options for [`crate::PffFile::recover`].
#[derive(Copy, Clone, Default, Debug)]
pub struct RecoveryFlags {
    /// Scan the whole container instead of just the unallocated ranges.
    pub ignore_allocation_data: bool,
    /// Also probe every block stride for orphan data-block footers.
    pub scan_for_fragments: bool,
}

pub(crate) struct RecoverContext<'a> {
    pub io: &'a IoHandle,
    pub descriptors: &'a mut DescriptorsIndex,
    pub offsets: &'a mut OffsetsIndex,
    pub unallocated_data: &'a [(u64, u64)],
    pub unallocated_pages: &'a [(u64, u64)],
    pub flags: RecoveryFlags,
}

/// Run the full recovery pipeline. Returns the recovered item records:
/// descriptors whose data (and, when present, local descriptors) resolve
/// through the recovered or live offsets index.
pub(crate) fn recover_items(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
) -> PffResult<Vec<DescriptorRecord>> {
    scan_ranges(context, reader)?;
    salvage_live_tree_slots(context, reader)?;
    let items = link_recovered_descriptors(context, reader)?;
    info!(
        name: "PffRecoverFinished",
        descriptors = context.descriptors.recovered_records().count(),
        offsets = context.offsets.recovered_records().count(),
        items = items.len(),
        "Recovery pass finished"
    );
    Ok(items)
}

/// Merge the scan ranges, ascending and non-overlapping.
fn merged_ranges(context: &RecoverContext<'_>) -> Vec<(u64, u64)> {
    if context.flags.ignore_allocation_data {
        return vec![(0, context.io.file_size)];
    }
    let mut ranges: Vec<(u64, u64)> = context
        .unallocated_data
        .iter()
        .chain(context.unallocated_pages.iter())
        .copied()
        .collect();
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, size) in ranges {
        match merged.last_mut() {
            Some((last_start, last_size)) if start <= *last_start + *last_size => {
                let end = (start + size).max(*last_start + *last_size);
                *last_size = end - *last_start;
            }
            _ => merged.push((start, size)),
        }
    }
    merged
}

/// Phase A and B: walk the scan ranges looking for index pages, and, when
/// fragment scanning is on, for orphan data-block footers at every stride.
fn scan_ranges(context: &mut RecoverContext<'_>, reader: &mut dyn PffReader) -> PffResult<()> {
    let page_size = context.io.layout.page_size as u64;
    let stride = context.io.layout.block_stride as u64;
    let scan_step = if context.flags.scan_for_fragments {
        stride
    } else {
        page_size
    };

    for (range_start, range_size) in merged_ranges(context) {
        let range_end = (range_start + range_size).min(context.io.file_size);
        let mut offset = range_start.next_multiple_of(scan_step);

        while offset < range_end {
            context.io.check_abort()?;

            if offset % page_size == 0
                && offset + page_size <= range_end
                && salvage_index_page(context, reader, offset)?
            {
                offset += page_size;
                continue;
            }
            if context.flags.scan_for_fragments {
                salvage_fragment(context, reader, offset)?;
            }
            offset += scan_step;
        }
    }
    Ok(())
}

/// Try to parse one page-aligned offset as an index leaf and salvage its
/// slots. Returns whether the offset parsed as an index node at all.
fn salvage_index_page(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
    offset: u64,
) -> PffResult<bool> {
    let Ok(node) = IndexNode::read_from(reader, offset, &context.io.layout) else {
        return Ok(false);
    };
    if !node.is_leaf() {
        debug!(
            name: "PffRecoverSkippingBranchNode",
            offset = format_args!("0x{offset:08X}"),
            level = node.level(),
            "Skipping branch node found by scan"
        );
        return Ok(true);
    }
    salvage_leaf_slots(context, reader, &node)?;
    Ok(true)
}

/// Salvage every slot of one leaf page. Live entries are handled by the
/// duplicate check; dead pages have no live entries at all.
fn salvage_leaf_slots(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
    node: &IndexNode,
) -> PffResult<()> {
    for slot in 0..node.maximum_number_of_entries() {
        let Some(entry_data) = node.entry_data(slot) else {
            break;
        };
        match node.node_type() {
            IndexType::Descriptor => {
                let Ok(record) = DescriptorRecord::parse(entry_data, context.io.variant) else {
                    continue;
                };
                salvage_descriptor_record(context, reader, record)?;
            }
            IndexType::Offset => {
                let Ok(record) = OffsetRecord::parse(entry_data, context.io.variant) else {
                    continue;
                };
                salvage_offset_record(context, reader, record)?;
            }
        }
    }
    Ok(())
}

/// Validate and file one descriptor candidate.
fn salvage_descriptor_record(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
    record: DescriptorRecord,
) -> PffResult<()> {
    // Candidates need an identifier and a data identifier; a zero parent is
    // an orphan, which is still recoverable.
    if record.identifier == 0 || record.data_identifier == 0 {
        return Ok(());
    }
    if let Some(live) = context
        .descriptors
        .lookup_live(context.io, reader, record.identifier)
        .unwrap_or(None)
    {
        if live.fingerprint() == record.fingerprint() {
            return Ok(());
        }
    }
    if context.descriptors.insert_recovered(record) {
        debug!(
            name: "PffRecoveredDescriptor",
            identifier = format_args!("0x{:08X}", record.identifier),
            "Recovered descriptor record"
        );
    }
    Ok(())
}

/// Validate and file one offset candidate. The pointed-at block must frame
/// correctly under the candidate's identifier before it is accepted.
fn salvage_offset_record(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
    record: OffsetRecord,
) -> PffResult<()> {
    if record.identifier == 0 {
        return Ok(());
    }
    if record.file_offset == 0 || record.file_offset >= context.io.file_size {
        return Ok(());
    }
    if record.data_size == 0
        || u32::from(record.data_size) > context.io.layout.maximum_data_size()
    {
        return Ok(());
    }
    if let Some(live) = context
        .offsets
        .lookup_live(context.io, reader, record.identifier)
        .unwrap_or(None)
    {
        if live.fingerprint() == record.fingerprint() {
            return Ok(());
        }
    }
    if !validate_stored_block(context.io, reader, &record) {
        return Ok(());
    }
    if context.offsets.insert_recovered(record) {
        debug!(
            name: "PffRecoveredOffset",
            identifier = format_args!("0x{:08X}", record.identifier),
            offset = format_args!("0x{:08X}", record.file_offset),
            "Recovered offset record"
        );
    }
    Ok(())
}

/// Check that a candidate extent still frames a block: footer back pointer
/// matches and the stored checksum, when present, verifies. The stored
/// bytes are checked as-is; no decryption is applied here.
fn validate_stored_block(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    record: &OffsetRecord,
) -> bool {
    let layout = &io.layout;
    let region_size = framed_size(
        u32::from(record.data_size) + layout.block_footer_size as u32,
        layout,
    );
    if record.file_offset + u64::from(region_size) > io.file_size {
        return false;
    }
    let mut region = vec![0_u8; region_size as usize];
    if reader
        .seek(SeekFrom::Start(record.file_offset))
        .and_then(|_| reader.read_exact(&mut region))
        .is_err()
    {
        return false;
    }
    let Ok(footer) = BlockFooter::parse(
        &region[region.len() - layout.block_footer_size..],
        io.variant,
    ) else {
        return false;
    };
    if footer.back_pointer != record.identifier
        || u32::from(footer.data_size) != u32::from(record.data_size)
    {
        return false;
    }
    if footer.checksum != 0 {
        let calculated = compute_weak_crc32(0, &region[..usize::from(record.data_size)]);
        if calculated != footer.checksum {
            return false;
        }
    }
    true
}

/// Phase B: probe the stride ending at `offset + stride` for a data-block
/// footer and synthesize a recovered offset record from it.
fn salvage_fragment(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
    offset: u64,
) -> PffResult<()> {
    let layout = &context.io.layout;
    let stride = layout.block_stride as u64;
    if offset + stride > context.io.file_size {
        return Ok(());
    }
    let mut block = vec![0_u8; layout.block_stride];
    if reader
        .seek(SeekFrom::Start(offset))
        .and_then(|_| reader.read_exact(&mut block))
        .is_err()
    {
        return Ok(());
    }
    let Ok(footer) = BlockFooter::parse(&block[layout.block_stride - layout.block_footer_size..], context.io.variant)
    else {
        return Ok(());
    };

    // A plausible fragment footer has a back pointer in the 32-bit half.
    if footer.back_pointer == 0 || footer.back_pointer >> 32 != 0 {
        return Ok(());
    }
    if footer.data_size == 0 || u32::from(footer.data_size) > layout.maximum_data_size() {
        return Ok(());
    }

    // The footer ends the stride-rounded region that frames the block, so
    // the data begins a whole region before the end of this stride.
    let region_size = u64::from(framed_size(
        u32::from(footer.data_size) + layout.block_footer_size as u32,
        layout,
    ));
    let Some(data_offset) = (offset + stride).checked_sub(region_size) else {
        return Ok(());
    };
    if context
        .offsets
        .has_recovered_range(footer.back_pointer, data_offset, footer.data_size)
    {
        return Ok(());
    }

    let mut data = vec![0_u8; usize::from(footer.data_size)];
    if reader
        .seek(SeekFrom::Start(data_offset))
        .and_then(|_| reader.read_exact(&mut data))
        .is_err()
    {
        return Ok(());
    }
    if footer.checksum != 0 && compute_weak_crc32(0, &data) != footer.checksum {
        return Ok(());
    }

    let record = OffsetRecord {
        identifier: footer.back_pointer,
        file_offset: data_offset,
        data_size: footer.data_size,
        reference_count: 0,
        recovered: true,
    };
    if context.offsets.insert_recovered(record) {
        info!(
            name: "PffRecoveredFragment",
            identifier = format_args!("0x{:08X}", record.identifier),
            offset = format_args!("0x{data_offset:08X}"),
            "Recovered orphan data block"
        );
    }
    Ok(())
}

/// Walk the live descriptors tree; slots past each leaf's entry count are
/// deleted-in-place records.
fn salvage_live_tree_slots(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
) -> PffResult<()> {
    let variant = context.io.variant;
    let mut candidates: Vec<DescriptorRecord> = Vec::new();
    context
        .descriptors
        .index()
        .visit_leaf_nodes(context.io, reader, &mut |node| {
            for slot in node.number_of_entries()..node.maximum_number_of_entries() {
                let Some(entry_data) = node.entry_data(slot) else {
                    break;
                };
                if let Ok(record) = DescriptorRecord::parse(entry_data, variant) {
                    candidates.push(record);
                }
            }
            Ok(())
        })?;
    for record in candidates {
        salvage_descriptor_record(context, reader, record)?;
    }
    Ok(())
}

/// Keep only the recovered descriptors whose data resolves, and whose local
/// descriptors resolve when present. Orphans pass.
fn link_recovered_descriptors(
    context: &mut RecoverContext<'_>,
    reader: &mut dyn PffReader,
) -> PffResult<Vec<DescriptorRecord>> {
    let mut items = Vec::new();
    let candidates: Vec<DescriptorRecord> = context
        .descriptors
        .recovered_records()
        .copied()
        .collect();

    for record in candidates {
        context.io.check_abort()?;

        let data_resolves = context.offsets.lookup_recovered(record.data_identifier).is_some()
            || context
                .offsets
                .lookup_live(context.io, reader, record.data_identifier)
                .unwrap_or(None)
                .is_some();
        if !data_resolves {
            debug!(
                name: "PffRecoveredItemMissingData",
                identifier = format_args!("0x{:08X}", record.identifier),
                data = format_args!("0x{:08X}", record.data_identifier),
                "Dropping recovered descriptor with unresolvable data"
            );
            continue;
        }
        if record.local_descriptors_identifier != 0 {
            let local_resolves = context
                .offsets
                .lookup_recovered(record.local_descriptors_identifier)
                .is_some()
                || context
                    .offsets
                    .lookup_live(context.io, reader, record.local_descriptors_identifier)
                    .unwrap_or(None)
                    .is_some();
            if !local_resolves {
                warn!(
                    name: "PffRecoveredItemMissingLocalDescriptors",
                    identifier = format_args!("0x{:08X}", record.identifier),
                    "Dropping recovered descriptor with unresolvable local descriptors"
                );
                continue;
            }
        }
        items.push(record);
    }
    Ok(items)
}
