//! Allocation tables.
//!
//! Fixed-position bitmap pages chain through the container at a constant
//! coverage stride. A set bit marks one allocation unit as in use; runs of
//! clear bits coalesce into the unallocated ranges handed to callers and to
//! the recovery scanner. An unreadable table ends the walk with what was
//! collected so far.

use std::io::{Read, Seek, SeekFrom};
use tracing::warn;

use super::{FileVariant, IoHandle};
use crate::{PffReader, PffResult};

/// Which allocation table to read.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockKind {
    /// Data allocation, in block-stride units.
    Data,
    /// Page allocation, in page-size units.
    Page,
}

struct TableLayout {
    first_offset: u64,
    /// Allocation unit covered by one bit.
    unit: usize,
    /// Bitmap bytes per table page.
    bitmap_size: usize,
    /// Bytes skipped before the bitmap on each table page.
    preamble: usize,
}

fn table_layout(variant: FileVariant, kind: BlockKind) -> Option<TableLayout> {
    match (variant, kind) {
        (FileVariant::Ansi | FileVariant::Unicode, BlockKind::Data) => Some(TableLayout {
            first_offset: 0x4400,
            unit: 64,
            bitmap_size: 496,
            preamble: 4,
        }),
        (FileVariant::Ansi | FileVariant::Unicode, BlockKind::Page) => Some(TableLayout {
            first_offset: 0x4600,
            unit: 512,
            bitmap_size: 496,
            preamble: 4,
        }),
        (FileVariant::Unicode4k, BlockKind::Data) => Some(TableLayout {
            first_offset: 0x22000,
            unit: 512,
            bitmap_size: 4072,
            preamble: 0,
        }),
        // The 4k variant has no separate page allocation table.
        (FileVariant::Unicode4k, BlockKind::Page) => None,
    }
}

/// Collect the unallocated `(offset, size)` ranges of one allocation table
/// chain, ascending and coalesced.
pub(crate) fn unallocated_ranges(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    kind: BlockKind,
) -> PffResult<Vec<(u64, u64)>> {
    let Some(layout) = table_layout(io.variant, kind) else {
        return Ok(Vec::new());
    };
    let coverage = (layout.bitmap_size * 8 * layout.unit) as u64;

    let mut ranges: Vec<(u64, u64)> = Vec::new();
    let mut run_start: Option<u64> = None;
    let mut table_offset = layout.first_offset;

    while table_offset < io.file_size {
        io.check_abort()?;

        let mut bitmap = vec![0_u8; layout.preamble + layout.bitmap_size];
        if reader
            .seek(SeekFrom::Start(table_offset))
            .and_then(|_| reader.read_exact(&mut bitmap))
            .is_err()
        {
            warn!(
                name: "PffAllocationTableUnreadable",
                offset = format_args!("0x{table_offset:08X}"),
                "Stopping allocation table walk at unreadable table"
            );
            break;
        }
        let bitmap = &bitmap[layout.preamble..];

        for bit in 0..layout.bitmap_size * 8 {
            let unit_offset = table_offset + (bit * layout.unit) as u64;
            if unit_offset >= io.file_size {
                break;
            }
            let allocated = bitmap[bit / 8] & (0x80 >> (bit % 8)) != 0;
            match (allocated, run_start) {
                (false, None) => run_start = Some(unit_offset),
                (true, Some(start)) => {
                    ranges.push((start, unit_offset - start));
                    run_start = None;
                }
                _ => {}
            }
        }
        // Runs may continue across table boundaries.
        table_offset += coverage;
    }

    if let Some(start) = run_start {
        let end = io.file_size.min(table_offset);
        if end > start {
            ranges.push((start, end - start));
        }
    }
    Ok(ranges)
}
