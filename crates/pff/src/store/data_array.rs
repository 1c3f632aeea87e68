//! Logical byte-streams stitched from one or more data blocks.
//!
//! A block whose payload starts with `0x01 0x01` or `0x01 0x02` *and* whose
//! identifier carries the internal flag is a data array: a header plus a
//! list of child data identifiers. Concatenating the children in order
//! reconstructs the stream. Arrays may nest one level (an array of arrays).
//!
//! The stream is lazy. The extent list is built once at open; reads binary
//! search it and decode only the touched children, through a small LRU.
//! Each child is decrypted once when its block is read, never again here.

use byteorder::{LittleEndian, ReadBytesExt};
use std::{cell::RefCell, io::Cursor, rc::Rc, sync::Mutex};
use tracing::warn;

use super::{
    cache::LruCache, index_value::OffsetRecord, offsets::OffsetsIndex, FileVariant, IoHandle,
    DATA_ARRAY_CACHE_SIZE, IDENTIFIER_FLAG_INTERNAL,
};
use crate::{BadBlock, PffError, PffReader, PffResult};

/// Data-array header signature byte.
const ARRAY_SIGNATURE: u8 = 0x01;

/// Whether a decoded payload is a data-array header rather than user bytes.
pub(crate) fn is_data_array_marker(data: &[u8], identifier: u64) -> bool {
    identifier & IDENTIFIER_FLAG_INTERNAL != 0
        && data.len() >= 8
        && data[0] == ARRAY_SIGNATURE
        && (data[1] == 0x01 || data[1] == 0x02)
}

#[derive(Copy, Clone, Debug)]
struct Extent {
    identifier: u64,
    file_offset: u64,
    data_size: u32,
    stream_offset: u64,
}

/// A lazily-decoded logical byte-stream.
pub struct DataStream<'a> {
    io: &'a IoHandle,
    reader: &'a Mutex<Box<dyn PffReader>>,
    extents: Vec<Extent>,
    length: u64,
    children: RefCell<LruCache<u64, Rc<Vec<u8>>>>,
}

impl<'a> DataStream<'a> {
    pub(crate) fn open(
        io: &'a IoHandle,
        reader: &'a Mutex<Box<dyn PffReader>>,
        offsets: &OffsetsIndex,
        record: OffsetRecord,
        recovered: bool,
    ) -> PffResult<Self> {
        let mut guard = reader
            .lock()
            .map_err(|_| PffError::Io(std::io::Error::other("reader lock poisoned")))?;
        let root = io.read_block(
            guard.as_mut(),
            record.file_offset,
            u32::from(record.data_size),
            record.identifier,
        )?;

        let mut extents = Vec::new();
        let length;
        if is_data_array_marker(&root, record.identifier) {
            let mut next_offset = 0_u64;
            read_array_entries(
                io,
                guard.as_mut(),
                offsets,
                &root,
                recovered,
                0,
                &mut next_offset,
                &mut extents,
            )?;
            length = next_offset;
        } else {
            extents.push(Extent {
                identifier: record.identifier,
                file_offset: record.file_offset,
                data_size: u32::from(record.data_size),
                stream_offset: 0,
            });
            length = u64::from(record.data_size);
        }
        drop(guard);

        Ok(Self {
            io,
            reader,
            extents,
            length,
            children: RefCell::new(LruCache::new(DATA_ARRAY_CACHE_SIZE)),
        })
    }

    /// Total stream length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read at a logical offset; short reads happen only at end of stream.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> PffResult<usize> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let mut index = self
            .extents
            .partition_point(|extent| extent.stream_offset + u64::from(extent.data_size) <= offset);
        let mut copied = 0_usize;

        while copied < buf.len() && index < self.extents.len() {
            let extent = self.extents[index];
            let data = self.fetch(index)?;
            let local = (offset + copied as u64 - extent.stream_offset) as usize;
            let available = (extent.data_size as usize)
                .min(data.len())
                .saturating_sub(local);
            if available == 0 {
                break;
            }
            let count = available.min(buf.len() - copied);
            buf[copied..copied + count].copy_from_slice(&data[local..local + count]);
            copied += count;
            index += 1;
        }
        Ok(copied)
    }

    /// Decode the whole stream into one buffer.
    pub fn read_to_end(&self) -> PffResult<Vec<u8>> {
        let mut data = vec![0_u8; self.length as usize];
        let count = self.read_at(0, &mut data)?;
        data.truncate(count);
        Ok(data)
    }

    fn fetch(&self, index: usize) -> PffResult<Rc<Vec<u8>>> {
        let key = index as u64;
        if let Some(data) = self.children.borrow_mut().get(&key) {
            return Ok(data);
        }
        let extent = self.extents[index];
        let mut guard = self
            .reader
            .lock()
            .map_err(|_| PffError::Io(std::io::Error::other("reader lock poisoned")))?;
        let data = self.io.read_block(
            guard.as_mut(),
            extent.file_offset,
            extent.data_size,
            extent.identifier,
        )?;
        self.children.borrow_mut().insert(key, data.clone());
        Ok(data)
    }
}

#[allow(clippy::too_many_arguments)]
fn read_array_entries(
    io: &IoHandle,
    reader: &mut dyn PffReader,
    offsets: &OffsetsIndex,
    data: &[u8],
    recovered: bool,
    depth: usize,
    next_offset: &mut u64,
    extents: &mut Vec<Extent>,
) -> PffResult<()> {
    let mut cursor = Cursor::new(data);
    let signature = cursor.read_u8()?;
    let mut level = cursor.read_u8()?;
    if signature != ARRAY_SIGNATURE {
        return Err(BadBlock::InvalidDataArraySignature(signature, level).into());
    }
    if level > 2 || (depth > 0 && level > 1) {
        warn!(
            name: "PffDataArrayLevelClamped",
            level,
            depth,
            "Clamping data array level"
        );
        level = if depth > 0 { 1 } else { 2 };
    }
    if level == 0 {
        return Err(BadBlock::InvalidDataArraySignature(signature, level).into());
    }
    let entry_count = cursor.read_u16::<LittleEndian>()?;
    let total_size = cursor.read_u32::<LittleEndian>()?;

    let start_offset = *next_offset;
    for _ in 0..entry_count {
        let identifier = if io.variant == FileVariant::Ansi {
            u64::from(cursor.read_u32::<LittleEndian>()?)
        } else {
            cursor.read_u64::<LittleEndian>()?
        };
        let child = lookup_child(io, reader, offsets, identifier, recovered)?
            .ok_or(BadBlock::UnresolvedArrayEntry(identifier))?;

        if level > 1 {
            let sub_array = io.read_block(
                reader,
                child.file_offset,
                u32::from(child.data_size),
                child.identifier,
            )?;
            read_array_entries(
                io,
                reader,
                offsets,
                &sub_array,
                recovered,
                depth + 1,
                next_offset,
                extents,
            )?;
        } else {
            extents.push(Extent {
                identifier: child.identifier,
                file_offset: child.file_offset,
                data_size: u32::from(child.data_size),
                stream_offset: *next_offset,
            });
            *next_offset += u64::from(child.data_size);
        }
    }

    let described = *next_offset - start_offset;
    if described != u64::from(total_size) {
        return Err(BadBlock::DataArraySizeMismatch {
            header: u64::from(total_size),
            entries: described,
        }
        .into());
    }
    Ok(())
}

/// Resolve one array entry, preferring the flavor of the root lookup.
fn lookup_child(
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
