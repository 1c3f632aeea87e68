//! The offsets index: data identifier to file extent.
//!
//! Keys are compared with the internal flag cleared; the flag itself is
//! payload, not key. As with the descriptors index, recovered records live
//! in their own tree and are only consulted on a live miss or when a caller
//! asks for the recovered flavor outright.

use std::collections::BTreeMap;
use tracing::debug;

use super::{
    index::{Index, LeafHit},
    index_value::OffsetRecord,
    IndexType, IoHandle, OFFSET_IDENTIFIER_MASK,
};
use crate::{BadBlock, PffReader, PffResult};

pub(crate) struct OffsetsIndex {
    index: Index,
    recovered: BTreeMap<u64, Vec<OffsetRecord>>,
}

impl OffsetsIndex {
    pub fn new(root_offset: u64, root_back_pointer: u64) -> Self {
        Self {
            index: Index::new(IndexType::Offset, root_offset, root_back_pointer),
            recovered: BTreeMap::new(),
        }
    }

    /// Look up an extent in the live tree only.
    pub fn lookup_live(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u64,
    ) -> PffResult<Option<OffsetRecord>> {
        let Some(LeafHit { node, entry_index }) =
            self.index.lookup(io, reader, identifier & OFFSET_IDENTIFIER_MASK)?
        else {
            return Ok(None);
        };
        let entry_data = node
            .entry_data(entry_index)
            .ok_or(BadBlock::MissingEntryData(entry_index))?;
        Ok(Some(OffsetRecord::parse(entry_data, io.variant)?))
    }

    /// Look up an extent, falling back to the recovered tree on a live miss.
    pub fn lookup(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u64,
    ) -> PffResult<Option<OffsetRecord>> {
        if let Some(record) = self.lookup_live(io, reader, identifier)? {
            return Ok(Some(record));
        }
        Ok(self.lookup_recovered(identifier))
    }

    /// First recovered generation for the identifier, if any.
    pub fn lookup_recovered(&self, identifier: u64) -> Option<OffsetRecord> {
        self.recovered
            .get(&(identifier & OFFSET_IDENTIFIER_MASK))
            .and_then(|generations| generations.first())
            .copied()
    }

    /// Every recovered generation for the identifier.
    pub fn recovered_generations(&self, identifier: u64) -> &[OffsetRecord] {
        self.recovered
            .get(&(identifier & OFFSET_IDENTIFIER_MASK))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True when some recovered generation covers exactly this extent.
    pub fn has_recovered_range(&self, identifier: u64, file_offset: u64, data_size: u16) -> bool {
        self.recovered_generations(identifier)
            .iter()
            .any(|record| record.file_offset == file_offset && record.data_size == data_size)
    }

    /// Append a recovered record unless an identical generation is already
    /// present. Returns whether the record was inserted.
    pub fn insert_recovered(&mut self, record: OffsetRecord) -> bool {
        let generations = self
            .recovered
            .entry(record.identifier & OFFSET_IDENTIFIER_MASK)
            .or_default();
        if generations
            .iter()
            .any(|existing| existing.fingerprint() == record.fingerprint())
        {
            debug!(
                name: "PffRecoveredOffsetDuplicate",
                identifier = format_args!("0x{:08X}", record.identifier),
                "Rejecting duplicate recovered offset"
            );
            return false;
        }
        let mut record = record;
        record.recovered = true;
        generations.push(record);
        true
    }

    pub fn recovered_records(&self) -> impl Iterator<Item = &OffsetRecord> {
        self.recovered.values().flatten()
    }
}
