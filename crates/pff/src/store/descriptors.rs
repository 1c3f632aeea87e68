//! The descriptors index: descriptor identifier to object record.
//!
//! Owns the live B-tree root and a separate tree of recovered records. A
//! live miss falls through to the recovered tree once the recovery scanner
//! has populated it; within one identifier the first recovered generation
//! wins.

use std::collections::BTreeMap;
use tracing::debug;

use super::{
    index::{Index, LeafHit},
    index_value::DescriptorRecord,
    IndexType, IoHandle,
};
use crate::{BadBlock, PffReader, PffResult};

pub(crate) struct DescriptorsIndex {
    index: Index,
    recovered: BTreeMap<u32, Vec<DescriptorRecord>>,
}

impl DescriptorsIndex {
    pub fn new(root_offset: u64, root_back_pointer: u64) -> Self {
        Self {
            index: Index::new(IndexType::Descriptor, root_offset, root_back_pointer),
            recovered: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Look up a descriptor in the live tree only.
    pub fn lookup_live(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u32,
    ) -> PffResult<Option<DescriptorRecord>> {
        let Some(LeafHit { node, entry_index }) =
            self.index.lookup(io, reader, u64::from(identifier))?
        else {
            return Ok(None);
        };
        let entry_data = node
            .entry_data(entry_index)
            .ok_or(BadBlock::MissingEntryData(entry_index))?;
        Ok(Some(DescriptorRecord::parse(entry_data, io.variant)?))
    }

    /// Look up a descriptor, falling back to the recovered tree on a live
    /// miss.
    pub fn lookup(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u32,
    ) -> PffResult<Option<DescriptorRecord>> {
        if let Some(record) = self.lookup_live(io, reader, identifier)? {
            return Ok(Some(record));
        }
        Ok(self.lookup_recovered(identifier))
    }

    /// First recovered generation for the identifier, if any.
    pub fn lookup_recovered(&self, identifier: u32) -> Option<DescriptorRecord> {
        self.recovered
            .get(&identifier)
            .and_then(|generations| generations.first())
            .copied()
    }

    /// Append a recovered record unless an identical generation is already
    /// present. Returns whether the record was inserted.
    pub fn insert_recovered(&mut self, record: DescriptorRecord) -> bool {
        let generations = self.recovered.entry(record.identifier).or_default();
        if generations
            .iter()
            .any(|existing| existing.fingerprint() == record.fingerprint())
        {
            debug!(
                name: "PffRecoveredDescriptorDuplicate",
                identifier = format_args!("0x{:08X}", record.identifier),
                "Rejecting duplicate recovered descriptor"
            );
            return false;
        }
        let mut record = record;
        record.recovered = true;
        generations.push(record);
        true
    }

    /// All recovered generations, ascending by identifier, generations in
    /// recovery order.
    pub fn recovered_records(&self) -> impl Iterator<Item = &DescriptorRecord> {
        self.recovered.values().flatten()
    }
}
