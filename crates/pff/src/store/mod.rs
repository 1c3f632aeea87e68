//! The store engine: the two container-wide index B-trees, the data-block
//! codec, local-descriptor sub-trees and the recovery scanner.
//!
//! Everything in this module reads immutable on-disk bytes; the only mutable
//! state is the caches on the I/O handle and the recovered-value trees owned
//! by the two indexes.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{PffError, PffReader, PffResult};

pub mod allocation;
pub mod block;
pub mod block_tree;
pub mod cache;
pub mod data_array;
pub mod descriptors;
pub mod header;
pub mod index;
pub mod index_node;
pub mod index_value;
pub mod local_descriptors;
pub mod offsets;
pub mod recover;

#[cfg(test)]
pub(crate) mod fixtures;

use cache::LruCache;
use index_node::IndexNode;

/// Bit `0x02` of a data identifier marks the referenced block as internal:
/// its payload is a data-array header rather than user bytes.
pub const IDENTIFIER_FLAG_INTERNAL: u64 = 0x02;

/// Offsets-index keys are compared with the internal flag cleared.
pub const OFFSET_IDENTIFIER_MASK: u64 = !IDENTIFIER_FLAG_INTERNAL;

/// Only the low 32 bits of a descriptor identifier are meaningful.
pub const DESCRIPTOR_IDENTIFIER_MASK: u64 = 0xFFFF_FFFF;

/// Secondary guard against cyclic trees; the primary guard is the
/// per-lookup visited-offset tracker.
pub const MAXIMUM_RECURSION_DEPTH: usize = 64;

pub(crate) const INDEX_NODE_CACHE_SIZE: usize = 16;
pub(crate) const DATA_BLOCK_CACHE_SIZE: usize = 16;
pub(crate) const DATA_ARRAY_CACHE_SIZE: usize = 8;

/// `wVer`: the container variant, selected once at open.
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FileVariant {
    /// 32-bit identifiers, 512-byte pages.
    Ansi = 15,
    /// 64-bit identifiers, 512-byte pages.
    Unicode = 23,
    /// 64-bit identifiers, 4096-byte pages, optionally compressed blocks.
    Unicode4k = 36,
}

impl TryFrom<u16> for FileVariant {
    type Error = PffError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            14..=15 => Ok(FileVariant::Ansi),
            23 => Ok(FileVariant::Unicode),
            36 => Ok(FileVariant::Unicode4k),
            _ => Err(PffError::UnsupportedVariant(value)),
        }
    }
}

/// Size constants resolved from the variant once at open and threaded
/// through every read.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VariantLayout {
    pub variant: FileVariant,
    /// Index-node page size.
    pub page_size: usize,
    /// Index-node footer size.
    pub node_footer_size: usize,
    /// Bytes covered by the stored page checksum.
    pub checksum_size: usize,
    /// `page_size - node_footer_size`.
    pub entries_size: usize,
    pub branch_entry_size: u8,
    pub descriptor_entry_size: u8,
    pub offset_entry_size: u8,
    /// Data-block footer size.
    pub block_footer_size: usize,
    /// Minimum on-disk block granularity.
    pub block_stride: usize,
    /// Largest framed block including its footer.
    pub maximum_block_size: u32,
    /// Identifier width in bytes.
    pub identifier_size: usize,
}

impl FileVariant {
    pub fn layout(self) -> VariantLayout {
        match self {
            FileVariant::Ansi => VariantLayout {
                variant: self,
                page_size: 512,
                node_footer_size: 16,
                checksum_size: 500,
                entries_size: 496,
                branch_entry_size: 12,
                descriptor_entry_size: 16,
                offset_entry_size: 12,
                block_footer_size: 12,
                block_stride: 64,
                maximum_block_size: 8192,
                identifier_size: 4,
            },
            FileVariant::Unicode => VariantLayout {
                variant: self,
                page_size: 512,
                node_footer_size: 24,
                checksum_size: 496,
                entries_size: 488,
                branch_entry_size: 24,
                descriptor_entry_size: 32,
                offset_entry_size: 24,
                block_footer_size: 16,
                block_stride: 64,
                maximum_block_size: 8192,
                identifier_size: 8,
            },
            FileVariant::Unicode4k => VariantLayout {
                variant: self,
                page_size: 4096,
                node_footer_size: 40,
                checksum_size: 4072,
                entries_size: 4056,
                branch_entry_size: 24,
                descriptor_entry_size: 32,
                offset_entry_size: 24,
                block_footer_size: 24,
                block_stride: 512,
                maximum_block_size: 65536,
                identifier_size: 8,
            },
        }
    }
}

impl VariantLayout {
    /// Largest block payload: the maximum framed size minus the footer.
    pub fn maximum_data_size(&self) -> u32 {
        self.maximum_block_size - self.block_footer_size as u32
    }
}

/// `bCryptMethod`: how block payloads are encoded.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum EncryptionMode {
    /// Block payloads are stored verbatim.
    #[default]
    None = 0x00,
    /// Fixed byte substitution; encoded files stay compressible.
    Compressible = 0x01,
    /// Byte cipher keyed by the data identifier of each block.
    High = 0x02,
}

impl TryFrom<u8> for EncryptionMode {
    type Error = PffError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EncryptionMode::None),
            0x01 => Ok(EncryptionMode::Compressible),
            0x02 => Ok(EncryptionMode::High),
            _ => Err(PffError::UnsupportedVariant(u16::from(value))),
        }
    }
}

/// Index-node type byte: which of the two container B-trees a page belongs
/// to.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IndexType {
    /// Offsets index: data identifier to file extent.
    Offset = 0x80,
    /// Descriptors index: descriptor identifier to object.
    Descriptor = 0x81,
}

impl TryFrom<u8> for IndexType {
    type Error = crate::BadBlock;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(IndexType::Offset),
            0x81 => Ok(IndexType::Descriptor),
            _ => Err(crate::BadBlock::InvalidIndexNodeType(value)),
        }
    }
}

/// Container-wide read state: the variant layout, the declared encryption
/// mode, the container size, the cooperative abort flag and the page/block
/// caches.
pub(crate) struct IoHandle {
    pub variant: FileVariant,
    pub layout: VariantLayout,
    pub encryption: EncryptionMode,
    pub file_size: u64,
    pub abort: Arc<AtomicBool>,
    node_cache: RefCell<LruCache<u64, Rc<IndexNode>>>,
    block_cache: RefCell<LruCache<u64, Rc<Vec<u8>>>>,
}

impl IoHandle {
    pub fn new(variant: FileVariant, encryption: EncryptionMode, file_size: u64) -> Self {
        Self {
            variant,
            layout: variant.layout(),
            encryption,
            file_size,
            abort: Arc::new(AtomicBool::new(false)),
            node_cache: RefCell::new(LruCache::new(INDEX_NODE_CACHE_SIZE)),
            block_cache: RefCell::new(LruCache::new(DATA_BLOCK_CACHE_SIZE)),
        }
    }

    /// Checked at every page boundary in long scans and at each sub-node
    /// descent in lookups.
    pub fn check_abort(&self) -> PffResult<()> {
        if self.abort.load(Ordering::Relaxed) {
            Err(PffError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Read and parse an index node through the page cache.
    pub fn read_index_node(
        &self,
        reader: &mut dyn PffReader,
        offset: u64,
    ) -> PffResult<Rc<IndexNode>> {
        if let Some(node) = self.node_cache.borrow_mut().get(&offset) {
            return Ok(node);
        }
        let node = Rc::new(IndexNode::read_from(reader, offset, &self.layout)?);
        self.node_cache.borrow_mut().insert(offset, node.clone());
        Ok(node)
    }

    /// Read, verify and decode a data block through the block cache.
    pub fn read_block(
        &self,
        reader: &mut dyn PffReader,
        file_offset: u64,
        data_size: u32,
        expected_back_pointer: u64,
    ) -> PffResult<Rc<Vec<u8>>> {
        if let Some(data) = self.block_cache.borrow_mut().get(&file_offset) {
            return Ok(data);
        }
        let data = Rc::new(block::read_block(
            self,
            reader,
            file_offset,
            data_size,
            expected_back_pointer,
        )?);
        self.block_cache
            .borrow_mut()
            .insert(file_offset, data.clone());
        Ok(data)
    }
}
