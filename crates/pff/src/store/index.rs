//! Descent through one container index B-tree.
//!
//! A branch entry keys the *first* identifier of its sub-node, so the child
//! to descend is the last entry whose key is at or below the wanted
//! identifier, or entry 0 when every key is above it. Pages are allowed to
//! be mildly out of order; only the descent rule above is relied on.
//!
//! Every lookup allocates its own visited-offset tracker. A page seen twice
//! fails the lookup with `CorruptTree` instead of looping; a recursion-depth
//! bound backstops trackerless corruption.

use byteorder::{LittleEndian, ReadBytesExt};
use std::rc::Rc;
use tracing::{debug, warn};

use super::{
    block_tree::{BlockTree, Insert},
    index_node::IndexNode,
    FileVariant, IndexType, IoHandle, DESCRIPTOR_IDENTIFIER_MASK, MAXIMUM_RECURSION_DEPTH,
};
use crate::{BadBlock, PffError, PffReader, PffResult};

/// One of the two container indexes, addressed by its root page.
pub(crate) struct Index {
    pub index_type: IndexType,
    pub root_offset: u64,
    pub root_back_pointer: u64,
}

pub(crate) struct LeafHit {
    pub node: Rc<IndexNode>,
    pub entry_index: u16,
}

impl Index {
    pub fn new(index_type: IndexType, root_offset: u64, root_back_pointer: u64) -> Self {
        Self {
            index_type,
            root_offset,
            root_back_pointer,
        }
    }

    fn mask(&self, identifier: u64) -> u64 {
        if self.index_type == IndexType::Descriptor {
            identifier & DESCRIPTOR_IDENTIFIER_MASK
        } else {
            identifier
        }
    }

    /// Find the leaf entry with exactly the wanted identifier. Not-found is
    /// a normal outcome.
    pub fn lookup(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u64,
    ) -> PffResult<Option<LeafHit>> {
        let mut visited = BlockTree::new(io.layout.page_size as u64);
        self.lookup_in_node(
            io,
            reader,
            &mut visited,
            self.root_offset,
            self.root_back_pointer,
            self.mask(identifier),
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn lookup_in_node(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        visited: &mut BlockTree,
        node_offset: u64,
        node_back_pointer: u64,
        identifier: u64,
        depth: usize,
    ) -> PffResult<Option<LeafHit>> {
        io.check_abort()?;

        if depth > MAXIMUM_RECURSION_DEPTH {
            return Err(PffError::CorruptTree(node_offset));
        }
        if let Insert::AlreadyPresent = visited.insert(node_offset) {
            return Err(PffError::CorruptTree(node_offset));
        }

        let node = io.read_index_node(reader, node_offset)?;
        if node.node_type() != self.index_type {
            return Err(BadBlock::IndexTypeMismatch {
                expected: self.index_type as u8,
                actual: node.node_type() as u8,
            }
            .into());
        }
        if !node.is_leaf() {
            if node_back_pointer == 0 {
                warn!(
                    name: "PffZeroBackPointer",
                    offset = format_args!("0x{node_offset:08X}"),
                    "Accepting index node referenced with a zero back pointer"
                );
            } else if node.back_pointer() != node_back_pointer {
                return Err(BadBlock::WrongBackPointer {
                    expected: node_back_pointer,
                    stored: node.back_pointer(),
                }
                .into());
            }
        }

        let mut sub_node_offset = 0_u64;
        let mut sub_node_back_pointer = 0_u64;
        let mut hit = None;

        for entry_index in 0..node.number_of_entries() {
            let entry_data = node
                .entry_data(entry_index)
                .ok_or(BadBlock::MissingEntryData(entry_index))?;
            let entry_identifier = self.mask(read_entry_identifier(entry_data, io.variant)?);

            if !node.is_leaf() {
                if entry_index == 0 || identifier >= entry_identifier {
                    let branch = BranchEntry::parse(entry_data, io.variant)?;
                    sub_node_offset = branch.file_offset;
                    sub_node_back_pointer = branch.back_pointer;
                }
            } else if identifier == entry_identifier {
                hit = Some(LeafHit {
                    node: node.clone(),
                    entry_index,
                });
            }

            // A branch entry keys the first identifier of its sub-node.
            if identifier <= entry_identifier {
                break;
            }
        }

        if node.is_leaf() {
            return Ok(hit);
        }

        if sub_node_offset == 0 || sub_node_offset >= io.file_size {
            debug!(
                name: "PffSubNodeOffsetOutOfBounds",
                offset = format_args!("0x{sub_node_offset:08X}"),
                "Sub node offset out of bounds"
            );
            return Err(BadBlock::InvalidFileOffset(sub_node_offset).into());
        }
        self.lookup_in_node(
            io,
            reader,
            visited,
            sub_node_offset,
            sub_node_back_pointer,
            identifier,
            depth + 1,
        )
    }

    /// Count exact key matches in the leaf that holds `identifier`.
    pub fn number_of_leaf_records(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        identifier: u64,
    ) -> PffResult<usize> {
        let identifier = self.mask(identifier);
        let Some(hit) = self.lookup(io, reader, identifier)? else {
            return Ok(0);
        };
        let mut count = 0;
        for entry_index in 0..hit.node.number_of_entries() {
            let entry_data = hit
                .node
                .entry_data(entry_index)
                .ok_or(BadBlock::MissingEntryData(entry_index))?;
            if self.mask(read_entry_identifier(entry_data, io.variant)?) == identifier {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Walk every reachable node, calling `visit` on each leaf. Used by the
    /// recovery scanner's live-tree pass.
    pub fn visit_leaf_nodes(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        visit: &mut dyn FnMut(&IndexNode) -> PffResult<()>,
    ) -> PffResult<()> {
        let mut visited = BlockTree::new(io.layout.page_size as u64);
        self.visit_node(io, reader, &mut visited, self.root_offset, 0, visit)
    }

    fn visit_node(
        &self,
        io: &IoHandle,
        reader: &mut dyn PffReader,
        visited: &mut BlockTree,
        node_offset: u64,
        depth: usize,
        visit: &mut dyn FnMut(&IndexNode) -> PffResult<()>,
    ) -> PffResult<()> {
        io.check_abort()?;

        if depth > MAXIMUM_RECURSION_DEPTH {
            return Err(PffError::CorruptTree(node_offset));
        }
        if let Insert::AlreadyPresent = visited.insert(node_offset) {
            return Err(PffError::CorruptTree(node_offset));
        }

        let node = io.read_index_node(reader, node_offset)?;
        if node.node_type() != self.index_type {
            return Err(BadBlock::IndexTypeMismatch {
                expected: self.index_type as u8,
                actual: node.node_type() as u8,
            }
            .into());
        }
        if node.is_leaf() {
            return visit(&node);
        }
        for entry_index in 0..node.number_of_entries() {
            let entry_data = node
                .entry_data(entry_index)
                .ok_or(BadBlock::MissingEntryData(entry_index))?;
            let branch = BranchEntry::parse(entry_data, io.variant)?;
            if branch.file_offset == 0 || branch.file_offset >= io.file_size {
                warn!(
                    name: "PffSubNodeOffsetOutOfBounds",
                    offset = format_args!("0x{:08X}", branch.file_offset),
                    "Skipping sub node with out-of-bounds offset"
                );
                continue;
            }
            self.visit_node(io, reader, visited, branch.file_offset, depth + 1, visit)?;
        }
        Ok(())
    }
}

struct BranchEntry {
    back_pointer: u64,
    file_offset: u64,
}

impl BranchEntry {
    fn parse(data: &[u8], variant: FileVariant) -> PffResult<Self> {
        let mut cursor = std::io::Cursor::new(data);
        if variant == FileVariant::Ansi {
            let _identifier = cursor.read_u32::<LittleEndian>()?;
            let back_pointer = u64::from(cursor.read_u32::<LittleEndian>()?);
            let file_offset = u64::from(cursor.read_u32::<LittleEndian>()?);
            Ok(Self {
                back_pointer,
                file_offset,
            })
        } else {
            let _identifier = cursor.read_u64::<LittleEndian>()?;
            let back_pointer = cursor.read_u64::<LittleEndian>()?;
            let file_offset = cursor.read_u64::<LittleEndian>()?;
            Ok(Self {
                back_pointer,
                file_offset,
            })
        }
    }
}

pub(crate) fn read_entry_identifier(data: &[u8], variant: FileVariant) -> PffResult<u64> {
    let mut cursor = std::io::Cursor::new(data);
    if variant == FileVariant::Ansi {
        Ok(u64::from(cursor.read_u32::<LittleEndian>()?))
    } else {
        Ok(cursor.read_u64::<LittleEndian>()?)
    }
}
