#![doc = include_str!("../README.md")]

use std::{
    cell::RefCell,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use thiserror::Error;
use tracing::warn;

pub mod codepage;
pub mod store;

mod crc;
mod encode;

use store::{
    allocation, descriptors::DescriptorsIndex, header::FileHeader, local_descriptors,
    offsets::OffsetsIndex, recover::RecoverContext, IoHandle,
};

pub use codepage::AsciiCodepage;
pub use store::allocation::BlockKind;
pub use store::data_array::DataStream;
pub use store::index_value::{DescriptorRecord, IdentifierType, OffsetRecord};
pub use store::local_descriptors::LocalDescriptorRecord;
pub use store::recover::RecoveryFlags;
pub use store::{EncryptionMode, FileVariant};

/// Block- and page-level failure detail carried by [`PffError::BadBlock`].
#[derive(Error, Debug)]
pub enum BadBlock {
    #[error("Block back pointer mismatch (expected 0x{expected:08X}, stored 0x{stored:08X})")]
    WrongBackPointer { expected: u64, stored: u64 },
    #[error("Block data size mismatch (declared {declared}, stored {stored})")]
    WrongDataSize { declared: u32, stored: u16 },
    #[error("Invalid block data size: {0}")]
    InvalidDataSize(u32),
    #[error("Invalid file offset: 0x{0:08X}")]
    InvalidFileOffset(u64),
    #[error("Truncated index node page: {0} bytes")]
    TruncatedPage(usize),
    #[error("Invalid index node type: 0x{0:02X}")]
    InvalidIndexNodeType(u8),
    #[error("Index type mismatch (expected 0x{expected:02X}, node 0x{actual:02X})")]
    IndexTypeMismatch { expected: u8, actual: u8 },
    #[error("Index node entries exceed page: {entries} x {entry_size}")]
    EntriesExceedPage { entries: u16, entry_size: u8 },
    #[error("Missing index node entry: {0}")]
    MissingEntryData(u16),
    #[error("Invalid identifier type: 0x{0:02X}")]
    InvalidIdentifierType(u8),
    #[error("Invalid data array signature: 0x{0:02X} 0x{1:02X}")]
    InvalidDataArraySignature(u8, u8),
    #[error("Unresolved data array entry: 0x{0:08X}")]
    UnresolvedArrayEntry(u64),
    #[error("Data array size mismatch (header {header}, entries {entries})")]
    DataArraySizeMismatch { header: u64, entries: u64 },
    #[error("Invalid local descriptors signature: 0x{0:02X}")]
    InvalidLocalDescriptorsSignature(u8),
    #[error("Unresolved local descriptors identifier: 0x{0:08X}")]
    UnresolvedLocalDescriptors(u64),
    #[error("Maximum recursion depth exceeded: {0}")]
    MaximumRecursionDepth(usize),
    #[error("Decompression failed: {0}")]
    Decompress(String),
}

#[derive(Error, Debug)]
pub enum PffError {
    #[error("Not a Personal Folder File: magic 0x{0:08X}")]
    NotPff(u32),
    #[error("Unsupported variant: 0x{0:04X}")]
    UnsupportedVariant(u16),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad block: {0}")]
    BadBlock(#[from] BadBlock),
    #[error("Corrupt tree: node at offset 0x{0:08X} visited twice")]
    CorruptTree(u64),
    #[error("Aborted")]
    Aborted,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<PffError> for io::Error {
    fn from(err: PffError) -> Self {
        match err {
            PffError::Io(err) => err,
            err => Self::other(err),
        }
    }
}

pub type PffResult<T> = std::result::Result<T, PffError>;

pub trait PffReader: Read + Seek {}

impl<T> PffReader for T where T: Read + Seek {}

/// Cooperative cancellation for long scans and lookups. Cloneable and cheap;
/// setting it makes the outermost running call unwind with
/// [`PffError::Aborted`] at its next check point.
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// An open Personal Folder File container.
///
/// The handle owns the byte source and all caches; dropping it (or calling
/// [`PffFile::close`]) releases both. One handle is single-threaded; open
/// one handle per worker to read containers in parallel.
pub struct PffFile {
    reader: Mutex<Box<dyn PffReader>>,
    header: FileHeader,
    io: IoHandle,
    descriptors: RefCell<DescriptorsIndex>,
    offsets: RefCell<OffsetsIndex>,
    recovered_items: RefCell<Vec<DescriptorRecord>>,
    codepage: RefCell<AsciiCodepage>,
}

impl PffFile {
    /// Open a container from any seekable byte source.
    pub fn read_from(mut reader: Box<dyn PffReader>) -> PffResult<Self> {
        let header = FileHeader::read(reader.as_mut())?;
        let file_size = reader.seek(SeekFrom::End(0))?;
        if header.file_eof != file_size {
            warn!(
                name: "PffFileSizeMismatch",
                header = header.file_eof,
                actual = file_size,
                "Header container size disagrees with the byte source"
            );
        }

        let io = IoHandle::new(header.variant, header.encryption, file_size);
        let descriptors = DescriptorsIndex::new(
            header.descriptors_root.file_offset,
            header.descriptors_root.back_pointer,
        );
        let offsets = OffsetsIndex::new(
            header.offsets_root.file_offset,
            header.offsets_root.back_pointer,
        );

        Ok(Self {
            reader: Mutex::new(reader),
            header,
            io,
            descriptors: RefCell::new(descriptors),
            offsets: RefCell::new(offsets),
            recovered_items: RefCell::new(Vec::new()),
            codepage: RefCell::new(AsciiCodepage::default()),
        })
    }

    /// Open a container file from a path.
    pub fn open(path: impl AsRef<Path>) -> PffResult<Self> {
        Self::read_from(Box::new(File::open(path)?))
    }

    /// The container size in bytes.
    pub fn size(&self) -> u64 {
        self.io.file_size
    }

    pub fn variant(&self) -> FileVariant {
        self.header.variant
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        self.header.encryption
    }

    /// A handle that cancels in-flight scans and lookups on this container.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.io.abort.clone())
    }

    /// Set the codepage used to decode narrow strings.
    pub fn set_ascii_codepage(&self, codepage: u16) -> PffResult<()> {
        *self.codepage.borrow_mut() = AsciiCodepage::new(codepage)?;
        Ok(())
    }

    pub fn ascii_codepage(&self) -> AsciiCodepage {
        self.codepage.borrow().clone()
    }

    /// Look up a descriptor record. Falls back to the recovered records
    /// once [`PffFile::recover`] has run. Not-found is `Ok(None)`.
    pub fn descriptor(&self, identifier: u32) -> PffResult<Option<DescriptorRecord>> {
        let descriptors = self.descriptors.borrow();
        let mut reader = self.lock_reader()?;
        descriptors.lookup(&self.io, reader.as_mut(), identifier)
    }

    /// Open the logical byte-stream named by a data identifier.
    ///
    /// A live extent whose block fails its back-pointer check is retried
    /// through the recovered offsets records when recovery has found a
    /// replacement.
    pub fn stream(&self, data_identifier: u64) -> PffResult<DataStream<'_>> {
        let offsets = self.offsets.borrow();
        let live = {
            let mut reader = self.lock_reader()?;
            offsets.lookup_live(&self.io, reader.as_mut(), data_identifier)?
        };

        match live {
            Some(record) => {
                match DataStream::open(&self.io, &self.reader, &offsets, record, false) {
                    Ok(stream) => Ok(stream),
                    Err(PffError::BadBlock(error)) => {
                        let Some(recovered) = offsets.lookup_recovered(data_identifier) else {
                            return Err(error.into());
                        };
                        warn!(
                            name: "PffStreamRetryRecovered",
                            identifier = format_args!("0x{data_identifier:08X}"),
                            %error,
                            "Live extent failed, retrying recovered record"
                        );
                        DataStream::open(&self.io, &self.reader, &offsets, recovered, true)
                    }
                    Err(error) => Err(error),
                }
            }
            None => match offsets.lookup_recovered(data_identifier) {
                Some(record) => DataStream::open(&self.io, &self.reader, &offsets, record, true),
                None => Err(PffError::InvalidArgument(format!(
                    "unknown data identifier 0x{data_identifier:08X}"
                ))),
            },
        }
    }

    /// Resolve the local-descriptor sub-tree attached to a descriptor.
    pub fn local_descriptors(
        &self,
        record: &DescriptorRecord,
    ) -> PffResult<Vec<LocalDescriptorRecord>> {
        let offsets = self.offsets.borrow();
        let mut reader = self.lock_reader()?;
        local_descriptors::read_tree(
            &self.io,
            reader.as_mut(),
            &offsets,
            record.local_descriptors_identifier,
            record.recovered,
        )
    }

    /// The unallocated ranges of one allocation table chain.
    pub fn unallocated_blocks(&self, kind: BlockKind) -> PffResult<Vec<(u64, u64)>> {
        let mut reader = self.lock_reader()?;
        allocation::unallocated_ranges(&self.io, reader.as_mut(), kind)
    }

    /// Run the recovery scanner. Repeated runs only append entries not yet
    /// recovered; the recovered item list is recomputed each time.
    pub fn recover(&self, flags: RecoveryFlags) -> PffResult<()> {
        let (unallocated_data, unallocated_pages) = if flags.ignore_allocation_data {
            (Vec::new(), Vec::new())
        } else {
            (
                self.unallocated_blocks(BlockKind::Data)?,
                self.unallocated_blocks(BlockKind::Page)?,
            )
        };

        let items = {
            let mut descriptors = self.descriptors.borrow_mut();
            let mut offsets = self.offsets.borrow_mut();
            let mut reader = self.lock_reader()?;
            let mut context = RecoverContext {
                io: &self.io,
                descriptors: &mut descriptors,
                offsets: &mut offsets,
                unallocated_data: &unallocated_data,
                unallocated_pages: &unallocated_pages,
                flags,
            };
            store::recover::recover_items(&mut context, reader.as_mut())?
        };
        *self.recovered_items.borrow_mut() = items;
        Ok(())
    }

    /// Descriptor records salvaged by [`PffFile::recover`], ascending by
    /// identifier.
    pub fn recovered_items(&self) -> Vec<DescriptorRecord> {
        self.recovered_items.borrow().clone()
    }

    /// Close the container, releasing the byte source and all caches.
    pub fn close(self) {}

    fn lock_reader(&self) -> PffResult<MutexGuard<'_, Box<dyn PffReader>>> {
        self.reader
            .lock()
            .map_err(|_| PffError::Io(io::Error::other("reader lock poisoned")))
    }
}
