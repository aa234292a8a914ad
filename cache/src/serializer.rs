//! Serializer module — abstraction layer for reading and writing fixed-size
//! blocks by token, plus the single-file implementation used by the cache.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};
use log::error;
use parking_lot::Mutex;
use thiserror::Error;

/// Type representing a logical block id, should be used instead of bare `u64`.
pub type BlockId = u64;

/// Sentinel block id meaning "none".
pub const NULL_BLOCK_ID: BlockId = u64::MAX;

/// Monotonic timestamp attached to each block id, carried through writes.
/// `0` means "never written".
pub type Recency = u64;

/// Size of each on-disk extent.
pub const EXTENT_SIZE: usize = 4096;

/// Size of the per-extent header stored in front of the block data.
const EXTENT_HEADER_SIZE: usize = 16;

/// Usable bytes per block as seen by the cache and its clients.
pub const BLOCK_DATA_SIZE: usize = EXTENT_SIZE - EXTENT_HEADER_SIZE;

/// Index entries packed into one extent.
const ENTRIES_PER_EXTENT: usize = EXTENT_SIZE / size_of::<IndexEntry>();

/// Default number of block ids the index region can address.
pub const DEFAULT_INDEX_CAPACITY: u64 = 65_536;

/// Error for serializer related operations.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// File used for loading the serializer has invalid format.
    #[error("file has invalid format: {0}")]
    InvalidFileFormat(String),
    /// The fixed-capacity index region cannot address this block id.
    #[error("block id {0} exceeds index capacity {1}")]
    IndexCapacityExceeded(BlockId, u64),
    /// Underlying IO module returned error.
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}

/// One block's worth of content headed for disk.
pub struct BufWriteInfo {
    pub block_id: BlockId,
    pub recency: Recency,
    pub data: Box<[u8]>,
}

/// One entry of an atomic index batch: update the token and recency of
/// `block_id`, or clear its index entry entirely when `delete` is set.
pub struct IndexWriteOp {
    pub block_id: BlockId,
    pub token: Option<BlockToken>,
    pub recency: Option<Recency>,
    pub delete: bool,
}

impl IndexWriteOp {
    pub fn update(block_id: BlockId, token: BlockToken, recency: Recency) -> Self {
        IndexWriteOp {
            block_id,
            token: Some(token),
            recency: Some(recency),
            delete: false,
        }
    }

    pub fn delete(block_id: BlockId) -> Self {
        IndexWriteOp {
            block_id,
            token: None,
            recency: None,
            delete: true,
        }
    }
}

/// Abstract contract between the cache and the block store.
///
/// Implementations are internally synchronized; the cache and its background
/// flusher call into the same instance from different threads.
pub trait Serializer: Send + Sync {
    /// Usable bytes per block.
    fn block_size(&self) -> usize;

    /// One past the highest block id ever committed through [`Serializer::index_write`].
    /// Ids below this bound are not guaranteed to have an index entry.
    fn max_block_id(&self) -> BlockId;

    /// Current on-disk token for `id`, if the index holds one.
    fn index_read(&self, id: BlockId) -> Option<BlockToken>;

    /// Current recency of `id`. Returns `0` if the id was never written.
    fn get_recency(&self, id: BlockId) -> Recency;

    /// Blocking read of the block named by `token` into `buf`.
    /// `buf` must be exactly [`Serializer::block_size`] bytes long.
    fn block_read(&self, token: &BlockToken, buf: &mut [u8]) -> Result<(), SerializerError>;

    /// Batch write of block contents. Returned tokens are ordered identically
    /// to `writes`. The index is not touched; pair with [`Serializer::index_write`].
    fn block_writes(&self, writes: Vec<BufWriteInfo>) -> Result<Vec<BlockToken>, SerializerError>;

    /// Atomically applies a batch of index updates.
    fn index_write(&self, ops: Vec<IndexWriteOp>) -> Result<(), SerializerError>;

    /// Produces a zero-initialised block-size buffer.
    fn alloc_buf(&self) -> Box<[u8]> {
        vec![0u8; self.block_size()].into_boxed_slice()
    }
}

// ---------------------------------------------------------------------------
// Block tokens
// ---------------------------------------------------------------------------

/// Handle naming one immutable on-disk snapshot of a block's bytes.
///
/// Tokens are reference-counted: the underlying extent stays allocated while
/// any token for it exists, even after the index stops referencing it.
#[derive(Clone)]
pub struct BlockToken(Arc<TokenInner>);

impl BlockToken {
    fn extent(&self) -> u64 {
        self.0.extent
    }
}

impl PartialEq for BlockToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.extent == other.0.extent
    }
}
impl Eq for BlockToken {}

impl std::fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockToken").field(&self.0.extent).finish()
    }
}

struct TokenInner {
    extent: u64,
    extents: Weak<Mutex<ExtentTable>>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some(extents) = self.extents.upgrade() {
            extents.lock().release(self.extent);
        }
    }
}

/// Tracks which data extents are referenced by the index, which are pinned by
/// live tokens, and which are free for reuse.
struct ExtentTable {
    /// Extent → number of live [`TokenInner`]s naming it.
    live: HashMap<u64, usize>,
    /// Extents currently referenced by the on-disk index.
    in_index: HashMap<u64, ()>,
    /// Fully unreferenced extents available for reuse.
    free: Vec<u64>,
    /// One past the highest extent ever allocated.
    next_extent: u64,
}

impl ExtentTable {
    fn alloc(&mut self) -> u64 {
        match self.free.pop() {
            Some(extent) => extent,
            None => {
                let extent = self.next_extent;
                self.next_extent += 1;
                extent
            }
        }
    }

    fn retain(&mut self, extent: u64) {
        *self.live.entry(extent).or_insert(0) += 1;
    }

    fn release(&mut self, extent: u64) {
        let count = self
            .live
            .get_mut(&extent)
            .expect("released a token for an untracked extent");
        *count -= 1;
        if *count == 0 {
            self.live.remove(&extent);
            if !self.in_index.contains_key(&extent) {
                self.free.push(extent);
            }
        }
    }

    /// Swaps the index reference for a block from `old` to `new`, freeing the
    /// old extent if no token keeps it alive.
    fn reindex(&mut self, old: Option<u64>, new: Option<u64>) {
        if let Some(extent) = new {
            self.in_index.insert(extent, ());
        }
        if let Some(extent) = old
            && old != new
        {
            self.in_index.remove(&extent);
            if !self.live.contains_key(&extent) {
                self.free.push(extent);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FileSerializer
// ---------------------------------------------------------------------------

/// Storage for serializer file metadata.
///
/// Always stored in extent 0. No other struct should directly use it.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FileHeader {
    magic: [u8; 4],
    version: u32,
    /// Number of block ids the index region can address.
    index_capacity: u64,
    /// One past the highest block id ever committed.
    max_block_id: u64,
    /// One past the highest extent ever allocated.
    next_extent: u64,
}

impl FileHeader {
    const MAGIC: [u8; 4] = *b"blks";
    const VERSION: u32 = 1;
}

/// One index slot: where a block currently lives and how recent it is.
/// `extent == 0` means the block id has no committed content.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct IndexEntry {
    extent: u64,
    recency: u64,
}

struct FileInner {
    handle: fs::File,
    header: FileHeader,
    /// In-memory copy of the index region, authoritative between
    /// `index_write` batches. Indexed by block id, grown on demand.
    index: Vec<IndexEntry>,
}

/// Single-file [`Serializer`]: a metadata extent, a fixed-capacity index
/// region, and recycled data extents after it.
///
/// Block contents live in whole extents; an extent stays allocated while the
/// index references it or any [`BlockToken`] for it is alive. `index_write`
/// rewrites only the index extents the batch dirtied, then the metadata
/// extent.
pub struct FileSerializer {
    inner: Mutex<FileInner>,
    extents: Arc<Mutex<ExtentTable>>,
}

impl FileSerializer {
    /// Creates a new serializer file at `path`. Fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<FileSerializer, SerializerError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let index_extents = DEFAULT_INDEX_CAPACITY / ENTRIES_PER_EXTENT as u64;
        let header = FileHeader {
            magic: FileHeader::MAGIC,
            version: FileHeader::VERSION,
            index_capacity: DEFAULT_INDEX_CAPACITY,
            max_block_id: 0,
            next_extent: 1 + index_extents,
        };

        let mut inner = FileInner {
            handle,
            header,
            index: Vec::new(),
        };
        // Reserve the metadata and index region up front; the index extents
        // themselves are written lazily as entries are dirtied.
        inner
            .handle
            .set_len((1 + index_extents) * EXTENT_SIZE as u64)?;
        inner.write_header()?;

        let extents = ExtentTable {
            live: HashMap::new(),
            in_index: HashMap::new(),
            free: Vec::new(),
            next_extent: header.next_extent,
        };

        Ok(FileSerializer {
            inner: Mutex::new(inner),
            extents: Arc::new(Mutex::new(extents)),
        })
    }

    /// Creates a new serializer file at `path` and immediately removes its
    /// directory entry, so the OS reclaims the space when the serializer is
    /// dropped or the process dies.
    pub fn create_unlinked<P: AsRef<Path>>(path: P) -> Result<FileSerializer, SerializerError> {
        let serializer = FileSerializer::create(&path)?;
        fs::remove_file(&path)?;
        Ok(serializer)
    }

    /// Opens an existing serializer file, rebuilding the in-memory index and
    /// the free-extent pool from it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileSerializer, SerializerError> {
        let mut handle = fs::OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_buf = [0u8; EXTENT_SIZE];
        if let Err(e) = handle.read_exact(&mut header_buf) {
            return match e.kind() {
                ErrorKind::UnexpectedEof => Err(SerializerError::InvalidFileFormat(
                    "file shorter than one extent".into(),
                )),
                _ => Err(SerializerError::IoError(e)),
            };
        }
        let header: FileHeader =
            bytemuck::pod_read_unaligned(&header_buf[..size_of::<FileHeader>()]);
        if header.magic != FileHeader::MAGIC {
            return Err(SerializerError::InvalidFileFormat(format!(
                "invalid magic number ('{:?}')",
                header.magic
            )));
        }
        if header.version != FileHeader::VERSION {
            return Err(SerializerError::InvalidFileFormat(format!(
                "unsupported version {}",
                header.version
            )));
        }

        // Load index entries up to the committed max block id.
        let mut index = vec![IndexEntry::zeroed(); header.max_block_id as usize];
        let mut extent_buf = [0u8; EXTENT_SIZE];
        let mut id = 0usize;
        while id < index.len() {
            let extent = 1 + (id / ENTRIES_PER_EXTENT) as u64;
            handle.seek(io::SeekFrom::Start(extent * EXTENT_SIZE as u64))?;
            handle.read_exact(&mut extent_buf)?;
            let first_slot = id % ENTRIES_PER_EXTENT;
            let take = (index.len() - id).min(ENTRIES_PER_EXTENT - first_slot);
            for k in 0..take {
                let at = (first_slot + k) * size_of::<IndexEntry>();
                index[id + k] =
                    bytemuck::pod_read_unaligned(&extent_buf[at..at + size_of::<IndexEntry>()]);
            }
            id += take;
        }

        // Data extents not referenced by the index are free for reuse.
        let data_start = 1 + header.index_capacity / ENTRIES_PER_EXTENT as u64;
        let mut in_index = HashMap::new();
        for entry in &index {
            if entry.extent != 0 {
                if entry.extent < data_start || entry.extent >= header.next_extent {
                    return Err(SerializerError::InvalidFileFormat(format!(
                        "index references extent {} outside the data region",
                        entry.extent
                    )));
                }
                in_index.insert(entry.extent, ());
            }
        }
        let free = (data_start..header.next_extent)
            .filter(|extent| !in_index.contains_key(extent))
            .collect();

        let extents = ExtentTable {
            live: HashMap::new(),
            in_index,
            free,
            next_extent: header.next_extent,
        };

        Ok(FileSerializer {
            inner: Mutex::new(FileInner { handle, header, index }),
            extents: Arc::new(Mutex::new(extents)),
        })
    }

    fn make_token(&self, extent: u64) -> BlockToken {
        self.extents.lock().retain(extent);
        BlockToken(Arc::new(TokenInner {
            extent,
            extents: Arc::downgrade(&self.extents),
        }))
    }
}

impl FileInner {
    fn write_header(&mut self) -> Result<(), SerializerError> {
        let mut buf = [0u8; EXTENT_SIZE];
        buf[..size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&self.header));
        self.handle.seek(io::SeekFrom::Start(0))?;
        self.handle.write_all(&buf)?;
        Ok(())
    }

    /// Rewrites the index extent containing `first_id`'s entry.
    fn write_index_extent(&mut self, first_id: usize) -> Result<(), SerializerError> {
        let base = first_id - first_id % ENTRIES_PER_EXTENT;
        let mut buf = [0u8; EXTENT_SIZE];
        for i in 0..ENTRIES_PER_EXTENT {
            if let Some(entry) = self.index.get(base + i) {
                buf[i * size_of::<IndexEntry>()..][..size_of::<IndexEntry>()]
                    .copy_from_slice(bytemuck::bytes_of(entry));
            }
        }
        let extent = 1 + (base / ENTRIES_PER_EXTENT) as u64;
        self.handle
            .seek(io::SeekFrom::Start(extent * EXTENT_SIZE as u64))?;
        self.handle.write_all(&buf)?;
        Ok(())
    }
}

impl Serializer for FileSerializer {
    fn block_size(&self) -> usize {
        BLOCK_DATA_SIZE
    }

    fn max_block_id(&self) -> BlockId {
        self.inner.lock().header.max_block_id
    }

    fn index_read(&self, id: BlockId) -> Option<BlockToken> {
        let extent = {
            let inner = self.inner.lock();
            match inner.index.get(id as usize) {
                Some(entry) if entry.extent != 0 => entry.extent,
                _ => return None,
            }
        };
        Some(self.make_token(extent))
    }

    fn get_recency(&self, id: BlockId) -> Recency {
        let inner = self.inner.lock();
        inner
            .index
            .get(id as usize)
            .map(|entry| entry.recency)
            .unwrap_or(0)
    }

    fn block_read(&self, token: &BlockToken, buf: &mut [u8]) -> Result<(), SerializerError> {
        assert_eq!(buf.len(), BLOCK_DATA_SIZE, "buffer must be block-sized");
        let mut inner = self.inner.lock();
        let offset = token.extent() * EXTENT_SIZE as u64 + EXTENT_HEADER_SIZE as u64;
        inner.handle.seek(io::SeekFrom::Start(offset))?;
        inner.handle.read_exact(buf)?;
        Ok(())
    }

    fn block_writes(&self, writes: Vec<BufWriteInfo>) -> Result<Vec<BlockToken>, SerializerError> {
        let mut tokens = Vec::with_capacity(writes.len());
        for write in writes {
            assert_eq!(
                write.data.len(),
                BLOCK_DATA_SIZE,
                "buffer must be block-sized"
            );
            let extent = self.extents.lock().alloc();
            {
                let mut inner = self.inner.lock();
                let mut header = [0u8; EXTENT_HEADER_SIZE];
                header[..8].copy_from_slice(&write.block_id.to_le_bytes());
                header[8..].copy_from_slice(&write.recency.to_le_bytes());
                inner
                    .handle
                    .seek(io::SeekFrom::Start(extent * EXTENT_SIZE as u64))?;
                inner.handle.write_all(&header)?;
                inner.handle.write_all(&write.data)?;
            }
            tokens.push(self.make_token(extent));
        }
        Ok(tokens)
    }

    fn index_write(&self, ops: Vec<IndexWriteOp>) -> Result<(), SerializerError> {
        let mut inner = self.inner.lock();
        for op in &ops {
            if op.block_id >= inner.header.index_capacity {
                return Err(SerializerError::IndexCapacityExceeded(
                    op.block_id,
                    inner.header.index_capacity,
                ));
            }
        }

        let mut dirtied_extents = Vec::new();
        let mut reindexed = Vec::new();

        for op in &ops {
            let id = op.block_id as usize;
            if id >= inner.index.len() {
                inner.index.resize(id + 1, IndexEntry::zeroed());
            }
            let entry = &mut inner.index[id];
            let old_extent = (entry.extent != 0).then_some(entry.extent);

            if op.delete {
                *entry = IndexEntry::zeroed();
                reindexed.push((old_extent, None));
            } else {
                if let Some(token) = &op.token {
                    entry.extent = token.extent();
                    reindexed.push((old_extent, Some(token.extent())));
                }
                if let Some(recency) = op.recency {
                    entry.recency = recency;
                }
            }

            let base = id - id % ENTRIES_PER_EXTENT;
            if !dirtied_extents.contains(&base) {
                dirtied_extents.push(base);
            }
            inner.header.max_block_id = inner.header.max_block_id.max(op.block_id + 1);
        }

        for base in dirtied_extents {
            inner.write_index_extent(base)?;
        }
        inner.header.next_extent = self.extents.lock().next_extent;
        inner.write_header()?;
        inner.handle.sync_data()?;

        let mut extents = self.extents.lock();
        for (old, new) in reindexed {
            extents.reindex(old, new);
        }
        Ok(())
    }
}

/// Make sure all in-memory state has been flushed before dropping.
impl Drop for FileSerializer {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.header.next_extent = self.extents.lock().next_extent;
        if let Err(e) = inner.write_header() {
            error!("failed to write header while dropping FileSerializer: {e}");
        }
        if let Err(e) = inner.handle.sync_all() {
            error!("failed to sync file while dropping FileSerializer: {e}");
        }
    }
}
