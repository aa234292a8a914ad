//! Transactional page cache over a block-addressed persistent store.
//!
//! The cache sits between a higher-level index and a low-level serializer
//! that reads and writes fixed-size blocks. Concurrent transactions read,
//! modify, create and delete blocks with FIFO ordering per block, snapshot
//! isolation for displaced readers, bounded memory through a
//! random-replacement evictor, and a background flusher that commits
//! transaction groups as atomic index batches.

mod blob;
mod cache;
mod evictor;
mod flusher;
mod page;
mod serializer;

pub use blob::{BlobRef, MAX_INLINE_SIZE, MAX_REF_SIZE, free_blob, read_blob, write_blob};
pub use cache::{Acquisition, Cache, CacheConfig, CacheStats, Transaction};
pub use evictor::PAGE_REPL_NUM_TRIES;
pub use page::{BufRead, BufWrite};
pub use serializer::{
    BLOCK_DATA_SIZE, BlockId, BlockToken, BufWriteInfo, FileSerializer, IndexWriteOp,
    NULL_BLOCK_ID, Recency, Serializer, SerializerError,
};
