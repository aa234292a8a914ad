//! DiskBackedQueue module — persistent FIFO over a private page cache backed
//! by an unlinked file, so the OS reclaims the space when the queue is
//! dropped or the process dies.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use cache::{
    Acquisition, BlobRef, BlockId, Cache, FileSerializer, NULL_BLOCK_ID, SerializerError,
    Transaction, free_blob, read_blob, write_blob,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Memory limit of the queue's private cache, in blocks (about a megabyte).
const QUEUE_CACHE_BLOCKS: usize = 256;

/// Error for queue related operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to create queue file: {0}")]
    SerializerError(#[from] SerializerError),
}

/// On-disk header at the front of every queue block. Offsets are relative to
/// the data area that follows the header.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct QueueBlockHeader {
    /// Block id of the next-pushed block, or [`NULL_BLOCK_ID`].
    next: u64,
    /// High-water mark of record bytes written into the data area.
    data_size: u32,
    /// Cursor past the records already popped.
    live_data_offset: u32,
}

const HEADER_SIZE: usize = size_of::<QueueBlockHeader>();

/// Head/tail bookkeeping, held in memory only. Push appends at the head
/// block; pop consumes from the tail block.
struct QueueInner {
    head_block_id: BlockId,
    tail_block_id: BlockId,
    queue_size: u64,
}

/// Persistent FIFO queue of byte records.
///
/// Records are stored as blob references (inline when small, chunked into
/// dedicated blocks when large) appended to a linked list of queue blocks.
/// Push and pop are serialised by a single mutex; inside it they use the
/// transactional cache, whose soft durability is acceptable because the
/// backing file is unlinked anyway.
pub struct DiskBackedQueue {
    cache: Cache,
    inner: Mutex<QueueInner>,
}

impl DiskBackedQueue {
    /// Creates a queue backed by an unlinked file inside `dir`.
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Result<DiskBackedQueue, QueueError> {
        let path = dir.as_ref().join(format!("{name}.dbq"));
        let serializer = Arc::new(FileSerializer::create_unlinked(path)?);
        Ok(DiskBackedQueue {
            cache: Cache::new(serializer, QUEUE_CACHE_BLOCKS),
            inner: Mutex::new(QueueInner {
                head_block_id: NULL_BLOCK_ID,
                tail_block_id: NULL_BLOCK_ID,
                queue_size: 0,
            }),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().queue_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one record.
    pub fn push(&self, record: &[u8]) {
        let mut inner = self.inner.lock();
        let txn = Transaction::new(&self.cache);

        if inner.head_block_id == NULL_BLOCK_ID {
            self.add_block_to_head(&txn, &mut inner);
        }

        let blob = write_blob(&txn, record);

        let mut head = Acquisition::write(&txn, inner.head_block_id);
        let header = read_header(&head);
        let fits = HEADER_SIZE + header.data_size as usize + blob.encoded_len()
            <= self.cache.block_size();
        if !fits {
            // The reference won't fit in the current head block; start a new
            // one and link the old head to it.
            drop(head);
            self.add_block_to_head(&txn, &mut inner);
            head = Acquisition::write(&txn, inner.head_block_id);
        }

        let mut header = read_header(&head);
        let offset = HEADER_SIZE + header.data_size as usize;
        {
            let mut buf = head.get_buf_write();
            buf[offset..offset + blob.encoded_len()].copy_from_slice(blob.encoded());
        }
        header.data_size += blob.encoded_len() as u32;
        write_header(&mut head, header);

        inner.queue_size += 1;
    }

    /// Removes the oldest record, exposing its bytes to `viewer`. The viewer
    /// must not retain the bytes beyond the call.
    ///
    /// Popping from an empty queue is a contract violation.
    pub fn pop(&self, viewer: impl FnOnce(&[u8])) {
        let mut inner = self.inner.lock();
        assert!(inner.queue_size != 0, "pop from an empty queue");
        let txn = Transaction::new(&self.cache);

        let mut tail = Acquisition::write(&txn, inner.tail_block_id);
        let mut header = read_header(&tail);
        assert!(header.live_data_offset < header.data_size);

        // Copy the reference out so the tail buffer is free for the header
        // update while the blob blocks are being read.
        let blob = {
            let buf = tail.get_buf_read();
            BlobRef::parse(&buf[HEADER_SIZE + header.live_data_offset as usize..])
        };

        read_blob(&txn, &blob, viewer);
        free_blob(&txn, &blob);

        header.live_data_offset += blob.encoded_len() as u32;
        write_header(&mut tail, header);
        inner.queue_size -= 1;

        // Last record of this block consumed: unlink it and move the tail on.
        if header.live_data_offset == header.data_size {
            drop(tail);
            self.remove_block_from_tail(&txn, &mut inner);
        }
    }

    fn add_block_to_head(&self, txn: &Transaction, inner: &mut QueueInner) {
        let mut new_head = Acquisition::create(txn);
        let new_head_id = new_head.block_id();
        write_header(
            &mut new_head,
            QueueBlockHeader {
                next: NULL_BLOCK_ID,
                data_size: 0,
                live_data_offset: 0,
            },
        );

        if inner.head_block_id == NULL_BLOCK_ID {
            assert_eq!(inner.tail_block_id, NULL_BLOCK_ID);
            inner.head_block_id = new_head_id;
            inner.tail_block_id = new_head_id;
        } else {
            let mut old_head = Acquisition::write(txn, inner.head_block_id);
            let mut header = read_header(&old_head);
            assert_eq!(header.next, NULL_BLOCK_ID);
            header.next = new_head_id;
            write_header(&mut old_head, header);
            inner.head_block_id = new_head_id;
        }
    }

    fn remove_block_from_tail(&self, txn: &Transaction, inner: &mut QueueInner) {
        assert_ne!(inner.tail_block_id, NULL_BLOCK_ID);
        let mut old_tail = Acquisition::write(txn, inner.tail_block_id);
        let header = read_header(&old_tail);

        if header.next == NULL_BLOCK_ID {
            assert_eq!(inner.head_block_id, old_tail.block_id());
            inner.head_block_id = NULL_BLOCK_ID;
            inner.tail_block_id = NULL_BLOCK_ID;
        } else {
            inner.tail_block_id = header.next;
        }

        old_tail.mark_deleted();
    }
}

fn read_header(acq: &Acquisition) -> QueueBlockHeader {
    let buf = acq.get_buf_read();
    bytemuck::pod_read_unaligned(&buf[..HEADER_SIZE])
}

fn write_header(acq: &mut Acquisition, header: QueueBlockHeader) {
    let mut buf = acq.get_buf_write();
    buf[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    fn pop_vec(queue: &DiskBackedQueue) -> Vec<u8> {
        let mut out = Vec::new();
        queue.pop(|bytes| out.extend_from_slice(bytes));
        out
    }

    #[test]
    fn backing_file_is_unlinked() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();
        queue.push(b"still works");
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "no directory entry may exist for the queue file"
        );
        assert_eq!(pop_vec(&queue), b"still works");
    }

    #[test]
    fn fifo_order_small_records() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();

        for i in 0..100u32 {
            queue.push(format!("record-{i}").as_bytes());
        }
        assert_eq!(queue.len(), 100);

        for i in 0..100u32 {
            assert_eq!(pop_vec(&queue), format!("record-{i}").into_bytes());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn mixed_sizes_roundtrip() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();

        // Sizes straddling the inline bound and the block size, so some
        // records go through indirect chunk blocks.
        let sizes = [1usize, 100, 247, 248, 249, 1_000, 4_080, 5_000, 12_345];
        let records: Vec<Vec<u8>> = (0..1_000)
            .map(|i| {
                let size = sizes[i % sizes.len()];
                (0..size).map(|j| ((i + j) % 251) as u8).collect()
            })
            .collect();

        for record in &records {
            queue.push(record);
        }
        assert_eq!(queue.len(), records.len() as u64);

        for record in &records {
            assert_eq!(&pop_vec(&queue), record);
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn interleaved_push_pop() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();

        let mut next_push = 0u32;
        let mut next_pop = 0u32;
        // Ramp up, then drain, repeatedly.
        for round in 0..10 {
            for _ in 0..(round * 7 + 3) {
                queue.push(&next_push.to_le_bytes());
                next_push += 1;
            }
            while !queue.is_empty() {
                let bytes = pop_vec(&queue);
                assert_eq!(bytes, next_pop.to_le_bytes());
                next_pop += 1;
            }
        }
        assert_eq!(next_push, next_pop);
    }

    #[test]
    fn records_spanning_many_queue_blocks() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();

        // Each inline record takes ~200 bytes of block space; a few hundred
        // of them roll the head block over several times.
        let record = [7u8; 197];
        for _ in 0..200 {
            queue.push(&record);
        }
        for _ in 0..200 {
            assert_eq!(pop_vec(&queue), record);
        }
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "pop from an empty queue")]
    fn pop_from_empty_queue_panics() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();
        queue.pop(|_| {});
    }

    #[test]
    fn concurrent_pushers_drain_to_one_popper() {
        let dir = tempdir().unwrap();
        let queue = DiskBackedQueue::new(dir.path(), "q").unwrap();

        thread::scope(|scope| {
            for t in 0..4u32 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..50u32 {
                        queue.push(&(t * 1_000 + i).to_le_bytes());
                    }
                });
            }
        });
        assert_eq!(queue.len(), 200);

        // Every pushed record comes back exactly once; per-thread order is
        // preserved by the FIFO even though threads interleave.
        let mut seen: Vec<u32> = Vec::new();
        while !queue.is_empty() {
            let bytes = pop_vec(&queue);
            seen.push(u32::from_le_bytes(bytes.try_into().unwrap()));
        }
        assert_eq!(seen.len(), 200);
        for t in 0..4u32 {
            let per_thread: Vec<u32> = seen
                .iter()
                .copied()
                .filter(|v| v / 1_000 == t)
                .collect();
            let expected: Vec<u32> = (0..50).map(|i| t * 1_000 + i).collect();
            assert_eq!(per_thread, expected);
        }
    }
}
