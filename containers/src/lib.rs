//! Persistent containers built on the transactional page cache.

mod disk_backed_queue;

pub use disk_backed_queue::{DiskBackedQueue, QueueError};
