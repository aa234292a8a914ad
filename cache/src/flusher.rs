//! Flusher module — background worker that walks the transaction DAG and
//! turns finished transactions into batched serializer writes plus one atomic
//! index-write per flush group.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel;
use log::{error, info};

use crate::cache::{CacheShared, CacheStats, FlushCompletion, PageKey, TxnId};
use crate::page::Signal;
use crate::serializer::{BlockId, BufWriteInfo, IndexWriteOp, Recency, Serializer};

/// Final image of one block dirtied by a transaction, captured when the
/// writing acquisition was released.
pub(crate) struct FlushWrite {
    pub(crate) block_id: BlockId,
    /// Page the image came from, so the cache can clear its dirty bit once
    /// the image is committed — provided the page content has not moved on.
    pub(crate) page: PageKey,
    pub(crate) version: u64,
    pub(crate) content: Box<[u8]>,
    pub(crate) recency: Recency,
}

/// Everything the flusher needs from one ended transaction.
pub(crate) struct FlushRecord {
    pub(crate) txn_id: TxnId,
    /// Transactions that must commit before this one. Only ids that were
    /// still unflushed when the record was built appear here.
    pub(crate) preceders: Vec<TxnId>,
    pub(crate) writes: Vec<FlushWrite>,
    pub(crate) deletes: Vec<BlockId>,
}

pub(crate) enum Request {
    Flush(FlushRecord),
    /// Fires the signal once every record received so far has been flushed.
    Barrier(Arc<Signal>),
    Shutdown,
}

/// Handle for shutting down the flusher and awaiting its completion.
pub(crate) struct FlusherHandle {
    handle: thread::JoinHandle<()>,
    request_tx: channel::Sender<Request>,
}

impl FlusherHandle {
    /// Asks the flusher to drain everything pending and stop, then joins it.
    pub(crate) fn shutdown(self) {
        // The flusher may already be gone if its channel disconnected.
        let _ = self.request_tx.send(Request::Shutdown);
        if self.handle.join().is_err() {
            error!("flusher thread panicked");
        }
    }
}

/// Spawns the flusher thread. `shared` is weak because the cache owns the
/// flusher, not the other way around.
pub(crate) fn spawn(
    request_rx: channel::Receiver<Request>,
    request_tx: channel::Sender<Request>,
    serializer: Arc<dyn Serializer>,
    shared: Weak<CacheShared>,
    stats: Arc<CacheStats>,
) -> FlusherHandle {
    info!("starting cache flusher");
    let flusher = Flusher {
        serializer,
        shared,
        stats,
        request_rx,
        pending: Vec::new(),
        flushed: HashSet::new(),
    };
    let handle = thread::spawn(move || {
        flusher.run();
    });
    FlusherHandle { handle, request_tx }
}

struct Flusher {
    serializer: Arc<dyn Serializer>,
    shared: Weak<CacheShared>,
    stats: Arc<CacheStats>,
    request_rx: channel::Receiver<Request>,
    /// Records held back because a preceder has not flushed yet, in arrival
    /// order.
    pending: Vec<FlushRecord>,
    /// Every transaction id ever flushed. Records arriving later may still
    /// name one of these as a preceder.
    flushed: HashSet<TxnId>,
}

/// Coalesced final operation for one block id within a flush group.
enum FinalOp {
    Write(FlushWrite),
    Delete,
}

impl Flusher {
    fn run(mut self) {
        loop {
            match self.request_rx.recv() {
                Ok(Request::Flush(record)) => {
                    self.pending.push(record);
                    self.try_flush();
                }
                Ok(Request::Barrier(signal)) => {
                    self.try_flush();
                    signal.fire();
                }
                Ok(Request::Shutdown) | Err(channel::RecvError) => {
                    self.drain();
                    info!("shutting down cache flusher");
                    break;
                }
            }
        }
    }

    /// Flushes everything that can still flush. Called on shutdown, after the
    /// remaining requests have been pulled off the channel.
    fn drain(&mut self) {
        while let Ok(request) = self.request_rx.try_recv() {
            match request {
                Request::Flush(record) => self.pending.push(record),
                Request::Barrier(signal) => signal.fire(),
                Request::Shutdown => {}
            }
        }
        self.try_flush();
        if !self.pending.is_empty() {
            error!(
                "flusher shut down with {} transactions still waiting on unflushed preceders",
                self.pending.len()
            );
        }
    }

    /// Forms one flush group out of every pending record whose preceders have
    /// all flushed (transitively, so a chain that became ready together
    /// coalesces into a single group) and commits it.
    fn try_flush(&mut self) {
        let mut group: Vec<FlushRecord> = Vec::new();
        let mut group_ids: HashSet<TxnId> = HashSet::new();

        loop {
            let mut advanced = false;
            let mut i = 0;
            while i < self.pending.len() {
                let ready = self.pending[i]
                    .preceders
                    .iter()
                    .all(|p| self.flushed.contains(p) || group_ids.contains(p));
                if ready {
                    let record = self.pending.remove(i);
                    group_ids.insert(record.txn_id);
                    group.push(record);
                    advanced = true;
                } else {
                    i += 1;
                }
            }
            if !advanced {
                break;
            }
        }

        if !group.is_empty() {
            self.flush_group(group);
        }
    }

    fn flush_group(&mut self, group: Vec<FlushRecord>) {
        // Take the final operation per block id. Group order puts preceders
        // before succeeders, so the last operation seen wins.
        let mut final_ops: HashMap<BlockId, FinalOp> = HashMap::new();
        let mut block_order: Vec<BlockId> = Vec::new();
        let mut txn_ids = Vec::with_capacity(group.len());
        for record in group {
            txn_ids.push(record.txn_id);
            for block_id in record.deletes {
                if final_ops.insert(block_id, FinalOp::Delete).is_none() {
                    block_order.push(block_id);
                }
            }
            for write in record.writes {
                let block_id = write.block_id;
                if final_ops.insert(block_id, FinalOp::Write(write)).is_none() {
                    block_order.push(block_id);
                }
            }
        }

        let mut writes: Vec<BufWriteInfo> = Vec::new();
        let mut write_meta: Vec<(BlockId, PageKey, u64, Recency)> = Vec::new();
        for block_id in &block_order {
            if let Some(FinalOp::Write(write)) = final_ops.get(block_id) {
                write_meta.push((write.block_id, write.page, write.version, write.recency));
                writes.push(BufWriteInfo {
                    block_id: write.block_id,
                    recency: write.recency,
                    data: write.content.clone(),
                });
            }
        }

        let tokens = if writes.is_empty() {
            Vec::new()
        } else {
            self.serializer
                .block_writes(writes)
                .unwrap_or_else(|e| panic!("fatal serializer failure during block writes: {e}"))
        };

        let mut index_ops: Vec<IndexWriteOp> = Vec::new();
        let mut completion_writes = Vec::new();
        let mut completion_deletes = Vec::new();
        let mut token_iter = tokens.into_iter();
        for block_id in &block_order {
            match final_ops.get(block_id).unwrap() {
                FinalOp::Write(_) => {
                    let (id, page, version, recency) = write_meta[completion_writes.len()];
                    let token = token_iter.next().expect("one token per block write");
                    index_ops.push(IndexWriteOp::update(id, token.clone(), recency));
                    completion_writes.push((id, page, version, token, recency));
                }
                FinalOp::Delete => {
                    index_ops.push(IndexWriteOp::delete(*block_id));
                    completion_deletes.push(*block_id);
                }
            }
        }

        if !index_ops.is_empty() {
            self.serializer
                .index_write(index_ops)
                .unwrap_or_else(|e| panic!("fatal serializer failure during index write: {e}"));
        }

        if let Some(shared) = self.shared.upgrade() {
            shared.complete_flush(FlushCompletion {
                writes: completion_writes,
                deletes: completion_deletes,
                txns: txn_ids.clone(),
            });
        }

        self.flushed.extend(txn_ids);
        self.stats.note_flush_group();
    }
}
