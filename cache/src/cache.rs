//! Cache module — the transactional page cache: per-block slots with a FIFO
//! acquisition protocol, snapshot hand-off to displaced readers, transaction
//! grouping with flush-order edges, and bounded memory via the evictor.
//!
//! Threads that use [`Cache`] should not have to worry about concurrency
//! problems — all of them are handled by the cache. Every protocol transition
//! happens under one core lock; waiting (for readiness signals or page loads)
//! always happens outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel;
use log::error;
use parking_lot::Mutex;

use crate::evictor::{Evictable, Evictor, PAGE_REPL_NUM_TRIES};
use crate::flusher::{self, FlushRecord, FlushWrite, FlusherHandle, Request};
use crate::page::{BufRead, BufWrite, LoadState, Page, Signal};
use crate::serializer::{BlockId, BlockToken, Recency, Serializer};

/// Internal handle for one in-memory page; unique for the cache's lifetime.
pub(crate) type PageKey = u64;

/// Internal handle for one transaction.
pub(crate) type TxnId = u64;

type AcqId = u64;

/// Tuning knobs for a cache instance.
pub struct CacheConfig {
    /// Evictor threshold: maximum clean, unpinned pages kept resident.
    /// Zero forces aggressive eviction.
    pub memory_limit_blocks: usize,
    /// Samples drawn per eviction round.
    pub page_repl_num_tries: usize,
}

impl CacheConfig {
    pub fn new(memory_limit_blocks: usize) -> CacheConfig {
        CacheConfig {
            memory_limit_blocks,
            page_repl_num_tries: PAGE_REPL_NUM_TRIES,
        }
    }
}

/// Counters kept outside the protocol types; shared with the flusher.
#[derive(Default)]
pub struct CacheStats {
    blocks_loaded: AtomicU64,
    blocks_evicted: AtomicU64,
    transactions_flushed: AtomicU64,
    flush_groups: AtomicU64,
}

impl CacheStats {
    pub fn blocks_loaded(&self) -> u64 {
        self.blocks_loaded.load(Ordering::Relaxed)
    }
    pub fn blocks_evicted(&self) -> u64 {
        self.blocks_evicted.load(Ordering::Relaxed)
    }
    pub fn transactions_flushed(&self) -> u64 {
        self.transactions_flushed.load(Ordering::Relaxed)
    }
    pub fn flush_groups(&self) -> u64 {
        self.flush_groups.load(Ordering::Relaxed)
    }
    pub(crate) fn note_flush_group(&self) {
        self.flush_groups.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// One transaction's pending or granted claim on a slot.
struct AcqState {
    txn: TxnId,
    block_id: BlockId,
    mode: Mode,
    read_ready: Arc<Signal>,
    write_ready: Arc<Signal>,
    /// Page this acquisition observes; set (and pinned) at read grant.
    page: Option<PageKey>,
    /// The holder called `declare_snapshotted`.
    snapshotted: bool,
    /// Left the FIFO as a snapshot holder; keeps a snapshot ref on its page.
    dequeued: bool,
    /// Obtained the write buffer at least once.
    wrote: bool,
    marked_deleted: bool,
}

/// Final per-block outcome a transaction will flush.
enum TxnTouch {
    Write {
        page: PageKey,
        version: u64,
        content: Box<[u8]>,
    },
    Delete,
}

struct TxnState {
    live_acqs: u32,
    preceders: Vec<TxnId>,
    touched: HashMap<BlockId, TxnTouch>,
    touch_order: Vec<BlockId>,
    began_flush: bool,
}

/// Per-block-id entry owning the current page and the acquisition FIFO.
struct Slot {
    current: Option<PageKey>,
    queue: VecDeque<AcqId>,
    /// Transaction that last write-acquired this block; source of implicit
    /// flush-order edges while it remains unflushed.
    last_writer: Option<TxnId>,
}

struct CacheCore {
    pages: HashMap<PageKey, Page>,
    next_page_key: PageKey,
    slots: HashMap<BlockId, Slot>,
    acqs: HashMap<AcqId, AcqState>,
    next_acq_id: AcqId,
    txns: HashMap<TxnId, TxnState>,
    next_txn_id: TxnId,
    evictor: Evictor<PageKey>,
    /// Reusable block ids, LIFO. Ids deleted by a transaction return here
    /// when the transaction ends.
    free_ids: Vec<BlockId>,
    next_block_id: BlockId,
    next_recency: Recency,
}

enum PumpStep {
    GrantRead(AcqId),
    DequeueSnapshotter(AcqId),
    GrantWrite(AcqId),
}

impl CacheCore {
    fn alloc_block_id(&mut self) -> BlockId {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = self.next_block_id;
                self.next_block_id += 1;
                id
            }
        }
    }

    fn alloc_page_key(&mut self) -> PageKey {
        let key = self.next_page_key;
        self.next_page_key += 1;
        key
    }

    /// Re-evaluates a slot's FIFO after any state change, applying one grant
    /// at a time until nothing more can advance. Grant order:
    ///
    /// - `read_ready` fires for each entry, in queue order, while every
    ///   earlier entry is a read-granted reader (granted writers block later
    ///   entries until released).
    /// - a read-granted entry that declared itself snapshotted leaves the
    ///   FIFO, holding a snapshot reference on its page.
    /// - `write_ready` fires for a writer once it is the queue head.
    fn pump_slot(&mut self, block_id: BlockId) {
        loop {
            let Some(slot) = self.slots.get(&block_id) else {
                return;
            };

            let mut step = None;
            let mut blocked = false;
            for &acq_id in &slot.queue {
                let acq = &self.acqs[&acq_id];
                if !blocked {
                    if acq.page.is_none() {
                        step = Some(PumpStep::GrantRead(acq_id));
                        break;
                    }
                    if acq.snapshotted && !acq.dequeued {
                        step = Some(PumpStep::DequeueSnapshotter(acq_id));
                        break;
                    }
                }
                if acq.mode == Mode::Write || acq.page.is_none() {
                    blocked = true;
                }
            }

            if step.is_none()
                && let Some(&head) = slot.queue.front()
            {
                let acq = &self.acqs[&head];
                if acq.mode == Mode::Write && acq.page.is_some() && !acq.write_ready.is_fired() {
                    step = Some(PumpStep::GrantWrite(head));
                }
            }

            match step {
                None => return,
                Some(step) => self.apply_step(block_id, step),
            }
        }
    }

    fn apply_step(&mut self, block_id: BlockId, step: PumpStep) {
        match step {
            PumpStep::GrantRead(acq_id) => {
                let slot = self.slots.get_mut(&block_id).unwrap();
                let page_key = slot.current.unwrap_or_else(|| {
                    panic!("acquired block {block_id} which has been deleted")
                });
                let page = self.pages.get_mut(&page_key).unwrap();
                debug_assert_eq!(page.block_id, block_id);
                page.pin_count += 1;
                self.evictor.remove(page_key, &mut self.pages);
                let acq = self.acqs.get_mut(&acq_id).unwrap();
                acq.page = Some(page_key);
                acq.read_ready.fire();
            }
            PumpStep::DequeueSnapshotter(acq_id) => {
                let slot = self.slots.get_mut(&block_id).unwrap();
                let position = slot
                    .queue
                    .iter()
                    .position(|&id| id == acq_id)
                    .expect("snapshotter must still be queued");
                slot.queue.remove(position);
                let acq = self.acqs.get_mut(&acq_id).unwrap();
                acq.dequeued = true;
                let page_key = acq.page.unwrap();
                self.pages.get_mut(&page_key).unwrap().snapshot_refs += 1;
            }
            PumpStep::GrantWrite(acq_id) => {
                let acq = self.acqs.get_mut(&acq_id).unwrap();
                let txn_id = acq.txn;
                acq.write_ready.fire();
                // A preceding unflushed writer of this block imposes a
                // flush-order edge; without it two transactions touching the
                // same block could reach the index out of order.
                let slot = self.slots.get_mut(&block_id).unwrap();
                let previous = slot.last_writer.replace(txn_id);
                if let Some(previous) = previous
                    && previous != txn_id
                    && self.txns.contains_key(&previous)
                {
                    let txn = self.txns.get_mut(&txn_id).unwrap();
                    if !txn.preceders.contains(&previous) {
                        txn.preceders.push(previous);
                    }
                }
            }
        }
    }

    /// Drops a slot that no longer holds anything and cannot impose ordering.
    fn maybe_remove_slot(&mut self, block_id: BlockId) {
        let Some(slot) = self.slots.get(&block_id) else {
            return;
        };
        if slot.current.is_none()
            && slot.queue.is_empty()
            && !slot
                .last_writer
                .is_some_and(|txn| self.txns.contains_key(&txn))
        {
            self.slots.remove(&block_id);
        }
    }

    /// Inserts an unpinned clean page into the evictor and trims back to the
    /// memory target. Returns the number of pages evicted.
    fn retire_page(&mut self, page_key: PageKey) -> usize {
        let page = &self.pages[&page_key];
        if page.safe_to_unload() && page.repl_index.is_none() {
            self.evictor.insert(page_key, &mut self.pages);
            self.evictor.make_space(0, &mut self.pages)
        } else {
            0
        }
    }
}

/// Completion report from the flusher for one flush group.
pub(crate) struct FlushCompletion {
    /// `(block_id, page, version, token, recency)` per committed write.
    pub(crate) writes: Vec<(BlockId, PageKey, u64, BlockToken, Recency)>,
    pub(crate) deletes: Vec<BlockId>,
    pub(crate) txns: Vec<TxnId>,
}

pub(crate) struct CacheShared {
    core: Mutex<CacheCore>,
    serializer: Arc<dyn Serializer>,
    stats: Arc<CacheStats>,
    flush_tx: channel::Sender<Request>,
}

impl CacheShared {
    /// Demand-loads the page an acquisition observes, suspending on another
    /// caller's in-flight load rather than starting a second one.
    fn ensure_loaded(&self, acq_id: AcqId) -> PageKey {
        loop {
            let mut core = self.core.lock();
            let page_key = core.acqs[&acq_id]
                .page
                .expect("buffer access before the acquisition was granted");

            enum LoadPlan {
                Ready,
                Wait(Arc<Signal>),
                Start(BlockToken),
            }

            let plan = {
                let page = core.pages.get_mut(&page_key).unwrap();
                match &page.load {
                    LoadState::Resident => LoadPlan::Ready,
                    LoadState::InFlight(signal) => LoadPlan::Wait(signal.clone()),
                    LoadState::NotStarted => {
                        let token = page
                            .token
                            .clone()
                            .expect("unloaded page must be backed by a token");
                        page.load = LoadState::InFlight(Signal::new());
                        LoadPlan::Start(token)
                    }
                }
            };

            match plan {
                LoadPlan::Ready => return page_key,
                LoadPlan::Wait(signal) => {
                    drop(core);
                    signal.wait();
                }
                LoadPlan::Start(token) => {
                    // Make room for the buffer about to become resident.
                    let CacheCore { evictor, pages, .. } = &mut *core;
                    let evicted = evictor.make_space(1, pages);
                    self.stats
                        .blocks_evicted
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    drop(core);

                    let mut buf = self.serializer.alloc_buf();
                    self.serializer
                        .block_read(&token, &mut buf)
                        .unwrap_or_else(|e| panic!("fatal serializer failure reading block: {e}"));

                    let mut core = self.core.lock();
                    core.pages.get_mut(&page_key).unwrap().install_buf(buf);
                    self.stats.blocks_loaded.fetch_add(1, Ordering::Relaxed);
                    return page_key;
                }
            }
        }
    }

    /// Applies a finished flush group: installs tokens, clears dirty bits
    /// where the flushed image is still current, and returns now-clean pages
    /// to the evictor.
    pub(crate) fn complete_flush(&self, completion: FlushCompletion) {
        let mut core = self.core.lock();
        let mut evicted = 0;
        for (_block_id, page_key, version, token, _recency) in completion.writes {
            let Some(page) = core.pages.get_mut(&page_key) else {
                continue;
            };
            if page.deleted || page.version != version {
                // The block moved on since this image was captured; a later
                // transaction's flush owns the page now.
                continue;
            }
            page.token = Some(token);
            page.dirty = false;
            evicted += core.retire_page(page_key);
        }
        for txn_id in completion.txns {
            core.txns.remove(&txn_id);
            self.stats
                .transactions_flushed
                .fetch_add(1, Ordering::Relaxed);
        }
        for block_id in completion.deletes {
            core.maybe_remove_slot(block_id);
        }
        self.stats
            .blocks_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Transactional page cache over a [`Serializer`].
///
/// Dropping the cache flushes every finished transaction and joins the
/// flusher, so a reopened cache on the same serializer observes all committed
/// content.
pub struct Cache {
    shared: Arc<CacheShared>,
    flusher: Option<FlusherHandle>,
}

impl Cache {
    pub fn new(serializer: Arc<dyn Serializer>, memory_limit_blocks: usize) -> Cache {
        Cache::with_config(serializer, CacheConfig::new(memory_limit_blocks))
    }

    pub fn with_config(serializer: Arc<dyn Serializer>, config: CacheConfig) -> Cache {
        // Rebuild the free id pool and the recency counter from the index.
        let max_block_id = serializer.max_block_id();
        let mut free_ids = Vec::new();
        let mut next_recency = 0;
        for id in (0..max_block_id).rev() {
            if serializer.index_read(id).is_none() {
                free_ids.push(id);
            }
            next_recency = next_recency.max(serializer.get_recency(id));
        }

        let core = CacheCore {
            pages: HashMap::new(),
            next_page_key: 0,
            slots: HashMap::new(),
            acqs: HashMap::new(),
            next_acq_id: 0,
            txns: HashMap::new(),
            next_txn_id: 0,
            evictor: Evictor::new(config.memory_limit_blocks, config.page_repl_num_tries),
            free_ids,
            next_block_id: max_block_id,
            next_recency: next_recency + 1,
        };

        let stats = Arc::new(CacheStats::default());
        let (flush_tx, flush_rx) = channel::unbounded();
        let shared = Arc::new(CacheShared {
            core: Mutex::new(core),
            serializer: serializer.clone(),
            stats: stats.clone(),
            flush_tx: flush_tx.clone(),
        });
        let flusher = flusher::spawn(
            flush_rx,
            flush_tx,
            serializer,
            Arc::downgrade(&shared),
            stats,
        );

        Cache {
            shared,
            flusher: Some(flusher),
        }
    }

    /// Usable bytes per block buffer.
    pub fn block_size(&self) -> usize {
        self.shared.serializer.block_size()
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.shared.stats.clone()
    }

    /// Clean, unpinned pages currently resident — the evictor's population.
    pub fn resident_clean_pages(&self) -> usize {
        self.shared.core.lock().evictor.len()
    }

    /// Blocks until every transaction that finished before this call has been
    /// flushed to the serializer.
    pub fn sync_flush(&self) {
        let signal = Signal::new();
        if self
            .shared
            .flush_tx
            .send(Request::Barrier(signal.clone()))
            .is_err()
        {
            return;
        }
        signal.wait();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Unit of grouped acquisitions. Dropping the transaction marks it
/// ready-to-flush and hands its dirty pages to the flusher without blocking.
pub struct Transaction {
    shared: Arc<CacheShared>,
    id: TxnId,
}

impl Transaction {
    pub fn new(cache: &Cache) -> Transaction {
        Transaction::start(cache, None)
    }

    /// Like [`Transaction::new`], additionally recording that `preceder` must
    /// flush before this transaction.
    pub fn with_preceder(cache: &Cache, preceder: &Transaction) -> Transaction {
        Transaction::start(cache, Some(preceder.id))
    }

    pub(crate) fn block_size(&self) -> usize {
        self.shared.serializer.block_size()
    }

    fn start(cache: &Cache, preceder: Option<TxnId>) -> Transaction {
        let shared = cache.shared.clone();
        let mut core = shared.core.lock();
        let id = core.next_txn_id;
        core.next_txn_id += 1;
        let preceders = preceder
            .filter(|p| core.txns.contains_key(p))
            .into_iter()
            .collect();
        core.txns.insert(
            id,
            TxnState {
                live_acqs: 0,
                preceders,
                touched: HashMap::new(),
                touch_order: Vec::new(),
                began_flush: false,
            },
        );
        drop(core);
        Transaction { shared, id }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let mut core = self.shared.core.lock();
        let txn = core.txns.get_mut(&self.id).expect("transaction state lost");
        assert_eq!(
            txn.live_acqs, 0,
            "transaction dropped while acquisitions are still live"
        );
        txn.began_flush = true;

        let mut touched = std::mem::take(&mut txn.touched);
        let touch_order = std::mem::take(&mut txn.touch_order);
        let raw_preceders = std::mem::take(&mut txn.preceders);
        let preceders: Vec<TxnId> = raw_preceders
            .into_iter()
            .filter(|p| core.txns.contains_key(p))
            .collect();

        let recency = core.next_recency;
        core.next_recency += 1;

        // `touched` holds the final per-block outcome; the first occurrence
        // in acquisition order claims it and re-touches find nothing.
        let mut writes = Vec::new();
        let mut deletes = Vec::new();
        for block_id in touch_order {
            match touched.remove(&block_id) {
                Some(TxnTouch::Write {
                    page,
                    version,
                    content,
                }) => writes.push(FlushWrite {
                    block_id,
                    page,
                    version,
                    content,
                    recency,
                }),
                Some(TxnTouch::Delete) => {
                    deletes.push(block_id);
                    core.free_ids.push(block_id);
                }
                None => {}
            }
        }
        drop(core);

        let record = FlushRecord {
            txn_id: self.id,
            preceders,
            writes,
            deletes,
        };
        if self.shared.flush_tx.send(Request::Flush(record)).is_err() {
            error!("transaction finished after its cache was shut down");
        }
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// A transaction's live claim on one block's slot.
///
/// Created queued; becomes read-ready, then (for writers) write-ready;
/// released on drop, which re-evaluates the slot's FIFO.
pub struct Acquisition {
    shared: Arc<CacheShared>,
    id: AcqId,
    block_id: BlockId,
    read_ready: Arc<Signal>,
    write_ready: Arc<Signal>,
    mode: Mode,
}

impl Acquisition {
    /// Queues for shared access to `block_id`.
    pub fn read(txn: &Transaction, block_id: BlockId) -> Acquisition {
        Acquisition::acquire(txn, block_id, Mode::Read, false)
    }

    /// Queues for exclusive access to `block_id`.
    pub fn write(txn: &Transaction, block_id: BlockId) -> Acquisition {
        Acquisition::acquire(txn, block_id, Mode::Write, false)
    }

    /// Allocates a fresh block id and acquires it for writing. The new page
    /// is resident, zero-filled and immediately write-ready.
    pub fn create(txn: &Transaction) -> Acquisition {
        Acquisition::acquire(txn, 0, Mode::Write, true)
    }

    fn acquire(txn: &Transaction, block_id: BlockId, mode: Mode, create: bool) -> Acquisition {
        let shared = txn.shared.clone();
        let mut core = shared.core.lock();
        {
            let txn_state = core.txns.get(&txn.id).expect("transaction state lost");
            assert!(
                !txn_state.began_flush,
                "acquisition on a finished transaction"
            );
        }

        let block_id = if create { core.alloc_block_id() } else { block_id };

        // Materialise the slot's current page if this block has never been
        // touched by this cache instance.
        let needs_page = match core.slots.get(&block_id) {
            Some(_) => false,
            None => !create,
        };
        if needs_page {
            let token = shared.serializer.index_read(block_id).unwrap_or_else(|| {
                panic!("acquired block {block_id} which does not exist")
            });
            let page_key = core.alloc_page_key();
            core.pages.insert(page_key, Page::unloaded(block_id, token));
            core.slots.insert(
                block_id,
                Slot {
                    current: Some(page_key),
                    queue: VecDeque::new(),
                    last_writer: None,
                },
            );
        }
        if create {
            let buf = shared.serializer.alloc_buf();
            let page_key = core.alloc_page_key();
            core.pages.insert(page_key, Page::created(block_id, buf));
            let slot = core.slots.entry(block_id).or_insert(Slot {
                current: None,
                queue: VecDeque::new(),
                last_writer: None,
            });
            assert!(
                slot.current.is_none() && slot.queue.is_empty(),
                "created block id {block_id} is still in use"
            );
            slot.current = Some(page_key);
            // The fresh page is resident; make room for it.
            let CacheCore { evictor, pages, .. } = &mut *core;
            let evicted = evictor.make_space(1, pages);
            shared
                .stats
                .blocks_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }

        let slot = core.slots.get(&block_id).unwrap();
        if !create && slot.current.is_none() {
            panic!("acquired block {block_id} which has been deleted");
        }

        let id = core.next_acq_id;
        core.next_acq_id += 1;
        let read_ready = Signal::new();
        let write_ready = Signal::new();
        core.acqs.insert(
            id,
            AcqState {
                txn: txn.id,
                block_id,
                mode,
                read_ready: read_ready.clone(),
                write_ready: write_ready.clone(),
                page: None,
                snapshotted: false,
                dequeued: false,
                // A create dirties its fresh page by existing; the zeroed
                // content must reach the serializer even if never written to.
                wrote: create,
                marked_deleted: false,
            },
        );
        core.slots.get_mut(&block_id).unwrap().queue.push_back(id);
        core.txns.get_mut(&txn.id).unwrap().live_acqs += 1;
        core.pump_slot(block_id);
        drop(core);

        Acquisition {
            shared,
            id,
            block_id,
            read_ready,
            write_ready,
            mode,
        }
    }

    /// The block id this acquisition targets. For creates, the freshly
    /// allocated id.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Blocks until the pre-write (or current) content is observable.
    pub fn read_ready(&self) {
        self.read_ready.wait();
    }

    pub fn is_read_ready(&self) -> bool {
        self.read_ready.is_fired()
    }

    /// Blocks until this writer holds exclusive access.
    pub fn write_ready(&self) {
        assert!(self.mode == Mode::Write, "write_ready on a read acquisition");
        self.write_ready.wait();
    }

    pub fn is_write_ready(&self) -> bool {
        self.write_ready.is_fired()
    }

    /// Immutable view of the acquired page's content. Demand-loads the buffer.
    pub fn get_buf_read(&self) -> BufRead<'_> {
        assert!(self.is_read_ready(), "get_buf_read before read_ready");
        let page_key = self.shared.ensure_loaded(self.id);
        let core = self.shared.core.lock();
        let buf = core.pages[&page_key].buf.clone();
        drop(core);
        BufRead::new(buf)
    }

    /// Mutable view of the acquired page's content; marks the page dirty.
    ///
    /// If snapshot holders still observe this page, its content is first
    /// forked onto a snapshot page and the holders are retargeted there, so
    /// their view survives the coming mutation.
    pub fn get_buf_write(&mut self) -> BufWrite<'_> {
        assert!(self.is_write_ready(), "get_buf_write before write_ready");
        let page_key = self.shared.ensure_loaded(self.id);
        let mut core = self.shared.core.lock();

        if core.pages[&page_key].snapshot_refs > 0 {
            let snapshot = core.pages[&page_key].fork_snapshot();
            let snapshot_key = core.alloc_page_key();
            core.pages.insert(snapshot_key, snapshot);

            let holders: Vec<AcqId> = core
                .acqs
                .iter()
                .filter(|(_, acq)| acq.dequeued && acq.page == Some(page_key))
                .map(|(&id, _)| id)
                .collect();
            for holder in &holders {
                core.acqs.get_mut(holder).unwrap().page = Some(snapshot_key);
            }
            let moved = holders.len() as u32;
            let page = core.pages.get_mut(&page_key).unwrap();
            page.snapshot_refs = 0;
            page.pin_count -= moved;
            let snapshot = core.pages.get_mut(&snapshot_key).unwrap();
            snapshot.snapshot_refs = moved;
            snapshot.pin_count = moved;
        }

        {
            let core = &mut *core;
            core.pages.get_mut(&page_key).unwrap().dirty = true;
            core.evictor.remove(page_key, &mut core.pages);
        }
        core.acqs.get_mut(&self.id).unwrap().wrote = true;
        let buf = core.pages[&page_key].buf.clone();
        drop(core);
        BufWrite::new(buf)
    }

    /// Converts this read acquisition into one that permanently references
    /// the content it was granted, releasing its place in the FIFO so later
    /// writers need not wait for it.
    pub fn declare_snapshotted(&self) {
        assert!(
            self.mode == Mode::Read,
            "declare_snapshotted on a write acquisition"
        );
        let mut core = self.shared.core.lock();
        let acq = core.acqs.get_mut(&self.id).unwrap();
        if acq.snapshotted {
            return;
        }
        acq.snapshotted = true;
        core.pump_slot(self.block_id);
    }

    /// Schedules this block for removal at flush time. The slot becomes
    /// empty; the id may be reused by a later create once the owning
    /// transaction ends.
    pub fn mark_deleted(&mut self) {
        let mut core = self.shared.core.lock();
        assert!(
            self.write_ready.is_fired(),
            "mark_deleted before write_ready"
        );
        let acq = core.acqs.get_mut(&self.id).unwrap();
        assert!(!acq.marked_deleted, "block already deleted");
        acq.marked_deleted = true;
        let txn_id = acq.txn;
        let page_key = acq.page.unwrap();

        {
            let core = &mut *core;
            core.evictor.remove(page_key, &mut core.pages);
            core.pages.get_mut(&page_key).unwrap().deleted = true;
        }
        core.slots.get_mut(&self.block_id).unwrap().current = None;

        let txn = core.txns.get_mut(&txn_id).unwrap();
        txn.touched.insert(self.block_id, TxnTouch::Delete);
        txn.touch_order.push(self.block_id);
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        let mut core = self.shared.core.lock();
        let acq = core.acqs.remove(&self.id).expect("acquisition state lost");

        if !acq.dequeued {
            let slot = core.slots.get_mut(&self.block_id).unwrap();
            if let Some(position) = slot.queue.iter().position(|&id| id == self.id) {
                slot.queue.remove(position);
            }
        }

        if let Some(page_key) = acq.page {
            let page_deleted = core.pages[&page_key].deleted;
            if acq.wrote && !page_deleted {
                let page = core.pages.get_mut(&page_key).unwrap();
                page.version += 1;
                let version = page.version;
                let content = page.clone_content();
                let txn = core.txns.get_mut(&acq.txn).unwrap();
                txn.touched.insert(
                    self.block_id,
                    TxnTouch::Write {
                        page: page_key,
                        version,
                        content,
                    },
                );
                txn.touch_order.push(self.block_id);
            }

            let page = core.pages.get_mut(&page_key).unwrap();
            if acq.dequeued {
                page.snapshot_refs -= 1;
            }
            page.pin_count -= 1;
            if page.pin_count == 0 {
                if page.is_snapshot || page.deleted {
                    core.pages.remove(&page_key);
                } else {
                    let evicted = core.retire_page(page_key);
                    self.shared
                        .stats
                        .blocks_evicted
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
            }
        }

        core.txns.get_mut(&acq.txn).unwrap().live_acqs -= 1;
        core.pump_slot(self.block_id);
        core.maybe_remove_slot(self.block_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{
        BufWriteInfo, FileSerializer, IndexWriteOp, SerializerError,
    };
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn new_cache(dir: &Path, memory_limit_blocks: usize) -> (Cache, Arc<FileSerializer>) {
        let serializer = Arc::new(FileSerializer::create(dir.join("store.blk")).unwrap());
        let cache = Cache::new(serializer.clone(), memory_limit_blocks);
        (cache, serializer)
    }

    /// Reads the block's content as the bytes up to the first zero and
    /// asserts it equals `expected`.
    fn check_value(acq: &Acquisition, expected: &str) {
        let buf = acq.get_buf_read();
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        assert_eq!(&buf[..end], expected.as_bytes());
    }

    /// Asserts the current content equals `expected`, then appends `append`.
    fn check_and_append(acq: &mut Acquisition, expected: &str, append: &str) {
        check_value(acq, expected);
        let mut buf = acq.get_buf_write();
        let offset = expected.len();
        buf[offset..offset + append.len()].copy_from_slice(append.as_bytes());
    }

    /// Creates a block holding `content`, commits it and waits for the flush.
    fn create_block(cache: &Cache, content: &str) -> BlockId {
        let txn = Transaction::new(cache);
        let mut acq = Acquisition::create(&txn);
        let block_id = acq.block_id();
        if !content.is_empty() {
            check_and_append(&mut acq, "", content);
        }
        drop(acq);
        drop(txn);
        cache.sync_flush();
        block_id
    }

    #[test]
    fn create_destroy() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        {
            let _txn = Transaction::new(&cache);
        }
        cache.sync_flush();
        drop(cache);
    }

    #[test]
    fn two_sequential_txns_flush_in_any_drop_order() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let txn1 = Transaction::new(&cache);
        let txn2 = Transaction::with_preceder(&cache, &txn1);
        // The succeeder ends first; its (empty) record waits for txn1.
        drop(txn2);
        drop(txn1);
        cache.sync_flush();
        assert_eq!(cache.stats().transactions_flushed(), 2);
    }

    #[test]
    fn create_is_immediately_write_ready() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let txn = Transaction::new(&cache);
        let acq = Acquisition::create(&txn);
        assert!(acq.is_read_ready());
        assert!(acq.is_write_ready());
        assert_ne!(acq.block_id(), crate::serializer::NULL_BLOCK_ID);
    }

    #[test]
    fn single_create_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.blk");
        let block_id;
        {
            let serializer = Arc::new(FileSerializer::create(&path).unwrap());
            let cache = Cache::new(serializer, 16);
            let txn = Transaction::new(&cache);
            let mut acq = Acquisition::create(&txn);
            block_id = acq.block_id();
            check_and_append(&mut acq, "", "hello");
            drop(acq);
            drop(txn);
            // Dropping the cache drains the flusher.
        }

        let serializer = Arc::new(FileSerializer::open(&path).unwrap());
        let cache = Cache::new(serializer, 16);
        let txn = Transaction::new(&cache);
        let acq = Acquisition::read(&txn, block_id);
        assert!(acq.is_read_ready());
        let buf = acq.get_buf_read();
        assert_eq!(buf.len(), cache.block_size());
        assert_eq!(&buf[..5], b"hello");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn fifo_readers_behind_writer() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "abc");

        let txn1 = Transaction::new(&cache);
        let mut writer = Acquisition::write(&txn1, block_id);
        assert!(writer.is_write_ready());

        let txn2 = Transaction::new(&cache);
        let reader2 = Acquisition::read(&txn2, block_id);
        let txn3 = Transaction::new(&cache);
        let reader3 = Acquisition::read(&txn3, block_id);
        assert!(!reader2.is_read_ready());
        assert!(!reader3.is_read_ready());

        check_and_append(&mut writer, "abc", "d");
        assert!(!reader2.is_read_ready());
        drop(writer);

        // Releasing the writer grants every queued reader in one step.
        assert!(reader2.is_read_ready());
        assert!(reader3.is_read_ready());
        check_value(&reader2, "abcd");
        check_value(&reader3, "abcd");
    }

    #[test]
    fn writer_observes_pre_write_content_behind_reader() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "t1");

        let txn_r = Transaction::new(&cache);
        let reader = Acquisition::read(&txn_r, block_id);
        assert!(reader.is_read_ready());

        let txn_w = Transaction::new(&cache);
        let writer = Acquisition::write(&txn_w, block_id);
        // The writer can observe the pre-write content while the reader is
        // still holding, but must not get exclusive access yet.
        assert!(writer.is_read_ready());
        assert!(!writer.is_write_ready());
        check_value(&writer, "t1");

        drop(reader);
        assert!(writer.is_write_ready());
    }

    #[test]
    fn reader_queued_behind_writer_is_blocked() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "x");

        let txn_w = Transaction::new(&cache);
        let writer = Acquisition::write(&txn_w, block_id);
        assert!(writer.is_write_ready());

        let txn_r = Transaction::new(&cache);
        let reader = Acquisition::read(&txn_r, block_id);
        assert!(!reader.is_read_ready());

        drop(writer);
        assert!(reader.is_read_ready());
        check_value(&reader, "x");
    }

    #[test]
    fn writer_forks_snapshot_for_declared_reader() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "v1");

        let txn1 = Transaction::new(&cache);
        let reader = Acquisition::read(&txn1, block_id);
        assert!(reader.is_read_ready());
        reader.declare_snapshotted();

        // The snapshotter no longer holds up the queue.
        let txn2 = Transaction::new(&cache);
        let mut writer = Acquisition::write(&txn2, block_id);
        assert!(writer.is_write_ready());
        check_and_append(&mut writer, "v1", "v2");

        // The reader keeps its pre-write view for as long as it holds on.
        check_value(&reader, "v1");
        check_value(&writer, "v1v2");

        drop(reader);
        drop(txn1);
        drop(writer);
        drop(txn2);
        cache.sync_flush();

        let txn3 = Transaction::new(&cache);
        let fresh = Acquisition::read(&txn3, block_id);
        check_value(&fresh, "v1v2");
    }

    #[test]
    fn chained_snapshots_keep_distinct_views() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "a");

        let txn1 = Transaction::new(&cache);
        let snap_a = Acquisition::read(&txn1, block_id);
        snap_a.declare_snapshotted();

        let txn2 = Transaction::new(&cache);
        let mut w1 = Acquisition::write(&txn2, block_id);
        check_and_append(&mut w1, "a", "b");
        drop(w1);

        let txn3 = Transaction::new(&cache);
        let snap_b = Acquisition::read(&txn3, block_id);
        snap_b.declare_snapshotted();

        let txn4 = Transaction::new(&cache);
        let mut w2 = Acquisition::write(&txn4, block_id);
        check_and_append(&mut w2, "ab", "c");

        check_value(&snap_a, "a");
        check_value(&snap_b, "ab");
        check_value(&w2, "abc");
    }

    #[test]
    fn reader_sees_uncommitted_writes() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "a");

        let txn1 = Transaction::new(&cache);
        let mut writer = Acquisition::write(&txn1, block_id);
        check_and_append(&mut writer, "a", "b");
        drop(writer);

        // txn1 has not finished, but the slot's current content is "ab".
        let txn2 = Transaction::new(&cache);
        let reader = Acquisition::read(&txn2, block_id);
        check_value(&reader, "ab");
    }

    #[test]
    fn same_transaction_reacquisition() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "x");

        let txn = Transaction::new(&cache);
        let mut first = Acquisition::write(&txn, block_id);
        check_and_append(&mut first, "x", "y");

        // The re-acquisition queues behind the prior one.
        let mut second = Acquisition::write(&txn, block_id);
        assert!(!second.is_read_ready());

        drop(first);
        assert!(second.is_write_ready());
        check_and_append(&mut second, "xy", "z");
        drop(second);
        drop(txn);
        cache.sync_flush();

        let txn = Transaction::new(&cache);
        let fresh = Acquisition::read(&txn, block_id);
        check_value(&fresh, "xyz");
    }

    #[test]
    fn cancelled_acquisition_unblocks_the_queue() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "c");

        let txn1 = Transaction::new(&cache);
        let writer = Acquisition::write(&txn1, block_id);
        let txn2 = Transaction::new(&cache);
        let cancelled = Acquisition::read(&txn2, block_id);
        let txn3 = Transaction::new(&cache);
        let survivor = Acquisition::read(&txn3, block_id);

        // Released before ever becoming ready: simply dequeues.
        drop(cancelled);
        drop(writer);
        assert!(survivor.is_read_ready());
    }

    #[test]
    fn delete_then_create_reuses_id() {
        let dir = tempdir().unwrap();
        let (cache, serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "dead");

        let txn1 = Transaction::new(&cache);
        let mut doomed = Acquisition::write(&txn1, block_id);
        doomed.mark_deleted();
        drop(doomed);
        drop(txn1);

        // The freed id comes back LIFO once the deleting transaction ends.
        let txn2 = Transaction::new(&cache);
        let mut fresh = Acquisition::create(&txn2);
        assert_eq!(fresh.block_id(), block_id);
        check_and_append(&mut fresh, "", "new");
        drop(fresh);
        drop(txn2);
        cache.sync_flush();

        let txn3 = Transaction::new(&cache);
        let check = Acquisition::read(&txn3, block_id);
        check_value(&check, "new");
        drop(check);
        drop(txn3);
        assert!(serializer.get_recency(block_id) > 0);
    }

    #[test]
    fn delete_flush_clears_index_and_slot() {
        let dir = tempdir().unwrap();
        let (cache, serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "gone");
        assert!(serializer.index_read(block_id).is_some());

        let txn = Transaction::new(&cache);
        let mut doomed = Acquisition::write(&txn, block_id);
        doomed.mark_deleted();
        drop(doomed);
        drop(txn);
        cache.sync_flush();

        assert!(serializer.index_read(block_id).is_none());
        assert!(!cache.shared.core.lock().slots.contains_key(&block_id));
    }

    #[test]
    #[should_panic(expected = "has been deleted")]
    fn acquiring_deleted_block_panics() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "d");

        let txn = Transaction::new(&cache);
        let mut doomed = Acquisition::write(&txn, block_id);
        doomed.mark_deleted();
        drop(doomed);
        let _second = Acquisition::write(&txn, block_id);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn acquiring_unknown_block_panics() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let txn = Transaction::new(&cache);
        let _acq = Acquisition::read(&txn, 42);
    }

    // ==================== Flush ordering ====================

    /// Serializer wrapper recording the block ids of every index-write batch.
    struct RecordingSerializer {
        inner: FileSerializer,
        batches: Mutex<Vec<Vec<BlockId>>>,
    }

    impl RecordingSerializer {
        fn new(dir: &Path) -> RecordingSerializer {
            RecordingSerializer {
                inner: FileSerializer::create(dir.join("store.blk")).unwrap(),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn batches(&self) -> Vec<Vec<BlockId>> {
            self.batches.lock().clone()
        }
    }

    impl Serializer for RecordingSerializer {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }
        fn max_block_id(&self) -> BlockId {
            self.inner.max_block_id()
        }
        fn index_read(&self, id: BlockId) -> Option<crate::serializer::BlockToken> {
            self.inner.index_read(id)
        }
        fn get_recency(&self, id: BlockId) -> Recency {
            self.inner.get_recency(id)
        }
        fn block_read(
            &self,
            token: &crate::serializer::BlockToken,
            buf: &mut [u8],
        ) -> Result<(), SerializerError> {
            self.inner.block_read(token, buf)
        }
        fn block_writes(
            &self,
            writes: Vec<BufWriteInfo>,
        ) -> Result<Vec<crate::serializer::BlockToken>, SerializerError> {
            self.inner.block_writes(writes)
        }
        fn index_write(&self, ops: Vec<IndexWriteOp>) -> Result<(), SerializerError> {
            self.batches
                .lock()
                .push(ops.iter().map(|op| op.block_id).collect());
            self.inner.index_write(ops)
        }
    }

    #[test]
    fn declared_preceder_commits_first() {
        let dir = tempdir().unwrap();
        let serializer = Arc::new(RecordingSerializer::new(dir.path()));
        let cache = Cache::new(serializer.clone(), 16);
        let block_id = create_block(&cache, "");
        let baseline = serializer.batches().len();

        let txn1 = Transaction::new(&cache);
        let txn2 = Transaction::with_preceder(&cache, &txn1);

        let mut w1 = Acquisition::write(&txn1, block_id);
        check_and_append(&mut w1, "", "a");
        drop(w1);
        drop(txn1);
        cache.sync_flush();

        let mut w2 = Acquisition::write(&txn2, block_id);
        check_and_append(&mut w2, "a", "b");
        drop(w2);
        drop(txn2);
        cache.sync_flush();

        // Two index-write batches, in preceder order, both touching the block.
        let batches = serializer.batches();
        assert_eq!(batches.len(), baseline + 2);
        assert_eq!(batches[baseline], vec![block_id]);
        assert_eq!(batches[baseline + 1], vec![block_id]);

        let txn3 = Transaction::new(&cache);
        let fresh = Acquisition::read(&txn3, block_id);
        check_value(&fresh, "ab");
    }

    #[test]
    fn succeeder_waits_for_live_preceder_and_coalesces() {
        let dir = tempdir().unwrap();
        let serializer = Arc::new(RecordingSerializer::new(dir.path()));
        let cache = Cache::new(serializer.clone(), 16);
        let block_b = create_block(&cache, "");
        let baseline = serializer.batches().len();

        let txn1 = Transaction::new(&cache);
        let txn2 = Transaction::with_preceder(&cache, &txn1);

        let mut w2 = Acquisition::create(&txn2);
        let block_c = w2.block_id();
        check_and_append(&mut w2, "", "c");
        drop(w2);
        drop(txn2);

        // txn2 has finished, but its preceder is still running: nothing may
        // reach the index yet.
        cache.sync_flush();
        assert_eq!(serializer.batches().len(), baseline);

        let mut w1 = Acquisition::write(&txn1, block_b);
        check_and_append(&mut w1, "", "b");
        drop(w1);
        drop(txn1);
        cache.sync_flush();

        // Both transactions became flushable together and coalesced into one
        // group: a single batch, preceder's blocks first.
        let batches = serializer.batches();
        assert_eq!(batches.len(), baseline + 1);
        assert_eq!(batches[baseline], vec![block_b, block_c]);
    }

    #[test]
    fn same_block_transactions_commit_in_write_order() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "");

        let txn1 = Transaction::new(&cache);
        let txn2 = Transaction::new(&cache);

        let mut w1 = Acquisition::write(&txn1, block_id);
        check_and_append(&mut w1, "", "a");
        drop(w1);
        let mut w2 = Acquisition::write(&txn2, block_id);
        check_and_append(&mut w2, "a", "b");
        drop(w2);

        // The later writer ends first. Without the implicit flush-order edge
        // its batch would land first and txn1 would clobber it.
        drop(txn2);
        cache.sync_flush();
        drop(txn1);
        cache.sync_flush();

        let txn3 = Transaction::new(&cache);
        let fresh = Acquisition::read(&txn3, block_id);
        check_value(&fresh, "ab");
    }

    // ==================== Memory bound ====================

    #[test]
    fn tight_memory_keeps_contents_correct() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 2);

        let mut ids = Vec::new();
        {
            let txn = Transaction::new(&cache);
            for i in 0..16u8 {
                let mut acq = Acquisition::create(&txn);
                ids.push(acq.block_id());
                let mut buf = acq.get_buf_write();
                buf[0] = i + 1;
            }
        }
        cache.sync_flush();
        assert!(cache.resident_clean_pages() <= 2);

        for (i, block_id) in ids.iter().enumerate() {
            let txn = Transaction::new(&cache);
            let acq = Acquisition::read(&txn, *block_id);
            let buf = acq.get_buf_read();
            assert_eq!(buf[0], i as u8 + 1);
            drop(buf);
            drop(acq);
            drop(txn);
            assert!(cache.resident_clean_pages() <= 2);
        }

        let stats = cache.stats();
        assert!(stats.blocks_evicted() >= 14);
        assert!(stats.blocks_loaded() >= 14);
    }

    #[test]
    fn pinned_pages_stay_out_of_the_evictor() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 0);
        let block_id = create_block(&cache, "p");
        // Memory limit zero: nothing clean stays resident.
        assert_eq!(cache.resident_clean_pages(), 0);

        let txn = Transaction::new(&cache);
        let acq = Acquisition::read(&txn, block_id);
        check_value(&acq, "p");
        {
            let core = cache.shared.core.lock();
            let page_key = core.slots[&block_id].current.unwrap();
            let page = &core.pages[&page_key];
            assert!(page.pin_count >= 1);
            assert!(page.repl_index.is_none());
        }
        assert_eq!(cache.resident_clean_pages(), 0);

        drop(acq);
        drop(txn);
        // Released clean page is immediately evicted back under the zero
        // threshold.
        assert_eq!(cache.resident_clean_pages(), 0);
        assert!(cache.stats().blocks_evicted() >= 1);
    }

    // ==================== Recency ====================

    #[test]
    fn recency_moves_on_writes_only() {
        let dir = tempdir().unwrap();
        let (cache, serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "r");
        let initial = serializer.get_recency(block_id);
        assert!(initial > 0);

        {
            let txn = Transaction::new(&cache);
            let acq = Acquisition::read(&txn, block_id);
            check_value(&acq, "r");
        }
        cache.sync_flush();
        assert_eq!(serializer.get_recency(block_id), initial);

        {
            let txn = Transaction::new(&cache);
            let mut acq = Acquisition::write(&txn, block_id);
            check_and_append(&mut acq, "r", "w");
        }
        cache.sync_flush();
        assert!(serializer.get_recency(block_id) > initial);
    }

    // ==================== Cross-thread waits ====================

    #[test]
    fn read_ready_blocks_until_writer_releases() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 16);
        let block_id = create_block(&cache, "abc");

        let txn1 = Transaction::new(&cache);
        let mut writer = Acquisition::write(&txn1, block_id);

        thread::scope(|scope| {
            let cache = &cache;
            scope.spawn(move || {
                let txn2 = Transaction::new(cache);
                let reader = Acquisition::read(&txn2, block_id);
                reader.read_ready();
                check_value(&reader, "abcd");
            });

            thread::sleep(Duration::from_millis(20));
            check_and_append(&mut writer, "abc", "d");
            drop(writer);
            drop(txn1);
        });
    }

    #[test]
    fn concurrent_transactions_on_distinct_blocks() {
        let dir = tempdir().unwrap();
        let (cache, _serializer) = new_cache(dir.path(), 4);
        let ids: Vec<BlockId> = (0..8).map(|i| create_block(&cache, &format!("b{i}"))).collect();

        thread::scope(|scope| {
            for (i, block_id) in ids.iter().enumerate() {
                let cache = &cache;
                scope.spawn(move || {
                    for _ in 0..10 {
                        let txn = Transaction::new(cache);
                        let acq = Acquisition::read(&txn, *block_id);
                        let buf = acq.get_buf_read();
                        assert_eq!(&buf[..2], format!("b{i}").as_bytes());
                    }
                });
            }
        });
    }
}
