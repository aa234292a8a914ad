//! Page module — in-memory state of a single cached block: its buffer, load
//! state machine, pin and snapshot accounting, and the buffer guards handed
//! to acquisition holders.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::serializer::{BlockId, BlockToken};

/// Eviction priority given to every page. The random evictor compares
/// priorities among its samples; with a single value the comparison
/// degenerates to uniform random choice.
pub(crate) const DEFAULT_EVICTION_PRIORITY: u64 = 100;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// One-shot readiness signal: transitions false→true exactly once; any number
/// of threads may wait on it before or after the transition.
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Signal> {
        Arc::new(Signal {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn fire(&self) {
        let mut fired = self.fired.lock();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// Block-sized buffer slot. Empty while the page is unloaded.
pub(crate) struct PageBuf {
    data: Option<Box<[u8]>>,
}

impl PageBuf {
    fn bytes(&self) -> &[u8] {
        self.data.as_deref().expect("page buffer is not resident")
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("page buffer is not resident")
    }
}

/// Progress of the demand-load of a page's buffer. At most one load is ever
/// started per page; latecomers wait on the in-flight signal.
pub(crate) enum LoadState {
    NotStarted,
    InFlight(Arc<Signal>),
    Resident,
}

/// In-memory representation of one block.
///
/// All fields are mutated under the cache core lock; only the buffer itself
/// sits behind its own [`RwLock`] so that buffer guards held by callers do
/// not block the core.
pub(crate) struct Page {
    pub(crate) block_id: BlockId,
    pub(crate) buf: Arc<RwLock<PageBuf>>,
    pub(crate) load: LoadState,
    /// Serializer token backing clean content. Absent for never-committed
    /// pages and for forked snapshots of uncommitted content.
    pub(crate) token: Option<BlockToken>,
    /// Content differs from the token's on-disk image.
    pub(crate) dirty: bool,
    /// Bumped on every write-acquisition release; lets the flusher tell
    /// whether a flushed image is still this page's current content.
    pub(crate) version: u64,
    /// Live acquisitions (granted or snapshotted) holding this page.
    pub(crate) pin_count: u32,
    /// Snapshot acquisitions observing exactly this content.
    pub(crate) snapshot_refs: u32,
    /// Forked read-only copy preserved for displaced readers. Snapshots are
    /// never eviction candidates and die with their last holder.
    pub(crate) is_snapshot: bool,
    /// The owning transaction deleted this block; the page is detached from
    /// its slot and lingers only for holders still pinning it.
    pub(crate) deleted: bool,
    pub(crate) eviction_priority: u64,
    /// Self-stored position in the evictor array, for O(1) removal.
    pub(crate) repl_index: Option<usize>,
}

impl Page {
    /// Page for a committed block; the buffer loads on demand through `token`.
    pub(crate) fn unloaded(block_id: BlockId, token: BlockToken) -> Page {
        Page {
            block_id,
            buf: Arc::new(RwLock::new(PageBuf { data: None })),
            load: LoadState::NotStarted,
            token: Some(token),
            dirty: false,
            version: 0,
            pin_count: 0,
            snapshot_refs: 0,
            is_snapshot: false,
            deleted: false,
            eviction_priority: DEFAULT_EVICTION_PRIORITY,
            repl_index: None,
        }
    }

    /// Freshly created page: born resident, zero-filled and dirty.
    pub(crate) fn created(block_id: BlockId, buf: Box<[u8]>) -> Page {
        Page {
            block_id,
            buf: Arc::new(RwLock::new(PageBuf { data: Some(buf) })),
            load: LoadState::Resident,
            token: None,
            dirty: true,
            version: 0,
            pin_count: 0,
            snapshot_refs: 0,
            is_snapshot: false,
            deleted: false,
            eviction_priority: DEFAULT_EVICTION_PRIORITY,
            repl_index: None,
        }
    }

    /// Read-only fork preserving this page's current content for snapshot
    /// holders. Resident content is cloned; unloaded content is shared
    /// through the clean token and reloads independently.
    pub(crate) fn fork_snapshot(&self) -> Page {
        let data = self.buf.read().data.clone();
        let load = if data.is_some() {
            LoadState::Resident
        } else {
            assert!(
                self.token.is_some(),
                "cannot fork a page that is neither resident nor backed by a token"
            );
            LoadState::NotStarted
        };
        Page {
            block_id: self.block_id,
            buf: Arc::new(RwLock::new(PageBuf { data })),
            load,
            token: self.token.clone(),
            dirty: false,
            version: 0,
            pin_count: 0,
            snapshot_refs: 0,
            is_snapshot: true,
            deleted: false,
            eviction_priority: DEFAULT_EVICTION_PRIORITY,
            repl_index: None,
        }
    }

    pub(crate) fn is_resident(&self) -> bool {
        matches!(self.load, LoadState::Resident)
    }

    /// Installs a loaded buffer, completing an in-flight load.
    pub(crate) fn install_buf(&mut self, data: Box<[u8]>) {
        let fired = match &self.load {
            LoadState::InFlight(signal) => signal.clone(),
            _ => panic!("install_buf without an in-flight load"),
        };
        self.buf.write().data = Some(data);
        self.load = LoadState::Resident;
        fired.fire();
    }

    /// Clones the resident content, for flush capture and snapshot forks.
    pub(crate) fn clone_content(&self) -> Box<[u8]> {
        self.buf
            .read()
            .data
            .clone()
            .expect("cannot clone content of a non-resident page")
    }
}

impl crate::evictor::Evictable for Page {
    fn safe_to_unload(&self) -> bool {
        self.pin_count == 0
            && !self.dirty
            && !self.deleted
            && !self.is_snapshot
            && self.token.is_some()
            && self.is_resident()
    }

    fn eviction_priority(&self) -> u64 {
        self.eviction_priority
    }

    fn unload(&mut self) {
        debug_assert!(self.safe_to_unload());
        self.buf.write().data = None;
        self.load = LoadState::NotStarted;
    }

    fn repl_index(&self) -> Option<usize> {
        self.repl_index
    }

    fn set_repl_index(&mut self, index: Option<usize>) {
        self.repl_index = index;
    }
}

// ---------------------------------------------------------------------------
// Buffer guards
// ---------------------------------------------------------------------------

/// Shared view of a granted page's content. The lifetime ties the guard to
/// the acquisition it came from, so a view cannot outlive its pin.
pub struct BufRead<'a> {
    /// The content of the page wrapped in a guard.
    guard: RwLockReadGuard<'static, PageBuf>,
    /// This field should not be exposed. It's here because `guard` cannot
    /// outlive it.
    buf: Arc<RwLock<PageBuf>>,
    _owner: PhantomData<&'a ()>,
}

impl BufRead<'_> {
    pub(crate) fn new(buf: Arc<RwLock<PageBuf>>) -> BufRead<'static> {
        let guard_local = buf.read();
        // SAFETY: we transmute the guard's lifetime to 'static. This is safe
        // because `buf` (Arc<RwLock<PageBuf>>) is owned by the BufRead, which
        // ensures the underlying RwLock lives at least as long as the guard.
        // `guard` is declared before `buf` so it drops first.
        let guard: RwLockReadGuard<'static, PageBuf> = unsafe {
            std::mem::transmute::<RwLockReadGuard<'_, PageBuf>, RwLockReadGuard<'static, PageBuf>>(
                guard_local,
            )
        };
        BufRead {
            guard,
            buf,
            _owner: PhantomData,
        }
    }
}

impl Deref for BufRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.bytes()
    }
}

/// Exclusive view of a write-granted page's content.
pub struct BufWrite<'a> {
    /// The content of the page wrapped in a guard.
    guard: RwLockWriteGuard<'static, PageBuf>,
    /// This field should not be exposed. It's here because `guard` cannot
    /// outlive it.
    buf: Arc<RwLock<PageBuf>>,
    _owner: PhantomData<&'a ()>,
}

impl BufWrite<'_> {
    pub(crate) fn new(buf: Arc<RwLock<PageBuf>>) -> BufWrite<'static> {
        let guard_local = buf.write();
        // SAFETY: same field-ordering argument as in [`BufRead::new`].
        let guard: RwLockWriteGuard<'static, PageBuf> = unsafe {
            std::mem::transmute::<RwLockWriteGuard<'_, PageBuf>, RwLockWriteGuard<'static, PageBuf>>(
                guard_local,
            )
        };
        BufWrite {
            guard,
            buf,
            _owner: PhantomData,
        }
    }
}

impl Deref for BufWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.bytes()
    }
}

impl DerefMut for BufWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.bytes_mut()
    }
}
