//! Thread records and the global thread registry.
//!
//! Every worker thread and every external thread that submits work owns a
//! [`ThreadRecord`]: its context list, the list's propagation epoch, the
//! context currently executing on the thread, and the arena's default
//! context. The [`ThreadRegistry`] enumerates all records so a
//! cancellation sweep can reach every list; it holds weak references and
//! never keeps a retired thread alive.
//!
//! The registry is process-wide and initialized lazily; it is never torn
//! down.

use crate::context::GroupContext;
use crate::list::ContextList;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock, Weak};

/// Whether a record belongs to an arena worker or an external thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// An arena worker thread.
    Worker,
    /// An external thread that submits work.
    External,
}

/// Per-thread state the cancellation core hangs off a thread.
pub struct ThreadRecord {
    /// Contexts bound on this thread. Guarded by its own mutex; the epoch
    /// lives outside so the bind protocol can read it without the lock.
    pub(crate) list: Mutex<ContextList>,
    /// Local copy of the global propagation epoch, synced at the end of
    /// every sweep visit (release) and read speculatively during binding
    /// (acquire).
    pub(crate) list_epoch: AtomicU64,
    /// The context currently executing on this thread. Non-owning: the
    /// dispatcher keeps the executing context alive for the duration.
    current: Mutex<Option<Weak<GroupContext>>>,
    arena_default: Arc<GroupContext>,
    kind: ThreadKind,
}

impl ThreadRecord {
    fn new(kind: ThreadKind, arena_default: Arc<GroupContext>) -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(ContextList::new()),
            list_epoch: AtomicU64::new(0),
            current: Mutex::new(None),
            arena_default,
            kind,
        })
    }

    /// Returns whether this is a worker or an external thread.
    #[must_use]
    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// The sentinel context for this thread's arena root.
    #[must_use]
    pub fn arena_default(&self) -> &Arc<GroupContext> {
        &self.arena_default
    }

    /// The context currently executing on this thread, falling back to
    /// the arena default when nothing is entered.
    #[must_use]
    pub fn current_context(&self) -> Arc<GroupContext> {
        self.current
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| Arc::clone(&self.arena_default))
    }

    /// Marks `ctx` as the executing context until the guard drops.
    pub fn enter<'a>(&'a self, ctx: &Arc<GroupContext>) -> ExecutionGuard<'a> {
        let prev = self.current.lock().replace(Arc::downgrade(ctx));
        ExecutionGuard { record: self, prev }
    }

    /// The contexts currently bound on this thread, head first.
    #[must_use]
    pub fn bound_contexts(&self) -> Vec<Arc<GroupContext>> {
        self.list.lock().snapshot()
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("kind", &self.kind)
            .field("bound", &self.list.lock().len())
            .finish_non_exhaustive()
    }
}

/// Restores the previously executing context when dropped.
pub struct ExecutionGuard<'a> {
    record: &'a ThreadRecord,
    prev: Option<Weak<GroupContext>>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        *self.record.current.lock() = self.prev.take();
    }
}

/// Global enumeration of all threads holding context lists.
pub struct ThreadRegistry {
    workers: Mutex<Vec<Weak<ThreadRecord>>>,
    externals: Mutex<Vec<Weak<ThreadRecord>>>,
}

impl ThreadRegistry {
    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static ThreadRegistry {
        static REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| ThreadRegistry {
            workers: Mutex::new(Vec::new()),
            externals: Mutex::new(Vec::new()),
        })
    }

    /// Registers a worker thread rooted at `arena_default`.
    #[must_use]
    pub fn register_worker(&self, arena_default: &Arc<GroupContext>) -> Arc<ThreadRecord> {
        let record = ThreadRecord::new(ThreadKind::Worker, Arc::clone(arena_default));
        Self::push(&self.workers, &record);
        record
    }

    /// Registers an external thread rooted at `arena_default`.
    #[must_use]
    pub fn register_external(&self, arena_default: &Arc<GroupContext>) -> Arc<ThreadRecord> {
        let record = ThreadRecord::new(ThreadKind::External, Arc::clone(arena_default));
        Self::push(&self.externals, &record);
        record
    }

    fn push(bucket: &Mutex<Vec<Weak<ThreadRecord>>>, record: &Arc<ThreadRecord>) {
        let mut slots = bucket.lock();
        slots.retain(|w| w.strong_count() != 0);
        slots.push(Arc::downgrade(record));
    }

    /// Calls `f` for every live record, workers first, then externals.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Arc<ThreadRecord>)) {
        for record in self.snapshot_threads() {
            f(&record);
        }
    }

    /// Collects the live records, workers first. The bucket locks are not
    /// held while the caller works through the result.
    pub(crate) fn snapshot_threads(&self) -> Vec<Arc<ThreadRecord>> {
        let mut out: Vec<Arc<ThreadRecord>> =
            self.workers.lock().iter().filter_map(Weak::upgrade).collect();
        out.extend(self.externals.lock().iter().filter_map(Weak::upgrade));
        out
    }
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// Associates `record` with the calling OS thread.
pub fn attach_current_thread(record: &Arc<ThreadRecord>) {
    CURRENT_THREAD.with(|slot| *slot.borrow_mut() = Some(Arc::clone(record)));
}

/// Clears the calling thread's record association.
pub fn detach_current_thread() {
    CURRENT_THREAD.with(|slot| *slot.borrow_mut() = None);
}

/// The record attached to the calling OS thread, if any.
#[must_use]
pub fn current_thread_record() -> Option<Arc<ThreadRecord>> {
    CURRENT_THREAD.with(|slot| slot.borrow().clone())
}
