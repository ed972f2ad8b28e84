//! Per-thread context list storage.
//!
//! The logical context tree is split into pieces, one per thread: a
//! context bound on a thread is linked into that thread's list, and only
//! cancellation sweeps ever touch a list cross-thread. The list is a
//! sentinel-headed doubly-linked list laid out as a slab so that splice
//! and unlink stay O(1) without raw pointers; each bound context remembers
//! its slot index. Slot 0 is the sentinel and is never allocated.
//!
//! All mutation and traversal happens under the owning
//! [`ThreadRecord`](crate::registry::ThreadRecord)'s list mutex. The list
//! holds only weak back-references; it never owns its members.

use crate::context::GroupContext;
use std::sync::{Arc, Weak};

/// Slot index meaning "not linked into any list".
pub(crate) const NIL_SLOT: usize = usize::MAX;

const SENTINEL: usize = 0;

struct Slot {
    prev: usize,
    next: usize,
    ctx: Option<Weak<GroupContext>>,
}

/// Doubly-linked list of the contexts bound on one thread.
pub(crate) struct ContextList {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl ContextList {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![Slot {
                prev: SENTINEL,
                next: SENTINEL,
                ctx: None,
            }],
            free: Vec::new(),
        }
    }

    /// Splices a context in immediately after the sentinel and returns its
    /// slot index. State propagation assumes new contexts land at the head.
    pub(crate) fn insert_head(&mut self, ctx: Weak<GroupContext>) -> usize {
        let head_next = self.slots[SENTINEL].next;
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Slot {
                    prev: SENTINEL,
                    next: head_next,
                    ctx: Some(ctx),
                };
                idx
            }
            None => {
                self.slots.push(Slot {
                    prev: SENTINEL,
                    next: head_next,
                    ctx: Some(ctx),
                });
                self.slots.len() - 1
            }
        };
        self.slots[head_next].prev = idx;
        self.slots[SENTINEL].next = idx;
        idx
    }

    /// Unlinks the node at `idx` and recycles its slot.
    pub(crate) fn remove(&mut self, idx: usize) {
        debug_assert_ne!(idx, SENTINEL);
        debug_assert_ne!(idx, NIL_SLOT);
        let (prev, next) = {
            let slot = &self.slots[idx];
            debug_assert!(slot.ctx.is_some(), "removing an unlinked slot");
            (slot.prev, slot.next)
        };
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        self.slots[idx] = Slot {
            prev: NIL_SLOT,
            next: NIL_SLOT,
            ctx: None,
        };
        self.free.push(idx);
    }

    /// Collects the live contexts in list order (head first).
    ///
    /// Callers hold the list mutex for the duration; the returned `Arc`s
    /// must be released only after that mutex is dropped so a racing final
    /// drop of a member never re-enters the lock from this thread.
    pub(crate) fn snapshot(&self) -> Vec<Arc<GroupContext>> {
        let mut out = Vec::new();
        let mut cursor = self.slots[SENTINEL].next;
        while cursor != SENTINEL {
            let slot = &self.slots[cursor];
            if let Some(ctx) = slot.ctx.as_ref().and_then(Weak::upgrade) {
                out.push(ctx);
            }
            cursor = slot.next;
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.slots[SENTINEL].next;
        while cursor != SENTINEL {
            n += 1;
            cursor = self.slots[cursor].next;
        }
        n
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots[SENTINEL].next == SENTINEL
    }
}
