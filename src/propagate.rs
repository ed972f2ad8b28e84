//! State-change propagation across the context tree.
//!
//! Cancelling a context must become visible on every descendant, and
//! descendants live in per-thread lists scattered across the process. The
//! propagator walks all registered lists under one global mutex, marking
//! every node whose ancestor chain passes through the source. Holding the
//! lock for the whole sweep is what makes concurrent cancellations at
//! different levels of the tree compose: a later sweep always observes a
//! finished earlier one.
//!
//! The global epoch counter exists for the benefit of the *binding* path:
//! it lets a context attach to a parent without taking the propagation
//! mutex unless an epoch comparison proves a sweep may have raced with
//! the attachment (see [`crate::bind`]).
//!
//! Propagation is an explicitly cold path; the O(depth) ancestor walk per
//! node runs only during cancellation.

use crate::context::GroupContext;
use crate::registry::{ThreadRecord, ThreadRegistry};
use crate::tracing_compat::debug;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// The process-wide propagation mutex and epoch.
pub(crate) struct PropagationGate {
    /// Held for the entire duration of any state-propagation sweep.
    pub(crate) mutex: Mutex<()>,
    /// Incremented once per sweep, while the mutex is held.
    pub(crate) epoch: AtomicU64,
}

/// Lazily initialized, never torn down.
pub(crate) fn propagation_gate() -> &'static PropagationGate {
    static GATE: OnceLock<PropagationGate> = OnceLock::new();
    GATE.get_or_init(|| PropagationGate {
        mutex: Mutex::new(()),
        epoch: AtomicU64::new(0),
    })
}

/// Selects which monotonic state bit a sweep pushes.
///
/// The propagation machinery is parametric over the field so that future
/// monotonic flags cost nothing; the selector is a plain tag, not a trait
/// object, because the set of such bits is enumerable at compile time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StateBit {
    /// The cancellation request flag.
    CancelRequested,
}

impl StateBit {
    pub(crate) fn cell(self, ctx: &GroupContext) -> &AtomicU32 {
        match self {
            Self::CancelRequested => &ctx.cancel_requested,
        }
    }
}

/// Pushes `new_value` from `src` down to all descendants in all
/// registered per-thread lists.
///
/// Returns `false` when the source no longer holds exactly the value
/// being pushed: a concurrent transition owns this propagation, and the
/// caller backs down. Returns `true` after a completed sweep, or
/// immediately when `src` never had children bound under it.
pub(crate) fn propagate_group_state(src: &GroupContext, bit: StateBit, new_value: u32) -> bool {
    // SeqCst pairs with the publication fence in the bind protocol: either
    // this load observes a racing child's hint store, or that child's
    // post-publication read observes the new state at src.
    if src.may_have_children.load(Ordering::SeqCst) != 1 {
        // No context was ever bound under src; any future child inherits
        // the flag directly from src at bind time.
        return true;
    }
    let gate = propagation_gate();
    let _sweep = gate.mutex.lock();
    if bit.cell(src).load(Ordering::Relaxed) != new_value {
        return false;
    }
    gate.epoch.fetch_add(1, Ordering::SeqCst);
    debug!(
        group = src.name(),
        epoch = gate.epoch.load(Ordering::Relaxed),
        "state propagation sweep"
    );
    for record in ThreadRegistry::global().snapshot_threads() {
        sweep_thread(&record, bit, src, new_value, gate);
    }
    true
}

/// Visits one thread's list under its mutex, then syncs its local epoch
/// up to the global one.
fn sweep_thread(
    record: &ThreadRecord,
    bit: StateBit,
    src: &GroupContext,
    new_value: u32,
    gate: &PropagationGate,
) {
    // The snapshot's Arcs are released only after the list mutex is
    // dropped: if a final user drop races with this sweep, the context's
    // destructor (which takes the same mutex) must not run under it.
    let retired: Vec<Arc<GroupContext>>;
    {
        let list = record.list.lock();
        let nodes = list.snapshot();
        for ctx in &nodes {
            if bit.cell(ctx).load(Ordering::Relaxed) != new_value {
                push_down_chain(ctx, bit, src, new_value);
            }
        }
        // Release ordering keeps the stores above from drifting past the
        // sync point a binding thread validates against.
        record
            .list_epoch
            .store(gate.epoch.load(Ordering::Relaxed), Ordering::Release);
        retired = nodes;
    }
    drop(retired);
}

/// If `src` lies on `ctx`'s ancestor chain, writes `new_value` into every
/// context from `ctx` up to (and excluding) `src`.
fn push_down_chain(ctx: &Arc<GroupContext>, bit: StateBit, src: &GroupContext, new_value: u32) {
    if ptr::eq(Arc::as_ptr(ctx), src) {
        return;
    }
    let mut ancestor = ctx.parent();
    loop {
        match ancestor {
            None => return,
            Some(a) if ptr::eq(Arc::as_ptr(&a), src) => break,
            Some(a) => ancestor = a.parent(),
        }
    }
    let mut cursor = Arc::clone(ctx);
    while !ptr::eq(Arc::as_ptr(&cursor), src) {
        bit.cell(&cursor).store(new_value, Ordering::Relaxed);
        match cursor.parent() {
            Some(p) => cursor = p,
            None => break,
        }
    }
}
