//! Lazy binding of contexts into the tree.
//!
//! A context is not attached to the tree when it is constructed; the
//! attachment happens on first scheduling use, on whichever thread that
//! turns out to be. Binding publishes the context into that thread's list
//! while a cancellation sweep may be running anywhere in the process, and
//! it must do so without taking the propagation mutex in the common case.
//!
//! The trick is speculation validated by epochs. The binder snapshots the
//! parent owner's local epoch, copies the parent's cancel flag, publishes
//! itself (the list insertion ends in a full fence), and then compares
//! the snapshot against the global epoch. Equal epochs prove the parent's
//! state was stable across the publication point, so the speculative copy
//! stands. Unequal epochs mean a sweep ran somewhere in between; the
//! binder re-reads the parent under the propagation mutex, after any
//! in-flight sweep has finished. Either way the sweep sees the new node,
//! or the node sees the swept state.

use crate::context::{GroupContext, LifetimeState};
use crate::propagate::propagation_gate;
use crate::registry::ThreadRecord;
use crate::tracing_compat::trace;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

impl GroupContext {
    /// Attaches this context to the tree if it has not been attached yet.
    ///
    /// Runs the lifecycle state machine: `Created` contexts are locked by
    /// exactly one caller and finished as `Bound` (under the current
    /// execution context of `record`) or `Isolated` (at the arena root,
    /// or when the context opted out of inheritance). Callers that lose
    /// the lock spin until the winner finishes; the wait is bounded by
    /// the winner's bind protocol, which takes no nested waits.
    pub fn bind_on_first_use(self: &Arc<Self>, record: &Arc<ThreadRecord>) {
        let state = self.lifetime.load(Ordering::Acquire);
        if state <= LifetimeState::Locked as u8 {
            if state == LifetimeState::Created as u8
                && self
                    .lifetime
                    .compare_exchange(
                        LifetimeState::Created as u8,
                        LifetimeState::Locked as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                let parent = record.current_context();
                if Arc::ptr_eq(&parent, record.arena_default()) || !self.traits.bound {
                    // Nothing to bind to at the arena root, and opted-out
                    // contexts never inherit: finalize as isolated.
                    if !self.fp_captured.load(Ordering::Relaxed) {
                        self.copy_fp_from(record.arena_default());
                    }
                    trace!(group = self.name, "context isolated");
                    self.lifetime
                        .store(LifetimeState::Isolated as u8, Ordering::Release);
                } else {
                    self.bind_to(record, &parent);
                }
            }
            while self.lifetime.load(Ordering::Acquire) == LifetimeState::Locked as u8 {
                std::hint::spin_loop();
            }
        }
        debug_assert_ne!(
            self.lifetime.load(Ordering::Relaxed),
            LifetimeState::Created as u8
        );
        debug_assert_ne!(
            self.lifetime.load(Ordering::Relaxed),
            LifetimeState::Locked as u8
        );
    }

    /// The bind protocol. State is `Locked`; the caller holds no locks.
    fn bind_to(self: &Arc<Self>, record: &Arc<ThreadRecord>, parent: &Arc<GroupContext>) {
        debug_assert_eq!(
            self.lifetime.load(Ordering::Relaxed),
            LifetimeState::Locked as u8,
            "the context can be bound only under the lock"
        );
        debug_assert!(
            self.parent.get().is_none(),
            "parent is set before initial binding"
        );

        let _linked = self.parent.set(Arc::clone(parent));
        debug_assert!(_linked.is_ok());

        // Inherit FP settings only if this context has not captured its own.
        if !self.fp_captured.load(Ordering::Relaxed) {
            self.copy_fp_from(parent);
        }

        // The condition avoids thrashing the parent's cache line; the
        // store is made visible by the fence inside register_with.
        if parent.may_have_children.load(Ordering::Relaxed) != 1 {
            parent.may_have_children.store(1, Ordering::Relaxed);
        }

        trace!(group = self.name, parent = parent.name, "binding context");

        match (parent.parent.get(), parent.owner.get()) {
            (Some(_), Some(parent_owner)) => {
                // A grand-ancestor exists, so a propagation originating
                // above the parent could be sweeping right now and might
                // have passed the parent's list before this node appears
                // in its own. Speculate, publish, then validate.
                //
                // Acquire keeps the speculative parent reads below from
                // floating above the point the epoch comparison can
                // vouch for.
                let epoch_snapshot = parent_owner.list_epoch.load(Ordering::Acquire);
                self.cancel_requested.store(
                    parent.cancel_requested.load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
                self.register_with(record);
                let gate = propagation_gate();
                if epoch_snapshot != gate.epoch.load(Ordering::Relaxed) {
                    // A sweep may be propagating right now; re-read the
                    // parent once it has finished.
                    let _sync = gate.mutex.lock();
                    self.cancel_requested.store(
                        parent.cancel_requested.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                }
            }
            (grandparent, _) => {
                debug_assert!(
                    grandparent.is_none(),
                    "a bound parent always has an owner record"
                );
                self.register_with(record);
                // Without grand-ancestors a concurrent propagation can
                // only originate at the parent itself, so a direct copy
                // after publication cannot miss an update.
                self.cancel_requested.store(
                    parent.cancel_requested.load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
            }
        }

        self.lifetime
            .store(LifetimeState::Bound as u8, Ordering::Release);
    }

    /// Makes this context reachable from `record`'s list.
    fn register_with(self: &Arc<Self>, record: &Arc<ThreadRecord>) {
        let _owned = self.owner.set(Arc::clone(record));
        debug_assert!(_owned.is_ok());
        {
            let mut list = record.list.lock();
            let slot = list.insert_head(Arc::downgrade(self));
            self.list_slot.store(slot, Ordering::Relaxed);
        }
        // Publication point: a sweep that bumped the global epoch before
        // this fence either sees the node in the list, or left the epoch
        // ahead of the snapshot taken before publication.
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTraits;
    use crate::registry::ThreadRegistry;

    fn worker() -> Arc<ThreadRecord> {
        ThreadRegistry::global().register_worker(&GroupContext::new_arena_default())
    }

    fn external() -> Arc<ThreadRecord> {
        ThreadRegistry::global().register_external(&GroupContext::new_arena_default())
    }

    #[test]
    fn first_use_at_arena_root_isolates() {
        let record = external();
        let ctx = GroupContext::new(ContextTraits::bound());
        ctx.bind_on_first_use(&record);

        assert_eq!(ctx.lifetime_state(), LifetimeState::Isolated);
        assert!(ctx.parent().is_none());
        assert!(record.bound_contexts().is_empty());
        assert_eq!(ctx.fp_env().bits(), record.arena_default().fp_env().bits());
        assert!(ctx.has_fp_settings());
    }

    #[test]
    fn unbound_trait_isolates_even_under_a_parent() {
        let record = worker();
        let parent = GroupContext::new(ContextTraits::bound());
        parent.bind_on_first_use(&record);

        let _in = record.enter(&parent);
        let ctx = GroupContext::new(ContextTraits::isolated());
        ctx.bind_on_first_use(&record);

        assert_eq!(ctx.lifetime_state(), LifetimeState::Isolated);
        assert!(ctx.parent().is_none());
    }

    #[test]
    fn child_binds_under_current_context() {
        let record = worker();
        let parent = GroupContext::new(ContextTraits::bound());
        parent.bind_on_first_use(&record);
        assert_eq!(parent.lifetime_state(), LifetimeState::Isolated);

        let _in = record.enter(&parent);
        let child = GroupContext::new(ContextTraits::bound());
        child.bind_on_first_use(&record);

        assert_eq!(child.lifetime_state(), LifetimeState::Bound);
        let bound_parent = child.parent().expect("child has a parent");
        assert!(Arc::ptr_eq(&bound_parent, &parent));
        assert!(parent.may_have_children());
        let list = record.bound_contexts();
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list[0], &child));
    }

    #[test]
    fn binding_is_idempotent() {
        let record = worker();
        let parent = GroupContext::new(ContextTraits::bound());
        parent.bind_on_first_use(&record);
        let _in = record.enter(&parent);
        let child = GroupContext::new(ContextTraits::bound());
        child.bind_on_first_use(&record);
        child.bind_on_first_use(&record);

        assert_eq!(record.bound_contexts().len(), 1);
        assert_eq!(child.lifetime_state(), LifetimeState::Bound);
    }

    #[test]
    fn cancelled_parent_marks_child_at_bind() {
        let record = worker();
        let parent = GroupContext::new(ContextTraits::bound());
        parent.bind_on_first_use(&record);
        assert!(parent.cancel_group_execution());

        let _in = record.enter(&parent);
        let child = GroupContext::new(ContextTraits::bound());
        child.bind_on_first_use(&record);

        assert!(child.is_cancelled());
    }

    #[test]
    fn grandchild_takes_the_epoch_validated_path() {
        let record = worker();
        let root = GroupContext::new(ContextTraits::bound());
        root.bind_on_first_use(&record);

        let mid = GroupContext::new(ContextTraits::bound());
        {
            let _in = record.enter(&root);
            mid.bind_on_first_use(&record);
        }

        let leaf = GroupContext::new(ContextTraits::bound());
        {
            let _in = record.enter(&mid);
            leaf.bind_on_first_use(&record);
        }

        assert_eq!(leaf.lifetime_state(), LifetimeState::Bound);
        assert!(Arc::ptr_eq(&leaf.parent().expect("bound"), &mid));
        // head-of-list order: newest bound context first
        let list = record.bound_contexts();
        assert!(Arc::ptr_eq(&list[0], &leaf));
        assert!(Arc::ptr_eq(&list[1], &mid));
    }

    #[test]
    fn child_inherits_fp_snapshot_from_parent() {
        let record = worker();
        let parent = GroupContext::new(ContextTraits::bound().with_fp_capture());
        parent.bind_on_first_use(&record);

        let _in = record.enter(&parent);
        let child = GroupContext::new(ContextTraits::bound());
        child.bind_on_first_use(&record);

        assert!(child.has_fp_settings());
        assert_eq!(child.fp_env().bits(), parent.fp_env().bits());
    }
}
