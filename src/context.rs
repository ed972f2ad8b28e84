//! Task-group context nodes.
//!
//! A [`GroupContext`] is the per-task-group record: cancellation state,
//! the first caught failure, floating-point settings, and the links that
//! place it in the logical context tree. Contexts form a tree through
//! parent references only; the physical storage is the owner thread's
//! context list (see [`crate::list`]).
//!
//! The premise of the whole design is that cancellation is not on the hot
//! path. A context that is never cancelled costs its thread no global
//! synchronization: creation is local, binding takes only the owner
//! thread's list mutex, and `is_cancelled` is a relaxed load. All
//! cross-thread coordination is concentrated in the cancellation sweep
//! ([`crate::propagate`]).

use crate::failure::CaughtPanic;
use crate::fpenv::FpEnv;
use crate::list::NIL_SLOT;
use crate::propagate::{propagate_group_state, StateBit};
use crate::registry::ThreadRecord;
use crate::tracing_compat::debug;
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Where a context is in its life.
///
/// A context is `Created` until its first scheduling use, at which point
/// the lifecycle controller CASes it to `Locked` and finishes the
/// transition to either `Bound` (attached to a parent, linked into the
/// owner thread's list) or `Isolated` (no parent, in no list). `Dead` is
/// the poisoned terminal state written during destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifetimeState {
    /// Constructed, not yet used by the scheduler.
    Created = 0,
    /// One thread is running the bind protocol; others spin.
    Locked = 1,
    /// Attached to a parent and linked into the owner's list.
    Bound = 2,
    /// Finalized without a parent; in no list.
    Isolated = 3,
    /// Destroyed.
    Dead = 4,
}

impl LifetimeState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Locked,
            2 => Self::Bound,
            3 => Self::Isolated,
            _ => Self::Dead,
        }
    }
}

/// Immutable creation flags for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextTraits {
    /// Whether the context may inherit from the current execution context
    /// at bind time. When false the context is finalized as isolated.
    pub bound: bool,
    /// Whether the context captures the floating-point environment at
    /// creation instead of inheriting it from the parent.
    pub fp_settings: bool,
}

impl ContextTraits {
    /// A context that binds under the current execution context.
    #[must_use]
    pub const fn bound() -> Self {
        Self {
            bound: true,
            fp_settings: false,
        }
    }

    /// A context that never inherits from a parent.
    #[must_use]
    pub const fn isolated() -> Self {
        Self {
            bound: false,
            fp_settings: false,
        }
    }

    /// Additionally capture the FP environment at creation.
    #[must_use]
    pub const fn with_fp_capture(mut self) -> Self {
        self.fp_settings = true;
        self
    }
}

/// One task-group context.
///
/// User code holds the `Arc`; the owner thread's list keeps only a weak
/// back-reference, and children keep strong references to their parents,
/// so an ancestor can never be destroyed out from under a live descendant.
pub struct GroupContext {
    pub(crate) name: &'static str,
    pub(crate) traits: ContextTraits,
    pub(crate) lifetime: AtomicU8,
    pub(crate) cancel_requested: AtomicU32,
    pub(crate) may_have_children: AtomicU32,
    /// Immutable after binding; `None` for isolated contexts.
    pub(crate) parent: OnceLock<Arc<GroupContext>>,
    /// The thread whose list this context lives in; written once at bind.
    pub(crate) owner: OnceLock<Arc<ThreadRecord>>,
    /// Slot in the owner list's slab; mutated only under that list's mutex.
    pub(crate) list_slot: AtomicUsize,
    /// First caught failure, if any.
    pub(crate) failure: Mutex<Option<CaughtPanic>>,
    pub(crate) fp_env: FpEnv,
    /// Set at creation for `fp_settings` contexts, at inheritance during
    /// bind, or by `capture_fp_settings`.
    pub(crate) fp_captured: AtomicBool,
}

impl GroupContext {
    /// Creates a fresh context in the `Created` state.
    #[must_use]
    pub fn new(traits: ContextTraits) -> Arc<Self> {
        Self::named("task_group", traits)
    }

    /// Creates a fresh context with a debug label for tracing.
    #[must_use]
    pub fn named(name: &'static str, traits: ContextTraits) -> Arc<Self> {
        let ctx = Arc::new(Self {
            name,
            traits,
            lifetime: AtomicU8::new(LifetimeState::Created as u8),
            cancel_requested: AtomicU32::new(0),
            may_have_children: AtomicU32::new(0),
            parent: OnceLock::new(),
            owner: OnceLock::new(),
            list_slot: AtomicUsize::new(NIL_SLOT),
            failure: Mutex::new(None),
            fp_env: FpEnv::unset(),
            fp_captured: AtomicBool::new(false),
        });
        if traits.fp_settings {
            ctx.fp_env.capture();
            ctx.fp_captured.store(true, Ordering::Relaxed);
        }
        ctx
    }

    /// Creates the sentinel context for an arena root.
    ///
    /// The default context is isolated from birth and always carries
    /// captured FP settings, so contexts created by external threads at
    /// the arena root have something to inherit from.
    #[must_use]
    pub fn new_arena_default() -> Arc<Self> {
        let ctx = Self::named("arena_default", ContextTraits::isolated().with_fp_capture());
        ctx.lifetime
            .store(LifetimeState::Isolated as u8, Ordering::Release);
        ctx
    }

    /// Returns the debug label.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the creation flags.
    #[must_use]
    pub fn traits(&self) -> ContextTraits {
        self.traits
    }

    /// Returns the current lifetime state.
    #[must_use]
    pub fn lifetime_state(&self) -> LifetimeState {
        LifetimeState::from_u8(self.lifetime.load(Ordering::Acquire))
    }

    /// Returns the parent, or `None` before binding and for isolated
    /// contexts.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<GroupContext>> {
        self.parent.get().cloned()
    }

    /// Returns the thread record whose list holds this context.
    #[must_use]
    pub fn owner(&self) -> Option<Arc<ThreadRecord>> {
        self.owner.get().cloned()
    }

    /// Whether any child has ever bound under this context.
    #[must_use]
    pub fn may_have_children(&self) -> bool {
        self.may_have_children.load(Ordering::Relaxed) == 1
    }

    /// Whether cancellation has been requested for this group.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed) != 0
    }

    /// Requests cancellation of this group and all its descendants.
    ///
    /// Returns `true` iff this call performed the 0→1 transition. The
    /// transition is monotonic: a cancelled context stays cancelled until
    /// [`reset`](Self::reset). Descendants bound at the time of the call
    /// observe the flag once the propagation sweep completes; descendants
    /// whose binding races with the call inherit it through the bind
    /// protocol's epoch check.
    pub fn cancel_group_execution(&self) -> bool {
        debug_assert!(self.cancel_requested.load(Ordering::Relaxed) <= 1);
        if self.cancel_requested.load(Ordering::Relaxed) != 0
            || self.cancel_requested.swap(1, Ordering::SeqCst) != 0
        {
            // Already cancelled. A newly added descendant inherits the
            // parent's flag at bind, so nothing can miss the request, and
            // a context cannot be uncancelled.
            return false;
        }
        debug!(group = self.name, "cancelling task group");
        // The transition here is already durable; the propagator's
        // "back down" return only matters for callers that lost the race,
        // which the exchange above has ruled out.
        let _ = propagate_group_state(self, StateBit::CancelRequested, 1);
        true
    }

    /// Clears the cancel flag and the failure slot for single-threaded
    /// reuse of the context.
    ///
    /// The caller guarantees the context has no descendants and is not
    /// accessed concurrently; there is deliberately no runtime guard.
    pub fn reset(&self) {
        debug_assert!(self.lifetime.load(Ordering::Relaxed) != LifetimeState::Dead as u8);
        *self.failure.lock() = None;
        self.cancel_requested.store(0, Ordering::Relaxed);
    }

    /// Captures the current hardware FP environment into this context.
    ///
    /// Same quiescence precondition as [`reset`](Self::reset).
    pub fn capture_fp_settings(&self) {
        debug_assert!(self.lifetime.load(Ordering::Relaxed) != LifetimeState::Dead as u8);
        self.fp_env.capture();
        self.fp_captured.store(true, Ordering::Relaxed);
    }

    /// Duplicates `src`'s FP snapshot into this context.
    pub fn copy_fp_from(&self, src: &GroupContext) {
        debug_assert!(
            src.fp_captured.load(Ordering::Relaxed),
            "source context has no captured FP settings"
        );
        self.fp_env.copy_from(&src.fp_env);
        self.fp_captured.store(true, Ordering::Relaxed);
    }

    /// Whether this context carries a captured FP snapshot.
    #[must_use]
    pub fn has_fp_settings(&self) -> bool {
        self.fp_captured.load(Ordering::Relaxed)
    }

    /// Returns the embedded FP snapshot.
    #[must_use]
    pub fn fp_env(&self) -> &FpEnv {
        &self.fp_env
    }

    /// Stores a caught failure if the slot is empty. Returns `true` iff
    /// this failure was recorded; the first one wins.
    pub fn record_failure(&self, failure: CaughtPanic) -> bool {
        let mut slot = self.failure.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(failure);
        true
    }

    /// Removes and returns the recorded failure, if any.
    #[must_use]
    pub fn take_failure(&self) -> Option<CaughtPanic> {
        self.failure.lock().take()
    }

    /// Whether a failure has been recorded.
    #[must_use]
    pub fn has_failure(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Records a panic payload from a failed task and cancels the group.
    ///
    /// Returns `true` iff this call performed the cancel transition.
    pub fn report_failure(&self, payload: Box<dyn Any + Send + 'static>) -> bool {
        let _ = self.record_failure(CaughtPanic::from_payload(payload));
        self.cancel_group_execution()
    }
}

impl fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupContext")
            .field("name", &self.name)
            .field("state", &self.lifetime_state())
            .field("cancelled", &self.is_cancelled())
            .field("may_have_children", &self.may_have_children())
            .finish_non_exhaustive()
    }
}

impl Drop for GroupContext {
    fn drop(&mut self) {
        let state = self.lifetime.load(Ordering::Relaxed);
        debug_assert_ne!(
            state,
            LifetimeState::Locked as u8,
            "context destroyed while another thread is binding it"
        );
        if state == LifetimeState::Bound as u8 {
            if let Some(owner) = self.owner.get() {
                let slot = self.list_slot.load(Ordering::Relaxed);
                owner.list.lock().remove(slot);
                self.list_slot.store(NIL_SLOT, Ordering::Relaxed);
            }
        }
        self.lifetime
            .store(LifetimeState::Dead as u8, Ordering::Relaxed);
    }
}
