//! Captured task failures.
//!
//! A task group transports at most one failure from worker code back to
//! whoever waits on the group. The first failure wins; later ones are
//! dropped because the group is already being torn down by cancellation.
//!
//! [`catch_group_failure`] is the task-boundary entry point: it runs a
//! closure under `catch_unwind`, and on panic stores the payload into the
//! context's failure slot and requests cancellation of the whole group.

use crate::context::GroupContext;
use crate::tracing_compat::debug;
use core::fmt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// A panic payload caught at a task boundary.
///
/// Wraps the raw `Box<dyn Any + Send>` from `catch_unwind` so it can be
/// stored in a context and re-raised later on the waiting thread. A
/// best-effort message is extracted up front for diagnostics, since the
/// payload itself is opaque.
pub struct CaughtPanic {
    payload: Box<dyn Any + Send + 'static>,
    message: String,
}

impl CaughtPanic {
    /// Wraps a payload caught by `catch_unwind`.
    #[must_use]
    pub fn from_payload(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("task panicked")
        };
        Self { payload, message }
    }

    /// Returns the extracted panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-raises the captured failure on the calling thread.
    pub fn rethrow(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for CaughtPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaughtPanic")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CaughtPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// Runs `f`, trapping any panic at this task boundary.
///
/// On panic the payload is stored into `ctx`'s failure slot (first one
/// wins) and cancellation of the group is requested; the original failure
/// is still signalled through that cancellation even when the slot was
/// already taken. Returns `None` when `f` panicked.
pub fn catch_group_failure<R>(ctx: &GroupContext, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            debug!(group = ctx.name(), "task failure caught at group boundary");
            let _ = ctx.report_failure(payload);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTraits;

    #[test]
    fn message_from_str_payload() {
        let caught = CaughtPanic::from_payload(Box::new("boom"));
        assert_eq!(caught.message(), "boom");
    }

    #[test]
    fn message_from_string_payload() {
        let caught = CaughtPanic::from_payload(Box::new(String::from("bad state")));
        assert_eq!(caught.message(), "bad state");
    }

    #[test]
    fn message_from_opaque_payload() {
        let caught = CaughtPanic::from_payload(Box::new(17_u32));
        assert_eq!(caught.message(), "task panicked");
    }

    #[test]
    fn rethrow_resumes_the_panic() {
        let caught = CaughtPanic::from_payload(Box::new("again"));
        let err = panic::catch_unwind(AssertUnwindSafe(move || caught.rethrow()))
            .expect_err("rethrow must unwind");
        assert_eq!(err.downcast_ref::<&str>(), Some(&"again"));
    }

    #[test]
    fn catch_stores_failure_and_cancels() {
        let ctx = GroupContext::new(ContextTraits::bound());
        let result: Option<()> = catch_group_failure(&ctx, || panic!("worker died"));
        assert!(result.is_none());
        assert!(ctx.is_cancelled());
        let caught = ctx.take_failure().expect("failure slot must be filled");
        assert_eq!(caught.message(), "worker died");
    }

    #[test]
    fn first_failure_wins() {
        let ctx = GroupContext::new(ContextTraits::bound());
        let _: Option<()> = catch_group_failure(&ctx, || panic!("first"));
        let _: Option<()> = catch_group_failure(&ctx, || panic!("second"));
        let caught = ctx.take_failure().expect("failure slot must be filled");
        assert_eq!(caught.message(), "first");
    }

    #[test]
    fn successful_closure_passes_through() {
        let ctx = GroupContext::new(ContextTraits::bound());
        assert_eq!(catch_group_failure(&ctx, || 7), Some(7));
        assert!(!ctx.is_cancelled());
        assert!(!ctx.has_failure());
    }
}
