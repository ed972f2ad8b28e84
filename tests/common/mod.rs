#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use bramble::{GroupContext, ThreadRecord, ThreadRegistry};
use std::sync::{Arc, Once};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Registers a fresh worker record rooted at its own arena default.
pub fn worker() -> Arc<ThreadRecord> {
    ThreadRegistry::global().register_worker(&GroupContext::new_arena_default())
}

/// Registers a fresh external-thread record rooted at its own arena default.
pub fn external() -> Arc<ThreadRecord> {
    ThreadRegistry::global().register_external(&GroupContext::new_arena_default())
}

/// Creates a root context and isolates it on `record` (first use at the
/// arena root).
pub fn isolated_root(record: &Arc<ThreadRecord>) -> Arc<GroupContext> {
    let root = GroupContext::new(bramble::ContextTraits::bound());
    root.bind_on_first_use(record);
    root
}

/// Creates a child context and binds it on `record` while `parent` is the
/// executing context there.
pub fn bind_child(parent: &Arc<GroupContext>, record: &Arc<ThreadRecord>) -> Arc<GroupContext> {
    let child = GroupContext::new(bramble::ContextTraits::bound());
    let _in = record.enter(parent);
    child.bind_on_first_use(record);
    child
}
