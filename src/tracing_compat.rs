//! Tracing compatibility layer.
//!
//! The core logs only on its cold paths (cancellation, sweeps, binding),
//! and only when the `tracing-integration` feature is enabled:
//!
//! - **With the feature**: re-exports the `tracing` macros.
//! - **Without it**: no-op macros that compile to nothing, keeping the
//!   uncancelled hot path free of any logging cost.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op macro implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn macros_accept_structured_fields() {
        trace!(group = "g", "trace message");
        debug!(epoch = 3_u64, "debug message");
        info!("info message");
        warn!("warn message");
        error!("error message");
    }
}
