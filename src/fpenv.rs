//! Floating-point environment snapshots.
//!
//! Each task-group context can carry the floating-point control state its
//! tasks should run under. The snapshot is captured by value, either
//! explicitly via [`GroupContext::capture_fp_settings`](crate::GroupContext::capture_fp_settings)
//! or inherited from the parent at bind time; no ordering is required
//! between workers' use of their own captured settings.
//!
//! On x86-64 the snapshot is the MXCSR register (rounding mode,
//! flush-to-zero, exception masks). On aarch64 it is FPCR. Targets without
//! a supported control register carry an empty snapshot whose capture and
//! apply are no-ops.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A captured floating-point control word.
///
/// The snapshot is a plain value cell: `capture` reads the hardware state
/// into it, `apply` writes it back out, `copy_from` duplicates another
/// snapshot. The cell is atomic only so a context can be shared across
/// threads; there is no cross-thread ordering contract beyond that.
pub struct FpEnv {
    bits: AtomicU64,
}

impl FpEnv {
    /// Creates an empty snapshot holding no captured state.
    pub(crate) const fn unset() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Reads the current hardware floating-point control state into the
    /// snapshot.
    pub fn capture(&self) {
        self.bits.store(hw::read_control_word(), Ordering::Relaxed);
    }

    /// Restores the snapshot to the hardware.
    pub fn apply(&self) {
        hw::write_control_word(self.bits.load(Ordering::Relaxed));
    }

    /// Duplicates another snapshot into this one.
    pub fn copy_from(&self, src: &FpEnv) {
        self.bits.store(src.bits.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Returns the raw control-word bits.
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.bits.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FpEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FpEnv({:#x})", self.bits())
    }
}

/// RAII scope that applies a snapshot and restores the previous
/// environment on drop.
///
/// Workers use this when switching onto a task group with its own FP
/// settings: the thread's live control word is saved, the context's
/// snapshot applied, and the saved word written back when the scope ends.
#[derive(Debug)]
pub struct FpEnvScope {
    saved: u64,
}

impl FpEnvScope {
    /// Saves the current hardware state and applies `env`.
    #[must_use]
    pub fn apply(env: &FpEnv) -> Self {
        let saved = hw::read_control_word();
        env.apply();
        Self { saved }
    }
}

impl Drop for FpEnvScope {
    fn drop(&mut self) {
        hw::write_control_word(self.saved);
    }
}

mod hw {
    //! Arch-specific control-word access.
    #![allow(unsafe_code)]

    #[cfg(target_arch = "x86_64")]
    pub(super) fn read_control_word() -> u64 {
        let mut csr: u32 = 0;
        // stmxcsr stores the 32-bit MXCSR through a memory operand.
        unsafe {
            core::arch::asm!(
                "stmxcsr [{0}]",
                in(reg) core::ptr::addr_of_mut!(csr),
                options(nostack),
            );
        }
        u64::from(csr)
    }

    #[cfg(target_arch = "x86_64")]
    pub(super) fn write_control_word(bits: u64) {
        let csr = bits as u32;
        unsafe {
            core::arch::asm!(
                "ldmxcsr [{0}]",
                in(reg) core::ptr::addr_of!(csr),
                options(nostack),
            );
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn read_control_word() -> u64 {
        let fpcr: u64;
        unsafe {
            core::arch::asm!("mrs {0}, fpcr", out(reg) fpcr, options(nomem, nostack));
        }
        fpcr
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn write_control_word(bits: u64) {
        unsafe {
            core::arch::asm!("msr fpcr, {0}", in(reg) bits, options(nomem, nostack));
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub(super) fn read_control_word() -> u64 {
        0
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub(super) fn write_control_word(_bits: u64) {}
}
