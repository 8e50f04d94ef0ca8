//! Function hooking for x86 and x86-64 processes.
//!
//! This crate is intended to be used only as `gfx-shim`'s internal dependency.
//! It provides two ways to redirect a function to a detour:
//!
//! * [`InlineHook`] patches the first bytes of a function with a jump and
//!   builds a trampoline that runs the displaced instructions before jumping
//!   back into the original body.
//! * [`SlotHook`] swaps a single entry of a virtual method table.
//!
//! Both can be built in two phases. [`PreparedInlineHook::new`] and
//! [`PreparedSlotHook::new`] produce everything the detour needs to call the
//! original function, and `commit` publishes the redirect. Callers store the
//! trampoline address somewhere the detour can see it between the two phases.
//!
//! [`code`] exposes the executable memory allocator and patch writes used by
//! both.

pub mod code;
mod inline;
mod reloc;
mod slot;

pub use inline::{InlineHook, PreparedInlineHook};
pub use slot::{PreparedSlotHook, SlotHook};

use thiserror::Error;

/// Errors raised while building, applying or removing a hook.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hooking is not supported on this platform")]
    Unsupported,

    #[error("cannot allocate executable memory near {0:#x}")]
    AllocationFailed(usize),

    #[error("cannot change page protection at {addr:#x} (os error {code})")]
    ProtectionFailed { addr: usize, code: i32 },

    #[error("invalid instruction at {0:#x}")]
    InvalidInstruction(usize),

    #[error("function at {addr:#x} ends after {len} bytes but the patch needs {needed}")]
    FunctionTooShort {
        addr: usize,
        len: usize,
        needed: usize,
    },

    #[error("cannot relocate instructions at {addr:#x}: {reason}")]
    RelocationFailed { addr: usize, reason: String },

    #[error("pointer slot {0:#x} is not aligned")]
    Misaligned(usize),

    #[error("code or slot at {0:#x} was modified by someone else")]
    Overwritten(usize),
}

pub type HookResult<T> = Result<T, HookError>;
