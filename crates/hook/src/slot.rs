use core::{
    ffi::c_void,
    mem::{align_of, size_of},
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::debug;

use crate::{HookError, HookResult, code::protect};

/// A virtual table entry whose current value has been captured but not replaced yet.
#[derive(Debug)]
pub struct PreparedSlotHook {
    slot: usize,
    original: usize,
    detour: usize,
}

impl PreparedSlotHook {
    /// # Safety
    /// `slot` must point at a function pointer inside a live virtual table and
    /// `detour` must have the same signature.
    pub unsafe fn new(slot: *mut *const c_void, detour: *const c_void) -> HookResult<Self> {
        let slot = slot as usize;
        if slot % align_of::<usize>() != 0 {
            return Err(HookError::Misaligned(slot));
        }

        let original = unsafe { entry(slot) }.load(Ordering::Acquire);
        Ok(Self {
            slot,
            original,
            detour: detour as usize,
        })
    }

    /// The method currently stored in the slot.
    #[inline]
    pub fn original(&self) -> *const c_void {
        self.original as *const c_void
    }

    /// Swap the detour into the slot.
    ///
    /// Fails without writing if the slot changed since [`PreparedSlotHook::new`].
    ///
    /// # Safety
    /// The detour must be ready to be called.
    pub unsafe fn commit(self) -> HookResult<SlotHook> {
        let Self {
            slot,
            original,
            detour,
        } = self;

        unsafe {
            protect::with_writable(slot, size_of::<usize>(), || {
                entry(slot).compare_exchange(original, detour, Ordering::AcqRel, Ordering::Acquire)
            })
        }?
        .map_err(|_| HookError::Overwritten(slot))?;
        debug!(slot, original, detour, "slot hook committed");

        Ok(SlotHook {
            slot,
            original,
            detour,
        })
    }
}

/// A virtual table entry pointing at a detour.
#[derive(Debug)]
pub struct SlotHook {
    slot: usize,
    original: usize,
    detour: usize,
}

impl SlotHook {
    /// # Safety
    /// See [`PreparedSlotHook::new`].
    pub unsafe fn attach(slot: *mut *const c_void, detour: *const c_void) -> HookResult<Self> {
        unsafe { PreparedSlotHook::new(slot, detour)?.commit() }
    }

    /// The method the slot held before the hook.
    #[inline]
    pub fn original(&self) -> *const c_void {
        self.original as *const c_void
    }

    #[inline]
    pub fn slot(&self) -> *const c_void {
        self.slot as *const c_void
    }

    /// Put the original method back, unless the slot no longer holds the detour.
    ///
    /// # Safety
    /// The virtual table must still be mapped.
    pub unsafe fn detach(&self) -> HookResult<()> {
        unsafe {
            protect::with_writable(self.slot, size_of::<usize>(), || {
                entry(self.slot).compare_exchange(
                    self.detour,
                    self.original,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            })
        }?
        .map_err(|_| HookError::Overwritten(self.slot))?;
        debug!(slot = self.slot, "slot hook detached");

        Ok(())
    }
}

unsafe fn entry<'a>(slot: usize) -> &'a AtomicUsize {
    unsafe { AtomicUsize::from_ptr(slot as *mut usize) }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn one() -> u32 {
        1
    }

    extern "C" fn two() -> u32 {
        2
    }

    extern "C" fn detour() -> u32 {
        42
    }

    fn vtable() -> Box<[*const c_void; 3]> {
        Box::new([
            one as *const c_void,
            two as *const c_void,
            one as *const c_void,
        ])
    }

    fn call(ptr: *const c_void) -> u32 {
        let f = unsafe { core::mem::transmute::<*const c_void, extern "C" fn() -> u32>(ptr) };
        f()
    }

    #[test]
    fn swaps_and_restores_entry() {
        let mut table = vtable();
        let slot = &mut table[1] as *mut *const c_void;

        let hook = unsafe { SlotHook::attach(slot, detour as *const c_void) }.unwrap();
        assert_eq!(call(table[1]), 42);
        assert_eq!(call(hook.original()), 2);
        assert_eq!(call(table[0]), 1);

        unsafe { hook.detach() }.unwrap();
        assert_eq!(call(table[1]), 2);
    }

    #[test]
    fn commit_fails_when_slot_changed_after_prepare() {
        let mut table = vtable();
        let slot = &mut table[1] as *mut *const c_void;

        let prepared = unsafe { PreparedSlotHook::new(slot, detour as *const c_void) }.unwrap();
        table[1] = one as *const c_void;

        assert!(matches!(
            unsafe { prepared.commit() },
            Err(HookError::Overwritten(_))
        ));
        assert_eq!(call(table[1]), 1);
    }

    #[test]
    fn detach_keeps_foreign_replacement() {
        let mut table = vtable();
        let slot = &mut table[2] as *mut *const c_void;

        let hook = unsafe { SlotHook::attach(slot, detour as *const c_void) }.unwrap();
        table[2] = two as *const c_void;

        assert!(matches!(
            unsafe { hook.detach() },
            Err(HookError::Overwritten(_))
        ));
        assert_eq!(call(table[2]), 2);
    }

    #[test]
    fn misaligned_slot_is_rejected() {
        let mut table = vtable();
        let slot = (table.as_mut_ptr() as usize + 1) as *mut *const c_void;

        assert!(matches!(
            unsafe { PreparedSlotHook::new(slot, detour as *const c_void) },
            Err(HookError::Misaligned(_))
        ));
    }
}
