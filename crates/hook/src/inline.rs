use core::{ffi::c_void, slice};

use scopeguard::ScopeGuard;
use tracing::debug;

use crate::{
    HookError, HookResult,
    code::{
        alloc::{self, CodeSlot, SLOT_SIZE},
        protect,
    },
    reloc::{self, FAR_JMP_LEN, WINDOW_LEN},
};

/// An inline hook whose trampoline is built but whose redirect is not written yet.
#[derive(Debug)]
pub struct PreparedInlineHook {
    target: usize,
    slot: CodeSlot,
    patch: Vec<u8>,
    original: Vec<u8>,
}

impl PreparedInlineHook {
    /// Build a trampoline for `target` that runs its displaced entry
    /// instructions and continues in the original body.
    ///
    /// On 64-bit targets the entry is patched with a `jmp rel32` to a relay at
    /// the end of the trampoline slot, which holds an absolute jump to `detour`.
    /// When no slot can be placed within rel32 reach, the entry gets the
    /// absolute jump directly.
    ///
    /// # Safety
    /// `target` must point at the entry of a function and `detour` at a function
    /// with the same signature and calling convention.
    #[tracing::instrument(level = "debug", skip_all, fields(target = target as usize))]
    pub unsafe fn new(target: *const c_void, detour: *const c_void) -> HookResult<Self> {
        let target = target as usize;
        let detour = detour as usize;

        let slot = scopeguard::guard(alloc::allocate_near(target)?, |slot| unsafe {
            alloc::release(slot)
        });
        let base = slot.addr();

        let (patch, relay) = if cfg!(target_pointer_width = "64") {
            let relay = base + SLOT_SIZE - FAR_JMP_LEN;
            match reloc::near_jmp(target, relay) {
                Some(patch) => (patch.to_vec(), Some(relay)),
                None => (reloc::far_jmp(detour).to_vec(), None),
            }
        } else {
            (reloc::jmp(target, detour), None)
        };

        // The function may end right before an unmapped page.
        let readable = protect::readable_len(target, WINDOW_LEN);
        let code = unsafe { slice::from_raw_parts(target as *const u8, readable) };
        let relocated = reloc::relocate(code, target, patch.len(), base)?;

        let mut trampoline = relocated.code;
        let resume = reloc::jmp(base + trampoline.len(), target + relocated.consumed);
        trampoline.extend_from_slice(&resume);

        let room = relay.map_or(SLOT_SIZE, |relay| relay - base);
        if trampoline.len() > room {
            return Err(HookError::RelocationFailed {
                addr: target,
                reason: format!("trampoline needs {} bytes", trampoline.len()),
            });
        }

        unsafe {
            core::ptr::copy_nonoverlapping(trampoline.as_ptr(), slot.as_mut_ptr(), trampoline.len());
            if let Some(relay) = relay {
                let jump = reloc::jmp(relay, detour);
                core::ptr::copy_nonoverlapping(jump.as_ptr(), relay as *mut u8, jump.len());
            }
        }
        protect::flush(base, SLOT_SIZE);

        debug!(
            trampoline = base,
            displaced = relocated.consumed,
            patch_len = patch.len(),
            "trampoline built"
        );

        Ok(Self {
            target,
            slot: ScopeGuard::into_inner(slot),
            original: code[..patch.len()].to_vec(),
            patch,
        })
    }

    /// Address that runs the original function.
    #[inline]
    pub fn trampoline(&self) -> *const c_void {
        self.slot.addr() as *const c_void
    }

    /// Write the redirect into the target's entry.
    ///
    /// # Safety
    /// The detour must be ready to be called, including finding the trampoline.
    pub unsafe fn commit(self) -> HookResult<InlineHook> {
        let Self {
            target,
            slot,
            patch,
            original,
        } = self;
        let slot = scopeguard::guard(slot, |slot| unsafe { alloc::release(slot) });

        if unsafe { read(target, original.len()) } != original.as_slice() {
            return Err(HookError::Overwritten(target));
        }

        unsafe { protect::with_writable(target, patch.len(), || protect::write_code(target, &patch)) }?;
        debug!(target, "inline hook committed");

        Ok(InlineHook {
            target,
            slot: ScopeGuard::into_inner(slot),
            patch,
            original,
        })
    }

    /// Drop the trampoline without touching the target.
    pub fn discard(self) {
        // Never published, so nothing can be running it.
        unsafe { alloc::release(self.slot) };
    }
}

/// A function entry redirected to a detour.
///
/// Dropping the hook leaves the redirect and its trampoline in place.
#[derive(Debug)]
pub struct InlineHook {
    target: usize,
    slot: CodeSlot,
    patch: Vec<u8>,
    original: Vec<u8>,
}

impl InlineHook {
    /// Build the trampoline and write the redirect in one step.
    ///
    /// # Safety
    /// See [`PreparedInlineHook::new`]. The detour must not need the trampoline
    /// address before this returns.
    pub unsafe fn attach(target: *const c_void, detour: *const c_void) -> HookResult<Self> {
        unsafe { PreparedInlineHook::new(target, detour)?.commit() }
    }

    #[inline]
    pub fn target(&self) -> *const c_void {
        self.target as *const c_void
    }

    /// Address that runs the original function.
    #[inline]
    pub fn trampoline(&self) -> *const c_void {
        self.slot.addr() as *const c_void
    }

    /// Put the original entry bytes back.
    ///
    /// Threads already inside the detour or the trampoline are unaffected, so the
    /// trampoline stays allocated until [`InlineHook::release`].
    ///
    /// # Safety
    /// Must be called at most once.
    pub unsafe fn detach(&self) -> HookResult<()> {
        if unsafe { read(self.target, self.patch.len()) } != self.patch.as_slice() {
            return Err(HookError::Overwritten(self.target));
        }

        unsafe {
            protect::with_writable(self.target, self.original.len(), || {
                protect::write_code(self.target, &self.original)
            })
        }?;
        debug!(target = self.target, "inline hook detached");

        Ok(())
    }

    /// Free the trampoline.
    ///
    /// # Safety
    /// The hook must be detached and no thread may still be running the trampoline.
    pub unsafe fn release(self) {
        unsafe { alloc::release(self.slot) };
    }
}

unsafe fn read<'a>(addr: usize, len: usize) -> &'a [u8] {
    unsafe { slice::from_raw_parts(addr as *const u8, len) }
}

#[cfg(all(test, target_arch = "x86_64", any(target_os = "linux", windows)))]
mod tests {
    use core::{
        hint::black_box,
        mem,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    type AddFn = extern "C" fn(u64, u64) -> u64;

    const NOP5: [u8; 5] = [0x0F, 0x1F, 0x44, 0x00, 0x00];

    // lea rax, [rcx + rdx]
    #[cfg(windows)]
    const LEA_SUM: [u8; 4] = [0x48, 0x8D, 0x04, 0x11];
    // lea rax, [rdi + rsi]
    #[cfg(not(windows))]
    const LEA_SUM: [u8; 4] = [0x48, 0x8D, 0x04, 0x37];

    /// Place `code` in executable memory.
    fn emit(code: &[u8]) -> CodeSlot {
        let slot = alloc::allocate_near(emit as usize).unwrap();
        unsafe { core::ptr::copy_nonoverlapping(code.as_ptr(), slot.as_mut_ptr(), code.len()) };
        protect::flush(slot.addr(), code.len());
        slot
    }

    /// `a + b` behind three five-byte NOPs.
    fn emit_add() -> CodeSlot {
        let code = [&NOP5[..], &NOP5, &NOP5, &LEA_SUM, &[0xC3]].concat();
        emit(&code)
    }

    fn as_add(addr: usize) -> AddFn {
        black_box(unsafe { mem::transmute::<usize, AddFn>(addr) })
    }

    #[test]
    fn detour_runs_and_trampoline_reaches_original() {
        static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

        extern "C" fn times_ten(a: u64, b: u64) -> u64 {
            as_add(ORIGINAL.load(Ordering::Acquire))(a, b) * 10
        }

        let func = emit_add();
        let before = unsafe { read(func.addr(), 20) }.to_vec();
        assert_eq!(as_add(func.addr())(2, 3), 5);

        let prepared =
            unsafe { PreparedInlineHook::new(func.addr() as _, times_ten as *const c_void) }.unwrap();
        ORIGINAL.store(prepared.trampoline() as usize, Ordering::Release);
        assert_eq!(as_add(func.addr())(2, 3), 5);

        let hook = unsafe { prepared.commit() }.unwrap();
        assert_eq!(as_add(func.addr())(2, 3), 50);
        assert_eq!(as_add(hook.trampoline() as usize)(2, 3), 5);

        unsafe { hook.detach() }.unwrap();
        assert_eq!(as_add(func.addr())(2, 3), 5);
        assert_eq!(unsafe { read(func.addr(), 20) }, before.as_slice());

        unsafe {
            hook.release();
            alloc::release(func);
        }
    }

    #[test]
    fn discarded_hook_leaves_target_untouched() {
        extern "C" fn zero(_: u64, _: u64) -> u64 {
            0
        }

        let func = emit_add();
        let before = unsafe { read(func.addr(), 20) }.to_vec();

        let prepared =
            unsafe { PreparedInlineHook::new(func.addr() as _, zero as *const c_void) }.unwrap();
        prepared.discard();

        assert_eq!(unsafe { read(func.addr(), 20) }, before.as_slice());
        assert_eq!(as_add(func.addr())(4, 4), 8);
        unsafe { alloc::release(func) };
    }

    #[test]
    fn detach_refuses_foreign_patch() {
        extern "C" fn zero(_: u64, _: u64) -> u64 {
            0
        }

        let func = emit_add();
        let hook = unsafe { InlineHook::attach(func.addr() as _, zero as *const c_void) }.unwrap();

        unsafe {
            protect::with_writable(func.addr(), NOP5.len(), || {
                protect::write_code(func.addr(), &NOP5)
            })
        }
        .unwrap();

        assert!(matches!(
            unsafe { hook.detach() },
            Err(HookError::Overwritten(addr)) if addr == func.addr()
        ));
        assert_eq!(as_add(func.addr())(1, 1), 2);

        unsafe {
            hook.release();
            alloc::release(func);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn function_ending_at_inaccessible_page_is_hooked() {
        static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

        extern "C" fn plus_one(a: u64, b: u64) -> u64 {
            as_add(ORIGINAL.load(Ordering::Acquire))(a, b) + 1
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                page * 2,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let base = ptr as usize;
        assert_eq!(
            unsafe { libc::mprotect((base + page) as *mut libc::c_void, page, libc::PROT_NONE) },
            0
        );

        let code = [&NOP5[..], &NOP5, &NOP5, &LEA_SUM, &[0xC3]].concat();
        let func = base + page - code.len();
        unsafe { core::ptr::copy_nonoverlapping(code.as_ptr(), func as *mut u8, code.len()) };

        let prepared =
            unsafe { PreparedInlineHook::new(func as _, plus_one as *const c_void) }.unwrap();
        ORIGINAL.store(prepared.trampoline() as usize, Ordering::Release);
        let hook = unsafe { prepared.commit() }.unwrap();
        assert_eq!(as_add(func)(2, 3), 6);

        unsafe { hook.detach() }.unwrap();
        assert_eq!(as_add(func)(2, 3), 5);

        unsafe {
            hook.release();
            libc::munmap(ptr, page * 2);
        }
    }

    #[test]
    fn tiny_function_is_rejected() {
        extern "C" fn zero(_: u64, _: u64) -> u64 {
            0
        }

        // xor eax, eax; ret
        let func = emit(&[0x31, 0xC0, 0xC3]);
        let err = unsafe { PreparedInlineHook::new(func.addr() as _, zero as *const c_void) }
            .unwrap_err();

        assert!(matches!(err, HookError::FunctionTooShort { len: 3, .. }));
        unsafe { alloc::release(func) };
    }
}
