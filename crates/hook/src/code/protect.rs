//! Temporarily writable code pages and patch writes.

use core::sync::atomic::{AtomicU64, Ordering, fence};

use crate::HookResult;

/// Run `f` while `[addr, addr + len)` is writable, then restore the previous
/// protection and flush the instruction cache for the range.
///
/// # Safety
/// The range must be mapped.
pub unsafe fn with_writable<R>(addr: usize, len: usize, f: impl FnOnce() -> R) -> HookResult<R> {
    unsafe { os::with_writable(addr, len, f) }
}

/// Store `bytes` at `addr`.
///
/// Patches that fit in one naturally aligned 8-byte word are published with a
/// single atomic store, so a thread executing the range sees either the old or
/// the new instruction bytes. On x86-64, patches that fit in one aligned
/// 16-byte block are published with `lock cmpxchg16b`. Anything else is
/// copied byte-wise.
///
/// # Safety
/// The range must be writable.
pub unsafe fn write_code(addr: usize, bytes: &[u8]) {
    fence(Ordering::SeqCst);

    let word_addr = addr & !7;
    let offset = addr - word_addr;
    if offset + bytes.len() <= 8 {
        let word = unsafe { AtomicU64::from_ptr(word_addr as *mut u64) };
        let mut buf = word.load(Ordering::Acquire).to_le_bytes();
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        word.store(u64::from_le_bytes(buf), Ordering::Release);
    } else if !unsafe { wide::store(addr, bytes) } {
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    fence(Ordering::SeqCst);
}

#[cfg(target_arch = "x86_64")]
mod wide {
    use core::{arch::asm, ptr};

    /// Publish `bytes` with one `lock cmpxchg16b` on the aligned block holding
    /// them. Returns `false` without writing if they span two blocks or the CPU
    /// lacks the instruction.
    pub unsafe fn store(addr: usize, bytes: &[u8]) -> bool {
        let block = addr & !15;
        let offset = addr - block;
        if offset + bytes.len() > 16 || !std::is_x86_feature_detected!("cmpxchg16b") {
            return false;
        }

        let block = block as *mut u128;
        let mut current = unsafe { ptr::read_volatile(block) };
        loop {
            let mut buf = current.to_le_bytes();
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);

            let previous = unsafe { cmpxchg16b(block, current, u128::from_le_bytes(buf)) };
            if previous == current {
                return true;
            }
            current = previous;
        }
    }

    /// Returns the value found at `dst`. The store happened if it equals `old`.
    unsafe fn cmpxchg16b(dst: *mut u128, old: u128, new: u128) -> u128 {
        let (previous_lo, previous_hi): (u64, u64);

        // rbx is reserved by LLVM, so it is swapped in and out by hand.
        unsafe {
            asm!(
                "xchg {rbx_tmp}, rbx",
                "lock cmpxchg16b xmmword ptr [{dst}]",
                "mov rbx, {rbx_tmp}",
                dst = in(reg) dst,
                rbx_tmp = inout(reg) new as u64 => _,
                in("rcx") (new >> 64) as u64,
                inout("rax") old as u64 => previous_lo,
                inout("rdx") (old >> 64) as u64 => previous_hi,
                options(nostack),
            );
        }

        (u128::from(previous_hi) << 64) | u128::from(previous_lo)
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod wide {
    pub unsafe fn store(_addr: usize, _bytes: &[u8]) -> bool {
        false
    }
}

/// Flush the instruction cache after writing fresh code.
pub fn flush(addr: usize, len: usize) {
    os::flush(addr, len);
}

/// Number of bytes from `addr`, at most `max`, that lie in readable mappings.
pub fn readable_len(addr: usize, max: usize) -> usize {
    os::readable_len(addr, max)
}

#[cfg(windows)]
mod os {
    use core::ffi::c_void;

    use scopeguard::defer;
    use windows::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE, PAGE_GUARD,
            PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, VirtualProtect, VirtualQuery,
        },
        Threading::GetCurrentProcess,
    };

    use crate::{HookError, HookResult};

    pub unsafe fn with_writable<R>(
        addr: usize,
        len: usize,
        f: impl FnOnce() -> R,
    ) -> HookResult<R> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe { VirtualProtect(addr as *const c_void, len, PAGE_EXECUTE_READWRITE, &mut old) }
            .map_err(|err| HookError::ProtectionFailed {
                addr,
                code: err.code().0,
            })?;

        defer! {
            let mut previous = PAGE_PROTECTION_FLAGS::default();
            unsafe {
                _ = VirtualProtect(addr as *const c_void, len, old, &mut previous);
            }
            flush(addr, len);
        }

        Ok(f())
    }

    pub fn flush(addr: usize, len: usize) {
        unsafe {
            _ = FlushInstructionCache(GetCurrentProcess(), Some(addr as *const c_void), len);
        }
    }

    pub fn readable_len(addr: usize, max: usize) -> usize {
        let mut len = 0;
        while len < max {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQuery(
                    Some((addr + len) as *const c_void),
                    &mut info,
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0
                || info.State != MEM_COMMIT
                || (info.Protect & (PAGE_NOACCESS | PAGE_GUARD)).0 != 0
            {
                break;
            }

            len = info.BaseAddress as usize + info.RegionSize - addr;
        }

        len.min(max)
    }
}

#[cfg(unix)]
mod os {
    use scopeguard::defer;

    use crate::{HookError, HookResult};

    const RWX: i32 = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn last_os_error() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    pub unsafe fn with_writable<R>(
        addr: usize,
        len: usize,
        f: impl FnOnce() -> R,
    ) -> HookResult<R> {
        let page = page_size();
        let start = addr & !(page - 1);
        let end = (addr + len.max(1) + page - 1) & !(page - 1);

        let original = page_protections(start, end, page).ok_or(HookError::ProtectionFailed {
            addr,
            code: libc::ENOMEM,
        })?;

        if original.iter().all(|&(_, prot)| prot & libc::PROT_WRITE != 0) {
            return Ok(f());
        }

        for (i, &(page_addr, _)) in original.iter().enumerate() {
            if unsafe { libc::mprotect(page_addr as *mut libc::c_void, page, RWX) } != 0 {
                let code = last_os_error();
                restore(&original[..i], page);
                return Err(HookError::ProtectionFailed { addr, code });
            }
        }

        defer! {
            restore(&original, page);
        }

        Ok(f())
    }

    fn restore(pages: &[(usize, i32)], page: usize) {
        for &(page_addr, prot) in pages {
            unsafe { libc::mprotect(page_addr as *mut libc::c_void, page, prot) };
        }
    }

    // x86 keeps instruction fetch coherent with stores.
    pub fn flush(_addr: usize, _len: usize) {}

    /// Mapped regions as `(start, end, protection)`.
    #[cfg(target_os = "linux")]
    fn regions() -> Option<Vec<(usize, usize, i32)>> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        Some(
            maps.lines()
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let (from, to) = fields.next()?.split_once('-')?;
                    Some((
                        usize::from_str_radix(from, 16).ok()?,
                        usize::from_str_radix(to, 16).ok()?,
                        parse_protection(fields.next()?),
                    ))
                })
                .collect(),
        )
    }

    #[cfg(target_os = "linux")]
    pub fn readable_len(addr: usize, max: usize) -> usize {
        let Some(regions) = regions() else {
            return max;
        };

        let mut len = 0;
        while len < max {
            let next = regions.iter().find(|&&(from, to, prot)| {
                (from..to).contains(&(addr + len)) && prot & libc::PROT_READ != 0
            });
            match next {
                Some(&(_, to, _)) => len = to - addr,
                None => break,
            }
        }

        len.min(max)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn readable_len(_addr: usize, max: usize) -> usize {
        max
    }

    #[cfg(target_os = "linux")]
    pub(super) fn page_protections(start: usize, end: usize, page: usize) -> Option<Vec<(usize, i32)>> {
        let regions = regions()?;

        (start..end)
            .step_by(page)
            .map(|page_addr| {
                regions
                    .iter()
                    .find(|&&(from, to, _)| (from..to).contains(&page_addr))
                    .map(|&(_, _, prot)| (page_addr, prot))
            })
            .collect()
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn page_protections(start: usize, end: usize, page: usize) -> Option<Vec<(usize, i32)>> {
        Some(
            (start..end)
                .step_by(page)
                .map(|page_addr| (page_addr, libc::PROT_READ | libc::PROT_EXEC))
                .collect(),
        )
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(super) fn parse_protection(perms: &str) -> i32 {
        let bytes = perms.as_bytes();
        let mut prot = libc::PROT_NONE;
        if bytes.first() == Some(&b'r') {
            prot |= libc::PROT_READ;
        }
        if bytes.get(1) == Some(&b'w') {
            prot |= libc::PROT_WRITE;
        }
        if bytes.get(2) == Some(&b'x') {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}
