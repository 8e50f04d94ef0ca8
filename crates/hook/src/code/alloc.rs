//! Trampoline slots carved out of executable blocks placed close to hook targets.

use parking_lot::{Mutex, const_mutex};
use tracing::debug;

use crate::{HookError, HookResult, code::within_rel32};

/// Bytes available to a single trampoline.
pub const SLOT_SIZE: usize = 128;

const BLOCK_SIZE: usize = 0x10000;
const SLOTS_PER_BLOCK: usize = BLOCK_SIZE / SLOT_SIZE;

/// How far from the target a block may be placed, leaving room for the block itself
/// inside the reach of a rel32 jump.
#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
const SEARCH_DISTANCE: usize = 0x7000_0000;

/// A fixed-size piece of executable, writable memory.
#[derive(Debug)]
pub struct CodeSlot {
    addr: usize,
}

impl CodeSlot {
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

#[derive(Debug)]
struct Block {
    base: usize,
    free: Vec<usize>,
}

impl Block {
    fn new(base: usize) -> Self {
        Self {
            base,
            free: (0..SLOTS_PER_BLOCK)
                .rev()
                .map(|i| base + i * SLOT_SIZE)
                .collect(),
        }
    }

    fn reaches(&self, target: usize) -> bool {
        within_rel32(target, self.base) && within_rel32(target, self.base + BLOCK_SIZE)
    }

    fn contains(&self, addr: usize) -> bool {
        (self.base..self.base + BLOCK_SIZE).contains(&addr)
    }
}

// Blocks are never unmapped. Released slots go back to their block's free list.
static BLOCKS: Mutex<Vec<Block>> = const_mutex(Vec::new());

/// Allocate a slot, preferring one within rel32 reach of `target`.
///
/// When no memory can be found near the target, the slot may be anywhere in the
/// address space. Callers check reachability themselves.
pub fn allocate_near(target: usize) -> HookResult<CodeSlot> {
    let mut blocks = BLOCKS.lock();

    if let Some(slot) = take_slot(&mut blocks, |block| block.reaches(target)) {
        return Ok(slot);
    }

    if let Some(base) = unsafe { os::map_near(target, BLOCK_SIZE) } {
        debug!(target, base, "mapped trampoline block near target");
        blocks.push(Block::new(base));
    } else if let Some(slot) = take_slot(&mut blocks, |_| true) {
        return Ok(slot);
    } else {
        let base = unsafe { os::map_any(BLOCK_SIZE) }.ok_or(HookError::AllocationFailed(target))?;
        debug!(target, base, "mapped trampoline block out of jump range");
        blocks.push(Block::new(base));
    }

    take_slot(&mut blocks, |_| true).ok_or(HookError::AllocationFailed(target))
}

/// Return a slot to its block.
///
/// # Safety
/// No thread may be executing or about to execute code in the slot.
pub unsafe fn release(slot: CodeSlot) {
    unsafe { core::ptr::write_bytes(slot.as_mut_ptr(), 0xCC, SLOT_SIZE) };

    let mut blocks = BLOCKS.lock();
    if let Some(block) = blocks.iter_mut().find(|block| block.contains(slot.addr)) {
        block.free.push(slot.addr);
    }
}

fn take_slot(blocks: &mut [Block], mut filter: impl FnMut(&Block) -> bool) -> Option<CodeSlot> {
    blocks
        .iter_mut()
        .filter(|block| filter(block))
        .find_map(|block| block.free.pop())
        .map(|addr| CodeSlot { addr })
}

#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
#[inline]
fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[cfg_attr(target_pointer_width = "32", allow(dead_code))]
#[inline]
fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr + align - 1, align)
}

#[cfg(windows)]
mod os {
    use core::{ffi::c_void, mem::size_of};

    use windows::Win32::System::{
        Memory::{
            MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
            VirtualAlloc, VirtualQuery,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    };

    use super::{SEARCH_DISTANCE, align_down, align_up};

    pub unsafe fn map_any(size: usize) -> Option<usize> {
        unsafe { alloc_at(None, size) }
    }

    pub unsafe fn map_near(target: usize, size: usize) -> Option<usize> {
        if cfg!(target_pointer_width = "32") {
            return unsafe { map_any(size) };
        }

        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        let granularity = info.dwAllocationGranularity as usize;
        let lowest =
            (info.lpMinimumApplicationAddress as usize).max(target.saturating_sub(SEARCH_DISTANCE));
        let highest =
            (info.lpMaximumApplicationAddress as usize).min(target.saturating_add(SEARCH_DISTANCE));

        let mut candidate = align_down(target, granularity);
        while candidate >= lowest + granularity {
            candidate -= granularity;
            let Some(region) = query(candidate) else {
                break;
            };

            if region.State == MEM_FREE {
                if let Some(base) = unsafe { alloc_at(Some(candidate), size) } {
                    return Some(base);
                }
            } else {
                candidate = align_down(region.AllocationBase as usize, granularity);
            }
        }

        let mut candidate = align_down(target, granularity) + granularity;
        while candidate + size <= highest {
            let Some(region) = query(candidate) else {
                break;
            };

            if region.State == MEM_FREE {
                if let Some(base) = unsafe { alloc_at(Some(candidate), size) } {
                    return Some(base);
                }
                candidate += granularity;
            } else {
                candidate = align_up(region.BaseAddress as usize + region.RegionSize, granularity);
            }
        }

        None
    }

    fn query(addr: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQuery(
                Some(addr as *const c_void),
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (len != 0).then_some(info)
    }

    unsafe fn alloc_at(addr: Option<usize>, size: usize) -> Option<usize> {
        let ptr = unsafe {
            VirtualAlloc(
                addr.map(|addr| addr as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        (!ptr.is_null()).then_some(ptr as usize)
    }
}

#[cfg(unix)]
mod os {
    pub unsafe fn map_any(size: usize) -> Option<usize> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        (ptr != libc::MAP_FAILED).then_some(ptr as usize)
    }

    #[cfg(target_os = "linux")]
    pub unsafe fn map_near(target: usize, size: usize) -> Option<usize> {
        use super::{SEARCH_DISTANCE, align_down};

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let window_start = align_down(target.saturating_sub(SEARCH_DISTANCE), page).max(page);
        let window_end = align_down(target.saturating_add(SEARCH_DISTANCE), page);

        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        let mut regions = maps
            .lines()
            .filter_map(|line| {
                let (start, end) = line.split_whitespace().next()?.split_once('-')?;
                Some((
                    usize::from_str_radix(start, 16).ok()?,
                    usize::from_str_radix(end, 16).ok()?,
                ))
            })
            .collect::<Vec<_>>();
        regions.sort_unstable_by_key(|&(start, _)| start);
        regions.push((window_end, window_end));

        let mut prev_end = window_start;
        for (start, end) in regions {
            if start > window_end {
                break;
            }

            let gap_end = start.min(window_end);
            if gap_end > prev_end && gap_end - prev_end >= size {
                let candidate = align_down(target.clamp(prev_end, gap_end - size), page);
                if let Some(base) = unsafe { map_fixed(candidate, size) } {
                    return Some(base);
                }
            }
            prev_end = prev_end.max(end);
        }

        None
    }

    #[cfg(target_os = "linux")]
    unsafe fn map_fixed(addr: usize, size: usize) -> Option<usize> {
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }

        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        if ptr as usize != addr {
            unsafe { libc::munmap(ptr, size) };
            return None;
        }

        Some(addr)
    }

    #[cfg(not(target_os = "linux"))]
    pub unsafe fn map_near(_target: usize, _size: usize) -> Option<usize> {
        None
    }
}

#[cfg(not(any(windows, unix)))]
mod os {
    pub unsafe fn map_any(_size: usize) -> Option<usize> {
        None
    }

    pub unsafe fn map_near(_target: usize, _size: usize) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused_first() {
        let mut blocks = vec![Block::new(0x10_0000)];
        let a = take_slot(&mut blocks, |_| true).unwrap();
        let b = take_slot(&mut blocks, |_| true).unwrap();
        assert_eq!(a.addr(), 0x10_0000);
        assert_eq!(b.addr(), 0x10_0000 + SLOT_SIZE);

        blocks[0].free.push(a.addr());
        let c = take_slot(&mut blocks, |_| true).unwrap();
        assert_eq!(c.addr(), a.addr());
    }

    #[test]
    fn exhausted_or_filtered_blocks_yield_nothing() {
        let mut blocks = vec![Block::new(0x10_0000)];
        assert!(take_slot(&mut blocks, |_| false).is_none());

        for _ in 0..SLOTS_PER_BLOCK {
            assert!(take_slot(&mut blocks, |_| true).is_some());
        }
        assert!(take_slot(&mut blocks, |_| true).is_none());
    }

    #[test]
    fn allocated_slots_are_distinct() {
        let anchor = allocated_slots_are_distinct as usize;
        let a = allocate_near(anchor).unwrap();
        let b = allocate_near(anchor).unwrap();
        assert_ne!(a.addr(), b.addr());
        assert_eq!(a.addr() % SLOT_SIZE, 0);

        unsafe {
            release(a);
            release(b);
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn slot_is_reachable_from_code() {
        let anchor = slot_is_reachable_from_code as usize;
        let slot = allocate_near(anchor).unwrap();
        assert!(within_rel32(anchor, slot.addr()));
        unsafe { release(slot) };
    }
}
