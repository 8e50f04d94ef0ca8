//! Executable memory for trampolines and patching of existing code.

pub mod alloc;
pub mod protect;

/// Whether a `jmp rel32` placed at `from` can reach `to`.
#[inline]
pub fn within_rel32(from: usize, to: usize) -> bool {
    crate::reloc::rel32(from.wrapping_add(crate::reloc::NEAR_JMP_LEN), to).is_some()
}
