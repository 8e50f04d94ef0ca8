//! Instruction relocation and jump encoding.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderError, DecoderOptions, FlowControl,
    Instruction, InstructionBlock,
};

use crate::{HookError, HookResult};

#[cfg(target_pointer_width = "64")]
pub const BITNESS: u32 = 64;
#[cfg(target_pointer_width = "32")]
pub const BITNESS: u32 = 32;

/// Longest possible x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// `jmp rel32`
pub const NEAR_JMP_LEN: usize = 5;

/// `jmp qword ptr [rip]` followed by the absolute destination.
pub const FAR_JMP_LEN: usize = 14;

/// Bytes read at a hook target: the patch, the instructions it splits and
/// the code after them that is checked for branches back into the patch.
pub const WINDOW_LEN: usize = 64;

const _: () = assert!(WINDOW_LEN >= FAR_JMP_LEN + MAX_INSN_LEN);

/// Displacement of a rel32 branch whose next instruction starts at `next_ip`.
pub fn rel32(next_ip: usize, to: usize) -> Option<i32> {
    if cfg!(target_pointer_width = "32") {
        Some(to.wrapping_sub(next_ip) as i32)
    } else {
        i32::try_from(to as i64 - next_ip as i64).ok()
    }
}

pub fn near_jmp(from: usize, to: usize) -> Option<[u8; NEAR_JMP_LEN]> {
    let rel = rel32(from.wrapping_add(NEAR_JMP_LEN), to)?;
    let mut code = [0xE9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&rel.to_le_bytes());
    Some(code)
}

pub fn far_jmp(to: usize) -> [u8; FAR_JMP_LEN] {
    let mut code = [0xFF, 0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    code[6..].copy_from_slice(&(to as u64).to_le_bytes());
    code
}

/// Shortest jump from `from` to `to` available on this architecture.
pub fn jmp(from: usize, to: usize) -> Vec<u8> {
    match near_jmp(from, to) {
        Some(code) => code.to_vec(),
        None => far_jmp(to).to_vec(),
    }
}

#[derive(Debug)]
pub struct Relocated {
    /// Re-encoded instructions for their new address.
    pub code: Vec<u8>,

    /// Bytes of whole instructions taken from the source.
    pub consumed: usize,
}

/// Re-encode the whole instructions at the start of `code` covering at least
/// `min_len` bytes so that they run correctly at `dest`.
///
/// `code` holds the bytes found at `ip`, up to [`WINDOW_LEN`] of them. Code
/// following the displaced instructions is decoded up to the first instruction
/// that ends the flow, and a near branch from there into the displaced bytes is
/// refused. Branches from further away are not seen.
pub fn relocate(code: &[u8], ip: usize, min_len: usize, dest: usize) -> HookResult<Relocated> {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut consumed = 0;
    let mut ended = false;

    while consumed < min_len {
        let insn = decoder.decode();
        if insn.is_invalid() {
            if decoder.last_error() == DecoderError::NoMoreBytes {
                return Err(HookError::FunctionTooShort {
                    addr: ip,
                    len: consumed,
                    needed: min_len,
                });
            }
            return Err(HookError::InvalidInstruction(ip + consumed));
        }
        consumed += insn.len();

        // Bytes following these may belong to another function.
        ended = ends_flow(&insn);
        if ended && consumed < min_len {
            return Err(HookError::FunctionTooShort {
                addr: ip,
                len: consumed,
                needed: min_len,
            });
        }

        instructions.push(insn);
    }

    if !ended {
        let displaced = ip + 1..ip + consumed;
        for insn in &mut decoder {
            if insn.is_invalid() {
                break;
            }

            let target = insn.near_branch_target() as usize;
            if displaced.contains(&target) {
                return Err(HookError::RelocationFailed {
                    addr: ip,
                    reason: format!("{:#x} branches into the patched bytes", insn.ip()),
                });
            }

            if ends_flow(&insn) {
                break;
            }
        }
    }

    let encoded = BlockEncoder::encode(
        BITNESS,
        InstructionBlock::new(&instructions, dest as u64),
        BlockEncoderOptions::NONE,
    )
    .map_err(|err| HookError::RelocationFailed {
        addr: ip,
        reason: err.to_string(),
    })?;

    Ok(Relocated {
        code: encoded.code_buffer,
        consumed,
    })
}

fn ends_flow(insn: &Instruction) -> bool {
    matches!(
        insn.flow_control(),
        FlowControl::Return
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Interrupt
            | FlowControl::Exception
    )
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;

    fn padded(code: &[u8]) -> Vec<u8> {
        let mut buf = code.to_vec();
        buf.resize(code.len() + MAX_INSN_LEN, 0xCC);
        buf
    }

    #[test]
    fn prologue_is_copied_verbatim() {
        let code = [
            0x55, // push rbp
            0x48, 0x89, 0xE5, // mov rbp, rsp
            0x48, 0x83, 0xEC, 0x20, // sub rsp, 0x20
        ];
        let relocated = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap();
        assert_eq!(relocated.consumed, 8);
        assert_eq!(relocated.code, code);
    }

    #[test]
    fn rip_relative_operand_is_adjusted() {
        // mov rax, [rip+0x100] reads 0x1107 from 0x1000
        let code = [0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00];
        let relocated = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap();
        assert_eq!(relocated.consumed, 7);
        assert_eq!(&relocated.code[..3], &[0x48, 0x8B, 0x05]);

        let disp = i32::from_le_bytes(relocated.code[3..7].try_into().unwrap());
        assert_eq!(disp, -0xF00);
    }

    #[test]
    fn call_keeps_its_destination() {
        // call 0x1105
        let code = [0xE8, 0x00, 0x01, 0x00, 0x00];
        let relocated = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap();
        assert_eq!(relocated.code[0], 0xE8);

        let rel = i32::from_le_bytes(relocated.code[1..5].try_into().unwrap());
        assert_eq!(0x2005 + rel as i64, 0x1105);
    }

    #[test]
    fn short_jump_is_widened() {
        // jmp 0x1012
        let code = [0xEB, 0x10];
        let relocated = relocate(&padded(&code), 0x1000, 2, 0x2000).unwrap();
        assert_eq!(relocated.code[0], 0xE9);

        let rel = i32::from_le_bytes(relocated.code[1..5].try_into().unwrap());
        assert_eq!(0x2005 + rel as i64, 0x1012);
    }

    #[test]
    fn return_inside_patch_window_is_rejected() {
        let code = [0x55, 0xC3]; // push rbp; ret
        let err = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap_err();
        assert!(matches!(
            err,
            HookError::FunctionTooShort {
                addr: 0x1000,
                len: 2,
                needed: 5
            }
        ));
    }

    #[test]
    fn loop_back_into_patch_is_rejected() {
        let code = [
            0x31, 0xC0, // xor eax, eax
            0xFF, 0xC0, // inc eax
            0x83, 0xF8, 0x10, // cmp eax, 0x10
            0x75, 0xF9, // jne 0x1002
            0xC3, // ret
        ];
        let err = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap_err();
        assert!(matches!(err, HookError::RelocationFailed { addr: 0x1000, .. }));
    }

    #[test]
    fn branch_to_entry_or_past_patch_is_accepted() {
        let code = [
            0x31, 0xC0, // xor eax, eax
            0xFF, 0xC0, // inc eax
            0x83, 0xF8, 0x10, // cmp eax, 0x10
            0x75, 0xF7, // jne 0x1000
            0x74, 0xFC, // je 0x1007
            0xC3, // ret
        ];
        let relocated = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap();
        assert_eq!(relocated.consumed, 7);
    }

    #[test]
    fn truncated_code_is_too_short() {
        let code = [0x55, 0x48, 0x89]; // push rbp; half of mov rbp, rsp
        let err = relocate(&code, 0x1000, 5, 0x2000).unwrap_err();
        assert!(matches!(
            err,
            HookError::FunctionTooShort {
                addr: 0x1000,
                len: 1,
                needed: 5
            }
        ));
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        let code = [0x90, 0x06]; // nop; push es (invalid in long mode)
        let err = relocate(&padded(&code), 0x1000, 5, 0x2000).unwrap_err();
        assert!(matches!(err, HookError::InvalidInstruction(0x1001)));
    }

    #[test]
    fn jump_encoding_depends_on_distance() {
        let near = jmp(0x1000, 0x2000);
        assert_eq!(near.len(), NEAR_JMP_LEN);
        assert_eq!(near[0], 0xE9);
        assert_eq!(i32::from_le_bytes(near[1..5].try_into().unwrap()), 0xFFB);

        let far = jmp(0x1000, 0x7FFF_0000_0000);
        assert_eq!(far.len(), FAR_JMP_LEN);
        assert_eq!(&far[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(far[6..].try_into().unwrap()),
            0x7FFF_0000_0000
        );
    }
}
