//! Instruction access service and the minimal MMIO decoder.
//!
//! The access service turns a guest program counter into a readable view
//! of the instruction bytes at that location, combining the guest paging
//! walker with the host-enforced second-level mapping. Two entry points
//! exist because instruction fetch during MMIO emulation must tolerate
//! guest translation states a regular read would not: [`map_inst`] exposes
//! whatever a single mapping provides, [`inst_bytes`] pulls the full
//! requested count through guest translation freshly, page by page.
//!
//! The decoder is deliberately not a general instruction decoder: it
//! understands exactly the register/immediate MOV forms guests use to
//! access device memory, and fails closed on anything else.

use axerrno::{ax_err, AxResult};

use crate::addr::{AccessWidth, GuestVirtAddr};
use crate::hal::AxCellHal;
use crate::paging::GuestPagingStructures;

/// The longest legal x86 instruction.
pub const MAX_INST_LEN: usize = 15;

/// A bounded view of guest instruction bytes.
#[derive(Debug, Clone, Copy)]
pub struct InstBytes {
    buf: [u8; MAX_INST_LEN],
    len: usize,
}

impl InstBytes {
    /// The bytes actually fetched.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of bytes available.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes are available.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Returns the instruction bytes available at `pc` within one guest
/// mapping, without any fault-style handling of not-yet-present memory.
///
/// On success at least one byte is returned; the count may be less than
/// `want` when the mapping ends first. On failure the count is
/// unspecified.
pub fn map_inst<H: AxCellHal>(
    pg: &GuestPagingStructures,
    pc: GuestVirtAddr,
    want: usize,
    hal: &H,
) -> AxResult<InstBytes> {
    let want = want.min(MAX_INST_LEN);
    if want == 0 {
        return ax_err!(InvalidInput, "zero-length instruction fetch");
    }
    let (gpa, remaining) = pg.walk(pc, hal)?;
    let avail = want.min(remaining);
    let mut out = InstBytes {
        buf: [0; MAX_INST_LEN],
        len: avail,
    };
    hal.read_guest_phys(gpa, &mut out.buf[..avail])?;
    Ok(out)
}

/// Pulls exactly `want` instruction bytes at `pc` through guest
/// translation, re-walking at every mapping boundary.
///
/// Used from the MMIO handler's decode step, where the instruction may
/// straddle two differently-backed mappings. Fails unless the full
/// requested count is reachable.
pub fn inst_bytes<H: AxCellHal>(
    pg: &GuestPagingStructures,
    pc: GuestVirtAddr,
    want: usize,
    hal: &H,
) -> AxResult<InstBytes> {
    let want = want.min(MAX_INST_LEN);
    if want == 0 {
        return ax_err!(InvalidInput, "zero-length instruction fetch");
    }
    let mut out = InstBytes {
        buf: [0; MAX_INST_LEN],
        len: want,
    };
    let mut fetched = 0;
    while fetched < want {
        let cursor = pc + fetched;
        let (gpa, remaining) = pg.walk(cursor, hal)?;
        let chunk = (want - fetched).min(remaining);
        hal.read_guest_phys(gpa, &mut out.buf[fetched..fetched + chunk])?;
        fetched += chunk;
    }
    Ok(out)
}

/// The source (for writes) or destination (for reads) operand of a decoded
/// MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOperand {
    /// A general-purpose register, in encoding order.
    Register(usize),
    /// An immediate value (writes only).
    Immediate(u64),
}

/// A decoded MMIO-faulting instruction.
#[derive(Debug, Clone, Copy)]
pub struct MmioInstruction {
    /// Total instruction length in bytes, for the skip.
    pub len: u8,
    /// Operand width of the memory access.
    pub width: AccessWidth,
    /// Whether the instruction writes memory.
    pub is_write: bool,
    /// The register or immediate operand.
    pub operand: MmioOperand,
}

/// Decodes the MOV forms used for device memory access.
///
/// Supported: `88/89` (store), `8A/8B` (load), `C6/C7` (store immediate),
/// with optional `66` operand-size and REX prefixes. The memory operand's
/// effective address is not computed; it is taken from the hardware-
/// reported fault address.
pub fn decode_mmio(bytes: &[u8]) -> AxResult<MmioInstruction> {
    let mut pos = 0;
    let mut op_size = 4usize;
    let mut saw_rex = false;
    let mut rex_w = false;
    let mut rex_r = 0usize;
    let mut rex_b = 0usize;
    let mut rex_x = 0usize;

    loop {
        let b = *next(bytes, pos)?;
        match b {
            0x66 => op_size = 2,
            0x40..=0x4f => {
                saw_rex = true;
                rex_w = b & 0x08 != 0;
                rex_r = ((b >> 2) & 1) as usize;
                rex_x = ((b >> 1) & 1) as usize;
                rex_b = (b & 1) as usize;
            }
            _ => break,
        }
        pos += 1;
    }
    let _ = (rex_b, rex_x); // only address encoding, which hardware resolves

    let opcode = *next(bytes, pos)?;
    pos += 1;
    let (is_write, width, has_imm) = match opcode {
        0x88 => (true, AccessWidth::Byte, false),
        0x89 => (true, reg_width(op_size, rex_w), false),
        0x8a => (false, AccessWidth::Byte, false),
        0x8b => (false, reg_width(op_size, rex_w), false),
        0xc6 => (true, AccessWidth::Byte, true),
        0xc7 => (true, reg_width(op_size, rex_w), true),
        _ => return ax_err!(Unsupported, "unsupported MMIO instruction"),
    };

    let modrm = *next(bytes, pos)?;
    pos += 1;
    let mode = modrm >> 6;
    let reg = ((modrm >> 3) & 7) as usize | (rex_r << 3);
    let rm = modrm & 7;
    if mode == 3 {
        return ax_err!(InvalidData, "MMIO instruction without memory operand");
    }
    if has_imm && reg & 7 != 0 {
        return ax_err!(Unsupported, "unsupported MMIO instruction");
    }
    // Without a REX prefix, byte-width reg encodings 4-7 name the legacy
    // high-byte registers AH/CH/DH/BH, not SPL/BPL/SIL/DIL.
    if !has_imm && width == AccessWidth::Byte && !saw_rex && reg >= 4 {
        return ax_err!(Unsupported, "high-byte register operand");
    }

    // ModRM addressing tail: SIB byte, then displacement.
    let mut sib_base = None;
    if rm == 4 {
        sib_base = Some(*next(bytes, pos)? & 7);
        pos += 1;
    }
    let disp = match mode {
        0 => {
            if rm == 5 || sib_base == Some(5) {
                4
            } else {
                0
            }
        }
        1 => 1,
        _ => 4,
    };
    pos += disp;

    let operand = if has_imm {
        let imm_len = width.size().min(4);
        let mut raw = [0u8; 4];
        for (i, slot) in raw.iter_mut().enumerate().take(imm_len) {
            *slot = *next(bytes, pos + i)?;
        }
        pos += imm_len;
        let imm = u32::from_le_bytes(raw);
        // MOV r/m64, imm32 sign-extends.
        let value = if width == AccessWidth::Qword {
            imm as i32 as i64 as u64
        } else {
            imm as u64 & width.mask()
        };
        MmioOperand::Immediate(value)
    } else {
        MmioOperand::Register(reg)
    };

    if pos > bytes.len() {
        return ax_err!(UnexpectedEof, "truncated MMIO instruction");
    }
    Ok(MmioInstruction {
        len: pos as u8,
        width,
        is_write,
        operand,
    })
}

fn reg_width(op_size: usize, rex_w: bool) -> AccessWidth {
    if rex_w {
        AccessWidth::Qword
    } else if op_size == 2 {
        AccessWidth::Word
    } else {
        AccessWidth::Dword
    }
}

fn next(bytes: &[u8], pos: usize) -> AxResult<&u8> {
    match bytes.get(pos) {
        Some(b) => Ok(b),
        None => ax_err!(UnexpectedEof, "truncated MMIO instruction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_store_dword() {
        // mov [rax], ecx
        let inst = decode_mmio(&[0x89, 0x08]).unwrap();
        assert!(inst.is_write);
        assert_eq!(inst.width, AccessWidth::Dword);
        assert_eq!(inst.operand, MmioOperand::Register(1));
        assert_eq!(inst.len, 2);
    }

    #[test]
    fn decode_load_qword_rex() {
        // mov rdx, [rbx]
        let inst = decode_mmio(&[0x48, 0x8b, 0x13]).unwrap();
        assert!(!inst.is_write);
        assert_eq!(inst.width, AccessWidth::Qword);
        assert_eq!(inst.operand, MmioOperand::Register(2));
        assert_eq!(inst.len, 3);
    }

    #[test]
    fn decode_store_word_prefix() {
        // mov word [rdi], si
        let inst = decode_mmio(&[0x66, 0x89, 0x37]).unwrap();
        assert_eq!(inst.width, AccessWidth::Word);
        assert_eq!(inst.operand, MmioOperand::Register(6));
        assert_eq!(inst.len, 3);
    }

    #[test]
    fn decode_store_byte_extended_reg() {
        // mov [rax], r9b
        let inst = decode_mmio(&[0x44, 0x88, 0x08]).unwrap();
        assert_eq!(inst.width, AccessWidth::Byte);
        assert_eq!(inst.operand, MmioOperand::Register(9));
    }

    #[test]
    fn decode_store_immediate() {
        // mov dword [rax], 0xdeadbeef
        let inst = decode_mmio(&[0xc7, 0x00, 0xef, 0xbe, 0xad, 0xde]).unwrap();
        assert!(inst.is_write);
        assert_eq!(inst.width, AccessWidth::Dword);
        assert_eq!(inst.operand, MmioOperand::Immediate(0xdead_beef));
        assert_eq!(inst.len, 6);
    }

    #[test]
    fn decode_immediate_sign_extends_to_qword() {
        // mov qword [rax], -1
        let inst = decode_mmio(&[0x48, 0xc7, 0x00, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(inst.operand, MmioOperand::Immediate(u64::MAX));
        assert_eq!(inst.len, 7);
    }

    #[test]
    fn decode_sib_and_displacement_length() {
        // mov [rsp + 8], eax
        let inst = decode_mmio(&[0x89, 0x44, 0x24, 0x08]).unwrap();
        assert_eq!(inst.len, 4);
        assert_eq!(inst.operand, MmioOperand::Register(0));
    }

    #[test]
    fn decode_rip_relative_disp32() {
        // mov [rip + 0x10], ecx
        let inst = decode_mmio(&[0x89, 0x0d, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(inst.len, 6);
    }

    #[test]
    fn decode_rejects_high_byte_registers() {
        // mov ah, [rax]: reg 4 without REX is AH, not the low byte of RSP
        assert!(decode_mmio(&[0x8a, 0x20]).is_err());
        // mov [rax], bh
        assert!(decode_mmio(&[0x88, 0x38]).is_err());
    }

    #[test]
    fn decode_rex_byte_register_is_spl() {
        // mov sil, [rax]: with a REX prefix reg 6 is SIL
        let inst = decode_mmio(&[0x40, 0x8a, 0x30]).unwrap();
        assert_eq!(inst.width, AccessWidth::Byte);
        assert_eq!(inst.operand, MmioOperand::Register(6));
    }

    #[test]
    fn decode_rejects_register_operand() {
        // mov eax, ecx has no memory operand
        assert!(decode_mmio(&[0x89, 0xc8]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert!(decode_mmio(&[0x0f, 0x6f, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        assert!(decode_mmio(&[0x89]).is_err());
        assert!(decode_mmio(&[0xc7, 0x00, 0xef]).is_err());
    }
}
