//! AArch64 relocation backend.
//!
//! Register numbering: 0-31 are `x0`..`x30`/`sp`, 32-63 are `v0`..`v31`.
//!
//! Direct branches reach +-128 MiB. A call whose target is further away is
//! redirected through a trampoline carved out of stub space:
//!
//! ```text
//! ldr x16, #8
//! br  x16
//! .quad target
//! ```

use super::{
    Backend, ImmWidth, MachineReg, RelocKind, Relocation, check_unsigned, displacement,
};
use crate::buffer::{CodeBuffer, Section};
use crate::config::Architecture;
use crate::error::InstallError;

// =============================================================================
// Encodings
// =============================================================================

const BRANCH_MASK: u32 = 0xFC00_0000;
const BL: u32 = 0x9400_0000;
const B: u32 = 0x1400_0000;

const B_COND_MASK: u32 = 0xFF00_0010;
const B_COND: u32 = 0x5400_0000;

const BR_MASK: u32 = 0xFFFF_FC1F;
const BLR: u32 = 0xD63F_0000;
const BR: u32 = 0xD61F_0000;

const MOV_WIDE_MASK: u32 = 0xFF80_0000;
const MOVZ_X: u32 = 0xD280_0000;
const MOVK_X: u32 = 0xF280_0000;
const MOVZ_W: u32 = 0x5280_0000;
const MOVK_W: u32 = 0x7280_0000;

const ADRP_MASK: u32 = 0x9F00_0000;
const ADRP: u32 = 0x9000_0000;

/// `add xd, xn, #imm12` with no shift.
const ADD_IMM_MASK: u32 = 0xFFC0_0000;
const ADD_X_IMM: u32 = 0x9100_0000;

/// `lsr xd, xn, #shift` (`ubfm xd, xn, #shift, #63`).
const LSR_X_MASK: u32 = 0xFFC0_FC00;
const LSR_X: u32 = 0xD340_FC00;

const NOP: u32 = 0xD503_201F;

/// `ldr x16, #8; br x16` followed by the 8-byte target.
const TRAMPOLINE: [u32; 2] = [0x5800_0050, 0xD61F_0200];
const TRAMPOLINE_SIZE: u32 = 16;

/// `ldr x12, #16; ldr x16, #20; br x16; nop` then method and target slots.
const STATIC_CALL_STUB: [u32; 4] = [0x5800_008C, 0x5800_00B0, 0xD61F_0200, NOP];
const STATIC_CALL_STUB_SIZE: u32 = 32;

/// Scale of an unsigned-offset load (`ldr xt/wt/dt/st/qt, [xn, #imm]`).
fn ldr_unsigned_scale(insn: u32) -> Option<u32> {
    match insn & 0xFFC0_0000 {
        0xF940_0000 | 0xFD40_0000 => Some(8),
        0xB940_0000 | 0xBD40_0000 => Some(4),
        0x3DC0_0000 => Some(16),
        _ => None,
    }
}

/// Whether `insn` is a pc-relative literal load.
fn is_ldr_literal(insn: u32) -> bool {
    matches!(
        insn & 0xFF00_0000,
        0x5800_0000 | 0x1800_0000 | 0x5C00_0000 | 0x1C00_0000 | 0x9C00_0000
    )
}

#[inline]
fn rd(insn: u32) -> u32 {
    insn & 0x1F
}

#[inline]
fn rn(insn: u32) -> u32 {
    (insn >> 5) & 0x1F
}

/// A `movz` followed by `movk`s filling successive 16-bit chunks of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MovSequence {
    rd: u32,
    count: u32,
}

impl MovSequence {
    #[inline]
    fn bits(self) -> u32 {
        16 * self.count
    }
}

fn read_insn(buf: &CodeBuffer, pc: u32) -> Result<u32, InstallError> {
    buf.read_u32(Section::Instructions, pc)
}

fn mov_sequence(buf: &CodeBuffer, pc: u32) -> Option<MovSequence> {
    let first = read_insn(buf, pc).ok()?;
    let (movk, max) = match first & MOV_WIDE_MASK {
        MOVZ_X => (MOVK_X, 4),
        MOVZ_W => (MOVK_W, 2),
        _ => return None,
    };
    if (first >> 21) & 3 != 0 {
        return None;
    }
    let mut count = 1;
    while count < max {
        match read_insn(buf, pc + 4 * count) {
            Ok(next)
                if next & MOV_WIDE_MASK == movk
                    && rd(next) == rd(first)
                    && (next >> 21) & 3 == count =>
            {
                count += 1
            }
            _ => break,
        }
    }
    Some(MovSequence {
        rd: rd(first),
        count,
    })
}

fn write_mov_sequence(
    buf: &mut CodeBuffer,
    pc: u32,
    seq: MovSequence,
    value: u64,
) -> Result<(), InstallError> {
    check_unsigned(pc, value, seq.bits())?;
    for i in 0..seq.count {
        let at = pc + 4 * i;
        let chunk = ((value >> (16 * i)) & 0xFFFF) as u32;
        let insn = read_insn(buf, at)?;
        buf.write_u32(Section::Instructions, at, (insn & !(0xFFFF << 5)) | (chunk << 5))?;
    }
    Ok(())
}

/// Encode a signed, word-aligned displacement into a `bits`-wide field at `shift`.
fn encode_branch(
    pc: u32,
    insn: u32,
    disp: i64,
    bits: u32,
    shift: u32,
) -> Result<u32, InstallError> {
    if disp % 4 != 0 {
        return Err(InstallError::MisalignedDisplacement {
            pc,
            displacement: disp,
        });
    }
    let words = disp >> 2;
    let limit = 1i64 << (bits - 1);
    if words < -limit || words >= limit {
        return Err(InstallError::DisplacementOutOfRange {
            pc,
            displacement: disp,
        });
    }
    let mask = ((1u32 << bits) - 1) << shift;
    Ok((insn & !mask) | (((words as u32) << shift) & mask))
}

#[inline]
fn branch_in_range(disp: i64) -> bool {
    disp % 4 == 0 && (-(1i64 << 27)..(1i64 << 27)).contains(&disp)
}

// =============================================================================
// Backend
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64Backend;

impl AArch64Backend {
    fn emit_trampoline(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        insn: u32,
        dest: u64,
    ) -> Result<Relocation, InstallError> {
        let stub = buf.alloc_stub(TRAMPOLINE_SIZE)?;
        buf.write_u32(Section::Stubs, stub, TRAMPOLINE[0])?;
        buf.write_u32(Section::Stubs, stub + 4, TRAMPOLINE[1])?;
        buf.write_u64(Section::Stubs, stub + 8, dest)?;

        let from = buf.address_of(Section::Instructions, pc);
        let disp = displacement(buf.address_of(Section::Stubs, stub), from);
        let patched = encode_branch(pc, insn, disp, 26, 0)?;
        buf.write_u32(Section::Instructions, pc, patched)?;
        Ok(Relocation::at_pc(pc, RelocKind::Trampoline { stub }))
    }
}

impl Backend for AArch64Backend {
    fn arch(&self) -> Architecture {
        Architecture::AArch64
    }

    fn decode_register(&self, number: u16) -> Result<MachineReg, InstallError> {
        match number {
            0..=31 => Ok(MachineReg::gpr(number as u8)),
            32..=63 => Ok(MachineReg::fpr((number - 32) as u8)),
            _ => Err(InstallError::InvalidRegister(number)),
        }
    }

    fn static_call_stub_size(&self) -> u32 {
        STATIC_CALL_STUB_SIZE
    }

    fn trampoline_size(&self) -> u32 {
        TRAMPOLINE_SIZE
    }

    fn call_return_offset(&self, buf: &CodeBuffer, pc: u32) -> Result<u32, InstallError> {
        let insn = read_insn(buf, pc)?;
        if matches!(insn & BRANCH_MASK, BL | B) || matches!(insn & BR_MASK, BLR | BR) {
            return Ok(pc + 4);
        }
        if let Some(seq) = mov_sequence(buf, pc) {
            let next = pc + 4 * seq.count;
            let call = read_insn(buf, next)?;
            if matches!(call & BR_MASK, BLR | BR) && rn(call) == seq.rd {
                return Ok(next + 4);
            }
        }
        Err(InstallError::UnsupportedInstruction {
            pc,
            context: "call site",
        })
    }

    fn patch_call(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        dest: u64,
        direct: bool,
    ) -> Result<Option<Relocation>, InstallError> {
        let insn = read_insn(buf, pc)?;
        let is_branch = matches!(insn & BRANCH_MASK, BL | B);
        let is_cond = insn & B_COND_MASK == B_COND;
        if (is_branch || is_cond) && !direct {
            return Err(InstallError::UnsupportedInstruction {
                pc,
                context: "indirect call",
            });
        }

        let from = buf.address_of(Section::Instructions, pc);
        let disp = displacement(dest, from);
        if is_branch {
            if branch_in_range(disp) {
                let patched = encode_branch(pc, insn, disp, 26, 0)?;
                buf.write_u32(Section::Instructions, pc, patched)?;
                return Ok(None);
            }
            return self.emit_trampoline(buf, pc, insn, dest).map(Some);
        }
        if is_cond {
            let patched = encode_branch(pc, insn, disp, 19, 5)?;
            buf.write_u32(Section::Instructions, pc, patched)?;
            return Ok(None);
        }

        if let Some(seq) = mov_sequence(buf, pc) {
            if direct {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "direct call",
                });
            }
            write_mov_sequence(buf, pc, seq, dest)?;
            return Ok(None);
        }
        Err(InstallError::UnsupportedInstruction { pc, context: "call" })
    }

    fn patch_immediate(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        value: u64,
        width: ImmWidth,
    ) -> Result<(), InstallError> {
        let seq = mov_sequence(buf, pc).ok_or(InstallError::UnsupportedInstruction {
            pc,
            context: "immediate",
        })?;
        match width {
            ImmWidth::Narrow if seq.bits() != 32 => Err(InstallError::UnsupportedInstruction {
                pc,
                context: "narrow immediate",
            }),
            ImmWidth::Wide if seq.bits() < 48 => Err(InstallError::UnsupportedInstruction {
                pc,
                context: "wide immediate",
            }),
            _ => write_mov_sequence(buf, pc, seq, value),
        }
    }

    fn patch_pc_relative(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        target: u64,
    ) -> Result<(), InstallError> {
        let insn = read_insn(buf, pc)?;
        let from = buf.address_of(Section::Instructions, pc);

        if insn & ADRP_MASK == ADRP {
            let pages = (target >> 12) as i64 - (from >> 12) as i64;
            if !(-(1i64 << 20)..(1i64 << 20)).contains(&pages) {
                return Err(InstallError::DisplacementOutOfRange {
                    pc,
                    displacement: pages << 12,
                });
            }
            let immlo = (pages & 3) as u32;
            let immhi = ((pages >> 2) & 0x7FFFF) as u32;
            let adrp = (insn & !((3 << 29) | (0x7FFFF << 5))) | (immlo << 29) | (immhi << 5);

            let next = read_insn(buf, pc + 4)?;
            let scale = if next & ADD_IMM_MASK == ADD_X_IMM {
                1
            } else {
                ldr_unsigned_scale(next).ok_or(InstallError::UnsupportedInstruction {
                    pc: pc + 4,
                    context: "page offset",
                })?
            };
            if rn(next) != rd(insn) {
                return Err(InstallError::UnsupportedInstruction {
                    pc: pc + 4,
                    context: "page offset",
                });
            }
            let low = (target & 0xFFF) as u32;
            if low % scale != 0 {
                return Err(InstallError::MisalignedDisplacement {
                    pc: pc + 4,
                    displacement: low as i64,
                });
            }
            let offset = (next & !(0xFFF << 10)) | ((low / scale) << 10);

            buf.write_u32(Section::Instructions, pc, adrp)?;
            buf.write_u32(Section::Instructions, pc + 4, offset)?;
            return Ok(());
        }

        if is_ldr_literal(insn) {
            let patched = encode_branch(pc, insn, displacement(target, from), 19, 5)?;
            return buf.write_u32(Section::Instructions, pc, patched);
        }

        Err(InstallError::UnsupportedInstruction {
            pc,
            context: "pc-relative reference",
        })
    }

    fn patch_shift(&self, buf: &mut CodeBuffer, pc: u32, shift: u8) -> Result<(), InstallError> {
        let insn = read_insn(buf, pc)?;
        if insn & LSR_X_MASK != LSR_X {
            return Err(InstallError::UnsupportedInstruction {
                pc,
                context: "shift",
            });
        }
        check_unsigned(pc, shift as u64, 6)?;
        buf.write_u32(
            Section::Instructions,
            pc,
            (insn & !(0x3F << 16)) | ((shift as u32) << 16),
        )
    }

    fn patch_near_poll(
        &self,
        _buf: &mut CodeBuffer,
        _pc: u32,
        _polling_page: u64,
    ) -> Result<bool, InstallError> {
        Ok(false)
    }

    fn emit_static_call_stub(&self, buf: &mut CodeBuffer) -> Result<u32, InstallError> {
        let stub = buf.alloc_stub(STATIC_CALL_STUB_SIZE)?;
        for (i, word) in STATIC_CALL_STUB.iter().enumerate() {
            buf.write_u32(Section::Stubs, stub + 4 * i as u32, *word)?;
        }
        buf.write_u64(Section::Stubs, stub + 16, 0)?;
        buf.write_u64(Section::Stubs, stub + 24, 0)?;
        Ok(stub)
    }
}

// =============================================================================
// Tests
// =============================================================================
