//! x86-64 relocation backend.
//!
//! Register numbering: 0-15 are `rax`..`r15`, 16-47 are `xmm0`..`xmm31`.

mod decode;

use decode::{Insn, MAX_INSN_LEN, decode};

use super::{Backend, ImmWidth, MachineReg, Relocation, check_unsigned, displacement};
use crate::buffer::{CodeBuffer, STUB_ALIGNMENT, Section, align_up};
use crate::config::Architecture;
use crate::error::InstallError;

/// Number of general-purpose registers.
const NUM_GPRS: u16 = 16;
/// Number of vector registers (with AVX-512).
const NUM_XMMS: u16 = 32;

/// `mov rbx, imm64` (method slot) followed by `jmp rel32` (resolution target).
const STATIC_CALL_STUB: [u8; 15] = [
    0x48, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0, // mov rbx, 0
    0xE9, 0xFB, 0xFF, 0xFF, 0xFF, // jmp self
];

#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64Backend;

fn decode_at(buf: &CodeBuffer, pc: u32, context: &'static str) -> Result<Insn, InstallError> {
    let code = buf.read_available(Section::Instructions, pc, MAX_INSN_LEN as u32);
    decode(code).ok_or(InstallError::UnsupportedInstruction { pc, context })
}

/// Write a 32-bit displacement from the end of `insn` to `target`.
fn write_disp32(
    buf: &mut CodeBuffer,
    pc: u32,
    insn: &Insn,
    operand_offset: u8,
    target: u64,
) -> Result<(), InstallError> {
    let next = buf.address_of(Section::Instructions, pc + insn.len as u32);
    let disp = displacement(target, next);
    let disp32 = i32::try_from(disp).map_err(|_| InstallError::DisplacementOutOfRange {
        pc,
        displacement: disp,
    })?;
    buf.patch(
        Section::Instructions,
        pc + operand_offset as u32,
        &disp32.to_le_bytes(),
    )
}

impl Backend for Amd64Backend {
    fn arch(&self) -> Architecture {
        Architecture::Amd64
    }

    fn decode_register(&self, number: u16) -> Result<MachineReg, InstallError> {
        match number {
            n if n < NUM_GPRS => Ok(MachineReg::gpr(n as u8)),
            n if n < NUM_GPRS + NUM_XMMS => Ok(MachineReg::fpr((n - NUM_GPRS) as u8)),
            n => Err(InstallError::InvalidRegister(n)),
        }
    }

    fn static_call_stub_size(&self) -> u32 {
        align_up(STATIC_CALL_STUB.len() as u64, STUB_ALIGNMENT as u64) as u32
    }

    fn call_return_offset(&self, buf: &CodeBuffer, pc: u32) -> Result<u32, InstallError> {
        let insn = decode_at(buf, pc, "call site")?;
        let next = pc + insn.len as u32;
        if insn.is_call_rel32()
            || insn.is_jmp_rel32()
            || insn.is_indirect_call()
            || insn.is_indirect_jump()
        {
            return Ok(next);
        }
        if insn.is_mov_imm64() {
            let call = decode_at(buf, next, "call site")?;
            if call.is_indirect_call() || call.is_indirect_jump() {
                return Ok(next + call.len as u32);
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
        let insn = decode_at(buf, pc, "call")?;
        if insn.is_call_rel32() || insn.is_jmp_rel32() || insn.is_jcc_rel32() {
            if !direct {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "indirect call",
                });
            }
            if let Some(rel) = insn.rel32() {
                write_disp32(buf, pc, &insn, rel.offset, dest)?;
                return Ok(None);
            }
        }
        if insn.is_mov_imm64() {
            if direct {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "direct call",
                });
            }
            if let Some(imm) = insn.imm {
                buf.write_u64(Section::Instructions, pc + imm.offset as u32, dest)?;
                return Ok(None);
            }
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
        let insn = decode_at(buf, pc, "immediate")?;
        let imm = insn.imm.ok_or(InstallError::UnsupportedInstruction {
            pc,
            context: "immediate",
        })?;
        match (width, imm.size) {
            (ImmWidth::Narrow, 4) | (ImmWidth::Wide, 8) | (ImmWidth::Any, _) => {}
            (ImmWidth::Narrow, _) => {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "narrow immediate",
                });
            }
            (ImmWidth::Wide, _) => {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "wide immediate",
                });
            }
        }
        check_unsigned(pc, value, imm.size as u32 * 8)?;
        buf.patch(
            Section::Instructions,
            pc + imm.offset as u32,
            &value.to_le_bytes()[..imm.size as usize],
        )
    }

    fn patch_pc_relative(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        target: u64,
    ) -> Result<(), InstallError> {
        let insn = decode_at(buf, pc, "pc-relative reference")?;
        match insn.disp {
            Some(disp) if insn.rip_relative => write_disp32(buf, pc, &insn, disp.offset, target),
            _ => Err(InstallError::UnsupportedInstruction {
                pc,
                context: "pc-relative reference",
            }),
        }
    }

    fn patch_shift(&self, buf: &mut CodeBuffer, pc: u32, shift: u8) -> Result<(), InstallError> {
        self.patch_immediate(buf, pc, shift as u64, ImmWidth::Any)
    }

    fn patch_near_poll(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        polling_page: u64,
    ) -> Result<bool, InstallError> {
        let insn = decode_at(buf, pc, "poll")?;
        let disp = match insn.disp {
            Some(disp) if insn.rip_relative => disp,
            _ => {
                return Err(InstallError::UnsupportedInstruction {
                    pc,
                    context: "poll",
                });
            }
        };
        // The emitted displacement is an offset into the polling page.
        let existing = buf.read_u32(Section::Instructions, pc + disp.offset as u32)? as i32;
        let target = polling_page.wrapping_add_signed(existing as i64);
        write_disp32(buf, pc, &insn, disp.offset, target)?;
        Ok(true)
    }

    fn emit_static_call_stub(&self, buf: &mut CodeBuffer) -> Result<u32, InstallError> {
        let stub = buf.alloc_stub(STATIC_CALL_STUB.len() as u32)?;
        buf.patch(Section::Stubs, stub, &STATIC_CALL_STUB)?;
        Ok(stub)
    }
}

// =============================================================================
// Tests
// =============================================================================
