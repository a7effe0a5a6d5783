//! Minimal x86-64 instruction decoder.
//!
//! Only finds instruction length and where the displacement, immediate and
//! branch operands sit. It covers the general-purpose and SSE forms the
//! compiler emits around patch sites; anything else decodes to `None`.

/// Longest legal x86 instruction.
pub(super) const MAX_INSN_LEN: usize = 15;

/// Byte range of an operand, relative to the instruction start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Operand {
    pub offset: u8,
    pub size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Opcode {
    One(u8),
    /// `0F xx`
    Two(u8),
    /// `0F 38 xx` / `0F 3A xx`
    Three(u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Insn {
    pub len: u8,
    pub rex: u8,
    pub opcode: Opcode,
    pub modrm: Option<u8>,
    pub disp: Option<Operand>,
    pub rip_relative: bool,
    pub imm: Option<Operand>,
    pub rel: Option<Operand>,
}

impl Insn {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    #[inline]
    fn modrm_reg(&self) -> Option<u8> {
        self.modrm.map(|m| (m >> 3) & 7)
    }

    /// `call rel32`
    #[inline]
    pub fn is_call_rel32(&self) -> bool {
        self.opcode == Opcode::One(0xE8)
    }

    /// `jmp rel32`
    #[inline]
    pub fn is_jmp_rel32(&self) -> bool {
        self.opcode == Opcode::One(0xE9)
    }

    /// `jcc rel32`
    #[inline]
    pub fn is_jcc_rel32(&self) -> bool {
        matches!(self.opcode, Opcode::Two(0x80..=0x8F))
    }

    /// `mov r64, imm64`
    #[inline]
    pub fn is_mov_imm64(&self) -> bool {
        matches!(self.opcode, Opcode::One(0xB8..=0xBF)) && self.rex_w()
    }

    /// `call r/m64`
    #[inline]
    pub fn is_indirect_call(&self) -> bool {
        self.opcode == Opcode::One(0xFF) && self.modrm_reg() == Some(2)
    }

    /// `jmp r/m64`
    #[inline]
    pub fn is_indirect_jump(&self) -> bool {
        self.opcode == Opcode::One(0xFF) && self.modrm_reg() == Some(4)
    }

    /// 32-bit branch displacement of a call, jump or conditional jump.
    #[inline]
    pub fn rel32(&self) -> Option<Operand> {
        self.rel.filter(|rel| rel.size == 4)
    }
}

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy)]
enum Form {
    Bare,
    Imm(u8),
    Rel(u8),
    ModRm { imm: u8 },
    /// `F6`/`F7`: immediate only for `test` (reg field 0 or 1).
    Group3 { imm: u8 },
}

fn one_byte_form(op: u8, rex_w: bool, operand_16: bool) -> Option<Form> {
    let imm_z = if operand_16 { 2 } else { 4 };
    Some(match op {
        0x00..=0x3F => match op & 7 {
            0..=3 => Form::ModRm { imm: 0 },
            4 => Form::Imm(1),
            5 => Form::Imm(imm_z),
            _ => return None,
        },
        0x50..=0x5F => Form::Bare,
        0x63 => Form::ModRm { imm: 0 },
        0x68 => Form::Imm(imm_z),
        0x69 => Form::ModRm { imm: imm_z },
        0x6A => Form::Imm(1),
        0x6B => Form::ModRm { imm: 1 },
        0x70..=0x7F => Form::Rel(1),
        0x80 | 0x83 | 0xC0 | 0xC1 | 0xC6 => Form::ModRm { imm: 1 },
        0x81 | 0xC7 => Form::ModRm { imm: imm_z },
        0x84..=0x8B | 0x8D | 0x8F | 0xD1 | 0xD3 | 0xFE | 0xFF => Form::ModRm { imm: 0 },
        0x90..=0x99 => Form::Bare,
        0xB0..=0xB7 => Form::Imm(1),
        0xB8..=0xBF => Form::Imm(if rex_w { 8 } else { imm_z }),
        0xC2 => Form::Imm(2),
        0xC3 | 0xC9 | 0xCC | 0xF4 => Form::Bare,
        0xE8 | 0xE9 => Form::Rel(4),
        0xEB => Form::Rel(1),
        0xF6 => Form::Group3 { imm: 1 },
        0xF7 => Form::Group3 { imm: imm_z },
        _ => return None,
    })
}

fn two_byte_form(op: u8) -> Option<Form> {
    Some(match op {
        0x05 | 0x0B | 0x31 | 0xA2 => Form::Bare,
        0x80..=0x8F => Form::Rel(4),
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => Form::ModRm { imm: 1 },
        0x10..=0x1F
        | 0x28..=0x2F
        | 0x40..=0x6F
        | 0x74..=0x76
        | 0x7E
        | 0x7F
        | 0x90..=0x9F
        | 0xA3
        | 0xA5
        | 0xAB
        | 0xAD
        | 0xAF
        | 0xB0..=0xBF
        | 0xC0
        | 0xC1
        | 0xC3
        | 0xC7
        | 0xD0..=0xFF => Form::ModRm { imm: 0 },
        _ => return None,
    })
}

/// Decode the instruction at the start of `code`.
pub(super) fn decode(code: &[u8]) -> Option<Insn> {
    let mut pos = 0usize;
    let mut operand_16 = false;

    while let Some(&byte) = code.get(pos) {
        match byte {
            0x66 => operand_16 = true,
            0x67 | 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x3E | 0x26 | 0x36 | 0x64 | 0x65 => {}
            _ => break,
        }
        pos += 1;
    }

    let mut rex = 0u8;
    if let Some(&byte) = code.get(pos) {
        if byte & 0xF0 == 0x40 {
            rex = byte;
            pos += 1;
        }
    }

    let first = *code.get(pos)?;
    pos += 1;
    let (opcode, form) = if first == 0x0F {
        let second = *code.get(pos)?;
        pos += 1;
        match second {
            0x38 | 0x3A => {
                let third = *code.get(pos)?;
                pos += 1;
                let imm = if second == 0x3A { 1 } else { 0 };
                (Opcode::Three(second, third), Form::ModRm { imm })
            }
            _ => (Opcode::Two(second), two_byte_form(second)?),
        }
    } else {
        (
            Opcode::One(first),
            one_byte_form(first, rex & 0x08 != 0, operand_16)?,
        )
    };

    let mut insn = Insn {
        len: 0,
        rex,
        opcode,
        modrm: None,
        disp: None,
        rip_relative: false,
        imm: None,
        rel: None,
    };

    let imm_size = match form {
        Form::Bare => 0,
        Form::Imm(size) => size,
        Form::Rel(size) => {
            insn.rel = Some(Operand {
                offset: pos as u8,
                size,
            });
            pos += size as usize;
            0
        }
        Form::ModRm { imm } | Form::Group3 { imm } => {
            let modrm = *code.get(pos)?;
            pos += 1;
            insn.modrm = Some(modrm);

            let mode = modrm >> 6;
            let rm = modrm & 7;
            let mut disp_size = match mode {
                1 => 1,
                2 => 4,
                _ => 0,
            };
            if mode != 3 {
                if rm == 4 {
                    let sib = *code.get(pos)?;
                    pos += 1;
                    if mode == 0 && sib & 7 == 5 {
                        disp_size = 4;
                    }
                } else if mode == 0 && rm == 5 {
                    disp_size = 4;
                    insn.rip_relative = true;
                }
            }
            if disp_size > 0 {
                insn.disp = Some(Operand {
                    offset: pos as u8,
                    size: disp_size,
                });
                pos += disp_size as usize;
            }

            match form {
                Form::Group3 { .. } if (modrm >> 3) & 7 >= 2 => 0,
                _ => imm,
            }
        }
    };

    if imm_size > 0 {
        insn.imm = Some(Operand {
            offset: pos as u8,
            size: imm_size,
        });
        pos += imm_size as usize;
    }

    if pos > code.len() || pos > MAX_INSN_LEN {
        return None;
    }
    insn.len = pos as u8;
    Some(insn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(offset: u8, size: u8) -> Option<Operand> {
        Some(Operand { offset, size })
    }

    #[test]
    fn test_branches() {
        let call = decode(&[0xE8, 0, 0, 0, 0]).unwrap();
        assert!(call.is_call_rel32());
        assert_eq!(call.len, 5);
        assert_eq!(call.rel32(), op(1, 4));

        let jcc = decode(&[0x0F, 0x84, 1, 2, 3, 4]).unwrap();
        assert!(jcc.is_jcc_rel32());
        assert_eq!(jcc.rel32(), op(2, 4));

        let short = decode(&[0xEB, 0x10]).unwrap();
        assert_eq!(short.rel, op(1, 1));
        assert_eq!(short.rel32(), None);
    }

    #[test]
    fn test_mov_immediates() {
        // mov rax, imm64
        let wide = decode(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(wide.is_mov_imm64());
        assert_eq!(wide.imm, op(2, 8));
        assert_eq!(wide.len, 10);

        // mov r10d, imm32
        let narrow = decode(&[0x41, 0xBA, 1, 2, 3, 4]).unwrap();
        assert!(!narrow.is_mov_imm64());
        assert_eq!(narrow.imm, op(2, 4));

        // mov dword [r8 + 8], imm32
        let store = decode(&[0x41, 0xC7, 0x40, 0x08, 1, 2, 3, 4]).unwrap();
        assert_eq!(store.disp, op(3, 1));
        assert_eq!(store.imm, op(4, 4));

        // cmp dword [rsi + 8], imm32
        let cmp = decode(&[0x81, 0x7E, 0x08, 1, 2, 3, 4]).unwrap();
        assert_eq!(cmp.imm, op(3, 4));
        assert_eq!(cmp.len, 7);
    }

    #[test]
    fn test_rip_relative_forms() {
        // mov rax, [rip + disp32]
        let load = decode(&[0x48, 0x8B, 0x05, 0, 0, 0, 0]).unwrap();
        assert!(load.rip_relative);
        assert_eq!(load.disp, op(3, 4));

        // test eax, [rip + disp32]
        let poll = decode(&[0x85, 0x05, 0, 0, 0, 0]).unwrap();
        assert!(poll.rip_relative);
        assert_eq!(poll.len, 6);

        // movsd xmm0, [rip + disp32]
        let movsd = decode(&[0xF2, 0x0F, 0x10, 0x05, 0, 0, 0, 0]).unwrap();
        assert!(movsd.rip_relative);
        assert_eq!(movsd.disp, op(4, 4));

        // [rbp + 0] with SIB-less disp8 is not rip-relative
        let local = decode(&[0x8B, 0x45, 0x00]).unwrap();
        assert!(!local.rip_relative);
        assert_eq!(local.disp, op(2, 1));
    }

    #[test]
    fn test_shift_and_group3() {
        // shr rax, 9
        let shr = decode(&[0x48, 0xC1, 0xE8, 0x09]).unwrap();
        assert_eq!(shr.imm, op(3, 1));

        // test eax, imm32 has an immediate; neg eax does not
        assert_eq!(decode(&[0xF7, 0xC0, 1, 0, 0, 0]).unwrap().imm, op(2, 4));
        assert_eq!(decode(&[0xF7, 0xD8]).unwrap().imm, None);
    }

    #[test]
    fn test_indirect_call_forms() {
        assert!(decode(&[0xFF, 0xD0]).unwrap().is_indirect_call());
        assert!(decode(&[0x41, 0xFF, 0xD3]).unwrap().is_indirect_call());
        assert!(decode(&[0xFF, 0xE0]).unwrap().is_indirect_jump());
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(decode(&[0xE8, 0, 0]).is_none());
        assert!(decode(&[0x48, 0xB8, 1, 2]).is_none());
        assert!(decode(&[]).is_none());
        assert!(decode(&[0x0F, 0x00, 0xC0]).is_none());
        // VEX is not handled
        assert!(decode(&[0xC5, 0xF8, 0x77]).is_none());
    }
}
