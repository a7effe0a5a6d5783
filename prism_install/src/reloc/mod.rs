//! Relocation engine.
//!
//! Rewrites operand bytes of already-emitted instructions so they reference
//! runtime-resolved targets, and records a relocation entry for each patch
//! so the runtime can find it again (GC, class unloading, call resolution).
//!
//! Each target architecture gets a [`Backend`]. A backend only ever
//! overwrites the operand bytes the original instruction reserved; a value
//! that does not fit is an error, never a truncation.

mod aarch64;
mod amd64;

pub use aarch64::AArch64Backend;
pub use amd64::Amd64Backend;

use std::fmt;

use rustc_hash::FxHashMap;

use crate::buffer::{CodeBuffer, Section};
use crate::code::{MetaspaceRef, ObjectHandle};
use crate::config::Architecture;
use crate::error::InstallError;

// =============================================================================
// Machine Registers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    General,
    Float,
}

/// A decoded machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineReg {
    pub class: RegisterClass,
    /// Hardware encoding within the class.
    pub encoding: u8,
}

impl MachineReg {
    #[inline]
    pub const fn gpr(encoding: u8) -> Self {
        Self {
            class: RegisterClass::General,
            encoding,
        }
    }

    #[inline]
    pub const fn fpr(encoding: u8) -> Self {
        Self {
            class: RegisterClass::Float,
            encoding,
        }
    }

    #[inline]
    pub const fn is_general(self) -> bool {
        matches!(self.class, RegisterClass::General)
    }
}

impl fmt::Display for MachineReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            RegisterClass::General => write!(f, "r{}", self.encoding),
            RegisterClass::Float => write!(f, "f{}", self.encoding),
        }
    }
}

// =============================================================================
// Relocation Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Call or jump into a runtime function.
    RuntimeCall,
    /// Statically bound call; `stub` is its interpreter-transfer stub.
    StaticCall { stub: u32 },
    /// Non-virtual call to an instance method.
    OptVirtualCall { stub: u32 },
    /// Inline-cached call; `ic_mark` is the pc of the invoke mark.
    VirtualCall { ic_mark: u32 },
    /// Interpreter-transfer stub belonging to the call at `call`.
    StaticStub { call: u32 },
    /// Branch through a trampoline in stub space.
    Trampoline { stub: u32 },
    /// Embedded heap reference (index into the code object's oop table).
    Oop { index: u32, narrow: bool },
    /// Embedded metadata reference (index into the metadata table).
    Metadata { index: u32, narrow: bool },
    /// Pc-relative reference into the constants section.
    SectionWord { data_offset: u32 },
    Poll,
    PollReturn,
    CardTable,
}

/// A patched location, section-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub section: Section,
    pub offset: u32,
    pub kind: RelocKind,
}

impl Relocation {
    #[inline]
    pub const fn new(section: Section, offset: u32, kind: RelocKind) -> Self {
        Self {
            section,
            offset,
            kind,
        }
    }

    #[inline]
    pub const fn at_pc(offset: u32, kind: RelocKind) -> Self {
        Self::new(Section::Instructions, offset, kind)
    }
}

/// Heap and metadata references embedded in the code, deduplicated.
#[derive(Debug, Clone, Default)]
pub struct ReferenceRecorder {
    oops: Vec<ObjectHandle>,
    oop_index: FxHashMap<ObjectHandle, u32>,
    metadata: Vec<MetaspaceRef>,
    metadata_index: FxHashMap<MetaspaceRef, u32>,
}

impl ReferenceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `object` in the oop table, adding it if new.
    pub fn record_oop(&mut self, object: ObjectHandle) -> u32 {
        if let Some(&index) = self.oop_index.get(&object) {
            return index;
        }
        let index = self.oops.len() as u32;
        self.oops.push(object);
        self.oop_index.insert(object, index);
        index
    }

    /// Index of `reference` in the metadata table, adding it if new.
    pub fn record_metadata(&mut self, reference: MetaspaceRef) -> u32 {
        if let Some(&index) = self.metadata_index.get(&reference) {
            return index;
        }
        let index = self.metadata.len() as u32;
        self.metadata.push(reference);
        self.metadata_index.insert(reference, index);
        index
    }

    #[inline]
    pub fn oops(&self) -> &[ObjectHandle] {
        &self.oops
    }

    #[inline]
    pub fn metadata(&self) -> &[MetaspaceRef] {
        &self.metadata
    }

    pub fn into_tables(self) -> (Vec<ObjectHandle>, Vec<MetaspaceRef>) {
        (self.oops, self.metadata)
    }
}

// =============================================================================
// Backend Interface
// =============================================================================

/// Operand width an immediate patch expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmWidth {
    /// 32-bit operand (compressed references).
    Narrow,
    /// Full machine word.
    Wide,
    /// Whatever the instruction reserved.
    Any,
}

/// Architecture-specific instruction patching.
///
/// All `pc` arguments are offsets into the instruction section.
pub trait Backend: Sync {
    fn arch(&self) -> Architecture;

    /// Map a descriptor register number to a machine register.
    fn decode_register(&self, number: u16) -> Result<MachineReg, InstallError>;

    /// Bytes reserved per interpreter-transfer stub (including alignment).
    fn static_call_stub_size(&self) -> u32;

    /// Bytes reserved per direct call for a possible branch trampoline.
    fn trampoline_size(&self) -> u32 {
        0
    }

    /// Offset of the instruction after the call sequence starting at `pc`.
    fn call_return_offset(&self, buf: &CodeBuffer, pc: u32) -> Result<u32, InstallError>;

    /// Point the call or jump at `pc` to `dest`.
    ///
    /// Returns the relocation for a trampoline if one had to be emitted.
    fn patch_call(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        dest: u64,
        direct: bool,
    ) -> Result<Option<Relocation>, InstallError>;

    /// Write `value` into the immediate operand of the instruction at `pc`.
    fn patch_immediate(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        value: u64,
        width: ImmWidth,
    ) -> Result<(), InstallError>;

    /// Make the pc-relative operand at `pc` address `target`.
    fn patch_pc_relative(&self, buf: &mut CodeBuffer, pc: u32, target: u64)
    -> Result<(), InstallError>;

    /// Patch the shift amount of the shift instruction at `pc`.
    fn patch_shift(&self, buf: &mut CodeBuffer, pc: u32, shift: u8) -> Result<(), InstallError>;

    /// Rebase a near safepoint poll at `pc` onto `polling_page`.
    ///
    /// Returns `false` when the architecture has no near polls.
    fn patch_near_poll(
        &self,
        buf: &mut CodeBuffer,
        pc: u32,
        polling_page: u64,
    ) -> Result<bool, InstallError>;

    /// Emit an interpreter-transfer stub; returns its offset in stub space.
    fn emit_static_call_stub(&self, buf: &mut CodeBuffer) -> Result<u32, InstallError>;
}

static AMD64: Amd64Backend = Amd64Backend;
static AARCH64: AArch64Backend = AArch64Backend;

/// The backend for `arch`.
pub fn backend_for(arch: Architecture) -> &'static dyn Backend {
    match arch {
        Architecture::Amd64 => &AMD64,
        Architecture::AArch64 => &AARCH64,
    }
}

/// Signed displacement from `from` to `to`.
#[inline]
pub(crate) fn displacement(to: u64, from: u64) -> i64 {
    to.wrapping_sub(from) as i64
}

/// Fail unless `value` fits in `bits` unsigned bits.
#[inline]
pub(crate) fn check_unsigned(pc: u32, value: u64, bits: u32) -> Result<(), InstallError> {
    if bits < 64 && value >> bits != 0 {
        return Err(InstallError::ImmediateOverflow { pc, value, bits });
    }
    Ok(())
}
