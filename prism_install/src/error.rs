//! Installation errors and result codes.
//!
//! Every failure is an [`InstallError`]; callers that only need the coarse
//! outcome ask it for its [`InstallResult`].

use std::fmt;

use thiserror::Error;

use crate::buffer::Section;
use crate::code::{InvokeKind, MarkId, ValueKind, VirtualObjectId};
use crate::config::{Architecture, ConfigError};
use crate::dependencies::Dependency;
use crate::runtime::{AllocError, RuntimeError};

// =============================================================================
// Result Codes
// =============================================================================

/// Coarse outcome of an installation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum InstallResult {
    Success = 0,
    DependencyInvalidated = 1,
    CodeCacheFull = 2,
    CodeTooLarge = 3,
    PendingException = 4,
    Bailout = 5,
}

impl InstallResult {
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, InstallResult::Success)
    }

    /// Whether trying again later (with the same descriptor) could succeed.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, InstallResult::CodeCacheFull)
    }
}

impl fmt::Display for InstallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallResult::Success => "success",
            InstallResult::DependencyInvalidated => "dependencies invalidated",
            InstallResult::CodeCacheFull => "code cache full",
            InstallResult::CodeTooLarge => "code too large",
            InstallResult::PendingException => "pending exception",
            InstallResult::Bailout => "bailout",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum InstallError {
    // -------------------------------------------------------------------------
    // Malformed input
    // -------------------------------------------------------------------------
    #[error("malformed descriptor: {0}")]
    Decode(#[from] bincode::Error),

    #[error("invalid installer configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("word kind {0} does not match the target word size")]
    WordKindMismatch(ValueKind),

    #[error("site at pc {pc:#x} comes after a site at pc {previous:#x}")]
    SiteOutOfOrder { pc: u32, previous: u32 },

    #[error("pc offset {pc:#x} lies outside the {size}-byte instruction section")]
    PcOutOfBounds { pc: u32, size: u32 },

    #[error("data offset {offset:#x} points outside data section of {size} bytes")]
    DataOffsetOutOfBounds { offset: u32, size: u32 },

    #[error("{width}-byte data section patch at {offset:#x} overruns data section of {size} bytes")]
    DataPatchOutOfBounds { offset: u32, width: u32, size: u32 },

    #[error("data section alignment {0} is not a power of two")]
    InvalidDataAlignment(u32),

    #[error("invalid constant in data section: {0}")]
    InvalidDataSectionConstant(&'static str),

    #[error("compressed reference at pc {pc:#x} but compressed {what} are disabled")]
    CompressionDisabled { pc: u32, what: &'static str },

    #[error("unexpected compressed method pointer at pc {pc:#x}")]
    CompressedMethodPointer { pc: u32 },

    #[error("entry mark {mark:?} at pc {pc:#x} was already set")]
    DuplicateEntryMark { mark: MarkId, pc: u32 },

    #[error("mark {mark:?} at pc {pc:#x} is not supported on {arch}")]
    UnsupportedMark { mark: MarkId, pc: u32, arch: Architecture },

    #[error("invoke mark at pc {pc:#x} while the mark at pc {pending:#x} is still pending")]
    DuplicateInvokeMark { pc: u32, pending: u32 },

    #[error("call at pc {pc:#x} has no pending invoke mark")]
    MissingInvokeMark { pc: u32 },

    #[error("call at pc {pc:#x} does not follow its invoke mark at pc {mark_pc:#x}")]
    StaleInvokeMark { pc: u32, mark_pc: u32 },

    #[error("invoke mark at pc {mark_pc:#x} was never consumed by a call")]
    DanglingInvokeMark { mark_pc: u32 },

    #[error("{kind:?} invoke at pc {pc:#x} does not match the callee (static: {is_static})")]
    InvokeKindMismatch { pc: u32, kind: InvokeKind, is_static: bool },

    #[error("debug info expected at {what} at pc {pc:#x}")]
    MissingDebugInfo { pc: u32, what: &'static str },

    #[error("OSR compilation at bci {entry_bci} has no OSR entry mark")]
    MissingOsrEntry { entry_bci: i32 },

    #[error("stub code cannot carry assumptions")]
    AssumptionsOnStub,

    #[error("unsupported instruction for {context} at pc {pc:#x}")]
    UnsupportedInstruction { pc: u32, context: &'static str },

    #[error("displacement {displacement:#x} at pc {pc:#x} does not fit its operand")]
    DisplacementOutOfRange { pc: u32, displacement: i64 },

    #[error("displacement {displacement:#x} at pc {pc:#x} is not suitably aligned")]
    MisalignedDisplacement { pc: u32, displacement: i64 },

    #[error("value {value:#x} at pc {pc:#x} does not fit the {bits}-bit operand")]
    ImmediateOverflow { pc: u32, value: u64, bits: u32 },

    #[error("{len}-byte access at {offset:#x} overruns the {section:?} section")]
    BufferOverrun {
        section: Section,
        offset: u32,
        len: u32,
    },

    #[error("invalid register number {0}")]
    InvalidRegister(u16),

    #[error("stack slot {offset} with frame size {frame_size} is out of range")]
    StackSlotOutOfRange { offset: i32, frame_size: u32 },

    #[error("invalid deopt rescue slot: {0}")]
    InvalidDeoptRescueSlot(&'static str),

    #[error("invalid frame at bci {bci}: {reason}")]
    InvalidFrame { bci: i32, reason: String },

    #[error("unexpected value in scope: {value} for a {kind} slot")]
    UnexpectedValue { kind: ValueKind, value: String },

    #[error("unknown virtual object id {0}")]
    UnknownVirtualObject(VirtualObjectId),

    #[error("duplicate virtual object id {0}")]
    DuplicateVirtualObject(VirtualObjectId),

    #[error("virtual object {id} is malformed: {reason}")]
    InvalidVirtualObject {
        id: VirtualObjectId,
        reason: &'static str,
    },

    #[error("invalid monitor: {0}")]
    InvalidMonitor(&'static str),

    #[error("reference map frame size {map} exceeds total frame size {frame}")]
    ReferenceMapFrameTooLarge { map: u32, frame: u32 },

    #[error("invalid reference size {0}")]
    InvalidReferenceSize(u8),

    #[error("conflicting oop map entries for {slot} at pc {pc:#x}")]
    ConflictingOopMapEntry { pc: u32, slot: String },

    #[error("debug info at pc {pc:#x} recorded after pc {previous:#x}")]
    DebugInfoOutOfOrder { pc: u32, previous: u32 },

    #[error("comment at {pc:#x} lies outside the {size}-byte instruction section")]
    CommentOutOfBounds { pc: u32, size: u32 },

    // -------------------------------------------------------------------------
    // Resource exhaustion
    // -------------------------------------------------------------------------
    #[error("code size {size} exceeds the limit of {limit} bytes")]
    CodeTooLarge { size: u64, limit: u32 },

    #[error("stub space exhausted: {requested} bytes requested, {available} available")]
    StubSpaceExceeded { requested: u32, available: u32 },

    #[error(transparent)]
    Alloc(#[from] AllocError),

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------
    #[error("dependency no longer holds: {0:?}")]
    DependencyInvalidated(Dependency),

    // -------------------------------------------------------------------------
    // Runtime callbacks
    // -------------------------------------------------------------------------
    #[error("runtime raised {0}")]
    PendingException(#[from] RuntimeError),
}

impl InstallError {
    /// The result code reported for this failure.
    pub fn result(&self) -> InstallResult {
        match self {
            InstallError::CodeTooLarge { .. } | InstallError::StubSpaceExceeded { .. } => {
                InstallResult::CodeTooLarge
            }
            InstallError::Alloc(AllocError::CacheFull { .. }) => InstallResult::CodeCacheFull,
            InstallError::DependencyInvalidated(_) => InstallResult::DependencyInvalidated,
            InstallError::PendingException(_) => InstallResult::PendingException,
            _ => InstallResult::Bailout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::ClassHandle;

    #[test]
    fn test_result_mapping() {
        assert_eq!(
            InstallError::CodeTooLarge {
                size: 10,
                limit: 5
            }
            .result(),
            InstallResult::CodeTooLarge
        );
        assert_eq!(
            InstallError::StubSpaceExceeded {
                requested: 16,
                available: 0
            }
            .result(),
            InstallResult::CodeTooLarge
        );
        assert_eq!(
            InstallError::Alloc(AllocError::CacheFull {
                requested: 64,
                available: 0
            })
            .result(),
            InstallResult::CodeCacheFull
        );
        assert_eq!(
            InstallError::DependencyInvalidated(Dependency::LeafType {
                context: ClassHandle(1)
            })
            .result(),
            InstallResult::DependencyInvalidated
        );
        assert_eq!(
            InstallError::PendingException(RuntimeError::new("LinkageError", "boom")).result(),
            InstallResult::PendingException
        );
        assert_eq!(
            InstallError::MissingInvokeMark { pc: 4 }.result(),
            InstallResult::Bailout
        );
    }

    #[test]
    fn test_messages_name_the_offending_offset() {
        let err = InstallError::DataOffsetOutOfBounds { offset: 16, size: 16 };
        assert_eq!(
            err.to_string(),
            "data offset 0x10 points outside data section of 16 bytes"
        );
        assert_eq!(
            InstallError::InvalidRegister(99).to_string(),
            "invalid register number 99"
        );
    }

    #[test]
    fn test_only_cache_full_is_transient() {
        assert!(InstallResult::CodeCacheFull.is_transient());
        assert!(!InstallResult::Bailout.is_transient());
        assert!(InstallResult::Success.is_success());
    }
}
