//! Sites: annotated offsets into the instruction stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DebugInfo, MethodHandle, MetaspaceRef, ObjectHandle};

// =============================================================================
// Marks
// =============================================================================

/// Mark ids as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
#[repr(i32)]
pub enum MarkId {
    VerifiedEntry = 1,
    UnverifiedEntry = 2,
    OsrEntry = 3,
    ExceptionHandlerEntry = 4,
    DeoptHandlerEntry = 5,
    InvokeInterface = 6,
    InvokeVirtual = 7,
    InvokeStatic = 8,
    InvokeSpecial = 9,
    InlineInvoke = 10,
    PollNear = 11,
    PollReturnNear = 12,
    PollFar = 13,
    PollReturnFar = 14,
    CardTableAddress = 15,
    CardTableShift = 16,
}

/// A mark id outside the known range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid mark id {0}")]
pub struct InvalidMarkId(pub i32);

impl TryFrom<i32> for MarkId {
    type Error = InvalidMarkId;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Ok(match raw {
            1 => MarkId::VerifiedEntry,
            2 => MarkId::UnverifiedEntry,
            3 => MarkId::OsrEntry,
            4 => MarkId::ExceptionHandlerEntry,
            5 => MarkId::DeoptHandlerEntry,
            6 => MarkId::InvokeInterface,
            7 => MarkId::InvokeVirtual,
            8 => MarkId::InvokeStatic,
            9 => MarkId::InvokeSpecial,
            10 => MarkId::InlineInvoke,
            11 => MarkId::PollNear,
            12 => MarkId::PollReturnNear,
            13 => MarkId::PollFar,
            14 => MarkId::PollReturnFar,
            15 => MarkId::CardTableAddress,
            16 => MarkId::CardTableShift,
            _ => return Err(InvalidMarkId(raw)),
        })
    }
}

impl From<MarkId> for i32 {
    #[inline]
    fn from(id: MarkId) -> i32 {
        id as i32
    }
}

impl MarkId {
    /// The invoke kind an invoke mark announces for the next call.
    #[inline]
    pub const fn invoke_kind(self) -> Option<InvokeKind> {
        match self {
            MarkId::InvokeInterface => Some(InvokeKind::Interface),
            MarkId::InvokeVirtual => Some(InvokeKind::Virtual),
            MarkId::InvokeStatic => Some(InvokeKind::Static),
            MarkId::InvokeSpecial => Some(InvokeKind::Special),
            MarkId::InlineInvoke => Some(InvokeKind::Inline),
            _ => None,
        }
    }

    /// Whether the next call needs a stub that transfers to the interpreter.
    #[inline]
    pub const fn needs_static_call_stub(self) -> bool {
        matches!(self, MarkId::InvokeStatic | MarkId::InvokeSpecial)
    }
}

/// How a Java method call will be bound at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Interface,
    Virtual,
    Static,
    Special,
    /// Call to an intrinsic expanded by the compiler; nothing to bind.
    Inline,
}

// =============================================================================
// Sites
// =============================================================================

/// A single annotated offset into the instruction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub pc_offset: u32,
    pub kind: SiteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SiteKind {
    Safepoint(DebugInfo),
    Infopoint {
        debug_info: DebugInfo,
        reason: InfopointReason,
    },
    Call(CallSite),
    DataPatch(Reference),
    Mark(MarkId),
    ExceptionHandler {
        handler_pc: u32,
    },
}

/// Why the compiler recorded an infopoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfopointReason {
    Safepoint,
    Call,
    ImplicitException,
    MethodStart,
    MethodEnd,
    BytecodePosition,
}

impl InfopointReason {
    /// Reasons whose infopoints need a full frame and an oop map.
    #[inline]
    pub const fn is_safepoint(self) -> bool {
        matches!(
            self,
            InfopointReason::Safepoint | InfopointReason::ImplicitException
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    pub target: CallTarget,
    /// Direct branch (`call rel32`, `bl`) rather than a register-indirect sequence.
    pub direct: bool,
    pub debug_info: Option<DebugInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    Method(MethodHandle),
    /// Runtime function at a fixed address.
    Foreign(u64),
    /// Target computed at run time; nothing to patch.
    Indirect,
}

/// What a data patch refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reference {
    Constant {
        constant: PatchConstant,
        compressed: bool,
    },
    /// Byte offset into the data section.
    DataSection(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchConstant {
    Object(ObjectHandle),
    Metaspace(MetaspaceRef),
}

impl Site {
    pub fn safepoint(pc_offset: u32, debug_info: DebugInfo) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::Safepoint(debug_info),
        }
    }

    pub fn infopoint(pc_offset: u32, debug_info: DebugInfo, reason: InfopointReason) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::Infopoint { debug_info, reason },
        }
    }

    pub fn call(
        pc_offset: u32,
        target: CallTarget,
        direct: bool,
        debug_info: Option<DebugInfo>,
    ) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::Call(CallSite {
                target,
                direct,
                debug_info,
            }),
        }
    }

    pub fn data_patch(pc_offset: u32, reference: Reference) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::DataPatch(reference),
        }
    }

    pub fn mark(pc_offset: u32, id: MarkId) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::Mark(id),
        }
    }

    pub fn exception_handler(pc_offset: u32, handler_pc: u32) -> Self {
        Self {
            pc_offset,
            kind: SiteKind::ExceptionHandler { handler_pc },
        }
    }

    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SiteKind::Safepoint(_) => "safepoint",
            SiteKind::Infopoint { .. } => "infopoint",
            SiteKind::Call(_) => "call",
            SiteKind::DataPatch(_) => "data-patch",
            SiteKind::Mark(_) => "mark",
            SiteKind::ExceptionHandler { .. } => "exception-handler",
        }
    }
}
