//! Input model: what the compiler hands to the installer.
//!
//! Everything here is plain data with `serde` derives so that a descriptor
//! can cross a process or language boundary as bytes. The installer treats
//! all of it as untrusted.

mod assumptions;
mod descriptor;
mod site;
mod value;

pub use assumptions::Assumption;
pub use descriptor::{
    CodeComment, CodeKind, CompiledCodeDescriptor, DataSectionPatch, INVOCATION_ENTRY_BCI,
};
pub use site::{
    CallSite, CallTarget, InfopointReason, InvalidMarkId, InvokeKind, MarkId, PatchConstant,
    Reference, Site, SiteKind,
};
pub use value::{
    AFTER_BCI, AFTER_EXCEPTION_BCI, BEFORE_BCI, BytecodePosition, CalleeSave, DebugInfo,
    FrameState, JavaValue, RawLocation, RefMapEntry, ReferenceMap, UNKNOWN_BCI, VirtualObject,
    VirtualObjectId, VirtualObjectKind,
};

use serde::{Deserialize, Serialize};

// =============================================================================
// Runtime Handles
// =============================================================================

/// Opaque reference to a method in the runtime's metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodHandle(pub u64);

/// Opaque reference to a class in the runtime's metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassHandle(pub u64);

/// Opaque reference to a heap object the compiler embedded in the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    /// The null reference.
    pub const NULL: Self = ObjectHandle(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Reference to runtime metadata (not a heap object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaspaceRef {
    Class(ClassHandle),
    Method(MethodHandle),
}

// =============================================================================
// Value Kinds
// =============================================================================

/// Java-level kind of a value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Illegal,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Float,
    Long,
    Double,
    Object,
}

impl ValueKind {
    /// Number of interpreter slots a value of this kind occupies.
    #[inline]
    pub const fn slots(self) -> u32 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            ValueKind::Illegal => 0,
            _ => 1,
        }
    }

    #[inline]
    pub const fn is_two_slot(self) -> bool {
        self.slots() == 2
    }

    /// Boolean, byte, short, char or int.
    #[inline]
    pub const fn is_int_like(self) -> bool {
        matches!(
            self,
            ValueKind::Boolean
                | ValueKind::Byte
                | ValueKind::Short
                | ValueKind::Char
                | ValueKind::Int
        )
    }

    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self, ValueKind::Object)
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Illegal => "illegal",
            ValueKind::Boolean => "boolean",
            ValueKind::Byte => "byte",
            ValueKind::Short => "short",
            ValueKind::Char => "char",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Long => "long",
            ValueKind::Double => "double",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}
