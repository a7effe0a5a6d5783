//! Debug information attached to code positions.
//!
//! The deoptimizer and stack walkers reconstruct interpreter frames from
//! these records. Each [`PcDesc`] names its innermost [`ScopeDesc`]; scopes
//! link outwards to their callers through arena ids, so inlined frames share
//! nothing and need no reference counting.
//!
//! # Layout
//!
//! ```text
//! PcDesc(pc=0x24) ──▶ ScopeDesc(inlined callee, bci 3)
//!                          │ sender
//!                          ▼
//!                     ScopeDesc(root method, bci 17)
//! ```
//!
//! Scalar-replaced objects live in a per-record [`ObjectTable`]; scope
//! values refer to them by index with [`ScopeValue::VirtualObjectReference`].

mod objects;
mod recorder;
mod values;

pub use objects::ObjectTable;
pub use recorder::{DebugInfoRecorder, ScopeMode};

use smallvec::SmallVec;

use crate::arena::{Arena, Id};
use crate::code::{
    ClassHandle, MetaspaceRef, MethodHandle, ObjectHandle, VirtualObjectId, VirtualObjectKind,
};
use crate::error::InstallError;
use crate::reloc::MachineReg;

/// Bci of the implicit monitor enter of a synchronized method.
pub const SYNCHRONIZATION_ENTRY_BCI: i32 = -1;

// =============================================================================
// Locations
// =============================================================================

/// How the value in a location is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationType {
    Invalid,
    /// A 32-bit value in a 32-bit slot.
    Normal,
    /// Full-width heap reference.
    Oop,
    /// Compressed heap reference.
    NarrowOop,
    /// An int stored in a 64-bit register.
    IntInLong,
    Long,
    FloatInDouble,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register { reg: MachineReg, ty: LocationType },
    /// Byte offset from the stack pointer, frame size already applied.
    Stack { offset: i32, ty: LocationType },
}

impl Location {
    #[inline]
    pub const fn ty(self) -> LocationType {
        match self {
            Location::Register { ty, .. } | Location::Stack { ty, .. } => ty,
        }
    }

    /// Whether the GC must visit this location.
    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self.ty(), LocationType::Oop | LocationType::NarrowOop)
    }
}

/// Byte offset from the stack pointer of a compiler stack slot.
///
/// `add_frame_size` slots are relative to the caller's frame.
pub(crate) fn stack_slot_offset(
    offset: i32,
    add_frame_size: bool,
    total_frame_size: u32,
) -> Result<i32, InstallError> {
    if !add_frame_size {
        return Ok(offset);
    }
    i32::try_from(total_frame_size)
        .ok()
        .and_then(|frame| offset.checked_add(frame))
        .ok_or(InstallError::StackSlotOutOfRange {
            offset,
            frame_size: total_frame_size,
        })
}

// =============================================================================
// Scope Values
// =============================================================================

pub type ObjectId = Id<ObjectEntry>;
pub type ScopeId = Id<ScopeDesc>;

/// A resolved value in a frame slot, object field or monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeValue {
    Illegal,
    ConstantInt(i32),
    /// Long or double payload.
    ConstantLong(i64),
    ConstantOop(ObjectHandle),
    ConstantMetaspace(MetaspaceRef),
    Location(Location),
    /// Index into the record's [`ObjectTable`].
    VirtualObjectReference(ObjectId),
}

impl ScopeValue {
    pub const NULL: ScopeValue = ScopeValue::ConstantOop(ObjectHandle::NULL);
    pub const MINUS_ONE: ScopeValue = ScopeValue::ConstantInt(-1);
    pub const ZERO: ScopeValue = ScopeValue::ConstantInt(0);
    pub const ONE: ScopeValue = ScopeValue::ConstantInt(1);
    pub const TWO: ScopeValue = ScopeValue::ConstantInt(2);

    /// Integer constant, reusing the shared small values.
    #[inline]
    pub const fn int(value: i32) -> ScopeValue {
        match value {
            -1 => Self::MINUS_ONE,
            0 => Self::ZERO,
            1 => Self::ONE,
            2 => Self::TWO,
            _ => ScopeValue::ConstantInt(value),
        }
    }

    #[inline]
    pub const fn location(self) -> Option<Location> {
        match self {
            ScopeValue::Location(loc) => Some(loc),
            _ => None,
        }
    }

    #[inline]
    pub const fn object_id(self) -> Option<ObjectId> {
        match self {
            ScopeValue::VirtualObjectReference(id) => Some(id),
            _ => None,
        }
    }
}

/// A monitor held by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorValue {
    pub owner: ScopeValue,
    /// Stack slot of the lock record.
    pub basic_lock: Location,
    /// Lock elided by escape analysis; relocked on deoptimization.
    pub eliminated: bool,
}

/// A scalar-replaced object to be rematerialized on deoptimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Compiler-side id the entry was built from.
    pub source: VirtualObjectId,
    pub class: ClassHandle,
    pub kind: VirtualObjectKind,
    pub fields: Vec<ScopeValue>,
}

// =============================================================================
// Scopes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameValues {
    pub locals: Vec<ScopeValue>,
    pub expressions: Vec<ScopeValue>,
    pub monitors: SmallVec<[MonitorValue; 2]>,
}

/// One (possibly inlined) frame at a code position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDesc {
    pub method: MethodHandle,
    pub bci: i32,
    /// Re-execute the bytecode at `bci` rather than continuing after it.
    pub reexecute: bool,
    pub rethrow_exception: bool,
    /// The value returned by the call at this position is a reference.
    pub return_oop: bool,
    /// `None` for bytecode-position-only scopes.
    pub frame: Option<FrameValues>,
    /// The calling scope, for inlined frames.
    pub sender: Option<ScopeId>,
}

impl ScopeDesc {
    /// All scope values of the frame, monitor owners included.
    pub fn values(&self) -> impl Iterator<Item = ScopeValue> + '_ {
        self.frame.iter().flat_map(|frame| {
            frame
                .locals
                .iter()
                .chain(&frame.expressions)
                .copied()
                .chain(frame.monitors.iter().map(|m| m.owner))
        })
    }
}

/// Debug information for one pc offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcDesc {
    pub pc_offset: u32,
    pub innermost: ScopeId,
    pub objects: ObjectTable,
    /// Recorded with a full frame (safepoints and calls).
    pub is_safepoint: bool,
}

// =============================================================================
// Debug Info Set
// =============================================================================

/// All scope records of one code object, in pc order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugInfoSet {
    scopes: Arena<ScopeDesc>,
    records: Vec<PcDesc>,
}

impl DebugInfoSet {
    pub(crate) fn from_parts(scopes: Arena<ScopeDesc>, records: Vec<PcDesc>) -> Self {
        Self { scopes, records }
    }

    #[inline]
    pub fn records(&self) -> &[PcDesc] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn scope(&self, id: ScopeId) -> &ScopeDesc {
        &self.scopes[id]
    }

    /// First record at exactly `pc_offset`.
    pub fn at(&self, pc_offset: u32) -> Option<&PcDesc> {
        let idx = self.records.partition_point(|r| r.pc_offset < pc_offset);
        self.records.get(idx).filter(|r| r.pc_offset == pc_offset)
    }

    /// Scopes of `record`, innermost first.
    pub fn scopes<'a>(&'a self, record: &PcDesc) -> impl Iterator<Item = &'a ScopeDesc> + 'a {
        std::iter::successors(Some(&self.scopes[record.innermost]), |scope| {
            scope.sender.map(|id| &self.scopes[id])
        })
    }

    /// Values that can reach the record's object table, in discovery order.
    pub fn roots(&self, record: &PcDesc) -> Vec<ScopeValue> {
        self.scopes(record).flat_map(ScopeDesc::values).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_int_constants() {
        assert_eq!(ScopeValue::int(-1), ScopeValue::MINUS_ONE);
        assert_eq!(ScopeValue::int(2), ScopeValue::TWO);
        assert_eq!(ScopeValue::int(3), ScopeValue::ConstantInt(3));
        assert_eq!(ScopeValue::NULL, ScopeValue::ConstantOop(ObjectHandle(0)));
    }

    #[test]
    fn test_location_reference_types() {
        let oop = Location::Stack {
            offset: 8,
            ty: LocationType::Oop,
        };
        let narrow = Location::Register {
            reg: MachineReg::gpr(3),
            ty: LocationType::NarrowOop,
        };
        let long = Location::Stack {
            offset: 16,
            ty: LocationType::Long,
        };
        assert!(oop.is_reference());
        assert!(narrow.is_reference());
        assert!(!long.is_reference());
    }

    #[test]
    fn test_scope_chain_and_lookup() {
        let mut scopes = Arena::new();
        let outer = scopes.alloc(ScopeDesc {
            method: MethodHandle(1),
            bci: 10,
            reexecute: false,
            rethrow_exception: false,
            return_oop: false,
            frame: None,
            sender: None,
        });
        let base = scopes[outer].clone();
        let inner = scopes.alloc(ScopeDesc {
            method: MethodHandle(2),
            bci: 3,
            sender: Some(outer),
            ..base
        });
        let record = |pc| PcDesc {
            pc_offset: pc,
            innermost: inner,
            objects: ObjectTable::default(),
            is_safepoint: false,
        };
        let set = DebugInfoSet::from_parts(scopes, vec![record(4), record(8), record(8)]);

        let at8 = set.at(8).unwrap();
        let methods: Vec<_> = set.scopes(at8).map(|s| s.method).collect();
        assert_eq!(methods, vec![MethodHandle(2), MethodHandle(1)]);
        assert!(set.at(6).is_none());
        assert!(set.at(12).is_none());
        assert_eq!(set.len(), 3);
    }
}
