//! Debug information as the compiler describes it.

use serde::{Deserialize, Serialize};

use super::{ClassHandle, MetaspaceRef, MethodHandle, ObjectHandle, ValueKind};

/// Bytecode index of a frame state taken before the method body runs.
pub const BEFORE_BCI: i32 = -1;
/// Bytecode index of a frame state taken after the method returned.
pub const AFTER_BCI: i32 = -2;
/// Bytecode index of a frame state taken after an exception unwound the method.
pub const AFTER_EXCEPTION_BCI: i32 = -4;
/// Bytecode index the compiler could not determine.
pub const UNKNOWN_BCI: i32 = -5;

// =============================================================================
// Values
// =============================================================================

/// A machine location before register numbers are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawLocation {
    /// Target register number (see the relocation backends for numbering).
    Register(u16),
    /// Byte offset from the stack pointer.
    StackSlot { offset: i32, add_frame_size: bool },
}

/// Identity of a virtual object inside one [`DebugInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualObjectId(pub u32);

impl std::fmt::Display for VirtualObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value in a frame slot, object field or monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JavaValue {
    /// No value (dead slot or second half of a two-slot value).
    Illegal,
    /// Value held in a register; `narrow` marks a compressed reference.
    Register { number: u16, narrow: bool },
    /// Value spilled to the stack.
    StackSlot {
        offset: i32,
        add_frame_size: bool,
        narrow: bool,
    },
    /// Primitive constant; `bits` holds the raw (zero-extended) payload.
    Primitive { kind: ValueKind, bits: u64 },
    /// Untyped machine word.
    Raw(u64),
    Null,
    Object {
        object: ObjectHandle,
        compressed: bool,
    },
    Metaspace(MetaspaceRef),
    /// Object whose allocation the compiler eliminated.
    Virtual(VirtualObjectId),
    /// Held monitor; only valid in monitor positions.
    StackLock {
        owner: Box<JavaValue>,
        slot: Box<JavaValue>,
        eliminated: bool,
    },
}

impl JavaValue {
    /// Integer constant of kind `Int`.
    pub const fn int(value: i32) -> Self {
        JavaValue::Primitive {
            kind: ValueKind::Int,
            bits: value as u32 as u64,
        }
    }

    pub const fn long(value: i64) -> Self {
        JavaValue::Primitive {
            kind: ValueKind::Long,
            bits: value as u64,
        }
    }

    pub fn double(value: f64) -> Self {
        JavaValue::Primitive {
            kind: ValueKind::Double,
            bits: value.to_bits(),
        }
    }

    /// Full-width value in a register.
    pub const fn reg(number: u16) -> Self {
        JavaValue::Register {
            number,
            narrow: false,
        }
    }

    /// Full-width value at `offset` from the stack pointer.
    pub const fn stack(offset: i32) -> Self {
        JavaValue::StackSlot {
            offset,
            add_frame_size: false,
            narrow: false,
        }
    }

    pub fn stack_lock(owner: JavaValue, slot: JavaValue, eliminated: bool) -> Self {
        JavaValue::StackLock {
            owner: Box::new(owner),
            slot: Box::new(slot),
            eliminated,
        }
    }

    /// The virtual object this value names, looking through monitors.
    pub fn virtual_id(&self) -> Option<VirtualObjectId> {
        match self {
            JavaValue::Virtual(id) => Some(*id),
            JavaValue::StackLock { owner, .. } => owner.virtual_id(),
            _ => None,
        }
    }
}

// =============================================================================
// Virtual Objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualObjectKind {
    Instance,
    Array(ValueKind),
}

/// An object the compiler scalar-replaced; rematerialized on deoptimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualObject {
    pub id: VirtualObjectId,
    pub class: ClassHandle,
    pub kind: VirtualObjectKind,
    pub slot_kinds: Vec<ValueKind>,
    pub values: Vec<JavaValue>,
}

impl VirtualObject {
    pub fn instance(id: u32, class: ClassHandle) -> Self {
        Self {
            id: VirtualObjectId(id),
            class,
            kind: VirtualObjectKind::Instance,
            slot_kinds: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn array(id: u32, class: ClassHandle, element: ValueKind) -> Self {
        Self {
            kind: VirtualObjectKind::Array(element),
            ..Self::instance(id, class)
        }
    }

    /// Append a field value.
    pub fn with_field(mut self, kind: ValueKind, value: JavaValue) -> Self {
        self.slot_kinds.push(kind);
        self.values.push(value);
        self
    }

    #[inline]
    pub fn is_long_array(&self) -> bool {
        self.kind == VirtualObjectKind::Array(ValueKind::Long)
    }
}

// =============================================================================
// Frames and Positions
// =============================================================================

/// Full interpreter-visible state of one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    /// Locals, then expression stack, then monitors.
    pub values: Vec<JavaValue>,
    /// Kinds of the locals and stack slots (monitors have none).
    pub slot_kinds: Vec<ValueKind>,
    pub num_locals: u32,
    pub num_stack: u32,
    pub num_locks: u32,
    pub rethrow_exception: bool,
    pub during_call: bool,
}

impl FrameState {
    /// Build a frame from `(kind, value)` locals and stack slots plus monitors.
    pub fn from_slots(
        locals: Vec<(ValueKind, JavaValue)>,
        stack: Vec<(ValueKind, JavaValue)>,
        monitors: Vec<JavaValue>,
    ) -> Self {
        let num_locals = locals.len() as u32;
        let num_stack = stack.len() as u32;
        let num_locks = monitors.len() as u32;
        let mut slot_kinds = Vec::with_capacity(locals.len() + stack.len());
        let mut values = Vec::with_capacity(locals.len() + stack.len() + monitors.len());
        for (kind, value) in locals.into_iter().chain(stack) {
            slot_kinds.push(kind);
            values.push(value);
        }
        values.extend(monitors);
        Self {
            values,
            slot_kinds,
            num_locals,
            num_stack,
            num_locks,
            rethrow_exception: false,
            during_call: false,
        }
    }

    pub fn during_call(mut self, during_call: bool) -> Self {
        self.during_call = during_call;
        self
    }

    pub fn rethrow_exception(mut self, rethrow: bool) -> Self {
        self.rethrow_exception = rethrow;
        self
    }
}

/// A method + bytecode index, optionally with a full frame, linked to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytecodePosition {
    pub method: MethodHandle,
    pub bci: i32,
    pub frame: Option<FrameState>,
    pub caller: Option<Box<BytecodePosition>>,
}

impl BytecodePosition {
    pub fn new(method: MethodHandle, bci: i32) -> Self {
        Self {
            method,
            bci,
            frame: None,
            caller: None,
        }
    }

    pub fn with_frame(mut self, frame: FrameState) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_caller(mut self, caller: BytecodePosition) -> Self {
        self.caller = Some(Box::new(caller));
        self
    }

    /// Iterate from this (innermost) position out to the root caller.
    pub fn chain(&self) -> impl Iterator<Item = &BytecodePosition> {
        std::iter::successors(Some(self), |pos| pos.caller.as_deref())
    }
}

// =============================================================================
// Reference Maps
// =============================================================================

/// One compiler-reported reference location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMapEntry {
    pub location: RawLocation,
    /// Base of a derived pointer.
    pub base: Option<RawLocation>,
    /// 8 for a full reference, 4 for a compressed one.
    pub size: u8,
}

/// References the compiler tracked itself, beyond those in the frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMap {
    /// Frame size the map was computed for, in bytes.
    pub frame_size: u32,
    pub entries: Vec<RefMapEntry>,
}

/// A callee-saved register and the stack slot holding its caller value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalleeSave {
    pub register: u16,
    pub slot: i32,
}

/// Everything the compiler recorded about one code position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub position: BytecodePosition,
    pub virtual_objects: Vec<VirtualObject>,
    pub reference_map: Option<ReferenceMap>,
    pub callee_save: Vec<CalleeSave>,
}

impl DebugInfo {
    pub fn new(position: BytecodePosition) -> Self {
        Self {
            position,
            virtual_objects: Vec::new(),
            reference_map: None,
            callee_save: Vec::new(),
        }
    }

    pub fn with_virtual_objects(mut self, objects: Vec<VirtualObject>) -> Self {
        self.virtual_objects = objects;
        self
    }

    pub fn with_reference_map(mut self, map: ReferenceMap) -> Self {
        self.reference_map = Some(map);
        self
    }

    pub fn with_callee_save(mut self, saves: Vec<CalleeSave>) -> Self {
        self.callee_save = saves;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_slots_counts() {
        let frame = FrameState::from_slots(
            vec![
                (ValueKind::Long, JavaValue::long(5)),
                (ValueKind::Illegal, JavaValue::Illegal),
            ],
            vec![(ValueKind::Object, JavaValue::reg(3))],
            vec![JavaValue::stack_lock(JavaValue::reg(3), JavaValue::stack(16), false)],
        );
        assert_eq!(frame.num_locals, 2);
        assert_eq!(frame.num_stack, 1);
        assert_eq!(frame.num_locks, 1);
        assert_eq!(frame.values.len(), 4);
        assert_eq!(frame.slot_kinds.len(), 3);
    }

    #[test]
    fn test_position_chain_is_innermost_first() {
        let pos = BytecodePosition::new(MethodHandle(1), 4)
            .with_caller(BytecodePosition::new(MethodHandle(2), 10));
        let methods: Vec<_> = pos.chain().map(|p| p.method).collect();
        assert_eq!(methods, vec![MethodHandle(1), MethodHandle(2)]);
    }

    #[test]
    fn test_virtual_id_through_monitor() {
        let lock = JavaValue::stack_lock(
            JavaValue::Virtual(VirtualObjectId(7)),
            JavaValue::stack(8),
            true,
        );
        assert_eq!(lock.virtual_id(), Some(VirtualObjectId(7)));
        assert_eq!(JavaValue::Null.virtual_id(), None);
    }
}
