//! Translation of compiler values into scope values.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{
    FrameValues, Location, LocationType, MonitorValue, ObjectId, ScopeValue, stack_slot_offset,
};
use crate::code::{FrameState, JavaValue, ValueKind, VirtualObjectId};
use crate::error::InstallError;
use crate::reloc::{Backend, MachineReg};

/// A resolved value plus the entry for the second half of a two-slot value.
pub(crate) type Resolved = (ScopeValue, Option<ScopeValue>);

fn unexpected(kind: ValueKind, value: &JavaValue) -> InstallError {
    InstallError::UnexpectedValue {
        kind,
        value: format!("{value:?}"),
    }
}

/// Resolves [`JavaValue`]s against the target's registers and the frame.
///
/// `objects` maps compiler-side virtual object ids to their slot in the
/// record's object table and is filled in by the flattener.
pub(crate) struct ValueResolver<'a> {
    backend: &'a dyn Backend,
    compressed_oops: bool,
    total_frame_size: u32,
    pub(super) objects: FxHashMap<VirtualObjectId, ObjectId>,
}

impl<'a> ValueResolver<'a> {
    pub(crate) fn new(
        backend: &'a dyn Backend,
        compressed_oops: bool,
        total_frame_size: u32,
    ) -> Self {
        Self {
            backend,
            compressed_oops,
            total_frame_size,
            objects: FxHashMap::default(),
        }
    }

    /// Forget the object bindings of the previous record.
    pub(crate) fn reset(&mut self) {
        self.objects.clear();
    }

    fn oop_type(&self, narrow: bool, value: &JavaValue) -> Result<LocationType, InstallError> {
        match (narrow, self.compressed_oops) {
            (false, _) => Ok(LocationType::Oop),
            (true, true) => Ok(LocationType::NarrowOop),
            (true, false) => Err(unexpected(ValueKind::Object, value)),
        }
    }

    fn register_type(
        &self,
        reg: MachineReg,
        kind: ValueKind,
        narrow: bool,
        value: &JavaValue,
    ) -> Result<LocationType, InstallError> {
        if narrow && !kind.is_object() {
            return Err(unexpected(kind, value));
        }
        if reg.is_general() {
            match kind {
                ValueKind::Object => self.oop_type(narrow, value),
                ValueKind::Long => Ok(LocationType::Long),
                ValueKind::Double | ValueKind::Illegal => Err(unexpected(kind, value)),
                _ => Ok(LocationType::IntInLong),
            }
        } else {
            match kind {
                ValueKind::Float => Ok(LocationType::Normal),
                ValueKind::Double => Ok(LocationType::Double),
                _ => Err(unexpected(kind, value)),
            }
        }
    }

    fn stack_type(
        &self,
        kind: ValueKind,
        narrow: bool,
        value: &JavaValue,
    ) -> Result<LocationType, InstallError> {
        if narrow && !kind.is_object() {
            return Err(unexpected(kind, value));
        }
        match kind {
            ValueKind::Object => self.oop_type(narrow, value),
            ValueKind::Long => Ok(LocationType::Long),
            ValueKind::Double => Ok(LocationType::Double),
            ValueKind::Illegal => Err(unexpected(kind, value)),
            _ => Ok(LocationType::Normal),
        }
    }

    /// Resolve `value` for a slot of `kind`.
    pub(crate) fn resolve(
        &self,
        value: &JavaValue,
        kind: ValueKind,
    ) -> Result<Resolved, InstallError> {
        let two_slot = |v: ScopeValue| (v, kind.is_two_slot().then_some(v));

        match value {
            JavaValue::Illegal => match kind {
                ValueKind::Illegal => Ok((ScopeValue::Illegal, None)),
                _ => Err(unexpected(kind, value)),
            },
            JavaValue::Register { number, narrow } => {
                let reg = self.backend.decode_register(*number)?;
                let ty = self.register_type(reg, kind, *narrow, value)?;
                Ok(two_slot(ScopeValue::Location(Location::Register { reg, ty })))
            }
            JavaValue::StackSlot {
                offset,
                add_frame_size,
                narrow,
            } => {
                let ty = self.stack_type(kind, *narrow, value)?;
                let offset = stack_slot_offset(*offset, *add_frame_size, self.total_frame_size)?;
                Ok(two_slot(ScopeValue::Location(Location::Stack { offset, ty })))
            }
            JavaValue::Primitive {
                kind: constant_kind,
                bits,
            } => {
                if *constant_kind != kind {
                    return Err(unexpected(kind, value));
                }
                match kind {
                    ValueKind::Long | ValueKind::Double => {
                        Ok((ScopeValue::ConstantLong(*bits as i64), Some(ScopeValue::ONE)))
                    }
                    ValueKind::Object | ValueKind::Illegal => Err(unexpected(kind, value)),
                    _ => Ok((ScopeValue::int(*bits as u32 as i32), None)),
                }
            }
            JavaValue::Raw(bits) => {
                if kind.is_two_slot() {
                    Ok((ScopeValue::ConstantLong(*bits as i64), Some(ScopeValue::ONE)))
                } else {
                    Ok((ScopeValue::ConstantLong(*bits as i64), None))
                }
            }
            JavaValue::Null => match kind {
                ValueKind::Object => Ok((ScopeValue::NULL, None)),
                _ => Err(unexpected(kind, value)),
            },
            JavaValue::Object { object, compressed } => {
                if !kind.is_object() || object.is_null() || (*compressed && !self.compressed_oops) {
                    return Err(unexpected(kind, value));
                }
                Ok((ScopeValue::ConstantOop(*object), None))
            }
            JavaValue::Metaspace(reference) => match kind {
                ValueKind::Illegal => Err(unexpected(kind, value)),
                _ => Ok((ScopeValue::ConstantMetaspace(*reference), None)),
            },
            JavaValue::Virtual(id) => {
                if !kind.is_object() {
                    return Err(unexpected(kind, value));
                }
                let index = self
                    .objects
                    .get(id)
                    .ok_or(InstallError::UnknownVirtualObject(*id))?;
                Ok((ScopeValue::VirtualObjectReference(*index), None))
            }
            JavaValue::StackLock { .. } => {
                Err(InstallError::InvalidMonitor("lock outside a monitor position"))
            }
        }
    }

    pub(crate) fn resolve_monitor(&self, value: &JavaValue) -> Result<MonitorValue, InstallError> {
        let JavaValue::StackLock {
            owner,
            slot,
            eliminated,
        } = value
        else {
            return Err(InstallError::InvalidMonitor("expected a stack lock"));
        };
        let (owner, _) = self.resolve(owner, ValueKind::Object)?;
        let (lock, _) = self.resolve(slot, ValueKind::Long)?;
        let basic_lock = lock
            .location()
            .ok_or(InstallError::InvalidMonitor("lock slot is not a location"))?;
        Ok(MonitorValue {
            owner,
            basic_lock,
            eliminated: *eliminated,
        })
    }

    /// Resolve a full frame into locals, expressions and monitors.
    pub(crate) fn resolve_frame(
        &self,
        bci: i32,
        frame: &FrameState,
    ) -> Result<FrameValues, InstallError> {
        let locals = frame.num_locals as usize;
        let slots = locals + frame.num_stack as usize;
        let invalid = |reason: String| InstallError::InvalidFrame { bci, reason };

        if frame.values.len() != slots + frame.num_locks as usize {
            return Err(invalid(format!(
                "{} values for {} locals, {} stack slots and {} locks",
                frame.values.len(),
                frame.num_locals,
                frame.num_stack,
                frame.num_locks
            )));
        }
        if frame.slot_kinds.len() != slots {
            return Err(invalid(format!(
                "{} slot kinds for {} slots",
                frame.slot_kinds.len(),
                slots
            )));
        }

        let mut out = FrameValues {
            locals: Vec::with_capacity(locals),
            expressions: Vec::with_capacity(slots - locals),
            monitors: SmallVec::new(),
        };
        let mut i = 0;
        while i < slots {
            let (value, second) = self.resolve(&frame.values[i], frame.slot_kinds[i])?;
            let target = if i < locals {
                &mut out.locals
            } else {
                &mut out.expressions
            };
            match second {
                Some(second) => {
                    let next = i + 1;
                    let paired = next < slots
                        && (next < locals) == (i < locals)
                        && frame.slot_kinds[next] == ValueKind::Illegal
                        && frame.values[next] == JavaValue::Illegal;
                    if !paired {
                        return Err(invalid(format!(
                            "two-slot value in slot {i} is not followed by an illegal slot"
                        )));
                    }
                    target.push(second);
                    target.push(value);
                    i += 2;
                }
                None => {
                    target.push(value);
                    i += 1;
                }
            }
        }

        for value in &frame.values[slots..] {
            out.monitors.push(self.resolve_monitor(value)?);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
