//! Per-installation debug info recording.

use smallvec::SmallVec;

use super::objects::{ObjectTable, flatten};
use super::values::ValueResolver;
use super::{DebugInfoSet, Location, PcDesc, SYNCHRONIZATION_ENTRY_BCI, ScopeDesc, ScopeId};
use crate::arena::Arena;
use crate::code::{BEFORE_BCI, BytecodePosition, DebugInfo};
use crate::error::InstallError;
use crate::reloc::Backend;
use crate::runtime::MetadataStore;

/// How much of each frame a record keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    /// Locals, expressions and monitors of every frame (safepoints, calls).
    FullFrame,
    /// Method and bci only (non-safepoint infopoints).
    BytecodePosition,
}

/// Collects scope records in pc order.
pub struct DebugInfoRecorder<'a> {
    store: &'a dyn MetadataStore,
    resolver: ValueResolver<'a>,
    scopes: Arena<ScopeDesc>,
    records: Vec<PcDesc>,
}

impl<'a> DebugInfoRecorder<'a> {
    pub(crate) fn new(
        backend: &'a dyn Backend,
        store: &'a dyn MetadataStore,
        compressed_oops: bool,
        total_frame_size: u32,
    ) -> Self {
        Self {
            store,
            resolver: ValueResolver::new(backend, compressed_oops, total_frame_size),
            scopes: Arena::new(),
            records: Vec::new(),
        }
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
    pub fn records(&self) -> &[PcDesc] {
        &self.records
    }

    /// Record the scope chain of `info` at `pc_offset`.
    ///
    /// Returns the index of the new record. `return_oop` marks the innermost
    /// scope of a call whose callee returns a reference.
    pub fn record(
        &mut self,
        pc_offset: u32,
        info: &DebugInfo,
        mode: ScopeMode,
        return_oop: bool,
    ) -> Result<usize, InstallError> {
        if let Some(last) = self.records.last() {
            if pc_offset < last.pc_offset {
                return Err(InstallError::DebugInfoOutOfOrder {
                    pc: pc_offset,
                    previous: last.pc_offset,
                });
            }
        }

        let objects = match mode {
            ScopeMode::FullFrame => flatten(&mut self.resolver, info)?,
            ScopeMode::BytecodePosition => {
                self.resolver.reset();
                ObjectTable::default()
            }
        };

        let callers: SmallVec<[&BytecodePosition; 4]> = info.position.chain().skip(1).collect();
        let mut sender = None;
        for position in callers.iter().rev() {
            sender = Some(self.scope(position, mode, sender, false)?);
        }
        let innermost = self.scope(&info.position, mode, sender, return_oop)?;

        self.records.push(PcDesc {
            pc_offset,
            innermost,
            objects,
            is_safepoint: mode == ScopeMode::FullFrame,
        });
        Ok(self.records.len() - 1)
    }

    fn scope(
        &mut self,
        position: &BytecodePosition,
        mode: ScopeMode,
        sender: Option<ScopeId>,
        return_oop: bool,
    ) -> Result<ScopeId, InstallError> {
        let bci = if position.bci == BEFORE_BCI {
            SYNCHRONIZATION_ENTRY_BCI
        } else {
            position.bci
        };
        let at_sync_entry = bci == SYNCHRONIZATION_ENTRY_BCI;

        let (frame, reexecute, rethrow_exception) = match mode {
            ScopeMode::FullFrame => {
                let state = position.frame.as_ref().ok_or_else(|| InstallError::InvalidFrame {
                    bci,
                    reason: "safepoint scope without a frame".to_string(),
                })?;
                let values = self.resolver.resolve_frame(bci, state)?;
                (
                    Some(values),
                    !at_sync_entry && !state.during_call,
                    state.rethrow_exception,
                )
            }
            ScopeMode::BytecodePosition => {
                let reexecute =
                    !at_sync_entry && self.store.should_reexecute(position.method, bci)?;
                (None, reexecute, false)
            }
        };

        Ok(self.scopes.alloc(ScopeDesc {
            method: position.method,
            bci,
            reexecute,
            rethrow_exception,
            return_oop,
            frame,
            sender,
        }))
    }

    /// Every reference-typed location the record at `index` mentions.
    ///
    /// Covers all frames of the chain, monitor owners and fields of
    /// virtual objects. May contain duplicates.
    pub fn reference_locations(&self, index: usize) -> Vec<Location> {
        let Some(record) = self.records.get(index) else {
            return Vec::new();
        };
        let scopes = std::iter::successors(Some(&self.scopes[record.innermost]), |scope| {
            scope.sender.map(|id| &self.scopes[id])
        });
        let fields = record
            .objects
            .iter()
            .flat_map(|(_, entry)| entry.fields.iter().copied());

        scopes
            .flat_map(ScopeDesc::values)
            .chain(fields)
            .filter_map(|value| value.location())
            .filter(|loc| loc.is_reference())
            .collect()
    }

    pub fn finish(self) -> DebugInfoSet {
        DebugInfoSet::from_parts(self.scopes, self.records)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{
        ClassHandle, FrameState, JavaValue, MethodHandle, ValueKind, VirtualObject,
        VirtualObjectId,
    };
    use crate::debug::{LocationType, ScopeValue};
    use crate::reloc::{Amd64Backend, MachineReg};
    use crate::runtime::local::LocalRuntime;

    static BACKEND: Amd64Backend = Amd64Backend;

    fn frame(locals: Vec<(ValueKind, JavaValue)>) -> FrameState {
        FrameState::from_slots(locals, vec![], vec![])
    }

    fn recorder(runtime: &LocalRuntime) -> DebugInfoRecorder<'_> {
        DebugInfoRecorder::new(&BACKEND, runtime, true, 32)
    }

    #[test]
    fn test_scope_chain_outermost_is_sender() {
        let runtime = LocalRuntime::new(4096);
        let mut rec = recorder(&runtime);

        let caller = BytecodePosition::new(MethodHandle(1), 12)
            .with_frame(frame(vec![(ValueKind::Int, JavaValue::int(1))]));
        let callee = BytecodePosition::new(MethodHandle(2), 3)
            .with_frame(frame(vec![(ValueKind::Object, JavaValue::reg(3))]).during_call(true))
            .with_caller(caller);

        let index = rec
            .record(8, &DebugInfo::new(callee), ScopeMode::FullFrame, true)
            .unwrap();
        let set = rec.finish();
        let record = &set.records()[index];
        assert!(record.is_safepoint);

        let scopes: Vec<_> = set.scopes(record).collect();
        assert_eq!(scopes.len(), 2);
        assert_eq!((scopes[0].method, scopes[0].bci), (MethodHandle(2), 3));
        assert!(scopes[0].return_oop);
        assert!(!scopes[0].reexecute);
        assert!(!scopes[1].return_oop);
        assert!(scopes[1].reexecute);
        assert!(scopes[1].sender.is_none());
    }

    #[test]
    fn test_full_frame_required() {
        let runtime = LocalRuntime::new(4096);
        let mut rec = recorder(&runtime);
        let info = DebugInfo::new(BytecodePosition::new(MethodHandle(1), 0));
        assert!(matches!(
            rec.record(0, &info, ScopeMode::FullFrame, false),
            Err(InstallError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_position_reexecute_comes_from_store() {
        let runtime = LocalRuntime::new(4096);
        runtime.set_reexecute(MethodHandle(1), 7);
        let mut rec = recorder(&runtime);

        let at = |bci| DebugInfo::new(BytecodePosition::new(MethodHandle(1), bci));
        rec.record(0, &at(7), ScopeMode::BytecodePosition, false).unwrap();
        rec.record(4, &at(8), ScopeMode::BytecodePosition, false).unwrap();
        rec.record(4, &at(BEFORE_BCI), ScopeMode::BytecodePosition, false)
            .unwrap();

        let set = rec.finish();
        let flags: Vec<_> = set
            .records()
            .iter()
            .map(|r| set.scope(r.innermost).reexecute)
            .collect();
        assert_eq!(flags, vec![true, false, false]);
        assert_eq!(
            set.scope(set.records()[2].innermost).bci,
            SYNCHRONIZATION_ENTRY_BCI
        );
        assert!(set.records().iter().all(|r| !r.is_safepoint));
    }

    #[test]
    fn test_records_must_be_in_pc_order() {
        let runtime = LocalRuntime::new(4096);
        let mut rec = recorder(&runtime);
        let info = DebugInfo::new(BytecodePosition::new(MethodHandle(1), 0));
        rec.record(8, &info, ScopeMode::BytecodePosition, false).unwrap();
        assert!(matches!(
            rec.record(4, &info, ScopeMode::BytecodePosition, false),
            Err(InstallError::DebugInfoOutOfOrder { pc: 4, previous: 8 })
        ));
    }

    #[test]
    fn test_reference_locations_cover_objects_and_monitors() {
        let runtime = LocalRuntime::new(4096);
        let mut rec = recorder(&runtime);

        let object = VirtualObject::instance(1, ClassHandle(9))
            .with_field(ValueKind::Object, JavaValue::stack(24))
            .with_field(ValueKind::Int, JavaValue::reg(2));
        let state = FrameState::from_slots(
            vec![
                (ValueKind::Object, JavaValue::reg(3)),
                (ValueKind::Object, JavaValue::Virtual(VirtualObjectId(1))),
                (ValueKind::Long, JavaValue::stack(8)),
                (ValueKind::Illegal, JavaValue::Illegal),
            ],
            vec![],
            vec![JavaValue::stack_lock(JavaValue::reg(5), JavaValue::stack(0), false)],
        );
        let info = DebugInfo::new(BytecodePosition::new(MethodHandle(1), 4).with_frame(state))
            .with_virtual_objects(vec![object]);

        let index = rec.record(16, &info, ScopeMode::FullFrame, false).unwrap();
        let refs = rec.reference_locations(index);
        assert_eq!(
            refs,
            vec![
                Location::Register {
                    reg: MachineReg::gpr(3),
                    ty: LocationType::Oop
                },
                Location::Register {
                    reg: MachineReg::gpr(5),
                    ty: LocationType::Oop
                },
                Location::Stack {
                    offset: 24,
                    ty: LocationType::Oop
                },
            ]
        );

        let set = rec.finish();
        let record = &set.records()[index];
        let scope = set.scope(record.innermost);
        let monitors = &scope.frame.as_ref().unwrap().monitors;
        assert_eq!(monitors.len(), 1);
        assert!(!monitors[0].eliminated);
        assert_eq!(
            scope.frame.as_ref().unwrap().locals[1],
            ScopeValue::VirtualObjectReference(crate::debug::ObjectId::new(0))
        );
    }
}
