//! Oop maps: where the GC finds references at each safepoint.
//!
//! One [`OopMap`] is recorded per safepoint (and per call return address).
//! It lists every register or stack slot holding a reference, derived
//! pointers together with their base, and callee-saved registers spilled
//! by the frame. Maps are kept sorted by pc offset for O(log n) lookup.

use std::fmt;

use smallvec::SmallVec;

use crate::code::{DebugInfo, RawLocation};
use crate::debug::{Location, LocationType, stack_slot_offset};
use crate::error::InstallError;
use crate::reloc::{Backend, MachineReg};

// =============================================================================
// Entries
// =============================================================================

/// A register or stack slot of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmSlot {
    Register(MachineReg),
    /// Byte offset from the stack pointer.
    Stack(i32),
}

impl fmt::Display for VmSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmSlot::Register(reg) => write!(f, "{reg}"),
            VmSlot::Stack(offset) => write!(f, "[sp+{offset}]"),
        }
    }
}

impl From<Location> for VmSlot {
    fn from(location: Location) -> Self {
        match location {
            Location::Register { reg, .. } => VmSlot::Register(reg),
            Location::Stack { offset, .. } => VmSlot::Stack(offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OopMapValue {
    Oop,
    NarrowOop,
    /// Interior pointer; updated when `base` moves.
    Derived { base: VmSlot },
    /// Holds the caller's value of `register`.
    CalleeSaved { register: MachineReg },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OopMapEntry {
    pub slot: VmSlot,
    pub value: OopMapValue,
}

// =============================================================================
// OopMap
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    pub pc_offset: u32,
    /// Frame size in bytes.
    pub frame_size: u32,
    entries: SmallVec<[OopMapEntry; 8]>,
}

impl OopMap {
    pub fn new(pc_offset: u32, frame_size: u32) -> Self {
        Self {
            pc_offset,
            frame_size,
            entries: SmallVec::new(),
        }
    }

    /// Add an entry; each slot appears once.
    ///
    /// Re-adding an identical entry is a no-op, a different value for the
    /// same slot is an error.
    pub fn add(&mut self, slot: VmSlot, value: OopMapValue) -> Result<(), InstallError> {
        match self.entries.iter().find(|e| e.slot == slot) {
            Some(existing) if existing.value == value => Ok(()),
            Some(_) => Err(InstallError::ConflictingOopMapEntry {
                pc: self.pc_offset,
                slot: slot.to_string(),
            }),
            None => {
                self.entries.push(OopMapEntry { slot, value });
                Ok(())
            }
        }
    }

    #[inline]
    pub fn entries(&self) -> &[OopMapEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: VmSlot) -> Option<OopMapValue> {
        self.entries.iter().find(|e| e.slot == slot).map(|e| e.value)
    }

    /// Slots holding plain (wide or narrow) references.
    pub fn references(&self) -> impl Iterator<Item = VmSlot> + '_ {
        self.entries
            .iter()
            .filter(|e| matches!(e.value, OopMapValue::Oop | OopMapValue::NarrowOop))
            .map(|e| e.slot)
    }
}

// =============================================================================
// OopMapSet
// =============================================================================

/// All oop maps of one code object, sorted by pc offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMapSet {
    maps: Vec<OopMap>,
}

impl OopMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, map: OopMap) {
        match self.maps.last() {
            Some(last) if last.pc_offset > map.pc_offset => {
                let idx = self.maps.partition_point(|m| m.pc_offset <= map.pc_offset);
                self.maps.insert(idx, map);
            }
            _ => self.maps.push(map),
        }
    }

    /// The map recorded at exactly `pc_offset`.
    pub fn at(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|idx| &self.maps[idx])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.iter()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds oop maps from recorded reference locations and the compiler's
/// explicit reference map.
pub(crate) struct OopMapBuilder<'a> {
    backend: &'a dyn Backend,
    compressed_oops: bool,
    total_frame_size: u32,
}

impl<'a> OopMapBuilder<'a> {
    pub(crate) fn new(
        backend: &'a dyn Backend,
        compressed_oops: bool,
        total_frame_size: u32,
    ) -> Self {
        Self {
            backend,
            compressed_oops,
            total_frame_size,
        }
    }

    fn slot(&self, location: RawLocation) -> Result<VmSlot, InstallError> {
        match location {
            RawLocation::Register(number) => {
                Ok(VmSlot::Register(self.backend.decode_register(number)?))
            }
            RawLocation::StackSlot {
                offset,
                add_frame_size,
            } => Ok(VmSlot::Stack(stack_slot_offset(
                offset,
                add_frame_size,
                self.total_frame_size,
            )?)),
        }
    }

    pub(crate) fn build(
        &self,
        pc_offset: u32,
        references: &[Location],
        info: &DebugInfo,
    ) -> Result<OopMap, InstallError> {
        let mut map = OopMap::new(pc_offset, self.total_frame_size);

        for location in references {
            let value = match location.ty() {
                LocationType::NarrowOop => OopMapValue::NarrowOop,
                _ => OopMapValue::Oop,
            };
            map.add(VmSlot::from(*location), value)?;
        }

        if let Some(reference_map) = &info.reference_map {
            if reference_map.frame_size > self.total_frame_size {
                return Err(InstallError::ReferenceMapFrameTooLarge {
                    map: reference_map.frame_size,
                    frame: self.total_frame_size,
                });
            }
            for entry in &reference_map.entries {
                let value = match (entry.base, entry.size) {
                    (None, 8) => OopMapValue::Oop,
                    (None, 4) if self.compressed_oops => OopMapValue::NarrowOop,
                    (None, 4) => {
                        return Err(InstallError::CompressionDisabled {
                            pc: pc_offset,
                            what: "oops",
                        });
                    }
                    (Some(base), 8) => OopMapValue::Derived {
                        base: self.slot(base)?,
                    },
                    (_, size) => return Err(InstallError::InvalidReferenceSize(size)),
                };
                map.add(self.slot(entry.location)?, value)?;
            }
        }

        for save in &info.callee_save {
            let register = self.backend.decode_register(save.register)?;
            map.add(VmSlot::Stack(save.slot), OopMapValue::CalleeSaved { register })?;
        }

        Ok(map)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{BytecodePosition, CalleeSave, MethodHandle, RefMapEntry, ReferenceMap};
    use crate::reloc::Amd64Backend;

    static BACKEND: Amd64Backend = Amd64Backend;

    fn info() -> DebugInfo {
        DebugInfo::new(BytecodePosition::new(MethodHandle(1), 0))
    }

    fn stack(offset: i32) -> RawLocation {
        RawLocation::StackSlot {
            offset,
            add_frame_size: false,
        }
    }

    #[test]
    fn test_duplicate_locations_appear_once() {
        let builder = OopMapBuilder::new(&BACKEND, true, 48);
        let oop = Location::Stack {
            offset: 8,
            ty: LocationType::Oop,
        };
        let map = builder.build(4, &[oop, oop], &info()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(VmSlot::Stack(8)), Some(OopMapValue::Oop));
        assert_eq!(map.frame_size, 48);
    }

    #[test]
    fn test_reference_map_entries() {
        let builder = OopMapBuilder::new(&BACKEND, true, 48);
        let reference_map = ReferenceMap {
            frame_size: 48,
            entries: vec![
                RefMapEntry {
                    location: RawLocation::Register(3),
                    base: None,
                    size: 4,
                },
                RefMapEntry {
                    location: stack(16),
                    base: Some(stack(8)),
                    size: 8,
                },
                RefMapEntry {
                    location: RawLocation::StackSlot {
                        offset: -8,
                        add_frame_size: true,
                    },
                    base: None,
                    size: 8,
                },
            ],
        };
        let info = info()
            .with_reference_map(reference_map)
            .with_callee_save(vec![CalleeSave {
                register: 12,
                slot: 24,
            }]);

        let map = builder.build(0, &[], &info).unwrap();
        assert_eq!(
            map.get(VmSlot::Register(MachineReg::gpr(3))),
            Some(OopMapValue::NarrowOop)
        );
        assert_eq!(
            map.get(VmSlot::Stack(16)),
            Some(OopMapValue::Derived {
                base: VmSlot::Stack(8)
            })
        );
        assert_eq!(map.get(VmSlot::Stack(40)), Some(OopMapValue::Oop));
        assert_eq!(
            map.get(VmSlot::Stack(24)),
            Some(OopMapValue::CalleeSaved {
                register: MachineReg::gpr(12)
            })
        );
        assert_eq!(map.references().count(), 2);
    }

    #[test]
    fn test_reference_map_validation() {
        let builder = OopMapBuilder::new(&BACKEND, false, 32);
        let with = |frame_size, entry: RefMapEntry| {
            info().with_reference_map(ReferenceMap {
                frame_size,
                entries: vec![entry],
            })
        };
        let entry = |base, size| RefMapEntry {
            location: stack(0),
            base,
            size,
        };

        assert!(matches!(
            builder.build(0, &[], &with(64, entry(None, 8))),
            Err(InstallError::ReferenceMapFrameTooLarge { map: 64, frame: 32 })
        ));
        assert!(matches!(
            builder.build(0, &[], &with(32, entry(None, 2))),
            Err(InstallError::InvalidReferenceSize(2))
        ));
        assert!(matches!(
            builder.build(0, &[], &with(32, entry(Some(stack(8)), 4))),
            Err(InstallError::InvalidReferenceSize(4))
        ));
        assert!(matches!(
            builder.build(0, &[], &with(32, entry(None, 4))),
            Err(InstallError::CompressionDisabled { .. })
        ));
    }

    #[test]
    fn test_frame_relative_slot_overflow() {
        let builder = OopMapBuilder::new(&BACKEND, true, 48);
        let info = info().with_reference_map(ReferenceMap {
            frame_size: 48,
            entries: vec![RefMapEntry {
                location: RawLocation::StackSlot {
                    offset: i32::MAX - 8,
                    add_frame_size: true,
                },
                base: None,
                size: 8,
            }],
        });
        let err = builder.build(0, &[], &info).unwrap_err();
        assert!(matches!(
            err,
            InstallError::StackSlotOutOfRange { frame_size: 48, .. }
        ));
        assert_eq!(err.result(), crate::error::InstallResult::Bailout);
    }

    #[test]
    fn test_conflicting_entries() {
        let mut map = OopMap::new(12, 0);
        map.add(VmSlot::Stack(8), OopMapValue::Oop).unwrap();
        let err = map.add(VmSlot::Stack(8), OopMapValue::NarrowOop).unwrap_err();
        assert_eq!(
            err.to_string(),
            "conflicting oop map entries for [sp+8] at pc 0xc"
        );
    }

    #[test]
    fn test_set_lookup_by_pc() {
        let mut set = OopMapSet::new();
        set.insert(OopMap::new(20, 0));
        set.insert(OopMap::new(4, 0));
        set.insert(OopMap::new(12, 0));

        let pcs: Vec<_> = set.iter().map(|m| m.pc_offset).collect();
        assert_eq!(pcs, vec![4, 12, 20]);
        assert!(set.at(12).is_some());
        assert!(set.at(13).is_none());
    }
}
