//! Flattening of virtual object graphs into per-record object tables.
//!
//! Virtual objects reference each other freely, cycles included. The table
//! is built in two passes so that no pass ever recurses:
//!
//! 1. Discovery walks breadth-first from the roots (innermost frame first;
//!    locals, expressions, then monitor owners) and assigns each object its
//!    table index the first time it is seen.
//! 2. Fill-in resolves every field. Nested objects become
//!    [`ScopeValue::VirtualObjectReference`]s to indices assigned in pass 1.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use super::values::ValueResolver;
use super::{ObjectEntry, ObjectId, ScopeValue};
use crate::arena::Arena;
use crate::code::{DebugInfo, VirtualObject, VirtualObjectId};
use crate::error::InstallError;

/// Rematerializable objects of one debug record, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTable {
    entries: Arena<ObjectEntry>,
}

impl ObjectTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectEntry)> {
        self.entries.iter()
    }

    /// Entry built from the compiler-side object `source`.
    pub fn find(&self, source: VirtualObjectId) -> Option<(ObjectId, &ObjectEntry)> {
        self.entries.iter().find(|(_, entry)| entry.source == source)
    }

    /// Re-run discovery from `roots` over this already flattened table.
    ///
    /// Yields an identical table for a table produced by flattening with
    /// the same roots; anything else is renumbered into discovery order.
    pub fn reflatten(&self, roots: &[ScopeValue]) -> Result<ObjectTable, InstallError> {
        let mut remap: FxHashMap<ObjectId, ObjectId> = FxHashMap::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        let mut visit = |id: ObjectId, queue: &mut VecDeque<ObjectId>| -> Result<(), InstallError> {
            if remap.contains_key(&id) {
                return Ok(());
            }
            if self.entries.get(id).is_none() {
                return Err(InstallError::UnknownVirtualObject(VirtualObjectId(id.index())));
            }
            remap.insert(id, ObjectId::new(order.len() as u32));
            order.push(id);
            queue.push_back(id);
            Ok(())
        };

        for id in roots.iter().filter_map(|v| v.object_id()) {
            visit(id, &mut queue)?;
        }
        while let Some(id) = queue.pop_front() {
            for field in self.entries[id].fields.iter().filter_map(|v| v.object_id()) {
                visit(field, &mut queue)?;
            }
        }

        let entries = order
            .iter()
            .map(|&old| {
                let entry = &self.entries[old];
                ObjectEntry {
                    fields: entry
                        .fields
                        .iter()
                        .map(|field| match field {
                            ScopeValue::VirtualObjectReference(id) => {
                                ScopeValue::VirtualObjectReference(remap[id])
                            }
                            other => *other,
                        })
                        .collect(),
                    ..entry.clone()
                }
            })
            .collect();
        Ok(ObjectTable { entries })
    }
}

/// Pass 1 bookkeeping.
struct Discovery<'v> {
    pool: FxHashMap<VirtualObjectId, &'v VirtualObject>,
    order: Vec<&'v VirtualObject>,
    queue: VecDeque<&'v VirtualObject>,
}

impl<'v> Discovery<'v> {
    fn visit(
        &mut self,
        id: VirtualObjectId,
        bound: &mut FxHashMap<VirtualObjectId, ObjectId>,
    ) -> Result<(), InstallError> {
        if bound.contains_key(&id) {
            return Ok(());
        }
        let object = *self
            .pool
            .get(&id)
            .ok_or(InstallError::UnknownVirtualObject(id))?;
        bound.insert(id, ObjectId::new(self.order.len() as u32));
        self.order.push(object);
        self.queue.push_back(object);
        Ok(())
    }
}

/// Build the object table for `info` and bind its ids in `resolver`.
///
/// Objects in the pool that no root reaches are left out.
pub(crate) fn flatten(
    resolver: &mut ValueResolver<'_>,
    info: &DebugInfo,
) -> Result<ObjectTable, InstallError> {
    resolver.reset();

    let mut pool = FxHashMap::default();
    for object in &info.virtual_objects {
        if pool.insert(object.id, object).is_some() {
            return Err(InstallError::DuplicateVirtualObject(object.id));
        }
    }
    if pool.is_empty() {
        return Ok(ObjectTable::default());
    }

    let mut discovery = Discovery {
        pool,
        order: Vec::new(),
        queue: VecDeque::new(),
    };
    let roots = info
        .position
        .chain()
        .filter_map(|pos| pos.frame.as_ref())
        .flat_map(|frame| frame.values.iter());
    for id in roots.filter_map(|v| v.virtual_id()) {
        discovery.visit(id, &mut resolver.objects)?;
    }
    while let Some(object) = discovery.queue.pop_front() {
        for id in object.values.iter().filter_map(|v| v.virtual_id()) {
            discovery.visit(id, &mut resolver.objects)?;
        }
    }

    let mut entries = Arena::with_capacity(discovery.order.len());
    for object in discovery.order {
        if object.slot_kinds.len() != object.values.len() {
            return Err(InstallError::InvalidVirtualObject {
                id: object.id,
                reason: "field kinds and values differ in length",
            });
        }
        let long_array = object.is_long_array();
        let mut fields = Vec::with_capacity(object.values.len());
        for (kind, value) in object.slot_kinds.iter().zip(&object.values) {
            let (value, second) = resolver.resolve(value, *kind)?;
            match second {
                Some(second) => fields.push(second),
                // ints packed into a long array still take two slots
                None if long_array => fields.push(ScopeValue::ZERO),
                None => {}
            }
            fields.push(value);
        }
        entries.alloc(ObjectEntry {
            source: object.id,
            class: object.class,
            kind: object.kind,
            fields,
        });
    }
    Ok(ObjectTable { entries })
}

// =============================================================================
// Tests
// =============================================================================
