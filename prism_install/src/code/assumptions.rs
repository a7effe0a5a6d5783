use serde::{Deserialize, Serialize};

use super::{ClassHandle, MethodHandle, ObjectHandle};

/// A fact about the class hierarchy or heap the compiler relied on.
///
/// If any of these stops holding, the installed code must be invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Assumption {
    /// `receiver` has no subclass that overrides `finalize`.
    NoFinalizableSubclass { receiver: ClassHandle },
    /// `subtype` is the only concrete subtype of the abstract `context`.
    ConcreteSubtype {
        context: ClassHandle,
        subtype: ClassHandle,
    },
    /// `context` has no subclasses.
    LeafType { context: ClassHandle },
    /// `implementation` is the only implementation of `method` reachable from `context`.
    ConcreteMethod {
        method: MethodHandle,
        context: ClassHandle,
        implementation: MethodHandle,
    },
    /// A mutable call site currently points at `target`.
    CallSiteTargetValue {
        call_site: ObjectHandle,
        target: ObjectHandle,
    },
}
