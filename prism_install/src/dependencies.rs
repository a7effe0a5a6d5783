//! Dependencies: assumptions the installed code stays valid under.
//!
//! The compiler states its assumptions about the class hierarchy and the
//! heap; the installer turns them into runtime dependencies, checks them
//! right before the code is published and hands them to the runtime, which
//! invalidates the code when one is broken later.

use rustc_hash::FxHashSet;

use crate::code::{
    Assumption, ClassHandle, CodeKind, CompiledCodeDescriptor, MethodHandle, ObjectHandle,
};
use crate::config::InstallerConfig;
use crate::error::InstallError;
use crate::runtime::MetadataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    HasNoFinalizableSubclasses {
        class: ClassHandle,
    },
    AbstractWithUniqueConcreteSubtype {
        context: ClassHandle,
        subtype: ClassHandle,
    },
    LeafType {
        context: ClassHandle,
    },
    /// `method` is the only implementation reachable from `context`.
    UniqueConcreteMethod {
        context: ClassHandle,
        method: MethodHandle,
    },
    CallSiteTargetValue {
        call_site: ObjectHandle,
        target: ObjectHandle,
    },
    /// `method` was inlined and must not be redefined.
    EvolMethod {
        method: MethodHandle,
    },
}

impl From<Assumption> for Dependency {
    fn from(assumption: Assumption) -> Self {
        match assumption {
            Assumption::NoFinalizableSubclass { receiver } => {
                Dependency::HasNoFinalizableSubclasses { class: receiver }
            }
            Assumption::ConcreteSubtype { context, subtype } => {
                Dependency::AbstractWithUniqueConcreteSubtype { context, subtype }
            }
            Assumption::LeafType { context } => Dependency::LeafType { context },
            Assumption::ConcreteMethod {
                context,
                implementation,
                ..
            } => Dependency::UniqueConcreteMethod {
                context,
                method: implementation,
            },
            Assumption::CallSiteTargetValue { call_site, target } => {
                Dependency::CallSiteTargetValue { call_site, target }
            }
        }
    }
}

/// Deduplicated dependencies in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    list: Vec<Dependency>,
    seen: FxHashSet<Dependency>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the dependencies of `descriptor`.
    pub fn for_descriptor(
        config: &InstallerConfig,
        descriptor: &CompiledCodeDescriptor,
    ) -> Result<Self, InstallError> {
        let mut set = Self::new();
        if descriptor.kind == CodeKind::Stub {
            if !descriptor.assumptions.is_empty() {
                return Err(InstallError::AssumptionsOnStub);
            }
            return Ok(set);
        }
        for assumption in &descriptor.assumptions {
            set.push(Dependency::from(*assumption));
        }
        if config.track_method_evolution {
            for method in &descriptor.methods {
                set.push(Dependency::EvolMethod { method: *method });
            }
        }
        Ok(set)
    }

    /// Add `dependency` unless already present.
    pub fn push(&mut self, dependency: Dependency) -> bool {
        let added = self.seen.insert(dependency);
        if added {
            self.list.push(dependency);
        }
        added
    }

    #[inline]
    pub fn as_slice(&self) -> &[Dependency] {
        &self.list
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Fail with the first dependency the runtime reports as broken.
    pub fn validate(&self, store: &dyn MetadataStore) -> Result<(), InstallError> {
        for dependency in &self.list {
            if !store.dependency_holds(dependency)? {
                return Err(InstallError::DependencyInvalidated(*dependency));
            }
        }
        Ok(())
    }

    pub fn into_vec(self) -> Vec<Dependency> {
        self.list
    }
}
