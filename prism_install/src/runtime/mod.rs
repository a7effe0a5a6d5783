//! The installer's view of the host runtime.
//!
//! Two seams separate the installer from the VM it installs into:
//! - [`MetadataStore`] answers questions about methods, classes, heap
//!   objects and dependencies.
//! - [`CodeAllocator`] places code objects in the code cache.
//!
//! [`local::LocalRuntime`] implements both in memory and backs the tests.

mod code_cache;
pub mod local;

pub use code_cache::{CodeCache, CodeCacheStats};

use std::sync::Arc;

use thiserror::Error;

use crate::code::{ClassHandle, InvokeKind, MetaspaceRef, MethodHandle, ObjectHandle};
use crate::dependencies::Dependency;
use crate::finalizer::CodeObject;

// =============================================================================
// Errors
// =============================================================================

/// An exception raised by a runtime callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{exception}: {message}")]
pub struct RuntimeError {
    /// Exception class name, e.g. `NoSuchMethodError`.
    pub exception: String,
    pub message: String,
}

impl RuntimeError {
    pub fn new(exception: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception: exception.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("code cache full: {requested} bytes requested, {available} available")]
    CacheFull { requested: u64, available: u64 },

    #[error("no outstanding reservation at {0:#x}")]
    UnknownReservation(u64),
}

// =============================================================================
// Metadata
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub holder: ClassHandle,
    pub is_static: bool,
    /// The method's return type is a reference type.
    pub returns_reference: bool,
}

/// Card table used by the GC write barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardTableInfo {
    /// Biased base address.
    pub base: u64,
    /// log2 of the card size.
    pub shift: u8,
}

/// Read-only queries against the runtime's metadata.
///
/// Callbacks may block. An `Err` aborts the installation with a
/// pending-exception result.
pub trait MetadataStore {
    fn method_info(&self, method: MethodHandle) -> Result<MethodInfo, RuntimeError>;

    /// Address a call of `kind` to `method` should initially branch to.
    fn call_entry(&self, method: MethodHandle, kind: InvokeKind) -> Result<u64, RuntimeError>;

    /// Whether a deoptimization at `method`/`bci` re-executes the bytecode.
    fn should_reexecute(&self, method: MethodHandle, bci: i32) -> Result<bool, RuntimeError>;

    /// Bits to embed for `object`; `narrow` selects the compressed encoding.
    fn oop_bits(&self, object: ObjectHandle, narrow: bool) -> Result<u64, RuntimeError>;

    /// Bits to embed for `reference`; `narrow` selects the compressed encoding.
    fn metadata_bits(&self, reference: MetaspaceRef, narrow: bool) -> Result<u64, RuntimeError>;

    /// Page that safepoint polls read from.
    fn polling_page(&self) -> Result<u64, RuntimeError>;

    /// Card table of the barrier set, if it has one.
    fn card_table(&self) -> Result<CardTableInfo, RuntimeError>;

    /// Whether `dependency` currently holds.
    fn dependency_holds(&self, dependency: &Dependency) -> Result<bool, RuntimeError>;
}

// =============================================================================
// Code Allocation
// =============================================================================

/// Identity of a committed code object in the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeHandle(pub u64);

/// Code cache placement.
///
/// Space is reserved before patching so that absolute addresses are known,
/// and either committed with the finished code object or released.
pub trait CodeAllocator {
    /// Reserve `size` bytes aligned to `alignment`; returns the base address.
    fn reserve(&self, size: u64, alignment: u32) -> Result<u64, AllocError>;

    /// Give back an uncommitted reservation.
    fn release(&self, base: u64);

    /// Publish `code` at the reservation starting at `base`.
    fn commit(&self, base: u64, code: Arc<CodeObject>) -> Result<CodeHandle, AllocError>;
}

/// Everything an installation needs from the host.
pub trait HostRuntime: MetadataStore + CodeAllocator {}

impl<T: MetadataStore + CodeAllocator + ?Sized> HostRuntime for T {}
