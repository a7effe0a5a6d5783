//! In-process runtime: metadata tables plus a [`CodeCache`].
//!
//! Used by tests and benchmarks, and by embedders that manage their own
//! metadata. All tables are concurrent, so one `LocalRuntime` can serve
//! installations from several compiler threads.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;

use super::{
    AllocError, CardTableInfo, CodeAllocator, CodeCache, CodeHandle, MetadataStore, MethodInfo,
    RuntimeError,
};
use crate::code::{ClassHandle, InvokeKind, MetaspaceRef, MethodHandle, ObjectHandle};
use crate::dependencies::Dependency;
use crate::finalizer::CodeObject;

/// Start of the simulated code cache.
pub const DEFAULT_CODE_BASE: u64 = 0x1000_0000;
/// Simulated safepoint polling page.
pub const DEFAULT_POLLING_PAGE: u64 = 0x0800_0000;
/// Simulated inline-cache miss handler virtual calls start out at.
pub const DEFAULT_IC_MISS_STUB: u64 = 0x0C00_0000;
/// Simulated base of the compressed heap.
pub const DEFAULT_HEAP_BASE: u64 = 0x8_0000_0000;

#[derive(Debug, Clone, Copy)]
struct MethodRecord {
    info: MethodInfo,
    entry: u64,
    address: u64,
}

pub struct LocalRuntime {
    methods: DashMap<MethodHandle, MethodRecord>,
    objects: DashMap<ObjectHandle, u64>,
    classes: DashMap<ClassHandle, u64>,
    reexecute: DashSet<(MethodHandle, i32)>,
    violated: RwLock<FxHashSet<Dependency>>,
    heap_base: u64,
    oop_shift: u8,
    polling_page: u64,
    ic_miss_stub: u64,
    card_table: Option<CardTableInfo>,
    cache: CodeCache,
}

impl LocalRuntime {
    /// A runtime whose code cache holds `capacity` bytes at [`DEFAULT_CODE_BASE`].
    pub fn new(capacity: u64) -> Self {
        Self::with_code_cache(CodeCache::new(DEFAULT_CODE_BASE, capacity))
    }

    pub fn with_code_cache(cache: CodeCache) -> Self {
        Self {
            methods: DashMap::new(),
            objects: DashMap::new(),
            classes: DashMap::new(),
            reexecute: DashSet::new(),
            violated: RwLock::new(FxHashSet::default()),
            heap_base: DEFAULT_HEAP_BASE,
            oop_shift: 3,
            polling_page: DEFAULT_POLLING_PAGE,
            ic_miss_stub: DEFAULT_IC_MISS_STUB,
            card_table: Some(CardTableInfo {
                base: 0x0900_0000,
                shift: 9,
            }),
            cache,
        }
    }

    pub fn with_polling_page(mut self, page: u64) -> Self {
        self.polling_page = page;
        self
    }

    pub fn with_card_table(mut self, card_table: CardTableInfo) -> Self {
        self.card_table = Some(card_table);
        self
    }

    /// A runtime whose collector uses no card-marking barrier.
    pub fn without_card_table(mut self) -> Self {
        self.card_table = None;
        self
    }

    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    #[inline]
    pub fn ic_miss_stub(&self) -> u64 {
        self.ic_miss_stub
    }

    /// Register `method` with its compiled or interpreter entry at `entry`.
    ///
    /// The method's metadata lives at `address`.
    pub fn define_method(&self, method: MethodHandle, info: MethodInfo, entry: u64, address: u64) {
        self.methods.insert(
            method,
            MethodRecord {
                info,
                entry,
                address,
            },
        );
    }

    /// Register a heap object living at `address`.
    pub fn define_object(&self, object: ObjectHandle, address: u64) {
        self.objects.insert(object, address);
    }

    /// Register a class whose metadata lives at `address`.
    pub fn define_class(&self, class: ClassHandle, address: u64) {
        self.classes.insert(class, address);
    }

    /// Make deoptimization at `method`/`bci` re-execute the bytecode.
    pub fn set_reexecute(&self, method: MethodHandle, bci: i32) {
        self.reexecute.insert((method, bci));
    }

    /// Mark `dependency` as broken (e.g. a class was loaded).
    pub fn invalidate(&self, dependency: Dependency) {
        self.violated.write().insert(dependency);
    }

    /// Compressed form of `address`, relative to `base`.
    fn compress(&self, address: u64, base: u64, what: &str) -> Result<u64, RuntimeError> {
        let narrow = address
            .checked_sub(base)
            .map(|offset| offset >> self.oop_shift)
            .filter(|&narrow| narrow <= u32::MAX as u64)
            .ok_or_else(|| {
                RuntimeError::new(
                    "IllegalArgumentException",
                    format!("{what} at {address:#x} cannot be compressed"),
                )
            })?;
        Ok(narrow)
    }

    fn method(&self, method: MethodHandle) -> Result<MethodRecord, RuntimeError> {
        self.methods
            .get(&method)
            .map(|record| *record)
            .ok_or_else(|| RuntimeError::new("NoSuchMethodError", format!("method {}", method.0)))
    }

    fn class(&self, class: ClassHandle) -> Result<u64, RuntimeError> {
        self.classes
            .get(&class)
            .map(|address| *address)
            .ok_or_else(|| RuntimeError::new("NoClassDefFoundError", format!("class {}", class.0)))
    }
}

impl MetadataStore for LocalRuntime {
    fn method_info(&self, method: MethodHandle) -> Result<MethodInfo, RuntimeError> {
        self.method(method).map(|record| record.info)
    }

    fn call_entry(&self, method: MethodHandle, kind: InvokeKind) -> Result<u64, RuntimeError> {
        let record = self.method(method)?;
        Ok(match kind {
            InvokeKind::Virtual | InvokeKind::Interface => self.ic_miss_stub,
            InvokeKind::Static | InvokeKind::Special | InvokeKind::Inline => record.entry,
        })
    }

    fn should_reexecute(&self, method: MethodHandle, bci: i32) -> Result<bool, RuntimeError> {
        Ok(self.reexecute.contains(&(method, bci)))
    }

    fn oop_bits(&self, object: ObjectHandle, narrow: bool) -> Result<u64, RuntimeError> {
        let address = self.objects.get(&object).map(|a| *a).ok_or_else(|| {
            RuntimeError::new("IllegalArgumentException", format!("unknown object {}", object.0))
        })?;
        if narrow {
            self.compress(address, self.heap_base, "object")
        } else {
            Ok(address)
        }
    }

    fn metadata_bits(&self, reference: MetaspaceRef, narrow: bool) -> Result<u64, RuntimeError> {
        match reference {
            MetaspaceRef::Class(class) => {
                let address = self.class(class)?;
                if narrow {
                    self.compress(address, 0, "class")
                } else {
                    Ok(address)
                }
            }
            MetaspaceRef::Method(_) if narrow => Err(RuntimeError::new(
                "IllegalArgumentException",
                "method pointers cannot be compressed",
            )),
            MetaspaceRef::Method(method) => self.method(method).map(|record| record.address),
        }
    }

    fn polling_page(&self) -> Result<u64, RuntimeError> {
        Ok(self.polling_page)
    }

    fn card_table(&self) -> Result<CardTableInfo, RuntimeError> {
        self.card_table.ok_or_else(|| {
            RuntimeError::new("InternalError", "barrier set has no card table")
        })
    }

    fn dependency_holds(&self, dependency: &Dependency) -> Result<bool, RuntimeError> {
        Ok(!self.violated.read().contains(dependency))
    }
}

impl CodeAllocator for LocalRuntime {
    fn reserve(&self, size: u64, alignment: u32) -> Result<u64, AllocError> {
        self.cache.reserve(size, alignment)
    }

    fn release(&self, base: u64) {
        self.cache.release(base);
    }

    fn commit(&self, base: u64, code: Arc<CodeObject>) -> Result<CodeHandle, AllocError> {
        self.cache.commit(base, code)
    }
}
