//! Code objects and their publication.
//!
//! A [`CodeObject`] is the immutable result of an installation: the final
//! bytes plus every table the runtime consults while the code is live.
//! Publication goes through a [`Reservation`], which gives the space back
//! to the allocator on every path that does not reach a commit.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::{CodeBuffer, Section};
use crate::code::{CodeComment, CodeKind, CompiledCodeDescriptor, MetaspaceRef, ObjectHandle};
use crate::debug::DebugInfoSet;
use crate::dependencies::{Dependency, DependencySet};
use crate::error::InstallError;
use crate::exceptions::ExceptionHandlerTable;
use crate::oopmap::OopMapSet;
use crate::reloc::Relocation;
use crate::runtime::{CodeAllocator, CodeHandle, HostRuntime};

// =============================================================================
// Code Object
// =============================================================================

/// Entry points, as offsets into the instruction section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPoints {
    /// Entry that checks the receiver's class first.
    pub entry: u32,
    pub verified_entry: u32,
    pub osr_entry: Option<u32>,
    pub exception_handler: Option<u32>,
    pub deopt_handler: Option<u32>,
}

/// Offsets and lengths of the three sections within [`CodeObject::bytes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionLayout {
    pub constants_size: u32,
    pub instructions_offset: u32,
    pub instructions_size: u32,
    pub stubs_offset: u32,
    pub stubs_size: u32,
}

impl SectionLayout {
    fn of(buffer: &CodeBuffer) -> Self {
        Self {
            constants_size: buffer.section_len(Section::Constants),
            instructions_offset: buffer.section_start(Section::Instructions),
            instructions_size: buffer.section_len(Section::Instructions),
            stubs_offset: buffer.section_start(Section::Stubs),
            stubs_size: buffer.section_len(Section::Stubs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub name: String,
    pub kind: CodeKind,
    /// Constants, instructions and stubs, as laid out in the code cache.
    pub bytes: Box<[u8]>,
    pub layout: SectionLayout,
    pub entry_points: EntryPoints,
    pub relocations: Vec<Relocation>,
    pub oop_maps: OopMapSet,
    pub debug_info: DebugInfoSet,
    pub exception_table: ExceptionHandlerTable,
    pub dependencies: Vec<Dependency>,
    pub oops: Vec<ObjectHandle>,
    pub metadata: Vec<MetaspaceRef>,
    pub total_frame_size: u32,
    /// Frame offset of the saved original pc, when the code can deoptimize.
    pub orig_pc_offset: Option<i32>,
    pub parameter_count: u32,
    pub has_wide_vector: bool,
    pub comments: Vec<CodeComment>,
}

impl CodeObject {
    /// A code object with `instructions` and no tables.
    pub fn empty(name: impl Into<String>, kind: CodeKind, instructions: Vec<u8>) -> Self {
        let size = instructions.len() as u32;
        Self {
            name: name.into(),
            kind,
            bytes: instructions.into_boxed_slice(),
            layout: SectionLayout {
                instructions_size: size,
                stubs_offset: size,
                ..SectionLayout::default()
            },
            entry_points: EntryPoints::default(),
            relocations: Vec::new(),
            oop_maps: OopMapSet::default(),
            debug_info: DebugInfoSet::default(),
            exception_table: ExceptionHandlerTable::default(),
            dependencies: Vec::new(),
            oops: Vec::new(),
            metadata: Vec::new(),
            total_frame_size: 0,
            orig_pc_offset: None,
            parameter_count: 0,
            has_wide_vector: false,
            comments: Vec::new(),
        }
    }

    #[inline]
    pub fn constants(&self) -> &[u8] {
        &self.bytes[..self.layout.constants_size as usize]
    }

    #[inline]
    pub fn instructions(&self) -> &[u8] {
        let start = self.layout.instructions_offset as usize;
        &self.bytes[start..start + self.layout.instructions_size as usize]
    }

    #[inline]
    pub fn stubs(&self) -> &[u8] {
        let start = self.layout.stubs_offset as usize;
        &self.bytes[start..start + self.layout.stubs_size as usize]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Tables gathered by the site resolver, ready to be frozen.
pub(crate) struct CodeTables {
    pub entry_points: EntryPoints,
    pub relocations: Vec<Relocation>,
    pub oop_maps: OopMapSet,
    pub debug_info: DebugInfoSet,
    pub exception_table: ExceptionHandlerTable,
    pub oops: Vec<ObjectHandle>,
    pub metadata: Vec<MetaspaceRef>,
    pub orig_pc_offset: Option<i32>,
}

// =============================================================================
// Installed Code
// =============================================================================

/// A committed code object and where it lives.
#[derive(Debug, Clone)]
pub struct InstalledCode {
    handle: CodeHandle,
    base: u64,
    code: Arc<CodeObject>,
}

impl InstalledCode {
    #[inline]
    pub fn handle(&self) -> CodeHandle {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.code.name
    }

    /// Address of the first byte (the constants section).
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    /// Absolute address of the verified entry point.
    #[inline]
    pub fn verified_entry_address(&self) -> u64 {
        self.base
            + self.code.layout.instructions_offset as u64
            + self.code.entry_points.verified_entry as u64
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// Code cache space held for one installation.
///
/// Released on drop unless committed.
pub(crate) struct Reservation<'a, A: CodeAllocator + ?Sized> {
    allocator: &'a A,
    base: u64,
    committed: bool,
}

impl<'a, A: CodeAllocator + ?Sized> Reservation<'a, A> {
    pub(crate) fn new(allocator: &'a A, size: u64, alignment: u32) -> Result<Self, InstallError> {
        let base = allocator.reserve(size, alignment)?;
        Ok(Self {
            allocator,
            base,
            committed: false,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    fn commit(mut self, code: Arc<CodeObject>) -> Result<InstalledCode, InstallError> {
        let handle = self.allocator.commit(self.base, Arc::clone(&code))?;
        self.committed = true;
        Ok(InstalledCode {
            handle,
            base: self.base,
            code,
        })
    }
}

impl<A: CodeAllocator + ?Sized> Drop for Reservation<'_, A> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(base = format_args!("{:#x}", self.base), "releasing code reservation");
            self.allocator.release(self.base);
        }
    }
}

/// Check dependencies, freeze the buffer and tables, and publish.
///
/// On any failure the reservation is released and nothing is published.
pub(crate) fn finalize<R: HostRuntime>(
    runtime: &R,
    reservation: Reservation<'_, R>,
    descriptor: &CompiledCodeDescriptor,
    buffer: CodeBuffer,
    tables: CodeTables,
    dependencies: DependencySet,
) -> Result<InstalledCode, InstallError> {
    dependencies.validate(runtime)?;

    let layout = SectionLayout::of(&buffer);
    let code = CodeObject {
        name: descriptor.name.clone(),
        kind: descriptor.kind.clone(),
        bytes: buffer.into_bytes(),
        layout,
        entry_points: tables.entry_points,
        relocations: tables.relocations,
        oop_maps: tables.oop_maps,
        debug_info: tables.debug_info,
        exception_table: tables.exception_table,
        dependencies: dependencies.into_vec(),
        oops: tables.oops,
        metadata: tables.metadata,
        total_frame_size: descriptor.total_frame_size,
        orig_pc_offset: tables.orig_pc_offset,
        parameter_count: descriptor.parameter_count,
        has_wide_vector: descriptor.has_wide_vector,
        comments: descriptor.comments.clone(),
    };
    reservation.commit(Arc::new(code))
}
