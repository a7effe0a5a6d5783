//! The installation pipeline.
//!
//! One [`CodeInstaller`] handles one descriptor:
//!
//! ```text
//! descriptor ──► size + reserve ──► fill sections ──► data patches
//!                                                         │
//!        publish ◄── dependencies ◄── end checks ◄── sites (pc order)
//! ```
//!
//! Sites are resolved strictly in pc order. Marks set entry points or
//! announce the kind of the next call; calls, safepoints and infopoints
//! record scopes and oop maps; data patches embed heap and metadata
//! references. Every failure aborts the whole installation, and the code
//! cache reservation is released on the way out.

use std::fmt;

use tracing::{debug, debug_span, trace, warn};

use crate::buffer::{BufferLayout, CodeBuffer, STUB_ALIGNMENT, Section, align_up};
use crate::code::{
    CallSite, CallTarget, CodeKind, CompiledCodeDescriptor, DebugInfo, INVOCATION_ENTRY_BCI,
    InvokeKind, MarkId, MetaspaceRef, MethodHandle, PatchConstant, RawLocation, Reference, Site,
    SiteKind, ValueKind,
};
use crate::config::InstallerConfig;
use crate::debug::{DebugInfoRecorder, ScopeMode, stack_slot_offset};
use crate::dependencies::DependencySet;
use crate::error::{InstallError, InstallResult};
use crate::exceptions::ExceptionHandlerTable;
use crate::finalizer::{CodeTables, EntryPoints, InstalledCode, Reservation, finalize};
use crate::oopmap::{OopMapBuilder, OopMapSet};
use crate::reloc::{Backend, ImmWidth, ReferenceRecorder, RelocKind, Relocation, backend_for};
use crate::runtime::HostRuntime;

// =============================================================================
// Entry Points
// =============================================================================

/// Install `descriptor` into `runtime`.
pub fn install<R: HostRuntime>(
    config: &InstallerConfig,
    runtime: &R,
    descriptor: &CompiledCodeDescriptor,
) -> Result<InstalledCode, InstallError> {
    let span = debug_span!("install", name = %descriptor.name, arch = %config.arch);
    let _guard = span.enter();

    let result = CodeInstaller::new(config, runtime, descriptor).and_then(CodeInstaller::run);
    match &result {
        Ok(installed) => debug!(
            base = format_args!("{:#x}", installed.base()),
            size = installed.code().size(),
            "installed"
        ),
        Err(err) => warn!(error = %err, result = %err.result(), "installation failed"),
    }
    result
}

/// Decode a serialized descriptor and install it.
pub fn install_serialized<R: HostRuntime>(
    config: &InstallerConfig,
    runtime: &R,
    bytes: &[u8],
) -> Result<InstalledCode, InstallError> {
    let descriptor = CompiledCodeDescriptor::decode(bytes)?;
    install(config, runtime, &descriptor)
}

/// Like [`install`], but reports the coarse result code alongside the error.
pub fn install_outcome<R: HostRuntime>(
    config: &InstallerConfig,
    runtime: &R,
    descriptor: &CompiledCodeDescriptor,
) -> InstallOutcome {
    InstallOutcome::from(install(config, runtime, descriptor))
}

/// Result code plus the installed code or the failure.
#[derive(Debug)]
pub struct InstallOutcome {
    pub result: InstallResult,
    pub code: Option<InstalledCode>,
    pub error: Option<InstallError>,
}

impl InstallOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

impl From<Result<InstalledCode, InstallError>> for InstallOutcome {
    fn from(result: Result<InstalledCode, InstallError>) -> Self {
        match result {
            Ok(code) => Self {
                result: InstallResult::Success,
                code: Some(code),
                error: None,
            },
            Err(error) => Self {
                result: error.result(),
                code: None,
                error: Some(error),
            },
        }
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.error) {
            (Some(code), _) => {
                write!(f, "{} ({} at {:#x})", self.result, code.name(), code.base())
            }
            (None, Some(error)) => write!(f, "{}: {error}", self.result),
            (None, None) => write!(f, "{}", self.result),
        }
    }
}

// =============================================================================
// Installer
// =============================================================================

/// An invoke mark waiting for its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingInvoke {
    kind: InvokeKind,
    pc: u32,
}

/// Entry offsets seen so far; each may be set once.
#[derive(Debug, Default)]
struct EntryMarks {
    entry: Option<u32>,
    verified_entry: Option<u32>,
    osr_entry: Option<u32>,
    exception_handler: Option<u32>,
    deopt_handler: Option<u32>,
}

impl EntryMarks {
    fn set(&mut self, mark: MarkId, pc: u32) -> Result<(), InstallError> {
        let slot = match mark {
            MarkId::UnverifiedEntry => &mut self.entry,
            MarkId::VerifiedEntry => &mut self.verified_entry,
            MarkId::OsrEntry => &mut self.osr_entry,
            MarkId::ExceptionHandlerEntry => &mut self.exception_handler,
            MarkId::DeoptHandlerEntry => &mut self.deopt_handler,
            _ => return Ok(()),
        };
        if slot.is_some() {
            return Err(InstallError::DuplicateEntryMark { mark, pc });
        }
        *slot = Some(pc);
        Ok(())
    }

    fn into_entry_points(self) -> EntryPoints {
        let entry = self.entry.unwrap_or(0);
        EntryPoints {
            entry,
            verified_entry: self.verified_entry.unwrap_or(entry),
            osr_entry: self.osr_entry,
            exception_handler: self.exception_handler,
            deopt_handler: self.deopt_handler,
        }
    }
}

/// Stub space needed by `descriptor`'s call sites.
///
/// One interpreter-transfer stub per statically bound Java call (a call
/// without an invoke mark may become one) and one trampoline per direct
/// branch to a fixed target.
fn estimate_stub_space(backend: &dyn Backend, descriptor: &CompiledCodeDescriptor) -> u64 {
    let stub = align_up(backend.static_call_stub_size() as u64, STUB_ALIGNMENT as u64);
    let trampoline = align_up(backend.trampoline_size() as u64, STUB_ALIGNMENT as u64);

    let mut pending = None;
    let mut size = 0u64;
    for site in &descriptor.sites {
        match &site.kind {
            SiteKind::Mark(mark) if mark.invoke_kind().is_some() => pending = Some(*mark),
            SiteKind::Call(call) => {
                let mark = pending.take();
                if let CallTarget::Method(_) = call.target {
                    if mark.is_none_or(MarkId::needs_static_call_stub) {
                        size += stub;
                    }
                }
                if call.direct && !matches!(call.target, CallTarget::Indirect) {
                    size += trampoline;
                }
            }
            _ => {}
        }
    }
    size
}

/// Installs a single descriptor.
///
/// Most callers want [`install`]; driving the installer by hand is useful
/// to inspect intermediate state in tests.
pub struct CodeInstaller<'a, R: HostRuntime> {
    config: &'a InstallerConfig,
    runtime: &'a R,
    descriptor: &'a CompiledCodeDescriptor,
    backend: &'static dyn Backend,
    buffer: CodeBuffer,
    reservation: Reservation<'a, R>,
    dependencies: DependencySet,
    recorder: DebugInfoRecorder<'a>,
    oop_builder: OopMapBuilder<'a>,
    oop_maps: OopMapSet,
    references: ReferenceRecorder,
    relocations: Vec<Relocation>,
    exception_table: ExceptionHandlerTable,
    entries: EntryMarks,
    pending_invoke: Option<PendingInvoke>,
    last_pc: Option<u32>,
    orig_pc_offset: Option<i32>,
}

impl<'a, R: HostRuntime> CodeInstaller<'a, R> {
    /// Size the code, reserve space for it and lay out the sections.
    ///
    /// Data-section patches are applied here; sites are left to
    /// [`process_site`](Self::process_site).
    pub fn new(
        config: &'a InstallerConfig,
        runtime: &'a R,
        descriptor: &'a CompiledCodeDescriptor,
    ) -> Result<Self, InstallError> {
        config.validate()?;
        if descriptor.word_kind != ValueKind::Long {
            return Err(InstallError::WordKindMismatch(descriptor.word_kind));
        }
        let alignment = descriptor.data_section_alignment;
        if !alignment.is_power_of_two() {
            return Err(InstallError::InvalidDataAlignment(alignment));
        }
        let dependencies = DependencySet::for_descriptor(config, descriptor)?;
        let orig_pc_offset = orig_pc_offset(descriptor)?;
        let backend = backend_for(config.arch);

        let limit = config.max_code_size;
        let too_large = |size: u64| InstallError::CodeTooLarge { size, limit };
        let code_size = descriptor.code.len() as u64;
        let stub_space = estimate_stub_space(backend, descriptor);
        if code_size > limit as u64 || stub_space > limit as u64 {
            return Err(too_large(code_size + stub_space));
        }
        let layout = BufferLayout {
            constants_size: descriptor.constants_size(),
            constants_alignment: alignment,
            instructions_size: code_size as u32,
            instructions_alignment: config.code_alignment,
            stub_capacity: stub_space as u32,
        };
        let total = layout.total_size();
        if total > limit as u64 {
            return Err(too_large(total));
        }
        debug!(
            constants = layout.constants_size,
            instructions = layout.instructions_size,
            stubs = layout.stub_capacity,
            total,
            "sized code buffer"
        );

        let reservation = Reservation::new(runtime, total, layout.base_alignment())?;
        let mut buffer = CodeBuffer::new(&layout);
        buffer.set_base(reservation.base());
        buffer.fill(Section::Constants, &descriptor.data_section)?;
        buffer.fill(Section::Instructions, &descriptor.code)?;

        let compressed_oops = config.use_compressed_oops;
        let frame_size = descriptor.total_frame_size;
        let mut installer = Self {
            config,
            runtime,
            descriptor,
            backend,
            buffer,
            reservation,
            dependencies,
            recorder: DebugInfoRecorder::new(backend, runtime, compressed_oops, frame_size),
            oop_builder: OopMapBuilder::new(backend, compressed_oops, frame_size),
            oop_maps: OopMapSet::new(),
            references: ReferenceRecorder::new(),
            relocations: Vec::new(),
            exception_table: ExceptionHandlerTable::new(),
            entries: EntryMarks::default(),
            pending_invoke: None,
            last_pc: None,
            orig_pc_offset,
        };
        installer.apply_data_patches()?;
        Ok(installer)
    }

    /// Process every site, then finish.
    pub fn run(mut self) -> Result<InstalledCode, InstallError> {
        let descriptor = self.descriptor;
        for site in &descriptor.sites {
            self.process_site(site)?;
        }
        self.finish()
    }

    /// Address the code will live at.
    #[inline]
    pub fn base(&self) -> u64 {
        self.buffer.base()
    }

    #[inline]
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    #[inline]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Kind and pc of the invoke mark still waiting for its call.
    #[inline]
    pub fn pending_invoke(&self) -> Option<(InvokeKind, u32)> {
        self.pending_invoke.map(|p| (p.kind, p.pc))
    }

    #[inline]
    fn code_size(&self) -> u32 {
        self.buffer.section_len(Section::Instructions)
    }

    // =========================================================================
    // Data Section
    // =========================================================================

    fn apply_data_patches(&mut self) -> Result<(), InstallError> {
        let descriptor = self.descriptor;
        for patch in &descriptor.data_section_patches {
            let offset = patch.offset;
            let Reference::Constant {
                constant,
                compressed,
            } = patch.reference
            else {
                return Err(InstallError::InvalidDataSectionConstant(
                    "data section reference",
                ));
            };
            match constant {
                PatchConstant::Object(_) if compressed => {
                    return Err(InstallError::InvalidDataSectionConstant(
                        "compressed object",
                    ));
                }
                PatchConstant::Object(object) => {
                    let bits = self.runtime.oop_bits(object, false)?;
                    self.write_data(offset, &bits.to_le_bytes())?;
                    let index = self.references.record_oop(object);
                    self.relocations.push(Relocation::new(
                        Section::Constants,
                        offset,
                        RelocKind::Oop {
                            index,
                            narrow: false,
                        },
                    ));
                }
                PatchConstant::Metaspace(MetaspaceRef::Method(_)) if compressed => {
                    return Err(InstallError::InvalidDataSectionConstant(
                        "compressed method pointer",
                    ));
                }
                PatchConstant::Metaspace(reference) => {
                    if compressed && !self.config.use_compressed_class_pointers {
                        return Err(InstallError::CompressionDisabled {
                            pc: offset,
                            what: "class pointers",
                        });
                    }
                    let bits = self.runtime.metadata_bits(reference, compressed)?;
                    if compressed {
                        let narrow = u32::try_from(bits).map_err(|_| {
                            InstallError::ImmediateOverflow {
                                pc: offset,
                                value: bits,
                                bits: 32,
                            }
                        })?;
                        self.write_data(offset, &narrow.to_le_bytes())?;
                    } else {
                        self.write_data(offset, &bits.to_le_bytes())?;
                    }
                    let index = self.references.record_metadata(reference);
                    self.relocations.push(Relocation::new(
                        Section::Constants,
                        offset,
                        RelocKind::Metadata {
                            index,
                            narrow: compressed,
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    fn write_data(&mut self, offset: u32, bytes: &[u8]) -> Result<(), InstallError> {
        let size = self.buffer.section_len(Section::Constants);
        let width = bytes.len() as u32;
        if offset as u64 + width as u64 > size as u64 {
            return Err(InstallError::DataPatchOutOfBounds {
                offset,
                width,
                size,
            });
        }
        self.buffer.patch(Section::Constants, offset, bytes)
    }

    // =========================================================================
    // Sites
    // =========================================================================

    /// Resolve one site. Sites must arrive in non-decreasing pc order.
    pub fn process_site(&mut self, site: &Site) -> Result<(), InstallError> {
        let pc = site.pc_offset;
        if let Some(previous) = self.last_pc {
            if pc < previous {
                return Err(InstallError::SiteOutOfOrder { pc, previous });
            }
        }
        let size = self.code_size();
        if pc > size {
            return Err(InstallError::PcOutOfBounds { pc, size });
        }
        trace!(pc, kind = site.kind_name(), "site");

        match &site.kind {
            SiteKind::Mark(mark) => self.site_mark(pc, *mark)?,
            SiteKind::Call(call) => self.site_call(pc, call)?,
            SiteKind::Safepoint(info) => self.record_safepoint(pc, info, false)?,
            SiteKind::Infopoint { debug_info, reason } => {
                if reason.is_safepoint() {
                    self.record_safepoint(pc, debug_info, false)?;
                } else {
                    self.recorder
                        .record(pc, debug_info, ScopeMode::BytecodePosition, false)?;
                }
            }
            SiteKind::DataPatch(reference) => self.site_data_patch(pc, *reference)?,
            SiteKind::ExceptionHandler { handler_pc } => {
                if *handler_pc > size {
                    return Err(InstallError::PcOutOfBounds {
                        pc: *handler_pc,
                        size,
                    });
                }
                self.exception_table.add(pc, *handler_pc);
            }
        }
        self.last_pc = Some(pc);
        Ok(())
    }

    /// Record a full-frame scope and its oop map at `pc`.
    fn record_safepoint(
        &mut self,
        pc: u32,
        info: &DebugInfo,
        return_oop: bool,
    ) -> Result<(), InstallError> {
        let index = self
            .recorder
            .record(pc, info, ScopeMode::FullFrame, return_oop)?;
        let references = self.recorder.reference_locations(index);
        let map = self.oop_builder.build(pc, &references, info)?;
        self.oop_maps.insert(map);
        Ok(())
    }

    fn site_mark(&mut self, pc: u32, mark: MarkId) -> Result<(), InstallError> {
        if let Some(kind) = mark.invoke_kind() {
            if let Some(pending) = self.pending_invoke {
                return Err(InstallError::DuplicateInvokeMark {
                    pc,
                    pending: pending.pc,
                });
            }
            self.pending_invoke = Some(PendingInvoke { kind, pc });
            return Ok(());
        }

        match mark {
            MarkId::PollNear | MarkId::PollReturnNear => {
                let page = self.runtime.polling_page()?;
                if !self.backend.patch_near_poll(&mut self.buffer, pc, page)? {
                    return Err(InstallError::UnsupportedMark {
                        mark,
                        pc,
                        arch: self.config.arch,
                    });
                }
                self.relocations.push(Relocation::at_pc(pc, poll_kind(mark)));
            }
            MarkId::PollFar | MarkId::PollReturnFar => {
                self.relocations.push(Relocation::at_pc(pc, poll_kind(mark)));
            }
            MarkId::CardTableAddress => {
                let card_table = self.runtime.card_table()?;
                self.backend
                    .patch_immediate(&mut self.buffer, pc, card_table.base, ImmWidth::Wide)?;
                self.relocations
                    .push(Relocation::at_pc(pc, RelocKind::CardTable));
            }
            MarkId::CardTableShift => {
                let card_table = self.runtime.card_table()?;
                self.backend
                    .patch_shift(&mut self.buffer, pc, card_table.shift)?;
            }
            _ => self.entries.set(mark, pc)?,
        }
        Ok(())
    }

    fn site_call(&mut self, pc: u32, call: &CallSite) -> Result<(), InstallError> {
        // Any call clears the pending mark.
        let pending = self.pending_invoke.take();
        if let Some(mark) = pending {
            if mark.pc >= pc {
                return Err(InstallError::StaleInvokeMark {
                    pc,
                    mark_pc: mark.pc,
                });
            }
        }

        let callee = match call.target {
            CallTarget::Method(method) => Some(self.runtime.method_info(method)?),
            _ => None,
        };
        if let Some(info) = &call.debug_info {
            let return_pc = self.backend.call_return_offset(&self.buffer, pc)?;
            let return_oop = callee.is_some_and(|info| info.returns_reference);
            self.record_safepoint(return_pc, info, return_oop)?;
        }

        match (call.target, callee) {
            (CallTarget::Method(method), Some(info)) => {
                if call.debug_info.is_none() {
                    return Err(InstallError::MissingDebugInfo {
                        pc,
                        what: "Java method call",
                    });
                }
                let kind = match pending {
                    Some(mark) => mark.kind,
                    None if self.config.require_invoke_mark => {
                        return Err(InstallError::MissingInvokeMark { pc });
                    }
                    None if info.is_static => InvokeKind::Static,
                    None => InvokeKind::Special,
                };
                let mismatch = match kind {
                    InvokeKind::Static => !info.is_static,
                    InvokeKind::Virtual | InvokeKind::Interface | InvokeKind::Special => {
                        info.is_static
                    }
                    InvokeKind::Inline => false,
                };
                if mismatch {
                    return Err(InstallError::InvokeKindMismatch {
                        pc,
                        kind,
                        is_static: info.is_static,
                    });
                }
                let java_call = JavaCall {
                    method,
                    kind,
                    mark_pc: pending.map_or(pc, |mark| mark.pc),
                };
                self.bind_java_call(pc, call.direct, java_call)
            }
            (CallTarget::Foreign(address), _) => {
                let trampoline =
                    self.backend
                        .patch_call(&mut self.buffer, pc, address, call.direct)?;
                self.relocations
                    .push(Relocation::at_pc(pc, RelocKind::RuntimeCall));
                self.relocations.extend(trampoline);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn bind_java_call(
        &mut self,
        pc: u32,
        direct: bool,
        call: JavaCall,
    ) -> Result<(), InstallError> {
        if call.kind == InvokeKind::Inline {
            return Ok(());
        }
        let dest = self.runtime.call_entry(call.method, call.kind)?;
        let trampoline = self
            .backend
            .patch_call(&mut self.buffer, pc, dest, direct)?;

        let kind = match call.kind {
            InvokeKind::Virtual | InvokeKind::Interface => RelocKind::VirtualCall {
                ic_mark: call.mark_pc,
            },
            InvokeKind::Static | InvokeKind::Special => {
                let stub = self.backend.emit_static_call_stub(&mut self.buffer)?;
                self.relocations.push(Relocation::new(
                    Section::Stubs,
                    stub,
                    RelocKind::StaticStub { call: pc },
                ));
                if call.kind == InvokeKind::Static {
                    RelocKind::StaticCall { stub }
                } else {
                    RelocKind::OptVirtualCall { stub }
                }
            }
            InvokeKind::Inline => return Ok(()),
        };
        self.relocations.push(Relocation::at_pc(pc, kind));
        self.relocations.extend(trampoline);
        Ok(())
    }

    fn site_data_patch(&mut self, pc: u32, reference: Reference) -> Result<(), InstallError> {
        match reference {
            Reference::Constant {
                constant: PatchConstant::Object(object),
                compressed,
            } => {
                if compressed && !self.config.use_compressed_oops {
                    return Err(InstallError::CompressionDisabled { pc, what: "oops" });
                }
                let bits = self.runtime.oop_bits(object, compressed)?;
                self.backend
                    .patch_immediate(&mut self.buffer, pc, bits, imm_width(compressed))?;
                let index = self.references.record_oop(object);
                self.relocations.push(Relocation::at_pc(
                    pc,
                    RelocKind::Oop {
                        index,
                        narrow: compressed,
                    },
                ));
            }
            Reference::Constant {
                constant: PatchConstant::Metaspace(reference),
                compressed,
            } => {
                if compressed {
                    if let MetaspaceRef::Method(_) = reference {
                        return Err(InstallError::CompressedMethodPointer { pc });
                    }
                    if !self.config.use_compressed_class_pointers {
                        return Err(InstallError::CompressionDisabled {
                            pc,
                            what: "class pointers",
                        });
                    }
                }
                let bits = self.runtime.metadata_bits(reference, compressed)?;
                self.backend
                    .patch_immediate(&mut self.buffer, pc, bits, imm_width(compressed))?;
                let index = self.references.record_metadata(reference);
                self.relocations.push(Relocation::at_pc(
                    pc,
                    RelocKind::Metadata {
                        index,
                        narrow: compressed,
                    },
                ));
            }
            Reference::DataSection(data_offset) => {
                let size = self.buffer.section_len(Section::Constants);
                if data_offset >= size {
                    return Err(InstallError::DataOffsetOutOfBounds {
                        offset: data_offset,
                        size,
                    });
                }
                let target = self.buffer.address_of(Section::Constants, data_offset);
                self.backend
                    .patch_pc_relative(&mut self.buffer, pc, target)?;
                self.relocations
                    .push(Relocation::at_pc(pc, RelocKind::SectionWord { data_offset }));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Run the end-of-code checks and publish.
    pub fn finish(self) -> Result<InstalledCode, InstallError> {
        if let Some(pending) = self.pending_invoke {
            return Err(InstallError::DanglingInvokeMark {
                mark_pc: pending.pc,
            });
        }
        if let CodeKind::Method { entry_bci, .. } = self.descriptor.kind {
            if entry_bci != INVOCATION_ENTRY_BCI && self.entries.osr_entry.is_none() {
                return Err(InstallError::MissingOsrEntry { entry_bci });
            }
        }
        let size = self.code_size();
        if let Some(comment) = self.descriptor.comments.iter().find(|c| c.pc_offset > size) {
            return Err(InstallError::CommentOutOfBounds {
                pc: comment.pc_offset,
                size,
            });
        }

        debug!(
            relocations = self.relocations.len(),
            oop_maps = self.oop_maps.len(),
            scopes = self.recorder.len(),
            dependencies = self.dependencies.len(),
            "resolved sites"
        );
        let (oops, metadata) = self.references.into_tables();
        let tables = CodeTables {
            entry_points: self.entries.into_entry_points(),
            relocations: self.relocations,
            oop_maps: self.oop_maps,
            debug_info: self.recorder.finish(),
            exception_table: self.exception_table,
            oops,
            metadata,
            orig_pc_offset: self.orig_pc_offset,
        };
        finalize(
            self.runtime,
            self.reservation,
            self.descriptor,
            self.buffer,
            tables,
            self.dependencies,
        )
    }
}

/// A Java call with its resolved invoke kind.
#[derive(Debug, Clone, Copy)]
struct JavaCall {
    method: MethodHandle,
    kind: InvokeKind,
    /// Pc of the invoke mark, or of the call itself when there was none.
    mark_pc: u32,
}

/// Frame offset of the deopt rescue slot.
fn orig_pc_offset(descriptor: &CompiledCodeDescriptor) -> Result<Option<i32>, InstallError> {
    match descriptor.deopt_rescue_slot {
        None => Ok(None),
        Some(RawLocation::Register(_)) => {
            Err(InstallError::InvalidDeoptRescueSlot("not a stack slot"))
        }
        Some(RawLocation::StackSlot {
            offset,
            add_frame_size,
        }) => {
            let offset = stack_slot_offset(offset, add_frame_size, descriptor.total_frame_size)?;
            if offset < 0 {
                return Err(InstallError::InvalidDeoptRescueSlot("negative frame offset"));
            }
            Ok(Some(offset))
        }
    }
}

#[inline]
fn poll_kind(mark: MarkId) -> RelocKind {
    match mark {
        MarkId::PollReturnNear | MarkId::PollReturnFar => RelocKind::PollReturn,
        _ => RelocKind::Poll,
    }
}

#[inline]
fn imm_width(compressed: bool) -> ImmWidth {
    if compressed {
        ImmWidth::Narrow
    } else {
        ImmWidth::Wide
    }
}

// =============================================================================
// Tests
// =============================================================================
