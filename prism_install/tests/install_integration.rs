//! End-to-end installation tests against the in-process runtime.

use prism_install::buffer::Section;
use prism_install::code::{
    Assumption, BytecodePosition, CallTarget, ClassHandle, CodeKind, CompiledCodeDescriptor,
    DebugInfo, FrameState, JavaValue, MarkId, MetaspaceRef, MethodHandle, ObjectHandle,
    PatchConstant, Reference, Site, ValueKind, VirtualObject, VirtualObjectId,
};
use prism_install::debug::{Location, LocationType, ScopeValue};
use prism_install::dependencies::Dependency;
use prism_install::oopmap::{OopMapValue, VmSlot};
use prism_install::reloc::{MachineReg, RelocKind, Relocation};
use prism_install::runtime::{CardTableInfo, MethodInfo};
use prism_install::runtime::local::{DEFAULT_CODE_BASE, DEFAULT_HEAP_BASE, LocalRuntime};
use prism_install::{
    InstallError, InstallResult, InstallerConfig, install, install_outcome, install_serialized,
};

const METHOD: MethodHandle = MethodHandle(1);
const CALLEE: MethodHandle = MethodHandle(2);
const CALLEE_ENTRY: u64 = DEFAULT_CODE_BASE + 0x8000;

fn runtime() -> LocalRuntime {
    let runtime = LocalRuntime::new(64 * 1024);
    runtime.define_method(
        CALLEE,
        MethodInfo {
            holder: ClassHandle(1),
            is_static: true,
            returns_reference: false,
        },
        CALLEE_ENTRY,
        0x5000,
    );
    runtime
}

fn config() -> InstallerConfig {
    InstallerConfig::for_testing()
}

fn info(bci: i32, locals: Vec<(ValueKind, JavaValue)>) -> DebugInfo {
    DebugInfo::new(
        BytecodePosition::new(METHOD, bci).with_frame(FrameState::from_slots(
            locals,
            vec![],
            vec![],
        )),
    )
}

fn assert_nothing_installed(runtime: &LocalRuntime) {
    assert!(runtime.code_cache().is_empty());
    assert_eq!(runtime.code_cache().outstanding(), 0);
}

// =============================================================================
// Calls
// =============================================================================

#[test]
fn test_invokestatic_is_bound_to_callee_entry() {
    let runtime = runtime();
    // nop x4; call rel32; ret
    let code = vec![0x90, 0x90, 0x90, 0x90, 0xE8, 0, 0, 0, 0, 0xC3];
    let desc = CompiledCodeDescriptor::for_method("caller", METHOD, code).with_sites([
        Site::mark(0, MarkId::VerifiedEntry),
        Site::mark(3, MarkId::InvokeStatic),
        Site::call(
            4,
            CallTarget::Method(CALLEE),
            true,
            Some(info(7, vec![(ValueKind::Int, JavaValue::int(3))])),
        ),
    ]);

    let installed = install(&config(), &runtime, &desc).unwrap();
    let code = installed.code();
    assert_eq!(installed.base(), DEFAULT_CODE_BASE);
    assert_eq!(installed.verified_entry_address(), DEFAULT_CODE_BASE);

    let disp = i32::from_le_bytes(code.instructions()[5..9].try_into().unwrap());
    assert_eq!(disp as i64, (CALLEE_ENTRY - (DEFAULT_CODE_BASE + 9)) as i64);

    assert!(code
        .relocations
        .contains(&Relocation::at_pc(4, RelocKind::StaticCall { stub: 0 })));
    assert!(code.relocations.contains(&Relocation::new(
        Section::Stubs,
        0,
        RelocKind::StaticStub { call: 4 }
    )));
    assert_eq!(&code.stubs()[..2], &[0x48, 0xBB]);

    // The call's scope and oop map sit at the return address.
    let record = code.debug_info.at(9).unwrap();
    assert!(record.is_safepoint);
    assert_eq!(code.debug_info.scope(record.innermost).bci, 7);
    assert!(code.oop_maps.at(9).is_some());
    assert!(code.dependencies.is_empty());

    assert_eq!(runtime.code_cache().len(), 1);
    assert!(runtime.code_cache().lookup(installed.handle()).is_some());
}

#[test]
fn test_java_call_without_invoke_mark_installs_nothing() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("m", METHOD, vec![0xE8, 0, 0, 0, 0])
        .with_site(Site::call(
            0,
            CallTarget::Method(CALLEE),
            true,
            Some(info(0, vec![])),
        ));

    let err = install(&config(), &runtime, &desc).unwrap_err();
    assert!(matches!(err, InstallError::MissingInvokeMark { pc: 0 }));
    assert_eq!(err.result(), InstallResult::Bailout);
    assert_nothing_installed(&runtime);
}

#[test]
fn test_invoke_kind_must_match_callee() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("m", METHOD, vec![0x90, 0xE8, 0, 0, 0, 0])
        .with_sites([
            Site::mark(0, MarkId::InvokeVirtual),
            Site::call(1, CallTarget::Method(CALLEE), true, Some(info(0, vec![]))),
        ]);

    let err = install(&config(), &runtime, &desc).unwrap_err();
    assert!(matches!(
        err,
        InstallError::InvokeKindMismatch {
            pc: 1,
            is_static: true,
            ..
        }
    ));
    assert_nothing_installed(&runtime);
}

#[test]
fn test_aarch64_far_call_goes_through_trampoline() {
    let runtime = LocalRuntime::new(64 * 1024);
    let far: u64 = 0x40_0000_0000;
    runtime.define_method(
        CALLEE,
        MethodInfo {
            holder: ClassHandle(1),
            is_static: true,
            returns_reference: false,
        },
        far,
        0x5000,
    );
    let mut code = Vec::new();
    for word in [0xD503_201Fu32, 0x9400_0000, 0xD65F_03C0] {
        code.extend_from_slice(&word.to_le_bytes());
    }
    let desc = CompiledCodeDescriptor::for_method("far", METHOD, code).with_sites([
        Site::mark(0, MarkId::InvokeStatic),
        Site::call(4, CallTarget::Method(CALLEE), true, Some(info(0, vec![]))),
    ]);

    let installed = install(&InstallerConfig::aarch64(), &runtime, &desc).unwrap();
    let code = installed.code();

    // Trampoline first (stub offset 0), then the static call stub.
    assert!(code
        .relocations
        .contains(&Relocation::at_pc(4, RelocKind::Trampoline { stub: 0 })));
    assert!(code
        .relocations
        .contains(&Relocation::at_pc(4, RelocKind::StaticCall { stub: 16 })));

    // bl to the trampoline: stubs start at offset 16, the call is at 4.
    let bl = u32::from_le_bytes(code.instructions()[4..8].try_into().unwrap());
    assert_eq!(bl, 0x9400_0003);
    assert_eq!(&code.stubs()[8..16], &far.to_le_bytes());
}

// =============================================================================
// Data
// =============================================================================

#[test]
fn test_data_section_reference_bounds() {
    let runtime = runtime();
    // movsd xmm0, [rip + disp32]
    let code = vec![0xF2, 0x0F, 0x10, 0x05, 0, 0, 0, 0];
    let desc = |offset| {
        CompiledCodeDescriptor::for_method("data", METHOD, code.clone())
            .with_data_section(vec![0xAB; 16], 16)
            .with_site(Site::data_patch(0, Reference::DataSection(offset)))
    };

    let err = install(&config(), &runtime, &desc(16)).unwrap_err();
    assert!(matches!(
        err,
        InstallError::DataOffsetOutOfBounds {
            offset: 16,
            size: 16
        }
    ));
    assert_nothing_installed(&runtime);

    let installed = install(&config(), &runtime, &desc(15)).unwrap();
    let code = installed.code();
    assert_eq!(code.constants(), &[0xAB; 16]);
    // constants [0, 16), instructions from 16; the operand is relative to 24
    let disp = i32::from_le_bytes(code.instructions()[4..8].try_into().unwrap());
    assert_eq!(disp, 15 - 24);
    assert_eq!(
        code.relocations,
        vec![Relocation::at_pc(0, RelocKind::SectionWord { data_offset: 15 })]
    );
}

#[test]
fn test_embedded_references_are_tabled() {
    let runtime = runtime();
    let object = ObjectHandle(7);
    let class = ClassHandle(3);
    runtime.define_object(object, DEFAULT_HEAP_BASE + 0x80);
    runtime.define_class(class, 0x1234_5678);

    // mov eax, imm32; mov rcx, imm64
    let code = vec![0xB8, 0, 0, 0, 0, 0x48, 0xB9, 0, 0, 0, 0, 0, 0, 0, 0];
    let desc = CompiledCodeDescriptor::for_method("refs", METHOD, code)
        .with_data_section(vec![0; 8], 8)
        .with_data_patch(
            0,
            Reference::Constant {
                constant: PatchConstant::Object(object),
                compressed: false,
            },
        )
        .with_sites([
            Site::data_patch(
                0,
                Reference::Constant {
                    constant: PatchConstant::Object(object),
                    compressed: true,
                },
            ),
            Site::data_patch(
                5,
                Reference::Constant {
                    constant: PatchConstant::Metaspace(MetaspaceRef::Class(class)),
                    compressed: false,
                },
            ),
        ]);

    let installed = install(&config(), &runtime, &desc).unwrap();
    let code = installed.code();
    assert_eq!(code.oops, vec![object]);
    assert_eq!(code.metadata, vec![MetaspaceRef::Class(class)]);
    assert_eq!(code.constants(), &(DEFAULT_HEAP_BASE + 0x80).to_le_bytes());
    assert_eq!(&code.instructions()[1..5], &0x10u32.to_le_bytes());
    assert_eq!(&code.instructions()[7..15], &0x1234_5678u64.to_le_bytes());
    assert_eq!(
        code.relocations,
        vec![
            Relocation::new(
                Section::Constants,
                0,
                RelocKind::Oop {
                    index: 0,
                    narrow: false
                }
            ),
            Relocation::at_pc(
                0,
                RelocKind::Oop {
                    index: 0,
                    narrow: true
                }
            ),
            Relocation::at_pc(
                5,
                RelocKind::Metadata {
                    index: 0,
                    narrow: false
                }
            ),
        ]
    );
}

#[test]
fn test_compressed_method_pointer_is_rejected() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("m", METHOD, vec![0xB8, 0, 0, 0, 0]).with_site(
        Site::data_patch(
            0,
            Reference::Constant {
                constant: PatchConstant::Metaspace(MetaspaceRef::Method(CALLEE)),
                compressed: true,
            },
        ),
    );
    assert!(matches!(
        install(&config(), &runtime, &desc),
        Err(InstallError::CompressedMethodPointer { pc: 0 })
    ));
    assert_nothing_installed(&runtime);
}

// =============================================================================
// Debug Info and Oop Maps
// =============================================================================

#[test]
fn test_oop_map_covers_every_reference() {
    let runtime = runtime();
    let state = info(
        2,
        vec![
            (ValueKind::Object, JavaValue::reg(3)),
            (ValueKind::Int, JavaValue::reg(4)),
            (ValueKind::Object, JavaValue::stack(16)),
            (ValueKind::Object, JavaValue::Null),
        ],
    );
    let desc = CompiledCodeDescriptor::for_method("gc", METHOD, vec![0x90; 8])
        .with_frame_size(32)
        .with_site(Site::safepoint(4, state));

    let installed = install(&config(), &runtime, &desc).unwrap();
    let map = installed.code().oop_maps.at(4).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(
        map.get(VmSlot::Register(MachineReg::gpr(3))),
        Some(OopMapValue::Oop)
    );
    assert_eq!(map.get(VmSlot::Stack(16)), Some(OopMapValue::Oop));
    assert_eq!(map.get(VmSlot::Register(MachineReg::gpr(4))), None);

    let record = installed.code().debug_info.at(4).unwrap();
    let locals = &installed
        .code()
        .debug_info
        .scope(record.innermost)
        .frame
        .as_ref()
        .unwrap()
        .locals;
    assert_eq!(locals[3], ScopeValue::NULL);
}

#[test]
fn test_monitor_owner_is_a_reference() {
    let runtime = runtime();
    let state = FrameState::from_slots(
        vec![(ValueKind::Object, JavaValue::reg(5))],
        vec![],
        vec![JavaValue::stack_lock(JavaValue::reg(5), JavaValue::stack(8), false)],
    );
    let position = BytecodePosition::new(METHOD, 11).with_frame(state);
    let desc = CompiledCodeDescriptor::for_method("sync", METHOD, vec![0x90; 8])
        .with_frame_size(16)
        .with_site(Site::safepoint(2, DebugInfo::new(position)));

    let installed = install(&config(), &runtime, &desc).unwrap();
    let code = installed.code();
    let record = code.debug_info.at(2).unwrap();
    let frame = code.debug_info.scope(record.innermost).frame.clone().unwrap();

    assert_eq!(frame.monitors.len(), 1);
    let monitor = frame.monitors[0];
    assert!(!monitor.eliminated);
    assert!(matches!(monitor.basic_lock, Location::Stack { offset: 8, .. }));
    assert_eq!(
        monitor.owner,
        ScopeValue::Location(Location::Register {
            reg: MachineReg::gpr(5),
            ty: LocationType::Oop
        })
    );
    let map = code.oop_maps.at(2).unwrap();
    assert_eq!(
        map.get(VmSlot::Register(MachineReg::gpr(5))),
        Some(OopMapValue::Oop)
    );
}

#[test]
fn test_cyclic_virtual_objects_are_flattened_once() {
    let runtime = runtime();
    let a = VirtualObject::instance(1, ClassHandle(9))
        .with_field(ValueKind::Object, JavaValue::Virtual(VirtualObjectId(2)));
    let b = VirtualObject::instance(2, ClassHandle(9))
        .with_field(ValueKind::Object, JavaValue::Virtual(VirtualObjectId(1)));
    let state = info(
        0,
        vec![(ValueKind::Object, JavaValue::Virtual(VirtualObjectId(1)))],
    )
    .with_virtual_objects(vec![a, b]);
    let desc = CompiledCodeDescriptor::for_method("escape", METHOD, vec![0x90; 4])
        .with_site(Site::safepoint(0, state));

    let installed = install(&config(), &runtime, &desc).unwrap();
    let debug_info = &installed.code().debug_info;
    let record = debug_info.at(0).unwrap();
    assert_eq!(record.objects.len(), 2);

    let (first, entry_a) = record.objects.find(VirtualObjectId(1)).unwrap();
    let (second, entry_b) = record.objects.find(VirtualObjectId(2)).unwrap();
    assert_eq!(
        entry_a.fields,
        vec![ScopeValue::VirtualObjectReference(second)]
    );
    assert_eq!(
        entry_b.fields,
        vec![ScopeValue::VirtualObjectReference(first)]
    );

    // Flattening the finished table again from the same roots is a no-op.
    let roots = debug_info.roots(record);
    assert_eq!(record.objects.reflatten(&roots).unwrap(), record.objects);
}

// =============================================================================
// Exception Handlers and Ordering
// =============================================================================

#[test]
fn test_handlers_at_one_pc_keep_site_order() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("handlers", METHOD, vec![0x90; 16]).with_sites([
        Site::exception_handler(4, 12),
        Site::exception_handler(4, 8),
        Site::exception_handler(6, 8),
    ]);

    let installed = install(&config(), &runtime, &desc).unwrap();
    let table = &installed.code().exception_table;
    assert_eq!(table.len(), 3);
    assert_eq!(table.handlers_at(4).collect::<Vec<_>>(), vec![12, 8]);
}

#[test]
fn test_sites_out_of_order_are_rejected() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("order", METHOD, vec![0x90; 8])
        .with_sites([Site::mark(4, MarkId::VerifiedEntry), Site::exception_handler(2, 6)]);

    assert!(matches!(
        install(&config(), &runtime, &desc),
        Err(InstallError::SiteOutOfOrder {
            pc: 2,
            previous: 4
        })
    ));
    assert_nothing_installed(&runtime);
}

#[test]
fn test_osr_compilation_needs_osr_entry() {
    let runtime = runtime();
    let kind = CodeKind::Method {
        method: METHOD,
        entry_bci: 10,
        compile_id: 3,
    };
    let without = CompiledCodeDescriptor::new("osr", kind.clone(), vec![0x90; 4]);
    assert!(matches!(
        install(&config(), &runtime, &without),
        Err(InstallError::MissingOsrEntry { entry_bci: 10 })
    ));

    let with = CompiledCodeDescriptor::new("osr", kind, vec![0x90; 4])
        .with_site(Site::mark(2, MarkId::OsrEntry));
    let installed = install(&config(), &runtime, &with).unwrap();
    assert_eq!(installed.code().entry_points.osr_entry, Some(2));
}

// =============================================================================
// Runtime Callbacks
// =============================================================================

#[test]
fn test_unknown_callee_raises_pending_exception() {
    let runtime = runtime();
    let code = vec![0x90, 0x90, 0x90, 0x90, 0xE8, 0, 0, 0, 0, 0xC3];
    let desc = CompiledCodeDescriptor::for_method("unknown", METHOD, code).with_sites([
        Site::mark(3, MarkId::InvokeStatic),
        Site::call(
            4,
            CallTarget::Method(MethodHandle(99)),
            true,
            Some(info(7, vec![])),
        ),
    ]);

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::PendingException);
    match outcome.error {
        Some(InstallError::PendingException(err)) => {
            assert_eq!(err.exception, "NoSuchMethodError")
        }
        other => panic!("expected a pending exception, got {other:?}"),
    }
    assert_nothing_installed(&runtime);
}

#[test]
fn test_unknown_embedded_object_raises_pending_exception() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("oop", METHOD, vec![0xB8, 0, 0, 0, 0])
        .with_site(Site::data_patch(
            0,
            Reference::Constant {
                constant: PatchConstant::Object(ObjectHandle(42)),
                compressed: true,
            },
        ));

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::PendingException);
    assert_nothing_installed(&runtime);
}

#[test]
fn test_card_table_marks_are_patched() {
    let runtime = runtime().with_card_table(CardTableInfo {
        base: 0x0A00_0000,
        shift: 9,
    });
    // mov rax, imm64; shr rax, 0
    let code = vec![0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, 0x48, 0xC1, 0xE8, 0x00];
    let desc = CompiledCodeDescriptor::for_method("barrier", METHOD, code).with_sites([
        Site::mark(0, MarkId::CardTableAddress),
        Site::mark(10, MarkId::CardTableShift),
    ]);

    let installed = install(&config(), &runtime, &desc).unwrap();
    let code = installed.code();
    assert_eq!(&code.instructions()[2..10], &0x0A00_0000u64.to_le_bytes());
    assert_eq!(code.instructions()[13], 9);
    assert_eq!(
        code.relocations,
        vec![Relocation::at_pc(0, RelocKind::CardTable)]
    );
}

#[test]
fn test_missing_card_table_raises_pending_exception() {
    let runtime = runtime().without_card_table();
    let code = vec![0x48, 0xC1, 0xE8, 0x00];
    let desc = CompiledCodeDescriptor::for_method("barrier", METHOD, code)
        .with_site(Site::mark(0, MarkId::CardTableShift));

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::PendingException);
    assert_nothing_installed(&runtime);
}

// =============================================================================
// Malformed Frames
// =============================================================================

#[test]
fn test_stack_slot_overflowing_frame_is_a_bailout() {
    let runtime = runtime();
    let slot = JavaValue::StackSlot {
        offset: i32::MAX,
        add_frame_size: true,
        narrow: false,
    };
    let desc = CompiledCodeDescriptor::for_method("overflow", METHOD, vec![0x90; 8])
        .with_frame_size(64)
        .with_site(Site::safepoint(4, info(2, vec![(ValueKind::Int, slot)])));

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::Bailout);
    assert!(matches!(
        outcome.error,
        Some(InstallError::StackSlotOutOfRange {
            offset: i32::MAX,
            frame_size: 64
        })
    ));
    assert_nothing_installed(&runtime);
}

#[test]
fn test_huge_frame_size_is_a_bailout() {
    let runtime = runtime();
    let slot = JavaValue::StackSlot {
        offset: 8,
        add_frame_size: true,
        narrow: false,
    };
    let desc = CompiledCodeDescriptor::for_method("frame", METHOD, vec![0x90; 8])
        .with_frame_size(u32::MAX)
        .with_site(Site::safepoint(4, info(2, vec![(ValueKind::Object, slot)])));

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::Bailout);
    assert_nothing_installed(&runtime);
}

// =============================================================================
// Dependencies and Resources
// =============================================================================

#[test]
fn test_broken_assumption_installs_nothing() {
    let runtime = runtime();
    let context = ClassHandle(10);
    let subtype = ClassHandle(11);
    runtime.invalidate(Dependency::AbstractWithUniqueConcreteSubtype { context, subtype });

    let desc = CompiledCodeDescriptor::for_method("speculative", METHOD, vec![0xC3])
        .with_assumption(Assumption::ConcreteSubtype { context, subtype });
    let outcome = install_outcome(&config(), &runtime, &desc);

    assert_eq!(outcome.result, InstallResult::DependencyInvalidated);
    assert!(outcome.code.is_none());
    assert_nothing_installed(&runtime);
}

#[test]
fn test_inlined_methods_become_dependencies() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("inlined", METHOD, vec![0xC3])
        .with_inlined_method(CALLEE)
        .with_assumption(Assumption::LeafType {
            context: ClassHandle(4),
        });

    let installed = install(&config(), &runtime, &desc).unwrap();
    assert_eq!(
        installed.code().dependencies,
        vec![
            Dependency::LeafType {
                context: ClassHandle(4)
            },
            Dependency::EvolMethod { method: CALLEE },
        ]
    );
}

#[test]
fn test_full_code_cache_is_transient() {
    let runtime = LocalRuntime::new(32);
    let desc = CompiledCodeDescriptor::for_method("big", METHOD, vec![0x90; 64]);

    let outcome = install_outcome(&config(), &runtime, &desc);
    assert_eq!(outcome.result, InstallResult::CodeCacheFull);
    assert!(outcome.result.is_transient());
    assert_eq!(runtime.code_cache().stats().failures, 1);
    assert_nothing_installed(&runtime);
}

#[test]
fn test_serialized_descriptor_round_trip_installs() {
    let runtime = runtime();
    let desc = CompiledCodeDescriptor::for_method("wire", METHOD, vec![0x90, 0xC3])
        .with_comment(1, "return");
    let bytes = desc.encode().unwrap();

    let installed = install_serialized(&config(), &runtime, &bytes).unwrap();
    assert_eq!(installed.name(), "wire");
    assert_eq!(installed.code().comments[0].text, "return");

    assert!(matches!(
        install_serialized(&config(), &runtime, &bytes[..3]),
        Err(InstallError::Decode(_))
    ));
}
