mod common;

use std::cell::{Cell as Counter, OnceCell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use common::{quiet_config, FakeVm, FixedModules, Harness, MapLoader};
use crashscope_runtime::callstack::CallRecord;
use crashscope_runtime::heap::HeapBounds;
use crashscope_runtime::instance::NativeDispatch;
use crashscope_runtime::memory::Cell;
use crashscope_runtime::native::{FaultContext, NativeFrame};
use crashscope_runtime::{RuntimeError, ScriptVm, VmHandle};

type SharedVm = (Rc<FakeVm>, Rc<dyn ScriptVm>);

fn host_frames() -> Vec<NativeFrame> {
    vec![
        NativeFrame {
            return_address: 0x401000,
            module: Some(PathBuf::from("/usr/lib/libhost.so")),
        },
        NativeFrame {
            return_address: 0x4010f0,
            module: None,
        },
    ]
}

fn plugin_harness() -> Harness {
    Harness::build(
        quiet_config(),
        FixedModules::default()
            .with(0x5000, "/srv/plugins/timers.so")
            .with(0xdead_beef, "/srv/plugins/streamer.so"),
        Rc::new(MapLoader::default()),
        host_frames(),
    )
}

/// Log lines following `header`, without the log prefix.
fn section(harness: &Harness, header: &str) -> Vec<String> {
    let lines = harness.lines();
    let Some(start) = lines.iter().position(|line| line.ends_with(header)) else {
        return Vec::new();
    };
    lines[start + 1..]
        .iter()
        .take_while(|line| line.starts_with("[debug] #"))
        .map(|line| line.trim_start_matches("[debug] ").to_string())
        .collect()
}

#[test]
fn dispatch_runs_original_callback_inside_native_record() {
    let harness = Harness::new(quiet_config());
    let seen = Rc::new(RefCell::new(Vec::new()));

    let dispatch: NativeDispatch = {
        let coordinator = Rc::clone(&harness.coordinator);
        let seen = Rc::clone(&seen);
        Rc::new(move |index: Cell, params: &[Cell]| -> Result<Cell, RuntimeError> {
            seen.borrow_mut().push(coordinator.call_stack().top());
            Ok(index * 100 + params.iter().sum::<i32>())
        })
    };
    let (_, vm) = FakeVm::new(7).with_dispatch(dispatch).into_shared();

    let result = harness.coordinator.dispatch_native(&vm, 3, &[1, 2]);

    assert_eq!(result, Ok(303));
    assert_eq!(
        *seen.borrow(),
        vec![Some(CallRecord::Native {
            instance: VmHandle(7),
            index: 3,
        })]
    );
    assert!(harness.coordinator.call_stack().is_empty());
    assert!(harness.lines().is_empty());
}

#[test]
fn dispatch_without_callback_fails() {
    let harness = Harness::new(quiet_config());
    let (_, vm) = FakeVm::new(1).into_shared();

    assert_eq!(
        harness.coordinator.dispatch_native(&vm, 0, &[]),
        Err(RuntimeError::Callback)
    );
    assert!(harness.coordinator.call_stack().is_empty());
}

#[test]
fn successful_entrypoint_passes_result_through() {
    let harness = Harness::new(quiet_config());
    let (_, vm) = FakeVm::new(1).into_shared();

    let result = harness.coordinator.exec_entrypoint(&vm, 0, || {
        assert_eq!(harness.coordinator.call_stack().depth(), 1);
        Ok(42)
    });

    assert_eq!(result, Ok(42));
    assert!(harness.coordinator.call_stack().is_empty());
    assert!(harness.lines().is_empty());
}

#[test]
fn instances_are_tracked_until_destroyed() {
    let harness = Harness::new(quiet_config());
    let (_, first) = FakeVm::new(1).into_shared();
    let (_, second) = FakeVm::new(2).into_shared();

    let _ = harness.coordinator.exec_entrypoint(&first, 0, || Ok(0));
    let _ = harness.coordinator.exec_entrypoint(&first, 1, || Ok(0));
    harness.coordinator.on_instance_created(&second);
    assert_eq!(harness.coordinator.tracked_instances(), 2);

    harness.coordinator.on_instance_destroyed(VmHandle(1));
    assert!(harness.coordinator.instance(VmHandle(1)).is_none());
    assert_eq!(harness.coordinator.tracked_instances(), 1);

    harness.coordinator.on_instance_destroyed(VmHandle(1));
    harness.coordinator.on_instance_destroyed(VmHandle(99));
    assert_eq!(harness.coordinator.tracked_instances(), 1);
}

#[test]
fn backtrace_crosses_native_boundary_within_one_instance() {
    let harness = plugin_harness();
    let slot: Rc<OnceCell<SharedVm>> = Rc::new(OnceCell::new());

    let dispatch: NativeDispatch = {
        let coordinator = Rc::clone(&harness.coordinator);
        let slot = Rc::clone(&slot);
        Rc::new(move |_: Cell, _: &[Cell]| -> Result<Cell, RuntimeError> {
            let (fake, vm) = slot.get().expect("vm installed");
            coordinator.exec_entrypoint(vm, 1, || {
                fake.set_registers(|registers| {
                    registers.cip = 0x80;
                    registers.frm = 0x8c0;
                    registers.pri = -2;
                });
                Err(RuntimeError::Bounds)
            })
        })
    };

    let mut fake = FakeVm::new(1)
        .with_natives(&[("SetTimer", 0x5000)])
        .with_entry_points(&[("OnGameModeInit", 0x20), ("OnTimer", 0x50)])
        .with_dispatch(dispatch);
    fake.link_frame(0x900, 0, 0);
    fake.link_frame(0x8c0, 0x8e0, 0x60);
    fake.link_frame(0x8e0, 0x900, 0);
    fake.write_code(0x5c, 0x74);
    let shared = fake.into_shared();
    let (fake, vm) = shared.clone();
    assert!(slot.set(shared).is_ok());

    let coordinator = Rc::clone(&harness.coordinator);
    let outer_vm = Rc::clone(&vm);
    let result = harness.coordinator.exec_entrypoint(&vm, 0, move || {
        fake.set_registers(|registers| {
            registers.cip = 0x30;
            registers.frm = 0x900;
        });
        coordinator.dispatch_native(&outer_vm, 0, &[])
    });

    assert_eq!(result, Err(RuntimeError::Bounds));
    assert_eq!(harness.count("Run time error"), 1);
    assert_eq!(
        section(&harness, "Script backtrace:"),
        vec![
            "#0 00000080 in 00000074 ()",
            "#1 00000060 in 00000050 ()",
            "#2 native SetTimer () [00005000] from timers.so",
            "#3 00000030 in 00000020 ()",
        ]
    );
}

#[test]
fn backtrace_stops_at_another_instance() {
    let harness = plugin_harness();

    let (_, remote) = FakeVm::new(2)
        .with_entry_points(&[("OnRemoteCall", 0x10)])
        .into_shared();
    let dispatch: NativeDispatch = {
        let coordinator = Rc::clone(&harness.coordinator);
        Rc::new(move |_: Cell, _: &[Cell]| -> Result<Cell, RuntimeError> {
            coordinator.exec_entrypoint(&remote, 0, || Err(RuntimeError::Divide))
        })
    };
    let (_, caller) = FakeVm::new(1)
        .with_natives(&[("CallRemoteFunction", 0x5000)])
        .with_dispatch(dispatch)
        .into_shared();

    let coordinator = Rc::clone(&harness.coordinator);
    let native_caller = Rc::clone(&caller);
    let _ = harness.coordinator.exec_entrypoint(&caller, 0, move || {
        coordinator.dispatch_native(&native_caller, 0, &[])
    });

    assert_eq!(
        section(&harness, "Script backtrace:"),
        vec!["#0 00000010 in 00000010 ()"]
    );
}

#[test]
fn heap_release_inside_heap_is_silent() {
    let harness = plugin_harness();
    let (_, vm) = FakeVm::new(1).into_shared();
    let released = Counter::new(0);

    let value = harness.coordinator.release_heap(&vm, 0x180, 0xdead_beef, || {
        released.set(released.get() + 1);
        "freed"
    });

    assert_eq!(value, "freed");
    assert_eq!(released.get(), 1);
    assert!(harness.lines().is_empty());
}

#[test]
fn heap_release_outside_heap_is_reported_and_still_performed() {
    let harness = plugin_harness();
    let (_, vm) = FakeVm::new(1).into_shared();
    let released = Counter::new(0);

    harness.coordinator.release_heap(&vm, 0x900, 0xdead_beef, || {
        released.set(released.get() + 1);
    });
    harness.coordinator.release_heap(&vm, 0x40, 0x1234, || {
        released.set(released.get() + 1);
    });

    assert_eq!(released.get(), 2);
    assert_eq!(harness.count("Bad heap release detected:"), 2);
    assert!(harness.log.contains(
        " streamer.so [deadbeef] is releasing memory at 00000900 which is out of heap"
    ));
    assert!(harness.log.contains(
        " <unknown> [00001234] is releasing memory at 00000040 which is out of heap"
    ));
    assert_eq!(harness.count("System backtrace:"), 2);
}

#[test]
fn heap_bounds_are_half_open() {
    let bounds = HeapBounds::new(0x100, 0x800);
    for address in (0..0x1000).step_by(4) {
        assert_eq!(
            bounds.contains(address),
            (0x100..0x800).contains(&address),
            "address {address:#x}"
        );
    }
    assert!(!bounds.contains(-4));
}

#[test]
fn host_crash_outside_script_code() {
    let harness = plugin_harness();
    let context = FaultContext {
        instruction_pointer: 0x401000,
        frame_pointer: 0x7ffd_0000,
    };

    harness.coordinator.on_system_exception(Some(&context));

    assert_eq!(
        harness.lines(),
        vec![
            "[debug] Host crashed due to an unknown error",
            "[debug] System backtrace:",
            "[debug] #0 0000000000401000 from /usr/lib/libhost.so",
            "[debug] #1 00000000004010f0",
        ]
    );
    assert_eq!(*harness.unwinder.contexts.borrow(), vec![Some(context)]);
}

#[test]
fn host_crash_during_script_call_names_instance() {
    let harness = plugin_harness();
    let (_, vm) = FakeVm::new(1)
        .with_entry_points(&[("OnPlayerText", 0x44)])
        .into_shared();

    let _ = harness.coordinator.exec_entrypoint(&vm, 0, || {
        harness.coordinator.on_system_exception(None);
        Ok(0)
    });

    assert!(harness.log.contains("Host crashed while executing <unknown>"));
    assert_eq!(
        section(&harness, "Script backtrace:"),
        vec!["#0 00000044 in 00000044 ()"]
    );
    assert_eq!(section(&harness, "System backtrace:").len(), 2);
}

#[test]
fn interrupt_messages() {
    let harness = plugin_harness();
    harness.coordinator.on_system_interrupt(None);
    assert!(harness.log.contains("Host received interrupt signal"));
    assert!(!harness.log.contains("while executing"));

    let (_, vm) = FakeVm::new(1).into_shared();
    let _ = harness.coordinator.exec_entrypoint(&vm, 0, || {
        harness.coordinator.on_system_interrupt(None);
        Ok(0)
    });
    assert!(harness
        .log
        .contains("Host received interrupt signal while executing <unknown>"));
    assert_eq!(harness.count("System backtrace:"), 2);
}
