use std::panic::{catch_unwind, AssertUnwindSafe};

use crashscope_runtime::callstack::{CallGuard, CallRecord, CallStack};
use crashscope_runtime::instance::VmHandle;

#[derive(Clone, Copy)]
enum Step {
    Native(usize, i32),
    Entry(usize, i32),
    Return,
}

#[test]
fn call_stack_matches_push_pop_simulation_across_instances() {
    let steps = [
        Step::Entry(1, 0),
        Step::Native(1, 3),
        Step::Entry(2, 5),
        Step::Native(2, 0),
        Step::Entry(1, 2),
        Step::Return,
        Step::Native(2, 7),
        Step::Return,
        Step::Return,
        Step::Return,
        Step::Entry(3, 1),
        Step::Return,
        Step::Return,
        Step::Return,
    ];

    let stack = CallStack::new();
    let mut guards: Vec<CallGuard<'_>> = Vec::new();
    let mut model: Vec<CallRecord> = Vec::new();

    for step in steps {
        match step {
            Step::Native(vm, index) => {
                let guard = stack.enter_native(VmHandle(vm), index);
                model.push(guard.record());
                guards.push(guard);
            }
            Step::Entry(vm, index) => {
                let guard = stack.enter_entrypoint(VmHandle(vm), index, index * 8, 0x900);
                model.push(guard.record());
                guards.push(guard);
            }
            Step::Return => {
                drop(guards.pop().expect("balanced steps"));
                model.pop();
            }
        }
        assert_eq!(stack.snapshot(), model);
        assert_eq!(stack.top(), model.last().copied());
        assert_eq!(stack.depth(), model.len());
    }
    assert!(stack.is_empty());
}

#[test]
fn innermost_record_is_reported_even_for_another_instance() {
    let stack = CallStack::new();
    let _outer = stack.enter_entrypoint(VmHandle(1), 0, 0x10, 0x900);
    let _native = stack.enter_native(VmHandle(1), 4);
    let _inner = stack.enter_entrypoint(VmHandle(2), 1, 0, 0);

    let top = stack.top().expect("calls in flight");
    assert_eq!(top.instance(), VmHandle(2));
    assert!(!top.is_native());

    let instances: Vec<VmHandle> = stack
        .snapshot()
        .iter()
        .map(CallRecord::instance)
        .collect();
    assert_eq!(instances, vec![VmHandle(1), VmHandle(1), VmHandle(2)]);
}

#[test]
fn entrypoint_record_keeps_registers_at_call_time() {
    let stack = CallStack::new();
    let guard = stack.enter_entrypoint(VmHandle(9), 3, 0x44, 0x8f0);
    assert_eq!(
        guard.record(),
        CallRecord::Entrypoint {
            instance: VmHandle(9),
            index: 3,
            ip: 0x44,
            fp: 0x8f0,
        }
    );
}

#[test]
fn guard_pops_record_when_call_unwinds() {
    let stack = CallStack::new();
    let _outer = stack.enter_entrypoint(VmHandle(1), 0, 0, 0);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let _native = stack.enter_native(VmHandle(1), 2);
        panic!("native blew up");
    }));

    assert!(outcome.is_err());
    assert_eq!(stack.depth(), 1);
    assert!(matches!(
        stack.top(),
        Some(CallRecord::Entrypoint { index: 0, .. })
    ));
}

#[test]
fn leaked_guard_records_are_discarded_with_enclosing_call() {
    let stack = CallStack::new();
    let outer = stack.enter_entrypoint(VmHandle(1), 0, 0, 0);
    std::mem::forget(stack.enter_native(VmHandle(1), 4));
    std::mem::forget(stack.enter_native(VmHandle(2), 5));
    assert_eq!(stack.depth(), 3);

    drop(outer);
    assert!(stack.is_empty());
}
