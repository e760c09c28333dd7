use std::cell::RefCell;
use std::rc::Rc;

use super::*;
use crate::bytecode::{FuncDefBuilder, Opcode::*};
use crate::gc::GcConfig;

fn emit(b: &mut FuncDefBuilder, op: Opcode, operands: &[i32]) {
    b.emit(op, operands).unwrap();
}

fn vm_run(functions: Vec<FuncDef>) -> (Vm, Value) {
    vm_run_with(VmConfig::default(), functions)
}

fn vm_run_with(config: VmConfig, functions: Vec<FuncDef>) -> (Vm, Value) {
    let mut vm = Vm::new(config);
    vm.reset(functions).unwrap();
    let result = vm.run();
    (vm, result)
}

/// `add(a, b=5)`: r0 = a + b.
fn add_function(heap: &mut Heap) -> FuncDef {
    let mut f = FuncDefBuilder::new("add");
    f.param(heap, "a", Value::Null).param(heap, "b", Value::Int(5));
    emit(&mut f, ADD_rA_rB_rC, &[0, 1, 2]);
    emit(&mut f, RETURN, &[]);
    f.finish()
}

#[test]
fn vm_add_immediates() {
    let mut main = FuncDefBuilder::new("@main");
    emit(&mut main, LOAD_rA_iBC, &[1, 10]);
    emit(&mut main, LOAD_rA_iBC, &[2, 3]);
    emit(&mut main, ADD_rA_rB_rC, &[0, 1, 2]);
    emit(&mut main, RETURN, &[]);
    let (vm, result) = vm_run(vec![main.finish()]);
    assert_eq!(result, Value::Int(13));
    assert_eq!(vm.state(), RunState::Returned);
    assert_eq!(vm.result(), Value::Int(13));
}

#[test]
fn vm_call_fills_default_param() {
    let mut vm = Vm::default();
    let add = add_function(vm.heap_mut());
    let mut main = FuncDefBuilder::new("@main");
    main.reserve_registers(3);
    emit(&mut main, FUNCREF_iA_iBC, &[1, 1]);
    emit(&mut main, ARGBLK_iABC, &[1]);
    emit(&mut main, ARG_iABC, &[10]);
    emit(&mut main, CALL_rA_rB_rC, &[0, 2, 1]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish(), add]).unwrap();
    assert_eq!(vm.run(), Value::Int(15));
}

#[test]
fn vm_too_many_arguments_faults() {
    let mut vm = Vm::default();
    let add = add_function(vm.heap_mut());
    let mut main = FuncDefBuilder::new("@main");
    main.reserve_registers(3);
    emit(&mut main, FUNCREF_iA_iBC, &[1, 1]);
    emit(&mut main, ARGBLK_iABC, &[3]);
    emit(&mut main, ARG_iABC, &[1]);
    emit(&mut main, ARG_iABC, &[2]);
    emit(&mut main, ARG_iABC, &[3]);
    emit(&mut main, CALL_rA_rB_rC, &[0, 2, 1]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish(), add]).unwrap();

    assert_eq!(vm.run(), Value::Null);
    assert_eq!(vm.state(), RunState::Faulted);
    assert!(!vm.is_running());
    let fault = vm.fault().unwrap();
    assert_eq!(fault.error, VmError::TooManyArguments { got: 3, expected: 2 });
    assert_eq!(fault.function, "@main");
    assert!(vm.errors()[0].starts_with("Runtime Error: Too many arguments"));
}

#[test]
fn vm_argblk_without_call_is_sequencing_error() {
    let mut main = FuncDefBuilder::new("@main");
    emit(&mut main, ARGBLK_iABC, &[1]);
    emit(&mut main, ARG_iABC, &[1]);
    emit(&mut main, RETURN, &[]);
    let (vm, _) = vm_run(vec![main.finish()]);
    assert!(matches!(vm.fault().map(|f| &f.error), Some(VmError::Sequencing(_))));
}

#[test]
fn vm_cycle_budget_suspends_and_resumes() {
    let mut main = FuncDefBuilder::new("@main");
    emit(&mut main, LOAD_rA_iBC, &[1, 0]);
    emit(&mut main, LOAD_rA_iBC, &[2, 1]);
    emit(&mut main, LOAD_rA_iBC, &[3, 100]);
    emit(&mut main, ADD_rA_rB_rC, &[1, 1, 2]);
    emit(&mut main, BRLT_rA_rB_iC, &[1, 3, -2]);
    emit(&mut main, LOAD_rA_rB, &[0, 1]);
    emit(&mut main, RETURN, &[]);

    let mut vm = Vm::default();
    vm.reset(vec![main.finish()]).unwrap();
    assert_eq!(vm.run_cycles(10), Value::Null);
    assert_eq!(vm.state(), RunState::Suspended);
    assert!(vm.is_running());
    assert_eq!(vm.run(), Value::Int(100));
    assert!(!vm.is_running());
}

#[test]
fn vm_undefined_identifier() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "missing").unwrap();
    emit(&mut main, LOADV_rA_rB_kC, &[0, 1, k as i32]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    vm.run();
    assert_eq!(vm.errors(), ["Runtime Error: Undefined Identifier: 'missing' is unknown in this context [@main line 0]"]);
    assert!(vm.report_runtime_error());
}

#[test]
fn vm_missing_entry_is_reported() {
    let mut vm = Vm::default();
    let mut f = FuncDefBuilder::new("helper");
    emit(&mut f, RETURN, &[]);
    assert_eq!(vm.reset(vec![f.finish()]), Err(VmError::NoEntryFunction));
    assert_eq!(vm.state(), RunState::Idle);
    assert_eq!(vm.errors(), ["Runtime Error: No @main function found"]);
    assert_eq!(vm.run(), Value::Null);
}

#[test]
fn vm_empty_entry_is_reported() {
    let mut vm = Vm::default();
    assert_eq!(vm.reset(vec![FuncDef::new("@main")]), Err(VmError::EmptyEntryFunction));
}

#[test]
fn vm_closure_reads_outer_variable() {
    let mut vm = Vm::default();
    let mut inner = FuncDefBuilder::new("inner");
    let kx = inner.string_constant(vm.heap_mut(), "x").unwrap();
    emit(&mut inner, LOADV_rA_rB_kC, &[0, 1, kx as i32]);
    emit(&mut inner, RETURN, &[]);

    let mut main = FuncDefBuilder::new("@main");
    let kx = main.string_constant(vm.heap_mut(), "x").unwrap();
    emit(&mut main, LOAD_rA_iBC, &[1, 42]);
    emit(&mut main, NAME_rA_kBC, &[1, kx as i32]);
    emit(&mut main, FUNCREF_iA_iBC, &[2, 1]);
    main.reserve_registers(4);
    emit(&mut main, ARGBLK_iABC, &[0]);
    emit(&mut main, CALL_rA_rB_rC, &[0, 3, 2]);
    emit(&mut main, RETURN, &[]);

    vm.reset(vec![main.finish(), inner.finish()]).unwrap();
    assert_eq!(vm.run(), Value::Int(42));
}

#[test]
fn vm_callfn_runs_intrinsic() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "len").unwrap();
    emit(&mut main, LIST_rA_iBC, &[2, 2]);
    emit(&mut main, LOAD_rA_iBC, &[3, 7]);
    emit(&mut main, PUSH_rA_rB, &[2, 3]);
    emit(&mut main, PUSH_rA_rB, &[2, 3]);
    emit(&mut main, CALLFN_iA_kBC, &[1, k as i32]);
    emit(&mut main, LOAD_rA_rB, &[0, 1]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    assert_eq!(vm.user_functions().len(), 1);
    assert!(vm.functions().len() > 1);
    assert_eq!(vm.run(), Value::Int(2));
}

#[test]
fn vm_callfn_unknown_name() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "nope").unwrap();
    emit(&mut main, CALLFN_iA_kBC, &[1, k as i32]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    vm.run();
    assert_eq!(vm.fault().unwrap().error, VmError::UnknownFunction { name: "nope".into() });
}

#[test]
fn vm_method_call_binds_self() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "len").unwrap();
    emit(&mut main, LIST_rA_iBC, &[1, 3]);
    emit(&mut main, LOAD_rA_iBC, &[4, 9]);
    for _ in 0..3 {
        emit(&mut main, PUSH_rA_rB, &[1, 4]);
    }
    emit(&mut main, LOAD_rA_kBC, &[2, k as i32]);
    emit(&mut main, METHFIND_rA_rB_rC, &[3, 1, 2]);
    emit(&mut main, CALLIFREF_rA, &[3]);
    emit(&mut main, LOAD_rA_rB, &[0, 3]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    assert_eq!(vm.run(), Value::Int(3));
}

#[test]
fn vm_print_goes_through_callback() {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);
    let mut vm = Vm::default();
    vm.set_print_callback(move |s| sink.borrow_mut().push(s.to_string()));

    let mut main = FuncDefBuilder::new("@main");
    let print = main.string_constant(vm.heap_mut(), "print").unwrap();
    let text = main.string_constant(vm.heap_mut(), "hello").unwrap();
    emit(&mut main, LOAD_rA_kBC, &[2, text as i32]);
    emit(&mut main, CALLFN_iA_kBC, &[1, print as i32]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    vm.run();
    assert_eq!(*lines.borrow(), ["hello"]);
}

#[test]
fn vm_introspection_inside_call() {
    let mut vm = Vm::default();
    let mut f = FuncDefBuilder::new("f");
    emit(&mut f, NOOP, &[]);
    emit(&mut f, NOOP, &[]);
    emit(&mut f, LOAD_rA_iBC, &[0, 7]);
    emit(&mut f, RETURN, &[]);

    let mut main = FuncDefBuilder::new("@main");
    main.reserve_registers(3);
    emit(&mut main, FUNCREF_iA_iBC, &[1, 1]);
    emit(&mut main, ARGBLK_iABC, &[0]);
    emit(&mut main, CALL_rA_rB_rC, &[0, 2, 1]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish(), f.finish()]).unwrap();
    assert_eq!(vm.call_stack_depth(), 0);

    vm.run_cycles(3);
    assert_eq!(vm.call_stack_depth(), 1);
    assert_eq!(vm.function_name(vm.current_function_index()), "f");
    assert_eq!(vm.base_index(), 2);
    let call = vm.call_stack_frame(0).unwrap();
    assert_eq!(call.return_pc, 3);
    assert_eq!(call.copy_result_to_reg, Some(0));
    assert!(vm.stack_value(1).is_funcref());
    assert_eq!(vm.function_name(9999), "???");

    assert_eq!(vm.run(), Value::Int(7));
    assert_eq!(vm.call_stack_depth(), 0);
}

#[test]
fn vm_recursion_overflows_call_stack() {
    let mut vm = Vm::new(VmConfig { call_slots: 8, ..VmConfig::default() });
    let mut main = FuncDefBuilder::new("@main");
    main.reserve_registers(2);
    emit(&mut main, CALLF_iA_iBC, &[1, 0]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    vm.run();
    assert_eq!(vm.fault().unwrap().error, VmError::CallStackOverflow);
}

#[test]
fn vm_object_method_through_isa_chain() {
    let mut vm = Vm::default();
    // speak(self): r0 = self["sound"]
    let mut speak = FuncDefBuilder::new("speak");
    speak.param(vm.heap_mut(), "self", Value::Null);
    let sound = speak.string_constant(vm.heap_mut(), "sound").unwrap();
    emit(&mut speak, LOAD_rA_kBC, &[2, sound as i32]);
    emit(&mut speak, INDEX_rA_rB_rC, &[0, 1, 2]);
    emit(&mut speak, RETURN, &[]);

    let mut main = FuncDefBuilder::new("@main");
    let speak_key = main.string_constant(vm.heap_mut(), "speak").unwrap();
    let sound_key = main.string_constant(vm.heap_mut(), "sound").unwrap();
    let woof = main.string_constant(vm.heap_mut(), "woof").unwrap();
    main.reserve_registers(6);
    // r1 = Animal {speak: funcref}
    emit(&mut main, MAP_rA_iBC, &[1, 4]);
    emit(&mut main, LOAD_rA_kBC, &[2, speak_key as i32]);
    emit(&mut main, FUNCREF_iA_iBC, &[3, 1]);
    emit(&mut main, IDXSET_rA_rB_rC, &[1, 2, 3]);
    // r4 = new Animal; r4.sound = "woof"
    emit(&mut main, NEW_rA_rB, &[4, 1]);
    emit(&mut main, LOAD_rA_kBC, &[2, sound_key as i32]);
    emit(&mut main, LOAD_rA_kBC, &[3, woof as i32]);
    emit(&mut main, IDXSET_rA_rB_rC, &[4, 2, 3]);
    emit(&mut main, ISA_rA_rB_rC, &[5, 4, 1]);
    emit(&mut main, BRFALSE_rA_iBC, &[5, 4]);
    emit(&mut main, LOAD_rA_kBC, &[2, speak_key as i32]);
    emit(&mut main, METHFIND_rA_rB_rC, &[0, 4, 2]);
    emit(&mut main, CALLIFREF_rA, &[0]);
    emit(&mut main, RETURN, &[]);
    emit(&mut main, LOADNULL_rA, &[0]);
    emit(&mut main, RETURN, &[]);

    vm.reset(vec![main.finish(), speak.finish()]).unwrap();
    let result = vm.run();
    assert_eq!(vm.heap().to_display(result), "woof");
}

#[test]
fn vm_for_loop_with_next_and_iterget() {
    // sum = 0; for x in [5, 6, 7]: sum += x
    let mut main = FuncDefBuilder::new("@main");
    emit(&mut main, LIST_rA_iBC, &[1, 3]);
    for n in [5, 6, 7] {
        emit(&mut main, LOAD_rA_iBC, &[4, n]);
        emit(&mut main, PUSH_rA_rB, &[1, 4]);
    }
    emit(&mut main, LOAD_rA_iBC, &[0, 0]);
    emit(&mut main, LOAD_rA_iBC, &[2, -1]);
    let top = main.pc() as i32;
    emit(&mut main, NEXT_rA_rB, &[2, 1]);
    emit(&mut main, JUMP_iABC, &[3]);
    emit(&mut main, ITERGET_rA_rB_rC, &[3, 1, 2]);
    emit(&mut main, ADD_rA_rB_rC, &[0, 0, 3]);
    let back = top - (main.pc() as i32 + 1);
    emit(&mut main, JUMP_iABC, &[back]);
    emit(&mut main, RETURN, &[]);
    let (_, result) = vm_run(vec![main.finish()]);
    assert_eq!(result, Value::Int(18));
}

#[test]
fn vm_survives_gc_stress() {
    let config = VmConfig { gc: GcConfig { stress: true, ..GcConfig::default() }, ..VmConfig::default() };
    let mut vm = Vm::new(config);
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "item").unwrap();
    let join = main.string_constant(vm.heap_mut(), "join").unwrap();
    emit(&mut main, LIST_rA_iBC, &[1, 0]);
    for _ in 0..4 {
        emit(&mut main, LOAD_rA_kBC, &[2, k as i32]);
        emit(&mut main, PUSH_rA_rB, &[1, 2]);
    }
    emit(&mut main, LOAD_rA_kBC, &[2, join as i32]);
    emit(&mut main, METHFIND_rA_rB_rC, &[0, 1, 2]);
    emit(&mut main, CALLIFREF_rA, &[0]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    let result = vm.run();
    assert_eq!(vm.heap().to_display(result), "item item item item");
    assert!(vm.heap().stats().collections > 0);
}

#[test]
fn vm_register_function_is_callable_by_name() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "seven").unwrap();
    emit(&mut main, CALLFN_iA_kBC, &[0, k as i32]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();

    let mut seven = FuncDefBuilder::new("seven");
    emit(&mut seven, LOAD_rA_iBC, &[0, 7]);
    emit(&mut seven, RETURN, &[]);
    let index = vm.register_function(seven.finish());
    assert_eq!(vm.function_name(index), "seven");
    assert_eq!(vm.run(), Value::Int(7));
}

#[test]
fn vm_len_of_number_faults() {
    let mut vm = Vm::default();
    let mut main = FuncDefBuilder::new("@main");
    let k = main.string_constant(vm.heap_mut(), "len").unwrap();
    emit(&mut main, LOAD_rA_iBC, &[2, 7]);
    emit(&mut main, CALLFN_iA_kBC, &[1, k as i32]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    assert!(vm.run().is_null());
    assert_eq!(vm.state(), RunState::Faulted);
    let fault = vm.fault().unwrap();
    assert_eq!(fault.error, VmError::NoLength { container: "7".into() });
    assert_eq!(fault.error.code(), "R006");
    assert_eq!(fault.pc, 1);
}

fn failing_native(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    ctx.vm().raise_runtime_error(VmError::Sequencing("native failed"));
    Ok(Value::Null)
}

#[test]
fn vm_error_raised_by_native_stops_the_run() {
    let mut vm = Vm::default();
    let failing = Intrinsic::create("failing", failing_native).build_funcdef(vm.heap_mut());
    let mut main = FuncDefBuilder::new("@main");
    main.reserve_registers(3);
    emit(&mut main, CALLF_iA_iBC, &[1, 1]);
    emit(&mut main, LOAD_rA_iBC, &[0, 5]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish(), failing]).unwrap();

    assert!(vm.run().is_null());
    assert_eq!(vm.state(), RunState::Faulted);
    assert!(!vm.is_running());
    assert_eq!(vm.fault().unwrap().error, VmError::Sequencing("native failed"));

    // Running again must not resume past the error.
    assert!(vm.run().is_null());
    assert_eq!(vm.state(), RunState::Faulted);
}

#[test]
fn vm_string_remove_leaves_shadow_stack_balanced() {
    let mut vm = Vm::new(VmConfig { gc: GcConfig { stress: true, ..GcConfig::default() }, ..VmConfig::default() });
    let mut main = FuncDefBuilder::new("@main");
    let remove = main.string_constant(vm.heap_mut(), "remove").unwrap();
    let text = main.string_constant(vm.heap_mut(), "a long string to cut").unwrap();
    let cut = main.string_constant(vm.heap_mut(), "long ").unwrap();
    emit(&mut main, LOAD_rA_kBC, &[2, text as i32]);
    emit(&mut main, LOAD_rA_kBC, &[3, cut as i32]);
    emit(&mut main, CALLFN_iA_kBC, &[1, remove as i32]);
    emit(&mut main, LOAD_rA_rB, &[0, 1]);
    emit(&mut main, RETURN, &[]);
    vm.reset(vec![main.finish()]).unwrap();
    let before = vm.heap().protected_count();
    let result = vm.run();
    assert_eq!(vm.heap().to_display(result), "a string to cut");
    assert_eq!(vm.heap().protected_count(), before);
}
