//! The standard library: printing, stringification, list helpers, clock,
//! and command-line arguments.

use std::borrow::Cow;

use super::expect_args;
use crate::{
    error::RunResult,
    heap::{HeapData, HeapId},
    object::List,
    runtime_error,
    value::Value,
    vm::Vm,
};

pub(crate) fn import(vm: &mut Vm<'_>, lib: HeapId) -> RunResult<()> {
    vm.define_function(lib, "print", print_native)?;
    vm.define_function(lib, "println", println_native)?;
    vm.define_function(lib, "asString", as_string_native)?;
    vm.define_function(lib, "length", length_native)?;
    vm.define_function(lib, "append", append_native)?;
    vm.define_function(lib, "remove", remove_native)?;
    vm.define_function(lib, "pop", pop_native)?;
    vm.define_function(lib, "clock", clock_native)?;
    vm.define_function(lib, "asByte", as_byte_native)?;
    vm.define_function(lib, "cmdargs", cmdargs_native)?;
    Ok(())
}

/// The subset of `std` that is reachable without importing anything.
pub(crate) fn define_core_globals(vm: &mut Vm<'_>) {
    vm.define_native("print", print_native);
    vm.define_native("println", println_native);
    vm.define_native("asString", as_string_native);
    vm.define_native("length", length_native);
    vm.define_native("append", append_native);
    vm.define_native("remove", remove_native);
    vm.define_native("pop", pop_native);
    vm.define_native("clock", clock_native);
}

fn print_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    for (i, &arg) in args.iter().enumerate() {
        let text = vm.str_value(arg)?;
        vm.writer.stdout_write(Cow::Owned(text))?;
        if i + 1 < args.len() {
            vm.writer.stdout_push(' ')?;
        }
    }
    Ok(Value::Null)
}

fn println_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    print_native(vm, args)?;
    vm.writer.stdout_push('\n')?;
    Ok(Value::Null)
}

fn as_string_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let text = vm.str_value(args[0])?;
    Ok(Value::Obj(vm.heap_mut().intern_owned(text)))
}

fn length_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    if let Value::Obj(id) = args[0] {
        match vm.heap_mut().get(id) {
            HeapData::Str(s) => return Ok(Value::Number(s.len() as f64)),
            HeapData::List(l) => return Ok(Value::Number(l.items.len() as f64)),
            _ => {}
        }
    }
    Err(runtime_error!(Native, "Cannot measure length of given type."))
}

fn expect_list(vm: &mut Vm<'_>, value: Value) -> RunResult<HeapId> {
    match value {
        Value::Obj(id) if matches!(vm.heap_mut().get(id), HeapData::List(_)) => Ok(id),
        _ => Err(runtime_error!(Native, "Expected a list as a first arg.")),
    }
}

fn list_items_mut<'h>(vm: &'h mut Vm<'_>, id: HeapId) -> &'h mut Vec<Value> {
    match vm.heap_mut().get_mut(id) {
        HeapData::List(l) => &mut l.items,
        _ => unreachable!("expect_list validated the receiver"),
    }
}

fn append_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let list = expect_list(vm, args[0])?;
    let items = list_items_mut(vm, list);
    items.push(args[1]);
    Ok(Value::Number(items.len() as f64))
}

fn remove_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let list = expect_list(vm, args[0])?;
    let Value::Number(raw) = args[1] else {
        return Err(runtime_error!(Native, "Expected a number index as a second arg."));
    };
    let items = list_items_mut(vm, list);
    let mut idx = raw as i64;
    if idx < 0 {
        idx += items.len() as i64;
    }
    if idx < 0 || idx >= items.len() as i64 {
        return Err(runtime_error!(Index, "Index out of bounds."));
    }
    items.remove(idx as usize);
    Ok(Value::Number(items.len() as f64))
}

fn pop_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let list = expect_list(vm, args[0])?;
    let items = list_items_mut(vm, list);
    items.pop().ok_or_else(|| runtime_error!(Index, "Given list is empty."))
}

fn clock_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 0)?;
    Ok(Value::Number(vm.clock_seconds()))
}

fn as_byte_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    if let Value::Obj(id) = args[0] {
        if let HeapData::Str(s) = vm.heap_mut().get(id) {
            if s.len() == 1 {
                return Ok(Value::Number(f64::from(s.as_str().as_bytes()[0])));
            }
        }
    }
    Err(runtime_error!(Native, "Expected character as argument."))
}

/// Returns the `-R` argument list as a list of strings.
fn cmdargs_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 0)?;
    let heap = vm.heap_mut();
    // The strings are unrooted until the list is built.
    heap.pause_gc();
    let arg_strings: Vec<String> = vm.cmd_args().to_vec();
    let heap = vm.heap_mut();
    let items: Vec<Value> = arg_strings
        .into_iter()
        .map(|arg| Value::Obj(heap.intern_owned(arg)))
        .collect();
    let list = heap.alloc(HeapData::List(List { items }));
    heap.resume_gc();
    Ok(Value::Obj(list))
}
