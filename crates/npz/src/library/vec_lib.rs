//! Vector library: growable-list helpers beyond the core natives.

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
    vm.define_function(lib, "vec", vec_native)?;
    vm.define_function(lib, "append", append_native)?;
    vm.define_function(lib, "insert", insert_native)?;
    vm.define_function(lib, "remove", remove_native)?;
    vm.define_function(lib, "pop", pop_native)?;
    vm.define_function(lib, "size", size_native)?;
    vm.define_function(lib, "at", at_native)?;
    Ok(())
}

fn expect_vec(vm: &mut Vm<'_>, value: Value) -> RunResult<HeapId> {
    match value {
        Value::Obj(id) if matches!(vm.heap_mut().get(id), HeapData::List(_)) => Ok(id),
        _ => Err(runtime_error!(Native, "Expected a vector as a first arg.")),
    }
}

fn items_mut<'h>(vm: &'h mut Vm<'_>, id: HeapId) -> &'h mut Vec<Value> {
    match vm.heap_mut().get_mut(id) {
        HeapData::List(l) => &mut l.items,
        _ => unreachable!("expect_vec validated the receiver"),
    }
}

/// Resolves a possibly negative index against `len`.
fn resolve_index(raw: f64, len: usize) -> RunResult<usize> {
    let mut idx = raw as i64;
    if idx < 0 {
        idx += len as i64;
    }
    if idx < 0 || idx >= len as i64 {
        return Err(runtime_error!(Index, "Index out of bounds."));
    }
    Ok(idx as usize)
}

fn vec_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    // The argument values stay rooted on the caller's stack.
    let list = vm.heap_mut().alloc(HeapData::List(List { items: args.to_vec() }));
    Ok(Value::Obj(list))
}

fn append_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let vec = expect_vec(vm, args[0])?;
    let items = items_mut(vm, vec);
    items.push(args[1]);
    Ok(Value::Number(items.len() as f64))
}

fn insert_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 3)?;
    let vec = expect_vec(vm, args[0])?;
    let Value::Number(raw) = args[1] else {
        return Err(runtime_error!(Native, "Expected a number index as a second arg."));
    };
    let items = items_mut(vm, vec);
    // Inserting at the end is allowed.
    let idx = if raw as i64 == items.len() as i64 {
        items.len()
    } else {
        resolve_index(raw, items.len())?
    };
    items.insert(idx, args[2]);
    Ok(Value::Number(items.len() as f64))
}

fn remove_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let vec = expect_vec(vm, args[0])?;
    let Value::Number(raw) = args[1] else {
        return Err(runtime_error!(Native, "Expected a number index as a second arg."));
    };
    let items = items_mut(vm, vec);
    let idx = resolve_index(raw, items.len())?;
    Ok(items.remove(idx))
}

fn pop_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let vec = expect_vec(vm, args[0])?;
    items_mut(vm, vec)
        .pop()
        .ok_or_else(|| runtime_error!(Index, "Given vector is empty."))
}

fn size_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let vec = expect_vec(vm, args[0])?;
    let len = items_mut(vm, vec).len();
    Ok(Value::Number(len as f64))
}

fn at_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let vec = expect_vec(vm, args[0])?;
    let Value::Number(raw) = args[1] else {
        return Err(runtime_error!(Native, "Expected a number index as a second arg."));
    };
    let items = items_mut(vm, vec);
    let idx = resolve_index(raw, items.len())?;
    Ok(items[idx])
}
