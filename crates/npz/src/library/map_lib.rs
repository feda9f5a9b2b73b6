//! Map library: a hash map keyed by value hash.
//!
//! The map itself is a `Foreign` heap object whose `trace` capability
//! reports the stored keys and values to the collector. Keys hash through
//! the VM's value-hash protocol, so instances participate via `def hash`.

use std::any::Any;

use ahash::AHashMap;

use super::expect_args;
use crate::{
    error::RunResult,
    heap::{HeapData, HeapId},
    object::{Foreign, List},
    runtime_error,
    value::Value,
    vm::Vm,
};

pub(crate) fn import(vm: &mut Vm<'_>, lib: HeapId) -> RunResult<()> {
    vm.define_function(lib, "map", map_native)?;
    vm.define_function(lib, "put", put_native)?;
    vm.define_function(lib, "emplace", emplace_native)?;
    vm.define_function(lib, "get", get_native)?;
    vm.define_function(lib, "remove", remove_native)?;
    vm.define_function(lib, "has", has_native)?;
    vm.define_function(lib, "keys", keys_native)?;
    Ok(())
}

/// Hash map from key hash to the original `(key, value)` pair.
#[derive(Debug, Default)]
struct NpMap {
    entries: AHashMap<u64, (Value, Value)>,
}

impl Foreign for NpMap {
    fn type_name(&self) -> &'static str {
        "map"
    }

    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        for (key, value) in self.entries.values() {
            mark(*key);
            mark(*value);
        }
    }

    fn stringify(&self) -> String {
        format!("<map ({})>", self.entries.len())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn expect_map(vm: &mut Vm<'_>, value: Value) -> RunResult<HeapId> {
    if let Value::Obj(id) = value {
        if let HeapData::Foreign(foreign) = vm.heap_mut().get(id) {
            if foreign.as_any().is::<NpMap>() {
                return Ok(id);
            }
        }
    }
    Err(runtime_error!(Native, "Expected map as first argument."))
}

fn entries_mut<'h>(vm: &'h mut Vm<'_>, id: HeapId) -> &'h mut AHashMap<u64, (Value, Value)> {
    match vm.heap_mut().get_mut(id) {
        HeapData::Foreign(foreign) => {
            &mut foreign
                .as_any_mut()
                .downcast_mut::<NpMap>()
                .expect("expect_map validated the receiver")
                .entries
        }
        _ => unreachable!("expect_map validated the receiver"),
    }
}

fn map_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    if args.len() % 2 == 1 {
        return Err(runtime_error!(Native, "Not every key has a value pair."));
    }
    let mut map = NpMap::default();
    for pair in args.chunks_exact(2) {
        let hash = vm.value_hash(pair[0])?;
        map.entries.insert(hash, (pair[0], pair[1]));
    }
    // The stored values stay rooted on the caller's stack until the map
    // object (which traces them) is returned.
    let id = vm.heap_mut().alloc(HeapData::Foreign(Box::new(map)));
    Ok(Value::Obj(id))
}

fn put_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 3)?;
    let map = expect_map(vm, args[0])?;
    let hash = vm.value_hash(args[1])?;
    entries_mut(vm, map).insert(hash, (args[1], args[2]));
    Ok(Value::Null)
}

fn emplace_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 3)?;
    let map = expect_map(vm, args[0])?;
    let hash = vm.value_hash(args[1])?;
    let entries = entries_mut(vm, map);
    if entries.contains_key(&hash) {
        return Ok(Value::Bool(false));
    }
    entries.insert(hash, (args[1], args[2]));
    Ok(Value::Bool(true))
}

fn get_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let map = expect_map(vm, args[0])?;
    let hash = vm.value_hash(args[1])?;
    Ok(entries_mut(vm, map).get(&hash).map_or(Value::Null, |(_, v)| *v))
}

fn remove_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let map = expect_map(vm, args[0])?;
    let hash = vm.value_hash(args[1])?;
    Ok(Value::Bool(entries_mut(vm, map).remove(&hash).is_some()))
}

fn has_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let map = expect_map(vm, args[0])?;
    let hash = vm.value_hash(args[1])?;
    Ok(Value::Bool(entries_mut(vm, map).contains_key(&hash)))
}

fn keys_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let map = expect_map(vm, args[0])?;
    // The keys stay rooted through the map argument while the list builds.
    let items: Vec<Value> = entries_mut(vm, map).values().map(|(k, _)| *k).collect();
    let list = vm.heap_mut().alloc(HeapData::List(List { items }));
    Ok(Value::Obj(list))
}
