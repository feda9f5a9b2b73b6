//! Math library: a thin layer over the host float operations.

use super::expect_number_args;
use crate::{error::RunResult, heap::HeapId, value::Value, vm::Vm};

pub(crate) fn import(vm: &mut Vm<'_>, lib: HeapId) -> RunResult<()> {
    vm.define_function(lib, "pow", pow_native)?;
    vm.define_function(lib, "mod", mod_native)?;
    vm.define_function(lib, "round", round_native)?;
    vm.define_function(lib, "floor", floor_native)?;
    vm.define_function(lib, "ceil", ceil_native)?;
    vm.define_function(lib, "sin", sin_native)?;
    vm.define_function(lib, "cos", cos_native)?;
    vm.define_constant(lib, "pi", Value::Number(std::f64::consts::PI))?;
    Ok(())
}

fn pow_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 2)?;
    Ok(Value::Number(n[0].powf(n[1])))
}

fn mod_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 2)?;
    Ok(Value::Number(n[0] % n[1]))
}

fn round_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 1)?;
    Ok(Value::Number(n[0].round()))
}

fn floor_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 1)?;
    Ok(Value::Number(n[0].floor()))
}

fn ceil_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 1)?;
    Ok(Value::Number(n[0].ceil()))
}

fn sin_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 1)?;
    Ok(Value::Number(n[0].sin()))
}

fn cos_native(_vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    let n = expect_number_args(args, 1)?;
    Ok(Value::Number(n[0].cos()))
}
