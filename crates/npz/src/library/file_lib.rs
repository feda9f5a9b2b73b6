//! File I/O library.
//!
//! Open files are `Foreign` heap objects: dropping the object (on sweep or
//! explicit close) releases the OS handle, which is exactly the free
//! capability of the foreign-object interface.

use std::{
    any::Any,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
};

use super::expect_args;
use crate::{
    error::RunResult,
    heap::{HeapData, HeapId},
    object::Foreign,
    runtime_error,
    value::Value,
    vm::Vm,
};

pub(crate) fn import(vm: &mut Vm<'_>, lib: HeapId) -> RunResult<()> {
    vm.define_function(lib, "openFile", open_file_native)?;
    vm.define_function(lib, "closeFile", close_file_native)?;
    vm.define_function(lib, "readFile", read_file_native)?;
    vm.define_function(lib, "fileLength", file_length_native)?;
    vm.define_function(lib, "writeFile", write_file_native)?;
    vm.define_function(lib, "writeFileAt", write_file_at_native)?;
    vm.define_function(lib, "writeFileByte", write_file_byte_native)?;
    Ok(())
}

/// An open (or explicitly closed) file handle.
#[derive(Debug)]
struct NpFile {
    file: Option<File>,
    path: String,
}

impl Foreign for NpFile {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn stringify(&self) -> String {
        format!("<file '{}'>", self.path)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn expect_file<'h>(vm: &'h mut Vm<'_>, value: Value) -> RunResult<&'h mut NpFile> {
    let Value::Obj(id) = value else {
        return Err(runtime_error!(Native, "Expected file pointer."));
    };
    match vm.heap_mut().get_mut(id) {
        HeapData::Foreign(foreign) => foreign
            .as_any_mut()
            .downcast_mut::<NpFile>()
            .ok_or_else(|| runtime_error!(Native, "Expected file pointer.")),
        _ => Err(runtime_error!(Native, "Expected file pointer.")),
    }
}

fn expect_open_file<'h>(vm: &'h mut Vm<'_>, value: Value) -> RunResult<&'h mut File> {
    let npfile = expect_file(vm, value)?;
    npfile
        .file
        .as_mut()
        .ok_or_else(|| runtime_error!(Native, "File is closed. Expected open file."))
}

fn expect_string(vm: &mut Vm<'_>, value: Value) -> RunResult<String> {
    if let Value::Obj(id) = value {
        if let HeapData::Str(s) = vm.heap_mut().get(id) {
            return Ok(s.as_str().to_owned());
        }
    }
    Err(runtime_error!(Native, "Expected strings for arguments."))
}

fn open_file_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let path = expect_string(vm, args[0])?;
    let mode = expect_string(vm, args[1])?;

    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "r+" | "rw" => options.read(true).write(true).create(true),
        _ => return Err(runtime_error!(Native, "Unknown file mode '{mode}'.")),
    };

    let file = options
        .open(&path)
        .map_err(|_| runtime_error!(Native, "Failed to open file."))?;
    let handle = vm.heap_mut().alloc(HeapData::Foreign(Box::new(NpFile {
        file: Some(file),
        path,
    })));
    Ok(Value::Obj(handle))
}

fn close_file_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let npfile = expect_file(vm, args[0])?;
    Ok(Value::Bool(npfile.file.take().is_some()))
}

fn read_file_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let file = expect_open_file(vm, args[0])?;
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .map_err(|e| runtime_error!(Native, "Failed to read file: {e}."))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Obj(vm.heap_mut().intern_owned(text)))
}

fn file_length_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 1)?;
    let file = expect_open_file(vm, args[0])?;
    let len = file
        .metadata()
        .map_err(|e| runtime_error!(Native, "Failed to stat file: {e}."))?
        .len();
    Ok(Value::Number(len as f64))
}

fn write_file_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let text = vm.str_value(args[1])?;
    let file = expect_open_file(vm, args[0])?;
    let written = file
        .seek(SeekFrom::End(0))
        .and_then(|_| file.write(text.as_bytes()))
        .map_err(|e| runtime_error!(Native, "Failed to write file: {e}."))?;
    Ok(Value::Number(written as f64))
}

fn write_file_at_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 3)?;
    let Value::Number(offset) = args[2] else {
        return Err(runtime_error!(Native, "Expected index as third argument."));
    };
    let text = vm.str_value(args[1])?;
    let file = expect_open_file(vm, args[0])?;
    let written = file
        .seek(SeekFrom::Start(offset as u64))
        .and_then(|_| file.write(text.as_bytes()))
        .map_err(|e| runtime_error!(Native, "Failed to write file: {e}."))?;
    Ok(Value::Number(written as f64))
}

fn write_file_byte_native(vm: &mut Vm<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args(args.len(), 2)?;
    let Value::Number(byte) = args[1] else {
        return Err(runtime_error!(Native, "Expected byte as second argument."));
    };
    let file = expect_open_file(vm, args[0])?;
    let written = file
        .seek(SeekFrom::End(0))
        .and_then(|_| file.write(&[byte as u8]))
        .map_err(|e| runtime_error!(Native, "Failed to write file: {e}."))?;
    Ok(Value::Number(written as f64))
}
