//! The stack-based interpreter.
//!
//! The VM owns the heap, the value stack, the call frames, the open-upvalue
//! list, and the global/library/imported-file tables. Every instruction
//! handler returns an explicit result; a runtime error collapses the whole
//! run, resets the stack, and surfaces as an [`Exception`] with a trace.

mod call;
mod props;

use std::{fmt, rc::Rc, time::Instant};

use indexmap::IndexMap;

use crate::{
    bytecode::{Chunk, Opcode},
    compiler,
    error::{CompileError, Exception, LoadError, RunResult, StackFrame},
    heap::{Heap, HeapData, HeapId},
    io::PrintWriter,
    library,
    object::{Class, Closure, List, Namespace, Upvalue},
    runtime_error, serial,
    value::Value,
};

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// A single in-flight call.
#[derive(Debug)]
pub(crate) struct CallFrame {
    /// The closure being executed.
    pub closure: HeapId,
    /// The closure's chunk, cached so instruction fetches skip the heap.
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    /// Stack index of frame slot 0 (the receiver for methods).
    pub base: usize,
    /// Lexical container consulted before globals: instance, class, or
    /// namespace. `Null` for plain functions.
    pub bound: Value,
}

/// Why an [`Vm::interpret`] call failed.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(Exception),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(e) => e.fmt(f),
            Self::Runtime(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for InterpretError {}

/// The npz virtual machine.
pub struct Vm<'out> {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues ordered by ascending stack slot (the head of the
    /// original descending intrusive list is the tail here).
    pub(crate) open_upvalues: Vec<HeapId>,
    pub(crate) globals: IndexMap<HeapId, Value>,
    /// Library registry: name string -> library object.
    pub(crate) libraries: IndexMap<HeapId, HeapId>,
    /// File-import cache: file name string -> namespace.
    pub(crate) imported_files: IndexMap<HeapId, HeapId>,
    /// The namespace receiving top-level definitions, if any.
    pub(crate) nspace: Option<HeapId>,
    /// Global scopes shelved while a file import runs; still GC roots.
    saved_scopes: Vec<(IndexMap<HeapId, Value>, Option<HeapId>)>,
    cmd_args: Vec<String>,
    pub(crate) writer: &'out mut dyn PrintWriter,
    start_time: Instant,
}

impl<'out> Vm<'out> {
    /// Creates a VM with the standard libraries registered and the core
    /// natives (`println` and friends) defined as globals.
    pub fn new(writer: &'out mut dyn PrintWriter) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: IndexMap::new(),
            libraries: IndexMap::new(),
            imported_files: IndexMap::new(),
            nspace: None,
            saved_scopes: Vec::new(),
            cmd_args: Vec::new(),
            writer,
            start_time: Instant::now(),
        };
        let main_name = vm.heap.intern("main");
        let main_ns = vm.heap.alloc(HeapData::Namespace(Namespace::new(main_name)));
        vm.nspace = Some(main_ns);
        library::manager::define_all_libraries(&mut vm);
        vm
    }

    /// Sets the argument list surfaced by the `cmdargs` native.
    pub fn set_cmd_args(&mut self, args: Vec<String>) {
        self.cmd_args = args;
    }

    pub(crate) fn cmd_args(&self) -> &[String] {
        &self.cmd_args
    }

    /// Seconds since the VM was created; the `clock` native.
    pub(crate) fn clock_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Exposes the heap to embedders (e.g. for foreign objects).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Compiles source into a top-level function.
    ///
    /// The returned function must be rooted (typically by running it) before
    /// further allocation can trigger a collection.
    pub fn compile_source(&mut self, source: &str, name: Option<&str>) -> Result<HeapId, CompileError> {
        compiler::compile(self, source, name)
    }

    /// Compiles and runs a source buffer, returning the script's value.
    pub fn interpret(&mut self, source: &str, name: Option<&str>) -> Result<Value, InterpretError> {
        let function = self.compile_source(source, name).map_err(InterpretError::Compile)?;
        self.run_function(function).map_err(InterpretError::Runtime)
    }

    /// Serializes a compiled function to the canonical byte format.
    #[must_use]
    pub fn dump_function(&self, function: HeapId) -> Vec<u8> {
        serial::dump_function(&self.heap, function)
    }

    /// Loads a function from the canonical byte format and records its name
    /// in the imported-files table.
    pub fn load_function(&mut self, bytes: &[u8]) -> Result<HeapId, LoadError> {
        let function = serial::load_function(&mut self.heap, bytes)?;
        if let (Some(name), Some(ns)) = (self.heap.function(function).name, self.nspace) {
            self.imported_files.insert(name, ns);
        }
        Ok(function)
    }

    /// Wraps a compiled function in a closure and runs it to completion.
    ///
    /// On failure the stack and frames are reset and the error carries the
    /// captured trace.
    pub fn run_function(&mut self, function: HeapId) -> Result<Value, Exception> {
        self.push(Value::Obj(function));
        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        let bound = self.nspace.map_or(Value::Null, Value::Obj);
        let outcome = self.call_closure(closure, 0, bound).and_then(|()| self.run(0));
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                let trace = self.capture_trace();
                self.reset_stack();
                Err(Exception { error, trace })
            }
        }
    }

    // ---- stack ----------------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < STACK_MAX, "value stack overflow");
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub(crate) fn popn(&mut self, n: usize) {
        let len = self.stack.len();
        self.stack.truncate(len - n);
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---- allocation & GC ------------------------------------------------

    /// Allocates through the collection trigger: a pending collection runs
    /// first, so the fresh object can never be swept at birth.
    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        self.maybe_gc();
        self.heap.alloc(data)
    }

    /// Runs a collection if allocation pressure demands one.
    pub(crate) fn maybe_gc(&mut self) {
        if self.heap.needs_gc() {
            self.collect_garbage();
        }
    }

    /// Forces a full collection from the VM's roots.
    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.heap.finish_collect();
    }

    /// Marks everything the VM can reach: stack slots, frame closures and
    /// binders, open upvalues, globals, libraries, imported files, the
    /// current namespace, and shelved import scopes.
    pub(crate) fn mark_roots(&mut self) {
        let Self {
            heap,
            stack,
            frames,
            open_upvalues,
            globals,
            libraries,
            imported_files,
            nspace,
            saved_scopes,
            ..
        } = self;
        for &value in stack.iter() {
            heap.mark_value(value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
            heap.mark_value(frame.bound);
        }
        for &upvalue in open_upvalues.iter() {
            heap.mark_object(upvalue);
        }
        for (name, value) in globals.iter() {
            heap.mark_object(*name);
            heap.mark_value(*value);
        }
        for (name, lib) in libraries.iter() {
            heap.mark_object(*name);
            heap.mark_object(*lib);
        }
        for (name, ns) in imported_files.iter() {
            heap.mark_object(*name);
            heap.mark_object(*ns);
        }
        if let Some(ns) = nspace {
            heap.mark_object(*ns);
        }
        for (scope, scope_ns) in saved_scopes.iter() {
            for (name, value) in scope {
                heap.mark_object(*name);
                heap.mark_value(*value);
            }
            if let Some(ns) = scope_ns {
                heap.mark_object(*ns);
            }
        }
    }

    // ---- instruction fetch ----------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    pub(crate) fn frame_bound(&self) -> Value {
        self.frames.last().map_or(Value::Null, |f| f.bound)
    }

    fn fetch_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code()[frame.ip];
        frame.ip += 1;
        byte
    }

    /// Jump operands are big-endian u16.
    fn fetch_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let hi = frame.chunk.code()[frame.ip];
        let lo = frame.chunk.code()[frame.ip + 1];
        frame.ip += 2;
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.fetch_byte() as usize;
        self.frame().chunk.constants()[idx]
    }

    /// const24 operands are little-endian.
    fn read_constant_long(&mut self) -> Value {
        let b0 = self.fetch_byte() as usize;
        let b1 = self.fetch_byte() as usize;
        let b2 = self.fetch_byte() as usize;
        self.frame().chunk.constants()[b0 | (b1 << 8) | (b2 << 16)]
    }

    fn read_name(&mut self) -> HeapId {
        self.read_constant().as_obj().expect("corrupt bytecode: name constant")
    }

    // ---- the interpreter loop -------------------------------------------

    /// Executes until the frame stack collapses back to `floor`, returning
    /// the value produced by the final `Return`.
    pub(crate) fn run(&mut self, floor: usize) -> RunResult<Value> {
        loop {
            let op = Opcode::from_byte(self.fetch_byte()).expect("corrupt bytecode: opcode");
            match op {
                Opcode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Opcode::ConstantLong => {
                    let value = self.read_constant_long();
                    self.push(value);
                }
                Opcode::Null => self.push(Value::Null),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::PopN => {
                    let n = self.fetch_byte() as usize;
                    self.popn(n);
                }

                Opcode::DefineGlobal => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    self.define_global(name, value);
                    self.pop();
                }
                Opcode::GetGlobal => {
                    let name = self.read_name();
                    let value = self.get_global(name)?;
                    self.push(value);
                }
                Opcode::SetGlobal => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    if self.globals.contains_key(&name) {
                        self.globals.insert(name, value);
                        if let Some(ns) = self.nspace {
                            if let HeapData::Namespace(ns) = self.heap.get_mut(ns) {
                                if ns.values.contains_key(&name) {
                                    ns.values.insert(name, value);
                                }
                            }
                        }
                    } else {
                        let text = self.heap.string(name).to_owned();
                        return Err(runtime_error!(UndefinedName, "Global variable '{text}' is undefined."));
                    }
                }

                Opcode::GetLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }

                Opcode::GetUpvalue => {
                    let slot = self.fetch_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[stack_slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = self.fetch_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[stack_slot] = value,
                        Upvalue::Closed(_) => {
                            self.heap.set_upvalue(upvalue, Upvalue::Closed(value));
                        }
                    }
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Opcode::Jump => {
                    let offset = self.fetch_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.fetch_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::JumpIfTrue => {
                    let offset = self.fetch_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.fetch_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                Opcode::Call => {
                    let argc = self.fetch_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }

                Opcode::Closure => {
                    self.make_closure()?;
                }

                Opcode::Class => {
                    let name = self.read_name();
                    let class = self.alloc(HeapData::Class(Class::new(name)));
                    self.push(Value::Obj(class));
                }
                Opcode::Inherit => {
                    self.inherit()?;
                }
                Opcode::Method => {
                    self.define_method()?;
                }
                Opcode::Attribute => {
                    self.define_attribute();
                }

                Opcode::GetProperty => {
                    let name = self.read_name();
                    let object = self.peek(0);
                    let value = self.get_property(object, name)?;
                    self.pop();
                    self.push(value);
                }
                Opcode::SetProperty => {
                    let name = self.read_name();
                    let object = self.peek(1);
                    let value = self.peek(0);
                    self.set_property(object, name, value)?;
                    self.popn(2);
                    self.push(value);
                }
                Opcode::Invoke => {
                    let name = self.read_name();
                    let argc = self.fetch_byte() as usize;
                    self.invoke(name, argc)?;
                }
                Opcode::GetSuper => {
                    let name = self.read_name();
                    let superclass = self.pop();
                    let receiver = self.peek(0);
                    let bound = self.bind_super_method(superclass, receiver, name)?;
                    self.pop();
                    self.push(bound);
                }
                Opcode::SuperInvoke => {
                    let name = self.read_name();
                    let argc = self.fetch_byte() as usize;
                    let superclass = self.pop();
                    let Some(class) = superclass.as_obj() else {
                        return Err(runtime_error!(Type, "Cannot invoke super method on non-class."));
                    };
                    let receiver = self.peek(argc);
                    self.invoke_from_class(class, name, argc, receiver)?;
                }

                Opcode::MakeList => {
                    let count = self.fetch_byte() as usize;
                    self.maybe_gc();
                    let start = self.stack.len() - count;
                    let items = self.stack[start..].to_vec();
                    let list = self.heap.alloc(HeapData::List(List { items }));
                    self.popn(count);
                    self.push(Value::Obj(list));
                }
                Opcode::GetIndex => {
                    let index = self.pop();
                    let container = self.pop();
                    let value = self.index_get(container, index)?;
                    self.push(value);
                }
                Opcode::SetIndex => {
                    let value = self.peek(0);
                    let index = self.peek(1);
                    let container = self.peek(2);
                    self.index_set(container, index, value)?;
                    self.popn(3);
                    self.push(value);
                }

                Opcode::Import => {
                    let name = self.read_name();
                    let namespace = self.import_library(name)?;
                    self.push(namespace);
                }
                Opcode::ImportFile => {
                    let Some(name) = self.peek(0).as_obj() else {
                        return Err(runtime_error!(Type, "Import file name must be a string."));
                    };
                    let namespace = self.import_file(name)?;
                    let top = self.stack.len() - 1;
                    self.stack[top] = namespace;
                }
                Opcode::Unpack => {
                    let value = self.pop();
                    self.unpack_namespace(value)?;
                }

                Opcode::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    self.stack.truncate(base);
                    if self.frames.len() == floor {
                        return Ok(result);
                    }
                    self.push(result);
                }

                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(runtime_error!(Type, "Operand must be a number."));
                    };
                    let top = self.stack.len() - 1;
                    self.stack[top] = Value::Number(-n);
                }
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.values_equal(a, b)?;
                    self.push(Value::Bool(eq));
                }
                Opcode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.values_equal(a, b)?;
                    self.push(Value::Bool(!eq));
                }
                Opcode::Greater => self.comparison(op)?,
                Opcode::GreaterEqual => self.comparison(op)?,
                Opcode::Less => self.comparison(op)?,
                Opcode::LessEqual => self.comparison(op)?,

                Opcode::Add => self.add()?,
                Opcode::Subtract => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                Opcode::Multiply => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                Opcode::Divide => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a / b));
                }
            }
        }
    }

    // ---- arithmetic helpers ---------------------------------------------

    fn numeric_operands(&mut self) -> RunResult<(f64, f64)> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.popn(2);
                Ok((a, b))
            }
            _ => Err(runtime_error!(Type, "Operands must be numbers.")),
        }
    }

    fn comparison(&mut self, op: Opcode) -> RunResult<()> {
        let result = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => match op {
                Opcode::Greater => a > b,
                Opcode::GreaterEqual => a >= b,
                Opcode::Less => a < b,
                _ => a <= b,
            },
            (Value::Obj(a), Value::Obj(b)) => match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::Str(a), HeapData::Str(b)) => {
                    let (a, b) = (a.as_str().as_bytes(), b.as_str().as_bytes());
                    match op {
                        Opcode::Greater => a > b,
                        Opcode::GreaterEqual => a >= b,
                        Opcode::Less => a < b,
                        _ => a <= b,
                    }
                }
                _ => return Err(runtime_error!(Type, "Operands must be numbers or strings.")),
            },
            _ => return Err(runtime_error!(Type, "Operands must be numbers or strings.")),
        };
        self.popn(2);
        self.push(Value::Bool(result));
        Ok(())
    }

    /// `+`: adds numbers, concatenates strings, appends lists.
    fn add(&mut self) -> RunResult<()> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.popn(2);
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b)) => match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::Str(sa), HeapData::Str(sb)) => {
                    let mut text = String::with_capacity(sa.len() + sb.len());
                    text.push_str(sa.as_str());
                    text.push_str(sb.as_str());
                    self.maybe_gc();
                    let id = self.heap.intern_owned(text);
                    self.popn(2);
                    self.push(Value::Obj(id));
                    Ok(())
                }
                (HeapData::List(la), HeapData::List(lb)) => {
                    let mut items = Vec::with_capacity(la.items.len() + lb.items.len());
                    items.extend_from_slice(&la.items);
                    items.extend_from_slice(&lb.items);
                    self.maybe_gc();
                    let id = self.heap.alloc(HeapData::List(List { items }));
                    self.popn(2);
                    self.push(Value::Obj(id));
                    Ok(())
                }
                _ => Err(runtime_error!(Type, "Operands must be of the same type.")),
            },
            _ => Err(runtime_error!(Type, "Operands must be of the same type.")),
        }
    }

    fn index_get(&mut self, container: Value, index: Value) -> RunResult<Value> {
        let (list, idx) = self.list_index(container, index)?;
        match self.heap.get(list) {
            HeapData::List(l) => Ok(l.items[idx]),
            _ => unreachable!("list_index validated the container"),
        }
    }

    fn index_set(&mut self, container: Value, index: Value, value: Value) -> RunResult<()> {
        let (list, idx) = self.list_index(container, index)?;
        match self.heap.get_mut(list) {
            HeapData::List(l) => {
                l.items[idx] = value;
                Ok(())
            }
            _ => unreachable!("list_index validated the container"),
        }
    }

    /// Validates a list/index pair, applying negative-index wrapping.
    fn list_index(&self, container: Value, index: Value) -> RunResult<(HeapId, usize)> {
        let list = match container {
            Value::Obj(id) if matches!(self.heap.get(id), HeapData::List(_)) => id,
            _ => return Err(runtime_error!(Type, "Only lists can be indexed.")),
        };
        let Value::Number(raw) = index else {
            return Err(runtime_error!(Type, "List index must be a number."));
        };
        let len = match self.heap.get(list) {
            HeapData::List(l) => l.items.len() as i64,
            _ => unreachable!(),
        };
        let mut idx = raw as i64;
        if idx < 0 {
            idx += len;
        }
        if idx < 0 || idx >= len {
            return Err(runtime_error!(Index, "Index out of bounds."));
        }
        Ok((list, idx as usize))
    }

    // ---- globals & namespaces -------------------------------------------

    /// Defines a global, mirroring it into the current namespace (publicly)
    /// so a file's top-level definitions become its namespace surface.
    pub(crate) fn define_global(&mut self, name: HeapId, value: Value) {
        self.globals.insert(name, value);
        let Some(ns) = self.nspace else { return };
        if let HeapData::Namespace(namespace) = self.heap.get_mut(ns) {
            namespace.write(name, value, true);
        }
        // A class defined inside a namespace adopts it as its binder.
        if let Value::Obj(id) = value {
            if let HeapData::Class(class) = self.heap.get_mut(id) {
                if matches!(class.bound, Value::Null) {
                    class.bound = Value::Obj(ns);
                }
            }
        }
    }

    fn get_global(&mut self, name: HeapId) -> RunResult<Value> {
        if let Some(value) = self.resolve_bound_name(self.frame_bound(), name)? {
            return Ok(value);
        }
        if let Some(&value) = self.globals.get(&name) {
            return Ok(value);
        }
        let text = self.heap.string(name).to_owned();
        Err(runtime_error!(UndefinedName, "Global variable '{text}' is undefined."))
    }

    /// Splices a namespace's public entries into the globals.
    fn unpack_namespace(&mut self, value: Value) -> RunResult<()> {
        let Some(id) = value.as_obj() else {
            return Err(runtime_error!(Type, "Can only unpack namespaces."));
        };
        let HeapData::Namespace(ns) = self.heap.get(id) else {
            return Err(runtime_error!(Type, "Can only unpack namespaces."));
        };
        let entries: Vec<(HeapId, Value)> = ns
            .publics
            .iter()
            .filter_map(|key| ns.values.get(key).map(|v| (*key, *v)))
            .collect();
        for (key, entry) in entries {
            self.globals.insert(key, entry);
        }
        Ok(())
    }

    // ---- traces ---------------------------------------------------------

    /// Walks the live frames into a trace, outermost first.
    fn capture_trace(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .map(|frame| {
                let line = frame.chunk.line_for(frame.ip.saturating_sub(1));
                let function = self
                    .heap
                    .function(self.heap.closure(frame.closure).function)
                    .name
                    .map(|name| self.heap.string(name).to_owned());
                StackFrame { line, function }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::NoPrint;

    #[test]
    fn push_peek_pop_discipline() {
        let mut writer = NoPrint;
        let mut vm = Vm::new(&mut writer);
        for i in 0..10 {
            vm.push(Value::Number(f64::from(i)));
            assert!(vm.peek(0).same(Value::Number(f64::from(i))));
        }
        for i in (0..10).rev() {
            assert!(vm.pop().same(Value::Number(f64::from(i))));
        }
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn globals_persist_across_runs_and_errors_reset_the_stack() {
        let mut writer = NoPrint;
        let mut vm = Vm::new(&mut writer);
        vm.interpret("var a = 1;", None).expect("first run failed");
        vm.interpret("var b = a + 1;", None).expect("second run failed");
        assert!(vm.interpret("boom();", None).is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        vm.interpret("var c = b + 1;", None).expect("run after error failed");
    }

    #[test]
    fn runtime_errors_report_the_failing_line() {
        let mut writer = NoPrint;
        let mut vm = Vm::new(&mut writer);
        let err = vm.interpret("var ok = 1;\nvar bad = ok + \"s\";\n", None).unwrap_err();
        let InterpretError::Runtime(exception) = err else {
            panic!("expected a runtime error");
        };
        assert_eq!(exception.trace.last().map(|f| f.line), Some(2));
    }
}
