//! Calling convention: closures, natives, class construction, bound
//! methods, closure/upvalue machinery, and library/file imports.

use smallvec::SmallVec;

use super::{CallFrame, Vm, FRAMES_MAX};
use crate::{
    bytecode::Opcode,
    error::RunResult,
    heap::{HeapData, HeapId},
    object::{Attr, Closure, DefaultMethod, Instance, Namespace, NativeFn, Upvalue},
    runtime_error, serial,
    value::Value,
};

impl Vm<'_> {
    /// Calls `callee` with `argc` arguments already on the stack.
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> RunResult<()> {
        let Value::Obj(id) = callee else {
            return Err(runtime_error!(Type, "Cannot call non-function object."));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, argc, Value::Null),
            HeapData::Native(native) => {
                let func = native.func;
                self.call_native(func, argc)
            }
            HeapData::Class(_) => self.construct(id, argc),
            HeapData::Bound(bound) => {
                let bound = *bound;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, argc, bound.receiver)
            }
            _ => Err(runtime_error!(Type, "Cannot call non-function object.")),
        }
    }

    /// Pushes a frame for `closure`. The arity must match exactly.
    pub(crate) fn call_closure(&mut self, closure: HeapId, argc: usize, bound: Value) -> RunResult<()> {
        let function = self.heap.closure(closure).function;
        let function = self.heap.function(function);
        let arity = function.arity as usize;
        if argc != arity {
            return Err(runtime_error!(Arity, "Expected {arity} arguments, but received {argc}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(runtime_error!(StackOverflow, "Call stack overflow."));
        }
        let chunk = function.chunk.clone();
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base: self.stack.len() - argc - 1,
            bound,
        });
        Ok(())
    }

    /// Invokes a native callback; its result replaces the call region.
    pub(crate) fn call_native(&mut self, func: NativeFn, argc: usize) -> RunResult<()> {
        let start = self.stack.len() - argc;
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[start..]);
        let result = func(self, &args)?;
        self.popn(argc + 1);
        self.push(result);
        Ok(())
    }

    /// Calls a class: allocates an instance from the field template and
    /// runs the constructor if there is one.
    fn construct(&mut self, class_id: HeapId, argc: usize) -> RunResult<()> {
        let (constructor, fields, bound) = match self.heap.get(class_id) {
            HeapData::Class(class) => (class.constructor, class.fields.clone(), class.bound),
            _ => unreachable!("construct called on non-class"),
        };
        // The class value and arguments are still on the stack, so a
        // collection here cannot reach the half-built instance's parts.
        self.maybe_gc();
        let instance = self.heap.alloc(HeapData::Instance(Instance {
            class: class_id,
            fields,
            bound,
        }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);

        if let Some(constructor) = constructor {
            self.call_closure(constructor, argc, Value::Obj(instance))
        } else if argc != 0 {
            Err(runtime_error!(Arity, "Expected 0 args but got {argc}."))
        } else {
            Ok(())
        }
    }

    /// Runs a class's default method (`string`/`eq`/`hash`) to completion
    /// on a nested interpreter run. `Ok(None)` when the slot is unset.
    pub(crate) fn call_default(
        &mut self,
        instance: HeapId,
        which: DefaultMethod,
        args: &[Value],
    ) -> RunResult<Option<Value>> {
        let class = match self.heap.get(instance) {
            HeapData::Instance(i) => i.class,
            _ => return Ok(None),
        };
        let method = match self.heap.get(class) {
            HeapData::Class(c) => c.defaults[which as usize],
            _ => None,
        };
        let Some(method) = method else {
            return Ok(None);
        };

        self.push(Value::Obj(instance));
        for &arg in args {
            self.push(arg);
        }
        let floor = self.frames.len();
        self.call_closure(method, args.len(), Value::Obj(instance))?;
        let value = self.run(floor)?;
        Ok(Some(value))
    }

    // ---- closures & upvalues ---------------------------------------------

    /// Executes the `Closure` instruction: reads the embedded function
    /// constant and the upvalue descriptors, capturing as it goes.
    pub(crate) fn make_closure(&mut self) -> RunResult<()> {
        let tag = Opcode::from_byte(self.fetch_byte());
        let function_value = match tag {
            Some(Opcode::Constant) => self.read_constant(),
            Some(Opcode::ConstantLong) => self.read_constant_long(),
            _ => panic!("corrupt bytecode: closure constant"),
        };
        let function = function_value.as_obj().expect("corrupt bytecode: closure function");

        let upvalue_count = self.heap.function(function).upvalue_count as usize;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.fetch_byte() != 0;
            let index = self.fetch_byte() as usize;
            if is_local {
                let base = self.frames.last().expect("no active call frame").base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let enclosing = self.frames.last().expect("no active call frame").closure;
                upvalues.push(self.heap.closure(enclosing).upvalues[index]);
            }
        }

        // Captured upvalues are rooted via the open-upvalue list (or the
        // enclosing closure), so the allocation below is safe.
        let closure = self.alloc(HeapData::Closure(Closure { function, upvalues }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    /// Finds or creates the open upvalue for an absolute stack slot.
    ///
    /// The open list stays sorted by slot so closing can peel entries off
    /// the top; at most one open upvalue exists per slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let position = self.open_upvalues.binary_search_by_key(&slot, |&id| match self.heap.upvalue(id) {
            Upvalue::Open(s) => s,
            Upvalue::Closed(_) => unreachable!("closed upvalue on the open list"),
        });
        match position {
            Ok(found) => self.open_upvalues[found],
            Err(insert_at) => {
                let upvalue = self.heap.alloc(HeapData::Upvalue(Upvalue::Open(slot)));
                self.open_upvalues.insert(insert_at, upvalue);
                upvalue
            }
        }
    }

    /// Closes every open upvalue at or above `from_slot`: the slot's value
    /// moves into the upvalue, which leaves the open list for good.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&top) = self.open_upvalues.last() {
            let Upvalue::Open(slot) = self.heap.upvalue(top) else {
                unreachable!("closed upvalue on the open list");
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            self.heap.set_upvalue(top, Upvalue::Closed(value));
            self.open_upvalues.pop();
        }
    }

    // ---- class body opcodes ------------------------------------------------

    /// `Inherit`: copies the superclass's surface into the subclass, then
    /// pops the subclass (leaving the superclass as the `super` local).
    pub(crate) fn inherit(&mut self) -> RunResult<()> {
        let superclass = self.peek(1);
        let subclass = self.peek(0);
        let Some(super_id) = superclass.as_obj() else {
            return Err(runtime_error!(Type, "Cannot inherit from non-class objects."));
        };
        let (methods, fields, statics, constructor, defaults) = match self.heap.get(super_id) {
            HeapData::Class(c) => (
                c.methods.clone(),
                c.fields.clone(),
                c.statics.clone(),
                c.constructor,
                c.defaults,
            ),
            _ => return Err(runtime_error!(Type, "Cannot inherit from non-class objects.")),
        };
        let sub_id = subclass.as_obj().expect("subclass must be a class");
        match self.heap.get_mut(sub_id) {
            HeapData::Class(sub) => {
                sub.methods = methods;
                sub.fields = fields;
                sub.statics = statics;
                sub.constructor = constructor;
                sub.defaults = defaults;
            }
            _ => unreachable!("Inherit with non-class on top of stack"),
        }
        self.pop();
        Ok(())
    }

    /// `Method`: attaches the closure at the top of the stack to the class
    /// just below it. The kind byte selects named method, builder, or
    /// default-method slot.
    pub(crate) fn define_method(&mut self) -> RunResult<()> {
        let kind = self.fetch_byte();
        match kind {
            0 => {
                let name = self.read_name();
                let is_public = self.fetch_byte() != 0;
                let is_static = self.fetch_byte() != 0;
                let method = self.peek(0);
                let class = self.peek(1).as_obj().expect("Method with no class on stack");
                match self.heap.get_mut(class) {
                    HeapData::Class(c) => {
                        c.methods.insert(
                            name,
                            Attr {
                                value: method,
                                is_public,
                                is_static,
                                is_constant: false,
                            },
                        );
                    }
                    _ => unreachable!("Method with non-class on stack"),
                }
            }
            1 => {
                let method = self.peek(0).as_obj().expect("builder must be a closure");
                let class = self.peek(1).as_obj().expect("Method with no class on stack");
                match self.heap.get_mut(class) {
                    HeapData::Class(c) => c.constructor = Some(method),
                    _ => unreachable!("Method with non-class on stack"),
                }
            }
            2 => {
                let index = self.fetch_byte();
                let Some(which) = DefaultMethod::from_index(index) else {
                    return Err(runtime_error!(Type, "Unknown default method '{index}'."));
                };
                let method = self.peek(0);
                let method_id = method.as_obj().expect("default method must be a closure");
                // Default methods also appear in the method table under
                // their well-known name.
                let name = self.heap.intern(which.name());
                let class = self.peek(1).as_obj().expect("Method with no class on stack");
                match self.heap.get_mut(class) {
                    HeapData::Class(c) => {
                        c.defaults[which as usize] = Some(method_id);
                        c.methods.insert(name, Attr::public(method));
                    }
                    _ => unreachable!("Method with non-class on stack"),
                }
            }
            other => panic!("corrupt bytecode: method kind {other}"),
        }
        self.pop();
        Ok(())
    }

    /// `Attribute`: declares a field on the class under the initial value.
    pub(crate) fn define_attribute(&mut self) {
        let name = self.read_name();
        let is_constant = self.fetch_byte() != 0;
        let is_public = self.fetch_byte() != 0;
        let is_static = self.fetch_byte() != 0;
        let value = self.peek(0);
        let class = self.peek(1).as_obj().expect("Attribute with no class on stack");
        let attr = Attr {
            value,
            is_public,
            is_static,
            is_constant,
        };
        match self.heap.get_mut(class) {
            HeapData::Class(c) => {
                if is_static {
                    c.statics.insert(name, attr);
                } else {
                    c.fields.insert(name, attr);
                }
            }
            _ => unreachable!("Attribute with non-class on stack"),
        }
        self.pop();
    }

    // ---- imports ----------------------------------------------------------

    /// `Import`: materializes a registered library on first use and returns
    /// its namespace. Re-import is idempotent.
    pub(crate) fn import_library(&mut self, name: HeapId) -> RunResult<Value> {
        let Some(&lib_id) = self.libraries.get(&name) else {
            let text = self.heap.string(name).to_owned();
            return Err(runtime_error!(UndefinedName, "Undefined library '{text}'."));
        };
        let (imported, existing, init) = match self.heap.get(lib_id) {
            HeapData::Library(lib) => (lib.imported, lib.namespace, lib.init),
            _ => unreachable!("library registry holds non-library"),
        };
        if imported {
            return Ok(Value::Obj(existing.expect("imported library lost its namespace")));
        }

        let namespace = self.alloc(HeapData::Namespace(Namespace::new(name)));
        match self.heap.get_mut(lib_id) {
            HeapData::Library(lib) => {
                lib.imported = true;
                lib.namespace = Some(namespace);
            }
            _ => unreachable!(),
        }
        init(self, name)?;
        self.globals.insert(name, Value::Obj(namespace));
        Ok(Value::Obj(namespace))
    }

    /// `ImportFile`: loads and runs a compiled file, caching its namespace
    /// by the exact file name. The file runs with fresh globals and its own
    /// namespace current; the parent scope is shelved (and stays a GC root)
    /// until the child completes.
    pub(crate) fn import_file(&mut self, name: HeapId) -> RunResult<Value> {
        if let Some(&cached) = self.imported_files.get(&name) {
            return Ok(Value::Obj(cached));
        }

        let path = match self.heap.get(name) {
            HeapData::Str(s) => s.as_str().to_owned(),
            _ => return Err(runtime_error!(Type, "Import file name must be a string.")),
        };
        let bytes =
            std::fs::read(&path).map_err(|e| runtime_error!(Native, "Could not open file \"{path}\": {e}."))?;
        let function =
            serial::load_function(&mut self.heap, &bytes).map_err(|e| runtime_error!(Native, "{e}"))?;
        self.push(Value::Obj(function));

        let namespace = self.alloc(HeapData::Namespace(Namespace::new(name)));
        // Registering before the run both roots the namespace and makes
        // cyclic imports terminate.
        self.imported_files.insert(name, namespace);

        let parent_scope = (std::mem::take(&mut self.globals), self.nspace);
        self.saved_scopes.push(parent_scope);
        self.nspace = Some(namespace);
        // The file sees what a fresh VM would: the core natives.
        crate::library::std_lib::define_core_globals(self);

        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop(); // the raw function
        self.push(Value::Obj(closure));

        let floor = self.frames.len();
        let outcome = self
            .call_closure(closure, 0, Value::Obj(namespace))
            .and_then(|()| self.run(floor).map(|_| ()));

        let (globals, nspace) = self.saved_scopes.pop().expect("unbalanced import scope");
        self.globals = globals;
        self.nspace = nspace;
        outcome?;

        Ok(Value::Obj(namespace))
    }
}
