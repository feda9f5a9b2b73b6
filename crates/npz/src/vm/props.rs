//! Property access, binder-chain name resolution, and the value protocols
//! the VM consults (stringify, equality, hashing).
//!
//! Lookups that merely probe (an instance field before the class method
//! table, the binder chain before globals) return `Option`/discarded errors;
//! nothing is printed until an error escapes the interpreter.

use super::Vm;
use crate::{
    error::{RunError, RunResult},
    heap::{HeapData, HeapId},
    object::{fnv1a, Attr, BoundMethod, DefaultMethod, Function},
    runtime_error,
    value::{format_number, Value},
};

/// Outcome of one binder-chain step, extracted before any mutation.
enum Step {
    Found(Value),
    BindMethod(HeapId),
    Next(Value),
    Stop,
}

/// What a property read resolved to, extracted before any mutation.
enum PropRead {
    Value(Value),
    Bind(HeapId),
    FromNamespace(Value),
    Private,
    Undefined,
    NamespaceMiss(HeapId),
    NotSupported,
}

impl Vm<'_> {
    /// Whether the running frame may see private members of `target`.
    ///
    /// Internal access covers the object the frame is bound to, any
    /// instance of the same class, and the class itself.
    fn access_is_internal(&self, target: HeapId, target_class: HeapId) -> bool {
        let Value::Obj(bound) = self.frame_bound() else {
            return false;
        };
        if bound == target {
            return true;
        }
        match self.heap.get(bound) {
            HeapData::Instance(instance) => instance.class == target_class,
            HeapData::Class(_) => bound == target_class,
            _ => false,
        }
    }

    /// Resolves `name` through the lexical binder chain:
    /// instance fields -> class statics/methods -> class's namespace ->
    /// (caller falls back to globals). Methods found this way come back
    /// bound to the container they were found on.
    pub(crate) fn resolve_bound_name(&mut self, bound: Value, name: HeapId) -> RunResult<Option<Value>> {
        let mut cursor = bound;
        loop {
            let Value::Obj(id) = cursor else {
                return Ok(None);
            };
            let step = match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if let Some(attr) = instance.fields.get(&name) {
                        Step::Found(attr.value)
                    } else if let Some(method) = self.class_method(instance.class, name) {
                        Step::BindMethod(method)
                    } else {
                        Step::Next(Value::Obj(instance.class))
                    }
                }
                HeapData::Class(class) => {
                    if let Some(attr) = class.statics.get(&name) {
                        Step::Found(attr.value)
                    } else if let Some(method) = self.class_method(id, name) {
                        Step::BindMethod(method)
                    } else {
                        Step::Next(class.bound)
                    }
                }
                // The frame runs inside this namespace: internal reads.
                HeapData::Namespace(namespace) => match namespace.get(name, true) {
                    Some(value) => Step::Found(value),
                    None => Step::Stop,
                },
                _ => Step::Stop,
            };
            match step {
                Step::Found(value) => return Ok(Some(value)),
                Step::BindMethod(method) => return self.bind(cursor, method).map(Some),
                Step::Next(next) => cursor = next,
                Step::Stop => return Ok(None),
            }
        }
    }

    /// Unchecked method-table lookup (no visibility filtering).
    fn class_method(&self, class: HeapId, name: HeapId) -> Option<HeapId> {
        match self.heap.get(class) {
            HeapData::Class(c) => c.methods.get(&name).and_then(|attr| attr.value.as_obj()),
            _ => None,
        }
    }

    /// Method lookup honoring visibility; returns the closure.
    fn lookup_method_attr(&self, class: HeapId, name: HeapId, internal: bool) -> Option<HeapId> {
        match self.heap.get(class) {
            HeapData::Class(c) => {
                let attr = c.methods.get(&name)?;
                if attr.is_public || internal {
                    attr.value.as_obj()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Wraps `method` and its receiver into a bound method value.
    fn bind(&mut self, receiver: Value, method: HeapId) -> RunResult<Value> {
        let bound = self.alloc(HeapData::Bound(BoundMethod { receiver, method }));
        Ok(Value::Obj(bound))
    }

    fn undefined_property(&self, name: HeapId) -> RunError {
        let text = self.heap.string(name).to_owned();
        runtime_error!(UndefinedName, "Undefined property '{text}'.")
    }

    fn private_property(&self, name: HeapId) -> RunError {
        let text = self.heap.string(name).to_owned();
        runtime_error!(Type, "Property '{text}' is private.")
    }

    fn namespace_miss(&self, namespace: HeapId, name: HeapId) -> RunError {
        let ns_name = match self.heap.get(namespace) {
            HeapData::Namespace(n) => self.heap.string(n.name).to_owned(),
            _ => String::from("?"),
        };
        let text = self.heap.string(name).to_owned();
        runtime_error!(UndefinedName, "'{text}' is not defined in namespace '{ns_name}'.")
    }

    /// `GetProperty`: reads `name` off instances, classes, and namespaces.
    pub(crate) fn get_property(&mut self, object: Value, name: HeapId) -> RunResult<Value> {
        let Value::Obj(id) = object else {
            return Err(runtime_error!(Type, "Cannot access property of this value."));
        };
        let read = match self.heap.get(id) {
            HeapData::Instance(instance) => {
                let internal = self.access_is_internal(id, instance.class);
                if let Some(attr) = instance.fields.get(&name) {
                    if attr.is_public || internal {
                        PropRead::Value(attr.value)
                    } else {
                        PropRead::Private
                    }
                } else if let Some(method) = self.lookup_method_attr(instance.class, name, internal) {
                    PropRead::Bind(method)
                } else {
                    PropRead::Undefined
                }
            }
            HeapData::Class(class) => {
                let internal = self.access_is_internal(id, id);
                if let Some(attr) = class.statics.get(&name) {
                    if attr.is_public || internal {
                        PropRead::Value(attr.value)
                    } else {
                        PropRead::Private
                    }
                } else if let Some(method) = self.lookup_method_attr(id, name, internal) {
                    PropRead::Bind(method)
                } else {
                    PropRead::Undefined
                }
            }
            HeapData::Namespace(namespace) => {
                let internal = self.frame_bound().same(object);
                match namespace.get(name, internal) {
                    Some(value) => PropRead::FromNamespace(value),
                    None => PropRead::NamespaceMiss(id),
                }
            }
            _ => PropRead::NotSupported,
        };

        match read {
            PropRead::Value(value) => Ok(value),
            PropRead::Bind(method) => self.bind(object, method),
            PropRead::FromNamespace(value) => self.adopt_from_namespace(id, value),
            PropRead::Private => Err(self.private_property(name)),
            PropRead::Undefined => Err(self.undefined_property(name)),
            PropRead::NamespaceMiss(ns) => Err(self.namespace_miss(ns, name)),
            PropRead::NotSupported => Err(runtime_error!(Type, "Cannot access property of this value.")),
        }
    }

    /// Values read out of a namespace pick up the namespace as context:
    /// closures bind to it, a freshly read class adopts it as its binder.
    fn adopt_from_namespace(&mut self, namespace: HeapId, value: Value) -> RunResult<Value> {
        let Value::Obj(id) = value else {
            return Ok(value);
        };
        let is_closure = matches!(self.heap.get(id), HeapData::Closure(_));
        if is_closure {
            return self.bind(Value::Obj(namespace), id);
        }
        if let HeapData::Class(class) = self.heap.get_mut(id) {
            if matches!(class.bound, Value::Null) {
                class.bound = Value::Obj(namespace);
            }
        }
        Ok(value)
    }

    /// `SetProperty`: writes `name` on instances and classes, enforcing
    /// visibility and constness. Unknown names create a fresh public field.
    pub(crate) fn set_property(&mut self, object: Value, name: HeapId, value: Value) -> RunResult<()> {
        let Value::Obj(id) = object else {
            return Err(runtime_error!(Type, "Cannot set property of this value."));
        };
        // (existing attribute flags, is-instance) — extracted before mutating.
        let (existing, is_instance) = match self.heap.get(id) {
            HeapData::Instance(instance) => {
                let internal = self.access_is_internal(id, instance.class);
                (instance.fields.get(&name).map(|a| (a.is_constant, a.is_public || internal)), true)
            }
            HeapData::Class(_) => {
                let internal = self.access_is_internal(id, id);
                match self.heap.get(id) {
                    HeapData::Class(class) => {
                        (class.statics.get(&name).map(|a| (a.is_constant, a.is_public || internal)), false)
                    }
                    _ => unreachable!(),
                }
            }
            _ => return Err(runtime_error!(Type, "Cannot set property of this value.")),
        };

        if let Some((is_constant, visible)) = existing {
            if is_constant {
                let text = self.heap.string(name).to_owned();
                return Err(runtime_error!(Type, "Attribute '{text}' is constant and cannot be modified."));
            }
            if !visible {
                return Err(self.private_property(name));
            }
        }

        match self.heap.get_mut(id) {
            HeapData::Instance(instance) => {
                instance
                    .fields
                    .entry(name)
                    .and_modify(|attr| attr.value = value)
                    .or_insert_with(|| Attr::public(value));
            }
            HeapData::Class(class) if !is_instance => {
                class
                    .statics
                    .entry(name)
                    .and_modify(|attr| attr.value = value)
                    .or_insert_with(|| Attr::public(value));
            }
            _ => unreachable!("set_property target changed shape"),
        }
        Ok(())
    }

    /// `Invoke`: fused property read + call.
    pub(crate) fn invoke(&mut self, name: HeapId, argc: usize) -> RunResult<()> {
        let receiver = self.peek(argc);
        let Value::Obj(id) = receiver else {
            return Err(runtime_error!(Type, "Methods may only be invoked from instances."));
        };

        enum Plan {
            CallValue(Value),
            CallMethod(HeapId),
            CallBound(HeapId),
            Private,
            Undefined,
            NamespaceMiss(HeapId),
            NotSupported,
        }

        let plan = match self.heap.get(id) {
            HeapData::Instance(instance) => {
                let internal = self.access_is_internal(id, instance.class);
                if let Some(attr) = instance.fields.get(&name) {
                    if attr.is_public || internal {
                        // A field holding a callable shadows methods.
                        Plan::CallValue(attr.value)
                    } else {
                        Plan::Private
                    }
                } else if let Some(method) = self.lookup_method_attr(instance.class, name, internal) {
                    Plan::CallMethod(method)
                } else {
                    Plan::Undefined
                }
            }
            HeapData::Class(class) => {
                let internal = self.access_is_internal(id, id);
                if let Some(attr) = class.statics.get(&name) {
                    if attr.is_public || internal {
                        Plan::CallValue(attr.value)
                    } else {
                        Plan::Private
                    }
                } else if let Some(method) = self.lookup_method_attr(id, name, internal) {
                    Plan::CallMethod(method)
                } else {
                    Plan::Undefined
                }
            }
            HeapData::Namespace(namespace) => {
                let internal = self.frame_bound().same(receiver);
                match namespace.get(name, internal) {
                    Some(value) => {
                        let is_closure = value
                            .as_obj()
                            .is_some_and(|v| matches!(self.heap.get(v), HeapData::Closure(_)));
                        if is_closure {
                            Plan::CallBound(value.as_obj().expect("closure value"))
                        } else {
                            Plan::CallValue(value)
                        }
                    }
                    None => Plan::NamespaceMiss(id),
                }
            }
            _ => Plan::NotSupported,
        };

        match plan {
            Plan::CallValue(value) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                self.call_value(value, argc)
            }
            Plan::CallMethod(method) => self.call_closure(method, argc, receiver),
            Plan::CallBound(closure) => self.call_closure(closure, argc, receiver),
            Plan::Private => Err(self.private_property(name)),
            Plan::Undefined => Err(self.undefined_property(name)),
            Plan::NamespaceMiss(ns) => Err(self.namespace_miss(ns, name)),
            Plan::NotSupported => Err(runtime_error!(Type, "Methods may only be invoked from instances.")),
        }
    }

    /// Calls a method found on `class` with the receiver already in place.
    pub(crate) fn invoke_from_class(
        &mut self,
        class: HeapId,
        name: HeapId,
        argc: usize,
        receiver: Value,
    ) -> RunResult<()> {
        // Super dispatch runs inside the class context.
        let Some(method) = self.lookup_method_attr(class, name, true) else {
            return Err(self.undefined_property(name));
        };
        self.call_closure(method, argc, receiver)
    }

    /// `GetSuper`: binds a superclass method to `this` (never to the
    /// superclass itself).
    pub(crate) fn bind_super_method(&mut self, superclass: Value, receiver: Value, name: HeapId) -> RunResult<Value> {
        let Some(class) = superclass.as_obj() else {
            return Err(runtime_error!(Type, "Cannot read super method on non-class."));
        };
        let Some(method) = self.lookup_method_attr(class, name, true) else {
            return Err(self.undefined_property(name));
        };
        self.bind(receiver, method)
    }

    // ---- value protocols -------------------------------------------------

    /// Deep equality: variant-first, identity for heap objects, with a
    /// user-defined `def eq` consulted for instances.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if a.same(b) {
            return Ok(true);
        }
        if let Value::Obj(id) = a {
            if matches!(self.heap.get(id), HeapData::Instance(_)) {
                if let Some(result) = self.call_default(id, DefaultMethod::Eq, &[b])? {
                    return Ok(!result.is_falsey());
                }
            }
        }
        Ok(false)
    }

    /// Stringifies a value the way `print` and `asString` render it.
    pub(crate) fn str_value(&mut self, value: Value) -> RunResult<String> {
        match value {
            Value::Bool(true) => Ok("true".to_owned()),
            Value::Bool(false) => Ok("false".to_owned()),
            Value::Null => Ok("null".to_owned()),
            Value::Number(n) => Ok(format_number(n)),
            Value::Obj(id) => self.str_object(id),
        }
    }

    fn str_object(&mut self, id: HeapId) -> RunResult<String> {
        // Instances may dispatch to `def string`, which runs script code.
        if matches!(self.heap.get(id), HeapData::Instance(_)) {
            if let Some(result) = self.call_default(id, DefaultMethod::String, &[])? {
                let text = result.as_obj().ok_or_else(|| runtime_error!(Type, "'def string' must return a string."))?;
                return match self.heap.get(text) {
                    HeapData::Str(s) => Ok(s.as_str().to_owned()),
                    _ => Err(runtime_error!(Type, "'def string' must return a string.")),
                };
            }
            return Ok(self.instance_label(id));
        }

        Ok(match self.heap.get(id) {
            HeapData::Str(s) => s.as_str().to_owned(),
            HeapData::Function(f) => self.function_label(f),
            HeapData::Closure(c) => self.function_label(self.heap.function(c.function)),
            HeapData::Bound(b) => {
                let function = self.heap.closure(b.method).function;
                self.function_label(self.heap.function(function))
            }
            HeapData::Upvalue(_) => "upvalue".to_owned(),
            HeapData::Class(c) => format!("<class {}>", self.heap.string(c.name)),
            HeapData::Instance(_) => unreachable!("handled above"),
            HeapData::List(l) => format!("[ {:#x} ({}|{}) ]", id.index(), l.items.len(), l.items.capacity()),
            HeapData::Namespace(n) => format!("<namespace '{}'>", self.heap.string(n.name)),
            HeapData::Library(l) => format!("<library '{}'>", self.heap.string(l.name)),
            HeapData::Native(_) => "<native fn>".to_owned(),
            HeapData::Foreign(f) => f.stringify(),
        })
    }

    fn function_label(&self, function: &Function) -> String {
        match function.name {
            Some(name) => format!("<func {}>", self.heap.string(name)),
            None => "<script>".to_owned(),
        }
    }

    /// The `<ADDR CLASSNAME>` fallback rendering for instances.
    fn instance_label(&self, id: HeapId) -> String {
        let class = match self.heap.get(id) {
            HeapData::Instance(i) => i.class,
            _ => unreachable!("instance_label on non-instance"),
        };
        let name = match self.heap.get(class) {
            HeapData::Class(c) => self.heap.string(c.name),
            _ => "?",
        };
        format!("<{:#x} {name}>", id.index())
    }

    /// Hashes a value for map keys. Instances defer to `def hash`, which
    /// must return a number; without one, the hash of the fallback string
    /// representation is used.
    pub(crate) fn value_hash(&mut self, value: Value) -> RunResult<u64> {
        let id = match value {
            Value::Null => return Ok(0),
            Value::Bool(b) => return Ok(1 + u64::from(b)),
            Value::Number(n) => {
                // Normalize -0.0 so equal numbers hash equally.
                let n = if n == 0.0 { 0.0 } else { n };
                return Ok(fnv1a(&n.to_le_bytes()));
            }
            Value::Obj(id) => id,
        };

        if matches!(self.heap.get(id), HeapData::Instance(_)) {
            if let Some(result) = self.call_default(id, DefaultMethod::Hash, &[])? {
                let Value::Number(n) = result else {
                    return Err(runtime_error!(Type, "'def hash' must return a number."));
                };
                return Ok(n as i64 as u64);
            }
            return Ok(fnv1a(self.instance_label(id).as_bytes()));
        }

        Ok(match self.heap.get(id) {
            HeapData::Str(s) => s.hash(),
            HeapData::Foreign(f) => f.hash_code(),
            _ => fnv1a(&(id.index() as u64).to_le_bytes()),
        })
    }
}
