//! Native library surface: registration API and the built-in libraries.
//!
//! A library registers under a name with an initializer; on first `import`
//! the VM materializes a namespace, flags the library imported, runs the
//! initializer, and publishes the namespace as a global. Re-import is
//! idempotent.

pub(crate) mod file_lib;
pub(crate) mod manager;
pub(crate) mod map_lib;
pub(crate) mod math_lib;
pub(crate) mod std_lib;
pub(crate) mod vec_lib;

use crate::{
    error::RunResult,
    heap::{HeapData, HeapId},
    object::{Library, LibraryInit, Native, NativeFn},
    runtime_error,
    value::Value,
    vm::Vm,
};

/// Checks an exact native-call arity.
pub(crate) fn expect_args(argc: usize, expected: usize) -> RunResult<()> {
    if argc != expected {
        return Err(runtime_error!(Native, "Expected {expected} args, got {argc}."));
    }
    Ok(())
}

/// Checks arity and that every argument is a number, returning them.
pub(crate) fn expect_number_args(args: &[Value], expected: usize) -> RunResult<Vec<f64>> {
    expect_args(args.len(), expected)?;
    let mut numbers = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let Value::Number(n) = arg else {
            return Err(runtime_error!(Native, "Expected number for argument {i}."));
        };
        numbers.push(*n);
    }
    Ok(numbers)
}

impl Vm<'_> {
    /// Registers a library under `name`; the initializer runs on first
    /// import.
    ///
    /// # Panics
    /// Panics if the name is already registered (host-side setup bug).
    pub fn define_library(&mut self, name: &str, init: LibraryInit) {
        let name_id = self.heap.intern(name);
        let library = self.heap.alloc(HeapData::Library(Library {
            name: name_id,
            init,
            namespace: None,
            imported: false,
        }));
        let previous = self.libraries.insert(name_id, library);
        assert!(previous.is_none(), "library '{name}' is already defined");
    }

    /// Defines a native function in an imported library's namespace.
    pub fn define_function(&mut self, lib: HeapId, name: &'static str, func: NativeFn) -> RunResult<()> {
        let native = self.heap.alloc(HeapData::Native(Native { name, func }));
        self.define_constant(lib, name, Value::Obj(native))
    }

    /// Defines a public constant in an imported library's namespace.
    pub fn define_constant(&mut self, lib: HeapId, name: &str, value: Value) -> RunResult<()> {
        let namespace = {
            let Some(&lib_id) = self.libraries.get(&lib) else {
                let text = self.heap.string(lib).to_owned();
                return Err(runtime_error!(UndefinedName, "Undefined library '{text}'."));
            };
            match self.heap.get(lib_id) {
                HeapData::Library(library) if library.imported => {
                    library.namespace.expect("imported library lost its namespace")
                }
                _ => {
                    let text = self.heap.string(lib).to_owned();
                    return Err(runtime_error!(UndefinedName, "Undefined library '{text}'."));
                }
            }
        };
        // The value is rooted by its caller (native object just allocated is
        // reachable once written below; interning cannot collect).
        let name_id = self.heap.intern(name);
        let fresh = match self.heap.get_mut(namespace) {
            HeapData::Namespace(ns) => ns.write(name_id, value, true),
            _ => unreachable!("library namespace is not a namespace"),
        };
        if fresh {
            Ok(())
        } else {
            let lib_text = self.heap.string(lib).to_owned();
            Err(runtime_error!(Native, "Redefinition of '{lib_text}.{name}'."))
        }
    }

    /// Defines a native function directly in the globals (the core natives
    /// available without any import).
    pub(crate) fn define_native(&mut self, name: &'static str, func: NativeFn) {
        let name_id = self.heap.intern(name);
        let native = self.heap.alloc(HeapData::Native(Native { name, func }));
        self.globals.insert(name_id, Value::Obj(native));
    }
}
