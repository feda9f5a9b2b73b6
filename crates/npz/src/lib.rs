//! npz: a compiler and stack-based bytecode VM for the npz scripting
//! language.
//!
//! The pipeline is a single-pass Pratt compiler emitting into [`bytecode`]
//! chunks, a persistable bytecode container ([`Vm::dump_function`] /
//! [`Vm::load_function`]), and a register-free stack VM with closures,
//! classes with single inheritance, bound methods, lists, namespaces, and a
//! precise mark-sweep garbage collector.
//!
//! # Quick start
//!
//! ```
//! use npz::{CollectStringPrint, Vm};
//!
//! let mut writer = CollectStringPrint::new();
//! let mut vm = Vm::new(&mut writer);
//! vm.interpret("println(1 + 2 * 3);", None).unwrap();
//! drop(vm);
//! assert_eq!(writer.output(), "7\n");
//! ```

mod bytecode;
mod compiler;
pub mod error;
mod heap;
mod io;
mod library;
mod object;
mod scanner;
mod serial;
mod value;
mod vm;

pub use crate::{
    error::{CompileError, Diagnostic, Exception, LoadError, RunError, RunErrorKind, RunResult, StackFrame},
    heap::{Heap, HeapId},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::{Foreign, LibraryInit, NativeFn},
    value::Value,
    vm::{InterpretError, Vm, FRAMES_MAX, STACK_MAX},
};
