use std::{any::Any, fmt, rc::Rc};

use indexmap::{IndexMap, IndexSet};

use crate::{bytecode::Chunk, error::RunResult, heap::HeapId, value::Value, vm::Vm};

/// FNV-1a over a byte slice; the canonical string hash for interning and
/// value hashing.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// An interned, immutable string with its precomputed FNV-1a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpString {
    text: String,
    hash: u64,
}

impl NpString {
    /// Wraps an owned string, computing its hash.
    #[must_use]
    pub fn new(text: String) -> Self {
        let hash = fnv1a(text.as_bytes());
        Self { text, hash }
    }

    /// The string content.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The precomputed content hash.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Content length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the string is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// A compiled function: immutable once the compiler finishes it.
///
/// The chunk sits behind an `Rc` so call frames can hold it without
/// re-borrowing the heap on every instruction fetch.
#[derive(Debug, Clone)]
pub struct Function {
    /// Number of declared parameters.
    pub arity: u8,
    /// Number of upvalues the closure instruction will capture.
    pub upvalue_count: u8,
    /// Function name string, `None` for top-level script code.
    pub name: Option<HeapId>,
    /// The compiled body.
    pub chunk: Rc<Chunk>,
}

/// A function plus its captured upvalues.
#[derive(Debug, Clone)]
pub struct Closure {
    /// The underlying function object.
    pub function: HeapId,
    /// Captured upvalues, `function.upvalue_count` of them.
    pub upvalues: Vec<HeapId>,
}

/// A captured variable.
///
/// Open while the owning frame is live (pointing at an absolute stack slot),
/// closed exactly once when that slot leaves scope. Never reopens.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    /// Absolute index into the VM value stack.
    Open(usize),
    /// The captured value, moved off the stack.
    Closed(Value),
}

/// Number of well-known default-method slots on a class.
pub const DEFAULT_METHOD_COUNT: usize = 3;

/// The well-known method slots the VM consults directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DefaultMethod {
    /// User-defined stringification, `def string`.
    String = 0,
    /// User-defined equality, `def eq`.
    Eq = 1,
    /// User-defined hashing, `def hash`.
    Hash = 2,
}

impl DefaultMethod {
    /// Parses the identifier used in a `def` declaration.
    #[must_use]
    pub fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "string" => Some(Self::String),
            "eq" => Some(Self::Eq),
            "hash" => Some(Self::Hash),
            _ => None,
        }
    }

    /// Decodes the slot index carried in a `Method` instruction.
    #[must_use]
    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(Self::String),
            1 => Some(Self::Eq),
            2 => Some(Self::Hash),
            _ => None,
        }
    }

    /// The method-table name of this slot.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Eq => "eq",
            Self::Hash => "hash",
        }
    }
}

/// A declared class member: a value plus its access flags.
///
/// Used for fields (instance template and per-instance copies), static
/// fields, and method-table entries alike.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub value: Value,
    pub is_public: bool,
    pub is_static: bool,
    pub is_constant: bool,
}

impl Attr {
    /// A public, non-static, mutable attribute.
    #[must_use]
    pub fn public(value: Value) -> Self {
        Self {
            value,
            is_public: true,
            is_static: false,
            is_constant: false,
        }
    }
}

/// A class under construction during its body, logically frozen afterwards.
#[derive(Debug, Clone)]
pub struct Class {
    /// Class name string.
    pub name: HeapId,
    /// The `build` constructor, if declared (or inherited).
    pub constructor: Option<HeapId>,
    /// Named methods (including static methods, flagged on the attribute).
    pub methods: IndexMap<HeapId, Attr>,
    /// Instance field template; copied into each new instance.
    pub fields: IndexMap<HeapId, Attr>,
    /// Static fields, living on the class itself.
    pub statics: IndexMap<HeapId, Attr>,
    /// Default-method slots (`string`, `eq`, `hash`).
    pub defaults: [Option<HeapId>; DEFAULT_METHOD_COUNT],
    /// Lexical binder: the namespace the class was read through, if any.
    pub bound: Value,
}

impl Class {
    /// A fresh class with the given name and empty tables.
    #[must_use]
    pub fn new(name: HeapId) -> Self {
        Self {
            name,
            constructor: None,
            methods: IndexMap::new(),
            fields: IndexMap::new(),
            statics: IndexMap::new(),
            defaults: [None; DEFAULT_METHOD_COUNT],
            bound: Value::Null,
        }
    }
}

/// An instance of a class with its own copy of the field template.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class: HeapId,
    /// Per-instance fields, seeded from the class template at construction.
    pub fields: IndexMap<HeapId, Attr>,
    /// Lexical binder inherited from the class.
    pub bound: Value,
}

/// A method read off an instance (or class), carrying its receiver.
#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    /// The bound closure.
    pub method: HeapId,
}

/// A growable list of values.
#[derive(Debug, Clone, Default)]
pub struct List {
    pub items: Vec<Value>,
}

/// A named table of values, a subset of which is public.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: HeapId,
    /// All entries, in definition order.
    pub values: IndexMap<HeapId, Value>,
    /// Keys of `values` that are visible to external readers.
    pub publics: IndexSet<HeapId>,
}

impl Namespace {
    /// A fresh empty namespace.
    #[must_use]
    pub fn new(name: HeapId) -> Self {
        Self {
            name,
            values: IndexMap::new(),
            publics: IndexSet::new(),
        }
    }

    /// Writes an entry; returns `true` when the key was new.
    pub fn write(&mut self, name: HeapId, value: Value, public: bool) -> bool {
        let new_key = self.values.insert(name, value).is_none();
        if public {
            self.publics.insert(name);
        }
        new_key
    }

    /// Reads an entry. External readers only see public entries.
    #[must_use]
    pub fn get(&self, name: HeapId, internal: bool) -> Option<Value> {
        if !internal && !self.publics.contains(&name) {
            return None;
        }
        self.values.get(&name).copied()
    }
}

/// Initializer callback that populates a library namespace on first import.
pub type LibraryInit = fn(&mut Vm<'_>, HeapId) -> RunResult<()>;

/// A registered native library; its namespace materializes lazily.
#[derive(Clone)]
pub struct Library {
    pub name: HeapId,
    pub init: LibraryInit,
    pub namespace: Option<HeapId>,
    pub imported: bool,
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("imported", &self.imported)
            .finish_non_exhaustive()
    }
}

/// Signature of a native function callback.
pub type NativeFn = fn(&mut Vm<'_>, &[Value]) -> RunResult<Value>;

/// A native function exposed to scripts.
#[derive(Clone, Copy)]
pub struct Native {
    /// Registration name, for diagnostics.
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Native({})", self.name)
    }
}

/// Capability interface for foreign objects owned by native libraries.
///
/// Replaces raw per-object callbacks: dropping the box is the free hook,
/// [`Foreign::trace`] is the GC blacken hook, [`Foreign::stringify`] covers
/// printing, and [`Foreign::hash_code`] feeds value hashing. Downcasting
/// goes through [`Foreign::as_any`].
pub trait Foreign: fmt::Debug {
    /// Short type name for error messages and printing.
    fn type_name(&self) -> &'static str;

    /// Reports every [`Value`] this object holds to the collector.
    fn trace(&self, _mark: &mut dyn FnMut(Value)) {}

    /// User-visible rendering of the object.
    fn stringify(&self) -> String {
        format!("<{}>", self.type_name())
    }

    /// Hash used when the object is a map key.
    fn hash_code(&self) -> u64 {
        fnv1a(self.type_name().as_bytes())
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn default_method_idents() {
        assert_eq!(DefaultMethod::from_ident("string"), Some(DefaultMethod::String));
        assert_eq!(DefaultMethod::from_ident("eq"), Some(DefaultMethod::Eq));
        assert_eq!(DefaultMethod::from_ident("hash"), Some(DefaultMethod::Hash));
        assert_eq!(DefaultMethod::from_ident("repr"), None);
        for idx in 0..3u8 {
            let m = DefaultMethod::from_index(idx).unwrap();
            assert_eq!(m as u8, idx);
        }
        assert_eq!(DefaultMethod::from_index(3), None);
    }

    #[test]
    fn namespace_public_visibility() {
        let name = HeapId::from_index(0);
        let key = HeapId::from_index(1);
        let hidden = HeapId::from_index(2);
        let mut ns = Namespace::new(name);
        assert!(ns.write(key, Value::Number(1.0), true));
        assert!(ns.write(hidden, Value::Number(2.0), false));
        assert_eq!(ns.get(key, false), Some(Value::Number(1.0)));
        assert_eq!(ns.get(hidden, false), None);
        assert_eq!(ns.get(hidden, true), Some(Value::Number(2.0)));
    }
}
