//! The canonical bytecode container: dumper and loader.
//!
//! A file is a single `FUNC` record; every multi-byte quantity is
//! little-endian. The loader is a streaming cursor over the byte buffer and
//! treats any deviation from the grammar as fatal. Strings pass through the
//! intern table on reconstitution, so a loaded chunk enjoys the same
//! pointer-equality guarantees as a freshly compiled one.

use std::rc::Rc;

use crate::{
    bytecode::{Chunk, LineRun},
    error::LoadError,
    heap::{Heap, HeapData, HeapId},
    object::{Function, Namespace},
    value::Value,
};

const TAG_NULL: u8 = 0x00;
const TAG_NUMBER: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_FUNC: u8 = 0x04;
const TAG_CHUNK: u8 = 0x05;
const TAG_NAMESPACE: u8 = 0x06;

// ---- dumper --------------------------------------------------------------

/// Serializes a compiled function and its transitive constants.
#[must_use]
pub fn dump_function(heap: &Heap, function: HeapId) -> Vec<u8> {
    let mut out = Vec::new();
    write_function(heap, function, &mut out);
    out
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_function(heap: &Heap, id: HeapId, out: &mut Vec<u8>) {
    let function = heap.function(id);
    out.push(TAG_FUNC);
    out.push(function.arity);
    match function.name {
        Some(name) => write_string(heap, name, out),
        None => out.push(TAG_NULL),
    }
    out.push(function.upvalue_count);
    write_chunk(heap, &function.chunk, out);
}

fn write_chunk(heap: &Heap, chunk: &Chunk, out: &mut Vec<u8>) {
    out.push(TAG_CHUNK);

    write_i32(out, chunk.lines().len() as i32);
    for entry in chunk.lines() {
        write_i32(out, entry.line as i32);
        write_i32(out, entry.run as i32);
    }

    write_i32(out, chunk.constants().len() as i32);
    for &constant in chunk.constants() {
        write_value(heap, constant, out);
    }

    write_i32(out, chunk.code().len() as i32);
    out.extend_from_slice(chunk.code());
}

fn write_string(heap: &Heap, id: HeapId, out: &mut Vec<u8>) {
    let text = heap.string(id);
    out.push(TAG_STRING);
    write_i32(out, text.len() as i32);
    out.extend_from_slice(text.as_bytes());
}

fn write_value(heap: &Heap, value: Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(b));
        }
        Value::Obj(id) => match heap.get(id) {
            HeapData::Str(_) => write_string(heap, id, out),
            HeapData::Function(_) => write_function(heap, id, out),
            HeapData::Namespace(_) => write_namespace(heap, id, out),
            other => unreachable!("constant pool holds unserializable {}", other.type_name()),
        },
    }
}

fn write_namespace(heap: &Heap, id: HeapId, out: &mut Vec<u8>) {
    let HeapData::Namespace(ns) = heap.get(id) else {
        unreachable!("write_namespace on non-namespace");
    };
    out.push(TAG_NAMESPACE);
    write_string(heap, ns.name, out);
    write_i32(out, ns.values.len() as i32);
    for (&key, &value) in &ns.values {
        write_string(heap, key, out);
        write_value(heap, value, out);
        out.push(u8::from(ns.publics.contains(&key)));
    }
}

// ---- loader --------------------------------------------------------------

/// Reads a serialized top-level function back into the heap.
///
/// Collection is paused for the duration: the loader allocates whole object
/// graphs before any of them are reachable from a root.
pub fn load_function(heap: &mut Heap, bytes: &[u8]) -> Result<HeapId, LoadError> {
    heap.pause_gc();
    let mut reader = Reader { bytes, pos: 0 };
    let result = read_function(heap, &mut reader);
    heap.resume_gc();
    result
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        let byte = *self.bytes.get(self.pos).ok_or(LoadError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek_u8(&self) -> Result<u8, LoadError> {
        self.bytes.get(self.pos).copied().ok_or(LoadError::UnexpectedEof)
    }

    fn expect(&mut self, tag: u8, what: &'static str) -> Result<(), LoadError> {
        let found = self.read_u8()?;
        if found != tag {
            return Err(LoadError::UnexpectedTag { expected: what, found });
        }
        Ok(())
    }

    fn read_i32(&mut self) -> Result<i32, LoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(LoadError::UnexpectedEof)?;
        self.pos += 4;
        Ok(i32::from_le_bytes(slice.try_into().expect("4-byte slice")))
    }

    fn read_f64(&mut self) -> Result<f64, LoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + 8)
            .ok_or(LoadError::UnexpectedEof)?;
        self.pos += 8;
        Ok(f64::from_le_bytes(slice.try_into().expect("8-byte slice")))
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8], LoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or(LoadError::UnexpectedEof)?;
        self.pos += len;
        Ok(slice)
    }

    /// Reads a count field, rejecting negatives and counts that could not
    /// possibly fit in the remaining bytes (each element needs at least
    /// `min_element_size` bytes).
    fn read_count(&mut self, what: &'static str, min_element_size: usize) -> Result<usize, LoadError> {
        let raw = self.read_i32()?;
        if raw < 0 {
            return Err(LoadError::BadCount {
                what,
                count: i64::from(raw),
            });
        }
        let count = raw as usize;
        if count.saturating_mul(min_element_size) > self.remaining() {
            return Err(LoadError::BadCount {
                what,
                count: i64::from(raw),
            });
        }
        Ok(count)
    }
}

fn read_function(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<HeapId, LoadError> {
    reader.expect(TAG_FUNC, "function")?;
    let arity = reader.read_u8()?;

    let name = if reader.peek_u8()? == TAG_NULL {
        reader.read_u8()?;
        None
    } else {
        Some(read_string(heap, reader)?)
    };

    let upvalue_count = reader.read_u8()?;
    let chunk = read_chunk(heap, reader)?;

    Ok(heap.alloc(HeapData::Function(Function {
        arity,
        upvalue_count,
        name,
        chunk: Rc::new(chunk),
    })))
}

fn read_chunk(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<Chunk, LoadError> {
    reader.expect(TAG_CHUNK, "chunk")?;

    let lines_count = reader.read_count("line table", 8)?;
    let mut lines = Vec::with_capacity(lines_count);
    for _ in 0..lines_count {
        let line = reader.read_i32()?;
        let run = reader.read_i32()?;
        if line < 0 || run < 0 {
            return Err(LoadError::BadCount {
                what: "line entry",
                count: i64::from(line.min(run)),
            });
        }
        lines.push(LineRun {
            line: line as u32,
            run: run as u32,
        });
    }

    let const_count = reader.read_count("constant pool", 1)?;
    let mut constants = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        constants.push(read_value(heap, reader)?);
    }

    let code_count = reader.read_count("code", 1)?;
    let code = reader.read_slice(code_count)?.to_vec();

    Ok(Chunk::from_parts(code, constants, lines))
}

fn read_value(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<Value, LoadError> {
    match reader.peek_u8()? {
        TAG_NULL => {
            reader.read_u8()?;
            Ok(Value::Null)
        }
        TAG_NUMBER => {
            reader.read_u8()?;
            Ok(Value::Number(reader.read_f64()?))
        }
        TAG_BOOL => {
            reader.read_u8()?;
            Ok(Value::Bool(reader.read_u8()? != 0))
        }
        TAG_STRING => Ok(Value::Obj(read_string(heap, reader)?)),
        TAG_FUNC => Ok(Value::Obj(read_function(heap, reader)?)),
        TAG_NAMESPACE => Ok(Value::Obj(read_namespace(heap, reader)?)),
        found => Err(LoadError::UnexpectedTag {
            expected: "value",
            found,
        }),
    }
}

fn read_string(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<HeapId, LoadError> {
    reader.expect(TAG_STRING, "string")?;
    let len = reader.read_count("string", 1)?;
    let bytes = reader.read_slice(len)?;
    let text = std::str::from_utf8(bytes).map_err(|_| LoadError::BadString)?;
    Ok(heap.intern(text))
}

fn read_namespace(heap: &mut Heap, reader: &mut Reader<'_>) -> Result<HeapId, LoadError> {
    reader.expect(TAG_NAMESPACE, "namespace")?;
    let name = read_string(heap, reader)?;
    let entry_count = reader.read_count("namespace", 2)?;

    let mut namespace = Namespace::new(name);
    for _ in 0..entry_count {
        let key = read_string(heap, reader)?;
        let value = read_value(heap, reader)?;
        let public = reader.read_u8()? != 0;
        namespace.write(key, value, public);
    }
    Ok(heap.alloc(HeapData::Namespace(namespace)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    fn sample_function(heap: &mut Heap) -> HeapId {
        let mut chunk = Chunk::new();
        let hello = heap.intern("hello");
        assert!(chunk.emit_constant(Value::Number(1.5), 1));
        assert!(chunk.emit_constant(Value::Obj(hello), 1));
        assert!(chunk.emit_constant(Value::Bool(true), 2));
        assert!(chunk.emit_constant(Value::Null, 2));
        chunk.emit(Opcode::Add, 2);
        chunk.emit(Opcode::Return, 3);

        let name = heap.intern("sample");
        heap.alloc(HeapData::Function(Function {
            arity: 2,
            upvalue_count: 1,
            name: Some(name),
            chunk: Rc::new(chunk),
        }))
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let mut heap = Heap::new();
        let function = sample_function(&mut heap);
        let dumped = dump_function(&heap, function);

        let loaded = load_function(&mut heap, &dumped).expect("load failed");
        let redumped = dump_function(&heap, loaded);
        assert_eq!(dumped, redumped);

        let original = heap.function(function);
        let restored = heap.function(loaded);
        assert_eq!(original.arity, restored.arity);
        assert_eq!(original.upvalue_count, restored.upvalue_count);
        assert_eq!(original.chunk.code(), restored.chunk.code());
        assert_eq!(original.chunk.lines(), restored.chunk.lines());
        // Interning makes the name strings pointer-identical.
        assert_eq!(original.name, restored.name);
    }

    #[test]
    fn nested_functions_round_trip() {
        let mut heap = Heap::new();
        let inner = sample_function(&mut heap);
        let mut chunk = Chunk::new();
        assert!(chunk.emit_constant(Value::Obj(inner), 1));
        chunk.emit(Opcode::Return, 1);
        let outer = heap.alloc(HeapData::Function(Function {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Rc::new(chunk),
        }));

        let dumped = dump_function(&heap, outer);
        let loaded = load_function(&mut heap, &dumped).expect("load failed");
        assert_eq!(dumped, dump_function(&heap, loaded));
    }

    #[test]
    fn namespace_constants_round_trip() {
        let mut heap = Heap::new();
        let ns_name = heap.intern("lib");
        let key = heap.intern("answer");
        let hidden = heap.intern("secret");
        let mut ns = Namespace::new(ns_name);
        ns.write(key, Value::Number(42.0), true);
        ns.write(hidden, Value::Bool(false), false);
        let ns = heap.alloc(HeapData::Namespace(ns));

        let mut chunk = Chunk::new();
        assert!(chunk.emit_constant(Value::Obj(ns), 1));
        chunk.emit(Opcode::Return, 1);
        let function = heap.alloc(HeapData::Function(Function {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Rc::new(chunk),
        }));

        let dumped = dump_function(&heap, function);
        let loaded = load_function(&mut heap, &dumped).expect("load failed");
        assert_eq!(dumped, dump_function(&heap, loaded));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut heap = Heap::new();
        let function = sample_function(&mut heap);
        let dumped = dump_function(&heap, function);
        for cut in [1, dumped.len() / 2, dumped.len() - 1] {
            let err = load_function(&mut heap, &dumped[..cut]);
            assert!(err.is_err(), "truncation at {cut} must fail");
        }
    }

    #[test]
    fn wrong_leading_tag_is_rejected() {
        let mut heap = Heap::new();
        let err = load_function(&mut heap, &[TAG_CHUNK]).unwrap_err();
        assert!(matches!(err, LoadError::UnexpectedTag { .. }));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let mut heap = Heap::new();
        // FUNC, arity 0, NULL name, 0 upvalues, CHUNK, lines = -1
        let mut bytes = vec![TAG_FUNC, 0, TAG_NULL, 0, TAG_CHUNK];
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        let err = load_function(&mut heap, &bytes).unwrap_err();
        assert!(matches!(err, LoadError::BadCount { .. }));
    }
}
