//! Bytecode representation for the npz VM.
//!
//! - `op` - opcode enum and byte decoding
//! - `chunk` - instruction buffer, constant pool, and line table

pub use chunk::{Chunk, JumpLabel, LineRun, MAX_CONSTANTS};
pub use op::Opcode;

mod chunk;
mod op;
