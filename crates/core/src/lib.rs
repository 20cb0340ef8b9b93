//! Lumen Core: Value representation, heap objects, the hash table, the
//! bytecode chunk, and the tri-color mark-sweep garbage collector.
//!
//! This crate is the foundation shared by `lumen-compiler` (which allocates
//! constants and `Function` objects while compiling) and `lumen-vm` (which
//! allocates everything else while running). Neither crate owns the heap
//! outright: callers thread a `&mut Heap` through every operation that can
//! allocate, and the objects that make up the heap graph reference each
//! other with non-owning, GC-managed handles (`ObjRef`), never `Rc`/`Arc`.
//!
//! # Modules
//!
//! - `error`: the `LumenError` type shared by the lexer, compiler, and VM.
//! - `value`: the tagged-union `Value` (nil, bool, number, object pointer).
//! - `nanbox`: the alternate NaN-boxed `Value` layout (feature `nanbox`).
//! - `object`: heap object kinds and their payloads.
//! - `table`: the open-addressed hash table used for globals, methods,
//!   fields, and the string intern set.
//! - `chunk`: bytecode buffer, constant pool, and run-length line table.
//! - `gc`: the `Heap` allocator and tri-color collector.

pub mod chunk;
pub mod error;
pub mod gc;
#[cfg(feature = "nanbox")]
pub mod nanbox;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use error::LumenError;
pub use gc::{GcRoots, GcStats, Heap};
pub use object::{
    Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind,
    ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;

/// Maximum number of slots on the VM's value stack.
///
/// Mirrors `original_source/clox`'s `STACK_MAX` (`UINT16_MAX`): large enough
/// that ordinary programs never approach it, small enough to catch runaway
/// recursion deterministically rather than exhausting process memory.
pub const STACK_MAX: usize = u16::MAX as usize;

/// Maximum depth of the call-frame stack.
pub const FRAMES_MAX: usize = 64;
