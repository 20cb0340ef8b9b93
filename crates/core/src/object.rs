//! Heap object kinds.
//!
//! Every object lives in the GC's allocation list (see [`crate::gc::Heap`])
//! and is referred to elsewhere only through [`ObjRef`], a thin, `Copy`,
//! non-owning handle. Nothing outside the heap owns an object outright,
//! that would let a reference outlive a collection that reaps it. Objects
//! reference each other the same way (a `Closure`'s captured upvalues, a
//! `Class`'s method table) so the heap graph can be cyclic without leaking:
//! the collector, not reference counting, decides what is alive.

use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::gc::Heap;
use crate::table::Table;
use crate::value::Value;

/// Non-owning handle to a heap object.
///
/// Two `ObjRef`s are equal iff they point at the same allocation, which is
/// what makes string interning correct ("equal strings share one object").
#[derive(Clone, Copy)]
pub struct ObjRef(pub(crate) NonNull<Obj>);

impl ObjRef {
    /// # Safety
    /// `ptr` must point at a live `Obj` owned by a `Heap`.
    pub(crate) unsafe fn from_non_null(ptr: NonNull<Obj>) -> Self {
        ObjRef(ptr)
    }

    /// A placeholder handle that must never be dereferenced. Exists only so
    /// `Heap::new` can give `init_string` an initial value before the first
    /// real allocation happens, a single statement later.
    pub(crate) fn dangling() -> Self {
        ObjRef(NonNull::dangling())
    }

    #[inline]
    pub fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    /// Lifetime is deliberately unbound from `&self`: `ObjRef` is `Copy`
    /// and the object it names is owned by the heap's allocation list, not
    /// by any particular `ObjRef` value, so the reference this returns is
    /// only ever invalid once the collector frees the object, and the
    /// collector never runs while that object is reachable from a root.
    #[inline]
    pub fn kind<'a>(&self) -> &'a ObjKind {
        unsafe { &self.0.as_ref().kind }
    }

    /// Lifetime unbound from `&mut self` for the same reason as [`Self::kind`].
    #[inline]
    pub fn kind_mut<'a>(&mut self) -> &'a mut ObjKind {
        unsafe { &mut self.0.as_mut().kind }
    }

    #[inline]
    pub fn as_string<'a>(&self) -> Option<&'a ObjString> {
        match self.kind() {
            ObjKind::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte slice for a string object; panics on a non-string kind. Used at
    /// call sites that already know (from the compiler or the opcode) that
    /// the value must be a string.
    pub fn as_str(&self) -> &str {
        match self.kind() {
            ObjKind::String(s) => s.as_str(),
            other => panic!("as_str: not a string object: {:?}", other.type_name()),
        }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.as_ptr())
    }
}

/// Header shared by every heap object: its payload, the GC mark bit, and
/// the intrusive next-pointer threading it onto the heap's allocation list.
pub struct Obj {
    pub kind: ObjKind,
    pub marked: bool,
    pub next: Option<ObjRef>,
}

/// The tagged union of heap object payloads.
///
/// Dispatch over this enum (never a trait object) so the GC and the
/// printer can enumerate variants exhaustively (adding a kind is a single
/// `match` arm away from being caught everywhere it matters).
pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Array(ObjArray),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Native(_) => "native function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Closure(_) => "closure",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
            ObjKind::Array(_) => "array",
        }
    }
}

/// Interned, immutable byte string with a cached FNV-1a hash.
pub struct ObjString {
    bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub(crate) fn new(bytes: Box<[u8]>, hash: u32) -> Self {
        ObjString { bytes, hash }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lossy only in the sense that Lumen never validates UTF-8 on string
    /// literals; in practice every string this VM creates is valid UTF-8
    /// because the lexer and `+` concatenation only ever copy valid UTF-8
    /// input. Non-goal: Unicode-aware operations, not Unicode-safe storage.
    #[inline]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// FNV-1a, matching `original_source/clox/table.c`'s `hash_string`.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A per-upvalue descriptor emitted after every `CLOSURE` opcode: whether
/// the captured slot is a local of the immediately enclosing function (and
/// so must be captured fresh) or one of that function's own upvalues (and
/// so is simply forwarded).
#[derive(Clone, Copy, Debug)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u16,
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u16,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn new(name: Option<ObjRef>) -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(s) => s.as_str(),
            None => "<script>",
        }
    }
}

/// Outcome of a native call: either a value, or an error message.
///
/// Mirrors `original_source/clox/native.h`'s `NativeResult { value, error }`
/// struct, but carries the error message inline (the C version leans on
/// `native_runtime_error` writing through a side channel before returning
/// `NATIVE_MKERR()`). The VM reports `error` results as a runtime error
/// tagged with the native's name, exactly as the C `NativeResult` does.
pub enum NativeResult {
    Ok(Value),
    Err(String),
}

impl NativeResult {
    pub fn ok(value: Value) -> Self {
        NativeResult::Ok(value)
    }

    pub fn err(message: impl Into<String>) -> Self {
        NativeResult::Err(message.into())
    }
}

/// A native function pointer. Takes the heap (so a native can allocate,
/// e.g. a string result) and its argument slice; returns a structured
/// result rather than panicking on a bad argument.
pub type NativeFn = fn(heap: &mut Heap, args: &[Value]) -> NativeResult;

pub struct ObjNative {
    pub name: ObjRef,
    pub arity: u8,
    pub func: NativeFn,
}

/// A closure's view of a variable that outlives the stack frame in which
/// it was declared. Starts `Open`, pointing directly at a slot on the VM's
/// (non-reallocating) value stack; becomes `Closed` exactly once, when that
/// slot is about to be discarded, at which point the value is copied out.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(*mut Value),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
    /// Next entry in the VM's sorted (descending by stack address) list of
    /// still-open upvalues. Unrelated to `Obj::next`, the GC allocation
    /// list link.
    pub next_open: Option<ObjRef>,
}

impl ObjUpvalue {
    pub fn location(&self) -> *mut Value {
        match self.state {
            UpvalueState::Open(ptr) => ptr,
            UpvalueState::Closed(_) => std::ptr::null_mut(),
        }
    }
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
    /// `static` methods (spec.md §9's optional extension), looked up on the
    /// class value itself rather than on instances of it.
    pub statics: Table,
}

impl ObjClass {
    pub fn new(name: ObjRef) -> Self {
        ObjClass {
            name,
            methods: Table::new(),
            statics: Table::new(),
        }
    }
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: ObjRef) -> Self {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Optional extension (spec.md §9): a growable array of values. Not
/// produced by any surface syntax unless the `[` `]` opcodes are emitted
/// by the compiler's optional subscript support.
pub struct ObjArray {
    pub elements: Vec<Value>,
}
