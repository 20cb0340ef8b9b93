//! The allocator and tri-color mark-sweep collector (spec.md §4.6).
//!
//! `Heap` is the single policy point for heap growth: every allocation
//! flows through [`Heap::alloc_object`] (or [`Heap::intern_string`], which
//! calls it), and every allocation updates `bytes_allocated` before
//! returning. `Heap` does not, by itself, know how to find GC roots (its
//! caller, the compiler mid-parse or the VM mid-run, is the only thing
//! that knows its own stack/globals/locals, so root marking is a callback
//! via [`GcRoots`] rather than something `Heap` reaches for on its own.
//! This is the Rust translation of spec.md §9's "single struct... passed
//! to every primitive": there are two structs (the root holder and the
//! heap), not one, because in safe-ish Rust a struct cannot hold a mutable
//! reference to itself across the calls that would need it. See
//! `DESIGN.md` for the open-question writeup.

use std::ptr::NonNull;

use crate::object::{
    Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind,
    ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueState, fnv1a_hash,
};
use crate::table::Table;
use crate::value::Value;

/// Heap size (bytes) at which the very first collection becomes eligible.
/// Matches `original_source/clox/memory.c`'s "roughly 1 MiB" starting
/// threshold.
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// Growth factor applied to `next_gc` after each collection.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Allocation/collection counters, exposed for `--trace-gc` logging and
/// tests. Grounded on `seq-core::memory_stats`'s registry-of-counters
/// idiom, simplified to a single-threaded struct (this VM never runs more
/// than one at a time, per spec.md §5).
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: u64,
    pub objects_allocated: u64,
    pub objects_freed: u64,
}

/// Anything that can hand the collector its live roots: the VM (stack,
/// frames, globals, open upvalues) during execution, and the compiler
/// (its chain of in-progress `Function`s) during compilation. Both halves
/// of spec.md §4.6's root list ("stack... compiler-time function being
/// built") are covered by having both implement this trait and calling
/// [`collect_if_needed`] with themselves as the root source.
pub trait GcRoots {
    fn mark_roots(&self, heap: &mut Heap);
}

/// The heap: allocation list, intern table, and GC bookkeeping.
pub struct Heap {
    objects: Option<ObjRef>,
    /// Intern table. Holds strings *weakly* (see [`Heap::remove_white_strings`]).
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<ObjRef>,
    pub stats: GcStats,
    /// Forces a collection on every allocation, for invariant testing
    /// (spec.md §4.6 "stress mode").
    pub stress_gc: bool,
    /// The interned string `"init"`, used by the VM to recognize
    /// constructors without re-hashing the literal on every call.
    pub init_string: ObjRef,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            gray_stack: Vec::new(),
            stats: GcStats::default(),
            stress_gc: false,
            init_string: ObjRef::dangling(),
        };
        heap.init_string = heap.intern_string(b"init");
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    fn object_size(kind: &ObjKind) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match kind {
            ObjKind::String(s) => s.len(),
            ObjKind::Function(f) => {
                f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            ObjKind::Native(_) => 0,
            ObjKind::Upvalue(_) => 0,
            ObjKind::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            ObjKind::Class(_) => 0,
            ObjKind::Instance(_) => 0,
            ObjKind::BoundMethod(_) => 0,
            ObjKind::Array(a) => a.elements.len() * std::mem::size_of::<Value>(),
        }
    }

    /// The one function every heap allocation in this crate flows through.
    pub fn alloc_object(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += Self::object_size(&kind);
        let obj = Box::new(Obj {
            kind,
            marked: false,
            next: self.objects,
        });
        let ptr = Box::into_raw(obj);
        // SAFETY: `ptr` was just produced by `Box::into_raw`, so it is
        // non-null and uniquely owned by the heap's allocation list from
        // this point on.
        let r = unsafe { ObjRef::from_non_null(NonNull::new_unchecked(ptr)) };
        self.objects = Some(r);
        self.stats.objects_allocated += 1;
        r
    }

    /// Intern `bytes`, returning the existing object if an equal string is
    /// already interned. Every Lumen string (literal, concatenation
    /// result, property name) is created through this path, which is
    /// what makes `Value::equals` on strings a pointer comparison correct.
    pub fn intern_string(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = fnv1a_hash(bytes);
        if let Some(existing) = self.strings.find_string(bytes, hash) {
            return existing;
        }
        let obj_string = ObjString::new(bytes.to_vec().into_boxed_slice(), hash);
        let r = self.alloc_object(ObjKind::String(obj_string));
        // The intern table's "value" side is unused; storing `Nil` keeps
        // `Table`'s tombstone test (`empty key + non-nil value`) from
        // misfiring on a live entry.
        self.strings.install(Value::Obj(r), Value::Nil);
        r
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        self.alloc_object(ObjKind::Function(function))
    }

    pub fn alloc_native(&mut self, native: ObjNative) -> ObjRef {
        self.alloc_object(ObjKind::Native(native))
    }

    pub fn alloc_closure(&mut self, closure: ObjClosure) -> ObjRef {
        self.alloc_object(ObjKind::Closure(closure))
    }

    pub fn alloc_upvalue(&mut self, slot: *mut Value) -> ObjRef {
        self.alloc_object(ObjKind::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(slot),
            next_open: None,
        }))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc_object(ObjKind::Class(ObjClass::new(name)))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc_object(ObjKind::Instance(ObjInstance::new(class)))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc_object(ObjKind::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    pub fn alloc_array(&mut self, elements: Vec<Value>) -> ObjRef {
        self.alloc_object(ObjKind::Array(ObjArray { elements }))
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(o) = value {
            self.mark_object(o);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        // SAFETY: every live `ObjRef` points at a `Obj` owned by this heap.
        unsafe {
            if (*obj.as_ptr()).marked {
                return;
            }
            (*obj.as_ptr()).marked = true;
        }
        self.gray_stack.push(obj);
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken_object(obj);
        }
    }

    fn blacken_object(&mut self, obj: ObjRef) {
        // SAFETY: `obj` is reachable (it was just popped off the gray
        // stack, which only ever holds marked, live objects).
        let kind_ptr: *const ObjKind = unsafe { &(*obj.as_ptr()).kind };
        match unsafe { &*kind_ptr } {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    self.mark_value(v);
                }
            }
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for constant in &f.chunk.constants {
                    self.mark_value(*constant);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for upvalue in &c.upvalues {
                    self.mark_object(*upvalue);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                for (k, v) in c.methods.iter() {
                    self.mark_value(k);
                    self.mark_value(v);
                }
                for (k, v) in c.statics.iter() {
                    self.mark_value(k);
                    self.mark_value(v);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                for (k, v) in i.fields.iter() {
                    self.mark_value(k);
                    self.mark_value(v);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
            ObjKind::Array(a) => {
                for v in &a.elements {
                    self.mark_value(*v);
                }
            }
        }
    }

    /// The intern table holds strings weakly: after the gray stack drains,
    /// any entry whose object didn't get marked this cycle is unreachable
    /// everywhere else too, and must be dropped from the table before
    /// `sweep` frees the underlying object, otherwise the table would
    /// hold a dangling `ObjRef`.
    fn remove_white_strings(&mut self) {
        let stale: Vec<Value> = self
            .strings
            .iter()
            .filter(|(key, _)| match key {
                Value::Obj(o) => unsafe { !(*o.as_ptr()).marked },
                _ => false,
            })
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.strings.delete(key);
        }
    }

    fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.objects;
        while let Some(obj) = current {
            // SAFETY: every object reachable from `self.objects` is live
            // until this loop frees it.
            let (marked, next) = unsafe { ((*obj.as_ptr()).marked, (*obj.as_ptr()).next) };
            if marked {
                unsafe {
                    (*obj.as_ptr()).marked = false;
                }
                previous = Some(obj);
                current = next;
            } else {
                match previous {
                    Some(p) => unsafe {
                        (*p.as_ptr()).next = next;
                    },
                    None => self.objects = next,
                }
                current = next;
                let size = unsafe { Self::object_size(&(*obj.as_ptr()).kind) };
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                self.stats.objects_freed += 1;
                // SAFETY: `obj` was allocated by `Box::new` in
                // `alloc_object` and is unlinked from every list that
                // could still reference it (the allocation list, just
                // above; the intern table, via `remove_white_strings`,
                // which must run before this loop for string objects).
                unsafe {
                    drop(Box::from_raw(obj.as_ptr()));
                }
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Tear down every remaining object; nothing is reachable once the
        // heap itself is going away.
        let mut current = self.objects;
        while let Some(obj) = current {
            let next = unsafe { (*obj.as_ptr()).next };
            unsafe {
                drop(Box::from_raw(obj.as_ptr()));
            }
            current = next;
        }
        self.objects = None;
    }
}

/// Run a full mark-sweep cycle unconditionally.
pub fn collect_garbage(heap: &mut Heap, roots: &impl GcRoots) {
    // `init_string` is a root regardless of caller (spec.md §4.6's root
    // list names it explicitly alongside the stack/globals/compiler chain),
    // so it is marked here rather than relied on from `GcRoots::mark_roots`.
    heap.mark_object(heap.init_string);
    roots.mark_roots(heap);
    heap.trace_references();
    heap.remove_white_strings();
    heap.sweep();
    heap.next_gc = (heap.bytes_allocated * GC_HEAP_GROW_FACTOR).max(INITIAL_GC_THRESHOLD);
    heap.stats.collections += 1;
    tracing::debug!(
        bytes_allocated = heap.bytes_allocated,
        next_gc = heap.next_gc,
        collections = heap.stats.collections,
        "gc cycle complete"
    );
}

/// Collect only if [`Heap::should_collect`] says it's time. Call sites
/// that are about to allocate call this first, passing themselves (or the
/// VM/compiler that owns them) as `roots` (see module docs for why this
/// lives outside `Heap` itself).
pub fn collect_if_needed(heap: &mut Heap, roots: &impl GcRoots) {
    if heap.should_collect() {
        collect_garbage(heap, roots);
    }
}

/// Render an object the way `print` and string concatenation do.
pub fn display_object(o: ObjRef) -> String {
    match o.kind() {
        ObjKind::String(s) => s.as_str().to_string(),
        ObjKind::Function(f) => format!("<fn {}>", f.display_name()),
        ObjKind::Native(n) => format!("<native fn {}>", n.name.as_str()),
        ObjKind::Upvalue(_) => "<upvalue>".to_string(),
        ObjKind::Closure(c) => match c.function.kind() {
            ObjKind::Function(f) => format!("<fn {}>", f.display_name()),
            _ => unreachable!("closure.function is always a Function"),
        },
        ObjKind::Class(c) => c.name.as_str().to_string(),
        ObjKind::Instance(i) => match i.class.kind() {
            ObjKind::Class(c) => format!("{} instance", c.name.as_str()),
            _ => unreachable!("instance.class is always a Class"),
        },
        ObjKind::BoundMethod(b) => match b.method.kind() {
            ObjKind::Closure(c) => match c.function.kind() {
                ObjKind::Function(f) => format!("<fn {}>", f.display_name()),
                _ => unreachable!(),
            },
            _ => unreachable!("bound_method.method is always a Closure"),
        },
        ObjKind::Array(a) => {
            let parts: Vec<String> = a.elements.iter().map(|v| v.to_string()).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_dedupes_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"hello");
        let b = heap.intern_string(b"hello");
        assert_eq!(a, b);
        let c = heap.intern_string(b"world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        heap.intern_string(b"will be collected");
        // No roots at all: everything except nothing should survive.
        collect_garbage(&mut heap, &NoRoots);
        assert!(heap.strings.find_string(b"will be collected", fnv1a_hash(b"will be collected")).is_none());
    }

    #[test]
    fn reachable_objects_survive_collection() {
        let mut heap = Heap::new();
        let kept = heap.intern_string(b"kept");

        struct KeepOne(ObjRef);
        impl GcRoots for KeepOne {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }

        collect_garbage(&mut heap, &KeepOne(kept));
        assert!(heap.strings.find_string(b"kept", fnv1a_hash(b"kept")).is_some());
    }
}
