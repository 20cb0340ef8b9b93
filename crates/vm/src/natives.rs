//! Built-in native functions, registered into the globals table at VM
//! startup. Grounded on `original_source/clox/native.c`'s `clock`/`sqrt`.

use lumen_core::gc::{collect_if_needed, GcRoots, Heap};
use lumen_core::object::{NativeResult, ObjNative};
use lumen_core::table::Table;
use lumen_core::value::Value;

/// Roots the in-progress globals table while `install` is still building it
/// (there's no `Vm` yet to hand `collect_if_needed` at this point).
struct PartialGlobals<'a>(&'a Table);

impl GcRoots for PartialGlobals<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for (k, v) in self.0.iter() {
            heap.mark_value(k);
            heap.mark_value(v);
        }
    }
}

fn native_clock(_heap: &mut Heap, args: &[Value]) -> NativeResult {
    if !args.is_empty() {
        return NativeResult::err("clock() takes no arguments");
    }
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    NativeResult::ok(Value::Number(secs))
}

fn native_sqrt(_heap: &mut Heap, args: &[Value]) -> NativeResult {
    match args.first().and_then(Value::as_number) {
        Some(n) => NativeResult::ok(Value::Number(n.sqrt())),
        None => NativeResult::err("sqrt: invalid parameter"),
    }
}

/// Register every native function into `globals`. Called once at VM
/// construction.
pub fn install(heap: &mut Heap, globals: &mut Table) {
    register(heap, globals, "clock", 0, native_clock);
    register(heap, globals, "sqrt", 1, native_sqrt);
}

fn register(
    heap: &mut Heap,
    globals: &mut Table,
    name: &str,
    arity: u8,
    func: lumen_core::object::NativeFn,
) {
    collect_if_needed(heap, &PartialGlobals(globals));
    let name_ref = heap.intern_string(name.as_bytes());
    let native_ref = heap.alloc_native(ObjNative {
        name: name_ref,
        arity,
        func,
    });
    globals.install(Value::obj(name_ref), Value::obj(native_ref));
}
