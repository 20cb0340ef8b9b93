//! The bytecode dispatch loop and call protocol (spec.md §4.5). Grounded
//! instruction-for-instruction on `original_source/clox/vm.c`'s `run()`,
//! extended with the long-form operand opcodes (spec.md §4.2), `static`
//! methods dispatched through a class's own method table, and the array
//! subscript opcodes.

use lumen_core::error::{RuntimeError, TraceFrame};
use lumen_core::gc::collect_if_needed;
use lumen_core::object::{NativeResult, ObjClosure, ObjKind, ObjRef, UpvalueState};
use lumen_core::{Chunk, GcRoots, Heap, LumenError, OpCode, Table, Value, FRAMES_MAX, STACK_MAX};

use crate::frame::CallFrame;
use crate::natives;

/// The register-less stack VM. Holds everything that survives across
/// `interpret` calls in the same process (spec.md §5: "one VM instance per
/// process"); the heap is threaded in separately by every caller, never
/// owned here (see `lumen-core::gc` module docs for why).
pub struct Vm {
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the sorted-by-descending-stack-address open upvalue list.
    open_upvalues: Option<ObjRef>,
    /// Mirrors clox's `DEBUG_TRACE_EXECUTION`: logs every instruction and
    /// the stack contents before executing it.
    trace_execution: bool,
}

impl Vm {
    pub fn new(heap: &mut Heap) -> Self {
        let mut globals = Table::new();
        natives::install(heap, &mut globals);
        Vm {
            stack: vec![Value::Nil; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: None,
            trace_execution: false,
        }
    }

    pub fn with_trace_execution(mut self, enabled: bool) -> Self {
        self.trace_execution = enabled;
        self
    }

    /// Compile and run `source`. Resets the stack on any error so the same
    /// `Vm` (and its globals) can keep serving a REPL session afterward.
    pub fn interpret(&mut self, heap: &mut Heap, source: &str) -> Result<(), LumenError> {
        let function = lumen_compiler::compile(source, heap)?;

        // Root `function` on the stack before allocating the closure that
        // wraps it, in case the allocation triggers a collection.
        self.push(Value::obj(function));
        collect_if_needed(heap, self);
        let closure_ref = heap.alloc_closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        });
        self.pop();
        self.push(Value::obj(closure_ref));

        if let Err(e) = self.call_closure(closure_ref, 0) {
            self.reset_stack();
            return Err(LumenError::Runtime(e));
        }

        match self.run(heap) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_stack();
                Err(LumenError::Runtime(e))
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- stack primitives -------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("run() never called with an empty frame stack")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() never called with an empty frame stack")
    }

    /// Lifetime unbound from any borrow of `self`, the same trick
    /// [`ObjRef::kind`] uses: the chunk lives as long as its `Function`
    /// object does, which the GC roots keep alive for as long as a live
    /// frame still points at it.
    fn chunk_of<'a>(closure: ObjRef) -> &'a Chunk {
        match closure.kind() {
            ObjKind::Closure(c) => match c.function.kind() {
                ObjKind::Function(f) => &f.chunk,
                _ => unreachable!("closure.function is always a Function"),
            },
            _ => unreachable!("frame.closure is always a Closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let closure = self.frame().closure;
        let chunk = Self::chunk_of(closure);
        let frame = self.frame_mut();
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte() as u16;
        let hi = self.read_byte() as u16;
        lo | (hi << 8)
    }

    fn read_constant(&mut self, index: usize) -> Value {
        let closure = self.frame().closure;
        Self::chunk_of(closure).constants[index]
    }

    fn read_constant_byte(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.read_constant(index)
    }

    fn read_constant_u16(&mut self) -> Value {
        let index = self.read_u16() as usize;
        self.read_constant(index)
    }

    fn read_name(&mut self, long: bool) -> ObjRef {
        let v = if long {
            self.read_constant_u16()
        } else {
            self.read_constant_byte()
        };
        v.as_obj().expect("name operand is always an interned string constant")
    }

    // ---- errors -------------------------------------------------------

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut traceback = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let chunk = Self::chunk_of(frame.closure);
            let line = chunk.get_line(frame.ip.saturating_sub(1));
            let name = match frame.closure.kind() {
                ObjKind::Closure(c) => match c.function.kind() {
                    ObjKind::Function(f) => match f.name {
                        Some(n) => format!("{}()", n.as_str()),
                        None => "script".to_string(),
                    },
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            };
            traceback.push(TraceFrame { line, name });
        }
        let line = traceback.first().map(|t| t.line).unwrap_or(0);
        RuntimeError {
            message,
            line,
            traceback,
        }
    }

    // ---- calls ----------------------------------------------------------

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let arity = match closure.kind() {
            ObjKind::Closure(c) => match c.function.kind() {
                ObjKind::Function(f) => f.arity,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(format!("expected {arity} arguments, got {argc}")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        let slots_base = self.stack_top - argc as usize - 1;
        self.frames.push(CallFrame::new(closure, slots_base));
        Ok(())
    }

    fn call_value(&mut self, heap: &mut Heap, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Some(obj) = callee.as_obj() else {
            return Err(self.runtime_error("attempt to call a non-callable value"));
        };
        match obj.kind() {
            ObjKind::Closure(_) => self.call_closure(obj, argc),
            ObjKind::Native(n) => {
                if argc != n.arity {
                    return Err(self.runtime_error(format!(
                        "expected {} arguments, got {}",
                        n.arity, argc
                    )));
                }
                let func = n.func;
                let base = self.stack_top - argc as usize;
                let result = func(heap, &self.stack[base..self.stack_top]);
                self.stack_top = base - 1;
                match result {
                    NativeResult::Ok(v) => {
                        self.push(v);
                        Ok(())
                    }
                    NativeResult::Err(msg) => {
                        Err(self.runtime_error(format!("{}: {}", n.name.as_str(), msg)))
                    }
                }
            }
            ObjKind::Class(_) => {
                collect_if_needed(heap, self);
                let instance = heap.alloc_instance(obj);
                let slot = self.stack_top - argc as usize - 1;
                self.stack[slot] = Value::obj(instance);
                let init = match obj.kind() {
                    ObjKind::Class(c) => c.methods.lookup(Value::obj(heap.init_string)),
                    _ => unreachable!(),
                };
                match init {
                    Some(initializer) => {
                        let closure = initializer.as_obj().expect("init is always a Closure");
                        self.call_closure(closure, argc)
                    }
                    None if argc != 0 => {
                        Err(self.runtime_error(format!("expected 0 arguments, got {argc}")))
                    }
                    None => Ok(()),
                }
            }
            ObjKind::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                let slot = self.stack_top - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("attempt to call a non-callable value")),
        }
    }

    fn bind_method(&mut self, heap: &mut Heap, methods: &Table, name: ObjRef) -> bool {
        match methods.lookup(Value::obj(name)) {
            Some(method) => {
                // Check before popping the receiver off the stack, so it's
                // still rooted if this triggers a collection.
                collect_if_needed(heap, self);
                let receiver = self.pop();
                let method_ref = method.as_obj().expect("method value is always a Closure");
                let bound = heap.alloc_bound_method(receiver, method_ref);
                self.push(Value::obj(bound));
                true
            }
            None => false,
        }
    }

    fn invoke_from_class(&mut self, methods: &Table, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        match methods.lookup(Value::obj(name)) {
            Some(method) => {
                let closure = method.as_obj().expect("method is always a Closure");
                self.call_closure(closure, argc)
            }
            None => Err(self.runtime_error(format!("undefined property '{}'", name.as_str()))),
        }
    }

    fn invoke(&mut self, heap: &mut Heap, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Some(obj) = receiver.as_obj() else {
            return Err(self.runtime_error("only instances and classes have methods"));
        };
        match obj.kind() {
            ObjKind::Instance(inst) => {
                if let Some(value) = inst.fields.lookup(Value::obj(name)) {
                    let slot = self.stack_top - argc as usize - 1;
                    self.stack[slot] = value;
                    return self.call_value(heap, value, argc);
                }
                let class = inst.class;
                let methods: &Table = match class.kind() {
                    ObjKind::Class(c) => &c.methods,
                    _ => unreachable!("instance.class is always a Class"),
                };
                self.invoke_from_class(methods, name, argc)
            }
            ObjKind::Class(c) => self.invoke_from_class(&c.statics, name, argc),
            _ => Err(self.runtime_error("only instances and classes have methods")),
        }
    }

    // ---- upvalues ---------------------------------------------------------

    fn capture_upvalue(&mut self, heap: &mut Heap, slot: usize) -> ObjRef {
        let target_ptr = std::ptr::addr_of_mut!(self.stack[slot]);
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;

        while let Some(up) = current {
            let up_ptr = match up.kind() {
                ObjKind::Upvalue(u) => u.location(),
                _ => unreachable!(),
            };
            if (up_ptr as usize) <= (target_ptr as usize) {
                break;
            }
            prev = Some(up);
            current = match up.kind() {
                ObjKind::Upvalue(u) => u.next_open,
                _ => unreachable!(),
            };
        }

        if let Some(up) = current {
            let up_ptr = match up.kind() {
                ObjKind::Upvalue(u) => u.location(),
                _ => unreachable!(),
            };
            if up_ptr == target_ptr {
                return up;
            }
        }

        collect_if_needed(heap, self);
        let mut created = heap.alloc_upvalue(target_ptr);
        if let ObjKind::Upvalue(u) = created.kind_mut() {
            u.next_open = current;
        }
        match prev {
            Some(mut p) => {
                if let ObjKind::Upvalue(u) = p.kind_mut() {
                    u.next_open = Some(created);
                }
            }
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue pointing at `from_slot` or higher, copying
    /// its value out before the stack slot it points into is discarded.
    fn close_upvalues(&mut self, from_slot: usize) {
        let boundary = std::ptr::addr_of!(self.stack[from_slot]) as usize;
        while let Some(mut up) = self.open_upvalues {
            let up_ptr = match up.kind() {
                ObjKind::Upvalue(u) => u.location(),
                _ => unreachable!(),
            };
            if (up_ptr as usize) < boundary {
                break;
            }
            let value = unsafe { *up_ptr };
            let next = match up.kind() {
                ObjKind::Upvalue(u) => u.next_open,
                _ => unreachable!(),
            };
            if let ObjKind::Upvalue(u) = up.kind_mut() {
                u.state = UpvalueState::Closed(value);
            }
            self.open_upvalues = next;
        }
    }

    // ---- the dispatch loop ------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                tracing::trace!(stack_top = self.stack_top, ip = self.frame().ip, "vm step");
            }

            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant_byte();
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let v = self.read_constant_u16();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_name(op == OpCode::DefineGlobalLong);
                    let value = self.peek(0);
                    self.globals.install(Value::obj(name), value);
                    self.pop();
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_name(op == OpCode::GetGlobalLong);
                    match self.globals.lookup(Value::obj(name)) {
                        Some(v) => self.push(v),
                        None => {
                            return Err(self.runtime_error(format!(
                                "undefined variable '{}'",
                                name.as_str()
                            )))
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_name(op == OpCode::SetGlobalLong);
                    let value = self.peek(0);
                    if self.globals.install(Value::obj(name), value) {
                        self.globals.delete(Value::obj(name));
                        return Err(self.runtime_error(format!(
                            "undefined variable '{}'",
                            name.as_str()
                        )));
                    }
                }
                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let slot = if op == OpCode::GetLocalLong {
                        self.read_u16() as usize
                    } else {
                        self.read_byte() as usize
                    };
                    let base = self.frame().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let slot = if op == OpCode::SetLocalLong {
                        self.read_u16() as usize
                    } else {
                        self.read_byte() as usize
                    };
                    let base = self.frame().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let up = match closure.kind() {
                        ObjKind::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let value = match up.kind() {
                        ObjKind::Upvalue(u) => match u.state {
                            UpvalueState::Open(ptr) => unsafe { *ptr },
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let mut up = match closure.kind() {
                        ObjKind::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    match up.kind_mut() {
                        ObjKind::Upvalue(u) => match u.state {
                            UpvalueState::Open(ptr) => unsafe { *ptr = value },
                            UpvalueState::Closed(_) => u.state = UpvalueState::Closed(value),
                        },
                        _ => unreachable!(),
                    }
                }
                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_name(op == OpCode::GetPropertyLong);
                    let receiver = self.peek(0);
                    match receiver.as_obj().map(|o| o.kind()) {
                        Some(ObjKind::Instance(inst)) => {
                            if let Some(v) = inst.fields.lookup(Value::obj(name)) {
                                self.pop();
                                self.push(v);
                            } else {
                                let class = inst.class;
                                let methods: &Table = match class.kind() {
                                    ObjKind::Class(c) => &c.methods,
                                    _ => unreachable!("instance.class is always a Class"),
                                };
                                if !self.bind_method(heap, methods, name) {
                                    return Err(self.runtime_error(format!(
                                        "undefined property '{}'",
                                        name.as_str()
                                    )));
                                }
                            }
                        }
                        Some(ObjKind::Class(c)) => {
                            if !self.bind_method(heap, &c.statics, name) {
                                return Err(self.runtime_error(format!(
                                    "undefined property '{}'",
                                    name.as_str()
                                )));
                            }
                        }
                        _ => {
                            return Err(
                                self.runtime_error("only instances and classes have properties")
                            )
                        }
                    }
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_name(op == OpCode::SetPropertyLong);
                    let receiver = self.peek(1);
                    match receiver.as_obj().map(|o| o.kind()) {
                        Some(ObjKind::Instance(_)) => {
                            let mut obj = receiver.as_obj().unwrap();
                            let value = self.peek(0);
                            if let ObjKind::Instance(inst) = obj.kind_mut() {
                                inst.fields.install(Value::obj(name), value);
                            }
                            let value = self.pop();
                            self.pop();
                            self.push(value);
                        }
                        _ => return Err(self.runtime_error("only instances have fields")),
                    }
                }
                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let name = self.read_name(op == OpCode::GetSuperLong);
                    let superclass_val = self.pop();
                    let superclass = superclass_val.as_obj().expect("super is always a Class");
                    let methods: &Table = match superclass.kind() {
                        ObjKind::Class(c) => &c.methods,
                        _ => unreachable!("super is always a Class"),
                    };
                    if !self.bind_method(heap, methods, name) {
                        return Err(self.runtime_error(format!(
                            "undefined property '{}'",
                            name.as_str()
                        )));
                    }
                }
                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(&b)));
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let bv = self.peek(0);
                    let av = self.peek(1);
                    if let (Some(a), Some(b)) = (av.as_string(), bv.as_string()) {
                        let mut bytes = a.as_bytes().to_vec();
                        bytes.extend_from_slice(b.as_bytes());
                        collect_if_needed(heap, self);
                        let interned = heap.intern_string(&bytes);
                        self.pop();
                        self.pop();
                        self.push(Value::obj(interned));
                    } else if let (Some(a), Some(b)) = (av.as_number(), bv.as_number()) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    } else {
                        return Err(
                            self.runtime_error("operands must be two numbers or two strings")
                        );
                    }
                }
                OpCode::Sub => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Mul => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Div => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(self.runtime_error("operand must be a number")),
                },
                OpCode::Print => {
                    let v = self.pop();
                    println!("{v}");
                }
                OpCode::Branch => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::BranchFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::BranchBack => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(heap, callee, argc)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name = self.read_name(op == OpCode::InvokeLong);
                    let argc = self.read_byte();
                    self.invoke(heap, name, argc)?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let name = self.read_name(op == OpCode::SuperInvokeLong);
                    let argc = self.read_byte();
                    let superclass_val = self.pop();
                    let superclass = superclass_val.as_obj().expect("super is always a Class");
                    let methods: &Table = match superclass.kind() {
                        ObjKind::Class(c) => &c.methods,
                        _ => unreachable!("super is always a Class"),
                    };
                    self.invoke_from_class(methods, name, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots_base = self.frame().slots_base;
                    self.close_upvalues(slots_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack_top = 0;
                        return Ok(());
                    }
                    self.stack_top = slots_base;
                    self.push(result);
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    let func_val = if op == OpCode::ClosureLong {
                        self.read_constant_u16()
                    } else {
                        self.read_constant_byte()
                    };
                    let function_ref =
                        func_val.as_obj().expect("closure operand is always a Function");
                    let upvalue_count = match function_ref.kind() {
                        ObjKind::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_u16() as usize;
                        let up = if is_local {
                            let slot = self.frame().slots_base + index;
                            self.capture_upvalue(heap, slot)
                        } else {
                            let closure = self.frame().closure;
                            match closure.kind() {
                                ObjKind::Closure(c) => c.upvalues[index],
                                _ => unreachable!(),
                            }
                        };
                        upvalues.push(up);
                    }
                    collect_if_needed(heap, self);
                    let closure_ref = heap.alloc_closure(ObjClosure {
                        function: function_ref,
                        upvalues,
                    });
                    self.push(Value::obj(closure_ref));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack_top - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Class | OpCode::ClassLong => {
                    let name = self.read_name(op == OpCode::ClassLong);
                    collect_if_needed(heap, self);
                    let class_ref = heap.alloc_class(name);
                    self.push(Value::obj(class_ref));
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name = self.read_name(op == OpCode::MethodLong);
                    let method = self.peek(0);
                    let mut class_ref =
                        self.peek(1).as_obj().expect("class value is always a Class");
                    if let ObjKind::Class(c) = class_ref.kind_mut() {
                        c.methods.install(Value::obj(name), method);
                    }
                    self.pop();
                }
                OpCode::Static | OpCode::StaticLong => {
                    let name = self.read_name(op == OpCode::StaticLong);
                    let method = self.peek(0);
                    let mut class_ref =
                        self.peek(1).as_obj().expect("class value is always a Class");
                    if let ObjKind::Class(c) = class_ref.kind_mut() {
                        c.statics.install(Value::obj(name), method);
                    }
                    self.pop();
                }
                OpCode::Inherit => {
                    let superclass_val = self.peek(1);
                    let subclass_val = self.peek(0);
                    let Some(superclass_obj) = superclass_val.as_obj() else {
                        return Err(self.runtime_error("superclass must be a class"));
                    };
                    let methods: &Table = match superclass_obj.kind() {
                        ObjKind::Class(c) => &c.methods,
                        _ => return Err(self.runtime_error("superclass must be a class")),
                    };
                    let mut subclass_obj =
                        subclass_val.as_obj().expect("subclass value is always a Class");
                    if let ObjKind::Class(subc) = subclass_obj.kind_mut() {
                        methods.add_all(&mut subc.methods);
                    }
                    self.pop();
                }
                OpCode::BuildArray => {
                    let count = self.read_byte() as usize;
                    let start = self.stack_top - count;
                    let elements = self.stack[start..self.stack_top].to_vec();
                    collect_if_needed(heap, self);
                    self.stack_top = start;
                    let arr = heap.alloc_array(elements);
                    self.push(Value::obj(arr));
                }
                OpCode::GetIndex => {
                    let idx_val = self.pop();
                    let arr_val = self.pop();
                    let Some(idx) = idx_val.as_number() else {
                        return Err(self.runtime_error("array index must be a number"));
                    };
                    let Some(arr_obj) = arr_val.as_obj() else {
                        return Err(self.runtime_error("only arrays can be indexed"));
                    };
                    let elements = match arr_obj.kind() {
                        ObjKind::Array(a) => &a.elements,
                        _ => return Err(self.runtime_error("only arrays can be indexed")),
                    };
                    let i = idx as isize;
                    if i < 0 || i as usize >= elements.len() {
                        return Err(self.runtime_error("array index out of bounds"));
                    }
                    self.push(elements[i as usize]);
                }
                OpCode::SetIndex => {
                    let value = self.pop();
                    let idx_val = self.pop();
                    let arr_val = self.pop();
                    let Some(idx) = idx_val.as_number() else {
                        return Err(self.runtime_error("array index must be a number"));
                    };
                    let Some(mut arr_obj) = arr_val.as_obj() else {
                        return Err(self.runtime_error("only arrays can be indexed"));
                    };
                    match arr_obj.kind_mut() {
                        ObjKind::Array(a) => {
                            let i = idx as isize;
                            if i < 0 || i as usize >= a.elements.len() {
                                return Err(self.runtime_error("array index out of bounds"));
                            }
                            a.elements[i as usize] = value;
                        }
                        _ => return Err(self.runtime_error("only arrays can be indexed")),
                    }
                    self.push(value);
                }
            }
        }
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
            return Err(self.runtime_error("operands must be numbers"));
        };
        self.pop();
        self.pop();
        self.push(f(a, b));
        Ok(())
    }
}

impl GcRoots for Vm {
    fn mark_roots(&self, heap: &mut Heap) {
        for i in 0..self.stack_top {
            heap.mark_value(self.stack[i]);
        }
        for frame in &self.frames {
            heap.mark_object(frame.closure);
        }
        for (k, v) in self.globals.iter() {
            heap.mark_value(k);
            heap.mark_value(v);
        }
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            heap.mark_object(up);
            current = match up.kind() {
                ObjKind::Upvalue(u) => u.next_open,
                _ => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(src: &str) -> Result<(), LumenError> {
        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        vm.interpret(&mut heap, src)
    }

    #[test]
    fn arithmetic_expression_runs() {
        assert!(run_source("print (1 + 2) * 3 - 4 / 2;").is_ok());
    }

    #[test]
    fn closures_capture_loop_state() {
        let src = "fun make() { var i = 0; fun inc() { i = i + 1; return i; } return inc; } \
                   var c = make(); print c(); print c();";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn inheritance_and_super_call() {
        let src = "class A { greet() { print \"A\"; } } \
                   class B < A { greet() { super.greet(); print \"B\"; } } \
                   B().greet();";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn constructor_and_field_access() {
        assert!(run_source("class P { init(x) { this.x = x; } } print P(42).x;").is_ok());
    }

    #[test]
    fn string_interning_equality() {
        assert!(run_source("print \"ab\" + \"c\" == \"abc\";").is_ok());
    }

    #[test]
    fn runtime_error_carries_traceback() {
        let src = "fun a() { b(); } fun b() { 1 + \"x\"; } a();";
        match run_source(src) {
            Err(LumenError::Runtime(e)) => {
                assert_eq!(e.traceback.len(), 3);
                assert_eq!(e.traceback[0].name, "b()");
                assert_eq!(e.traceback[1].name, "a()");
                assert_eq!(e.traceback[2].name, "script");
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        assert!(matches!(run_source("print x;"), Err(LumenError::Runtime(_))));
    }

    #[test]
    fn static_methods_are_called_on_the_class_itself() {
        let src = "class Math { static square(n) { return n * n; } } print Math.square(5);";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn array_literal_and_subscript() {
        assert!(run_source("var a = [1, 2, 3]; a[1] = 9; print a[1];").is_ok());
    }
}
