//! The single-pass Pratt compiler (spec.md §4.4). Parses and emits
//! bytecode in the same pass, there is no intermediate AST. Grounded on
//! `original_source/clox/compiler.c`'s structure (parser state, a stack of
//! per-function `Compiler` records, a static rule table), extended with
//! `const`, `switch`, `lambda`, `static` methods, and the optional array
//! extension per spec.md §6/§9.

use std::collections::HashSet;

use lumen_core::chunk::OpCode;
use lumen_core::error::CompileError;
use lumen_core::gc::collect_if_needed;
use lumen_core::object::{ObjFunction, ObjRef, UpvalueDesc};
use lumen_core::value::Value;
use lumen_core::{GcRoots, Heap};

use crate::lexer::{Lexer, Token, TokenKind};

const MAX_JUMP: usize = u16::MAX as usize;
const MAX_LOCALS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Conditional, // ?:
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, &mut Heap, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let r = |prefix, infix, precedence| ParseRule {
        prefix,
        infix,
        precedence,
    };
    match kind {
        LeftParen => r(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBracket => r(Some(Compiler::array_literal), Some(Compiler::index_get), Precedence::Call),
        Dot => r(None, Some(Compiler::dot), Precedence::Call),
        Minus => r(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => r(None, Some(Compiler::binary), Precedence::Term),
        Slash => r(None, Some(Compiler::binary), Precedence::Factor),
        Star => r(None, Some(Compiler::binary), Precedence::Factor),
        Bang => r(Some(Compiler::unary), None, Precedence::None),
        BangEqual => r(None, Some(Compiler::binary), Precedence::Equality),
        EqualEqual => r(None, Some(Compiler::binary), Precedence::Equality),
        Greater => r(None, Some(Compiler::binary), Precedence::Comparison),
        GreaterEqual => r(None, Some(Compiler::binary), Precedence::Comparison),
        Less => r(None, Some(Compiler::binary), Precedence::Comparison),
        LessEqual => r(None, Some(Compiler::binary), Precedence::Comparison),
        Identifier => r(Some(Compiler::variable), None, Precedence::None),
        String => r(Some(Compiler::string), None, Precedence::None),
        Number => r(Some(Compiler::number), None, Precedence::None),
        And => r(None, Some(Compiler::and_), Precedence::And),
        Or => r(None, Some(Compiler::or_), Precedence::Or),
        False => r(Some(Compiler::literal), None, Precedence::None),
        True => r(Some(Compiler::literal), None, Precedence::None),
        Nil => r(Some(Compiler::literal), None, Precedence::None),
        This => r(Some(Compiler::this), None, Precedence::None),
        Super => r(Some(Compiler::super_), None, Precedence::None),
        Lambda => r(Some(Compiler::lambda), None, Precedence::None),
        Question => r(None, Some(Compiler::conditional), Precedence::Conditional),
        _ => r(None, None, Precedence::None),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

struct FunctionState<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        let mut function = ObjFunction::new(name);
        function.arity = 0;
        // Slot 0 is reserved for the callable itself (script/function) or
        // `this` (method/initializer), per spec.md §4.5's "slots[0] holds
        // the callable (or, for methods, the receiver)".
        let reserved_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        let locals = vec![Local {
            name: reserved_name,
            depth: 0,
            is_captured: false,
            is_const: false,
        }];
        function.upvalue_count = 0;
        FunctionState {
            function,
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct LoopState {
    loop_start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

/// Compiles Lumen source into a top-level [`ObjFunction`], heap-allocating
/// it (and every nested function) along the way.
///
/// Implements [`GcRoots`] so a collection triggered mid-compile (by
/// interning a string constant, for instance) can still find every
/// in-progress `Function` on the compiler stack, per spec.md §9: "the
/// compiler's own objects are GC roots."
pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
    loops: Vec<LoopState>,
    const_globals: HashSet<String>,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        let dummy = Token {
            kind: TokenKind::Eof,
            slice: "",
            line: 0,
        };
        Compiler {
            lexer: Lexer::new(source),
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            loops: Vec::new(),
            const_globals: HashSet::new(),
        }
    }

    fn current_fn(&mut self) -> &mut FunctionState<'src> {
        self.functions.last_mut().expect("function stack never empty")
    }

    fn chunk_line(&self) -> u32 {
        self.previous.line
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if !self.current.is_error() {
                break;
            }
            let msg = self.current.slice.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // ---- error handling -------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => None,
            TokenKind::Error => None,
            _ => Some(token.slice.to_string()),
        };
        self.errors.push(CompileError {
            line: token.line,
            at,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ---------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.chunk_line();
        self.current_fn().function.chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Little-endian, matching `read_u16` (low byte then high byte).
    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value & 0xff) as u8);
        self.emit_byte((value >> 8) as u8);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Append `value` to the current function's constant pool and emit
    /// `short`/`long` depending on whether the resulting index fits in a
    /// byte, per spec.md §4.2's "constants beyond 0xFF must be accessed via
    /// a long-form opcode carrying a two-byte index."
    fn emit_indexed_constant(&mut self, value: Value, short: OpCode, long: OpCode) {
        let index = self.current_fn().function.chunk.add_constant(value);
        self.emit_indexed(short, long, index);
    }

    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_two(short, index as u8);
        } else if index <= u16::MAX as usize {
            self.emit_op(long);
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte((index >> 8) as u8);
        } else {
            self.error("too many constants in one chunk");
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_fn().function.chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_fn().function.chunk.len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("jump distance too large");
        }
        let chunk = &mut self.current_fn().function.chunk;
        chunk.code[offset] = (jump & 0xff) as u8;
        chunk.code[offset + 1] = (jump >> 8) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::BranchBack);
        let offset = self.current_fn().function.chunk.len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("loop body too large");
        }
        self.emit_byte((offset & 0xff) as u8);
        self.emit_byte((offset >> 8) as u8);
    }

    // ---- scopes and locals ----------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn().scope_depth -= 1;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth <= self.current_fn().scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str, is_const: bool) {
        if self.current_fn().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        self.current_fn().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
            is_const,
        });
    }

    fn mark_initialized(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        if let Some(local) = self.current_fn().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn declare_variable(&mut self, name: &'src str, is_const: bool) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("already a variable with this name in this scope");
            }
        }
        self.add_local(name, is_const);
    }

    fn resolve_local(fns: &[FunctionState<'src>], idx: usize, name: &str) -> Option<(usize, bool)> {
        let f = &fns[idx];
        for (i, local) in f.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i, local.is_const));
            }
        }
        None
    }

    fn resolve_local_uninitialized(fns: &[FunctionState<'src>], idx: usize, name: &str) -> Option<bool> {
        let f = &fns[idx];
        for local in f.locals.iter().rev() {
            if local.name == name {
                return Some(local.depth == -1);
            }
        }
        None
    }

    /// Resolve `name` as an upvalue of the function at `fns[idx]`, capturing
    /// a local of an enclosing function (marking it `captured`) or chaining
    /// through an enclosing upvalue. Mirrors spec.md §4.4 step 2 exactly,
    /// including the dedup-per-function rule.
    fn resolve_upvalue(fns: &mut [FunctionState<'src>], idx: usize, name: &str) -> Option<usize> {
        if idx == 0 {
            return None;
        }
        let enclosing = idx - 1;

        if let Some((local_index, _)) = Self::resolve_local(fns, enclosing, name) {
            fns[enclosing].locals[local_index].is_captured = true;
            return Some(Self::add_upvalue(fns, idx, local_index as u16, true));
        }

        if let Some(upvalue_index) = Self::resolve_upvalue(fns, enclosing, name) {
            return Some(Self::add_upvalue(fns, idx, upvalue_index as u16, false));
        }

        None
    }

    fn add_upvalue(fns: &mut [FunctionState<'src>], idx: usize, index: u16, is_local: bool) -> usize {
        let f = &mut fns[idx];
        for (i, uv) in f.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i;
            }
        }
        f.upvalues.push(UpvalueDesc { is_local, index });
        f.function.upvalue_count = f.upvalues.len() as u16;
        f.upvalues.len() - 1
    }

    // ---- name resolution + get/set emission -----------------------------

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> usize {
        collect_if_needed(heap, self);
        let s = heap.intern_string(name.as_bytes());
        self.current_fn().function.chunk.add_constant(Value::obj(s))
    }

    fn named_variable(&mut self, heap: &mut Heap, name: &'src str, can_assign: bool) {
        let last = self.functions.len() - 1;

        if let Some(uninitialized) = Self::resolve_local_uninitialized(&self.functions, last, name)
        {
            if uninitialized {
                self.error("cannot read local variable in its own initializer");
            }
        }

        if let Some((slot, is_const)) = Self::resolve_local(&self.functions, last, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                if is_const {
                    self.error("cannot assign to a const variable");
                }
                self.expression(heap);
                self.emit_indexed(OpCode::SetLocal, OpCode::SetLocalLong, slot);
            } else {
                self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, slot);
            }
            return;
        }

        if let Some(upvalue) = Self::resolve_upvalue(&mut self.functions, last, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression(heap);
                self.emit_two(OpCode::SetUpvalue, upvalue as u8);
            } else {
                self.emit_two(OpCode::GetUpvalue, upvalue as u8);
            }
            return;
        }

        let index = self.identifier_constant(heap, name);
        if can_assign && self.match_token(TokenKind::Equal) {
            if self.const_globals.contains(name) {
                self.error("cannot assign to a const variable");
            }
            self.expression(heap);
            self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, index);
        } else {
            self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, index);
        }
    }

    // ---- expression parsing (Pratt) -------------------------------------

    fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("expected expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, heap, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix;
            if let Some(infix) = infix {
                infix(self, heap, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(heap, Precedence::Assignment);
    }

    fn number(&mut self, _heap: &mut Heap, _can_assign: bool) {
        let value: f64 = self.previous.slice.parse().unwrap_or(0.0);
        self.emit_indexed_constant(Value::Number(value), OpCode::Constant, OpCode::ConstantLong);
    }

    fn string(&mut self, heap: &mut Heap, _can_assign: bool) {
        let raw = self.previous.slice;
        let text = &raw[1..raw.len() - 1];
        collect_if_needed(heap, self);
        let s = heap.intern_string(text.as_bytes());
        self.emit_indexed_constant(Value::obj(s), OpCode::Constant, OpCode::ConstantLong);
    }

    fn literal(&mut self, _heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for false/true/nil"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(heap, Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = rule(op_kind);
        self.parse_precedence(heap, rule.precedence.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::EqualEqual => self.emit_op(OpCode::Eq),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Eq);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            // `<=` compiles to `> NOT`, `>=` to `< NOT` (spec.md §4.5).
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn conditional(&mut self, heap: &mut Heap, _can_assign: bool) {
        // `cond ? then : else`, parsed at Assignment precedence on each arm
        // so `a ? b : c = d` still parses `d` as the else-branch value, not
        // as an assignment target.
        let else_jump = self.emit_jump(OpCode::BranchFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::Assignment);
        let end_jump = self.emit_jump(OpCode::Branch);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Colon, "expected ':' in conditional expression");
        self.parse_precedence(heap, Precedence::Assignment);
        self.patch_jump(end_jump);
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::BranchFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::BranchFalse);
        let end_jump = self.emit_jump(OpCode::Branch);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous.slice;
        self.named_variable(heap, name, can_assign);
    }

    fn this(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'this' may only be used inside a method");
        }
        self.named_variable(heap, "this", false);
    }

    fn super_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'super' may only be used inside a method");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("'super' may only be used in a class with a superclass");
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let method_name = self.previous.slice;
        let index = self.identifier_constant(heap, method_name);

        self.named_variable(heap, "this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(heap);
            self.named_variable(heap, "super", false);
            self.emit_indexed(OpCode::SuperInvoke, OpCode::SuperInvokeLong, index);
            self.emit_byte(argc);
        } else {
            self.named_variable(heap, "super", false);
            self.emit_indexed(OpCode::GetSuper, OpCode::GetSuperLong, index);
        }
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let argc = self.argument_list(heap);
        self.emit_two(OpCode::Call, argc);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if argc == 255 {
                    self.error("cannot pass more than 255 arguments");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        argc as u8
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name = self.previous.slice;
        let index = self.identifier_constant(heap, name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, index);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(heap);
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, index);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, index);
        }
    }

    fn array_literal(&mut self, heap: &mut Heap, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression(heap);
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
        if count > u8::MAX as u32 {
            self.error("too many elements in array literal");
        }
        self.emit_two(OpCode::BuildArray, count as u8);
    }

    fn index_get(&mut self, heap: &mut Heap, can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn lambda(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.function_body(heap, FunctionKind::Function, None);
    }

    // ---- functions --------------------------------------------------------

    fn function_body(&mut self, heap: &mut Heap, kind: FunctionKind, name: Option<ObjRef>) {
        self.functions.push(FunctionState::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_fn().function.arity += 1;
                if self.current_fn().function.arity > 255 {
                    self.error_at_current("cannot have more than 255 parameters");
                }
                self.consume(TokenKind::Identifier, "expected parameter name");
                let name = self.previous.slice;
                self.declare_variable(name, false);
                self.mark_initialized();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block(heap);

        self.end_function(heap);
    }

    fn end_function(&mut self, heap: &mut Heap) {
        self.emit_return();
        // Check for collection while the finished function is still part of
        // `self.functions`, so `mark_roots` walks its chunk's constants too;
        // once popped below, nothing else roots them until `alloc_function`
        // hands back a handle the enclosing chunk can reference.
        collect_if_needed(heap, self);
        let state = self.functions.pop().expect("pushed in function_body");
        let function_ref = heap.alloc_function(state.function);
        let upvalues = state.upvalues;

        let index = self.current_fn().function.chunk.add_constant(Value::obj(function_ref));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, index);
        // Locals are indexed up to MAX_LOCALS (u16::MAX, per GetLocalLong), so
        // the captured slot needs a full two-byte operand here too, not a
        // single byte like clox's UINT8_COUNT-capped locals use.
        for uv in &upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_u16(uv.index);
        }
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.previous.slice;
        self.declare_variable(name, false);
        self.mark_initialized();
        collect_if_needed(heap, self);
        let name_ref = heap.intern_string(name.as_bytes());
        self.function_body(heap, FunctionKind::Function, Some(name_ref));
        self.define_variable(heap, name, false);
    }

    // ---- classes ------------------------------------------------------

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "expected class name");
        let class_name = self.previous.slice;
        let name_constant = self.identifier_constant(heap, class_name);
        self.declare_variable(class_name, false);
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_constant);
        self.define_variable(heap, class_name, false);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let super_name = self.previous.slice;
            if super_name == class_name {
                self.error("a class cannot inherit from itself");
            }
            self.variable(heap, false);

            self.begin_scope();
            self.add_local("super", false);
            self.mark_initialized();

            self.named_variable(heap, class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(heap, class_name, false);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop); // the class value pushed for method binding

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        let is_static = self.match_token(TokenKind::Static);
        self.consume(TokenKind::Identifier, "expected method name");
        let method_name = self.previous.slice;
        let name_constant = self.identifier_constant(heap, method_name);

        let kind = if method_name == "init" && !is_static {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        collect_if_needed(heap, self);
        let name_ref = heap.intern_string(method_name.as_bytes());
        self.function_body(heap, kind, Some(name_ref));

        let (short, long) = if is_static {
            (OpCode::Static, OpCode::StaticLong)
        } else {
            (OpCode::Method, OpCode::MethodLong)
        };
        self.emit_indexed(short, long, name_constant);
    }

    // ---- variable declarations ------------------------------------------

    fn define_variable(&mut self, heap: &mut Heap, name: &'src str, is_const: bool) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if is_const {
            self.const_globals.insert(name.to_string());
        } else {
            self.const_globals.remove(name);
        }
        let index = self.identifier_constant(heap, name);
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, index);
    }

    fn var_declaration(&mut self, heap: &mut Heap, is_const: bool) {
        self.consume(TokenKind::Identifier, "expected variable name");
        let name = self.previous.slice;
        self.declare_variable(name, is_const);

        if self.match_token(TokenKind::Equal) {
            self.expression(heap);
        } else {
            if is_const {
                self.error("const variable must be initialized");
            }
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.define_variable(heap, name, is_const);
    }

    // ---- statements -------------------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap, false);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(heap, true);
        } else {
            self.statement(heap);
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement(heap);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::BranchFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Branch);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_fn().function.chunk.len();
        let scope_depth = self.current_fn().scope_depth;
        self.loops.push(LoopState {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::BranchFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.close_loop();
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap, false);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_fn().function.chunk.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::BranchFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Branch);
            let increment_start = self.current_fn().function.chunk.len();
            self.expression(heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.current_fn().scope_depth;
        self.loops.push(LoopState {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.close_loop();
        self.end_scope();
    }

    fn close_loop(&mut self) {
        let loop_state = self.loops.pop().expect("loop pushed before statement");
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("'break' outside of a loop");
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
        let jump = self.emit_jump(OpCode::Branch);
        if let Some(loop_state) = self.loops.last_mut() {
            loop_state.break_jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("'continue' outside of a loop");
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
        if let Some(loop_state) = self.loops.last() {
            let loop_start = loop_state.loop_start;
            self.emit_loop(loop_start);
        }
    }

    /// `switch (EXPR) { case E: stmt* ... default: stmt* }` (spec.md §4.4):
    /// each case compares `EQ` against the scrutinee and `BRANCH_FALSE`s to
    /// the next case label, falling through to the switch's end on a match.
    ///
    /// There is no `DUP` opcode in spec.md §6's opcode set, so the
    /// scrutinee is bound as a synthetic local (an anonymous slot in a
    /// scope opened for the switch) instead of being duplicated on the
    /// stack; each case re-reads it with `GET_LOCAL`.
    fn switch_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'switch'");
        self.begin_scope();
        self.expression(heap);
        self.add_local("@switch", false);
        self.mark_initialized();
        let slot = self.current_fn().locals.len() - 1;
        self.consume(TokenKind::RightParen, "expected ')' after switch value");
        self.consume(TokenKind::LeftBrace, "expected '{' before switch body");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut next_case_jump: Option<usize> = None;

        while self.match_token(TokenKind::Case) {
            if let Some(jump) = next_case_jump.take() {
                self.patch_jump(jump);
                self.emit_op(OpCode::Pop);
            }
            self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, slot);
            self.expression(heap);
            self.consume(TokenKind::Colon, "expected ':' after case value");
            self.emit_op(OpCode::Eq);
            let case_jump = self.emit_jump(OpCode::BranchFalse);
            self.emit_op(OpCode::Pop);

            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
            {
                self.declaration(heap);
            }
            end_jumps.push(self.emit_jump(OpCode::Branch));
            next_case_jump = Some(case_jump);
        }

        if let Some(jump) = next_case_jump.take() {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }

        if self.match_token(TokenKind::Default) {
            self.consume(TokenKind::Colon, "expected ':' after 'default'");
            while !self.check(TokenKind::RightBrace) {
                self.declaration(heap);
            }
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "expected '}' after switch body");
        self.end_scope(); // pops the synthetic scrutinee local
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("cannot return from top-level code");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("cannot return a value from an initializer");
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

}

impl GcRoots for Compiler<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for f in &self.functions {
            if let Some(name) = f.function.name {
                heap.mark_object(name);
            }
            for constant in &f.function.chunk.constants {
                heap.mark_value(*constant);
            }
        }
    }
}

/// Compile `source` into a top-level function. On success, the returned
/// [`ObjRef`] names an already heap-allocated `Function` (arity 0, no
/// upvalues) whose chunk is the whole program; the caller (the VM) wraps
/// it in a `Closure` before calling it, per spec.md §2's data-flow summary.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source);
    compiler.advance();

    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "expected end of expression");

    compiler.emit_return();
    if compiler.had_error {
        return Err(compiler.errors);
    }

    // Same ordering concern as `end_function`: check while the script
    // function is still in `compiler.functions` so its constants stay rooted.
    collect_if_needed(heap, &compiler);
    let state = compiler.functions.pop().expect("script function state");
    Ok(heap.alloc_function(state.function))
}
