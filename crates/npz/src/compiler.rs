use std::rc::Rc;

use crate::{
    bytecode::{Chunk, JumpLabel, Opcode},
    error::{CompileError, Diagnostic},
    heap::{HeapData, HeapId},
    object::{DefaultMethod, Function},
    scanner::{Scanner, Token, TokenKind},
    value::Value,
    vm::Vm,
};

/// Local slots addressable with a one-byte operand.
const MAX_LOCALS: usize = 256;
/// Upvalue descriptors per function.
const MAX_UPVALUES: usize = 256;
/// Pending break jumps per function.
const MAX_BREAKS: usize = 256;
/// Call arguments (and function parameters).
const MAX_ARGS: u32 = 255;

/// Compiles a source buffer into a top-level script function.
///
/// `script_name` names the resulting function (used as the key in the
/// imported-files table); `None` leaves it anonymous (`<script>`).
/// The caller must root the returned function before allocating further.
pub(crate) fn compile(vm: &mut Vm<'_>, source: &str, script_name: Option<&str>) -> Result<HeapId, CompileError> {
    let name = script_name.map(|n| vm.heap.intern(n));
    let mut compiler = Compiler::new(vm, source, name);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_frame();
    if compiler.had_error {
        Err(CompileError {
            diagnostics: compiler.diagnostics,
        })
    } else {
        Ok(function)
    }
}

/// Expression precedence levels, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // ||
    And,        // &&
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

/// What kind of function a compiler frame is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Builder,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet defined.
    depth: i32,
    /// Loop nesting level at declaration; drives break/continue pops.
    loop_depth: u32,
    constant: bool,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy)]
struct LoopPoint {
    /// Bytecode offset `continue` loops back to.
    offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct BreakPoint {
    label: JumpLabel,
    loop_depth: u32,
}

/// Per-function compilation state.
#[derive(Debug)]
struct FrameCompiler<'src> {
    kind: FunctionKind,
    name: Option<HeapId>,
    arity: u32,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopPoint>,
    breaks: Vec<BreakPoint>,
    scope_depth: i32,
    loop_depth: u32,
}

impl<'src> FrameCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<HeapId>) -> Self {
        // Slot 0 is reserved: the receiver for methods and builders,
        // anonymous otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Builder) {
                "this"
            } else {
                ""
            },
            depth: 0,
            loop_depth: 0,
            constant: false,
            captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            loops: Vec::new(),
            breaks: Vec::new(),
            scope_depth: 0,
            loop_depth: 0,
        }
    }
}

#[derive(Debug)]
struct ClassCompiler {
    has_superclass: bool,
}

type ParseFn<'src, 'vm, 'out> = fn(&mut Compiler<'src, 'vm, 'out>, bool);

struct Compiler<'src, 'vm, 'out> {
    vm: &'vm mut Vm<'out>,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    frames: Vec<FrameCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    /// Chunk offset where the left operand of the infix rule currently
    /// running began; lets `.name`/`[index]` re-emit their receiver for
    /// compound assignment.
    infix_lhs_start: usize,
}

impl<'src, 'vm, 'out> Compiler<'src, 'vm, 'out> {
    fn new(vm: &'vm mut Vm<'out>, source: &'src str, script_name: Option<HeapId>) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            vm,
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            frames: vec![FrameCompiler::new(FunctionKind::Script, script_name)],
            classes: Vec::new(),
            infix_lhs_start: 0,
        }
    }

    // ---- error reporting ------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => Some(String::new()),
            TokenKind::Error => None,
            _ => Some(token.lexeme.to_owned()),
        };
        self.diagnostics.push(Diagnostic {
            line: token.line,
            at,
            message: message.to_owned(),
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
                | TokenKind::Fn
                | TokenKind::Var
                | TokenKind::Let
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    // ---- emission -------------------------------------------------------

    fn frame(&self) -> &FrameCompiler<'src> {
        self.frames.last().expect("compiler frame stack empty")
    }

    fn frame_mut(&mut self) -> &mut FrameCompiler<'src> {
        self.frames.last_mut().expect("compiler frame stack empty")
    }

    fn chunk_len(&self) -> usize {
        self.frame().chunk.len()
    }

    fn emit(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.frame_mut().chunk.emit(op, line);
    }

    fn emit_u8(&mut self, op: Opcode, operand: u8) {
        let line = self.previous.line;
        self.frame_mut().chunk.emit_u8(op, operand, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.frame_mut().chunk.push_byte(byte, line);
    }

    fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let line = self.previous.line;
        self.frame_mut().chunk.emit_jump(op, line)
    }

    fn patch_jump(&mut self, label: JumpLabel) {
        if !self.frame_mut().chunk.patch_jump(label) {
            self.error("Compiler does not support jumps of this distance.");
        }
    }

    fn emit_loop(&mut self, target: usize) {
        let line = self.previous.line;
        if !self.frame_mut().chunk.emit_loop(target, line) {
            self.error("Compiler does not support loops of this size.");
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        if !self.frame_mut().chunk.emit_constant(value, line) {
            self.error("Compiler does not support this many constants.");
        }
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Builder {
            self.emit_u8(Opcode::GetLocal, 0);
        } else {
            self.emit(Opcode::Null);
        }
        self.emit(Opcode::Return);
    }

    /// Re-emits an already-compiled code range (receiver duplication for
    /// compound property/index assignment). The range must be free of jumps,
    /// which holds for any postfix-chain left operand.
    fn duplicate_code(&mut self, from: usize, to: usize) {
        let line = self.previous.line;
        let frame = self.frame_mut();
        let bytes = frame.chunk.code()[from..to].to_vec();
        for byte in bytes {
            frame.chunk.push_byte(byte, line);
        }
    }

    /// Finishes the current frame: emits the implicit return and turns the
    /// accumulated state into a heap-allocated function object.
    fn end_frame(&mut self) -> (HeapId, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self.frames.pop().expect("compiler frame stack empty");
        let function = Function {
            arity: frame.arity.min(MAX_ARGS) as u8,
            upvalue_count: frame.upvalues.len() as u8,
            name: frame.name,
            chunk: Rc::new(frame.chunk),
        };
        let id = self.vm.heap.alloc(HeapData::Function(function));
        (id, frame.upvalues)
    }

    /// Runs a collection if allocation pressure demands one, marking the
    /// VM roots plus every in-progress function's constants.
    fn maybe_gc(&mut self) {
        if !self.vm.heap.needs_gc() {
            return;
        }
        self.vm.mark_roots();
        for frame in &self.frames {
            if let Some(name) = frame.name {
                self.vm.heap.mark_object(name);
            }
            for &constant in frame.chunk.constants() {
                self.vm.heap.mark_value(constant);
            }
        }
        self.vm.heap.finish_collect();
    }

    // ---- scope and variable resolution ---------------------------------

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frame_mut();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;

        // Pop the scope's locals top-down, closing captured slots in place.
        // Plain pops batch into PopN runs.
        let mut pending_pops: u8 = 0;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.captured;
            self.frame_mut().locals.pop();
            if captured {
                if pending_pops > 0 {
                    self.emit_u8(Opcode::PopN, pending_pops);
                    pending_pops = 0;
                }
                self.emit(Opcode::CloseUpvalue);
            } else {
                pending_pops += 1;
            }
        }
        self.emit_u8(Opcode::PopN, pending_pops);
    }

    fn identifier_constant(&mut self, token: Token<'src>) -> u8 {
        let id = self.vm.heap.intern(token.lexeme);
        let idx = self.frame_mut().chunk.add_constant(Value::Obj(id));
        if idx > u8::MAX as usize {
            self.error("Compiler does not support this many names in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn add_local(&mut self, token: Token<'src>, constant: bool) {
        if self.frame().locals.len() == MAX_LOCALS {
            self.error("Maximum local variable count exceeded.");
            return;
        }
        let loop_depth = self.frame().loop_depth;
        self.frame_mut().locals.push(Local {
            name: token.lexeme,
            depth: -1,
            loop_depth,
            constant,
            captured: false,
        });
    }

    fn declare_variable(&mut self, constant: bool) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let scope = self.frame().scope_depth;
        let mut duplicate = false;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("A variable of the given name already exists in the current scope.");
        }
        self.add_local(name, constant);
    }

    fn parse_variable(&mut self, message: &str, constant: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(constant);
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_u8(Opcode::DefineGlobal, global);
    }

    fn resolve_local_in(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let mut incomplete = false;
        let mut found = None;
        for (i, local) in self.frames[frame_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    incomplete = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if incomplete {
            self.error("Definition of local variable is incomplete.");
        }
        found
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.frames[frame_idx].upvalues.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        if self.frames[frame_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Compiler does not support this many closure variables.");
            return 0;
        }
        self.frames[frame_idx].upvalues.push(desc);
        (self.frames[frame_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local) = self.resolve_local_in(enclosing, name) {
            self.frames[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(frame_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, upvalue, false));
        }
        None
    }

    // ---- declarations ---------------------------------------------------

    fn declaration(&mut self) {
        self.maybe_gc();

        if self.match_token(TokenKind::Var) || self.match_token(TokenKind::Let) || self.match_token(TokenKind::Const) {
            let constant = self.previous.kind == TokenKind::Const;
            self.var_declaration(constant);
        } else if self.match_token(TokenKind::Fn) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, constant: bool) {
        let global = self.parse_variable("Expected variable identifier.", constant);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Opcode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.", false);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = if kind == FunctionKind::Script {
            None
        } else {
            Some(self.vm.heap.intern(self.previous.lexeme))
        };
        self.frames.push(FrameCompiler::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' before function arguments.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.frame_mut().arity += 1;
                if self.frame().arity > MAX_ARGS {
                    self.error_at_current("Compiler does not support over 255 arguments.");
                }
                let constant = self.match_token(TokenKind::Const);
                let idx = self.parse_variable("Expected argument identifier.", constant);
                self.define_variable(idx);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after function arguments.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_frame();
        self.emit(Opcode::Closure);
        self.emit_constant(Value::Obj(function));
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected identifier after 'class'.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable(true);

        self.emit_u8(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler { has_superclass: false });

        if self.match_token(TokenKind::LeftArrow) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            let super_token = self.previous;
            self.named_variable(super_token, false);

            if class_name.lexeme == super_token.lexeme {
                self.error("Class cannot inherit from itself.");
            }

            self.begin_scope();
            self.add_local(synthetic_token("super"), true);
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(Opcode::Inherit);
            self.classes.last_mut().expect("class stack empty").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' after class name.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit(Opcode::Pop);

        let class = self.classes.pop().expect("class stack empty");
        if class.has_superclass {
            self.end_scope();
        }
    }

    fn class_member(&mut self) {
        if self.match_token(TokenKind::Fn) {
            self.method(false);
        } else if self.match_token(TokenKind::Build) {
            self.builder();
        } else if self.match_token(TokenKind::Def) {
            self.default_method();
        } else if self.match_token(TokenKind::Static) {
            if self.match_token(TokenKind::Fn) {
                self.method(true);
            } else {
                self.attribute(true, false);
            }
        } else if self.match_token(TokenKind::Const) {
            self.attribute(false, true);
        } else if self.check(TokenKind::Var) || self.check(TokenKind::Let) {
            self.attribute(false, false);
        } else {
            self.advance();
            self.error("Expected field, method, or constructor.");
        }
    }

    fn method(&mut self, is_static: bool) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name = self.identifier_constant(self.previous);
        self.function(FunctionKind::Method);
        self.emit_u8(Opcode::Method, 0);
        self.emit_byte(name);
        self.emit_byte(1); // methods are public
        self.emit_byte(u8::from(is_static));
    }

    fn builder(&mut self) {
        self.function(FunctionKind::Builder);
        self.emit_u8(Opcode::Method, 1);
    }

    fn default_method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected default method name.");
        let slot = match DefaultMethod::from_ident(self.previous.lexeme) {
            Some(slot) => slot,
            None => {
                self.error("Unknown default method.");
                DefaultMethod::String
            }
        };
        self.function(FunctionKind::Method);
        self.emit_u8(Opcode::Method, 2);
        self.emit_byte(slot as u8);
    }

    /// Parses `[static] [const] (var|let) name [= expr];` inside a class
    /// body. `var` declares a public field, `let` a private one.
    fn attribute(&mut self, is_static: bool, is_constant: bool) {
        let mut is_static = is_static;
        let mut is_constant = is_constant;
        loop {
            if self.match_token(TokenKind::Static) {
                is_static = true;
            } else if self.match_token(TokenKind::Const) {
                is_constant = true;
            } else {
                break;
            }
        }

        let is_public = if self.match_token(TokenKind::Var) {
            true
        } else if self.match_token(TokenKind::Let) {
            false
        } else {
            self.error_at_current("Expected 'var' or 'let' in field declaration.");
            return;
        };

        self.consume(TokenKind::Identifier, "Expected field name.");
        let name = self.identifier_constant(self.previous);

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Opcode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after field declaration.");

        self.emit_u8(Opcode::Attribute, name);
        self.emit_byte(u8::from(is_constant));
        self.emit_byte(u8::from(is_public));
        self.emit_byte(u8::from(is_static));
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after statement.");
        self.emit(Opcode::Pop);
    }

    fn return_statement(&mut self) {
        if self.frame().kind == FunctionKind::Script {
            self.error("Cannot return from outside of a function.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Builder {
                self.error("Cannot return a value from a builder.");
                return;
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
            self.emit(Opcode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' before condition.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();

        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit(Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn begin_loop(&mut self) {
        let offset = self.chunk_len();
        let frame = self.frame_mut();
        frame.loops.push(LoopPoint { offset });
        frame.loop_depth += 1;
    }

    fn end_loop(&mut self) {
        let frame = self.frame_mut();
        frame.loop_depth -= 1;
        frame.loops.pop();
        let depth = frame.loop_depth;
        while let Some(break_point) = self.frame().breaks.last().copied() {
            if break_point.loop_depth <= depth {
                break;
            }
            self.frame_mut().breaks.pop();
            self.patch_jump(break_point.label);
        }
    }

    /// Number of locals declared at or inside the innermost loop; break and
    /// continue pop exactly these before transferring control.
    fn loop_local_count(&self) -> u8 {
        let frame = self.frame();
        let mut n: u8 = 0;
        for local in frame.locals.iter().rev() {
            if local.loop_depth < frame.loop_depth {
                break;
            }
            n += 1;
        }
        n
    }

    fn while_statement(&mut self) {
        self.begin_loop();
        let loop_start = self.chunk_len();

        self.consume(TokenKind::LeftParen, "Expected '(' before condition.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' before loop clauses.");

        if self.match_token(TokenKind::Var) || self.match_token(TokenKind::Let) {
            self.var_declaration(false);
        } else if !self.match_token(TokenKind::Semicolon) {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after condition clause.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit(Opcode::Pop);
        }

        if self.match_token(TokenKind::RightParen) {
            self.begin_loop();
        } else {
            // The increment runs after the body: jump over it now, loop back
            // to it from the body's end.
            let body_jump = self.emit_jump(Opcode::Jump);
            self.begin_loop();
            let increment_start = self.chunk_len();

            self.expression();
            self.emit(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after loop clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Opcode::Pop);
        }

        self.end_loop();
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.frame().breaks.len() == MAX_BREAKS {
            self.error("Compiler does not support this many break statements in one context.");
        }
        if self.frame().loop_depth == 0 {
            self.error("Cannot break out of non-loop context.");
            return;
        }

        let n = self.loop_local_count();
        self.emit_u8(Opcode::PopN, n);

        let label = self.emit_jump(Opcode::Jump);
        let loop_depth = self.frame().loop_depth;
        self.frame_mut().breaks.push(BreakPoint { label, loop_depth });

        self.consume(TokenKind::Semicolon, "Expected ';' after break.");
    }

    fn continue_statement(&mut self) {
        if self.frame().loop_depth == 0 {
            self.error("Cannot continue out of non-loop context.");
            return;
        }

        let n = self.loop_local_count();
        self.emit_u8(Opcode::PopN, n);

        let target = self.frame().loops.last().expect("loop stack empty").offset;
        self.emit_loop(target);

        self.consume(TokenKind::Semicolon, "Expected ';' after continue.");
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).0 else {
            self.error("Expected expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        let operand_start = self.chunk_len();
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).2 {
            self.advance();
            let infix = rule(self.previous.kind).1.expect("infix rule missing for token");
            self.infix_lhs_start = operand_start;
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Cannot perform assignment here.");
        }
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let top = self.frames.len() - 1;
        let (get_op, set_op, arg, const_local);
        if let Some(slot) = self.resolve_local_in(top, token.lexeme) {
            get_op = Opcode::GetLocal;
            set_op = Opcode::SetLocal;
            arg = slot;
            const_local = self.frame().locals[slot as usize].constant;
        } else if let Some(slot) = self.resolve_upvalue(top, token.lexeme) {
            get_op = Opcode::GetUpvalue;
            set_op = Opcode::SetUpvalue;
            arg = slot;
            const_local = false;
        } else {
            get_op = Opcode::GetGlobal;
            set_op = Opcode::SetGlobal;
            arg = self.identifier_constant(token);
            const_local = false;
        }

        let assignment = if can_assign { self.match_assignment() } else { None };
        let Some(assignment) = assignment else {
            self.emit_u8(get_op, arg);
            return;
        };

        if const_local {
            self.error("Variable is constant and cannot be modified.");
            return;
        }

        if assignment != TokenKind::Equal {
            self.emit_u8(get_op, arg);
        }
        self.expression();
        self.emit_compound_op(assignment);
        self.emit_u8(set_op, arg);
    }

    fn match_assignment(&mut self) -> Option<TokenKind> {
        for kind in [
            TokenKind::Equal,
            TokenKind::PlusEqual,
            TokenKind::MinusEqual,
            TokenKind::StarEqual,
            TokenKind::SlashEqual,
        ] {
            if self.match_token(kind) {
                return Some(kind);
            }
        }
        None
    }

    fn emit_compound_op(&mut self, assignment: TokenKind) {
        match assignment {
            TokenKind::PlusEqual => self.emit(Opcode::Add),
            TokenKind::MinusEqual => self.emit(Opcode::Subtract),
            TokenKind::StarEqual => self.emit(Opcode::Multiply),
            TokenKind::SlashEqual => self.emit(Opcode::Divide),
            TokenKind::Equal => {}
            _ => self.error("Unhandled assignment token."),
        }
    }

    fn argument_list(&mut self) -> u8 {
        self.value_list(TokenKind::RightParen, "Expected ')' after arguments.")
    }

    fn value_list(&mut self, closing: TokenKind, message: &str) -> u8 {
        let mut count: u32 = 0;
        if !self.check(closing) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Compiler does not support over 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(closing, message);
        count.min(MAX_ARGS) as u8
    }

    /// Translates the backslash escapes of a string literal.
    fn translate_escapes(lexeme: &str) -> String {
        let inner = &lexeme.as_bytes()[1..lexeme.len() - 1];
        let mut out = Vec::with_capacity(inner.len());
        let mut i = 0;
        while i < inner.len() {
            let byte = inner[i];
            if byte != b'\\' || i + 1 >= inner.len() {
                out.push(byte);
                i += 1;
                continue;
            }
            i += 1;
            let escaped = inner[i];
            out.push(match escaped {
                b'n' => b'\n',
                b't' => b'\t',
                b'b' => 0x08,
                b'r' => b'\r',
                b'a' => 0x07,
                b'?' => b'?',
                b'f' => 0x0c,
                b'v' => 0x0b,
                b'0' => 0x00,
                other => other,
            });
            i += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

fn synthetic_token(text: &'static str) -> Token<'static> {
    Token {
        kind: TokenKind::Identifier,
        lexeme: text,
        line: 0,
    }
}

// ---- Pratt rules --------------------------------------------------------

/// Prefix rule, infix rule, and infix precedence for a token.
fn rule<'src, 'vm, 'out>(
    kind: TokenKind,
) -> (
    Option<ParseFn<'src, 'vm, 'out>>,
    Option<ParseFn<'src, 'vm, 'out>>,
    Precedence,
) {
    match kind {
        TokenKind::LeftParen => (Some(grouping), Some(call), Precedence::Call),
        TokenKind::Dot => (None, Some(dot), Precedence::Call),
        TokenKind::LeftBracket => (Some(list), Some(index), Precedence::Call),
        TokenKind::Minus => (Some(unary), Some(binary), Precedence::Term),
        TokenKind::Plus => (None, Some(binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => (None, Some(binary), Precedence::Factor),
        TokenKind::Bang => (Some(unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => (None, Some(binary), Precedence::Equality),
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            (None, Some(binary), Precedence::Comparison)
        }
        TokenKind::And => (None, Some(and_), Precedence::And),
        TokenKind::Or => (None, Some(or_), Precedence::Or),
        TokenKind::Identifier => (Some(variable), None, Precedence::None),
        TokenKind::String => (Some(string), None, Precedence::None),
        TokenKind::Number => (Some(number), None, Precedence::None),
        TokenKind::False | TokenKind::True | TokenKind::Null => (Some(literal), None, Precedence::None),
        TokenKind::Import => (Some(import_), None, Precedence::None),
        TokenKind::Super => (Some(super_), None, Precedence::None),
        TokenKind::This => (Some(this_), None, Precedence::None),
        TokenKind::Unpack => (Some(unary), None, Precedence::None),
        TokenKind::New => (Some(new_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    }
}

fn grouping(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expected ')' after expression.");
}

fn call(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let argc = c.argument_list();
    c.emit_u8(Opcode::Call, argc);
}

fn dot(c: &mut Compiler<'_, '_, '_>, can_assign: bool) {
    let receiver_start = c.infix_lhs_start;
    let receiver_end = c.chunk_len();
    c.consume(TokenKind::Identifier, "Expected property name after '.'.");
    let name = c.identifier_constant(c.previous);

    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit_u8(Opcode::SetProperty, name);
        return;
    }
    if can_assign {
        if let Some(assignment) = c.match_assignment() {
            // stack: [recv] -> [recv, recv] -> get -> [recv, old] ->
            // rhs, op -> [recv, new] -> set -> [new]
            c.duplicate_code(receiver_start, receiver_end);
            c.emit_u8(Opcode::GetProperty, name);
            c.expression();
            c.emit_compound_op(assignment);
            c.emit_u8(Opcode::SetProperty, name);
            return;
        }
    }
    if c.match_token(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.emit_u8(Opcode::Invoke, name);
        c.emit_byte(argc);
    } else {
        c.emit_u8(Opcode::GetProperty, name);
    }
}

fn index(c: &mut Compiler<'_, '_, '_>, can_assign: bool) {
    let container_start = c.infix_lhs_start;
    c.expression();
    c.consume(TokenKind::RightBracket, "Expected ']' after index.");
    let index_end = c.chunk_len();

    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit(Opcode::SetIndex);
        return;
    }
    if can_assign {
        if let Some(assignment) = c.match_assignment() {
            // stack: [c, i] -> [c, i, c, i] -> get -> [c, i, old] ->
            // rhs, op -> [c, i, new] -> set -> [new]
            c.duplicate_code(container_start, index_end);
            c.emit(Opcode::GetIndex);
            c.expression();
            c.emit_compound_op(assignment);
            c.emit(Opcode::SetIndex);
            return;
        }
    }
    c.emit(Opcode::GetIndex);
}

fn unary(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let op = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match op {
        TokenKind::Minus => c.emit(Opcode::Negate),
        TokenKind::Bang => c.emit(Opcode::Not),
        TokenKind::Unpack => {
            // Unpack consumes the namespace; the trailing Null keeps the
            // unary expression value-producing.
            c.emit(Opcode::Unpack);
            c.emit(Opcode::Null);
        }
        _ => c.error("Unhandled unary operator."),
    }
}

fn binary(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let op = c.previous.kind;
    let precedence = rule(op).2;
    c.parse_precedence(precedence.next());

    match op {
        TokenKind::Plus => c.emit(Opcode::Add),
        TokenKind::Minus => c.emit(Opcode::Subtract),
        TokenKind::Star => c.emit(Opcode::Multiply),
        TokenKind::Slash => c.emit(Opcode::Divide),
        TokenKind::BangEqual => c.emit(Opcode::NotEqual),
        TokenKind::EqualEqual => c.emit(Opcode::Equal),
        TokenKind::Greater => c.emit(Opcode::Greater),
        TokenKind::GreaterEqual => c.emit(Opcode::GreaterEqual),
        TokenKind::Less => c.emit(Opcode::Less),
        TokenKind::LessEqual => c.emit(Opcode::LessEqual),
        _ => c.error("Unhandled binary operator."),
    }
}

fn and_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let and_jump = c.emit_jump(Opcode::JumpIfFalse);
    c.emit(Opcode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(and_jump);
}

fn or_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let or_jump = c.emit_jump(Opcode::JumpIfTrue);
    c.emit(Opcode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(or_jump);
}

fn variable(c: &mut Compiler<'_, '_, '_>, can_assign: bool) {
    c.named_variable(c.previous, can_assign);
}

fn string(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let text = Compiler::translate_escapes(c.previous.lexeme);
    let id = c.vm.heap.intern_owned(text);
    c.emit_constant(Value::Obj(id));
}

fn number(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let value: f64 = c.previous.lexeme.parse().unwrap_or(0.0);
    c.emit_constant(Value::Number(value));
}

fn literal(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit(Opcode::False),
        TokenKind::True => c.emit(Opcode::True),
        TokenKind::Null => c.emit(Opcode::Null),
        _ => c.error("Unhandled literal."),
    }
}

fn list(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    let count = c.value_list(TokenKind::RightBracket, "Expected ']' after list.");
    c.emit_u8(Opcode::MakeList, count);
}

fn import_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    if c.match_token(TokenKind::String) {
        // File import: evaluate the file name, then splice in its namespace.
        let text = Compiler::translate_escapes(c.previous.lexeme);
        let id = c.vm.heap.intern_owned(text);
        c.emit_constant(Value::Obj(id));
        c.emit(Opcode::ImportFile);
        return;
    }
    c.consume(TokenKind::Identifier, "Expected library name after 'import'.");
    let name = c.identifier_constant(c.previous);
    c.emit_u8(Opcode::Import, name);
}

fn super_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Cannot use 'super' outside of a class context.");
    } else if !c.classes.last().is_some_and(|cls| cls.has_superclass) {
        c.error("Cannot use 'super' outside of a subclass context.");
    }

    c.consume(TokenKind::Dot, "Expected '.' after super.");
    c.consume(TokenKind::Identifier, "Expected superclass method name.");
    let name = c.identifier_constant(c.previous);

    c.named_variable(synthetic_token("this"), false);
    if c.match_token(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.named_variable(synthetic_token("super"), false);
        c.emit_u8(Opcode::SuperInvoke, name);
        c.emit_byte(argc);
    } else {
        c.named_variable(synthetic_token("super"), false);
        c.emit_u8(Opcode::GetSuper, name);
    }
}

fn this_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("'this' cannot be used outside of a class.");
        return;
    }
    variable(c, false);
}

fn new_(c: &mut Compiler<'_, '_, '_>, _can_assign: bool) {
    // `new C(args)` and `C(args)` compile identically; constructing is what
    // calling a class does. Parse at call precedence so the call is included.
    c.parse_precedence(Precedence::Call);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::NoPrint;

    fn compile_ok(source: &str) -> bool {
        let mut writer = NoPrint;
        let mut vm = Vm::new(&mut writer);
        vm.compile_source(source, None).is_ok()
    }

    fn compile_err(source: &str) -> CompileError {
        let mut writer = NoPrint;
        let mut vm = Vm::new(&mut writer);
        vm.compile_source(source, None).unwrap_err()
    }

    #[test]
    fn simple_programs_compile() {
        assert!(compile_ok("var x = 1 + 2 * 3;"));
        assert!(compile_ok("fn f(a, b) { return a + b; } f(1, 2);"));
        assert!(compile_ok("class A { build(x) { this.x = x; } fn get() { return this.x; } }"));
        assert!(compile_ok("class B <- A { fn get() { return super.get() + 1; } }"));
        assert!(compile_ok("for (var i = 0; i < 3; i = i + 1) { if (i == 1) continue; }"));
        assert!(compile_ok("var xs = [1, 2, 3]; xs[0] = 4; xs[1] += 1;"));
        assert!(compile_ok("class C { static const var version = 1; let hidden; var open = 2; }"));
        assert!(compile_ok("class D { def string() { return \"d\"; } def eq(other) { return true; } }"));
        assert!(compile_ok("var n = new Thing(1);"));
        assert!(compile_ok("import std; std.println(1);"));
        assert!(compile_ok("unpack import std;"));
    }

    #[test]
    fn escape_translation() {
        assert_eq!(Compiler::translate_escapes("\"a\\nb\""), "a\nb");
        assert_eq!(Compiler::translate_escapes("\"a\\tb\""), "a\tb");
        assert_eq!(Compiler::translate_escapes("\"\\q\""), "q");
        assert_eq!(Compiler::translate_escapes("\"\\\\\""), "\\");
    }

    #[test]
    fn assignment_target_validation() {
        let err = compile_err("1 + 2 = 3;");
        assert!(err.diagnostics[0].message.contains("assignment"));
    }

    #[test]
    fn const_local_cannot_be_assigned() {
        let err = compile_err("{ const x = 1; x = 2; }");
        assert!(err.diagnostics[0].message.contains("constant"));
    }

    #[test]
    fn duplicate_local_rejected() {
        let err = compile_err("{ var x = 1; var x = 2; }");
        assert!(err.diagnostics[0].message.contains("already exists"));
    }

    #[test]
    fn reading_local_in_own_initializer_fails() {
        let err = compile_err("{ var a = a; }");
        assert!(err.diagnostics[0].message.contains("incomplete"));
    }

    #[test]
    fn break_outside_loop_fails() {
        let err = compile_err("break;");
        assert!(err.diagnostics[0].message.contains("non-loop"));
    }

    #[test]
    fn return_at_top_level_fails() {
        let err = compile_err("return 1;");
        assert!(err.diagnostics[0].message.contains("outside of a function"));
    }

    #[test]
    fn builder_cannot_return_value() {
        let err = compile_err("class A { build() { return 1; } }");
        assert!(err.diagnostics[0].message.contains("builder"));
    }

    #[test]
    fn class_cannot_inherit_itself() {
        let err = compile_err("class A <- A {}");
        assert!(err.diagnostics[0].message.contains("inherit"));
    }

    #[test]
    fn error_recovery_reports_multiple_diagnostics() {
        let err = compile_err("var = 1; var y 2;");
        assert!(err.diagnostics.len() >= 2);
    }
}
