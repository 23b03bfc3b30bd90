//! Recursive-descent, precedence-climbing parser that emits bytecode
//! directly against a live [`Vm`] — there is no separate AST pass.
//! Grounded on the reference implementation's single-pass `parser.c`
//! reshaped around this crate's [`opcode`] word format.

use std::collections::HashMap;
use std::rc::Rc;

use crate::chunk::{Chunk, Func, UpvalDesc};
use crate::error::{Error, Result};
use crate::gc::Object;
use crate::lexer::{Lexer, Pos, Token};
use crate::opcode::{self, test_mode, Opcode};
use crate::value::{Handle, Value};
use crate::vm::Vm;

struct LoopInfo {
    /// Known up front for `while`/infinite `for`/`for-in`, where the
    /// continue point precedes the loop body. Numeric `for` only knows
    /// its continue point (the increment/test step) after the body has
    /// been compiled, so it leaves this `None` and patches
    /// `continue_jumps` afterward instead.
    continue_target: Option<usize>,
    continue_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
}

struct FuncEnv {
    file: String,
    name: String,
    code: Vec<u32>,
    lines: Vec<i32>,
    constants: Vec<Value>,
    const_ints: HashMap<i64, u16>,
    const_floats: HashMap<u64, u16>,
    const_strs: HashMap<String, u16>,
    locals: Vec<(String, u16)>,
    scope_marks: Vec<usize>,
    max_locals: u16,
    upval_names: Vec<String>,
    upval_desc: Vec<UpvalDesc>,
    loop_stack: Vec<LoopInfo>,
    n_params: u8,
}

impl FuncEnv {
    fn new(file: &str, name: &str) -> FuncEnv {
        FuncEnv {
            file: file.to_owned(),
            name: name.to_owned(),
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            const_ints: HashMap::new(),
            const_floats: HashMap::new(),
            const_strs: HashMap::new(),
            locals: Vec::new(),
            scope_marks: Vec::new(),
            max_locals: 0,
            upval_names: Vec::new(),
            upval_desc: Vec::new(),
            loop_stack: Vec::new(),
            n_params: 0,
        }
    }

    fn emit(&mut self, op: Opcode, flag: u8, param: u16, line: i32) -> usize {
        self.code.push(opcode::build(op, flag, param));
        self.lines.push(line);
        self.code.len() - 1
    }

    fn emit_word(&mut self, word: u32, line: i32) -> usize {
        self.code.push(word);
        self.lines.push(line);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, pos: usize, target: usize) {
        let word = self.code[pos];
        let op = Opcode::from_u8(opcode::asm_op(word)).expect("patched word decodes");
        let flag = opcode::asm_flag(word);
        self.code[pos] = opcode::build(op, flag, target as u16);
    }

    fn add_local(&mut self, name: &str) -> u16 {
        let slot = self.locals.len() as u16;
        self.locals.push((name.to_owned(), slot));
        if self.locals.len() as u16 > self.max_locals {
            self.max_locals = self.locals.len() as u16;
        }
        slot
    }

    fn find_local(&self, name: &str) -> Option<u16> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, s)| *s)
    }

    fn enter_scope(&mut self) {
        self.scope_marks.push(self.locals.len());
    }

    fn leave_scope(&mut self) {
        let mark = self.scope_marks.pop().expect("balanced scopes");
        self.locals.truncate(mark);
    }

    fn find_upvalue(&self, name: &str) -> Option<u16> {
        self.upval_names.iter().position(|n| n == name).map(|i| i as u16)
    }

    fn add_upvalue(&mut self, name: &str, desc: UpvalDesc) -> u16 {
        if let Some(i) = self.find_upvalue(name) {
            return i;
        }
        self.upval_names.push(name.to_owned());
        self.upval_desc.push(desc);
        (self.upval_names.len() - 1) as u16
    }

    fn const_int(&mut self, v: i64) -> u16 {
        if let Some(&i) = self.const_ints.get(&v) {
            return i;
        }
        let i = self.constants.len() as u16;
        self.constants.push(Value::Int(v));
        self.const_ints.insert(v, i);
        i
    }

    fn const_float(&mut self, v: f64) -> u16 {
        let bits = v.to_bits();
        if let Some(&i) = self.const_floats.get(&bits) {
            return i;
        }
        let i = self.constants.len() as u16;
        self.constants.push(Value::Float(v));
        self.const_floats.insert(bits, i);
        i
    }

    /// Takes an already-interned handle so callers can intern against
    /// `Vm` and index into this env's constant table as two separate
    /// borrows of `Parser`, rather than needing both at once.
    fn const_str_handle(&mut self, h: Handle, s: &str) -> u16 {
        if let Some(&i) = self.const_strs.get(s) {
            return i;
        }
        let i = self.constants.len() as u16;
        self.constants.push(Value::Ref(h));
        self.const_strs.insert(s.to_owned(), i);
        i
    }

    fn push_raw_const(&mut self, v: Value) -> u16 {
        let i = self.constants.len() as u16;
        self.constants.push(v);
        i
    }

    fn build_chunk(self) -> Chunk {
        Chunk {
            file: self.file,
            name: self.name,
            code: self.code,
            lines: self.lines,
            constants: self.constants,
            upval_desc: self.upval_desc,
            n_params: self.n_params,
            vargs: false,
            max_locals: self.max_locals,
        }
    }
}

enum Resolved {
    Local(u16),
    Upvalue(u16),
}

/// Resolves `name` against `envs[level]`, capturing it as a transitive
/// upvalue through as many enclosing functions as needed. Each
/// recursive step only needs a disjoint borrow window over the slice,
/// since the mutation of `envs[level]` happens strictly after the
/// recursive call into `envs[level - 1]` has returned.
fn resolve(envs: &mut [FuncEnv], level: usize, name: &str) -> Option<Resolved> {
    if let Some(slot) = envs[level].find_local(name) {
        return Some(Resolved::Local(slot));
    }
    if let Some(idx) = envs[level].find_upvalue(name) {
        return Some(Resolved::Upvalue(idx));
    }
    if level == 0 {
        return None;
    }
    match resolve(envs, level - 1, name) {
        Some(Resolved::Local(slot)) => {
            let idx = envs[level].add_upvalue(name, UpvalDesc::ParentLocal(slot));
            Some(Resolved::Upvalue(idx))
        }
        Some(Resolved::Upvalue(pidx)) => {
            let idx = envs[level].add_upvalue(name, UpvalDesc::ParentUpval(pidx));
            Some(Resolved::Upvalue(idx))
        }
        None => None,
    }
}

/// Where a compiled statement/expression decided a name lives, used to
/// pick the matching load/store opcode.
enum Place {
    Local(u16),
    Upvalue(u16),
    Global(String),
}

/// Which assignment form followed an lvalue: plain `=`, the `+=`/`-=`
/// compound forms, or the `++`/`--` increment/decrement forms.
#[derive(Clone, Copy)]
enum AssignOp {
    Set,
    AddSet,
    SubSet,
    Inc,
    Dec,
}

pub struct Parser<'vm, 'a> {
    vm: &'vm mut Vm,
    lexer: Lexer<'a>,
    cur: (Token, Pos),
    envs: Vec<FuncEnv>,
    file: String,
}

/// Compiles `source` against `vm`, returning the entry function as a
/// plain callable value. Interned strings and nested function literals
/// are allocated directly into `vm`'s heap as compilation proceeds,
/// which is why compilation needs a live `Vm` rather than working on
/// detached source text. The entry function is rooted with
/// `alloc_fixed` since the host holds it directly rather than through
/// any other live closure.
pub fn compile(vm: &mut Vm, file: &str, source: &str) -> Result<Value> {
    let mut lexer = Lexer::new(file, source);
    let cur = lexer.next()?;
    let mut parser = Parser { vm, lexer, cur, envs: vec![FuncEnv::new(file, "main")], file: file.to_owned() };
    parser.program()?;
    let env = parser.envs.pop().expect("root env");
    let chunk = env.build_chunk();
    let h = parser.vm.gc.alloc_fixed(Object::Func(Func::Script { chunk: Rc::new(chunk), upvalues: Vec::new() }));
    Ok(Value::Ref(h))
}

impl<'vm, 'a> Parser<'vm, 'a> {
    fn env(&mut self) -> &mut FuncEnv {
        self.envs.last_mut().expect("at least one env")
    }

    /// Interns `s` against the heap, then looks it up (or inserts it)
    /// in the current function's constant table. Split into two
    /// sequential borrows of `self` (`self.vm` then `self.env()`)
    /// rather than one call needing both at once.
    fn const_str_idx(&mut self, s: &str) -> u16 {
        let h = self.vm.intern(s);
        self.env().const_str_handle(h, s)
    }

    fn line(&self) -> i32 {
        self.cur.1.line
    }

    fn bump(&mut self) -> Result<Token> {
        let (tok, _) = std::mem::replace(&mut self.cur, self.lexer.next()?);
        Ok(tok)
    }

    fn check(&self, t: &Token) -> bool {
        &self.cur.0 == t
    }

    fn accept(&mut self, t: &Token) -> Result<bool> {
        if self.check(t) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, t: &Token) -> Result<()> {
        if self.check(t) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("expected {:?}, found {:?}", t, self.cur.0)))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.bump()? {
            Token::Id(name) => Ok(name),
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::Parse { file: self.file.clone(), line: self.cur.1.line, message: message.into() }
    }

    // ---- name resolution ---------------------------------------------------

    fn load_name(&mut self, name: &str) -> Result<()> {
        let level = self.envs.len() - 1;
        match resolve(&mut self.envs, level, name) {
            Some(Resolved::Local(slot)) => {
                let line = self.line();
                self.env().emit(Opcode::LoadLocal, 0, slot, line);
            }
            Some(Resolved::Upvalue(idx)) => {
                let line = self.line();
                self.env().emit(Opcode::LoadUpval, 0, idx, line);
            }
            None => {
                let line = self.line();
                let idx = self.const_str_idx(name);
                self.env().emit(Opcode::LoadGlobal, 0, idx, line);
            }
        }
        Ok(())
    }

    fn place_of(&mut self, name: &str) -> Place {
        let level = self.envs.len() - 1;
        match resolve(&mut self.envs, level, name) {
            Some(Resolved::Local(slot)) => Place::Local(slot),
            Some(Resolved::Upvalue(idx)) => Place::Upvalue(idx),
            None => Place::Global(name.to_owned()),
        }
    }

    fn store_place(&mut self, place: Place) {
        let line = self.line();
        match place {
            Place::Local(slot) => {
                self.env().emit(Opcode::StoreLocal, 0, slot, line);
            }
            Place::Upvalue(idx) => {
                self.env().emit(Opcode::StoreUpval, 0, idx, line);
            }
            Place::Global(name) => {
                let idx = self.const_str_idx(&name);
                self.env().emit(Opcode::StoreGlobal, 0, idx, line);
            }
        }
    }

    // ---- assignment ---------------------------------------------------------

    fn assign_op(&self) -> Option<AssignOp> {
        Some(match self.cur.0 {
            Token::Assign => AssignOp::Set,
            Token::PlusEq => AssignOp::AddSet,
            Token::MinusEq => AssignOp::SubSet,
            Token::PlusPlus => AssignOp::Inc,
            Token::MinusMinus => AssignOp::Dec,
            _ => return None,
        })
    }

    /// `name` bound to a plain place (local/upvalue/global), the
    /// assignment operator token still current.
    fn assign_place(&mut self, name: &str, aop: AssignOp) -> Result<()> {
        match aop {
            AssignOp::Set => {
                self.bump()?;
                self.expr(0)?;
            }
            AssignOp::AddSet | AssignOp::SubSet => {
                let tok = self.bump()?;
                self.load_name(name)?;
                self.expr(0)?;
                let line = self.line();
                let op = if matches!(tok, Token::PlusEq) { Opcode::Add } else { Opcode::Sub };
                self.env().emit(op, 0, 0, line);
            }
            AssignOp::Inc | AssignOp::Dec => {
                let tok = self.bump()?;
                self.load_name(name)?;
                let line = self.line();
                let op = if matches!(tok, Token::PlusPlus) { Opcode::Inc } else { Opcode::Dec };
                self.env().emit(op, 0, 0, line);
            }
        }
        let place = self.place_of(name);
        self.store_place(place);
        Ok(())
    }

    /// Trailing `.field`, `[index]`, `(args)` and `:method(args)` chains
    /// following a loaded base value, as in [`Self::suffixes`], except
    /// the *last* field/index segment is held back: if it turns out to
    /// be an assignment target (`=`, `+=`, `-=`, `++`, `--` follows),
    /// this finishes it as a store instead of a load. Otherwise the
    /// chain is a plain expression statement and its result is popped.
    fn assignable_tail(&mut self) -> Result<()> {
        loop {
            match self.cur.0.clone() {
                Token::Dot => {
                    self.bump()?;
                    let field = self.expect_ident()?;
                    let line = self.line();
                    let idx = self.const_str_idx(&field);
                    self.env().emit(Opcode::LoadConst, 0, idx, line);
                    if let Some(aop) = self.assign_op() {
                        return self.finish_field_assign(aop);
                    }
                    self.env().emit(Opcode::GetField, 0, 0, line);
                }
                Token::LBracket => {
                    self.bump()?;
                    self.expr(0)?;
                    self.expect(&Token::RBracket)?;
                    if let Some(aop) = self.assign_op() {
                        return self.finish_field_assign(aop);
                    }
                    let line = self.line();
                    self.env().emit(Opcode::GetField, 0, 0, line);
                }
                Token::LParen => {
                    self.bump()?;
                    let argc = self.arg_list(&Token::RParen)?;
                    self.expect(&Token::RParen)?;
                    let line = self.line();
                    let word = opcode::asm_call(Opcode::Call, argc, 1, 0);
                    self.env().emit_word(word, line);
                }
                Token::Colon => {
                    self.bump()?;
                    let method = self.expect_ident()?;
                    self.expect(&Token::LParen)?;
                    let argc = self.arg_list(&Token::RParen)?;
                    self.expect(&Token::RParen)?;
                    let line = self.line();
                    let midx = self.const_str_idx(&method);
                    let word = opcode::asm_call(Opcode::SelfCall, argc, 1, midx);
                    self.env().emit_word(word, line);
                }
                _ => break,
            }
        }
        if self.assign_op().is_some() {
            return Err(self.err("invalid assignment target"));
        }
        let line = self.line();
        self.env().emit(Opcode::Pop, 0, 1, line);
        Ok(())
    }

    /// Stack is `[container, key]` (container from the chain evaluated
    /// so far, key either a field-name constant or a computed index
    /// expression); the assignment operator token is still current.
    /// Both are stashed into synthetic locals since compound forms need
    /// to address the same slot twice (once to read, once to write).
    fn finish_field_assign(&mut self, aop: AssignOp) -> Result<()> {
        let line = self.line();
        let key_slot = self.env().add_local("#lv_key");
        self.env().emit(Opcode::StoreLocal, 0, key_slot, line);
        let container_slot = self.env().add_local("#lv_container");
        self.env().emit(Opcode::StoreLocal, 0, container_slot, line);

        match aop {
            AssignOp::Set => {
                self.bump()?;
                self.env().emit(Opcode::LoadLocal, 0, container_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, key_slot, line);
                self.expr(0)?;
                let line = self.line();
                self.env().emit(Opcode::SetField, 0, 0, line);
            }
            AssignOp::AddSet | AssignOp::SubSet => {
                let tok = self.bump()?;
                self.env().emit(Opcode::LoadLocal, 0, container_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, key_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, container_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, key_slot, line);
                self.env().emit(Opcode::GetField, 0, 0, line);
                self.expr(0)?;
                let line = self.line();
                let op = if matches!(tok, Token::PlusEq) { Opcode::Add } else { Opcode::Sub };
                self.env().emit(op, 0, 0, line);
                self.env().emit(Opcode::SetField, 0, 0, line);
            }
            AssignOp::Inc | AssignOp::Dec => {
                let tok = self.bump()?;
                self.env().emit(Opcode::LoadLocal, 0, container_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, key_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, container_slot, line);
                self.env().emit(Opcode::LoadLocal, 0, key_slot, line);
                self.env().emit(Opcode::GetField, 0, 0, line);
                let line = self.line();
                let op = if matches!(tok, Token::PlusPlus) { Opcode::Inc } else { Opcode::Dec };
                self.env().emit(op, 0, 0, line);
                self.env().emit(Opcode::SetField, 0, 0, line);
            }
        }
        Ok(())
    }

    // ---- program / statements ----------------------------------------------

    fn program(&mut self) -> Result<()> {
        while !self.check(&Token::Eos) {
            self.statement()?;
        }
        let line = self.line();
        self.env().emit(Opcode::Ret, 0, 0, line);
        Ok(())
    }

    fn block(&mut self) -> Result<()> {
        self.expect(&Token::LBrace)?;
        self.env().enter_scope();
        while !self.check(&Token::RBrace) && !self.check(&Token::Eos) {
            self.statement()?;
        }
        self.expect(&Token::RBrace)?;
        self.env().leave_scope();
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        match self.cur.0.clone() {
            Token::Semi => {
                self.bump()?;
                Ok(())
            }
            Token::LBrace => self.block(),
            Token::Var => self.var_decl(),
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::For => self.for_stmt(),
            Token::Func => self.func_decl(),
            Token::Return => self.return_stmt(),
            Token::Break => self.break_stmt(),
            Token::Continue => self.continue_stmt(),
            Token::Id(name) => {
                self.bump()?;
                if let Some(aop) = self.assign_op() {
                    self.assign_place(&name, aop)?;
                } else {
                    self.load_name(&name)?;
                    self.assignable_tail()?;
                }
                self.accept(&Token::Semi)?;
                Ok(())
            }
            _ => {
                self.expr(0)?;
                let line = self.line();
                self.env().emit(Opcode::Pop, 0, 1, line);
                self.accept(&Token::Semi)?;
                Ok(())
            }
        }
    }

    fn var_decl(&mut self) -> Result<()> {
        self.expect(&Token::Var)?;
        loop {
            let name = self.expect_ident()?;
            if self.accept(&Token::Assign)? {
                self.expr(0)?;
            } else {
                let line = self.line();
                self.env().emit(Opcode::LoadNil, 0, 0, line);
            }
            let slot = self.env().add_local(&name);
            let line = self.line();
            self.env().emit(Opcode::StoreLocal, 0, slot, line);
            if !self.accept(&Token::Comma)? {
                break;
            }
        }
        self.accept(&Token::Semi)?;
        Ok(())
    }

    /// `if let name = expr; cond { }` or `if var name = expr; cond { }`:
    /// an initializer scoped to the whole `if`/`elif`/`else` chain, run
    /// once before the condition is tested.
    fn if_prelude(&mut self) -> Result<bool> {
        if self.accept(&Token::Let)? {
            self.env().enter_scope();
            let name = self.expect_ident()?;
            self.expect(&Token::Assign)?;
            self.expr(0)?;
            let place = self.place_of(&name);
            self.store_place(place);
            self.expect(&Token::Semi)?;
            Ok(true)
        } else if self.check(&Token::Var) {
            self.env().enter_scope();
            self.var_decl()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn if_stmt(&mut self) -> Result<()> {
        self.expect(&Token::If)?;
        let scoped = self.if_prelude()?;
        self.expr(0)?;
        let line = self.line();
        let jmp_next = self.env().emit(Opcode::JmpFalse, 0, 0, line);
        self.block()?;
        let mut end_jumps = vec![{
            let line = self.line();
            self.env().emit(Opcode::Jmp, 0, 0, line)
        }];
        let mut next = self.env().here();
        self.env().patch(jmp_next, next);

        loop {
            if self.accept(&Token::Elif)? {
                self.expr(0)?;
                let line = self.line();
                let jmp = self.env().emit(Opcode::JmpFalse, 0, 0, line);
                self.block()?;
                end_jumps.push({
                    let line = self.line();
                    self.env().emit(Opcode::Jmp, 0, 0, line)
                });
                next = self.env().here();
                self.env().patch(jmp, next);
            } else if self.accept(&Token::Else)? {
                self.block()?;
                break;
            } else {
                break;
            }
        }
        let end = self.env().here();
        for j in end_jumps {
            self.env().patch(j, end);
        }
        if scoped {
            self.env().leave_scope();
        }
        Ok(())
    }

    /// `while [let name = expr; | var name = expr;] cond { } [fail { }]`.
    /// A `let` initializer re-runs on every retry (the continue target
    /// precedes it); a `var` declaration runs once (the retry target
    /// follows it). A trailing `fail` block sits at the loop's exit
    /// point, so it runs whether the loop ended via `break` or via the
    /// condition going false.
    fn while_stmt(&mut self) -> Result<()> {
        self.expect(&Token::While)?;
        let mut scoped = false;
        let test_pos;
        if self.check(&Token::Let) {
            scoped = true;
            self.env().enter_scope();
            test_pos = self.env().here();
            self.bump()?;
            let name = self.expect_ident()?;
            self.expect(&Token::Assign)?;
            self.expr(0)?;
            let place = self.place_of(&name);
            self.store_place(place);
            self.expect(&Token::Semi)?;
        } else if self.check(&Token::Var) {
            scoped = true;
            self.env().enter_scope();
            self.var_decl()?;
            test_pos = self.env().here();
        } else {
            test_pos = self.env().here();
        }
        self.expr(0)?;
        let line = self.line();
        let exit_jmp = self.env().emit(Opcode::JmpFalse, 0, 0, line);
        self.env().loop_stack.push(LoopInfo { continue_target: Some(test_pos), continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.block()?;
        let line = self.line();
        self.env().emit(Opcode::Jmp, 0, test_pos as u16, line);
        let end = self.env().here();
        if self.accept(&Token::Fail)? {
            self.block()?;
        }
        self.env().patch(exit_jmp, end);
        let info = self.env().loop_stack.pop().expect("pushed above");
        for j in info.break_jumps {
            self.env().patch(j, end);
        }
        if scoped {
            self.env().leave_scope();
        }
        Ok(())
    }

    /// `for name = init, limit [, step] { body }` (numeric) or
    /// `for name in expr { body }` (iterator) or `for { body }`
    /// (infinite, equivalent to `while true`).
    fn for_stmt(&mut self) -> Result<()> {
        self.expect(&Token::For)?;
        if self.check(&Token::LBrace) {
            return self.for_infinite();
        }
        let name = self.expect_ident()?;
        if self.accept(&Token::Assign)? {
            self.for_numeric(name)
        } else {
            self.expect(&Token::In)?;
            self.for_in(name)
        }
    }

    fn for_infinite(&mut self) -> Result<()> {
        let top = self.env().here();
        self.env().loop_stack.push(LoopInfo { continue_target: Some(top), continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.block()?;
        let line = self.line();
        self.env().emit(Opcode::Jmp, 0, top as u16, line);
        let end = self.env().here();
        if self.accept(&Token::Fail)? {
            self.block()?;
        }
        let info = self.env().loop_stack.pop().expect("pushed above");
        for j in info.break_jumps {
            self.env().patch(j, end);
        }
        Ok(())
    }

    fn for_numeric(&mut self, name: String) -> Result<()> {
        self.expr(0)?;
        self.expect(&Token::Comma)?;
        self.expr(0)?;
        if self.accept(&Token::Comma)? {
            self.expr(0)?;
        } else {
            let line = self.line();
            self.env().emit(Opcode::LoadInt, 0, 1, line);
        }
        let line = self.line();
        let skip = self.env().emit(Opcode::ForNumPrep, 0, 0, line);

        self.env().enter_scope();
        let body_start = self.env().here();
        self.env().emit(Opcode::Dup, 0, 0, line);
        let slot = self.env().add_local(&name);
        self.env().emit(Opcode::StoreLocal, 0, slot, line);

        // `continue` must reach the increment/test step (`ForNumLoop`),
        // not the `Dup`/`StoreLocal` resync above, or the loop would
        // never advance. That position isn't known until after the
        // body is compiled, so continues are patched afterward.
        self.env().loop_stack.push(LoopInfo { continue_target: None, continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.block()?;
        self.env().leave_scope();
        let info = self.env().loop_stack.pop().expect("pushed above");

        let loop_pos = self.env().here();
        self.env().emit(Opcode::ForNumLoop, 0, body_start as u16, self.line());
        let end = self.env().here();
        if self.accept(&Token::Fail)? {
            self.block()?;
        }
        self.env().patch(skip, end);
        for j in info.continue_jumps {
            self.env().patch(j, loop_pos);
        }
        for j in info.break_jumps {
            self.env().patch(j, end);
        }
        Ok(())
    }

    fn for_in(&mut self, name: String) -> Result<()> {
        self.expr(0)?;
        self.env().enter_scope();
        let iter_slot = self.env().add_local("#iter");
        let line = self.line();
        self.env().emit(Opcode::StoreLocal, 0, iter_slot, line);

        let body_start = self.env().here();
        self.env().emit(Opcode::LoadLocal, 0, iter_slot, line);
        let call_word = opcode::asm_call(Opcode::Call, 0, 1, 0);
        self.env().emit_word(call_word, line);
        self.env().emit(Opcode::Dup, 0, 0, line);
        self.env().emit(Opcode::LoadNil, 0, 0, line);
        self.env().emit(Opcode::Test, test_mode::EQ, 0, line);
        let exit_jmp = self.env().emit(Opcode::JmpTrue, 0, 0, line);
        let loop_slot = self.env().add_local(&name);
        self.env().emit(Opcode::StoreLocal, 0, loop_slot, line);

        self.env().loop_stack.push(LoopInfo { continue_target: Some(body_start), continue_jumps: Vec::new(), break_jumps: Vec::new() });
        self.block()?;
        let info = self.env().loop_stack.pop().expect("pushed above");
        self.env().emit(Opcode::Jmp, 0, body_start as u16, line);

        let pop_pos = self.env().here();
        self.env().emit(Opcode::Pop, 0, 1, line);
        let end = self.env().here();
        if self.accept(&Token::Fail)? {
            self.block()?;
        }
        self.env().patch(exit_jmp, pop_pos);
        self.env().leave_scope();
        for j in info.break_jumps {
            self.env().patch(j, end);
        }
        Ok(())
    }

    fn break_stmt(&mut self) -> Result<()> {
        self.expect(&Token::Break)?;
        let line = self.line();
        let pos = self.env().emit(Opcode::Jmp, 0, 0, line);
        match self.env().loop_stack.last_mut() {
            Some(info) => info.break_jumps.push(pos),
            None => return Err(self.err("`break` outside of a loop")),
        }
        self.accept(&Token::Semi)?;
        Ok(())
    }

    fn continue_stmt(&mut self) -> Result<()> {
        self.expect(&Token::Continue)?;
        if self.env().loop_stack.is_empty() {
            return Err(self.err("`continue` outside of a loop"));
        }
        let target = self.env().loop_stack.last().unwrap().continue_target;
        let line = self.line();
        match target {
            Some(t) => {
                self.env().emit(Opcode::Jmp, 0, t as u16, line);
            }
            None => {
                let pos = self.env().emit(Opcode::Jmp, 0, 0, line);
                self.env().loop_stack.last_mut().unwrap().continue_jumps.push(pos);
            }
        }
        self.accept(&Token::Semi)?;
        Ok(())
    }

    fn return_stmt(&mut self) -> Result<()> {
        self.expect(&Token::Return)?;
        let mut n: u16 = 0;
        if !self.check(&Token::Semi) && !self.check(&Token::RBrace) && !self.check(&Token::Eos) {
            self.expr(0)?;
            n += 1;
            while self.accept(&Token::Comma)? {
                self.expr(0)?;
                n += 1;
            }
        }
        let line = self.line();
        self.env().emit(Opcode::Ret, 0, n, line);
        self.accept(&Token::Semi)?;
        Ok(())
    }

    /// Plain `func f() {}` always defines a global; write `var f =
    /// func(){}` instead for a function value scoped to a local.
    /// `func Type.method() {}` instead stores the compiled closure as a
    /// field of `Type`, with an implicit `self` parameter prepended.
    fn func_decl(&mut self) -> Result<()> {
        self.expect(&Token::Func)?;
        let first = self.expect_ident()?;
        if !self.check(&Token::Dot) {
            self.func_literal(&first, false)?;
            let idx = self.const_str_idx(&first);
            let line = self.line();
            self.env().emit(Opcode::StoreGlobal, 0, idx, line);
            return Ok(());
        }

        let mut segments = vec![first];
        while self.accept(&Token::Dot)? {
            segments.push(self.expect_ident()?);
        }
        let display_name = segments.join(".");

        self.load_name(&segments[0])?;
        for mid in &segments[1..segments.len() - 1] {
            let line = self.line();
            let idx = self.const_str_idx(mid);
            self.env().emit(Opcode::LoadConst, 0, idx, line);
            self.env().emit(Opcode::GetField, 0, 0, line);
        }
        let line = self.line();
        let idx = self.const_str_idx(segments.last().unwrap());
        self.env().emit(Opcode::LoadConst, 0, idx, line);
        self.func_literal(&display_name, true)?;
        let line = self.line();
        self.env().emit(Opcode::SetField, 0, 0, line);
        Ok(())
    }

    // ---- expressions --------------------------------------------------------

    fn binop_prec(t: &Token) -> Option<u8> {
        Some(match t {
            Token::DotDot | Token::Or => 0,
            Token::And => 1,
            Token::Pipe => 2,
            Token::Caret => 3,
            Token::Amp => 4,
            Token::Lt | Token::Le | Token::Gt | Token::Ge | Token::Eq | Token::Ne | Token::Match => 5,
            Token::Shl | Token::Shr | Token::ShrL => 6,
            Token::Plus | Token::Minus => 7,
            Token::Star | Token::Slash | Token::Percent => 8,
            _ => return None,
        })
    }

    fn expr(&mut self, min_prec: u8) -> Result<()> {
        self.unary()?;
        loop {
            let op = match Self::binop_prec(&self.cur.0) {
                Some(p) if p >= min_prec => self.cur.0.clone(),
                _ => break,
            };
            let prec = Self::binop_prec(&op).unwrap();
            self.bump()?;
            let line = self.line();
            match op {
                Token::And => {
                    self.env().emit(Opcode::Dup, 0, 0, line);
                    let jmp = self.env().emit(Opcode::JmpFalse, 0, 0, line);
                    self.env().emit(Opcode::Pop, 0, 1, line);
                    self.expr(prec + 1)?;
                    let here = self.env().here();
                    self.env().patch(jmp, here);
                }
                Token::Or => {
                    self.env().emit(Opcode::Dup, 0, 0, line);
                    let jmp = self.env().emit(Opcode::JmpTrue, 0, 0, line);
                    self.env().emit(Opcode::Pop, 0, 1, line);
                    self.expr(prec + 1)?;
                    let here = self.env().here();
                    self.env().patch(jmp, here);
                }
                Token::Match => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::MATCH, 0, line);
                }
                Token::Eq => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::EQ, 0, line);
                }
                Token::Ne => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::NE, 0, line);
                }
                Token::Lt => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::LT, 0, line);
                }
                Token::Le => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::LE, 0, line);
                }
                // `a > b` / `a >= b` have no dedicated test modes; expressed
                // as the negation of `<=` / `<` to avoid needing a stack
                // swap instruction.
                Token::Gt => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::LE, 0, line);
                    self.env().emit(Opcode::Not, 0, 0, line);
                }
                Token::Ge => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Test, test_mode::LT, 0, line);
                    self.env().emit(Opcode::Not, 0, 0, line);
                }
                Token::Amp => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::BitAnd, 0, 0, line);
                }
                Token::Pipe => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::BitOr, 0, 0, line);
                }
                Token::Caret => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::BitXor, 0, 0, line);
                }
                Token::Shl => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Shl, 0, 0, line);
                }
                Token::Shr => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Shr, 0, 0, line);
                }
                Token::ShrL => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::ShrLogical, 0, 0, line);
                }
                Token::DotDot => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::StrCat, 0, 0, line);
                }
                Token::Plus => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Add, 0, 0, line);
                }
                Token::Minus => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Sub, 0, 0, line);
                }
                Token::Star => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Mul, 0, 0, line);
                }
                Token::Slash => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Div, 0, 0, line);
                }
                Token::Percent => {
                    self.expr(prec + 1)?;
                    self.env().emit(Opcode::Mod, 0, 0, line);
                }
                _ => unreachable!("binop_prec only returns tokens handled above"),
            }
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<()> {
        let line = self.line();
        match self.cur.0 {
            Token::Minus => {
                self.bump()?;
                self.unary()?;
                self.env().emit(Opcode::Neg, 0, 0, line);
                Ok(())
            }
            Token::Not | Token::Bang => {
                self.bump()?;
                self.unary()?;
                self.env().emit(Opcode::Not, 0, 0, line);
                Ok(())
            }
            Token::Tilde => {
                self.bump()?;
                self.unary()?;
                self.env().emit(Opcode::Inv, 0, 0, line);
                Ok(())
            }
            _ => {
                self.primary()?;
                self.suffixes()
            }
        }
    }

    fn primary(&mut self) -> Result<()> {
        let line = self.line();
        match self.cur.0.clone() {
            Token::Nil => {
                self.bump()?;
                self.env().emit(Opcode::LoadNil, 0, 0, line);
            }
            Token::True => {
                self.bump()?;
                self.env().emit(Opcode::LoadBool, 1, 0, line);
            }
            Token::False => {
                self.bump()?;
                self.env().emit(Opcode::LoadBool, 0, 0, line);
            }
            Token::Int(v) => {
                self.bump()?;
                if (i16::MIN as i64..=i16::MAX as i64).contains(&v) {
                    self.env().emit(Opcode::LoadInt, 0, v as u16, line);
                } else {
                    let idx = self.env().const_int(v);
                    self.env().emit(Opcode::LoadConst, 0, idx, line);
                }
            }
            Token::Float(v) => {
                self.bump()?;
                let idx = self.env().const_float(v);
                self.env().emit(Opcode::LoadConst, 0, idx, line);
            }
            Token::Str(s) => {
                self.bump()?;
                let idx = self.const_str_idx(&s);
                self.env().emit(Opcode::LoadConst, 0, idx, line);
            }
            Token::Id(name) => {
                self.bump()?;
                self.load_name(&name)?;
            }
            Token::LParen => {
                self.bump()?;
                self.expr(0)?;
                self.expect(&Token::RParen)?;
            }
            Token::LBracket => self.array_literal()?,
            Token::LBrace => self.map_literal()?,
            Token::At => self.skiplist_literal()?,
            Token::Func => {
                self.bump()?;
                self.func_literal("<anonymous>", false)?;
            }
            Token::Typeof => {
                self.bump()?;
                self.unary()?;
                self.env().emit(Opcode::Typeof, 0, 0, line);
            }
            Token::Argv => {
                self.bump()?;
                self.env().emit(Opcode::LoadArgv, 0, 0, line);
            }
            other => return Err(self.err(format!("unexpected token {:?}", other))),
        }
        Ok(())
    }

    /// Trailing `.field`, `[index]`, `(args)` and `:method(args)`
    /// chains applied to whatever value parsing just left on the
    /// operand stack.
    fn suffixes(&mut self) -> Result<()> {
        loop {
            match self.cur.0 {
                Token::Dot => {
                    self.bump()?;
                    let field = self.expect_ident()?;
                    let line = self.line();
                    let idx = self.const_str_idx(&field);
                    self.env().emit(Opcode::LoadConst, 0, idx, line);
                    self.env().emit(Opcode::GetField, 0, 0, line);
                }
                Token::LBracket => {
                    self.bump()?;
                    self.expr(0)?;
                    self.expect(&Token::RBracket)?;
                    let line = self.line();
                    self.env().emit(Opcode::GetField, 0, 0, line);
                }
                Token::LParen => {
                    self.bump()?;
                    let argc = self.arg_list(&Token::RParen)?;
                    self.expect(&Token::RParen)?;
                    let line = self.line();
                    let word = opcode::asm_call(Opcode::Call, argc, 1, 0);
                    self.env().emit_word(word, line);
                }
                Token::Colon => {
                    self.bump()?;
                    let method = self.expect_ident()?;
                    self.expect(&Token::LParen)?;
                    let argc = self.arg_list(&Token::RParen)?;
                    self.expect(&Token::RParen)?;
                    let line = self.line();
                    let midx = self.const_str_idx(&method);
                    let word = opcode::asm_call(Opcode::SelfCall, argc, 1, midx);
                    self.env().emit_word(word, line);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn arg_list(&mut self, end: &Token) -> Result<u8> {
        let mut n: u8 = 0;
        if self.check(end) {
            return Ok(0);
        }
        self.expr(0)?;
        n += 1;
        while self.accept(&Token::Comma)? {
            self.expr(0)?;
            n += 1;
        }
        Ok(n)
    }

    fn array_literal(&mut self) -> Result<()> {
        self.expect(&Token::LBracket)?;
        let n = self.arg_list(&Token::RBracket)?;
        self.expect(&Token::RBracket)?;
        let line = self.line();
        self.env().emit(Opcode::NewArray, 0, n as u16, line);
        Ok(())
    }

    fn map_literal(&mut self) -> Result<()> {
        self.expect(&Token::LBrace)?;
        let mut n: u16 = 0;
        if !self.check(&Token::RBrace) {
            loop {
                self.expr(0)?;
                self.expect(&Token::Colon)?;
                self.expr(0)?;
                n += 1;
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RBrace)?;
        let line = self.line();
        self.env().emit(Opcode::NewMap, 0, n, line);
        Ok(())
    }

    /// `@{...}` (ascending), `@[<]{...}`, `@[>]{...}` or
    /// `@[expr]{...}` (custom comparator) skip-list literal.
    fn skiplist_literal(&mut self) -> Result<()> {
        self.expect(&Token::At)?;
        let mut flag: u8 = 0;
        if self.accept(&Token::LBracket)? {
            if self.accept(&Token::Lt)? {
                flag = 0;
            } else if self.accept(&Token::Gt)? {
                flag = 1;
            } else {
                self.expr(0)?;
                flag = 2;
            }
            self.expect(&Token::RBracket)?;
        }
        let line = self.line();
        self.env().emit(Opcode::NewSkls, flag, 0, line);
        self.expect(&Token::LBrace)?;
        if !self.check(&Token::RBrace) {
            loop {
                let line = self.line();
                self.env().emit(Opcode::Dup, 0, 0, line);
                self.expr(0)?;
                self.expect(&Token::Colon)?;
                self.expr(0)?;
                let line = self.line();
                self.env().emit(Opcode::SetField, 0, 0, line);
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(())
    }

    fn func_literal(&mut self, name: &str, implicit_self: bool) -> Result<()> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if implicit_self {
            params.push("self".to_owned());
        }
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        self.envs.push(FuncEnv::new(&self.file, name));
        for p in &params {
            self.env().add_local(p);
        }
        self.env().n_params = params.len() as u8;
        self.block()?;
        let line = self.line();
        self.env().emit(Opcode::Ret, 0, 0, line);

        let env = self.envs.pop().expect("pushed above");
        let chunk = env.build_chunk();
        let template_h = self.vm.gc.alloc(Object::Func(Func::Script { chunk: Rc::new(chunk), upvalues: Vec::new() }));
        let line = self.line();
        let idx = self.env().push_raw_const(Value::Ref(template_h));
        self.env().emit(Opcode::Closure, 0, idx, line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn run(source: &str) -> Vec<Value> {
        let mut vm = Vm::new(Config::default());
        let entry = compile(&mut vm, "<test>", source).unwrap();
        let mut ctx = vm.context();
        ctx.call(entry, Vec::new()).unwrap()
    }

    fn run_str(source: &str) -> Vec<String> {
        let mut vm = Vm::new(Config::default());
        let entry = compile(&mut vm, "<test>", source).unwrap();
        let mut ctx = vm.context();
        let results = ctx.call(entry, Vec::new()).unwrap();
        results.into_iter().map(|v| ctx.tostring(v)).collect()
    }

    #[test]
    fn arithmetic_and_return() {
        assert_eq!(run("return 1 + 2 * 3;"), vec![Value::Int(7)]);
    }

    #[test]
    fn var_and_if_else() {
        let r = run("var x = 5; if x > 3 { return \"big\"; } else { return \"small\"; }");
        assert_eq!(r.len(), 1);
        assert!(matches!(r[0], Value::Ref(_)));
    }

    #[test]
    fn while_loop_accumulates() {
        assert_eq!(run("var i = 0; var sum = 0; while i < 5 { sum = sum + i; i = i + 1; } return sum;"), vec![Value::Int(10)]);
    }

    #[test]
    fn numeric_for_sums_range() {
        // Upper bound is exclusive: `1, 6` visits 1..5.
        assert_eq!(run("var sum = 0; for i = 1, 6 { sum = sum + i; } return sum;"), vec![Value::Int(15)]);
    }

    #[test]
    fn break_and_continue_numeric_for() {
        assert_eq!(
            run("var sum = 0; for i = 1, 10 { if i == 5 { break; } if i % 2 == 0 { continue; } sum = sum + i; } return sum;"),
            vec![Value::Int(1 + 3)]
        );
    }

    #[test]
    fn closures_capture_upvalues() {
        let r = run_str("func counter() { var n = 0; return func() { n = n + 1; return n; }; } var c = counter(); c(); c(); return c();");
        assert_eq!(r, vec!["3"]);
    }

    #[test]
    fn recursive_global_function() {
        assert_eq!(
            run("func fact(n) { if n <= 1 { return 1; } return n * fact(n - 1); } return fact(5);"),
            vec![Value::Int(120)]
        );
    }

    #[test]
    fn array_and_map_literals() {
        let r = run("var a = [1, 2, 3]; var m = {\"k\": 9}; return len(a) + m.k;");
        assert_eq!(r, vec![Value::Int(12)]);
    }

    #[test]
    fn foreach_over_range() {
        assert_eq!(run("var sum = 0; for v in range(1, 4) { sum = sum + v; } return sum;"), vec![Value::Int(6)]);
    }

    #[test]
    fn pcall_reports_error_field() {
        let r = run_str("var r = pcall(func() { panic(\"boom\"); }); return r.error;");
        assert_eq!(r, vec!["boom"]);
    }

    #[test]
    fn compound_assign_on_locals() {
        assert_eq!(run("var n = 1; n += 4; n -= 1; n++; n--; n++; return n;"), vec![Value::Int(5)]);
    }

    #[test]
    fn compound_assign_on_upvalues() {
        let r = run_str("func mk() { var n = 0; return func() { n += 1; return n; }; } var c = mk(); c(); c(); return c();");
        assert_eq!(r, vec!["3"]);
    }

    #[test]
    fn field_and_index_assignment() {
        assert_eq!(run("var m = {\"k\": 1}; m.k = 9; return m.k;"), vec![Value::Int(9)]);
        assert_eq!(run("var a = [1, 2, 3]; a[1] = 9; return a[1];"), vec![Value::Int(9)]);
    }

    #[test]
    fn compound_assign_on_field_and_index() {
        assert_eq!(run("var m = {\"k\": 1}; m.k += 4; return m.k;"), vec![Value::Int(5)]);
        assert_eq!(run("var a = [1, 2, 3]; a[0]++; return a[0];"), vec![Value::Int(2)]);
    }

    #[test]
    fn method_dotted_func_decl_binds_implicit_self() {
        let r = run(
            "var box = {\"n\": 10};
             func box.bump(by) { self.n = self.n + by; return self.n; }
             return box:bump(5);",
        );
        assert_eq!(r, vec![Value::Int(15)]);
    }

    #[test]
    fn argv_collects_call_arguments() {
        assert_eq!(run("func f() { return len(argv); } return f(1, 2, 3);"), vec![Value::Int(3)]);
    }

    #[test]
    fn strcat_operator_concatenates_as_strings() {
        let r = run_str("return \"a\" .. 1 .. \"b\";");
        assert_eq!(r, vec!["a1b"]);
    }

    #[test]
    fn shift_operators_cover_left_logical_and_arithmetic() {
        assert_eq!(run("return 1 << 4;"), vec![Value::Int(16)]);
        assert_eq!(run("return -1 |> 60;"), vec![Value::Int(15)]);
        assert_eq!(run("return -16 >> 2;"), vec![Value::Int(-4)]);
    }

    #[test]
    fn while_with_let_initializer_reruns_each_iteration() {
        assert_eq!(
            run("var i = 0; var sum = 0; while let i = i + 1; i <= 3 { sum = sum + i; } return sum;"),
            vec![Value::Int(6)]
        );
    }

    #[test]
    fn while_with_var_initializer_declares_once() {
        assert_eq!(run("var sum = 0; while var i = 0; i < 3 { sum = sum + i; i = i + 1; } return sum;"), vec![Value::Int(3)]);
    }

    #[test]
    fn fail_block_runs_on_break_and_on_exhaustion() {
        assert_eq!(
            run("var hit = 0; for i = 1, 5 { if i == 2 { break; } } fail { hit = 1; } return hit;"),
            vec![Value::Int(1)]
        );
        assert_eq!(
            run("var hit = 0; for i = 1, 3 { } fail { hit = 9; } return hit;"),
            vec![Value::Int(9)]
        );
        assert_eq!(run("var hit = 0; while false { } fail { hit = 7; } return hit;"), vec![Value::Int(7)]);
    }
}
