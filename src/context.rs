use std::cmp::Ordering;
use std::rc::Rc;

use crate::array::Dyay;
use crate::chunk::{Chunk, Func, Upvalue, UpvalDesc};
use crate::error::{Error, Result};
use crate::frame::{CallInfo, Frames, ProtectedMark};
use crate::gc::{value_compare, Object};
use crate::hash_map::Hmap;
use crate::managed::Mand;
use crate::opcode::{self, test_mode, Opcode};
use crate::skip_list::{natural_cmp, Cmp, Order, Skls};
use crate::value::{Handle, Tag, Value};
use crate::vm::{upvalue_of, Vm};

/// One execution thread against a `Vm`: its own value stack and call
/// frames, but the heap and globals are shared. This is the host-facing
/// embedding surface: push/pop the stack, inspect arguments, call back
/// into script code, and raise or catch errors.
pub struct Context<'vm> {
    vm: &'vm mut Vm,
    stack: Vec<Upvalue>,
    frames: Frames,
}

impl<'vm> Context<'vm> {
    pub fn new(vm: &'vm mut Vm) -> Context<'vm> {
        let max_stack = vm.config.max_stack;
        Context { vm, stack: Vec::with_capacity(vm.config.init_stack), frames: Frames::new(max_stack / 8) }
    }

    pub fn vm(&mut self) -> &mut Vm {
        self.vm
    }

    // ---- stack primitives -------------------------------------------------

    pub fn push(&mut self, v: Value) {
        self.stack.push(upvalue_of(v));
    }

    pub fn pop(&mut self, n: usize) -> Result<()> {
        if n > self.stack.len() {
            return Err(Error::PopUnderflow);
        }
        self.stack.truncate(self.stack.len() - n);
        Ok(())
    }

    fn abs_index(&self, idx: i32) -> Option<usize> {
        if idx >= 0 {
            Some(idx as usize)
        } else {
            let i = self.stack.len() as i64 + idx as i64;
            if i < 0 {
                None
            } else {
                Some(i as usize)
            }
        }
    }

    pub fn top(&self) -> Result<Value> {
        self.stack.last().map(|c| *c.borrow()).ok_or(Error::PopUnderflow)
    }

    pub fn get(&self, idx: i32) -> Result<Value> {
        let i = self.abs_index(idx).ok_or(Error::StackOutOfRange(idx))?;
        self.stack.get(i).map(|c| *c.borrow()).ok_or(Error::StackOutOfRange(idx))
    }

    pub fn set(&mut self, idx: i32, v: Value) -> Result<()> {
        let i = self.abs_index(idx).ok_or(Error::StackOutOfRange(idx))?;
        let cell = self.stack.get(i).ok_or(Error::StackOutOfRange(idx))?;
        *cell.borrow_mut() = v;
        Ok(())
    }

    /// Copies the value at `from` on top of `to`, as the embedding
    /// API's `move` primitive.
    pub fn move_value(&mut self, from: i32, to: i32) -> Result<()> {
        let v = self.get(from)?;
        self.set(to, v)
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    // ---- call frame introspection -----------------------------------------

    fn current(&self) -> Result<&CallInfo> {
        self.frames.current().ok_or(Error::StackOverflow)
    }

    pub fn argc(&self) -> usize {
        self.current().map(|f| f.adjust as usize).unwrap_or(0)
    }

    pub fn argv(&self, i: usize) -> Result<Value> {
        let f = self.current()?;
        if i >= f.adjust as usize {
            return Err(Error::IndexOutOfRange(i as i64));
        }
        self.stack.get(f.base + i).map(|c| *c.borrow()).ok_or(Error::IndexOutOfRange(i as i64))
    }

    fn current_func_upvalues(&self) -> Result<Vec<Upvalue>> {
        let h = self.current()?.func;
        match self.vm.gc.get(h) {
            Object::Func(f) => Ok(f.upvalues().to_vec()),
            _ => Err(Error::NotCallable(Tag::Nil)),
        }
    }

    pub fn upval(&self, i: usize) -> Result<Value> {
        let cells = self.current_func_upvalues()?;
        cells.get(i).map(|c| *c.borrow()).ok_or(Error::UpvalOutOfRange(i as i32, cells.len() as i32))
    }

    pub fn set_upval(&mut self, i: usize, v: Value) -> Result<()> {
        let cells = self.current_func_upvalues()?;
        let cell = cells.get(i).ok_or(Error::UpvalOutOfRange(i as i32, cells.len() as i32))?;
        *cell.borrow_mut() = v;
        Ok(())
    }

    // ---- globals / fields ---------------------------------------------------

    pub fn get_global(&mut self, name: &str) -> Value {
        let key = Value::Ref(self.vm.gc.intern(name));
        self.vm.globals.get(&self.vm.gc, &key).unwrap_or(Value::Nil)
    }

    pub fn put_global(&mut self, name: &str, v: Value) {
        let key = Value::Ref(self.vm.gc.intern(name));
        self.vm.globals.put(&self.vm.gc, key, v);
    }

    fn hmap_mutate<R>(&mut self, h: Handle, f: impl FnOnce(&mut Hmap, &crate::gc::Gc) -> R) -> Result<R> {
        let obj = self.vm.gc.take(h);
        let mut m = match obj {
            Object::Hmap(m) => m,
            other => {
                let t = other.tag();
                self.vm.gc.restore(h, other);
                return Err(Error::TypeMismatch(Tag::Hmap, t));
            }
        };
        let result = f(&mut m, &self.vm.gc);
        self.vm.gc.restore(h, Object::Hmap(m));
        Ok(result)
    }

    /// Runs a skip-list operation with whichever comparator the list
    /// was built with, calling back into script code for `Order::Custom`.
    /// The list is detached from the arena for the duration of the call
    /// so this `Context` is free to re-enter the VM.
    fn skls_op<R>(&mut self, h: Handle, f: impl FnOnce(&mut Skls, &mut Cmp) -> Result<R>) -> Result<R> {
        let obj = self.vm.gc.take(h);
        let mut skls = match obj {
            Object::Skls(s) => s,
            other => {
                let t = other.tag();
                self.vm.gc.restore(h, other);
                return Err(Error::TypeMismatch(Tag::Skls, t));
            }
        };
        let order = skls.order();
        let comparator = skls.comparator();
        let result: Result<R> = match order {
            Order::Custom => match comparator {
                Some(comparator) => {
                    let mut cmp = |a: &Value, b: &Value| -> Result<Ordering> {
                        let res = self.call(comparator, vec![*a, *b])?;
                        Ok(res.get(0).and_then(|v| v.as_int()).unwrap_or(0).cmp(&0))
                    };
                    f(&mut skls, &mut cmp)
                }
                None => Err(Error::NoMetatable),
            },
            _ => {
                let mut cmp = natural_cmp(&self.vm.gc, order);
                f(&mut skls, &mut cmp)
            }
        };
        self.vm.gc.restore(h, Object::Skls(skls));
        result
    }

    pub fn get_field(&mut self, container: Value, key: Value) -> Result<Value> {
        let h = container.as_ref().ok_or(Error::NotCallable(Tag::Nil))?;
        let tag = self.vm.gc.get(h).tag();
        match tag {
            Tag::Dyay => {
                let i = key.as_int().ok_or_else(|| Error::TypeMismatch(Tag::Int, Tag::Nil))?;
                match self.vm.gc.get(h) {
                    Object::Dyay(d) => d.get(i),
                    _ => unreachable!(),
                }
            }
            Tag::Hmap => {
                let v = match self.vm.gc.get(h) {
                    Object::Hmap(m) => m.get(&self.vm.gc, &key),
                    _ => unreachable!(),
                };
                Ok(v.unwrap_or(Value::Nil))
            }
            Tag::Skls => Ok(self.skls_op(h, |s, cmp| s.get(&key, cmp))?.unwrap_or(Value::Nil)),
            Tag::Mand => {
                let mt = match self.vm.gc.get(h) {
                    Object::Mand(m) => m.metatable(),
                    _ => unreachable!(),
                };
                match mt {
                    Some(mh) => self.get_field(Value::Ref(mh), key),
                    None => Err(Error::NoMetatable),
                }
            }
            other => Err(Error::NotCallable(other)),
        }
    }

    pub fn set_field(&mut self, container: Value, key: Value, value: Value) -> Result<()> {
        let h = container.as_ref().ok_or(Error::NotCallable(Tag::Nil))?;
        let tag = self.vm.gc.get(h).tag();
        match tag {
            Tag::Dyay => {
                let i = key.as_int().ok_or_else(|| Error::TypeMismatch(Tag::Int, Tag::Nil))?;
                match self.vm.gc.get_mut(h) {
                    Object::Dyay(d) => {
                        if i >= 0 && i as usize == d.count() {
                            d.push(value);
                            Ok(())
                        } else {
                            d.set(i, value)
                        }
                    }
                    _ => unreachable!(),
                }
            }
            Tag::Hmap => {
                if value == Value::Nil {
                    self.hmap_mutate(h, |m, gc| { m.remove(gc, &key); })?;
                    Ok(())
                } else {
                    self.hmap_mutate(h, |m, gc| m.put(gc, key, value))
                }
            }
            Tag::Skls => self.skls_op(h, |s, cmp| s.put(key, value, cmp)),
            Tag::Mand => {
                let mt = match self.vm.gc.get(h) {
                    Object::Mand(m) => m.metatable(),
                    _ => unreachable!(),
                };
                match mt {
                    Some(mh) => self.set_field(Value::Ref(mh), key, value),
                    None => Err(Error::NoMetatable),
                }
            }
            other => Err(Error::NotCallable(other)),
        }
    }

    pub fn remove_field(&mut self, container: Value, key: Value) -> Result<Value> {
        let h = container.as_ref().ok_or(Error::NotCallable(Tag::Nil))?;
        let tag = self.vm.gc.get(h).tag();
        match tag {
            Tag::Dyay => {
                let i = key.as_int().ok_or_else(|| Error::TypeMismatch(Tag::Int, Tag::Nil))?;
                match self.vm.gc.get_mut(h) {
                    Object::Dyay(d) => d.remove(i),
                    _ => unreachable!(),
                }
            }
            Tag::Hmap => {
                let v = self.hmap_mutate(h, |m, gc| m.remove(gc, &key))?;
                v.ok_or(Error::KeyError)
            }
            Tag::Skls => self.skls_op(h, |s, cmp| s.remove(&key, cmp))?.ok_or(Error::KeyError),
            other => Err(Error::NotCallable(other)),
        }
    }

    /// Installs a fresh closure over a native function template,
    /// binding `upvalues` into it. Used for builtins that hand out
    /// iterator closures (`range`, `rank`, ...).
    pub fn bind(&mut self, template: Value, upvalues: Vec<Value>) -> Result<Value> {
        let h = template.as_ref().ok_or(Error::NotCallable(Tag::Nil))?;
        let (name, arity, func) = match self.vm.gc.get(h) {
            Object::Func(Func::Native { name, arity, func, .. }) => (name.clone(), *arity, *func),
            _ => return Err(Error::NotCallable(Tag::Func)),
        };
        let cells: Vec<Upvalue> = upvalues.into_iter().map(upvalue_of).collect();
        let newh = self.vm.gc.alloc(Object::Func(Func::Native { name, arity, func, upvalues: cells }));
        Ok(Value::Ref(newh))
    }

    pub fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(Error::Panic(message.into()))
    }

    fn roots(&self) -> Vec<Handle> {
        let mut out = Vec::new();
        for cell in &self.stack {
            if let Value::Ref(h) = *cell.borrow() {
                out.push(h);
            }
        }
        out
    }

    // ---- calling ------------------------------------------------------------

    pub fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>> {
        self.xcall(callee, args, 0)
    }

    /// Calls `callee`, then pads/truncates the result list to exactly
    /// `adjust` values (0 means "however many it returned").
    pub fn xcall(&mut self, callee: Value, args: Vec<Value>, adjust: u8) -> Result<Vec<Value>> {
        let h = callee.as_ref().ok_or(Error::NotCallable(Tag::Nil))?;
        if !matches!(self.vm.gc.get(h).tag(), Tag::Func) {
            return Err(Error::NotCallable(self.vm.gc.get(h).tag()));
        }
        let base = self.stack.len();
        let nargs = args.len();
        for a in args {
            self.push(a);
        }
        let name = match self.vm.gc.get(h) {
            Object::Func(f) => f.name().to_owned(),
            _ => unreachable!(),
        };
        self.frames.push(CallInfo { func: h, pc: 0, base, adjust: nargs as u8, name })?;

        let is_native = matches!(self.vm.gc.get(h), Object::Func(Func::Native { .. }));
        let mut results = if is_native {
            let native = match self.vm.gc.get(h) {
                Object::Func(Func::Native { func, .. }) => *func,
                _ => unreachable!(),
            };
            let n = native(self)? as usize;
            let start = self.stack.len() - n;
            self.stack[start..].iter().map(|c| *c.borrow()).collect::<Vec<_>>()
        } else {
            let chunk = match self.vm.gc.get(h) {
                Object::Func(Func::Script { chunk, .. }) => chunk.clone(),
                _ => unreachable!(),
            };
            match self.run_script(&chunk) {
                Ok(results) => results,
                Err(Error::Halt) => Vec::new(),
                Err(e) => return Err(e),
            }
        };

        self.stack.truncate(base);
        self.frames.pop();
        self.vm.gc_step(&self.roots());

        if adjust != 0 {
            results.resize(adjust as usize, Value::Nil);
        }
        Ok(results)
    }

    /// Calls `callee` and never propagates an `Err`: failures are
    /// turned into `(false, message)`, successes into `(true, ...)`,
    /// matching the reference implementation's `{ok, backtrace, error}`
    /// protected-call triple collapsed to the two values scripts
    /// actually branch on.
    pub fn pcall(&mut self, callee: Value, args: Vec<Value>) -> Result<Vec<Value>> {
        let mark = ProtectedMark { frame_depth: self.frames.depth(), stack_depth: self.stack.len() };
        match self.call(callee, args) {
            Ok(mut results) => {
                let mut out = vec![Value::Bool(true)];
                out.append(&mut results);
                Ok(out)
            }
            Err(e) => {
                self.frames.truncate(mark.frame_depth);
                self.stack.truncate(mark.stack_depth);
                let msg = self.vm.gc.intern(&e.to_string());
                Ok(vec![Value::Bool(false), Value::Ref(msg)])
            }
        }
    }

    // ---- dispatch loop --------------------------------------------------------

    fn binary_numeric(op: Opcode, a: Value, b: Value) -> Result<Value> {
        use Opcode::*;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(match op {
                Add => Value::Int(x.wrapping_add(y)),
                Sub => Value::Int(x.wrapping_sub(y)),
                Mul => Value::Int(x.wrapping_mul(y)),
                Div => {
                    if y == 0 {
                        return Err(Error::DivideByZero);
                    }
                    Value::Int(x.wrapping_div(y))
                }
                Mod => {
                    if y == 0 {
                        return Err(Error::DivideByZero);
                    }
                    Value::Int(x.wrapping_rem(y))
                }
                Pow => Value::Float((x as f64).powf(y as f64)),
                Shl => Value::Int(if y < 0 { return Err(Error::NegativeShift) } else { x.wrapping_shl(y as u32) }),
                Shr => Value::Int(if y < 0 { return Err(Error::NegativeShift) } else { x.wrapping_shr(y as u32) }),
                ShrLogical => Value::Int(if y < 0 {
                    return Err(Error::NegativeShift);
                } else {
                    ((x as u64).wrapping_shr(y as u32)) as i64
                }),
                BitAnd => Value::Int(x & y),
                BitOr => Value::Int(x | y),
                BitXor => Value::Int(x ^ y),
                _ => unreachable!(),
            }),
            // `%` is integer only; a `Float` operand on either side of `Mod`
            // is a type error rather than a silently-promoted float modulo.
            (_, _) if op == Mod => Err(Error::TypeMismatch(Tag::Int, Tag::Int)),
            (a, b) if a.as_float().is_some() && b.as_float().is_some() => {
                let x = a.as_float().unwrap();
                let y = b.as_float().unwrap();
                Ok(match op {
                    Add => Value::Float(x + y),
                    Sub => Value::Float(x - y),
                    Mul => Value::Float(x * y),
                    Div => {
                        if y == 0.0 {
                            return Err(Error::DivideByZero);
                        }
                        Value::Float(x / y)
                    }
                    Pow => Value::Float(x.powf(y)),
                    _ => return Err(Error::TypeMismatch(Tag::Float, Tag::Float)),
                })
            }
            _ => Err(Error::TypeMismatch(Tag::Int, Tag::Int)),
        }
    }

    fn test(&mut self, mode: u8, a: Value, b: Value) -> Result<bool> {
        Ok(match mode {
            test_mode::EQ => self.values_equal(a, b),
            test_mode::NE => !self.values_equal(a, b),
            test_mode::LT => value_compare(&self.vm.gc, &a, &b)? == Ordering::Less,
            test_mode::LE => value_compare(&self.vm.gc, &a, &b)? != Ordering::Greater,
            test_mode::MATCH => {
                let (sa, sb) = match (a, b) {
                    (Value::Ref(ha), Value::Ref(hb)) => (ha, hb),
                    _ => return Err(Error::TypeMismatch(Tag::Str, Tag::Str)),
                };
                let text = self.vm.gc.as_str(sa).to_owned();
                let pattern = self.vm.gc.as_str(sb).to_owned();
                let re = self.vm.regex_for(&pattern)?;
                re.is_match(&text)
            }
            _ => return Err(Error::Panic(format!("unknown test mode {}", mode))),
        })
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        crate::gc::value_equals(&self.vm.gc, &a, &b)
    }

    fn resolve_upval_cell(desc: &[UpvalDesc], parent_locals: &[Upvalue], parent_upvalues: &[Upvalue], i: usize) -> Upvalue {
        match desc[i] {
            UpvalDesc::ParentLocal(slot) => parent_locals[slot as usize].clone(),
            UpvalDesc::ParentUpval(slot) => parent_upvalues[slot as usize].clone(),
        }
    }

    /// Runs one script function to completion (a `Ret` instruction or
    /// falling off the end of the chunk) and returns its results. The
    /// caller has already pushed a `CallInfo` and the argument values.
    fn run_script(&mut self, chunk: &Rc<Chunk>) -> Result<Vec<Value>> {
        let base = self.current()?.base;
        let max_locals = chunk.max_locals as usize;
        while self.stack.len() < base + max_locals {
            self.push(Value::Nil);
        }
        let parent_upvalues = self.current_func_upvalues()?;

        loop {
            let pc = self.current()?.pc;
            let word = match chunk.code.get(pc) {
                Some(w) => *w,
                // Falling off the end of the chunk is a normal-completion
                // signal, not a real failure; `xcall` catches it.
                None => return Err(Error::Halt),
            };
            let (op, flag, param) = opcode::decode(word).ok_or_else(|| Error::Panic(format!("illegal opcode word {:#x}", word)))?;
            self.frames.current_mut().unwrap().pc = pc + 1;

            match op {
                Opcode::Nop => {}
                Opcode::LoadNil => self.push(Value::Nil),
                Opcode::LoadBool => self.push(Value::Bool(flag != 0)),
                Opcode::LoadInt => self.push(Value::Int(param as i16 as i64)),
                Opcode::LoadConst => {
                    let v = *chunk.constants.get(param as usize).ok_or(Error::IndexOutOfRange(param as i64))?;
                    self.push(v);
                }
                Opcode::LoadGlobal => {
                    let name = self.const_str(chunk, param)?;
                    let v = self.get_global(&name);
                    self.push(v);
                }
                Opcode::StoreGlobal => {
                    let name = self.const_str(chunk, param)?;
                    let v = self.pop_value()?;
                    self.put_global(&name, v);
                }
                Opcode::LoadLocal => {
                    let v = *self.stack[base + param as usize].borrow();
                    self.push(v);
                }
                Opcode::StoreLocal => {
                    let v = self.pop_value()?;
                    *self.stack[base + param as usize].borrow_mut() = v;
                }
                Opcode::LoadUpval => {
                    let v = *parent_upvalues[param as usize].borrow();
                    self.push(v);
                }
                Opcode::StoreUpval => {
                    let v = self.pop_value()?;
                    *parent_upvalues[param as usize].borrow_mut() = v;
                }
                Opcode::GetField => {
                    let key = self.pop_value()?;
                    let container = self.pop_value()?;
                    let v = self.get_field(container, key)?;
                    self.push(v);
                }
                Opcode::SetField => {
                    let value = self.pop_value()?;
                    let key = self.pop_value()?;
                    let container = self.pop_value()?;
                    self.set_field(container, key, value)?;
                }
                Opcode::NewArray => {
                    let n = param as usize;
                    let mut d = Dyay::with_capacity(n);
                    let start = self.stack.len() - n;
                    for cell in &self.stack[start..] {
                        d.push(*cell.borrow());
                    }
                    self.stack.truncate(start);
                    let h = self.vm.gc.alloc(Object::Dyay(d));
                    self.push(Value::Ref(h));
                }
                Opcode::NewMap => {
                    let n = param as usize;
                    let mut m = Hmap::new();
                    let start = self.stack.len() - n * 2;
                    let pairs: Vec<Value> = self.stack[start..].iter().map(|c| *c.borrow()).collect();
                    self.stack.truncate(start);
                    for pair in pairs.chunks(2) {
                        m.put(&self.vm.gc, pair[0], pair[1]);
                    }
                    let h = self.vm.gc.alloc(Object::Hmap(m));
                    self.push(Value::Ref(h));
                }
                Opcode::NewSkls => {
                    let order = match flag {
                        0 => Order::Asc,
                        1 => Order::Desc,
                        _ => Order::Custom,
                    };
                    let comparator = if order == Order::Custom { Some(self.pop_value()?) } else { None };
                    let s = Skls::new(order, comparator, 0x2545_f491_4f6c_dd1d ^ pc as u64);
                    let h = self.vm.gc.alloc(Object::Skls(s));
                    self.push(Value::Ref(h));
                }
                Opcode::Closure => {
                    let f = match chunk.constants.get(param as usize) {
                        Some(Value::Ref(h)) => *h,
                        _ => return Err(Error::IndexOutOfRange(param as i64)),
                    };
                    let (inner_chunk, desc) = match self.vm.gc.get(f) {
                        Object::Func(Func::Script { chunk, .. }) => (chunk.clone(), chunk.upval_desc.clone()),
                        _ => return Err(Error::NotCallable(Tag::Func)),
                    };
                    let locals = &self.stack[base..];
                    let cells: Vec<Upvalue> = (0..desc.len())
                        .map(|i| Self::resolve_upval_cell(&desc, locals, &parent_upvalues, i))
                        .collect();
                    let h = self.vm.gc.alloc(Object::Func(Func::Script { chunk: inner_chunk, upvalues: cells }));
                    self.push(Value::Ref(h));
                }
                Opcode::Close => {
                    // Upvalues are always independently owned `Rc<RefCell<Value>>`
                    // cells in this implementation, so there is nothing to
                    // detach from a dying frame. Kept as a no-op for bytecode
                    // shape parity with the reference VM.
                }
                Opcode::Call | Opcode::SelfCall => {
                    let argc = opcode::asm_argc(word) as usize;
                    let adjust = opcode::asm_adjust(word);
                    let mut args = Vec::with_capacity(argc + 1);
                    let start = self.stack.len() - argc;
                    for cell in &self.stack[start..] {
                        args.push(*cell.borrow());
                    }
                    self.stack.truncate(start);
                    let callee = if op == Opcode::SelfCall {
                        let method = self.const_str(chunk, opcode::asm_method(word))?;
                        let recv = self.pop_value()?;
                        let key_handle = self.vm.gc.intern(&method);
                        let m = self.get_field(recv, Value::Ref(key_handle))?;
                        args.insert(0, recv);
                        m
                    } else {
                        self.pop_value()?
                    };
                    let results = self.xcall(callee, args, adjust)?;
                    for v in results {
                        self.push(v);
                    }
                }
                Opcode::Ret => {
                    let n = param as usize;
                    let start = self.stack.len() - n;
                    let results: Vec<Value> = self.stack[start..].iter().map(|c| *c.borrow()).collect();
                    self.stack.truncate(start);
                    return Ok(results);
                }
                Opcode::Jmp => {
                    self.frames.current_mut().unwrap().pc = param as usize;
                }
                Opcode::JmpFalse => {
                    let v = self.pop_value()?;
                    if !v.truthy() {
                        self.frames.current_mut().unwrap().pc = param as usize;
                    }
                }
                Opcode::JmpTrue => {
                    let v = self.pop_value()?;
                    if v.truthy() {
                        self.frames.current_mut().unwrap().pc = param as usize;
                    }
                }
                Opcode::ForNumPrep => {
                    let step = self.pop_value()?.as_float().ok_or(Error::TypeMismatch(Tag::Float, Tag::Nil))?;
                    let limit = self.pop_value()?.as_float().ok_or(Error::TypeMismatch(Tag::Float, Tag::Nil))?;
                    let init = self.pop_value()?.as_float().ok_or(Error::TypeMismatch(Tag::Float, Tag::Nil))?;
                    // Upper bound is exclusive, matching `range()`: `for i = 1, 4`
                    // visits 1, 2, 3.
                    if (step > 0.0 && init >= limit) || (step < 0.0 && init <= limit) {
                        self.frames.current_mut().unwrap().pc = param as usize;
                    } else {
                        // `init` lands on top so the loop body can `Dup` it
                        // into a named local each iteration without a
                        // stack-rotate instruction.
                        self.push(Value::Float(limit));
                        self.push(Value::Float(step));
                        self.push(Value::Float(init));
                    }
                }
                Opcode::ForNumLoop => {
                    let cur = self.top_n(0)?.as_float().unwrap();
                    let step = self.top_n(1)?.as_float().unwrap();
                    let limit = self.top_n(2)?.as_float().unwrap();
                    let next = cur + step;
                    let done = (step > 0.0 && next >= limit) || (step < 0.0 && next <= limit);
                    if done {
                        self.pop(3)?;
                    } else {
                        let len = self.stack.len();
                        *self.stack[len - 1].borrow_mut() = Value::Float(next);
                        self.frames.current_mut().unwrap().pc = param as usize;
                    }
                }
                Opcode::Test => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let r = self.test(flag, a, b)?;
                    self.push(Value::Bool(r));
                }
                Opcode::Not => {
                    let v = self.pop_value()?;
                    self.push(Value::Bool(!v.truthy()));
                }
                Opcode::Neg => {
                    let v = self.pop_value()?;
                    self.push(match v {
                        Value::Int(i) => Value::Int(-i),
                        Value::Float(f) => Value::Float(-f),
                        other => return Err(Error::TypeMismatch(Tag::Int, Self::tag_of_value(other))),
                    });
                }
                Opcode::Inv => {
                    let v = self.pop_value()?;
                    match v {
                        Value::Int(i) => self.push(Value::Int(!i)),
                        other => return Err(Error::TypeMismatch(Tag::Int, Self::tag_of_value(other))),
                    }
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow
                | Opcode::Shl | Opcode::Shr | Opcode::ShrLogical
                | Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let r = Self::binary_numeric(op, a, b)?;
                    self.push(r);
                }
                Opcode::StrCat => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let sa = self.tostring(a);
                    let sb = self.tostring(b);
                    let h = self.vm.gc.intern(&(sa + &sb));
                    self.push(Value::Ref(h));
                }
                Opcode::Inc | Opcode::Dec => {
                    let v = self.pop_value()?;
                    let delta: i64 = if op == Opcode::Inc { 1 } else { -1 };
                    self.push(match v {
                        Value::Int(i) => Value::Int(i.wrapping_add(delta)),
                        Value::Float(f) => Value::Float(f + delta as f64),
                        other => return Err(Error::TypeMismatch(Tag::Int, Self::tag_of_value(other))),
                    });
                }
                Opcode::LoadArgv => {
                    let info = self.current()?;
                    let (base, adjust) = (info.base, info.adjust as usize);
                    let mut d = Dyay::with_capacity(adjust);
                    for cell in &self.stack[base..base + adjust] {
                        d.push(*cell.borrow());
                    }
                    let h = self.vm.gc.alloc(Object::Dyay(d));
                    self.push(Value::Ref(h));
                }
                Opcode::Typeof => {
                    let v = self.pop_value()?;
                    let name = self.type_name(v);
                    let h = self.vm.gc.intern(name);
                    self.push(Value::Ref(h));
                }
                Opcode::Pop => self.pop(param as usize)?,
                Opcode::Dup => {
                    let v = self.top()?;
                    self.push(v);
                }
            }
        }
    }

    fn const_str(&self, chunk: &Chunk, idx: u16) -> Result<String> {
        match chunk.constants.get(idx as usize) {
            Some(Value::Ref(h)) => Ok(self.vm.gc.as_str(*h).to_owned()),
            _ => Err(Error::IndexOutOfRange(idx as i64)),
        }
    }

    fn pop_value(&mut self) -> Result<Value> {
        let v = self.top()?;
        self.pop(1)?;
        Ok(v)
    }

    fn top_n(&self, back: usize) -> Result<Value> {
        let len = self.stack.len();
        if back >= len {
            return Err(Error::PopUnderflow);
        }
        Ok(*self.stack[len - 1 - back].borrow())
    }

    fn tag_of_value(v: Value) -> Tag {
        match v {
            Value::Nil => Tag::Nil,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Bool(_) => Tag::Bool,
            Value::Ext(_) => Tag::Ext,
            Value::Ref(_) => Tag::Str,
        }
    }

    pub fn type_name(&self, v: Value) -> &'static str {
        match v {
            Value::Nil => Tag::Nil.name(),
            Value::Int(_) => Tag::Int.name(),
            Value::Float(_) => Tag::Float.name(),
            Value::Bool(_) => Tag::Bool.name(),
            Value::Ext(_) => Tag::Ext.name(),
            Value::Ref(h) => self.vm.gc.get(h).tag().name(),
        }
    }

    pub fn tostring(&mut self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Ext(p) => format!("ext:{:p}", p),
            Value::Ref(h) => match self.vm.gc.get(h) {
                Object::Str(s) => s.as_str().to_owned(),
                Object::Dyay(d) => format!("array({})", d.count()),
                Object::Hmap(m) => format!("map({})", m.len()),
                Object::Skls(s) => format!("skiplist({})", s.len()),
                Object::Mand(_) => "managed".to_owned(),
                Object::Func(f) => format!("function<{}>", f.name()),
            },
        }
    }

    pub fn managed(&mut self, data: *mut std::ffi::c_void, finalizer: Option<crate::managed::Finalizer>) -> Value {
        let h = self.vm.gc.alloc(Object::Mand(Mand::new(data, finalizer)));
        Value::Ref(h)
    }

    pub fn gc(&mut self) {
        let roots = self.roots();
        self.vm.collect_now(&roots);
    }
}
