use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;

use crate::chunk::{Func, Upvalue};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::{Gc, Object};
use crate::hash_map::Hmap;
use crate::value::{Handle, Value};

/// Machine-wide state shared by every `Context` (execution thread)
/// created against it: the heap, the global table and the regex cache
/// backing the `TEST match` opcode. Mirrors the reference
/// implementation's split between VM-wide state and per-thread
/// context.
pub struct Vm {
    pub gc: Gc,
    pub globals: Hmap,
    pub config: Config,
    regex_cache: HashMap<String, Rc<Regex>>,
}

impl Vm {
    pub fn new(config: Config) -> Vm {
        let mut vm = Vm { gc: Gc::new(config), globals: Hmap::new(), config, regex_cache: HashMap::new() };
        crate::builtins::install(&mut vm);
        vm
    }

    pub fn context(&mut self) -> Context<'_> {
        Context::new(self)
    }

    pub fn intern(&mut self, s: &str) -> Handle {
        self.gc.intern(s)
    }

    pub fn define_global(&mut self, name: &str, v: Value) {
        let key = Value::Ref(self.gc.intern(name));
        self.globals.put(&self.gc, key, v);
    }

    pub fn native(&mut self, name: &str, arity: i32, f: crate::chunk::NativeFn) -> Value {
        let name_rc: Rc<str> = Rc::from(name);
        let h = self.gc.alloc_fixed(Object::Func(Func::Native { name: name_rc, arity, func: f, upvalues: Vec::new() }));
        Value::Ref(h)
    }

    pub fn regex_for(&mut self, pattern: &str) -> Result<Rc<Regex>> {
        if let Some(re) = self.regex_cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = Rc::new(Regex::new(pattern).map_err(|_| Error::Panic(format!("malformed pattern: {}", pattern)))?);
        self.regex_cache.insert(pattern.to_owned(), re.clone());
        Ok(re)
    }

    /// Root set contributed by VM-wide state: the global table's
    /// entries. Per-context stacks and frames are rooted separately by
    /// each `Context`.
    pub fn mark_roots(&self, out: &mut Vec<Handle>) {
        self.globals.children(out);
    }

    pub fn gc_step(&mut self, extra_roots: &[Handle]) {
        if self.gc.should_step() {
            let mut roots = Vec::new();
            self.mark_roots(&mut roots);
            roots.extend_from_slice(extra_roots);
            self.gc.step(&roots);
        }
    }

    pub fn collect_now(&mut self, extra_roots: &[Handle]) {
        let mut roots = Vec::new();
        self.mark_roots(&mut roots);
        roots.extend_from_slice(extra_roots);
        self.gc.collect_now(&roots);
    }
}

pub fn upvalue_of(v: Value) -> Upvalue {
    crate::chunk::new_upvalue(v)
}
