use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;
use crate::error::Result;
use crate::value::{Handle, Value};

/// A mutable cell shared between a frame's local slot and any closure
/// that captured it. Kept as a plain `Rc<RefCell<Value>>` rather than a
/// traced heap object: it never participates in a reference cycle on
/// its own; any `Gc` handles its `Value` points at are rooted through
/// whichever `Func` still holds the cell.
pub type Upvalue = Rc<RefCell<Value>>;

pub fn new_upvalue(v: Value) -> Upvalue {
    Rc::new(RefCell::new(v))
}

/// Where a compiled function's parameter/local layout places a given
/// captured name, resolved once at compile time.
#[derive(Clone, Copy, Debug)]
pub enum UpvalDesc {
    /// Captures a local slot of the immediately enclosing function.
    ParentLocal(u16),
    /// Captures an upvalue already held by the immediately enclosing
    /// function (transitive capture across more than one nesting level).
    ParentUpval(u16),
}

/// Immutable compiled body, shared by every closure created from the
/// same function literal. `Rc`-shared rather than GC-traced: chunks
/// never form cycles among themselves, only through the closures that
/// wrap them, which the GC does trace.
pub struct Chunk {
    pub file: String,
    pub name: String,
    pub code: Vec<u32>,
    pub lines: Vec<i32>,
    pub constants: Vec<Value>,
    pub upval_desc: Vec<UpvalDesc>,
    pub n_params: u8,
    pub vargs: bool,
    pub max_locals: u16,
}

pub type NativeFn = fn(&mut Context) -> Result<i32>;

/// A callable value (`func`). Both variants carry bound upvalues so
/// the "iterators as closures" idiom works uniformly for builtins
/// written in Rust and closures written in script.
pub enum Func {
    Script { chunk: Rc<Chunk>, upvalues: Vec<Upvalue> },
    Native { name: Rc<str>, arity: i32, func: NativeFn, upvalues: Vec<Upvalue> },
}

impl Func {
    pub fn name(&self) -> &str {
        match self {
            Func::Script { chunk, .. } => &chunk.name,
            Func::Native { name, .. } => name,
        }
    }

    pub fn arity(&self) -> i32 {
        match self {
            Func::Script { chunk, .. } => chunk.n_params as i32,
            Func::Native { arity, .. } => *arity,
        }
    }

    pub fn is_vararg(&self) -> bool {
        match self {
            Func::Script { chunk, .. } => chunk.vargs,
            Func::Native { arity, .. } => *arity < 0,
        }
    }

    pub fn upvalues(&self) -> &[Upvalue] {
        match self {
            Func::Script { upvalues, .. } => upvalues,
            Func::Native { upvalues, .. } => upvalues,
        }
    }

    pub fn children(&self, out: &mut Vec<Handle>) {
        let upvalues = self.upvalues();
        for uv in upvalues {
            if let Value::Ref(h) = *uv.borrow() {
                out.push(h);
            }
        }
        if let Func::Script { chunk, .. } = self {
            for c in &chunk.constants {
                if let Value::Ref(h) = c {
                    out.push(*h);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upvalue_cell_is_shared_by_clone() {
        let cell = new_upvalue(Value::Int(1));
        let alias = cell.clone();
        *alias.borrow_mut() = Value::Int(2);
        assert_eq!(*cell.borrow(), Value::Int(2));
    }
}
