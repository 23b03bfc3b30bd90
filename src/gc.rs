use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::array::Dyay;
use crate::chunk::Func;
use crate::config::Config;
use crate::hash_map::Hmap;
use crate::managed::Mand;
use crate::skip_list::Skls;
use crate::error::{Error, Result};
use crate::value::{Handle, Tag, Value};
use std::cmp::Ordering;

/// Anything a `Gc` can store in an arena slot must say which other
/// handles it holds, so the collector can walk the graph without
/// knowing the concrete container types.
pub trait Trace {
    fn children(&self, out: &mut Vec<Handle>);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    White0,
    White1,
    Gray,
    Black,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Pause,
    Propagate,
    SweepString,
    Sweep,
    Finalize,
}

pub enum Object {
    Str(Rc<String>),
    Func(Func),
    Dyay(Dyay),
    Hmap(Hmap),
    Skls(Skls),
    Mand(Mand),
}

impl Object {
    pub fn tag(&self) -> Tag {
        match self {
            Object::Str(_) => Tag::Str,
            Object::Func(_) => Tag::Func,
            Object::Dyay(_) => Tag::Dyay,
            Object::Hmap(_) => Tag::Hmap,
            Object::Skls(_) => Tag::Skls,
            Object::Mand(_) => Tag::Mand,
        }
    }
}

impl Trace for Object {
    fn children(&self, out: &mut Vec<Handle>) {
        match self {
            Object::Str(_) => {}
            Object::Func(f) => f.children(out),
            Object::Dyay(d) => d.children(out),
            Object::Hmap(h) => h.children(out),
            Object::Skls(s) => s.children(out),
            Object::Mand(m) => m.children(out),
        }
    }
}

struct Slot {
    object: Option<Object>,
    color: Color,
    fixed: bool,
}

/// Incremental tri-color mark-sweep heap. Roots are supplied by the
/// caller (the VM's stack, globals and open upvalues) at the start of
/// each `Propagate` phase rather than tracked internally, matching the
/// reference collector's `gc_step` contract.
pub struct Gc {
    config: Config,
    slots: Vec<Slot>,
    free: Vec<Handle>,
    gray: Vec<Handle>,
    gray_again: Vec<Handle>,
    current_white: Color,
    phase: Phase,
    n_alloced: usize,
    pause: usize,
    sweep_cursor: usize,
    sweep_string_cursor: usize,
    pool: HashMap<String, Handle>,
    pending_finalize: Vec<Object>,
    pub cycles: u64,
}

impl Gc {
    pub fn new(config: Config) -> Gc {
        Gc {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            gray_again: Vec::new(),
            current_white: Color::White0,
            phase: Phase::Pause,
            n_alloced: 0,
            pause: config.gc_threshold,
            sweep_cursor: 0,
            sweep_string_cursor: 0,
            pool: HashMap::new(),
            pending_finalize: Vec::new(),
            cycles: 0,
        }
    }

    fn other_white(&self) -> Color {
        match self.current_white {
            Color::White0 => Color::White1,
            Color::White1 => Color::White0,
            _ => unreachable!(),
        }
    }

    fn is_white(&self, color: Color) -> bool {
        color == Color::White0 || color == Color::White1
    }

    pub fn alloc(&mut self, object: Object) -> Handle {
        self.n_alloced += 1;
        let color = self.current_white;
        if let Some(h) = self.free.pop() {
            self.slots[h] = Slot { object: Some(object), color, fixed: false };
            h
        } else {
            self.slots.push(Slot { object: Some(object), color, fixed: false });
            self.slots.len() - 1
        }
    }

    /// Allocates an object that the collector must never free, e.g. the
    /// well-known constant strings installed at startup.
    pub fn alloc_fixed(&mut self, object: Object) -> Handle {
        let h = self.alloc(object);
        self.slots[h].fixed = true;
        self.slots[h].color = Color::Black;
        h
    }

    /// Interns short strings (below `config.pool_threshold` bytes) so
    /// structurally equal string literals share a handle. Longer strings
    /// are allocated directly, uninterned.
    pub fn intern(&mut self, s: &str) -> Handle {
        if s.len() < self.config.pool_threshold {
            if let Some(&h) = self.pool.get(s) {
                if self.slots[h].object.is_some() {
                    return h;
                }
            }
            let h = self.alloc(Object::Str(Rc::new(s.to_owned())));
            self.pool.insert(s.to_owned(), h);
            h
        } else {
            self.alloc(Object::Str(Rc::new(s.to_owned())))
        }
    }

    pub fn get(&self, h: Handle) -> &Object {
        self.slots[h].object.as_ref().expect("dangling handle")
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut Object {
        self.slots[h].object.as_mut().expect("dangling handle")
    }

    /// Temporarily detaches an object from the arena so its mutating
    /// methods can take `&Gc` (or call back into the VM) without
    /// aliasing the slot they came from. Pair with `restore`.
    pub fn take(&mut self, h: Handle) -> Object {
        self.slots[h].object.take().expect("dangling handle")
    }

    pub fn restore(&mut self, h: Handle, object: Object) {
        self.slots[h].object = Some(object);
    }

    pub fn as_str(&self, h: Handle) -> &str {
        match self.get(h) {
            Object::Str(s) => s.as_str(),
            _ => panic!("handle {} is not a string", h),
        }
    }

    /// Marks a root handle gray, to be called once per root at the
    /// start of `Propagate`. Idempotent: already-black or already-gray
    /// handles are left alone.
    pub fn mark(&mut self, h: Handle) {
        let slot = &mut self.slots[h];
        if self.is_white(slot.color) {
            slot.color = Color::Gray;
            self.gray.push(h);
        }
    }

    /// Re-marks an object mutated after being blackened (a write
    /// barrier call site), so its new children survive this cycle.
    pub fn barrier(&mut self, h: Handle) {
        let slot = &mut self.slots[h];
        if slot.color == Color::Black {
            slot.color = Color::Gray;
            self.gray_again.push(h);
        }
    }

    fn blacken(&mut self, h: Handle) {
        let mut children = Vec::new();
        self.slots[h].object.as_ref().unwrap().children(&mut children);
        self.slots[h].color = Color::Black;
        for child in children {
            self.mark(child);
        }
    }

    /// Runs one bounded unit of collection work. `roots` is consulted
    /// only when transitioning out of `Pause`; subsequent calls during
    /// the same cycle drain the gray set that `mark`/`barrier` built up.
    pub fn step(&mut self, roots: &[Handle]) {
        match self.phase {
            Phase::Pause => {
                for &r in roots {
                    self.mark(r);
                }
                self.phase = Phase::Propagate;
                crate::trace!("gc: pause -> propagate, {} roots", roots.len());
            }
            Phase::Propagate => {
                if let Some(h) = self.gray.pop().or_else(|| self.gray_again.pop()) {
                    self.blacken(h);
                } else {
                    self.sweep_string_cursor = 0;
                    self.phase = Phase::SweepString;
                    crate::trace!("gc: propagate -> sweepstring");
                }
            }
            Phase::SweepString => {
                let keys: Vec<String> = self
                    .pool
                    .keys()
                    .skip(self.sweep_string_cursor)
                    .take(self.config.sweep_string_step)
                    .cloned()
                    .collect();
                let advanced = keys.len();
                for k in &keys {
                    if let Some(&h) = self.pool.get(k) {
                        let dead = self
                            .slots
                            .get(h)
                            .and_then(|s| s.object.as_ref())
                            .is_none();
                        if dead {
                            self.pool.remove(k);
                        }
                    }
                }
                self.sweep_string_cursor += advanced;
                if advanced < self.config.sweep_string_step {
                    self.sweep_cursor = 0;
                    self.phase = Phase::Sweep;
                    crate::trace!("gc: sweepstring -> sweep");
                }
            }
            Phase::Sweep => {
                let end = (self.sweep_cursor + self.config.sweep_step).min(self.slots.len());
                for i in self.sweep_cursor..end {
                    let dead = {
                        let slot = &self.slots[i];
                        !slot.fixed && slot.object.is_some() && self.is_white(slot.color)
                    };
                    if dead {
                        if let Some(Object::Mand(m)) = self.slots[i].object.as_ref() {
                            if m.has_finalizer() {
                                let obj = self.slots[i].object.take().unwrap();
                                self.pending_finalize.push(obj);
                                self.free.push(i);
                                continue;
                            }
                        }
                        self.slots[i].object = None;
                        self.free.push(i);
                    } else if let Some(slot) = self.slots.get_mut(i) {
                        if slot.object.is_some() && !slot.fixed {
                            slot.color = self.current_white;
                        }
                    }
                }
                self.sweep_cursor = end;
                if self.sweep_cursor >= self.slots.len() {
                    self.phase = Phase::Finalize;
                    crate::trace!("gc: sweep -> finalize");
                }
            }
            Phase::Finalize => {
                for obj in self.pending_finalize.drain(..) {
                    if let Object::Mand(m) = &obj {
                        m.finalize();
                    }
                }
                self.current_white = self.other_white();
                self.n_alloced = 0;
                self.cycles += 1;
                self.phase = Phase::Pause;
                crate::trace!("gc: finalize -> pause (cycle {})", self.cycles);
            }
        }
    }

    pub fn should_step(&self) -> bool {
        self.phase != Phase::Pause || self.n_alloced >= self.pause
    }

    /// Runs whole cycles until back to `Pause`, for `gc()` and tests
    /// that need a deterministic, fully-collected heap.
    pub fn collect_now(&mut self, roots: &[Handle]) {
        self.step(roots);
        while self.phase != Phase::Pause {
            self.step(roots);
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }
}

/// Hashes a value the way the VM's container types need to: short and
/// long strings hash by content so keys survive being copied between
/// interned and non-interned handles, everything else by its bit
/// pattern or handle identity.
pub fn value_hash(gc: &Gc, v: &Value) -> u64 {
    let mut h = DefaultHasher::new();
    match v {
        Value::Nil => 0u8.hash(&mut h),
        Value::Bool(b) => b.hash(&mut h),
        Value::Int(i) => i.hash(&mut h),
        Value::Float(f) => f.to_bits().hash(&mut h),
        Value::Ext(p) => (*p as usize).hash(&mut h),
        Value::Ref(r) => match gc.get(*r) {
            Object::Str(s) => s.as_str().hash(&mut h),
            _ => r.hash(&mut h),
        },
    }
    h.finish()
}

/// Value equality for container keys and the `==`/`!=` tests: same
/// handle is always equal; distinct handles of the same subtype compare
/// by content (string bytes, array elements in order, hash-map entries,
/// skip-list entries). Does not guard against cyclic containers.
pub fn value_equals(gc: &Gc, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Ref(ra), Value::Ref(rb)) => {
            if ra == rb {
                return true;
            }
            match (gc.get(*ra), gc.get(*rb)) {
                (Object::Str(sa), Object::Str(sb)) => sa == sb,
                (Object::Dyay(da), Object::Dyay(db)) => {
                    da.count() == db.count()
                        && da.iter().zip(db.iter()).all(|(x, y)| value_equals(gc, x, y))
                }
                (Object::Hmap(ma), Object::Hmap(mb)) => {
                    ma.len() == mb.len()
                        && ma.iter().all(|(k, v)| mb.get(gc, &k).is_some_and(|v2| value_equals(gc, &v, &v2)))
                }
                (Object::Skls(sa), Object::Skls(sb)) => {
                    sa.len() == sb.len()
                        && sa.iter().zip(sb.iter()).all(|((ka, va), (kb, vb))| {
                            value_equals(gc, &ka, &kb) && value_equals(gc, &va, &vb)
                        })
                }
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// Default ordering used by ascending/descending skip lists and the
/// `<` family of opcodes: numeric values compare numerically across
/// `Int`/`Float`, strings compare by content, everything else must
/// match tags or the comparison is a type error.
pub fn value_compare(gc: &Gc, a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => {
            (*x as f64).partial_cmp(y).ok_or(Error::DivideByZero)
        }
        (Value::Float(x), Value::Int(y)) => {
            x.partial_cmp(&(*y as f64)).ok_or(Error::DivideByZero)
        }
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).ok_or(Error::DivideByZero),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Ref(ra), Value::Ref(rb)) => match (gc.get(*ra), gc.get(*rb)) {
            (Object::Str(sa), Object::Str(sb)) => Ok(sa.as_str().cmp(sb.as_str())),
            _ => Err(Error::TypeMismatch(gc.get(*ra).tag(), gc.get(*rb).tag())),
        },
        _ => Err(Error::TypeMismatch(tag_of(gc, a), tag_of(gc, b))),
    }
}

fn tag_of(gc: &Gc, v: &Value) -> Tag {
    match v {
        Value::Nil => Tag::Nil,
        Value::Int(_) => Tag::Int,
        Value::Float(_) => Tag::Float,
        Value::Bool(_) => Tag::Bool,
        Value::Ext(_) => Tag::Ext,
        Value::Ref(h) => gc.get(*h).tag(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc() -> Gc {
        Gc::new(Config::default())
    }

    #[test]
    fn interning_dedupes_short_strings() {
        let mut gc = gc();
        let a = gc.intern("hi");
        let b = gc.intern("hi");
        assert_eq!(a, b);
    }

    #[test]
    fn long_strings_are_not_interned() {
        let mut gc = gc();
        let long = "x".repeat(64);
        let a = gc.intern(&long);
        let b = gc.intern(&long);
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_objects_are_freed_after_a_full_cycle() {
        let mut gc = gc();
        let h = gc.intern(&"y".repeat(64));
        assert_eq!(gc.live_count(), 1);
        gc.collect_now(&[]);
        assert_eq!(gc.live_count(), 0);
        let _ = h;
    }

    #[test]
    fn rooted_objects_survive_a_cycle() {
        let mut gc = gc();
        let h = gc.intern(&"z".repeat(64));
        gc.collect_now(&[h]);
        assert_eq!(gc.live_count(), 1);
    }
}
