//! The fixed global library installed into every `Vm` at construction,
//! grounded on the reference implementation's `libc.c`. Out of scope:
//! file I/O, process control, the pattern-matching library call (the
//! `TEST match` opcode itself is implemented, see `context.rs`),
//! `import`/`eval`, and the bytecode pickler.

use std::cmp::Ordering;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gc::Object;
use crate::skip_list::natural_cmp;
use crate::value::{Tag, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    let print = vm.native("print", -1, print);
    vm.define_global("print", print);

    let len = vm.native("len", 1, len);
    vm.define_global("len", len);

    let str_ = vm.native("str", 1, str_fn);
    vm.define_global("str", str_);

    let typeof_ = vm.native("typeof", 1, typeof_fn);
    vm.define_global("typeof", typeof_);

    let insert = vm.native("insert", 3, insert);
    vm.define_global("insert", insert);

    let append = vm.native("append", 2, append);
    vm.define_global("append", append);

    let remove = vm.native("remove", 2, remove);
    vm.define_global("remove", remove);

    let range = vm.native("range", -1, range);
    vm.define_global("range", range);

    let rank = vm.native("rank", 1, rank);
    vm.define_global("rank", rank);

    let ranki = vm.native("ranki", 1, ranki);
    vm.define_global("ranki", ranki);

    let panic = vm.native("panic", 1, panic_fn);
    vm.define_global("panic", panic);

    let pcall = vm.native("pcall", -1, pcall_fn);
    vm.define_global("pcall", pcall);

    let error = vm.native("error", 1, error_fn);
    vm.define_global("error", error);

    let setmetatable = vm.native("setmetatable", 2, setmetatable_fn);
    vm.define_global("setmetatable", setmetatable);

    let metatable = vm.native("metatable", 1, metatable_fn);
    vm.define_global("metatable", metatable);

    let gc = vm.native("gc", 0, gc_fn);
    vm.define_global("gc", gc);

    // range/rank/ranki hand out iterator closures; the range iterator
    // needs a "next" template it binds fresh upvalues onto each call.
    let range_next = vm.native("range#next", 0, range_next);
    vm.define_global("range#next", range_next);
    let rank_next = vm.native("rank#next", 0, rank_next);
    vm.define_global("rank#next", rank_next);
    let ranki_next = vm.native("ranki#next", 0, ranki_next);
    vm.define_global("ranki#next", ranki_next);
}

fn print(ctx: &mut Context) -> Result<i32> {
    let mut parts = Vec::with_capacity(ctx.argc());
    for i in 0..ctx.argc() {
        parts.push(ctx.tostring(ctx.argv(i)?));
    }
    println!("{}", parts.join(" "));
    Ok(0)
}

fn len(ctx: &mut Context) -> Result<i32> {
    let v = ctx.argv(0)?;
    let h = v.as_ref().ok_or(Error::TypeMismatch(Tag::Str, Tag::Nil))?;
    let n = match ctx.vm().gc.get(h) {
        Object::Str(s) => s.len() as i64,
        Object::Dyay(d) => d.count() as i64,
        Object::Hmap(m) => m.len() as i64,
        Object::Skls(s) => s.len() as i64,
        other => return Err(Error::TypeMismatch(Tag::Str, other.tag())),
    };
    ctx.push(Value::Int(n));
    Ok(1)
}

fn str_fn(ctx: &mut Context) -> Result<i32> {
    let v = ctx.argv(0)?;
    let s = ctx.tostring(v);
    let h = ctx.vm().gc.intern(&s);
    ctx.push(Value::Ref(h));
    Ok(1)
}

fn typeof_fn(ctx: &mut Context) -> Result<i32> {
    let v = ctx.argv(0)?;
    let name = ctx.type_name(v);
    let h = ctx.vm().gc.intern(name);
    ctx.push(Value::Ref(h));
    Ok(1)
}

fn insert(ctx: &mut Context) -> Result<i32> {
    let container = ctx.argv(0)?;
    let key = ctx.argv(1)?;
    let value = ctx.argv(2)?;
    ctx.set_field(container, key, value)?;
    Ok(0)
}

fn append(ctx: &mut Context) -> Result<i32> {
    let container = ctx.argv(0)?;
    let value = ctx.argv(1)?;
    let h = container.as_ref().ok_or(Error::TypeMismatch(Tag::Dyay, Tag::Nil))?;
    let n = match ctx.vm().gc.get(h) {
        Object::Dyay(d) => d.count() as i64,
        other => return Err(Error::TypeMismatch(Tag::Dyay, other.tag())),
    };
    ctx.set_field(container, Value::Int(n), value)?;
    Ok(0)
}

fn remove(ctx: &mut Context) -> Result<i32> {
    let container = ctx.argv(0)?;
    let key = ctx.argv(1)?;
    let v = ctx.remove_field(container, key)?;
    ctx.push(v);
    Ok(1)
}

/// `range(...)`: one arg is a limit from 0, two is `(init, limit)`,
/// three is `(init, limit, step)`. Returns a closure over
/// `(next, limit, step)` that yields successive values and `nil` at
/// exhaustion, per the iterators-as-closures idiom.
fn range(ctx: &mut Context) -> Result<i32> {
    let (init, limit, step) = match ctx.argc() {
        1 => (0i64, ctx.argv(0)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?, 1i64),
        2 => (
            ctx.argv(0)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?,
            ctx.argv(1)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?,
            1i64,
        ),
        _ => (
            ctx.argv(0)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?,
            ctx.argv(1)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?,
            ctx.argv(2)?.as_int().ok_or(Error::TypeMismatch(Tag::Int, Tag::Nil))?,
        ),
    };
    if step == 0 {
        return Err(Error::Panic("range step must not be zero".to_owned()));
    }
    let template = ctx.get_global("range#next");
    let closure = ctx.bind(template, vec![Value::Int(init), Value::Int(limit), Value::Int(step)])?;
    ctx.push(closure);
    Ok(1)
}

fn range_next(ctx: &mut Context) -> Result<i32> {
    let cur = ctx.upval(0)?.as_int().unwrap();
    let limit = ctx.upval(1)?.as_int().unwrap();
    let step = ctx.upval(2)?.as_int().unwrap();
    let done = (step > 0 && cur >= limit) || (step < 0 && cur <= limit);
    if done {
        ctx.push(Value::Nil);
        return Ok(1);
    }
    ctx.set_upval(0, Value::Int(cur + step))?;
    ctx.push(Value::Int(cur));
    Ok(1)
}

fn skls_comparator(ctx: &mut Context, h: crate::value::Handle) -> Result<(crate::skip_list::Order, Option<Value>)> {
    match ctx.vm().gc.get(h) {
        Object::Skls(s) => Ok((s.order(), s.comparator())),
        other => Err(Error::TypeMismatch(Tag::Skls, other.tag())),
    }
}

/// `rank(skiplist)`: iterator over keys in forward order.
fn rank(ctx: &mut Context) -> Result<i32> {
    let v = ctx.argv(0)?;
    let h = v.as_ref().ok_or(Error::TypeMismatch(Tag::Skls, Tag::Nil))?;
    skls_comparator(ctx, h)?;
    let template = ctx.get_global("rank#next");
    let closure = ctx.bind(template, vec![v, Value::Bool(false), Value::Nil, Value::Bool(false)])?;
    ctx.push(closure);
    Ok(1)
}

/// `ranki(skiplist)`: iterator over `(key, value)` pairs in forward order.
fn ranki(ctx: &mut Context) -> Result<i32> {
    let v = ctx.argv(0)?;
    let h = v.as_ref().ok_or(Error::TypeMismatch(Tag::Skls, Tag::Nil))?;
    skls_comparator(ctx, h)?;
    let template = ctx.get_global("ranki#next");
    let closure = ctx.bind(template, vec![v, Value::Bool(false), Value::Nil, Value::Bool(false)])?;
    ctx.push(closure);
    Ok(1)
}

/// Shared walk step for `rank`/`ranki`: the bound upvalues are
/// `(skiplist, started, last_key, done)`. `started`/`done` are
/// separate flags rather than folded into `last_key`, since a real key
/// may equal whatever sentinel value got chosen from the value domain
/// (e.g. a skip list keyed by integer 0).
fn rank_step(ctx: &mut Context, pairs: bool) -> Result<i32> {
    if ctx.upval(3)?.truthy() {
        ctx.push(Value::Nil);
        return Ok(1);
    }
    let skls_val = ctx.upval(0)?;
    let h = skls_val.as_ref().unwrap();
    let (order, comparator) = skls_comparator(ctx, h)?;
    let started = ctx.upval(1)?.truthy();
    let found = if !started {
        skip_first(ctx, h, order, comparator)?
    } else {
        let cursor = ctx.upval(2)?;
        skip_after(ctx, h, order, comparator, cursor)?
    };
    ctx.set_upval(1, Value::Bool(true))?;
    match found {
        Some((k, v)) => {
            ctx.set_upval(2, k)?;
            if pairs {
                ctx.push(k);
                ctx.push(v);
                Ok(2)
            } else {
                ctx.push(k);
                Ok(1)
            }
        }
        None => {
            ctx.set_upval(3, Value::Bool(true))?;
            ctx.push(Value::Nil);
            Ok(1)
        }
    }
}

fn skip_first(
    ctx: &mut Context,
    h: crate::value::Handle,
    order: crate::skip_list::Order,
    comparator: Option<Value>,
) -> Result<Option<(Value, Value)>> {
    with_skls(ctx, h, order, comparator, |s, _cmp| Ok(s.iter().next()))
}

fn skip_after(
    ctx: &mut Context,
    h: crate::value::Handle,
    order: crate::skip_list::Order,
    comparator: Option<Value>,
    after: Value,
) -> Result<Option<(Value, Value)>> {
    with_skls(ctx, h, order, comparator, |s, cmp| {
        for (k, v) in s.iter() {
            if cmp(&k, &after)? == Ordering::Greater {
                return Ok(Some((k, v)));
            }
        }
        Ok(None)
    })
}

/// Borrows the skip list's comparator (re-entering the VM for a custom
/// one) for the duration of `f`, using the same detach/reattach
/// approach as field access on a skip list.
fn with_skls<R>(
    ctx: &mut Context,
    h: crate::value::Handle,
    order: crate::skip_list::Order,
    comparator: Option<Value>,
    f: impl FnOnce(&crate::skip_list::Skls, &mut crate::skip_list::Cmp) -> Result<R>,
) -> Result<R> {
    match order {
        crate::skip_list::Order::Custom => {
            let comparator = comparator.ok_or(Error::NoMetatable)?;
            let obj = ctx.vm().gc.take(h);
            let skls = match obj {
                Object::Skls(s) => s,
                other => {
                    let t = other.tag();
                    ctx.vm().gc.restore(h, other);
                    return Err(Error::TypeMismatch(Tag::Skls, t));
                }
            };
            let mut cmp = |a: &Value, b: &Value| -> Result<Ordering> {
                let res = ctx.call(comparator, vec![*a, *b])?;
                Ok(res.get(0).and_then(|v| v.as_int()).unwrap_or(0).cmp(&0))
            };
            let result = f(&skls, &mut cmp);
            ctx.vm().gc.restore(h, Object::Skls(skls));
            result
        }
        _ => {
            let obj = ctx.vm().gc.take(h);
            let skls = match obj {
                Object::Skls(s) => s,
                other => {
                    let t = other.tag();
                    ctx.vm().gc.restore(h, other);
                    return Err(Error::TypeMismatch(Tag::Skls, t));
                }
            };
            let mut cmp = natural_cmp(&ctx.vm().gc, order);
            let result = f(&skls, &mut cmp);
            ctx.vm().gc.restore(h, Object::Skls(skls));
            result
        }
    }
}

fn rank_next(ctx: &mut Context) -> Result<i32> {
    rank_step(ctx, false)
}

fn ranki_next(ctx: &mut Context) -> Result<i32> {
    rank_step(ctx, true)
}

fn panic_fn(ctx: &mut Context) -> Result<i32> {
    let msg = ctx.tostring(ctx.argv(0)?);
    ctx.error(msg)
}

/// Script-level `pcall` collapses the embedding API's flat
/// `(ok, ...)`/`(ok, message)` result into a single map with `ok`,
/// `error` and `results` fields, so a caller can write
/// `var r = pcall(f); if r.ok { ... } else { print(r.error) }`.
fn pcall_fn(ctx: &mut Context) -> Result<i32> {
    let callee = ctx.argv(0)?;
    let mut args = Vec::with_capacity(ctx.argc().saturating_sub(1));
    for i in 1..ctx.argc() {
        args.push(ctx.argv(i)?);
    }
    let mut results = ctx.pcall(callee, args)?;
    let ok = matches!(results.first(), Some(Value::Bool(true)));
    results.remove(0);

    let mut m = crate::hash_map::Hmap::new();
    let ok_key = Value::Ref(ctx.vm().gc.intern("ok"));
    m.put(&ctx.vm().gc, ok_key, Value::Bool(ok));
    if ok {
        let mut arr = crate::array::Dyay::with_capacity(results.len());
        for v in results {
            arr.push(v);
        }
        let arr_h = ctx.vm().gc.alloc(Object::Dyay(arr));
        let results_key = Value::Ref(ctx.vm().gc.intern("results"));
        m.put(&ctx.vm().gc, results_key, Value::Ref(arr_h));
    } else {
        let error_key = Value::Ref(ctx.vm().gc.intern("error"));
        let msg = results.into_iter().next().unwrap_or(Value::Nil);
        m.put(&ctx.vm().gc, error_key, msg);
    }
    let h = ctx.vm().gc.alloc(Object::Hmap(m));
    ctx.push(Value::Ref(h));
    Ok(1)
}

fn error_fn(ctx: &mut Context) -> Result<i32> {
    let msg = ctx.tostring(ctx.argv(0)?);
    ctx.error(msg)
}

fn setmetatable_fn(ctx: &mut Context) -> Result<i32> {
    let mand = ctx.argv(0)?;
    let table = ctx.argv(1)?;
    let h = mand.as_ref().ok_or(Error::TypeMismatch(Tag::Mand, Tag::Nil))?;
    let mt = if table == Value::Nil { None } else { table.as_ref() };
    match ctx.vm().gc.get_mut(h) {
        Object::Mand(m) => m.set_metatable(mt),
        other => return Err(Error::TypeMismatch(Tag::Mand, other.tag())),
    }
    ctx.push(mand);
    Ok(1)
}

fn metatable_fn(ctx: &mut Context) -> Result<i32> {
    let mand = ctx.argv(0)?;
    let h = mand.as_ref().ok_or(Error::TypeMismatch(Tag::Mand, Tag::Nil))?;
    let mt = match ctx.vm().gc.get(h) {
        Object::Mand(m) => m.metatable(),
        other => return Err(Error::TypeMismatch(Tag::Mand, other.tag())),
    };
    ctx.push(mt.map(Value::Ref).unwrap_or(Value::Nil));
    Ok(1)
}

fn gc_fn(ctx: &mut Context) -> Result<i32> {
    ctx.gc();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vm::Vm;

    #[test]
    fn len_reports_container_sizes() {
        let mut vm = Vm::new(Config::default());
        let mut ctx = vm.context();
        let h = ctx.vm().gc.intern("hello");
        let template = ctx.get_global("len");
        let results = ctx.call(template, vec![Value::Ref(h)]).unwrap();
        assert_eq!(results[0], Value::Int(5));
    }

    #[test]
    fn range_iterator_yields_then_exhausts() {
        let mut vm = Vm::new(Config::default());
        let mut ctx = vm.context();
        let range_fn = ctx.get_global("range");
        let iter = ctx.call(range_fn, vec![Value::Int(3)]).unwrap()[0];
        let mut seen = Vec::new();
        loop {
            let v = ctx.call(iter, vec![]).unwrap()[0];
            if v == Value::Nil {
                break;
            }
            seen.push(v.as_int().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn typeof_reports_builtin_type_names() {
        let mut vm = Vm::new(Config::default());
        let mut ctx = vm.context();
        let typeof_fn = ctx.get_global("typeof");
        let results = ctx.call(typeof_fn, vec![Value::Int(1)]).unwrap();
        let name = ctx.tostring(results[0]);
        assert_eq!(name, "int");
    }
}
