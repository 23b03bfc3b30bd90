//! Runs complete programs through the compiler and VM and checks the
//! resulting values, covering the same ground as `print`-based example
//! scripts but asserting on returned values rather than captured
//! stdout (the crate has no injectable writer for `print`, so scripts
//! below return what they would otherwise print).

use ymd::config::Config;
use ymd::value::Value;
use ymd::vm::Vm;
use ymd::{parser, Context};

fn run(source: &str) -> Vec<Value> {
    let mut vm = Vm::new(Config::default());
    let entry = parser::compile(&mut vm, "<e2e>", source).unwrap();
    let mut ctx = vm.context();
    ctx.call(entry, Vec::new()).unwrap()
}

fn run_str(source: &str) -> Vec<String> {
    let mut vm = Vm::new(Config::default());
    let entry = parser::compile(&mut vm, "<e2e>", source).unwrap();
    let mut ctx = vm.context();
    let results = ctx.call(entry, Vec::new()).unwrap();
    results.into_iter().map(|v| ctx.tostring(v)).collect()
}

fn array_to_ints(ctx: &mut Context, arr: Value) -> Vec<i64> {
    let len_fn = ctx.get_global("len");
    let count = ctx.call(len_fn, vec![arr]).unwrap()[0].as_int().unwrap();
    (0..count).map(|i| ctx.get_field(arr, Value::Int(i)).unwrap().as_int().unwrap()).collect()
}

#[test]
fn scenario_arithmetic() {
    assert_eq!(run("return 1 + 2 * 3;"), vec![Value::Int(7)]);
}

#[test]
fn scenario_branching() {
    assert_eq!(
        run_str("var x = 10; if x > 5 { return \"big\"; } else { return \"small\"; }"),
        vec!["big".to_owned()]
    );
}

#[test]
fn scenario_closure_and_upvalue() {
    let source = "\
        func mk() { var n = 0; return func() { n = n + 1; return n; }; } \
        var c = mk(); \
        var a = c(); var b = c(); var d = c(); \
        return a, b, d;";
    assert_eq!(run(source), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn scenario_skiplist_with_custom_comparator() {
    let source = "\
        var s = @[func(a, b) { return b - a; }]{ 1: \"a\", 2: \"b\", 3: \"c\" }; \
        var out = []; \
        for k in ranki(s) { append(out, k); } \
        return out;";
    let mut vm = Vm::new(Config::default());
    let entry = parser::compile(&mut vm, "<e2e>", source).unwrap();
    let mut ctx = vm.context();
    let arr = ctx.call(entry, Vec::new()).unwrap()[0];
    assert_eq!(array_to_ints(&mut ctx, arr), vec![3, 2, 1]);
}

#[test]
fn scenario_protected_panic() {
    assert_eq!(
        run_str("var r = pcall(func() { panic(\"boom\"); }); return r.error;"),
        vec!["boom".to_owned()]
    );
}

#[test]
fn scenario_numeric_for() {
    let source = "var out = []; for i = 1, 4 { append(out, i); } return out;";
    let mut vm = Vm::new(Config::default());
    let entry = parser::compile(&mut vm, "<e2e>", source).unwrap();
    let mut ctx = vm.context();
    let arr = ctx.call(entry, Vec::new()).unwrap()[0];
    assert_eq!(array_to_ints(&mut ctx, arr), vec![1, 2, 3]);
}

#[test]
fn print_builtin_accepts_multiple_args_without_erroring() {
    assert_eq!(run("print(\"a\", 1, true); return 0;"), vec![Value::Int(0)]);
}
