// programs.rs — Demo programs written against the construction facade
//
// Each program is a module of one or more functions plus a driver that plays
// the native caller: it lays inputs out on the heap, calls the entry point
// through the harness, and renders what comes back.
//
// Preconditions: none.
// Postconditions: every `build` yields a module with all functions defined.
// Failure modes: construction diagnostics propagate from the builder; driver
//                failures are `Trap`s.
// Side effects: drivers mutate the harness heap.

use crate::builder::FunctionBuilder;
use crate::diag::Diagnostic;
use crate::exec::{Arg, Harness, Returned, Trap};
use crate::graph::{Module, RetType};
use crate::id::TypeId;
use crate::layout::{array_layout, struct_layout, ArrayLayout, StructLayout};
use crate::runtime::HostString;
use crate::types::{Nil, TypeTable};

pub type Driver = fn(&mut Harness<'_>, &[i64]) -> Result<String, Trap>;

pub struct Program {
    pub name: &'static str,
    pub entry: &'static str,
    pub summary: &'static str,
    pub build: fn() -> Result<Module, Diagnostic>,
    pub run: Driver,
}

pub const ALL: &[Program] = &[
    Program {
        name: "sieve",
        entry: "sieve",
        summary: "primes below N as a fresh u32 array",
        build: sieve,
        run: run_sieve,
    },
    Program {
        name: "merge_sort",
        entry: "merge_sort",
        summary: "in-place top-down merge sort of an int array",
        build: merge_sort,
        run: run_merge_sort,
    },
    Program {
        name: "strings",
        entry: "equals",
        summary: "String equality and cached hashCode",
        build: strings,
        run: run_strings,
    },
    Program {
        name: "person",
        entry: "fcn",
        summary: "increment ps[x].age through a nullable struct array",
        build: person,
        run: run_person,
    },
    Program {
        name: "pair",
        entry: "make_pair",
        summary: "struct returned by value",
        build: pair,
        run: run_pair,
    },
    Program {
        name: "add_all",
        entry: "add_all",
        summary: "new int array with k added to each element",
        build: add_all,
        run: run_add_all,
    },
];

pub fn find(name: &str) -> Option<&'static Program> {
    ALL.iter().find(|p| p.name == name)
}

/// Primes below 100, in ascending order.
pub const PRIMES_BELOW_100: [i64; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97,
];

// ── Shared shapes ───────────────────────────────────────────────────────────

pub fn person_type(t: &mut TypeTable) -> TypeId {
    let i32t = t.int(i32::MIN as i64, i32::MAX as i64);
    t.struct_type("Person", &[("age", i32t)])
}

pub fn pair_type(t: &mut TypeTable) -> TypeId {
    t.struct_type("Pair", &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)])
}

fn incr(b: &mut FunctionBuilder, var: &str) -> Result<(), Diagnostic> {
    let v = b.get(var)?;
    let one = b.con(1);
    let next = b.add(v, one)?;
    b.set(var, next)
}

fn ret_con(b: &mut FunctionBuilder, value: i64) -> Result<(), Diagnostic> {
    let c = b.con(value);
    b.ret(Some(c))
}

// ── Sieve ───────────────────────────────────────────────────────────────────

pub fn sieve() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    let mut b = FunctionBuilder::new(&mut m, "sieve");
    let rez_ty = b.types().array_ptr(TypeId::U32);
    b.start(&[("N", TypeId::INT_BOT)], RetType::Scalar(rez_ty))?;

    let n = b.get("N")?;
    let ary = b.new_array(TypeId::BOOL, n)?;
    b.define("ary", ary)?;
    let one = b.con(1);
    let half = b.shr(n, one)?;
    let primes = b.new_array(TypeId::U32, half)?;
    b.define("primes", primes)?;
    let zero = b.con(0);
    b.define("nprimes", zero)?;
    let two = b.con(2);
    b.define("p", two)?;

    // Mark multiples while p*p < N.
    b.while_loop(
        |b| {
            let p = b.get("p")?;
            let pp = b.mul(p, p)?;
            let n = b.get("N")?;
            b.lt(pp, n)
        },
        |b| {
            b.while_loop(
                |b| {
                    let (ary, p) = (b.get("ary")?, b.get("p")?);
                    b.load_elem(ary, p)
                },
                |b| incr(b, "p"),
            )?;
            let (primes, np, p) = (b.get("primes")?, b.get("nprimes")?, b.get("p")?);
            b.store_elem(primes, np, p)?;
            incr(b, "nprimes")?;
            let p = b.get("p")?;
            let first = b.add(p, p)?;
            b.define("i", first)?;
            b.while_loop(
                |b| {
                    let (i, ary) = (b.get("i")?, b.get("ary")?);
                    let len = b.array_len(ary)?;
                    b.lt(i, len)
                },
                |b| {
                    let (ary, i) = (b.get("ary")?, b.get("i")?);
                    let t = b.con(1);
                    b.store_elem(ary, i, t)?;
                    let p = b.get("p")?;
                    let next = b.add(i, p)?;
                    b.set("i", next)
                },
            )?;
            incr(b, "p")
        },
    )?;

    // Collect the rest without marking.
    b.while_loop(
        |b| {
            let (p, n) = (b.get("p")?, b.get("N")?);
            b.lt(p, n)
        },
        |b| {
            let (ary, p) = (b.get("ary")?, b.get("p")?);
            let marked = b.load_elem(ary, p)?;
            let prime = b.not(marked)?;
            b.if_then(prime, |b| {
                let (primes, np, p) = (b.get("primes")?, b.get("nprimes")?, b.get("p")?);
                b.store_elem(primes, np, p)?;
                incr(b, "nprimes")
            })?;
            incr(b, "p")
        },
    )?;

    let np = b.get("nprimes")?;
    let rez = b.new_array(TypeId::U32, np)?;
    b.define("rez", rez)?;
    let zero = b.con(0);
    b.for_range("j", zero, np, |b| {
        let (rez, primes, j) = (b.get("rez")?, b.get("primes")?, b.get("j")?);
        let v = b.load_elem(primes, j)?;
        b.store_elem(rez, j, v)
    })?;
    let rez = b.get("rez")?;
    b.ret(Some(rez))?;
    m.define(b.finish()?)?;
    Ok(m)
}

// ── Merge sort ──────────────────────────────────────────────────────────────

pub fn merge_sort() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    m.declare("merge_sort");
    let split = m.declare("split_merge");
    let merge = m.declare("merge");
    let copy = m.declare("copy_array");

    // merge_sort(a): sort `a` using a scratch copy.
    let mut b = FunctionBuilder::new(&mut m, "merge_sort");
    let ints = b.types().array_ptr(TypeId::INT_BOT);
    b.start(&[("a", ints)], RetType::Void)?;
    let a = b.get("a")?;
    let len = b.array_len(a)?;
    let scratch = b.new_array(TypeId::INT_BOT, len)?;
    let zero = b.con(0);
    b.call(copy, TypeId::BOTTOM, &[a, zero, len, scratch])?;
    b.call(split, TypeId::INT_BOT, &[a, zero, len, scratch])?;
    m.define(b.finish()?)?;

    // split_merge(b, begin, end, a): sort a[begin..end) into b.
    let mut f = FunctionBuilder::new(&mut m, "split_merge");
    let ints = f.types().array_ptr(TypeId::INT_BOT);
    f.start(
        &[
            ("b", ints),
            ("begin", TypeId::INT_BOT),
            ("end", TypeId::INT_BOT),
            ("a", ints),
        ],
        RetType::Scalar(TypeId::INT_BOT),
    )?;
    let (dst, begin, end, src) = (f.get("b")?, f.get("begin")?, f.get("end")?, f.get("a")?);
    let span = f.sub(end, begin)?;
    let one = f.con(1);
    let small = f.le(span, one)?;
    f.if_then(small, |f| ret_con(f, 0))?;
    let sum = f.add(end, begin)?;
    let two = f.con(2);
    let middle = f.div(sum, two)?;
    f.call(split, TypeId::INT_BOT, &[src, begin, middle, dst])?;
    f.call(split, TypeId::INT_BOT, &[src, middle, end, dst])?;
    f.call(merge, TypeId::BOTTOM, &[dst, begin, middle, end, src])?;
    ret_con(&mut f, 0)?;
    m.define(f.finish()?)?;

    // merge(b, begin, middle, end, a): merge the sorted halves of a into b.
    let mut f = FunctionBuilder::new(&mut m, "merge");
    let ints = f.types().array_ptr(TypeId::INT_BOT);
    f.start(
        &[
            ("b", ints),
            ("begin", TypeId::INT_BOT),
            ("middle", TypeId::INT_BOT),
            ("end", TypeId::INT_BOT),
            ("a", ints),
        ],
        RetType::Void,
    )?;
    let (begin, middle, end) = (f.get("begin")?, f.get("middle")?, f.get("end")?);
    f.define("i", begin)?;
    f.define("j", middle)?;
    f.for_range("k", begin, end, |f| {
        let zero = f.con(0);
        f.define("cond", zero)?;
        let (i, middle) = (f.get("i")?, f.get("middle")?);
        let left = f.lt(i, middle)?;
        f.if_then(left, |f| {
            let (j, end) = (f.get("j")?, f.get("end")?);
            let right_done = f.ge(j, end)?;
            f.if_else(
                right_done,
                |f| {
                    let t = f.con(1);
                    f.set("cond", t)
                },
                |f| {
                    let (a, i, j) = (f.get("a")?, f.get("i")?, f.get("j")?);
                    let ai = f.load_elem(a, i)?;
                    let aj = f.load_elem(a, j)?;
                    let ordered = f.le(ai, aj)?;
                    f.if_then(ordered, |f| {
                        let t = f.con(1);
                        f.set("cond", t)
                    })
                },
            )
        })?;
        let cond = f.get("cond")?;
        f.if_else(
            cond,
            |f| {
                let (b, a, k, i) = (f.get("b")?, f.get("a")?, f.get("k")?, f.get("i")?);
                let v = f.load_elem(a, i)?;
                f.store_elem(b, k, v)?;
                incr(f, "i")
            },
            |f| {
                let (b, a, k, j) = (f.get("b")?, f.get("a")?, f.get("k")?, f.get("j")?);
                let v = f.load_elem(a, j)?;
                f.store_elem(b, k, v)?;
                incr(f, "j")
            },
        )
    })?;
    m.define(f.finish()?)?;

    // copy_array(a, begin, end, b): b[begin..end) = a[begin..end).
    let mut f = FunctionBuilder::new(&mut m, "copy_array");
    let ints = f.types().array_ptr(TypeId::INT_BOT);
    f.start(
        &[
            ("a", ints),
            ("begin", TypeId::INT_BOT),
            ("end", TypeId::INT_BOT),
            ("b", ints),
        ],
        RetType::Void,
    )?;
    let (begin, end) = (f.get("begin")?, f.get("end")?);
    f.for_range("k", begin, end, |f| {
        let (a, b, k) = (f.get("a")?, f.get("b")?, f.get("k")?);
        let v = f.load_elem(a, k)?;
        f.store_elem(b, k, v)
    })?;
    m.define(f.finish()?)?;
    Ok(m)
}

// ── Strings ─────────────────────────────────────────────────────────────────

fn string_ptr(b: &mut FunctionBuilder) -> TypeId {
    let s = b.types().string_type();
    b.types().ptr(s, Nil::NotNil)
}

pub fn strings() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    m.declare("equals");
    m.declare("hashCode");
    let hash_string = m.declare("hash_string");

    // equals(self, s): identity, then length, then bytes.
    let mut f = FunctionBuilder::new(&mut m, "equals");
    let sp = string_ptr(&mut f);
    f.start(&[("self", sp), ("s", sp)], RetType::Scalar(TypeId::BOOL))?;
    let (x, y) = (f.get("self")?, f.get("s")?);
    let same = f.eq(x, y)?;
    f.if_then(same, |f| ret_con(f, 1))?;
    let xc = f.load_field(x, "cs")?;
    let yc = f.load_field(y, "cs")?;
    let xl = f.array_len(xc)?;
    let yl = f.array_len(yc)?;
    let lengths_differ = f.ne(xl, yl)?;
    f.if_then(lengths_differ, |f| ret_con(f, 0))?;
    let zero = f.con(0);
    f.for_range("i", zero, xl, |f| {
        let i = f.get("i")?;
        let cx = f.load_elem(xc, i)?;
        let cy = f.load_elem(yc, i)?;
        let differ = f.ne(cx, cy)?;
        f.if_then(differ, |f| ret_con(f, 0))
    })?;
    ret_con(&mut f, 1)?;
    m.define(f.finish()?)?;

    // hashCode(self): the cached hash, computing and storing it on first use.
    let mut f = FunctionBuilder::new(&mut m, "hashCode");
    let sp = string_ptr(&mut f);
    f.start(&[("self", sp)], RetType::Scalar(TypeId::INT_BOT))?;
    let s = f.get("self")?;
    let cached = f.load_field(s, "hash")?;
    f.if_then(cached, |f| f.ret(Some(cached)))?;
    let h = f.call(hash_string, TypeId::INT_BOT, &[s])?;
    f.store_field(s, "hash", h)?;
    f.ret(Some(h))?;
    m.define(f.finish()?)?;

    // hash_string(self): h = h*31 + c over the bytes, never zero.
    let mut f = FunctionBuilder::new(&mut m, "hash_string");
    let sp = string_ptr(&mut f);
    f.start(&[("self", sp)], RetType::Scalar(TypeId::INT_BOT))?;
    let s = f.get("self")?;
    let cs = f.load_field(s, "cs")?;
    let len = f.array_len(cs)?;
    let zero = f.con(0);
    f.define("hash", zero)?;
    let zero = f.con(0);
    f.for_range("i", zero, len, |f| {
        let (h, i) = (f.get("hash")?, f.get("i")?);
        let k = f.con(31);
        let scaled = f.mul(h, k)?;
        let c = f.load_elem(cs, i)?;
        let next = f.add(scaled, c)?;
        f.set("hash", next)
    })?;
    let h = f.get("hash")?;
    let unset = f.not(h)?;
    f.if_then(unset, |f| {
        let c = f.con(crate::runtime::NONZERO_HASH);
        f.set("hash", c)
    })?;
    let h = f.get("hash")?;
    f.ret(Some(h))?;
    m.define(f.finish()?)?;
    Ok(m)
}

// ── Person ──────────────────────────────────────────────────────────────────

pub fn person() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    let mut f = FunctionBuilder::new(&mut m, "fcn");
    let person = person_type(f.types());
    let maybe = f.types().ptr(person, Nil::MaybeNil);
    let ps_ty = f.types().array_ptr(maybe);
    f.start(&[("ps", ps_ty), ("x", TypeId::INT_BOT)], RetType::Void)?;
    let (ps, x) = (f.get("ps")?, f.get("x")?);
    let p = f.load_elem(ps, x)?;
    f.if_then(p, |f| {
        let age = f.load_field(p, "age")?;
        let one = f.con(1);
        let older = f.add(age, one)?;
        f.store_field(p, "age", older)
    })?;
    m.define(f.finish()?)?;
    Ok(m)
}

// ── Pair ────────────────────────────────────────────────────────────────────

pub fn pair() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    let make = m.declare("make_pair");

    let mut f = FunctionBuilder::new(&mut m, "make_pair");
    let pair = pair_type(f.types());
    f.start(
        &[("a", TypeId::INT_BOT), ("b", TypeId::INT_BOT)],
        RetType::Aggregate(pair),
    )?;
    let p = f.new_struct(pair)?;
    let a = f.get("a")?;
    f.store_field(p, "a", a)?;
    let b = f.get("b")?;
    f.store_field(p, "b", b)?;
    f.ret(Some(p))?;
    m.define(f.finish()?)?;

    // diff(x, y) = make_pair(x, y).a - make_pair(x, y).b, through a call site.
    let mut f = FunctionBuilder::new(&mut m, "diff");
    let pair = pair_type(f.types());
    let pp = f.types().ptr(pair, Nil::NotNil);
    f.start(
        &[("x", TypeId::INT_BOT), ("y", TypeId::INT_BOT)],
        RetType::Scalar(TypeId::INT_BOT),
    )?;
    let (x, y) = (f.get("x")?, f.get("y")?);
    let r = f.call(make, pp, &[x, y])?;
    let a = f.load_field(r, "a")?;
    let b = f.load_field(r, "b")?;
    let d = f.sub(a, b)?;
    f.ret(Some(d))?;
    m.define(f.finish()?)?;
    Ok(m)
}

// ── Add all ─────────────────────────────────────────────────────────────────

pub fn add_all() -> Result<Module, Diagnostic> {
    let mut m = Module::new();
    let mut f = FunctionBuilder::new(&mut m, "add_all");
    let ints = f.types().array_ptr(TypeId::INT_BOT);
    f.start(&[("a", ints), ("k", TypeId::INT_BOT)], RetType::Scalar(ints))?;
    let a = f.get("a")?;
    let len = f.array_len(a)?;
    let out = f.new_array(TypeId::INT_BOT, len)?;
    let zero = f.con(0);
    f.for_range("i", zero, len, |f| {
        let (i, k) = (f.get("i")?, f.get("k")?);
        let v = f.load_elem(a, i)?;
        let w = f.add(v, k)?;
        f.store_elem(out, i, w)
    })?;
    f.ret(Some(out))?;
    m.define(f.finish()?)?;
    Ok(m)
}

// ── Drivers ─────────────────────────────────────────────────────────────────

fn layout_err(d: Diagnostic) -> Trap {
    Trap::Abi(d.message)
}

/// Layout of `[]elem` as the compiled code sees it.
pub fn array_of(elem: TypeId) -> Result<ArrayLayout, Trap> {
    let mut t = TypeTable::new();
    let obj = t.array_of(elem);
    array_layout(&t, obj).map_err(layout_err)
}

pub fn struct_of(build: fn(&mut TypeTable) -> TypeId) -> Result<StructLayout, Trap> {
    let mut t = TypeTable::new();
    let obj = build(&mut t);
    struct_layout(&t, obj).map_err(layout_err)
}

fn pointer(r: &Returned) -> Result<u64, Trap> {
    r.as_int()
        .map(|v| v as u64)
        .ok_or_else(|| Trap::Abi(format!("expected a pointer, got {:?}", r)))
}

fn render(values: &[i64]) -> String {
    let items: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("{}[{}]", values.len(), items.join(", "))
}

fn run_sieve(h: &mut Harness<'_>, args: &[i64]) -> Result<String, Trap> {
    let n = args.first().copied().unwrap_or(100);
    let r = h.call("sieve", &[Arg::Int(n)])?;
    let layout = array_of(TypeId::U32)?;
    let primes = h.heap().read_array(pointer(&r)?, &layout)?;
    Ok(render(&primes))
}

fn run_merge_sort(h: &mut Harness<'_>, args: &[i64]) -> Result<String, Trap> {
    let values: Vec<i64> = if args.is_empty() {
        PRIMES_BELOW_100.iter().rev().copied().collect()
    } else {
        args.to_vec()
    };
    let layout = array_of(TypeId::INT_BOT)?;
    let a = h.heap().new_array(&layout, &values)?;
    h.call("merge_sort", &[Arg::Int(a as i64)])?;
    Ok(render(&h.heap().read_array(a, &layout)?))
}

fn run_strings(h: &mut Harness<'_>, _args: &[i64]) -> Result<String, Trap> {
    let a = HostString::new("test").store(h.heap())?;
    let b = HostString::new("test1").store(h.heap())?;
    let ab = h.call("equals", &[Arg::Int(a as i64), Arg::Int(b as i64)])?;
    let aa = h.call("equals", &[Arg::Int(a as i64), Arg::Int(a as i64)])?;
    let hash = h.call("hashCode", &[Arg::Int(a as i64)])?;
    Ok(format!(
        "equals(test, test1) = {}\nequals(test, test) = {}\nhashCode(test) = {}",
        ab.as_int().unwrap_or(-1),
        aa.as_int().unwrap_or(-1),
        hash.as_int().unwrap_or(-1)
    ))
}

fn run_person(h: &mut Harness<'_>, args: &[i64]) -> Result<String, Trap> {
    let index = args.first().copied().unwrap_or(1);
    let times = args.get(1).copied().unwrap_or(1);
    let person = struct_of(person_type)?;
    let mut t = TypeTable::new();
    let obj = person_type(&mut t);
    let ptr = t.ptr(obj, Nil::MaybeNil);
    let arr = t.array_of(ptr);
    let ps_layout = array_layout(&t, arr).map_err(layout_err)?;

    let mut people = Vec::new();
    for age in [5, 17, 60] {
        let p = h.heap().alloc_struct(&person)?;
        h.heap().write_field(p, &person, "age", age)?;
        people.push(p as i64);
    }
    let ps = h.heap().new_array(&ps_layout, &people)?;
    for _ in 0..times {
        h.call("fcn", &[Arg::Int(ps as i64), Arg::Int(index)])?;
    }
    let ages = people
        .iter()
        .map(|&p| h.heap().read_field(p as u64, &person, "age"))
        .collect::<Result<Vec<_>, Trap>>()?;
    Ok(render(&ages))
}

fn run_pair(h: &mut Harness<'_>, args: &[i64]) -> Result<String, Trap> {
    let a = args.first().copied().unwrap_or(3);
    let b = args.get(1).copied().unwrap_or(4);
    let r = h.call("make_pair", &[Arg::Int(a), Arg::Int(b)])?;
    let bytes = r.aggregate_bytes(h.heap())?;
    let layout = struct_of(pair_type)?;
    let field = |name: &str| -> Result<i64, Trap> {
        let f = layout
            .field(name)
            .ok_or_else(|| Trap::Abi(format!("Pair has no field `{}`", name)))?;
        let at = f.offset as usize;
        let raw = bytes
            .get(at..at + 8)
            .ok_or_else(|| Trap::Abi("short aggregate return".to_string()))?;
        let mut word = [0u8; 8];
        word.copy_from_slice(raw);
        Ok(i64::from_le_bytes(word))
    };
    let how = match r {
        Returned::Registers(_) => "registers",
        _ => "hidden buffer",
    };
    Ok(format!("Pair {{ a: {}, b: {} }} via {}", field("a")?, field("b")?, how))
}

fn run_add_all(h: &mut Harness<'_>, args: &[i64]) -> Result<String, Trap> {
    let k = args.first().copied().unwrap_or(10);
    let layout = array_of(TypeId::INT_BOT)?;
    let a = h.heap().new_array(&layout, &[1, 2, 3, 4, 5])?;
    let r = h.call("add_all", &[Arg::Int(a as i64), Arg::Int(k)])?;
    Ok(render(&h.heap().read_array(pointer(&r)?, &layout)?))
}
