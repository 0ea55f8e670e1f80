// End-to-end scenarios: build → optimize → schedule → lower, then execute the
// lowered code through the harness exactly as a native caller would.
//
// Every scenario runs under both calling conventions; results must agree.

use snc::abi::{AbiConfig, AggregateReturn, CallingConv, Reg};
use snc::builder::FunctionBuilder;
use snc::codegen::CodegenOptions;
use snc::diag::codes;
use snc::exec::{Arg, Harness, Returned, Trap};
use snc::graph::{Module, RetType};
use snc::id::TypeId;
use snc::lir::LirProgram;
use snc::pass::PassId;
use snc::pipeline::{run_pipeline, CompilationState};
use snc::programs::{self, PRIMES_BELOW_100};
use snc::runtime::{string_hash, HashCell, HostString};
use snc::types::{Nil, TypeTable};

// ── Test helpers ────────────────────────────────────────────────────────────

fn lower(module: Module, config: AbiConfig) -> LirProgram {
    let mut state = CompilationState::new(module, config);
    run_pipeline(&mut state, PassId::Lower, &CodegenOptions::default(), false, |_, _| {})
        .unwrap_or_else(|e| panic!("{}: {:?}", e, state.diagnostics));
    state.artifacts.lir.take().unwrap()
}

fn configs() -> [AbiConfig; 3] {
    [
        AbiConfig::system_v(),
        AbiConfig::system_v().with_return(AggregateReturn::HiddenPointer),
        AbiConfig::win64(),
    ]
}

fn int_array() -> snc::layout::ArrayLayout {
    programs::array_of(TypeId::INT_BOT).unwrap()
}

// ── Sieve ───────────────────────────────────────────────────────────────────

#[test]
fn sieve_finds_the_primes_below_100() {
    for config in configs() {
        let lir = lower(programs::sieve().unwrap(), config);
        let mut h = Harness::new(&lir);
        let r = h.call("sieve", &[Arg::Int(100)]).unwrap();
        let addr = r.as_int().unwrap() as u64;
        let layout = programs::array_of(TypeId::U32).unwrap();
        assert_eq!(h.heap().array_len(addr).unwrap(), 25);
        let primes = h.heap().read_array(addr, &layout).unwrap();
        assert_eq!(primes, PRIMES_BELOW_100.to_vec(), "{:?}", config.conv);
    }
}

#[test]
fn sieve_of_small_input() {
    let lir = lower(programs::sieve().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let layout = programs::array_of(TypeId::U32).unwrap();
    let r = h.call("sieve", &[Arg::Int(10)]).unwrap();
    let primes = h.heap().read_array(r.as_int().unwrap() as u64, &layout).unwrap();
    assert_eq!(primes, vec![2, 3, 5, 7]);
}

#[test]
fn sieve_with_unrepresentable_length_traps() {
    for config in configs() {
        let lir = lower(programs::sieve().unwrap(), config);
        for n in [-1i64, i64::MIN, 1 << 40, u32::MAX as i64] {
            let mut h = Harness::new(&lir);
            let err = h.call("sieve", &[Arg::Int(n)]).unwrap_err();
            assert_eq!(err, Trap::ArrayLength(n), "{:?}", config.conv);
        }
    }
}

#[test]
fn sieve_beyond_the_heap_limit_traps() {
    let lir = lower(programs::sieve().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let err = h.call("sieve", &[Arg::Int(1 << 31)]).unwrap_err();
    assert!(matches!(err, Trap::HeapExhausted { .. }), "{err}");
}

// ── Merge sort ──────────────────────────────────────────────────────────────

#[test]
fn merge_sort_sorts_descending_primes_in_place() {
    let descending: Vec<i64> = PRIMES_BELOW_100.iter().rev().copied().collect();
    for config in configs() {
        let lir = lower(programs::merge_sort().unwrap(), config);
        let mut h = Harness::new(&lir);
        let a = h.heap().new_array(&int_array(), &descending).unwrap();
        let r = h.call("merge_sort", &[Arg::Int(a as i64)]).unwrap();
        assert_eq!(r, Returned::Void);
        assert_eq!(h.heap().array_len(a).unwrap(), 25);
        let sorted = h.heap().read_array(a, &int_array()).unwrap();
        assert_eq!(sorted, PRIMES_BELOW_100.to_vec(), "{:?}", config.conv);
    }
}

#[test]
fn merge_sort_handles_duplicates_and_negatives() {
    let lir = lower(programs::merge_sort().unwrap(), AbiConfig::win64());
    let mut h = Harness::new(&lir);
    let input = [3, -1, 3, 0, -7, 12, 0];
    let a = h.heap().new_array(&int_array(), &input).unwrap();
    h.call("merge_sort", &[Arg::Int(a as i64)]).unwrap();
    let mut expected = input.to_vec();
    expected.sort();
    assert_eq!(h.heap().read_array(a, &int_array()).unwrap(), expected);
}

// ── Strings ─────────────────────────────────────────────────────────────────

#[test]
fn string_equality() {
    for config in configs() {
        let lir = lower(programs::strings().unwrap(), config);
        let mut h = Harness::new(&lir);
        let test = HostString::new("test").store(h.heap()).unwrap() as i64;
        let test1 = HostString::new("test1").store(h.heap()).unwrap() as i64;
        let other = HostString::new("test").store(h.heap()).unwrap() as i64;
        let tesu = HostString::new("tesu").store(h.heap()).unwrap() as i64;

        let eq = |h: &mut Harness, a: i64, b: i64| {
            h.call("equals", &[Arg::Int(a), Arg::Int(b)])
                .unwrap()
                .as_int()
                .unwrap()
        };
        assert_eq!(eq(&mut h, test, test1), 0);
        assert_eq!(eq(&mut h, test, test), 1);
        assert_eq!(eq(&mut h, test, other), 1);
        assert_eq!(eq(&mut h, test, tesu), 0);
    }
}

#[test]
fn hash_code_is_computed_once_and_cached() {
    let lir = lower(programs::strings().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let rec = HostString::new("test").store(h.heap()).unwrap();
    let before = HostString::load(h.heap(), rec).unwrap();
    assert_eq!(before.hash, HashCell::Unset);

    let first = h.call("hashCode", &[Arg::Int(rec as i64)]).unwrap();
    assert_eq!(first.as_int(), Some(string_hash(b"test")));
    let after = HostString::load(h.heap(), rec).unwrap();
    assert_eq!(after.hash, HashCell::Computed(string_hash(b"test")));

    let steps = h.machine.steps();
    let second = h.call("hashCode", &[Arg::Int(rec as i64)]).unwrap();
    assert_eq!(second, first);
    assert!(
        h.machine.steps() - steps < steps,
        "cached lookup should not rehash"
    );
}

#[test]
fn empty_string_hash_is_never_zero() {
    let lir = lower(programs::strings().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let rec = HostString::new("").store(h.heap()).unwrap();
    let r = h.call("hashCode", &[Arg::Int(rec as i64)]).unwrap();
    assert_eq!(r.as_int(), Some(snc::runtime::NONZERO_HASH));
}

// ── Struct array mutation ───────────────────────────────────────────────────

#[test]
fn five_calls_age_a_person_from_one_to_six() {
    for config in configs() {
        let lir = lower(programs::person().unwrap(), config);
        let mut h = Harness::new(&lir);
        let person = programs::struct_of(programs::person_type).unwrap();
        let mut t = TypeTable::new();
        let obj = programs::person_type(&mut t);
        let ptr = t.ptr(obj, Nil::MaybeNil);
        let arr = t.array_of(ptr);
        let ps_layout = snc::layout::array_layout(&t, arr).unwrap();

        let p0 = h.heap().alloc_struct(&person).unwrap();
        let p1 = h.heap().alloc_struct(&person).unwrap();
        h.heap().write_field(p0, &person, "age", 40).unwrap();
        h.heap().write_field(p1, &person, "age", 1).unwrap();
        // Slot 2 is null; the callee must skip it.
        let ps = h
            .heap()
            .new_array(&ps_layout, &[p0 as i64, p1 as i64, 0])
            .unwrap();

        for _ in 0..5 {
            h.call("fcn", &[Arg::Int(ps as i64), Arg::Int(1)]).unwrap();
        }
        h.call("fcn", &[Arg::Int(ps as i64), Arg::Int(2)]).unwrap();

        assert_eq!(h.heap().read_field(p1, &person, "age").unwrap(), 6);
        assert_eq!(h.heap().read_field(p0, &person, "age").unwrap(), 40);
    }
}

#[test]
fn out_of_bounds_index_traps() {
    let lir = lower(programs::person().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let mut t = TypeTable::new();
    let obj = programs::person_type(&mut t);
    let ptr = t.ptr(obj, Nil::MaybeNil);
    let arr = t.array_of(ptr);
    let ps_layout = snc::layout::array_layout(&t, arr).unwrap();
    let ps = h.heap().new_array(&ps_layout, &[0]).unwrap();
    // Indexing far past the array leaves the heap.
    let err = h
        .call("fcn", &[Arg::Int(ps as i64), Arg::Int(1 << 20)])
        .unwrap_err();
    assert!(matches!(err, Trap::OutOfBounds { .. }), "{err}");
}

// ── Struct returned by value ────────────────────────────────────────────────

fn pair_fields(h: &mut Harness, r: &Returned) -> (i64, i64) {
    let bytes = r.aggregate_bytes(h.heap()).unwrap();
    let word = |i: usize| i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
    (word(0), word(1))
}

#[test]
fn pair_returns_in_rax_rdx_under_system_v() {
    let lir = lower(programs::pair().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let r = h.call("make_pair", &[Arg::Int(3), Arg::Int(-4)]).unwrap();
    match &r {
        Returned::Registers(pieces) => {
            let regs: Vec<Reg> = pieces.iter().map(|(r, _)| *r).collect();
            assert_eq!(regs, vec![Reg::RAX, Reg::RDX]);
        }
        other => panic!("expected register return, got {:?}", other),
    }
    assert_eq!(pair_fields(&mut h, &r), (3, -4));
}

#[test]
fn pair_returns_through_hidden_buffer() {
    for config in [
        AbiConfig::system_v().with_return(AggregateReturn::HiddenPointer),
        AbiConfig::win64(),
    ] {
        let lir = lower(programs::pair().unwrap(), config);
        let mut h = Harness::new(&lir);
        let r = h.call("make_pair", &[Arg::Int(7), Arg::Int(9)]).unwrap();
        assert!(matches!(r, Returned::Buffer { size: 16, .. }), "{:?}", r);
        assert_eq!(pair_fields(&mut h, &r), (7, 9));
    }
}

#[test]
fn pair_call_site_agrees_across_strategies() {
    for config in configs() {
        let lir = lower(programs::pair().unwrap(), config);
        let mut h = Harness::new(&lir);
        let r = h.call("diff", &[Arg::Int(10), Arg::Int(4)]).unwrap();
        assert_eq!(r.as_int(), Some(6), "{:?}", config);
    }
}

#[test]
fn win64_register_return_of_pair_is_rejected() {
    let module = programs::pair().unwrap();
    let config = AbiConfig::win64().with_return(AggregateReturn::Registers);
    let mut state = CompilationState::new(module, config);
    let err = run_pipeline(&mut state, PassId::Lower, &CodegenOptions::default(), false, |_, _| {})
        .unwrap_err();
    assert_eq!(err.failing_pass, PassId::Lower);
    assert_eq!(state.diagnostics[0].code, Some(codes::E0401));
    assert_eq!(state.config.conv, CallingConv::Win64);
}

// ── Fresh arrays ────────────────────────────────────────────────────────────

#[test]
fn add_all_builds_a_new_array() {
    for config in configs() {
        let lir = lower(programs::add_all().unwrap(), config);
        let mut h = Harness::new(&lir);
        let a = h.heap().new_array(&int_array(), &[1, 2, 3]).unwrap();
        let r = h.call("add_all", &[Arg::Int(a as i64), Arg::Int(10)]).unwrap();
        let out = r.as_int().unwrap() as u64;
        assert_ne!(out, a);
        assert_eq!(h.heap().read_array(out, &int_array()).unwrap(), vec![11, 12, 13]);
        assert_eq!(h.heap().read_array(a, &int_array()).unwrap(), vec![1, 2, 3]);
    }
}

// ── Mixed int and float ─────────────────────────────────────────────────────

/// `f(a: int, x: flt, c: int, y: flt) -> flt = to_float((a + c) * 10) + (x + y)`
fn mixed_arith() -> Module {
    let mut m = Module::new();
    let mut b = FunctionBuilder::new(&mut m, "f");
    b.start(
        &[
            ("a", TypeId::INT_BOT),
            ("x", TypeId::FLOAT_BOT),
            ("c", TypeId::INT_BOT),
            ("y", TypeId::FLOAT_BOT),
        ],
        RetType::Scalar(TypeId::FLOAT_BOT),
    )
    .unwrap();
    let (a, x, c, y) = (
        b.get("a").unwrap(),
        b.get("x").unwrap(),
        b.get("c").unwrap(),
        b.get("y").unwrap(),
    );
    let ten = b.con(10);
    let sum = b.add(a, c).unwrap();
    let scaled = b.mul(sum, ten).unwrap();
    let whole = b.to_float(scaled).unwrap();
    let frac = b.add(x, y).unwrap();
    let r = b.add(whole, frac).unwrap();
    b.ret(Some(r)).unwrap();
    m.define(b.finish().unwrap()).unwrap();
    m
}

/// `g(x: flt) -> int = to_int(x * 2.0)`
fn truncate_double() -> Module {
    let mut m = Module::new();
    let mut b = FunctionBuilder::new(&mut m, "g");
    b.start(&[("x", TypeId::FLOAT_BOT)], RetType::Scalar(TypeId::INT_BOT))
        .unwrap();
    let x = b.get("x").unwrap();
    let two = b.con_f(2.0);
    let d = b.mul(x, two).unwrap();
    let r = b.to_int(d).unwrap();
    b.ret(Some(r)).unwrap();
    m.define(b.finish().unwrap()).unwrap();
    m
}

#[test]
fn mixed_int_and_float_arguments() {
    for config in configs() {
        let lir = lower(mixed_arith(), config);
        let mut h = Harness::new(&lir);
        let args = [Arg::Int(1), Arg::Float(2.5), Arg::Int(3), Arg::Float(4.5)];
        let r = h.call("f", &args).unwrap();
        assert_eq!(r, Returned::Float(47.0), "{:?}", config.conv);
    }
}

#[test]
fn mixed_arguments_take_their_class_registers() {
    let sysv = lower(mixed_arith(), AbiConfig::system_v()).to_string();
    assert!(sysv.contains("fn f(rdi, xmm0, rsi, xmm1) -> xmm0 {"), "{sysv}");
    let win = lower(mixed_arith(), AbiConfig::win64()).to_string();
    assert!(win.contains("fn f(rcx, xmm1, r8, xmm3) -> xmm0 {"), "{win}");
}

#[test]
fn float_to_int_truncates() {
    for config in configs() {
        let lir = lower(truncate_double(), config);
        let mut h = Harness::new(&lir);
        assert_eq!(h.call("g", &[Arg::Float(3.75)]).unwrap(), Returned::Int(7));
        assert_eq!(h.call("g", &[Arg::Float(-1.25)]).unwrap(), Returned::Int(-2));
    }
}

// ── Drivers ─────────────────────────────────────────────────────────────────

#[test]
fn every_driver_agrees_across_conventions() {
    for p in programs::ALL {
        let mut outputs = Vec::new();
        for config in [AbiConfig::system_v(), AbiConfig::win64()] {
            let lir = lower((p.build)().unwrap(), config);
            let mut h = Harness::new(&lir);
            let out = (p.run)(&mut h, &[]).unwrap_or_else(|t| panic!("{}: {}", p.name, t));
            // Only the transport of an aggregate return may differ.
            outputs.push(out.split(" via ").next().unwrap_or_default().to_string());
        }
        assert_eq!(outputs[0], outputs[1], "{}", p.name);
    }
}

#[test]
fn sieve_driver_renders_length_and_primes() {
    let p = programs::find("sieve").unwrap();
    let lir = lower((p.build)().unwrap(), AbiConfig::system_v());
    let mut h = Harness::new(&lir);
    let out = (p.run)(&mut h, &[30]).unwrap();
    assert_eq!(out, "10[2, 3, 5, 7, 11, 13, 17, 19, 23, 29]");
}
