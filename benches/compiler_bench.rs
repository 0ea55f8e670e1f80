use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use snc::abi::AbiConfig;
use snc::builder::FunctionBuilder;
use snc::codegen::{codegen, CodegenOptions};
use snc::exec::Harness;
use snc::graph::{Module, RetType};
use snc::id::TypeId;
use snc::lir::build_lir;
use snc::optimize::optimize;
use snc::pass::PassId;
use snc::pipeline::{run_pipeline, CompilationState};
use snc::programs::{self, Program};
use snc::schedule::schedule;

// KPI-aligned benchmark scenarios over the built-in programs.

fn program(name: &str) -> &'static Program {
    programs::find(name).unwrap_or_else(|| panic!("no program `{name}`"))
}

/// `f(x)` folding `n` dependent add/mul steps inside one loop body, so
/// graph size grows linearly with `n`.
fn generate_scaling_module(n: usize) -> Module {
    let mut m = Module::new();
    let mut b = FunctionBuilder::new(&mut m, "f");
    b.start(&[("x", TypeId::INT_BOT)], RetType::Scalar(TypeId::INT_BOT))
        .unwrap();
    let (from, to) = (b.con(0), b.con(8));
    b.for_range("i", from, to, |b| {
        for k in 0..n {
            let x = b.get("x")?;
            let i = b.get("i")?;
            let c = b.con(k as i64 + 1);
            let t = if k % 2 == 0 { b.add(x, i)? } else { b.mul(x, c)? };
            b.set("x", t)?;
        }
        Ok(())
    })
    .unwrap();
    let x = b.get("x").unwrap();
    b.ret(Some(x)).unwrap();
    m.define(b.finish().unwrap()).unwrap();
    m
}

fn compile_full(module: Module, terminal: PassId) -> CompilationState {
    let mut state = CompilationState::new(module, AbiConfig::system_v());
    run_pipeline(&mut state, terminal, &CodegenOptions::default(), false, |_, _| {})
        .expect("pipeline");
    state
}

// ── KPI: full compile latency ──

fn bench_kpi_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    for p in programs::ALL {
        group.bench_with_input(BenchmarkId::from_parameter(p.name), p, |b, p| {
            b.iter(|| {
                let module = (p.build)().expect("build");
                black_box(compile_full(module, PassId::Codegen));
            });
        });
    }
    group.finish();
}

// ── KPI: per-phase latency ──

fn bench_kpi_phase_latency(c: &mut Criterion) {
    let p = program("merge_sort");

    {
        let mut group = c.benchmark_group("kpi/phase_latency/build");
        group.bench_function("merge_sort", |b| {
            b.iter(|| black_box((p.build)().expect("build")));
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("kpi/phase_latency/optimize");
        group.bench_function("merge_sort", |b| {
            b.iter_batched(
                || (p.build)().expect("build"),
                |mut module| {
                    for f in module.functions_mut() {
                        black_box(optimize(&mut f.graph).expect("optimize"));
                    }
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("kpi/phase_latency/schedule");
        group.bench_function("merge_sort", |b| {
            b.iter_batched(
                || compile_full((p.build)().expect("build"), PassId::Optimize).module,
                |mut module| {
                    for f in module.functions_mut() {
                        black_box(schedule(&mut f.graph).expect("schedule"));
                    }
                },
                BatchSize::SmallInput,
            );
        });
        group.finish();
    }

    {
        let state = compile_full((p.build)().expect("build"), PassId::Schedule);
        let mut group = c.benchmark_group("kpi/phase_latency/lower");
        group.bench_function("merge_sort", |b| {
            b.iter(|| {
                black_box(
                    build_lir(&state.module, &state.artifacts.schedules, &state.config)
                        .expect("lower"),
                )
            });
        });
        group.finish();
    }

    {
        let state = compile_full((p.build)().expect("build"), PassId::Lower);
        let lir = state.artifacts.lir.as_ref().expect("lir");
        let options = CodegenOptions::default();
        let mut group = c.benchmark_group("kpi/phase_latency/codegen");
        group.bench_function("merge_sort", |b| {
            b.iter(|| black_box(codegen(lir, &options)));
        });
        group.finish();
    }
}

// ── KPI: scaling with graph size ──

fn bench_kpi_optimize_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/optimize_scaling");
    for n in [8usize, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || generate_scaling_module(n),
                |module| black_box(compile_full(module, PassId::Schedule)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

// ── KPI: machine execution ──

fn bench_kpi_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/execution");
    for name in ["sieve", "merge_sort"] {
        let p = program(name);
        let state = compile_full((p.build)().expect("build"), PassId::Lower);
        let lir = state.artifacts.lir.as_ref().expect("lir");
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut h = Harness::new(lir);
                black_box((p.run)(&mut h, &[]).expect("run"))
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_kpi_full_compile_latency,
    bench_kpi_phase_latency,
    bench_kpi_optimize_scaling,
    bench_kpi_execution,
);
criterion_main!(benches);
