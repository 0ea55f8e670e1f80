use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use snc::abi::{AbiConfig, AbiReport, AggregateReturn, CallingConv, Target};
use snc::codegen::CodegenOptions;
use snc::diag::Diagnostic;
use snc::exec::Harness;
use snc::layout::{layout_report, LayoutReport};
use snc::pass::PassId;
use snc::pipeline::{run_pipeline, CompilationState};
use snc::programs::{self, Program};
use snc::schedule::ScheduleDisplay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    /// Optimized node graph, one listing per function
    Ir,
    /// Optimized node graph as Graphviz DOT
    Dot,
    /// Basic blocks after global code motion
    Schedule,
    /// ABI-lowered virtual-register code
    Lir,
    /// x86-64 Intel-syntax assembly
    Asm,
    /// Struct/array layouts and per-function calling summaries (JSON)
    Layout,
    /// Provenance of the emitted assembly (JSON)
    BuildInfo,
    /// Execute the program's driver on the LIR machine
    Run,
}

#[derive(Parser, Debug)]
#[command(
    name = "snc",
    version,
    about = "Sea-of-Nodes Compiler: optimizes, schedules and lowers built-in programs to x86-64"
)]
struct Cli {
    /// Built-in program name (see --list)
    #[arg(required_unless_present = "list")]
    program: Option<String>,

    /// List built-in programs and exit
    #[arg(long)]
    list: bool,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Asm)]
    emit: EmitStage,

    /// Calling convention
    #[arg(long, default_value = "system-v", value_parser = parse_conv)]
    conv: CallingConv,

    /// Aggregate return strategy (default: registers on system-v, hidden-pointer on win64)
    #[arg(long = "ret", value_parser = parse_ret)]
    aggregate_return: Option<AggregateReturn>,

    /// Integer argument passed to the program driver (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<i64>,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Omit explanatory comments from assembly
    #[arg(long)]
    no_comments: bool,

    /// Verbosity: -v info, -vv debug, -vvv trace (RUST_LOG overrides)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_conv(s: &str) -> Result<CallingConv, String> {
    s.parse().map_err(|d: Diagnostic| d.to_string())
}

fn parse_ret(s: &str) -> Result<AggregateReturn, String> {
    s.parse().map_err(|d: Diagnostic| d.to_string())
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn terminal_pass(emit: EmitStage) -> PassId {
    match emit {
        EmitStage::Ir | EmitStage::Dot => PassId::Optimize,
        EmitStage::Schedule => PassId::Schedule,
        EmitStage::Lir | EmitStage::Layout | EmitStage::Run => PassId::Lower,
        EmitStage::Asm | EmitStage::BuildInfo => PassId::Codegen,
    }
}

#[derive(Serialize)]
struct FunctionLayout<'a> {
    #[serde(flatten)]
    abi: AbiReport,
    types: &'a LayoutReport,
}

#[derive(Serialize)]
struct LayoutDocument<'a> {
    config: &'a AbiConfig,
    functions: Vec<FunctionLayout<'a>>,
}

fn render(state: &CompilationState, program: &Program, cli: &Cli) -> Result<String, String> {
    let module = &state.module;
    let artifacts = &state.artifacts;
    let out = match cli.emit {
        EmitStage::Ir => {
            let mut s = String::new();
            for f in module.functions() {
                s.push_str(&format!("fn {}:\n{}\n", f.name, f.graph));
            }
            s
        }
        EmitStage::Dot => snc::dot::emit_dot(module),
        EmitStage::Schedule => {
            let mut s = String::new();
            for f in module.functions() {
                let Some(schedule) = artifacts.schedules.get(&f.id) else {
                    continue;
                };
                let view = ScheduleDisplay {
                    graph: &f.graph,
                    schedule,
                };
                s.push_str(&format!("fn {}:\n{}\n", f.name, view));
            }
            s
        }
        EmitStage::Lir => match &artifacts.lir {
            Some(lir) => lir.to_string(),
            None => return Err("no LIR produced".to_string()),
        },
        EmitStage::Asm => match &artifacts.generated {
            Some(g) => g.asm.clone(),
            None => return Err("no assembly produced".to_string()),
        },
        EmitStage::Layout => {
            let lir = artifacts.lir.as_ref().ok_or("no LIR produced")?;
            let reports: Vec<LayoutReport> = module
                .functions()
                .map(|f| layout_report(&f.graph.types))
                .collect();
            let functions = module
                .functions()
                .zip(&reports)
                .filter_map(|(f, types)| {
                    lir.by_id(f.id).map(|lf| FunctionLayout {
                        abi: AbiReport::new(&f.name, &lf.layout),
                        types,
                    })
                })
                .collect();
            let doc = LayoutDocument {
                config: &state.config,
                functions,
            };
            let mut json = serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())?;
            json.push('\n');
            json
        }
        EmitStage::BuildInfo => match &state.provenance {
            Some(p) => {
                let mut json = p.to_json(&state.config);
                json.push('\n');
                json
            }
            None => return Err("no provenance recorded".to_string()),
        },
        EmitStage::Run => {
            let lir = artifacts.lir.as_ref().ok_or("no LIR produced")?;
            let mut harness = Harness::new(lir);
            let result = (program.run)(&mut harness, &cli.args)
                .map_err(|trap| format!("trap: {}", trap))?;
            tracing::info!(
                steps = harness.machine.steps(),
                heap = harness.heap().used(),
                "run finished"
            );
            format!("{}\n", result)
        }
    };
    Ok(out)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list {
        for p in programs::ALL {
            println!("{:<12} {:<12} {}", p.name, p.entry, p.summary);
        }
        return ExitCode::SUCCESS;
    }

    let name = cli.program.as_deref().unwrap_or_default();
    let Some(program) = programs::find(name) else {
        eprintln!("snc: error: unknown program `{}` (try --list)", name);
        return ExitCode::from(2);
    };

    // ── Configuration ──
    let aggregate_return = cli.aggregate_return.unwrap_or(match cli.conv {
        CallingConv::Win64 => AggregateReturn::HiddenPointer,
        _ => AggregateReturn::Registers,
    });
    let config = match AbiConfig::new(Target::X86_64, cli.conv, aggregate_return) {
        Ok(c) => c,
        Err(d) => {
            eprintln!("snc: {}", d);
            return ExitCode::from(1);
        }
    };
    tracing::info!(program = program.name, conv = %config.conv, "configured");

    // ── Construction ──
    let module = match (program.build)() {
        Ok(m) => m,
        Err(d) => {
            eprintln!("snc: {}", d);
            return ExitCode::from(1);
        }
    };

    // ── Passes ──
    let options = CodegenOptions {
        comments: !cli.no_comments,
        ..CodegenOptions::default()
    };
    let mut state = CompilationState::new(module, config);
    let verbose = cli.verbose > 0;
    let result = run_pipeline(
        &mut state,
        terminal_pass(cli.emit),
        &options,
        verbose,
        |_, diags| {
            for d in diags {
                eprintln!("snc: {}", d);
            }
        },
    );
    if let Err(e) = result {
        eprintln!("snc: error: {}", e);
        return ExitCode::from(1);
    }

    // ── Output ──
    let text = match render(&state, program, &cli) {
        Ok(t) => t,
        Err(msg) => {
            eprintln!("snc: error: {}", msg);
            return ExitCode::from(3);
        }
    };
    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &text) {
                eprintln!("snc: error: {}: {}", path.display(), e);
                return ExitCode::from(2);
            }
        }
        None => print!("{}", text),
    }
    ExitCode::SUCCESS
}
