// pipeline.rs — Compilation state and pass orchestration
//
// Holds the module under compilation together with every pass artifact and
// runs the minimal set of passes for a given terminal PassId.
//
// Preconditions: every function of the module is defined (builder finished).
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass returning a diagnostic; certificate failures.
// Side effects: calls on_pass_complete callback after each pass for immediate display.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::abi::AbiConfig;
use crate::codegen::{CodegenOptions, GeneratedCode};
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::graph::Module;
use crate::id::FuncId;
use crate::lir::LirProgram;
use crate::optimize::OptimizeStats;
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::schedule::Schedule;

// ── Artifact storage ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct Artifacts {
    pub stats: HashMap<FuncId, OptimizeStats>,
    pub schedules: HashMap<FuncId, Schedule>,
    pub lir: Option<LirProgram>,
    pub generated: Option<GeneratedCode>,
}

/// Provenance metadata for reproducible builds and cache-key use.
///
/// `asm_hash`: SHA-256 of the emitted assembly text.
/// `config_fingerprint`: SHA-256 of the compact JSON of the `AbiConfig`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub asm_hash: [u8; 32],
    pub config_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

#[derive(Serialize)]
struct BuildInfo<'a> {
    asm_hash: String,
    config_fingerprint: String,
    config: &'a AbiConfig,
    compiler_version: &'a str,
}

impl Provenance {
    pub fn asm_hash_hex(&self) -> String {
        bytes_to_hex(&self.asm_hash)
    }

    pub fn config_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.config_fingerprint)
    }

    /// Serialize provenance as pretty JSON for `--emit build-info`.
    pub fn to_json(&self, config: &AbiConfig) -> String {
        let info = BuildInfo {
            asm_hash: self.asm_hash_hex(),
            config_fingerprint: self.config_fingerprint_hex(),
            config,
            compiler_version: self.compiler_version,
        };
        serde_json::to_string_pretty(&info).unwrap_or_default()
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Compute provenance from the emitted assembly and the ABI configuration.
pub fn compute_provenance(asm: &str, config: &AbiConfig) -> Provenance {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    Provenance {
        asm_hash: sha256(asm.as_bytes()),
        config_fingerprint: sha256(canonical.as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

/// Holds the module, all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub module: Module,
    pub config: AbiConfig,
    pub artifacts: Artifacts,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(module: Module, config: AbiConfig) -> Self {
        Self {
            module,
            config,
            artifacts: Artifacts::default(),
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pass failed", descriptor(self.failing_pass).name)
    }
}

impl std::error::Error for PipelineError {}

// ── Per-pass bookkeeping ───────────────────────────────────────────────────

/// Per-pass post-processing: callback, accumulate, verbose, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = diags.iter().any(|d| d.level == DiagLevel::Error);
    state.diagnostics.extend(diags);
    let name = descriptor(pass_id).name;
    let ms = elapsed.as_secs_f64() * 1000.0;
    info!(pass = name, ms, "pass complete");
    if verbose {
        eprintln!("snc: {} complete, {:.1}ms", name, ms);
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

fn in_function(d: Diagnostic, name: &str) -> Diagnostic {
    d.with_cause(format!("while compiling `{}`", name), None)
}

fn cert_failure(code: crate::diag::DiagCode, what: &str, cert: &impl StageCert) -> Diagnostic {
    Diagnostic::error(
        code,
        format!("{} verification failed: {}", what, cert.failures().join(", ")),
    )
}

// ── Passes ─────────────────────────────────────────────────────────────────

fn run_optimize(state: &mut CompilationState) -> Vec<Diagnostic> {
    for func in state.module.functions_mut() {
        match crate::optimize::optimize(&mut func.graph) {
            Ok(stats) => {
                state.artifacts.stats.insert(func.id, stats);
            }
            Err(d) => return vec![in_function(d, &func.name)],
        }
    }
    Vec::new()
}

fn run_schedule(state: &mut CompilationState) -> Vec<Diagnostic> {
    for func in state.module.functions_mut() {
        let sched = match crate::schedule::schedule(&mut func.graph) {
            Ok(s) => s,
            Err(d) => return vec![in_function(d, &func.name)],
        };
        let cert = crate::schedule::verify_schedule(&func.graph, &sched);
        if !cert.all_pass() {
            return vec![in_function(
                cert_failure(codes::E0304, "schedule", &cert),
                &func.name,
            )];
        }
        state.artifacts.schedules.insert(func.id, sched);
    }
    Vec::new()
}

fn run_lower(state: &mut CompilationState) -> Vec<Diagnostic> {
    let lir = match crate::lir::build_lir(&state.module, &state.artifacts.schedules, &state.config)
    {
        Ok(lir) => lir,
        Err(d) => return vec![d],
    };
    let cert = crate::lir::verify_lir(&lir, &state.module);
    state.artifacts.lir = Some(lir);
    if cert.all_pass() {
        Vec::new()
    } else {
        vec![cert_failure(codes::E0502, "LIR", &cert)]
    }
}

fn run_codegen(state: &mut CompilationState, options: &CodegenOptions) -> Vec<Diagnostic> {
    let Some(lir) = state.artifacts.lir.as_ref() else {
        return vec![Diagnostic::error(codes::E0501, "codegen requested before lowering")];
    };
    let result = crate::codegen::codegen(lir, options);
    state.provenance = Some(compute_provenance(&result.generated.asm, &state.config));
    state.artifacts.generated = Some(result.generated);
    result.diagnostics
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
/// Passes whose artifacts are already present are skipped, so the runner
/// can be called again with a later terminal.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    codegen_options: &CodegenOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    if state.has_error {
        return Ok(());
    }
    let undefined = state.module.undefined();
    if !undefined.is_empty() {
        let d = Diagnostic::error(
            codes::E0203,
            format!("declared but never defined: {}", undefined.join(", ")),
        );
        state.has_error = true;
        state.diagnostics.push(d);
        return Err(PipelineError {
            failing_pass: PassId::Optimize,
        });
    }

    for pass_id in required_passes(terminal) {
        let done = match pass_id {
            PassId::Optimize => state.module.functions().all(|f| f.graph.is_optimized()),
            PassId::Schedule => !state.artifacts.schedules.is_empty(),
            PassId::Lower => state.artifacts.lir.is_some(),
            PassId::Codegen => state.artifacts.generated.is_some(),
        };
        if done {
            continue;
        }
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Optimize => run_optimize(state),
            PassId::Schedule => run_schedule(state),
            PassId::Lower => run_lower(state),
            PassId::Codegen => run_codegen(state, codegen_options),
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}
