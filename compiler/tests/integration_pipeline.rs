// Integration tests for the `snc` command line.
//
// These tests verify the driver surface end to end:
// - every --emit stage succeeds for every built-in program
// - configuration errors and unknown programs fail with distinct exit codes
// - `--emit run` prints the driver's rendering of the result

use std::path::PathBuf;
use std::process::{Command, Output};

fn snc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_snc"))
}

fn run_snc(args: &[&str]) -> Output {
    Command::new(snc_binary())
        .args(args)
        .output()
        .expect("failed to run snc")
}

fn stdout_of(args: &[&str]) -> String {
    let output = run_snc(args);
    assert!(
        output.status.success(),
        "snc {:?} failed\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

const PROGRAMS: [&str; 6] = ["sieve", "merge_sort", "strings", "person", "pair", "add_all"];

// ── Listing ──

#[test]
fn list_names_every_program() {
    let out = stdout_of(&["--list"]);
    for p in PROGRAMS {
        assert!(out.contains(p), "--list should mention {p}:\n{out}");
    }
}

// ── Emit stages ──

#[test]
fn every_stage_succeeds_for_every_program() {
    for p in PROGRAMS {
        for stage in ["ir", "dot", "schedule", "lir", "asm", "layout", "build-info"] {
            let out = stdout_of(&[p, "--emit", stage]);
            assert!(!out.is_empty(), "{p} --emit {stage} produced nothing");
        }
    }
}

#[test]
fn asm_defines_the_entry_symbol() {
    let out = stdout_of(&["sieve", "--emit", "asm"]);
    assert!(out.contains(".globl sieve"), "{out}");
    assert!(out.contains("sieve:"));
}

#[test]
fn no_comments_strips_assembly_comments() {
    let with = stdout_of(&["add_all", "--emit", "asm"]);
    let without = stdout_of(&["add_all", "--emit", "asm", "--no-comments"]);
    assert!(without.len() < with.len());
    // Only the preamble keeps its comment lines.
    assert!(!without.lines().any(|l| l.starts_with("    #")));
    assert!(with.lines().any(|l| l.starts_with("    #")));
}

#[test]
fn dot_is_one_digraph() {
    let out = stdout_of(&["merge_sort", "--emit", "dot"]);
    assert!(out.starts_with("digraph snc {"));
    assert_eq!(out.matches("digraph").count(), 1);
    assert!(out.contains("subgraph cluster_merge_sort"));
}

#[test]
fn lir_header_reflects_configuration() {
    let out = stdout_of(&["pair", "--emit", "lir", "--conv", "win64"]);
    assert!(out.starts_with("; conv=win64 aggregate_return=HiddenPointer"), "{out}");
}

#[test]
fn layout_is_json_with_config_and_functions() {
    let out = stdout_of(&["person", "--emit", "layout"]);
    let doc: serde_json::Value = serde_json::from_str(&out).expect("layout is JSON");
    assert!(doc.get("config").is_some());
    let functions = doc["functions"].as_array().expect("functions array");
    assert!(!functions.is_empty());
}

#[test]
fn build_info_hashes_are_hex() {
    let out = stdout_of(&["sieve", "--emit", "build-info"]);
    let doc: serde_json::Value = serde_json::from_str(&out).expect("build-info is JSON");
    for key in ["asm_hash", "config_fingerprint"] {
        let h = doc[key].as_str().unwrap_or_else(|| panic!("missing {key}"));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

#[test]
fn output_flag_writes_file() {
    let dir = std::env::temp_dir().join(format!("snc-out-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sieve.s");
    let path_str = path.to_str().unwrap();
    let out = stdout_of(&["sieve", "-o", path_str]);
    assert!(out.is_empty());
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains(".globl sieve"));
    let _ = std::fs::remove_dir_all(&dir);
}

// ── Run ──

#[test]
fn run_sieve_with_argument() {
    let out = stdout_of(&["sieve", "--emit", "run", "--arg", "20"]);
    assert_eq!(out, "8[2, 3, 5, 7, 11, 13, 17, 19]\n");
}

#[test]
fn run_merge_sort_accepts_negative_arguments() {
    let out = stdout_of(&[
        "merge_sort", "--emit", "run", "--arg", "3", "--arg", "-1", "--arg", "2",
    ]);
    assert_eq!(out, "3[-1, 2, 3]\n");
}

#[test]
fn run_pair_reports_return_strategy() {
    let regs = stdout_of(&["pair", "--emit", "run", "--arg", "3", "--arg", "4"]);
    assert_eq!(regs, "Pair { a: 3, b: 4 } via registers\n");
    let buffer = stdout_of(&["pair", "--emit", "run", "--conv", "win64", "--arg", "3", "--arg", "4"]);
    assert_eq!(buffer, "Pair { a: 3, b: 4 } via hidden buffer\n");
}

#[test]
fn run_strings_compares_and_hashes() {
    let out = stdout_of(&["strings", "--emit", "run"]);
    assert!(out.contains("equals(test, test1) = 0"), "{out}");
    assert!(out.contains("equals(test, test) = 1"), "{out}");
}

// ── Failures ──

#[test]
fn unknown_program_exits_2() {
    let output = run_snc(&["fibonacci"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown program `fibonacci`"), "{stderr}");
}

#[test]
fn aapcs64_is_rejected_at_configuration() {
    let output = run_snc(&["sieve", "--conv", "aapcs64"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0400"), "{stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn win64_register_return_fails_lowering() {
    let output = run_snc(&["pair", "--conv", "win64", "--ret", "registers"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("E0401"), "{stderr}");
}

#[test]
fn bad_convention_name_is_a_usage_error() {
    let output = run_snc(&["sieve", "--conv", "fastcall"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
