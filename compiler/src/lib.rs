// snc — Sea-of-Nodes Compiler
//
// Library root. Construction (`builder`, `graph`) feeds the pass pipeline:
// optimize → schedule → lower (ABI) → codegen. `exec` runs lowered code.

pub mod abi;
pub mod builder;
pub mod cfg;
pub mod codegen;
pub mod diag;
pub mod dot;
pub mod exec;
pub mod graph;
pub mod id;
pub mod layout;
pub mod lir;
pub mod node;
pub mod optimize;
pub mod pass;
pub mod peephole;
pub mod pipeline;
pub mod programs;
pub mod runtime;
pub mod schedule;
pub mod types;
