// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the backend's four passes (graph construction is outside the
// runner), their dependency edges, and the artifacts they produce. Used by
// the pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each backend pass. Construction runs in the builder, before
/// the runner sees the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Optimize,
    Schedule,
    Lower,
    Codegen,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Stats,     // OptimizeStats per function
    Schedule,  // Schedule per function
    Cert,      // ScheduleCert / LirCert
    Lir,       // LirProgram
    Generated, // GeneratedCode
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable postconditions a pass proves about its output.
pub trait StageCert {
    /// True when every obligation holds.
    fn all_pass(&self) -> bool;
    /// Named obligations with their outcome, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failures(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions the pass establishes.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Optimize => PassDescriptor {
            name: "optimize",
            inputs: &[],
            outputs: &[ArtifactId::Stats],
            invalidation_key: "graph",
            invariants: "worklist empty, every region optimized, types only narrowed",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Optimize],
            outputs: &[ArtifactId::Schedule, ArtifactId::Cert],
            invalidation_key: "graph",
            invariants: "S1-S3 obligations verified, regions scheduled",
        },
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Lir, ArtifactId::Cert],
            invalidation_key: "graph + schedule + abi_config",
            invariants: "R1-R3 obligations verified, every call site ABI-resolved",
        },
        PassId::Codegen => PassDescriptor {
            name: "codegen",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::Generated],
            invalidation_key: "lir + codegen_options",
            invariants: "valid x86-64 Intel-syntax assembly emitted",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 4] = [
    PassId::Optimize,
    PassId::Schedule,
    PassId::Lower,
    PassId::Codegen,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
