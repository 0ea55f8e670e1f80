// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases.
// The front end is external, so diagnostics are anchored on graph nodes
// (opcode and input identities) rather than source spans.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`, `E0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by phase.
///
/// - `E01xx` graph construction (front-end contract)
/// - `E02xx` construction facade (names, fields, shapes)
/// - `E03xx` global code motion
/// - `E04xx` ABI configuration
/// - `E05xx` lowering and emission
pub mod codes {
    use super::DiagCode;

    /// Node created with the wrong number of inputs, or a required slot empty.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Input refers to a dead or out-of-range node.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Region still building when the graph was optimized or scheduled.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Illegal region state transition (e.g. sealing twice).
    pub const E0103: DiagCode = DiagCode("E0103");
    /// Scheduling requested before the optimizer reached a fixed point.
    pub const E0104: DiagCode = DiagCode("E0104");
    /// Peephole worklist did not converge within the iteration budget.
    pub const E0105: DiagCode = DiagCode("E0105");

    /// Unknown variable name.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// Memory access through a value that is not a pointer to a known shape.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Unknown struct field.
    pub const E0202: DiagCode = DiagCode("E0202");
    /// Function finished without a return, or returned twice.
    pub const E0203: DiagCode = DiagCode("E0203");
    /// Operand types do not fit the operation (int/float mix, float shift).
    pub const E0204: DiagCode = DiagCode("E0204");

    /// Cycle among unpinned nodes.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Early placement does not dominate late placement.
    pub const E0301: DiagCode = DiagCode("E0301");
    /// Cycle in the local (within-block) ordering.
    pub const E0302: DiagCode = DiagCode("E0302");
    /// Malformed control skeleton (no start, unreachable control).
    pub const E0303: DiagCode = DiagCode("E0303");
    /// Schedule certificate failed verification.
    pub const E0304: DiagCode = DiagCode("E0304");

    /// Calling convention not supported by the target.
    pub const E0400: DiagCode = DiagCode("E0400");
    /// Aggregate return exceeds the convention's register budget.
    pub const E0401: DiagCode = DiagCode("E0401");
    /// Unknown convention or return-strategy name.
    pub const E0402: DiagCode = DiagCode("E0402");
    /// Parameter type has no argument class (e.g. aggregate by value).
    pub const E0403: DiagCode = DiagCode("E0403");

    /// Value kind has no memory representation.
    pub const E0500: DiagCode = DiagCode("E0500");
    /// Node kind cannot be lowered at this point.
    pub const E0501: DiagCode = DiagCode("E0501");
    /// LIR certificate failed verification.
    pub const E0502: DiagCode = DiagCode("E0502");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related node ─────────────────────────────────────────────────────────

/// A secondary node providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedNode {
    pub node: NodeId,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a propagated failure.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub node: Option<NodeId>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub node: Option<NodeId>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedNode>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, node, hint, related nodes, or causes.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            node: None,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic carrying a code.
    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Anchor the diagnostic on the offending node.
    pub fn at(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related node.
    pub fn with_related(mut self, node: NodeId, label: impl Into<String>) -> Self {
        self.related.push(RelatedNode {
            node,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, node: Option<NodeId>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            node,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(node) = self.node {
            write!(f, "\n  at: {}", node)?;
        }
        for rel in &self.related {
            write!(f, "\n  note: {}: {}", rel.node, rel.label)?;
        }
        for cause in &self.cause_chain {
            match cause.node {
                Some(n) => write!(f, "\n  cause: {} ({})", cause.message, n)?,
                None => write!(f, "\n  cause: {}", cause.message)?,
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::error(codes::E0300, "cycle among unpinned nodes");
        assert_eq!(format!("{d}"), "error[E0300]: cycle among unpinned nodes");
    }

    #[test]
    fn display_with_node_related_and_hint() {
        let d = Diagnostic::error(codes::E0100, "malformed arity for Add")
            .at(NodeId(7))
            .with_related(NodeId(3), "Constant(5)")
            .with_hint("binary operators take [None, lhs, rhs]");
        let s = d.to_string();
        assert!(s.starts_with("error[E0100]: malformed arity for Add"));
        assert!(s.contains("\n  at: n7"));
        assert!(s.contains("\n  note: n3: Constant(5)"));
        assert!(s.ends_with("\n  hint: binary operators take [None, lhs, rhs]"));
    }

    #[test]
    fn warning_level() {
        let d = Diagnostic::new(DiagLevel::Warning, "unused")
            .with_code(codes::E0501)
            .with_cause("inner", None);
        assert!(!d.is_error());
        assert_eq!(d.cause_chain.len(), 1);
        assert_eq!(format!("{d}"), "warning[E0501]: unused\n  cause: inner");
    }
}
