// node.rs — Node kinds, input arity contracts and per-node storage
//
// A node is an opcode plus an ordered input list (slot 0 is the controlling
// node for control-dependent ops, `None` for floating data ops) and a
// non-owning use-list maintained by the graph.
//
// Preconditions: none (types only).
// Postconditions: `validate_inputs` accepts exactly the input shapes the
//                 peephole engine, GCM and lowering rely on.
// Failure modes: `validate_inputs` reports a human-readable reason.
// Side effects: none.

use std::fmt;

use crate::id::{FuncId, NodeId, TypeId};

// ── Opcodes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Control
    /// Function entry; produces `[Ctrl, Mem, args...]` of the given tuple type.
    Start(TypeId),
    Stop,
    Region,
    /// Loop header: `[None, entry, back]`.
    Loop,
    If,
    /// Control projection of `Start` (0) or `If` (0 = true, 1 = false).
    CProj(u32),
    /// `[ctrl, mem, value?]`.
    Return,

    // Data
    Proj(u32),
    Constant(TypeId),
    /// `[region, values...]` with a declared (minimum) type.
    Phi(TypeId),
    /// Construction-time variable scope; keeps live values reachable.
    Scope,

    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Neg,
    /// Logical not: 1 if the input is zero/null, else 0.
    Not,
    Eq,
    Lt,
    Le,

    AddF,
    SubF,
    MulF,
    DivF,
    EqF,
    LtF,
    LeF,
    ToFloat,
    ToInt,

    // Memory
    /// `[ctrl, mem, len?]`; produces `[ptr, mem]`. Arrays carry a length.
    New(TypeId),
    /// `[ctrl, mem, ptr, offset]` with the declared element type.
    Load(TypeId),
    /// `[ctrl, mem, ptr, offset, value]`; produces memory.
    Store(TypeId),
    /// `[ctrl, mem, args...]`; produces `[mem, result]`.
    Call(FuncId, TypeId),
}

/// Region lifecycle. Sealing fixes the predecessor set; the optimizer and
/// GCM advance the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    Building,
    Sealed,
    Optimized,
    Scheduled,
}

impl Op {
    /// Control-flow skeleton nodes.
    pub fn is_cfg(self) -> bool {
        matches!(
            self,
            Op::Start(_)
                | Op::Stop
                | Op::Region
                | Op::Loop
                | Op::If
                | Op::CProj(_)
                | Op::Return
        )
    }

    pub fn is_region(self) -> bool {
        matches!(self, Op::Region | Op::Loop)
    }

    /// Memory operations pinned to their control input.
    pub fn is_memory(self) -> bool {
        matches!(self, Op::New(_) | Op::Load(_) | Op::Store(_) | Op::Call(..))
    }

    /// Binary data operators shaped `[None, lhs, rhs]`.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::And
                | Op::Or
                | Op::Xor
                | Op::Shl
                | Op::Shr
                | Op::Sar
                | Op::Eq
                | Op::Lt
                | Op::Le
                | Op::AddF
                | Op::SubF
                | Op::MulF
                | Op::DivF
                | Op::EqF
                | Op::LtF
                | Op::LeF
        )
    }

    /// Unary data operators shaped `[None, x]`.
    pub fn is_unary(self) -> bool {
        matches!(self, Op::Neg | Op::Not | Op::ToFloat | Op::ToInt)
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Op::Add | Op::Mul | Op::And | Op::Or | Op::Xor | Op::Eq | Op::AddF | Op::MulF | Op::EqF
        )
    }

    /// Whether structurally equal instances may be shared by value numbering.
    /// Side-effecting and control nodes keep their identity.
    pub fn is_value_numbered(self) -> bool {
        !(matches!(
            self,
            Op::Start(_)
                | Op::Stop
                | Op::Region
                | Op::Loop
                | Op::If
                | Op::Return
                | Op::Scope
        ) || matches!(self, Op::New(_) | Op::Store(_) | Op::Call(..)))
    }

    /// Short mnemonic used by printers.
    pub fn name(self) -> &'static str {
        match self {
            Op::Start(_) => "Start",
            Op::Stop => "Stop",
            Op::Region => "Region",
            Op::Loop => "Loop",
            Op::If => "If",
            Op::CProj(_) => "CProj",
            Op::Return => "Return",
            Op::Proj(_) => "Proj",
            Op::Constant(_) => "Con",
            Op::Phi(_) => "Phi",
            Op::Scope => "Scope",
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Div => "Div",
            Op::And => "And",
            Op::Or => "Or",
            Op::Xor => "Xor",
            Op::Shl => "Shl",
            Op::Shr => "Shr",
            Op::Sar => "Sar",
            Op::Neg => "Neg",
            Op::Not => "Not",
            Op::Eq => "Eq",
            Op::Lt => "Lt",
            Op::Le => "Le",
            Op::AddF => "AddF",
            Op::SubF => "SubF",
            Op::MulF => "MulF",
            Op::DivF => "DivF",
            Op::EqF => "EqF",
            Op::LtF => "LtF",
            Op::LeF => "LeF",
            Op::ToFloat => "ToFloat",
            Op::ToInt => "ToInt",
            Op::New(_) => "New",
            Op::Load(_) => "Load",
            Op::Store(_) => "Store",
            Op::Call(..) => "Call",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::CProj(i) | Op::Proj(i) => write!(f, "{}({})", self.name(), i),
            Op::Call(func, _) => write!(f, "Call({})", func),
            _ => write!(f, "{}", self.name()),
        }
    }
}

// ── Arity contracts ─────────────────────────────────────────────────────────

/// Check an input list against the opcode's contract. Returns the reason
/// on mismatch.
pub fn validate_inputs(op: Op, inputs: &[Option<NodeId>]) -> Result<(), String> {
    let n = inputs.len();
    let exact = |want: usize| -> Result<(), String> {
        if n == want {
            Ok(())
        } else {
            Err(format!("{} takes {} inputs, got {}", op.name(), want, n))
        }
    };
    let at_least = |want: usize| -> Result<(), String> {
        if n >= want {
            Ok(())
        } else {
            Err(format!("{} takes at least {} inputs, got {}", op.name(), want, n))
        }
    };
    let present = |slots: &[usize]| -> Result<(), String> {
        for &s in slots {
            if inputs.get(s).copied().flatten().is_none() {
                return Err(format!("{} requires input slot {}", op.name(), s));
            }
        }
        Ok(())
    };
    let absent_ctrl = || -> Result<(), String> {
        if inputs.first().copied().flatten().is_some() {
            return Err(format!("{} is a floating node; slot 0 must be empty", op.name()));
        }
        Ok(())
    };

    match op {
        Op::Start(_) | Op::Constant(_) => exact(0),
        Op::Stop | Op::Scope => Ok(()),
        Op::Region => at_least(2),
        Op::Loop => {
            exact(3)?;
            present(&[1])
        }
        Op::If => {
            exact(2)?;
            present(&[0, 1])
        }
        Op::CProj(_) | Op::Proj(_) => {
            exact(1)?;
            present(&[0])
        }
        Op::Return => {
            exact(3)?;
            present(&[0, 1])
        }
        Op::Phi(_) => {
            at_least(2)?;
            present(&[0])
        }
        Op::New(_) => {
            exact(3)?;
            present(&[0, 1])
        }
        Op::Load(_) => {
            exact(4)?;
            present(&[0, 1, 2, 3])
        }
        Op::Store(_) => {
            exact(5)?;
            present(&[0, 1, 2, 3, 4])
        }
        Op::Call(..) => {
            at_least(2)?;
            present(&[0, 1])?;
            present(&(2..n).collect::<Vec<_>>())
        }
        op if op.is_binary() => {
            exact(3)?;
            absent_ctrl()?;
            present(&[1, 2])
        }
        op if op.is_unary() => {
            exact(2)?;
            absent_ctrl()?;
            present(&[1])
        }
        _ => Ok(()),
    }
}

// ── Node storage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<Option<NodeId>>,
    /// One entry per using input slot; a user appears once per slot.
    pub uses: Vec<NodeId>,
    pub ty: TypeId,
    /// Present for `Region` and `Loop`.
    pub state: Option<RegionState>,
    pub(crate) hashed: bool,
    pub(crate) keep: u32,
    pub(crate) dead: bool,
}

impl Node {
    pub(crate) fn new(op: Op, inputs: Vec<Option<NodeId>>) -> Self {
        Node {
            op,
            inputs,
            uses: Vec::new(),
            ty: TypeId::BOTTOM,
            state: op.is_region().then_some(RegionState::Building),
            hashed: false,
            keep: 0,
            dead: false,
        }
    }

    pub fn input(&self, slot: usize) -> Option<NodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[Option<u32>]) -> Vec<Option<NodeId>> {
        v.iter().map(|x| x.map(NodeId)).collect()
    }

    #[test]
    fn binary_ops_need_two_operands_and_no_control() {
        assert!(validate_inputs(Op::Add, &ids(&[None, Some(1), Some(2)])).is_ok());
        assert!(validate_inputs(Op::Add, &ids(&[None, Some(1)])).is_err());
        assert!(validate_inputs(Op::Add, &ids(&[Some(0), Some(1), Some(2)])).is_err());
        assert!(validate_inputs(Op::Add, &ids(&[None, None, Some(2)])).is_err());
    }

    #[test]
    fn memory_ops_need_control_and_memory() {
        assert!(validate_inputs(Op::Load(TypeId::INT_BOT), &ids(&[Some(1), Some(2), Some(3), Some(4)])).is_ok());
        let err = validate_inputs(Op::Load(TypeId::INT_BOT), &ids(&[None, Some(2), Some(3), Some(4)]))
            .unwrap_err();
        assert!(err.contains("slot 0"), "{err}");
        assert!(validate_inputs(Op::New(TypeId::STRUCT_BOT), &ids(&[Some(1), Some(2), None])).is_ok());
    }

    #[test]
    fn loop_back_edge_may_be_pending() {
        assert!(validate_inputs(Op::Loop, &ids(&[None, Some(1), None])).is_ok());
        assert!(validate_inputs(Op::Loop, &ids(&[None, None, None])).is_err());
    }

    #[test]
    fn value_numbering_excludes_effects_and_control() {
        assert!(Op::Add.is_value_numbered());
        assert!(Op::Load(TypeId::INT_BOT).is_value_numbered());
        assert!(!Op::Store(TypeId::INT_BOT).is_value_numbered());
        assert!(!Op::Region.is_value_numbered());
        assert!(!Op::Scope.is_value_numbered());
    }

    #[test]
    fn regions_start_building() {
        let n = Node::new(Op::Region, ids(&[None, Some(1), Some(2)]));
        assert_eq!(n.state, Some(RegionState::Building));
        assert_eq!(Node::new(Op::Add, vec![]).state, None);
    }
}
