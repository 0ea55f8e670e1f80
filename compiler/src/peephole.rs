// peephole.rs — Type transfer functions and local rewrites
//
// Every node creation and every worklist visit runs `peephole_opt`:
// recompute the node's type, collapse constants, share through value
// numbering, then apply the opcode's idealize rule.
//
// Preconditions: the node is live and its inputs satisfy its arity contract.
// Postconditions: a node's type only moves down the lattice (toward Top)
//                 once its inputs are final; replacements are equivalent on
//                 every execution that reaches them.
// Failure modes: none (rules that cannot apply return `None`).
// Side effects: edits the graph in place (input swaps, dead-path removal).

use crate::graph::Graph;
use crate::id::{NodeId, TypeId};
use crate::node::{Op, RegionState};

/// Replacement rounds applied to a fresh node before giving up.
const PEEPHOLE_ROUNDS: usize = 8;

impl Graph {
    // ── Driver ──

    /// One peephole step. Returns the node to use instead of `n` (possibly
    /// `n` itself when its type changed or it was edited in place), or
    /// `None` when nothing happened.
    pub(crate) fn peephole_opt(&mut self, n: NodeId) -> Option<NodeId> {
        let op = self.op(n);
        if op == Op::Scope {
            return None;
        }
        let old = self.ty(n);
        let new = self.compute(n);
        self.set_type(n, new);

        if !op.is_cfg() && !matches!(op, Op::Constant(_)) && self.types.is_constant(new) {
            return Some(self.constant(new));
        }

        if let Some(hit) = self.gvn_lookup_or_insert(n) {
            let joined = self.types.join(self.ty(hit), new);
            self.set_type(hit, joined);
            return Some(hit);
        }

        if let Some(x) = self.idealize(n) {
            return Some(x);
        }
        (old != new).then_some(n)
    }

    /// Peephole a node nobody uses yet, reclaiming it if replaced.
    pub(crate) fn peephole(&mut self, n: NodeId) -> NodeId {
        for _ in 0..PEEPHOLE_ROUNDS {
            match self.peephole_opt(n) {
                None => return n,
                Some(m) if m == n => continue,
                Some(m) => {
                    if self.is_unused(n) {
                        self.keep(m);
                        self.kill(n);
                        self.unkeep(m);
                    }
                    return m;
                }
            }
        }
        n
    }

    /// Peephole a node already wired into the graph; any replacement takes
    /// over its uses.
    pub(crate) fn iterate(&mut self, n: NodeId) -> Option<NodeId> {
        let x = self.peephole_opt(n)?;
        if x != n && !self.is_dead(n) {
            self.subsume(n, x);
        }
        Some(x)
    }

    /// Canonical operand order for commutative ops: constants right,
    /// otherwise the older node left.
    pub(crate) fn should_swap(&self, a: Option<NodeId>, b: Option<NodeId>) -> bool {
        let (Some(a), Some(b)) = (a, b) else {
            return false;
        };
        let ca = matches!(self.op(a), Op::Constant(_));
        let cb = matches!(self.op(b), Op::Constant(_));
        if ca != cb {
            return ca;
        }
        a > b
    }

    // ── Transfer functions ──

    fn in_ty(&self, n: NodeId, slot: usize) -> TypeId {
        self.input(n, slot).map_or(TypeId::TOP, |x| self.ty(x))
    }

    pub(crate) fn compute(&mut self, n: NodeId) -> TypeId {
        let op = self.op(n);
        match op {
            Op::Start(t) | Op::Constant(t) => t,
            Op::Stop | Op::Scope => TypeId::BOTTOM,
            Op::Region => {
                if self.region_state(n) == Some(RegionState::Building) {
                    return TypeId::CTRL;
                }
                let live = self.inputs(n)[1..]
                    .iter()
                    .flatten()
                    .any(|&p| self.ty(p) == TypeId::CTRL);
                if live {
                    TypeId::CTRL
                } else {
                    TypeId::XCTRL
                }
            }
            Op::Loop => match self.input(n, 1) {
                Some(entry) if self.ty(entry) == TypeId::CTRL => TypeId::CTRL,
                _ => TypeId::XCTRL,
            },
            Op::If => {
                if self.in_ty(n, 0) != TypeId::CTRL {
                    return TypeId::IF_NEITHER;
                }
                let pred = self.in_ty(n, 1);
                if self.types.is_high(pred) {
                    return TypeId::IF_NEITHER;
                }
                match self.types.truthiness(pred) {
                    Some(true) => TypeId::IF_TRUE,
                    Some(false) => TypeId::IF_FALSE,
                    None => TypeId::IF_BOTH,
                }
            }
            Op::CProj(i) | Op::Proj(i) => {
                let t = self.in_ty(n, 0);
                self.types.tuple_elem(t, i as usize)
            }
            Op::Return => self.in_ty(n, 0),
            Op::Phi(decl) => self.compute_phi(n, decl),
            Op::New(obj) => {
                let p = self.types.ptr(obj, crate::types::Nil::NotNil);
                self.types.tuple(vec![p, TypeId::MEM])
            }
            Op::Load(decl) => decl,
            Op::Store(_) => TypeId::MEM,
            Op::Call(_, ret) => self.types.tuple(vec![TypeId::MEM, ret]),
            Op::AddF | Op::SubF | Op::MulF | Op::DivF | Op::EqF | Op::LtF | Op::LeF => {
                self.compute_float(n, op)
            }
            Op::Eq | Op::Lt | Op::Le => self.compute_compare(n, op),
            op if op.is_binary() => self.compute_int(n, op),
            _ => self.compute_unary(n, op),
        }
    }

    /// Meet of the values on live paths, clamped by the declared type.
    /// While the region is still collecting paths the declared type stands.
    fn compute_phi(&mut self, n: NodeId, decl: TypeId) -> TypeId {
        let Some(region) = self.input(n, 0) else {
            return decl;
        };
        if !self.op(region).is_region()
            || self.region_state(region) == Some(RegionState::Building)
        {
            return decl;
        }
        let paths = self.inputs(n).len().min(self.inputs(region).len());
        let mut t = TypeId::TOP;
        for i in 1..paths {
            let live = self
                .input(region, i)
                .is_some_and(|p| self.ty(p) == TypeId::CTRL);
            if !live {
                continue;
            }
            match self.input(n, i) {
                Some(v) if v != n => {
                    let vt = self.ty(v);
                    t = self.types.meet(t, vt);
                }
                _ => {}
            }
        }
        self.types.join(t, decl)
    }

    fn compute_int(&mut self, n: NodeId, op: Op) -> TypeId {
        let (a, b) = (self.input(n, 1), self.input(n, 2));
        let (ta, tb) = (self.in_ty(n, 1), self.in_ty(n, 2));
        if ta == TypeId::TOP || tb == TypeId::TOP {
            return TypeId::TOP;
        }
        if a == b {
            match op {
                Op::Sub | Op::Xor => return TypeId::ZERO,
                Op::And | Op::Or if self.types.as_int(ta).is_some() => return ta,
                _ => {}
            }
        }
        let (Some((a0, a1)), Some((b0, b1))) = (self.types.as_int(ta), self.types.as_int(tb))
        else {
            return TypeId::INT_BOT;
        };
        if a0 > a1 || b0 > b1 {
            return TypeId::INT_TOP;
        }
        if a0 == a1 && b0 == b1 {
            let (x, y) = (a0, b0);
            let v = match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                Op::Div if y == 0 => return TypeId::INT_BOT,
                Op::Div => x.wrapping_div(y),
                Op::And => x & y,
                Op::Or => x | y,
                Op::Xor => x ^ y,
                Op::Shl => x.wrapping_shl((y & 63) as u32),
                Op::Shr => ((x as u64) >> (y & 63)) as i64,
                Op::Sar => x >> (y & 63),
                _ => return TypeId::INT_BOT,
            };
            return self.types.int_con(v);
        }
        match op {
            Op::Add => match (a0.checked_add(b0), a1.checked_add(b1)) {
                (Some(lo), Some(hi)) => self.types.int(lo, hi),
                _ => TypeId::INT_BOT,
            },
            Op::Sub => match (a0.checked_sub(b1), a1.checked_sub(b0)) {
                (Some(lo), Some(hi)) => self.types.int(lo, hi),
                _ => TypeId::INT_BOT,
            },
            Op::And if a0 >= 0 || b0 >= 0 => {
                let hi = match (a0 >= 0, b0 >= 0) {
                    (true, true) => a1.min(b1),
                    (true, false) => a1,
                    _ => b1,
                };
                self.types.int(0, hi)
            }
            Op::Shr | Op::Sar if b0 == b1 && a0 >= 0 && (0..64).contains(&b0) => {
                self.types.int(a0 >> b0, a1 >> b0)
            }
            _ => TypeId::INT_BOT,
        }
    }

    fn compute_compare(&mut self, n: NodeId, op: Op) -> TypeId {
        let (a, b) = (self.input(n, 1), self.input(n, 2));
        let (ta, tb) = (self.in_ty(n, 1), self.in_ty(n, 2));
        if self.types.is_high(ta) || self.types.is_high(tb) {
            return TypeId::TOP;
        }
        if a == b {
            return if op == Op::Lt {
                TypeId::ZERO
            } else {
                TypeId::ONE
            };
        }
        if op == Op::Eq && self.types.is_pointer_like(ta) && self.types.is_pointer_like(tb) {
            let known = |t: TypeId| match (t == TypeId::NIL, self.types.truthiness(t)) {
                (true, _) => Some(false),
                (false, Some(true)) => Some(true),
                _ => None,
            };
            return match (known(ta), known(tb)) {
                (Some(false), Some(false)) => TypeId::ONE,
                (Some(false), Some(true)) | (Some(true), Some(false)) => TypeId::ZERO,
                _ => TypeId::BOOL,
            };
        }
        let (Some((a0, a1)), Some((b0, b1))) = (self.types.as_int(ta), self.types.as_int(tb))
        else {
            return TypeId::BOOL;
        };
        let (always, never) = match op {
            Op::Eq => (a0 == a1 && b0 == b1 && a0 == b0, a1 < b0 || b1 < a0),
            Op::Lt => (a1 < b0, a0 >= b1),
            _ => (a1 <= b0, a0 > b1),
        };
        if always {
            TypeId::ONE
        } else if never {
            TypeId::ZERO
        } else {
            TypeId::BOOL
        }
    }

    fn compute_float(&mut self, n: NodeId, op: Op) -> TypeId {
        let (ta, tb) = (self.in_ty(n, 1), self.in_ty(n, 2));
        if self.types.is_high(ta) || self.types.is_high(tb) {
            return TypeId::TOP;
        }
        let cmp = matches!(op, Op::EqF | Op::LtF | Op::LeF);
        let (Some(x), Some(y)) = (self.types.float_value(ta), self.types.float_value(tb)) else {
            return if cmp { TypeId::BOOL } else { TypeId::FLOAT_BOT };
        };
        match op {
            Op::AddF => self.types.float_con(x + y),
            Op::SubF => self.types.float_con(x - y),
            Op::MulF => self.types.float_con(x * y),
            Op::DivF => self.types.float_con(x / y),
            Op::EqF => self.types.int_con((x == y) as i64),
            Op::LtF => self.types.int_con((x < y) as i64),
            _ => self.types.int_con((x <= y) as i64),
        }
    }

    fn compute_unary(&mut self, n: NodeId, op: Op) -> TypeId {
        let t = self.in_ty(n, 1);
        if self.types.is_high(t) {
            return TypeId::TOP;
        }
        match op {
            Op::Neg => match self.types.as_int(t) {
                Some((lo, hi)) if lo > i64::MIN => self.types.int(-hi, -lo),
                _ => TypeId::INT_BOT,
            },
            Op::Not => match self.types.truthiness(t) {
                Some(b) => self.types.int_con((!b) as i64),
                None => TypeId::BOOL,
            },
            Op::ToFloat => match self.types.int_value(t) {
                Some(v) => self.types.float_con(v as f64),
                None => TypeId::FLOAT_BOT,
            },
            Op::ToInt => match self.types.float_value(t) {
                Some(v) => self.types.int_con(v as i64),
                None => TypeId::INT_BOT,
            },
            _ => TypeId::BOTTOM,
        }
    }

    // ── Idealize ──

    fn node_int(&self, n: Option<NodeId>) -> Option<i64> {
        let n = n?;
        match self.op(n) {
            Op::Constant(t) => self.types.int_value(t),
            _ => None,
        }
    }

    fn idealize(&mut self, n: NodeId) -> Option<NodeId> {
        let op = self.op(n);
        if op.is_binary() && op.is_commutative() && self.should_swap(self.input(n, 1), self.input(n, 2))
        {
            self.swap_inputs(n, 1, 2);
            return Some(n);
        }
        let (lhs, rhs) = (self.input(n, 1), self.input(n, 2));
        let rc = self.node_int(rhs);
        match op {
            Op::Add => self.idealize_add(n),
            Op::Sub | Op::Or | Op::Xor | Op::Shl | Op::Shr | Op::Sar if rc == Some(0) => lhs,
            Op::Mul if rc == Some(1) => lhs,
            Op::Mul => match rc {
                Some(c) if c > 1 && c.count_ones() == 1 => {
                    let k = self.con_int(c.trailing_zeros() as i64);
                    self.create(Op::Shl, &[None, lhs, Some(k)]).ok()
                }
                _ => None,
            },
            Op::And if rc == Some(-1) || lhs == rhs => lhs,
            Op::Or if lhs == rhs => lhs,
            Op::Neg => {
                let x = lhs?;
                match self.op(x) {
                    Op::Neg => self.input(x, 1),
                    _ => None,
                }
            }
            Op::Phi(_) => self.idealize_phi(n),
            Op::Region | Op::Loop => self.idealize_region(n),
            Op::CProj(i) => self.idealize_cproj(n, i),
            Op::Stop => self.idealize_stop(n),
            Op::Load(_) => self.forward_store(n),
            _ => None,
        }
    }

    fn idealize_add(&mut self, n: NodeId) -> Option<NodeId> {
        let (a, b) = (self.input(n, 1)?, self.input(n, 2)?);
        let rc = self.node_int(Some(b));
        if rc == Some(0) {
            return Some(a);
        }
        if a == b {
            let one = self.con_int(1);
            return self.create(Op::Shl, &[None, Some(a), Some(one)]).ok();
        }
        if let (Some(c2), Op::Add) = (rc, self.op(a)) {
            if let Some(c1) = self.node_int(self.input(a, 2)) {
                let x = self.input(a, 1);
                let sum = self.con_int(c1.wrapping_add(c2));
                return self.create(Op::Add, &[None, x, Some(sum)]).ok();
            }
        }
        None
    }

    fn idealize_phi(&mut self, n: NodeId) -> Option<NodeId> {
        let region = self.input(n, 0)?;
        if !self.op(region).is_region()
            || self.region_state(region) == Some(RegionState::Building)
        {
            return None;
        }
        let paths = self.inputs(n).len();
        if paths != self.inputs(region).len() {
            return None;
        }
        if paths == 2 {
            return self.input(n, 1);
        }
        let mut unique = None;
        for i in 1..paths {
            let live = self
                .input(region, i)
                .is_some_and(|p| self.ty(p) != TypeId::XCTRL);
            if !live {
                continue;
            }
            let v = self.input(n, i)?;
            if v == n {
                continue;
            }
            match unique {
                None => unique = Some(v),
                Some(u) if u == v => {}
                Some(_) => return None,
            }
        }
        unique
    }

    /// Drop dead predecessors (and the matching phi inputs) while a live one
    /// remains; a single-predecessor region without phis folds away.
    fn idealize_region(&mut self, n: NodeId) -> Option<NodeId> {
        if self.region_state(n) == Some(RegionState::Building) || self.ty(n) != TypeId::CTRL {
            return None;
        }
        let is_loop = self.op(n) == Op::Loop;
        let paths = self.inputs(n).len();
        let first = if is_loop { 2 } else { 1 };
        let dead = (first..paths).find(|&i| {
            self.input(n, i)
                .is_some_and(|p| self.ty(p) == TypeId::XCTRL)
        });
        if let Some(i) = dead {
            for phi in self.phis_of(n) {
                if self.inputs(phi).len() == paths {
                    self.remove_input(phi, i);
                }
            }
            self.remove_input(n, i);
            if is_loop {
                self.set_op_in_place(n, Op::Region);
            }
            return Some(n);
        }
        if paths == 2 && self.phis_of(n).is_empty() {
            return self.input(n, 1);
        }
        None
    }

    fn idealize_cproj(&mut self, n: NodeId, idx: u32) -> Option<NodeId> {
        let parent = self.input(n, 0)?;
        if self.op(parent) != Op::If {
            return None;
        }
        let t = self.ty(parent);
        if t == TypeId::IF_NEITHER {
            return None;
        }
        let me = self.types.tuple_elem(t, idx as usize);
        let other = self.types.tuple_elem(t, 1 - idx as usize);
        if me == TypeId::XCTRL {
            return Some(self.constant(TypeId::XCTRL));
        }
        if other == TypeId::XCTRL {
            return self.input(parent, 0);
        }
        None
    }

    fn idealize_stop(&mut self, n: NodeId) -> Option<NodeId> {
        let dead = (0..self.inputs(n).len()).rev().find(|&i| {
            self.input(n, i)
                .is_some_and(|r| self.ty(r) == TypeId::XCTRL)
        })?;
        self.remove_input(n, dead);
        Some(n)
    }

    /// A load reading exactly what the preceding store wrote takes the
    /// stored value.
    fn forward_store(&mut self, n: NodeId) -> Option<NodeId> {
        let mem = self.input(n, 1)?;
        let Op::Store(stored) = self.op(mem) else {
            return None;
        };
        let Op::Load(loaded) = self.op(n) else {
            return None;
        };
        let same_slot =
            self.input(mem, 2) == self.input(n, 2) && self.input(mem, 3) == self.input(n, 3);
        if stored == loaded && same_slot {
            self.input(mem, 4)
        } else {
            None
        }
    }
}
