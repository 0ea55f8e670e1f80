// graph.rs — Sea-of-Nodes arena, use-lists and global value numbering
//
// Owns every node of one function, keeps def-use edges bidirectional,
// value-numbers pure nodes, and routes every creation through the
// peephole engine. Also defines the function and module containers.
//
// Preconditions: inputs handed to `create` must be live nodes of this graph.
// Postconditions: `uses(d)` holds one entry per (user, slot) with
//                 `input(user, slot) == Some(d)`; the GVN table only maps
//                 keys to live nodes whose current (op, inputs) match.
// Failure modes: malformed arity → `E0100`; dead input → `E0101`;
//                illegal region transition → `E0103`.
// Side effects: none (emits `trace!` events for node creation).

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::trace;

use crate::diag::{codes, Diagnostic};
use crate::id::{FuncId, IdAllocator, NodeId, TypeId};
use crate::node::{validate_inputs, Node, Op, RegionState};
use crate::types::TypeTable;

type GvnKey = (Op, Vec<Option<NodeId>>);

/// Peephole rounds applied to a region and its phis when it is sealed.
const SEAL_ROUNDS: usize = 4;

// ── Worklist ────────────────────────────────────────────────────────────────

/// FIFO worklist with an on-list bitset so each node is queued at most once.
#[derive(Debug, Default)]
pub(crate) struct WorkList {
    queue: VecDeque<NodeId>,
    on: Vec<bool>,
}

impl WorkList {
    pub(crate) fn push(&mut self, n: NodeId) {
        let i = n.index();
        if i >= self.on.len() {
            self.on.resize(i + 1, false);
        }
        if !self.on[i] {
            self.on[i] = true;
            self.queue.push_back(n);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<NodeId> {
        let n = self.queue.pop_front()?;
        self.on[n.index()] = false;
        Some(n)
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.on.clear();
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// One function's node arena. Node 0 is always `Stop`.
#[derive(Debug)]
pub struct Graph {
    pub types: TypeTable,
    nodes: Vec<Node>,
    gvn: HashMap<GvnKey, NodeId>,
    pub(crate) work: WorkList,
    start: Option<NodeId>,
    stop: NodeId,
    trace: Option<Vec<(NodeId, TypeId)>>,
    /// Set by the optimizer; any structural edit clears it.
    pub(crate) optimized: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut g = Graph {
            types: TypeTable::new(),
            nodes: Vec::new(),
            gvn: HashMap::new(),
            work: WorkList::default(),
            start: None,
            stop: NodeId(0),
            trace: None,
            optimized: false,
        };
        g.stop = g.alloc(Op::Stop, Vec::new());
        g
    }

    // ── Accessors ──

    pub fn stop(&self) -> NodeId {
        self.stop
    }

    pub fn start(&self) -> Option<NodeId> {
        self.start
    }

    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n.index()]
    }

    pub fn op(&self, n: NodeId) -> Op {
        self.nodes[n.index()].op
    }

    pub fn ty(&self, n: NodeId) -> TypeId {
        self.nodes[n.index()].ty
    }

    pub fn input(&self, n: NodeId, slot: usize) -> Option<NodeId> {
        self.nodes[n.index()].input(slot)
    }

    pub fn inputs(&self, n: NodeId) -> &[Option<NodeId>] {
        &self.nodes[n.index()].inputs
    }

    pub fn uses(&self, n: NodeId) -> &[NodeId] {
        &self.nodes[n.index()].uses
    }

    pub fn is_dead(&self, n: NodeId) -> bool {
        self.nodes[n.index()].dead
    }

    pub fn region_state(&self, n: NodeId) -> Option<RegionState> {
        self.nodes[n.index()].state
    }

    /// Arena size, including dead slots.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Live nodes in id order.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.dead)
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Whether the optimizer reached a fixed point and nothing changed since.
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.dead).count()
    }

    /// Distinct phis hanging off a region, in id order.
    pub fn phis_of(&self, region: NodeId) -> Vec<NodeId> {
        let mut phis: Vec<NodeId> = self
            .uses(region)
            .iter()
            .copied()
            .filter(|&u| matches!(self.op(u), Op::Phi(_)) && self.input(u, 0) == Some(region))
            .collect();
        phis.sort();
        phis.dedup();
        phis
    }

    /// `Op(n3, n4)` style label used by diagnostics and printers.
    pub fn label(&self, n: NodeId) -> String {
        let node = self.node(n);
        let args: Vec<String> = node
            .inputs
            .iter()
            .map(|x| x.map_or_else(|| "_".to_string(), |x| x.to_string()))
            .collect();
        match node.op {
            Op::Constant(t) => format!("Con({})", self.types.display(t)),
            op => format!("{}({})", op, args.join(", ")),
        }
    }

    // ── Creation ──

    /// Raw allocation: wires use-lists and nothing else.
    pub(crate) fn alloc(&mut self, op: Op, inputs: Vec<Option<NodeId>>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.optimized = false;
        for x in inputs.iter().flatten() {
            self.nodes[x.index()].uses.push(id);
        }
        self.nodes.push(Node::new(op, inputs));
        if let Op::Start(_) = op {
            self.start = Some(id);
        }
        id
    }

    fn check_inputs(&self, op: Op, inputs: &[Option<NodeId>]) -> Result<(), Diagnostic> {
        if let Err(reason) = validate_inputs(op, inputs) {
            let mut d = Diagnostic::error(codes::E0100, format!("malformed {} node: {}", op, reason))
                .with_hint("see the input layout documented on `Op`");
            for (slot, x) in inputs.iter().enumerate() {
                if let Some(x) = x {
                    if x.index() < self.nodes.len() {
                        d = d.with_related(*x, format!("slot {}: {}", slot, self.label(*x)));
                    }
                }
            }
            return Err(d);
        }
        for x in inputs.iter().flatten() {
            if x.index() >= self.nodes.len() || self.nodes[x.index()].dead {
                return Err(Diagnostic::error(
                    codes::E0101,
                    format!("input {} of new {} node is dead or unknown", x, op),
                ));
            }
        }
        Ok(())
    }

    /// Create a node, or return an existing equivalent one. Runs the peephole
    /// engine on the result, so the returned id may name a simpler node.
    pub fn create(&mut self, op: Op, inputs: &[Option<NodeId>]) -> Result<NodeId, Diagnostic> {
        self.check_inputs(op, inputs)?;
        let mut inputs = inputs.to_vec();
        if op.is_commutative() && self.should_swap(inputs[1], inputs[2]) {
            inputs.swap(1, 2);
        }
        if self.value_numbered(op, &inputs) {
            if let Some(&hit) = self.gvn.get(&(op, inputs.clone())) {
                if !self.is_dead(hit) {
                    return Ok(hit);
                }
            }
        }
        let n = self.alloc(op, inputs);
        let ty = self.compute(n);
        self.set_type(n, ty);
        let out = self.peephole(n);
        trace!("create {} -> {}", self.label(n), out);
        Ok(out)
    }

    /// Interned constant node of type `ty`.
    pub fn constant(&mut self, ty: TypeId) -> NodeId {
        let key = (Op::Constant(ty), Vec::new());
        if let Some(&hit) = self.gvn.get(&key) {
            if !self.is_dead(hit) {
                return hit;
            }
        }
        let n = self.alloc(Op::Constant(ty), Vec::new());
        self.set_type(n, ty);
        self.gvn.insert(key, n);
        self.nodes[n.index()].hashed = true;
        n
    }

    pub fn con_int(&mut self, value: i64) -> NodeId {
        let t = self.types.int_con(value);
        self.constant(t)
    }

    pub(crate) fn value_numbered(&self, op: Op, inputs: &[Option<NodeId>]) -> bool {
        if !op.is_value_numbered() {
            return false;
        }
        match (op, inputs.first().copied().flatten()) {
            (Op::Phi(_), Some(r)) => self.region_state(r) != Some(RegionState::Building),
            _ => true,
        }
    }

    /// Try to register `n` in the GVN table. Returns an equivalent live node
    /// already present, if any.
    pub(crate) fn gvn_lookup_or_insert(&mut self, n: NodeId) -> Option<NodeId> {
        let node = &self.nodes[n.index()];
        if node.hashed || !self.value_numbered(node.op, &node.inputs) {
            return None;
        }
        let key = (node.op, node.inputs.clone());
        match self.gvn.get(&key).copied() {
            Some(hit) if hit != n && !self.is_dead(hit) => Some(hit),
            _ => {
                self.gvn.insert(key, n);
                self.nodes[n.index()].hashed = true;
                None
            }
        }
    }

    /// Drop `n` from the GVN table before its key changes.
    fn unlock(&mut self, n: NodeId) {
        let node = &self.nodes[n.index()];
        if !node.hashed {
            return;
        }
        let key = (node.op, node.inputs.clone());
        if self.gvn.get(&key) == Some(&n) {
            self.gvn.remove(&key);
        }
        self.nodes[n.index()].hashed = false;
    }

    // ── Types ──

    /// Record a new type for `n`, queueing its users when it changed.
    pub(crate) fn set_type(&mut self, n: NodeId, ty: TypeId) {
        let old = self.nodes[n.index()].ty;
        if old == ty {
            return;
        }
        self.nodes[n.index()].ty = ty;
        for i in 0..self.nodes[n.index()].uses.len() {
            let u = self.nodes[n.index()].uses[i];
            self.work.push(u);
        }
        if let Some(trace) = &mut self.trace {
            trace.push((n, ty));
        }
    }

    /// Start recording every type assignment.
    pub fn enable_type_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    /// Recorded `(node, type)` assignments in order.
    pub fn type_trace(&self) -> &[(NodeId, TypeId)] {
        self.trace.as_deref().unwrap_or(&[])
    }

    // ── Edge mutation ──

    pub fn set_input(&mut self, n: NodeId, slot: usize, new: Option<NodeId>) {
        self.optimized = false;
        let old = self.nodes[n.index()].inputs[slot];
        if old == new {
            return;
        }
        self.unlock(n);
        if let Some(x) = new {
            self.nodes[x.index()].uses.push(n);
        }
        self.nodes[n.index()].inputs[slot] = new;
        if let Some(o) = old {
            self.drop_use(o, n);
        }
        self.work.push(n);
    }

    /// Append an input; returns its slot.
    pub fn add_input(&mut self, n: NodeId, x: Option<NodeId>) -> usize {
        self.optimized = false;
        self.unlock(n);
        if let Some(x) = x {
            self.nodes[x.index()].uses.push(n);
        }
        let inputs = &mut self.nodes[n.index()].inputs;
        inputs.push(x);
        self.work.push(n);
        inputs.len() - 1
    }

    /// Remove an input slot, shifting later slots down.
    pub fn remove_input(&mut self, n: NodeId, slot: usize) {
        self.optimized = false;
        self.unlock(n);
        let old = self.nodes[n.index()].inputs.remove(slot);
        if let Some(o) = old {
            self.drop_use(o, n);
        }
        self.work.push(n);
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        let uses = &mut self.nodes[def.index()].uses;
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.swap_remove(pos);
        }
    }

    /// Remove one use edge and reclaim the definition if nothing holds it.
    fn drop_use(&mut self, def: NodeId, user: NodeId) {
        self.remove_use(def, user);
        if self.is_unused(def) && !self.is_anchor(def) {
            self.kill(def);
        } else {
            self.work.push(def);
        }
    }

    /// Exchange two input slots; use-lists are unchanged.
    pub(crate) fn swap_inputs(&mut self, n: NodeId, i: usize, j: usize) {
        self.unlock(n);
        self.nodes[n.index()].inputs.swap(i, j);
        self.work.push(n);
    }

    /// Change the opcode of a node whose input shape fits the new one.
    pub(crate) fn set_op_in_place(&mut self, n: NodeId, op: Op) {
        self.unlock(n);
        self.nodes[n.index()].op = op;
        self.work.push(n);
    }

    /// Constants and function parameters outlive their last use; sweeping
    /// reclaims them.
    fn is_anchor(&self, n: NodeId) -> bool {
        match self.op(n) {
            Op::Constant(_) | Op::Start(_) => true,
            Op::Proj(_) | Op::CProj(_) => self
                .input(n, 0)
                .is_some_and(|p| matches!(self.op(p), Op::Start(_))),
            _ => false,
        }
    }

    pub fn is_unused(&self, n: NodeId) -> bool {
        let node = &self.nodes[n.index()];
        !node.dead && node.uses.is_empty() && node.keep == 0 && n != self.stop
    }

    /// Redirect every use of `old` to `new`, then reclaim `old`.
    pub fn subsume(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.nodes[old.index()].uses);
        for u in users {
            self.unlock(u);
            if let Some(slot) = self.nodes[u.index()]
                .inputs
                .iter()
                .position(|x| *x == Some(old))
            {
                self.nodes[u.index()].inputs[slot] = Some(new);
                self.nodes[new.index()].uses.push(u);
            }
            self.work.push(u);
            for i in 0..self.nodes[u.index()].uses.len() {
                let uu = self.nodes[u.index()].uses[i];
                self.work.push(uu);
            }
        }
        self.keep(new);
        self.kill(old);
        self.unkeep(new);
        self.work.push(new);
    }

    /// Kill `n` and, transitively, inputs left without users.
    pub fn kill(&mut self, n: NodeId) {
        let mut stack = vec![n];
        while let Some(n) = stack.pop() {
            if !self.is_unused(n) {
                continue;
            }
            self.unlock(n);
            let inputs = std::mem::take(&mut self.nodes[n.index()].inputs);
            self.nodes[n.index()].dead = true;
            if self.start == Some(n) {
                self.start = None;
            }
            for x in inputs.into_iter().flatten() {
                self.remove_use(x, n);
                if self.is_unused(x) && !self.is_anchor(x) {
                    stack.push(x);
                } else {
                    self.work.push(x);
                }
            }
        }
    }

    /// Pin `n` against reclamation while the caller holds it.
    pub fn keep(&mut self, n: NodeId) {
        self.nodes[n.index()].keep += 1;
    }

    pub fn unkeep(&mut self, n: NodeId) {
        let node = &mut self.nodes[n.index()];
        node.keep = node.keep.saturating_sub(1);
    }

    /// Drop a keep pin and reclaim `n` if nothing else holds it.
    pub fn release(&mut self, n: NodeId) {
        self.unkeep(n);
        if self.is_unused(n) {
            self.kill(n);
        }
    }

    // ── Region state machine ──

    /// Fix a region's predecessor set and run the peephole on its phis and
    /// on the region itself.
    pub fn seal(&mut self, region: NodeId) -> Result<(), Diagnostic> {
        match self.region_state(region) {
            Some(RegionState::Building) => {}
            Some(state) => {
                return Err(Diagnostic::error(
                    codes::E0103,
                    format!("region {} cannot be sealed: already {:?}", region, state),
                )
                .at(region));
            }
            None => {
                return Err(Diagnostic::error(
                    codes::E0103,
                    format!("{} is not a region", self.label(region)),
                )
                .at(region));
            }
        }
        self.nodes[region.index()].state = Some(RegionState::Sealed);
        for _ in 0..SEAL_ROUNDS {
            let mut changed = false;
            self.keep(region);
            for phi in self.phis_of(region) {
                if !self.is_dead(phi) && self.iterate(phi).is_some() {
                    changed = true;
                }
            }
            self.unkeep(region);
            if self.is_dead(region) {
                break;
            }
            match self.iterate(region) {
                Some(x) if x == region => changed = true,
                Some(_) => break,
                None => {}
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }

    /// Advance every live region from `from` to `to`.
    pub(crate) fn advance_regions(&mut self, from: RegionState, to: RegionState) {
        for node in self.nodes.iter_mut() {
            if !node.dead && node.state == Some(from) {
                node.state = Some(to);
            }
        }
    }

    /// Whether every live region has reached `state` or later.
    pub fn regions_at_least(&self, state: RegionState) -> bool {
        let rank = |s: RegionState| s as u8;
        self.nodes
            .iter()
            .filter(|n| !n.dead)
            .filter_map(|n| n.state)
            .all(|s| rank(s) >= rank(state))
    }

    /// First live region still in `Building`, if any.
    pub fn building_region(&self) -> Option<NodeId> {
        self.live_nodes()
            .find(|&n| self.region_state(n) == Some(RegionState::Building))
    }

    // ── Reachability ──

    /// Kill every live node that `Stop` cannot reach through inputs.
    /// Returns the number of nodes removed.
    pub fn sweep_unreachable(&mut self) -> usize {
        let mut reach = vec![false; self.nodes.len()];
        let mut stack = vec![self.stop];
        reach[self.stop.index()] = true;
        while let Some(n) = stack.pop() {
            for x in self.nodes[n.index()].inputs.iter().flatten() {
                if !reach[x.index()] {
                    reach[x.index()] = true;
                    stack.push(*x);
                }
            }
        }
        let doomed: Vec<NodeId> = self.live_nodes().filter(|n| !reach[n.index()]).collect();
        for &n in &doomed {
            self.unlock(n);
        }
        for &n in &doomed {
            let inputs = std::mem::take(&mut self.nodes[n.index()].inputs);
            for x in inputs.into_iter().flatten() {
                self.remove_use(x, n);
            }
        }
        for &n in &doomed {
            let node = &mut self.nodes[n.index()];
            node.dead = true;
            node.uses.clear();
            if self.start == Some(n) {
                self.start = None;
            }
        }
        doomed.len()
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in self.live_nodes() {
            let state = match self.region_state(n) {
                Some(s) => format!(" [{:?}]", s),
                None => String::new(),
            };
            writeln!(
                f,
                "{:>5} = {} : {}{}",
                n.to_string(),
                self.label(n),
                self.types.display(self.ty(n)),
                state
            )?;
        }
        Ok(())
    }
}

// ── Functions and modules ───────────────────────────────────────────────────

/// How a function hands back its result at the source level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetType {
    Void,
    Scalar(TypeId),
    /// Struct returned by value. In the graph the function returns a pointer
    /// to the struct object; ABI lowering performs the copy-out.
    Aggregate(TypeId),
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<(String, TypeId)>,
    pub ret: RetType,
}

#[derive(Debug)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub sig: Signature,
    pub graph: Graph,
}

/// A set of functions that may call each other by `FuncId`.
#[derive(Default)]
pub struct Module {
    ids: IdAllocator,
    names: Vec<String>,
    functions: Vec<Option<Function>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id so bodies can refer to functions defined later.
    pub fn declare(&mut self, name: &str) -> FuncId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let id = self.ids.alloc_func();
        self.names.push(name.to_string());
        self.functions.push(None);
        id
    }

    pub fn define(&mut self, func: Function) -> Result<(), Diagnostic> {
        let slot = func.id.index();
        match self.functions.get(slot) {
            Some(None) => {
                self.functions[slot] = Some(func);
                Ok(())
            }
            Some(Some(_)) => Err(Diagnostic::error(
                codes::E0203,
                format!("function `{}` defined twice", func.name),
            )),
            None => Err(Diagnostic::error(
                codes::E0203,
                format!("function `{}` was never declared", func.name),
            )),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn name(&self, id: FuncId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index()).and_then(Option::as_ref)
    }

    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Defined functions in id order.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().flatten()
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.functions.iter_mut().flatten()
    }

    /// Names declared but never defined.
    pub fn undefined(&self) -> Vec<&str> {
        self.names
            .iter()
            .zip(&self.functions)
            .filter(|(_, f)| f.is_none())
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
