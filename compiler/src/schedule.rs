// schedule.rs — Global code motion for optimized Sea-of-Nodes graphs
//
// Places every live node into a basic block: pinned nodes stay with their
// control, floating nodes are scheduled early (deepest input block) and
// then late (LCA of uses, hoisted to the shallowest loop nest between the
// two bounds). Each block is then ordered locally.
//
// Preconditions: `graph` is at an optimizer fixed point; every region is
//                at least `Optimized`.
// Postconditions: returns a `Schedule` whose blocks list every live node
//                 (except `Stop`) once, with inputs dominating users;
//                 regions advance to `Scheduled`.
// Failure modes: unoptimized graph → `E0104`; building region → `E0102`;
//                cycle among floating nodes → `E0300`; early placement not
//                dominating late → `E0301`; local ordering cycle →
//                `E0302`; malformed control → `E0303`.
// Side effects: advances region states on `graph`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::cfg::{Cfg, Exit};
use crate::diag::{codes, Diagnostic};
use crate::graph::Graph;
use crate::id::{BlockId, NodeId};
use crate::node::{Op, RegionState};

// ── Public types ────────────────────────────────────────────────────────────

/// Result of global code motion for one function.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub cfg: Cfg,
    /// Block of every scheduled node.
    placement: HashMap<NodeId, BlockId>,
}

impl Schedule {
    pub fn block_of(&self, n: NodeId) -> Option<BlockId> {
        self.placement.get(&n).copied()
    }

    pub fn blocks(&self) -> &[crate::cfg::Block] {
        &self.cfg.blocks
    }

    /// Total number of scheduled nodes.
    pub fn node_count(&self) -> usize {
        self.cfg.blocks.iter().map(|b| b.nodes.len()).sum()
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions (S1-S3).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: Every live node except `Stop` appears in exactly one block.
    pub s1_every_node_once: bool,
    /// S2: Every input's block dominates its user's block (phi and region
    /// inputs: the matching predecessor block).
    pub s2_dominance_legal: bool,
    /// S3: Within a block, non-phi inputs come before their users.
    pub s3_def_before_use: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_every_node_once && self.s2_dominance_legal && self.s3_def_before_use
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_every_node_once", self.s1_every_node_once),
            ("S2_dominance_legal", self.s2_dominance_legal),
            ("S3_def_before_use", self.s3_def_before_use),
        ]
    }
}

/// Verify schedule postconditions.
pub fn verify_schedule(graph: &Graph, schedule: &Schedule) -> ScheduleCert {
    ScheduleCert {
        s1_every_node_once: verify_s1_every_node_once(graph, schedule),
        s2_dominance_legal: verify_s2_dominance_legal(graph, schedule),
        s3_def_before_use: verify_s3_def_before_use(graph, schedule),
    }
}

/// S1: block lists partition the live nodes and agree with `block_of`.
fn verify_s1_every_node_once(graph: &Graph, schedule: &Schedule) -> bool {
    let mut seen = HashSet::new();
    for block in schedule.blocks() {
        for &n in &block.nodes {
            if !seen.insert(n) || schedule.block_of(n) != Some(block.id) {
                return false;
            }
        }
    }
    graph
        .live_nodes()
        .filter(|&n| n != graph.stop())
        .all(|n| seen.contains(&n))
        && seen.len() + 1 == graph.live_count()
}

/// S2: dominance legality of every data and control edge.
fn verify_s2_dominance_legal(graph: &Graph, schedule: &Schedule) -> bool {
    let cfg = &schedule.cfg;
    for block in schedule.blocks() {
        for &n in &block.nodes {
            let merges = matches!(graph.op(n), Op::Phi(_) | Op::Region | Op::Loop);
            for (slot, x) in graph.inputs(n).iter().enumerate() {
                let Some(x) = *x else { continue };
                let Some(def) = schedule.block_of(x) else {
                    return false;
                };
                let at = if merges && slot > 0 {
                    let region = if graph.op(n).is_region() {
                        Some(block.id)
                    } else {
                        graph.input(n, 0).and_then(|r| schedule.block_of(r))
                    };
                    match region.and_then(|r| cfg.block(r).preds.get(slot - 1).copied()) {
                        Some(p) => p,
                        None => return false,
                    }
                } else {
                    block.id
                };
                if !cfg.dominates(def, at) {
                    return false;
                }
            }
        }
    }
    true
}

/// S3: def-before-use inside each block, ignoring phis and block heads.
fn verify_s3_def_before_use(graph: &Graph, schedule: &Schedule) -> bool {
    for block in schedule.blocks() {
        let pos: HashMap<NodeId, usize> =
            block.nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        for (i, &n) in block.nodes.iter().enumerate() {
            if n == block.head || matches!(graph.op(n), Op::Phi(_)) {
                continue;
            }
            for x in graph.inputs(n).iter().flatten() {
                if pos.get(x).is_some_and(|&j| j >= i) {
                    return false;
                }
            }
        }
    }
    true
}

// ── Scheduling ──────────────────────────────────────────────────────────────

pub fn schedule(graph: &mut Graph) -> Result<Schedule, Diagnostic> {
    if let Some(region) = graph.building_region() {
        return Err(Diagnostic::error(
            codes::E0102,
            format!("{} is still building", graph.label(region)),
        )
        .at(region));
    }
    if !graph.is_optimized() || !graph.regions_at_least(RegionState::Optimized) {
        return Err(Diagnostic::error(
            codes::E0104,
            "graph is not at an optimizer fixed point",
        )
        .with_hint("run `optimize` after the last edit and before scheduling"));
    }

    let cfg = Cfg::build(graph)?;
    let mut gcm = Gcm::new(graph, cfg);
    gcm.place_pinned()?;
    let order = gcm.schedule_early()?;
    gcm.schedule_late(&order)?;
    gcm.order_blocks()?;
    let Gcm {
        cfg, placement, ..
    } = gcm;

    graph.advance_regions(RegionState::Optimized, RegionState::Scheduled);
    debug!(
        "gcm: {} blocks, {} nodes placed",
        cfg.len(),
        placement.len()
    );
    Ok(Schedule { cfg, placement })
}

struct Gcm<'g> {
    graph: &'g Graph,
    cfg: Cfg,
    placement: HashMap<NodeId, BlockId>,
    floating: Vec<NodeId>,
    early: HashMap<NodeId, BlockId>,
}

impl<'g> Gcm<'g> {
    fn new(graph: &'g Graph, cfg: Cfg) -> Self {
        Gcm {
            graph,
            cfg,
            placement: HashMap::new(),
            floating: Vec::new(),
            early: HashMap::new(),
        }
    }

    /// Block a pinned node belongs to, or `None` for floating nodes.
    fn pinned_block(&self, n: NodeId) -> Result<Option<BlockId>, Diagnostic> {
        let g = self.graph;
        let op = g.op(n);
        let anchor = match op {
            Op::Stop => return Ok(None),
            _ if op.is_cfg() => Some(n),
            Op::Phi(_) => g.input(n, 0),
            Op::Proj(_) => {
                let parent = g.input(n, 0);
                match parent.map(|p| g.op(p)) {
                    Some(Op::Start(_)) => parent,
                    Some(Op::New(_) | Op::Call(..)) => parent.and_then(|p| g.input(p, 0)),
                    _ => None,
                }
            }
            _ if op.is_memory() => g.input(n, 0),
            _ => return Ok(None),
        };
        let Some(anchor) = anchor else {
            return Ok(None);
        };
        match self.cfg.ctrl_block(anchor) {
            Some(b) => Ok(Some(b)),
            None => Err(Diagnostic::error(
                codes::E0303,
                format!("{} is controlled by unreachable {}", g.label(n), anchor),
            )
            .at(n)),
        }
    }

    fn place_pinned(&mut self) -> Result<(), Diagnostic> {
        let live: Vec<NodeId> = self.graph.live_nodes().collect();
        for n in live {
            if n == self.graph.stop() {
                continue;
            }
            match self.pinned_block(n)? {
                Some(b) => {
                    self.placement.insert(n, b);
                }
                None => self.floating.push(n),
            }
        }
        Ok(())
    }

    /// Kahn order over floating-to-floating edges; each node lands in the
    /// deepest block among its inputs.
    fn schedule_early(&mut self) -> Result<Vec<NodeId>, Diagnostic> {
        let g = self.graph;
        let floating: HashSet<NodeId> = self.floating.iter().copied().collect();
        let mut indeg: HashMap<NodeId, usize> = HashMap::new();
        for &n in &self.floating {
            let k = g
                .inputs(n)
                .iter()
                .flatten()
                .filter(|x| floating.contains(x))
                .count();
            indeg.insert(n, k);
        }
        let mut ready: BinaryHeap<Reverse<NodeId>> = indeg
            .iter()
            .filter(|(_, &k)| k == 0)
            .map(|(&n, _)| Reverse(n))
            .collect();
        let mut order = Vec::with_capacity(self.floating.len());
        while let Some(Reverse(n)) = ready.pop() {
            let mut best = self.cfg.entry();
            for x in g.inputs(n).iter().flatten() {
                let b = match self.placement.get(x) {
                    Some(&b) => b,
                    None => self.early.get(x).copied().unwrap_or(best),
                };
                if self.cfg.depth(b) > self.cfg.depth(best) {
                    best = b;
                }
            }
            self.early.insert(n, best);
            order.push(n);
            let mut users: Vec<NodeId> = g.uses(n).to_vec();
            users.sort();
            for u in users {
                if let Some(k) = indeg.get_mut(&u) {
                    *k -= 1;
                    if *k == 0 {
                        ready.push(Reverse(u));
                    }
                }
            }
        }
        if order.len() < self.floating.len() {
            let stuck = self
                .floating
                .iter()
                .copied()
                .filter(|n| !self.early.contains_key(n))
                .min()
                .unwrap_or(g.stop());
            return Err(Diagnostic::error(
                codes::E0300,
                format!("cycle among floating nodes through {}", g.label(stuck)),
            )
            .at(stuck));
        }
        Ok(order)
    }

    /// Block a use of `def` by `user` (through `slot`) demands.
    fn use_block(&self, user: NodeId, slot: usize) -> Option<BlockId> {
        let g = self.graph;
        if let Op::Phi(_) = g.op(user) {
            let region = g.input(user, 0)?;
            let rb = self.cfg.ctrl_block(region)?;
            return self.cfg.block(rb).preds.get(slot.checked_sub(1)?).copied();
        }
        self.placement.get(&user).copied()
    }

    fn schedule_late(&mut self, order: &[NodeId]) -> Result<(), Diagnostic> {
        let g = self.graph;
        for &n in order.iter().rev() {
            let mut lca: Option<BlockId> = None;
            let mut users: Vec<NodeId> = g.uses(n).to_vec();
            users.sort();
            users.dedup();
            for u in users {
                for (slot, x) in g.inputs(u).iter().enumerate() {
                    if *x != Some(n) {
                        continue;
                    }
                    if let Some(b) = self.use_block(u, slot) {
                        lca = Some(match lca {
                            None => b,
                            Some(l) => self.cfg.lca(l, b),
                        });
                    }
                }
            }
            let early = self.early[&n];
            let late = lca.unwrap_or(early);
            if !self.cfg.dominates(early, late) {
                return Err(Diagnostic::error(
                    codes::E0301,
                    format!(
                        "early block {} of {} does not dominate late block {}",
                        early,
                        g.label(n),
                        late
                    ),
                )
                .at(n));
            }
            // Shallowest loop nest between the bounds; ties keep the later block.
            let mut best = late;
            let mut b = late;
            while b != early {
                b = self.cfg.idom(b);
                if self.cfg.loop_depth(b) < self.cfg.loop_depth(best) {
                    best = b;
                }
            }
            self.placement.insert(n, best);
        }
        Ok(())
    }

    /// Head, phis, a Kahn order of the rest, then the terminator.
    fn order_blocks(&mut self) -> Result<(), Diagnostic> {
        let g = self.graph;
        let mut members: Vec<Vec<NodeId>> = vec![Vec::new(); self.cfg.len()];
        let mut placed: Vec<(NodeId, BlockId)> =
            self.placement.iter().map(|(&n, &b)| (n, b)).collect();
        placed.sort();
        for (n, b) in placed {
            members[b.index()].push(n);
        }

        for (bi, nodes) in members.into_iter().enumerate() {
            let block = self.cfg.block(BlockId(bi as u32));
            let head = block.head;
            let term = block.terminator();
            let mut list = vec![head];
            let mut phis: Vec<NodeId> = nodes
                .iter()
                .copied()
                .filter(|&n| matches!(g.op(n), Op::Phi(_)))
                .collect();
            phis.sort();
            list.extend(&phis);
            let rest: Vec<NodeId> = nodes
                .iter()
                .copied()
                .filter(|&n| n != head && Some(n) != term && !matches!(g.op(n), Op::Phi(_)))
                .collect();
            list.extend(local_order(g, &rest)?);
            if let Some(t) = term {
                list.push(t);
            }
            self.cfg.block_mut(BlockId(bi as u32)).nodes = list;
        }
        Ok(())
    }
}

/// Topological order of one block's body with load-before-store
/// anti-dependences; ties go to the lowest node id.
fn local_order(g: &Graph, nodes: &[NodeId]) -> Result<Vec<NodeId>, Diagnostic> {
    let set: HashSet<NodeId> = nodes.iter().copied().collect();
    let mut succs: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut indeg: HashMap<NodeId, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut edge = |from: NodeId, to: NodeId, succs: &mut HashMap<NodeId, Vec<NodeId>>| {
        succs.entry(from).or_default().push(to);
        if let Some(k) = indeg.get_mut(&to) {
            *k += 1;
        }
    };
    for &n in nodes {
        for x in g.inputs(n).iter().flatten() {
            if set.contains(x) && *x != n {
                edge(*x, n, &mut succs);
            }
        }
    }
    for &load in nodes {
        if !matches!(g.op(load), Op::Load(_)) {
            continue;
        }
        let Some(mem) = g.input(load, 1) else { continue };
        for &writer in g.uses(mem) {
            let writes = matches!(g.op(writer), Op::Store(_) | Op::New(_) | Op::Call(..));
            if writes && writer != load && set.contains(&writer) && g.input(writer, 1) == Some(mem) {
                edge(load, writer, &mut succs);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<NodeId>> = indeg
        .iter()
        .filter(|(_, &k)| k == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();
    let mut out = Vec::with_capacity(nodes.len());
    while let Some(Reverse(n)) = ready.pop() {
        out.push(n);
        for s in succs.get(&n).into_iter().flatten() {
            if let Some(k) = indeg.get_mut(s) {
                *k -= 1;
                if *k == 0 {
                    ready.push(Reverse(*s));
                }
            }
        }
    }
    if out.len() < nodes.len() {
        let stuck = nodes
            .iter()
            .copied()
            .filter(|n| !out.contains(n))
            .min()
            .unwrap_or(g.stop());
        return Err(Diagnostic::error(
            codes::E0302,
            format!("local ordering cycle through {}", g.label(stuck)),
        )
        .at(stuck));
    }
    Ok(out)
}

// ── Display ─────────────────────────────────────────────────────────────────

/// Printable view of a schedule; borrows the graph for labels.
pub struct ScheduleDisplay<'a> {
    pub graph: &'a Graph,
    pub schedule: &'a Schedule,
}

impl fmt::Display for ScheduleDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = &self.schedule.cfg;
        for block in &cfg.blocks {
            let preds: Vec<String> = block.preds.iter().map(|p| p.to_string()).collect();
            writeln!(
                f,
                "{}: idom={} depth={} loop={} preds=[{}]",
                block.id,
                block.idom,
                block.depth,
                block.loop_depth,
                preds.join(", ")
            )?;
            for &n in &block.nodes {
                writeln!(
                    f,
                    "  {:>5} = {} : {}",
                    n.to_string(),
                    self.graph.label(n),
                    self.graph.types.display(self.graph.ty(n))
                )?;
            }
            match block.exit {
                Exit::Branch { then, els, .. } => writeln!(f, "  -> {}, {}", then, els)?,
                Exit::Jump { to, slot } => writeln!(f, "  -> {} (slot {})", to, slot)?,
                Exit::Return(_) => writeln!(f, "  -> ret")?,
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::graph::{Module, RetType};
    use crate::id::TypeId;
    use crate::optimize::optimize;
    use crate::pass::StageCert;
    use crate::types::Nil;

    fn finish_and_optimize(b: FunctionBuilder) -> Graph {
        let mut f = b.finish().unwrap();
        optimize(&mut f.graph).unwrap();
        f.graph
    }

    fn int_fn(m: &mut Module) -> FunctionBuilder {
        let mut b = FunctionBuilder::new(m, "f");
        b.start(
            &[("a", TypeId::INT_BOT), ("n", TypeId::INT_BOT)],
            RetType::Scalar(TypeId::INT_BOT),
        )
        .unwrap();
        b
    }

    #[test]
    fn unoptimized_graph_is_rejected() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m);
        let a = b.get("a").unwrap();
        b.ret(Some(a)).unwrap();
        let mut f = b.finish().unwrap();
        let err = schedule(&mut f.graph).unwrap_err();
        assert_eq!(err.code, Some(codes::E0104));
    }

    #[test]
    fn loop_invariant_is_hoisted() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m);
        let zero = b.con(0);
        b.define("s", zero).unwrap();
        let n = b.get("n").unwrap();
        let mut inv = None;
        b.for_range("i", zero, n, |b| {
            let a = b.get("a")?;
            let three = b.con(3);
            let t = b.mul(a, three)?;
            inv = Some(t);
            let s = b.get("s")?;
            let s = b.add(s, t)?;
            b.set("s", s)
        })
        .unwrap();
        let s = b.get("s").unwrap();
        b.ret(Some(s)).unwrap();
        let mut g = finish_and_optimize(b);
        let sched = schedule(&mut g).unwrap();
        let inv = inv.unwrap();
        let home = sched.block_of(inv).unwrap();
        assert_eq!(sched.cfg.loop_depth(home), 0, "{} stays in the loop", g.label(inv));
        assert!(verify_schedule(&g, &sched).all_pass());
        assert!(g.regions_at_least(RegionState::Scheduled));
    }

    #[test]
    fn branch_only_value_sinks_into_branch() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m);
        let a = b.get("a").unwrap();
        let n = b.get("n").unwrap();
        let prod = b.mul(a, n).unwrap();
        let c = b.lt(a, n).unwrap();
        b.if_then(c, |b| b.ret(Some(prod))).unwrap();
        let zero = b.con(0);
        b.ret(Some(zero)).unwrap();
        let mut g = finish_and_optimize(b);
        let sched = schedule(&mut g).unwrap();
        let home = sched.block_of(prod).unwrap();
        assert_ne!(home, sched.cfg.entry());
        assert!(matches!(sched.cfg.block(home).exit, Exit::Return(_)));
        assert!(verify_schedule(&g, &sched).all_pass());
    }

    #[test]
    fn load_precedes_store_to_same_memory() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "f");
        let person = b.types().struct_type("Person", &[("age", TypeId::INT_BOT)]);
        let pp = b.types().ptr(person, Nil::NotNil);
        b.start(&[("p", pp)], RetType::Scalar(TypeId::INT_BOT)).unwrap();
        let p = b.get("p").unwrap();
        let old = b.load_field(p, "age").unwrap();
        let five = b.con(5);
        b.store_field(p, "age", five).unwrap();
        b.ret(Some(old)).unwrap();
        let mut g = finish_and_optimize(b);
        let sched = schedule(&mut g).unwrap();
        let entry = &sched.cfg.block(sched.cfg.entry()).nodes;
        let pos = |op: fn(Op) -> bool| entry.iter().position(|&n| op(g.op(n))).unwrap();
        assert!(pos(|o| matches!(o, Op::Load(_))) < pos(|o| matches!(o, Op::Store(_))));
        assert!(verify_schedule(&g, &sched).all_pass());
    }

    #[test]
    fn display_lists_blocks() {
        let mut m = Module::new();
        let mut b = int_fn(&mut m);
        let a = b.get("a").unwrap();
        b.ret(Some(a)).unwrap();
        let mut g = finish_and_optimize(b);
        let sched = schedule(&mut g).unwrap();
        let text = ScheduleDisplay {
            graph: &g,
            schedule: &sched,
        }
        .to_string();
        assert!(text.starts_with("b0: idom=b0 depth=0 loop=0 preds=[]"));
        assert!(text.contains("Return("));
        assert!(text.trim_end().ends_with("-> ret"));
    }
}
