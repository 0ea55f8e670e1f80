// cfg.rs — Basic blocks, dominators and loop nesting over the control skeleton
//
// Splits the control nodes of an optimized graph into basic blocks: one per
// `Start`, `Region`, `Loop` and `If` projection. Blocks are numbered in
// reverse postorder, so a block's immediate dominator always has a smaller
// id.
//
// Preconditions: the graph has a live `Start`; every control path ends in
//                `Return`, `If` or a region predecessor slot.
// Postconditions: `blocks[0]` is the entry; `idom`, `depth` and
//                 `loop_depth` are populated for every block.
// Failure modes: missing start or dangling control → `E0303`.
// Side effects: none.

use std::collections::HashMap;

use crate::diag::{codes, Diagnostic};
use crate::graph::Graph;
use crate::id::{BlockId, IdAllocator, NodeId};
use crate::node::Op;

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `If` node; successors are the true and false projections' blocks.
    Branch {
        iff: NodeId,
        then: BlockId,
        els: BlockId,
    },
    /// Fall into a region through predecessor slot `slot` (1-based).
    Jump { to: BlockId, slot: usize },
    Return(NodeId),
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub head: NodeId,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub exit: Exit,
    /// Immediate dominator; the entry block names itself.
    pub idom: BlockId,
    pub depth: u32,
    pub loop_depth: u32,
    /// Scheduled nodes in execution order, filled by GCM.
    pub nodes: Vec<NodeId>,
}

impl Block {
    /// Terminator node (`If` or `Return`), if the block has one.
    pub fn terminator(&self) -> Option<NodeId> {
        match self.exit {
            Exit::Branch { iff, .. } => Some(iff),
            Exit::Return(r) => Some(r),
            Exit::Jump { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    /// Block of every control node.
    ctrl_block: HashMap<NodeId, BlockId>,
}

// ── Discovery ──

struct Proto {
    head: NodeId,
    exit: Option<ProtoExit>,
}

#[derive(Clone, Copy)]
enum ProtoExit {
    Branch(NodeId),
    Jump(NodeId, usize),
    Return(NodeId),
}

fn dangling(graph: &Graph, n: NodeId) -> Diagnostic {
    Diagnostic::error(
        codes::E0303,
        format!("control leaving {} reaches no successor", graph.label(n)),
    )
    .at(n)
}

impl Cfg {
    pub fn build(graph: &Graph) -> Result<Cfg, Diagnostic> {
        let start = graph.start().ok_or_else(|| {
            Diagnostic::error(codes::E0303, "graph has no live Start node")
        })?;

        // Walk control forward from Start, opening a block at every head.
        let mut protos: Vec<Proto> = vec![Proto {
            head: start,
            exit: None,
        }];
        let mut of: HashMap<NodeId, usize> = HashMap::new();
        of.insert(start, 0);
        let mut stack = vec![start];
        while let Some(c) = stack.pop() {
            let b = of[&c];
            let mut users: Vec<NodeId> = graph
                .uses(c)
                .iter()
                .copied()
                .filter(|&u| graph.op(u).is_cfg() && graph.op(u) != Op::Stop)
                .collect();
            users.sort();
            users.dedup();
            for u in users {
                match graph.op(u) {
                    Op::Region | Op::Loop => {
                        let slot = graph
                            .inputs(u)
                            .iter()
                            .position(|x| *x == Some(c))
                            .unwrap_or(1);
                        protos[b].exit = Some(ProtoExit::Jump(u, slot));
                        if !of.contains_key(&u) {
                            of.insert(u, protos.len());
                            protos.push(Proto { head: u, exit: None });
                            stack.push(u);
                        }
                    }
                    Op::CProj(_) if graph.op(c) == Op::If => {
                        if !of.contains_key(&u) {
                            of.insert(u, protos.len());
                            protos.push(Proto { head: u, exit: None });
                            stack.push(u);
                        }
                    }
                    Op::CProj(_) => {
                        of.insert(u, b);
                        stack.push(u);
                    }
                    Op::If => {
                        protos[b].exit = Some(ProtoExit::Branch(u));
                        of.insert(u, b);
                        stack.push(u);
                    }
                    Op::Return => {
                        protos[b].exit = Some(ProtoExit::Return(u));
                        of.insert(u, b);
                    }
                    _ => {}
                }
            }
        }

        let mut exits = Vec::with_capacity(protos.len());
        for p in &protos {
            exits.push(p.exit.ok_or_else(|| dangling(graph, p.head))?);
        }

        // Successor lists in discovery numbering.
        let proj_block = |iff: NodeId, idx: u32| -> Option<usize> {
            graph
                .uses(iff)
                .iter()
                .find(|&&u| graph.op(u) == Op::CProj(idx))
                .and_then(|u| of.get(u).copied())
        };
        let mut succs: Vec<Vec<usize>> = Vec::with_capacity(protos.len());
        for exit in &exits {
            let s = match *exit {
                ProtoExit::Branch(iff) => match (proj_block(iff, 0), proj_block(iff, 1)) {
                    (Some(t), Some(f)) => vec![t, f],
                    _ => return Err(dangling(graph, iff)),
                },
                ProtoExit::Jump(r, _) => vec![of[&r]],
                ProtoExit::Return(_) => Vec::new(),
            };
            succs.push(s);
        }

        // Reverse postorder, iteratively.
        let mut post = Vec::with_capacity(protos.len());
        let mut seen = vec![false; protos.len()];
        let mut walk: Vec<(usize, usize)> = vec![(0, 0)];
        seen[0] = true;
        while let Some(top) = walk.last_mut() {
            let (b, next) = *top;
            if let Some(&s) = succs[b].get(next) {
                top.1 += 1;
                if !seen[s] {
                    seen[s] = true;
                    walk.push((s, 0));
                }
            } else {
                post.push(b);
                walk.pop();
            }
        }
        post.reverse();
        let mut ids = IdAllocator::new();
        let mut rename = vec![BlockId(0); protos.len()];
        for &b in &post {
            rename[b] = ids.alloc_block();
        }

        let mut blocks: Vec<Block> = post
            .iter()
            .map(|&b| {
                let exit = match exits[b] {
                    ProtoExit::Branch(iff) => Exit::Branch {
                        iff,
                        then: rename[succs[b][0]],
                        els: rename[succs[b][1]],
                    },
                    ProtoExit::Jump(r, slot) => Exit::Jump {
                        to: rename[of[&r]],
                        slot,
                    },
                    ProtoExit::Return(r) => Exit::Return(r),
                };
                Block {
                    id: rename[b],
                    head: protos[b].head,
                    preds: Vec::new(),
                    succs: succs[b].iter().map(|&s| rename[s]).collect(),
                    exit,
                    idom: BlockId(0),
                    depth: 0,
                    loop_depth: 0,
                    nodes: Vec::new(),
                }
            })
            .collect();

        // Predecessors follow region slot order so phi inputs line up.
        let ctrl_block: HashMap<NodeId, BlockId> =
            of.iter().map(|(&n, &b)| (n, rename[b])).collect();
        for block in blocks.iter_mut() {
            let head = block.head;
            block.preds = match graph.op(head) {
                Op::Region | Op::Loop => {
                    let mut preds = Vec::new();
                    for x in graph.inputs(head).iter().skip(1) {
                        let p = x
                            .and_then(|x| ctrl_block.get(&x).copied())
                            .ok_or_else(|| dangling(graph, head))?;
                        preds.push(p);
                    }
                    preds
                }
                Op::CProj(_) => graph
                    .input(head, 0)
                    .and_then(|iff| ctrl_block.get(&iff).copied())
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            };
        }

        let mut cfg = Cfg { blocks, ctrl_block };
        cfg.compute_dominators();
        cfg.compute_loop_depths(graph);
        Ok(cfg)
    }

    // ── Dominators ──

    /// Cooper–Harvey–Kennedy over reverse-postorder ids.
    fn compute_dominators(&mut self) {
        let n = self.blocks.len();
        let mut idom: Vec<Option<usize>> = vec![None; n];
        idom[0] = Some(0);
        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..n {
                let mut new_idom: Option<usize> = None;
                for p in &self.blocks[b].preds {
                    let p = p.index();
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }
        for b in 0..n {
            let d = idom[b].unwrap_or(0);
            self.blocks[b].idom = BlockId(d as u32);
            self.blocks[b].depth = if b == 0 { 0 } else { self.blocks[d].depth + 1 };
        }
    }

    /// Natural loop of every `Loop` head's back edge.
    fn compute_loop_depths(&mut self, graph: &Graph) {
        for h in 0..self.blocks.len() {
            if graph.op(self.blocks[h].head) != Op::Loop || self.blocks[h].preds.len() < 2 {
                continue;
            }
            let latch = self.blocks[h].preds[1].index();
            let mut body = vec![false; self.blocks.len()];
            body[h] = true;
            let mut stack = vec![latch];
            while let Some(b) = stack.pop() {
                if body[b] {
                    continue;
                }
                body[b] = true;
                stack.extend(self.blocks[b].preds.iter().map(|p| p.index()));
            }
            for (b, inside) in body.into_iter().enumerate() {
                if inside {
                    self.blocks[b].loop_depth += 1;
                }
            }
        }
    }

    // ── Queries ──

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.index()]
    }

    pub(crate) fn block_mut(&mut self, b: BlockId) -> &mut Block {
        &mut self.blocks[b.index()]
    }

    /// Block holding a control node.
    pub fn ctrl_block(&self, n: NodeId) -> Option<BlockId> {
        self.ctrl_block.get(&n).copied()
    }

    pub fn idom(&self, b: BlockId) -> BlockId {
        self.blocks[b.index()].idom
    }

    pub fn depth(&self, b: BlockId) -> u32 {
        self.blocks[b.index()].depth
    }

    pub fn loop_depth(&self, b: BlockId) -> u32 {
        self.blocks[b.index()].loop_depth
    }

    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        while self.depth(b) > self.depth(a) {
            b = self.idom(b);
        }
        a == b
    }

    /// Lowest common ancestor in the dominator tree.
    pub fn lca(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            if self.depth(a) >= self.depth(b) {
                a = self.idom(a);
            } else {
                b = self.idom(b);
            }
        }
        a
    }
}

fn intersect(idom: &[Option<usize>], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a].unwrap_or(0);
        }
        while b > a {
            b = idom[b].unwrap_or(0);
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::graph::{Module, RetType};
    use crate::id::TypeId;
    use crate::optimize::optimize;

    fn build(body: impl FnOnce(&mut FunctionBuilder)) -> Graph {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "f");
        b.start(&[("a", TypeId::INT_BOT), ("n", TypeId::INT_BOT)], RetType::Scalar(TypeId::INT_BOT))
            .unwrap();
        body(&mut b);
        let mut f = b.finish().unwrap();
        optimize(&mut f.graph).unwrap();
        f.graph
    }

    #[test]
    fn straight_line_is_one_block() {
        let g = build(|b| {
            let a = b.get("a").unwrap();
            b.ret(Some(a)).unwrap();
        });
        let cfg = Cfg::build(&g).unwrap();
        assert_eq!(cfg.len(), 1);
        assert!(matches!(cfg.block(cfg.entry()).exit, Exit::Return(_)));
    }

    #[test]
    fn diamond_dominators() {
        let g = build(|b| {
            let a = b.get("a").unwrap();
            let n = b.get("n").unwrap();
            let c = b.lt(a, n).unwrap();
            b.define("r", a).unwrap();
            b.if_else(c, |b| b.set("r", n), |b| {
                let z = b.con(7);
                b.set("r", z)
            })
            .unwrap();
            let r = b.get("r").unwrap();
            b.ret(Some(r)).unwrap();
        });
        let cfg = Cfg::build(&g).unwrap();
        assert_eq!(cfg.len(), 4);
        let merge = cfg
            .blocks
            .iter()
            .find(|b| g.op(b.head) == Op::Region)
            .unwrap();
        assert_eq!(merge.preds.len(), 2);
        assert_eq!(merge.idom, cfg.entry());
        for b in &cfg.blocks {
            assert!(cfg.dominates(cfg.entry(), b.id));
            assert!(b.idom.index() <= b.id.index());
        }
        assert!(!cfg.dominates(merge.preds[0], merge.id));
        assert_eq!(cfg.lca(merge.preds[0], merge.preds[1]), cfg.entry());
    }

    #[test]
    fn loop_body_is_one_level_deeper() {
        let g = build(|b| {
            let zero = b.con(0);
            b.define("s", zero).unwrap();
            let n = b.get("n").unwrap();
            b.for_range("i", zero, n, |b| {
                let s = b.get("s")?;
                let i = b.get("i")?;
                let s = b.add(s, i)?;
                b.set("s", s)
            })
            .unwrap();
            let s = b.get("s").unwrap();
            b.ret(Some(s)).unwrap();
        });
        let cfg = Cfg::build(&g).unwrap();
        let head = cfg
            .blocks
            .iter()
            .find(|b| g.op(b.head) == Op::Loop)
            .unwrap();
        assert_eq!(head.loop_depth, 1);
        assert_eq!(cfg.loop_depth(cfg.entry()), 0);
        let latch = head.preds[1];
        assert_eq!(cfg.loop_depth(latch), 1);
        assert!(cfg.dominates(head.id, latch));
        let exit = cfg
            .blocks
            .iter()
            .find(|b| matches!(b.exit, Exit::Return(_)))
            .unwrap();
        assert_eq!(exit.loop_depth, 0);
    }
}
