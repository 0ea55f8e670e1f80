// optimize.rs — Worklist-driven peephole fixed point
//
// Seeds the worklist with every live node, applies `iterate` until no rule
// fires, then sweeps nodes `Stop` can no longer reach and advances every
// region to `Optimized`.
//
// Preconditions: every region is sealed; no construction scope is alive.
// Postconditions: no peephole rule applies to any live node; every live
//                 node is reachable from `Stop`.
// Failure modes: building region → `E0102`; iteration budget exceeded →
//                `E0105`.
// Side effects: rewrites the graph in place.

use tracing::debug;

use crate::diag::{codes, Diagnostic};
use crate::graph::Graph;
use crate::node::{Op, RegionState};

/// Visits allowed per arena slot before the fixed point is declared lost.
const VISITS_PER_NODE: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub visits: usize,
    pub replaced: usize,
    pub swept: usize,
    pub live: usize,
}

pub fn optimize(graph: &mut Graph) -> Result<OptimizeStats, Diagnostic> {
    if let Some(region) = graph.building_region() {
        return Err(Diagnostic::error(
            codes::E0102,
            format!("{} is still building", graph.label(region)),
        )
        .at(region)
        .with_hint("seal every region before optimizing"));
    }
    if let Some(scope) = graph.live_nodes().find(|&n| graph.op(n) == Op::Scope) {
        return Err(Diagnostic::error(
            codes::E0102,
            "construction scope still alive; finish the function first",
        )
        .at(scope));
    }

    let mut stats = OptimizeStats::default();
    graph.work.clear();
    let live: Vec<_> = graph.live_nodes().collect();
    for n in live {
        graph.work.push(n);
    }

    let budget = 1000 + VISITS_PER_NODE * graph.len();
    while let Some(n) = graph.work.pop() {
        if graph.is_dead(n) {
            continue;
        }
        stats.visits += 1;
        if stats.visits > budget {
            return Err(Diagnostic::error(
                codes::E0105,
                format!("peephole worklist did not converge after {} visits", budget),
            )
            .at(n)
            .with_related(n, graph.label(n)));
        }
        if let Some(x) = graph.iterate(n) {
            if x != n {
                stats.replaced += 1;
            }
        }
        if !graph.is_dead(n) && graph.is_unused(n) {
            graph.kill(n);
        }
    }

    stats.swept = graph.sweep_unreachable();
    graph.advance_regions(RegionState::Sealed, RegionState::Optimized);
    stats.live = graph.live_count();
    graph.optimized = true;
    debug!(
        "optimize: {} visits, {} replaced, {} swept, {} live",
        stats.visits, stats.replaced, stats.swept, stats.live
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TypeId;

    #[test]
    fn building_region_is_rejected() {
        let mut g = Graph::new();
        let t = g.types.tuple(vec![TypeId::CTRL, TypeId::MEM]);
        let start = g.create(Op::Start(t), &[]).unwrap();
        let ctrl = g.create(Op::CProj(0), &[Some(start)]).unwrap();
        let r = g.create(Op::Region, &[None, Some(ctrl), Some(ctrl)]).unwrap();
        g.add_input(g.stop(), Some(r));
        let err = optimize(&mut g).unwrap_err();
        assert_eq!(err.code, Some(codes::E0102));
    }

    #[test]
    fn unreachable_nodes_are_swept() {
        let mut g = Graph::new();
        let t = g.types.tuple(vec![TypeId::CTRL, TypeId::MEM, TypeId::INT_BOT]);
        let start = g.create(Op::Start(t), &[]).unwrap();
        let ctrl = g.create(Op::CProj(0), &[Some(start)]).unwrap();
        let mem = g.create(Op::Proj(1), &[Some(start)]).unwrap();
        let x = g.create(Op::Proj(2), &[Some(start)]).unwrap();
        let orphan = g.con_int(99);
        let ret = g.create(Op::Return, &[Some(ctrl), Some(mem), Some(x)]).unwrap();
        g.add_input(g.stop(), Some(ret));
        let stats = optimize(&mut g).unwrap();
        assert!(g.is_dead(orphan));
        assert!(stats.swept >= 1);
        assert!(!g.is_dead(ret));
        assert!(g.is_optimized());
    }
}
