// dot.rs — Graphviz DOT output for Sea-of-Nodes function graphs
//
// Renders every live node of every function of a module as a DOT node,
// one cluster per function, with edges drawn from definition to use.
// Control edges are bold, memory edges dashed, data edges plain.
//
// Preconditions: functions are finished (no construction scope alive).
// Postconditions: returns a DOT string; output is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt;

use crate::graph::{Function, Graph, Module};
use crate::id::{NodeId, TypeId};
use crate::node::Op;

/// Emit every defined function of `module` as one DOT digraph.
pub fn emit_dot(module: &Module) -> String {
    DotDisplay { module }.to_string()
}

struct DotDisplay<'a> {
    module: &'a Module,
}

impl fmt::Display for DotDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph snc {{")?;
        writeln!(f, "    rankdir=BT;")?;
        writeln!(f, "    node [fontname=\"Helvetica\", fontsize=10];")?;
        writeln!(f, "    edge [fontname=\"Helvetica\", fontsize=9];")?;
        for func in self.module.functions() {
            writeln!(f)?;
            write_function(f, func)?;
        }
        writeln!(f, "}}")
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `<func>_n<id>`, unique across the whole digraph.
fn dot_node_id(func: &str, node: NodeId) -> String {
    format!("{func}_n{}", node.0)
}

fn node_attrs(g: &Graph, n: NodeId) -> String {
    let op = g.op(n);
    let (shape, color) = match op {
        Op::Start(_) | Op::Stop | Op::Return => ("box", "gold"),
        _ if op.is_region() => ("box", "yellow"),
        _ if op.is_cfg() => ("box", "lightyellow"),
        Op::Phi(_) => ("diamond", "lightcyan"),
        Op::Constant(_) => ("plaintext", "white"),
        _ if op.is_memory() => ("cylinder", "lightsalmon"),
        Op::Proj(_) => ("ellipse", "gray90"),
        _ => ("ellipse", "lightblue"),
    };
    let label = match op {
        Op::Constant(t) => escape(&g.types.display(t).to_string()),
        _ => format!(
            "{}\\n{}",
            op,
            escape(&g.types.display(g.ty(n)).to_string())
        ),
    };
    format!("shape={shape}, style=filled, fillcolor={color}, label=\"{n}: {label}\"")
}

fn edge_attrs(g: &Graph, def: NodeId) -> Vec<&'static str> {
    let ty = g.ty(def);
    if g.op(def).is_cfg() || ty == TypeId::CTRL {
        vec!["color=red", "penwidth=2"]
    } else if ty == TypeId::MEM {
        vec!["color=blue", "style=dashed"]
    } else {
        Vec::new()
    }
}

fn write_function(f: &mut fmt::Formatter<'_>, func: &Function) -> fmt::Result {
    let name = sanitize(&func.name);
    let g = &func.graph;
    writeln!(f, "    subgraph cluster_{name} {{")?;
    writeln!(f, "        label=\"fn {}\";", escape(&func.name))?;
    writeln!(f, "        style=rounded;")?;
    writeln!(f, "        color=gray50;")?;

    let mut live: Vec<NodeId> = g.live_nodes().collect();
    live.sort();
    for &n in &live {
        writeln!(f, "        {} [{}];", dot_node_id(&name, n), node_attrs(g, n))?;
    }
    for &n in &live {
        for (slot, input) in g.inputs(n).iter().enumerate() {
            let Some(def) = *input else { continue };
            if g.is_dead(def) {
                continue;
            }
            let mut attrs: Vec<String> = edge_attrs(g, def).into_iter().map(String::from).collect();
            // Phi and region slots are positional.
            if g.op(n).is_region() || matches!(g.op(n), Op::Phi(_)) {
                attrs.push(format!("taillabel=\"{}\"", slot));
            }
            let attrs = if attrs.is_empty() {
                String::new()
            } else {
                format!(" [{}]", attrs.join(", "))
            };
            writeln!(
                f,
                "        {} -> {}{};",
                dot_node_id(&name, def),
                dot_node_id(&name, n),
                attrs
            )?;
        }
    }
    writeln!(f, "    }}")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::graph::RetType;

    fn abs_module() -> Module {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new(&mut m, "abs");
        b.start(&[("x", TypeId::INT_BOT)], RetType::Scalar(TypeId::INT_BOT))
            .unwrap();
        let x = b.get("x").unwrap();
        let zero = b.con(0);
        let neg = b.lt(x, zero).unwrap();
        b.if_then(neg, |b| {
            let x = b.get("x")?;
            let y = b.neg(x)?;
            b.set("x", y)
        })
        .unwrap();
        let x = b.get("x").unwrap();
        b.ret(Some(x)).unwrap();
        m.define(b.finish().unwrap()).unwrap();
        m
    }

    #[test]
    fn valid_dot_structure() {
        let dot = emit_dot(&abs_module());
        assert!(dot.starts_with("digraph snc {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains("subgraph cluster_abs {"));
        assert!(dot.contains("label=\"fn abs\""));
    }

    #[test]
    fn node_shapes_present() {
        let dot = emit_dot(&abs_module());
        assert!(dot.contains("shape=box"));
        assert!(dot.contains("shape=diamond"), "merge point should carry a phi");
        assert!(dot.contains("color=red"), "control edges are highlighted");
    }

    #[test]
    fn every_edge_endpoint_is_declared() {
        let dot = emit_dot(&abs_module());
        let declared: Vec<&str> = dot
            .lines()
            .filter(|l| l.contains(" [shape="))
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        for line in dot.lines().filter(|l| l.contains(" -> ")) {
            let mut parts = line.split_whitespace();
            let from = parts.next().unwrap();
            parts.next();
            let to = parts.next().unwrap().trim_end_matches(';');
            assert!(declared.contains(&from), "undeclared {from}");
            assert!(declared.contains(&to), "undeclared {to}");
        }
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_dot(&abs_module()), emit_dot(&abs_module()));
    }
}
