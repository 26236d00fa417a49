//! Renderer seam: turns a final atom graph into source text.
//!
//! Per-language emitters live outside this crate and implement [`Renderer`].
//! [`OutlineRenderer`] is the language-neutral reference: indented
//! pseudo-code in the seed template's own notation.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::catalog::AtomOp;
use crate::field::FieldArchitecture;
use crate::graph::{AtomGraph, AtomNode, EdgeKind, NodeId};

pub trait Renderer {
    /// Target the output is written for, e.g. `"outline"` or `"python"`.
    fn target(&self) -> &str;

    fn render(&self, graph: &AtomGraph, architecture: &FieldArchitecture) -> String;
}

/// Indented pseudo-code. OPAQUE atoms print their verbatim source.
#[derive(Clone, Debug)]
pub struct OutlineRenderer {
    pub indent: usize,
    /// Suffix each line with `# <stage name>`.
    pub annotate_stages: bool,
}

impl Default for OutlineRenderer {
    fn default() -> Self {
        Self {
            indent: 4,
            annotate_stages: false,
        }
    }
}

impl Renderer for OutlineRenderer {
    fn target(&self) -> &str {
        "outline"
    }

    fn render(&self, graph: &AtomGraph, architecture: &FieldArchitecture) -> String {
        let mut out = String::new();
        let mut seen = BTreeSet::new();
        let roots: Vec<NodeId> = graph
            .nodes()
            .filter(|n| graph.predecessors(n.id, EdgeKind::Control).is_empty())
            .map(|n| n.id)
            .collect();
        for id in roots {
            self.render_node(graph, architecture, id, 0, &mut seen, &mut out);
        }
        out
    }
}

impl OutlineRenderer {
    fn render_node(
        &self,
        graph: &AtomGraph,
        architecture: &FieldArchitecture,
        id: NodeId,
        depth: usize,
        seen: &mut BTreeSet<NodeId>,
        out: &mut String,
    ) {
        let Some(node) = graph.node(id) else {
            return;
        };
        if !seen.insert(id) {
            return;
        }
        let pad = " ".repeat(self.indent * depth);
        let _ = write!(out, "{pad}{}", statement(node));
        if self.annotate_stages {
            if let Some(stage) = architecture.stage(node.stage) {
                let _ = write!(out, "  # {}", stage.name);
            }
        }
        out.push('\n');

        let body = graph.body(id);
        if body.is_empty() {
            return;
        }
        // Fused loops bind their absorbed loop variables to the shared element.
        if let (Some(aliases), Some(var)) = (node.attr_text("aliases"), node.attr_text("var")) {
            let inner = " ".repeat(self.indent * (depth + 1));
            for alias in aliases.split(',').filter(|a| !a.is_empty()) {
                let _ = writeln!(out, "{inner}{alias} = {var}");
            }
        }
        for child in body {
            self.render_node(graph, architecture, child, depth + 1, seen, out);
        }
    }
}

fn text<'a>(node: &'a AtomNode, key: &str) -> &'a str {
    node.attr_text(key).unwrap_or("?")
}

fn bound(node: &AtomNode, rhs: String) -> String {
    match node.attr_text("binds") {
        Some(name) => format!("{name} = {rhs}"),
        None => rhs,
    }
}

/// One line of pseudo-code for an atom.
fn statement(node: &AtomNode) -> String {
    match node.op {
        AtomOp::IterNext | AtomOp::MapEach | AtomOp::Stream | AtomOp::ParDispatch => {
            let keyword = match node.op {
                AtomOp::IterNext => "for".to_string(),
                AtomOp::MapEach => "map".to_string(),
                AtomOp::Stream => "stream".to_string(),
                _ => match node.attr_int("lanes") {
                    Some(lanes) => format!("parallel[{lanes}]"),
                    None => "parallel".to_string(),
                },
            };
            bound(
                node,
                format!("{keyword} {} in {}:", text(node, "var"), text(node, "collection")),
            )
        }
        AtomOp::Branch => format!("if {}:", text(node, "condition")),
        AtomOp::Const | AtomOp::Load => {
            let value = node
                .attr("value")
                .map_or_else(|| "?".to_string(), |v| v.to_string());
            bound(node, value)
        }
        AtomOp::Arith => bound(
            node,
            format!("{} {} {}", text(node, "lhs"), text(node, "op"), text(node, "rhs")),
        ),
        AtomOp::Call | AtomOp::Transform => bound(
            node,
            format!("{}({})", text(node, "callee"), node.attr_text("args").unwrap_or("")),
        ),
        AtomOp::Emit => {
            let keyword = node.attr_text("keyword").unwrap_or("emit");
            let expr = node.attr_text("expr").unwrap_or("");
            if expr.is_empty() {
                keyword.to_string()
            } else {
                format!("{keyword} {expr}")
            }
        }
        AtomOp::Opaque => node
            .attr_text("source")
            .map_or_else(|| "<opaque>".to_string(), str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::{TaskHint, decompose};
    use crate::energy::EnergyConfig;
    use crate::field::{FieldConfig, build_architecture};
    use crate::rules::{LoopFusion, RuleContext, TransformationRule};
    use crate::catalog::AtomCatalog;

    fn arch() -> FieldArchitecture {
        build_architecture::<&str>(2, &[], &[], &FieldConfig::default()).unwrap()
    }

    #[test]
    fn test_renders_seed_notation() {
        let seed = "items = read(\"in\")\nfor x in items:\n    if x:\n        print(x)\nwhile busy:\n    spin()\nreturn items\n";
        let g = decompose(Some(seed), &TaskHint::new("t"), &arch()).unwrap();
        let text = OutlineRenderer::default().render(&g, &arch());
        assert_eq!(
            text,
            "items = read(\"in\")\nfor x in items:\n    if x:\n        print(x)\nwhile busy:\n    spin()\nreturn items\n"
        );
    }

    #[test]
    fn test_fused_loop_aliases_second_variable() {
        let seed = "for x in items:\n    f(x)\nfor y in items:\n    g(y)\n";
        let a = arch();
        let g = decompose(Some(seed), &TaskHint::new("t"), &a).unwrap();
        let energy = EnergyConfig::default();
        let ctx = RuleContext::new(AtomCatalog::standard(), &energy, 4);
        let fused = LoopFusion.apply(&g, &[NodeId(0), NodeId(2)], &ctx);
        let text = OutlineRenderer::default().render(&fused, &a);
        assert_eq!(text, "for x in items:\n    y = x\n    f(x)\n    g(y)\n");
    }

    #[test]
    fn test_stage_annotation() {
        let a = arch();
        let g = decompose(None, &TaskHint::new("t"), &a).unwrap();
        let r = OutlineRenderer {
            annotate_stages: true,
            ..OutlineRenderer::default()
        };
        let text = r.render(&g, &a);
        assert!(text.starts_with("stage0 = read(stage-0)  # stage-0\n"), "got {text}");
        assert_eq!(r.target(), "outline");
    }
}
