//! Transformation rules: pattern-matched, deterministic graph rewrites.
//!
//! A rule is a value implementing [`TransformationRule`]: it enumerates the
//! sites where it applies, re-checks a single site, rewrites a graph at a
//! site, and reports the energy delta it expects. Rules are registered once in
//! a [`RuleSet`] and referenced by [`RuleId`] from certificates, so an id must
//! keep its meaning across releases.
//!
//! Sites are lists of node ids. The first entry anchors the match; the rest
//! name the other atoms the rewrite touches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{AtomCatalog, AtomOp};
use crate::constants::LOOP_FUSION_SAVING;
use crate::energy::EnergyConfig;
use crate::error::{Result, SynthesisError};
use crate::graph::{AtomGraph, AttrValue, EdgeKind, NodeId};

/// Stable rule identifier. Lower ids win ties during selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u16);

impl RuleId {
    pub const LOOP_FUSION: RuleId = RuleId(1);
    pub const STREAM_CONVERSION: RuleId = RuleId(2);
    pub const PARALLELIZE: RuleId = RuleId(3);
    pub const CONSTANT_FOLD: RuleId = RuleId(4);
    pub const PRUNE_UNUSED: RuleId = RuleId(5);

    pub fn name(self) -> &'static str {
        match self {
            RuleId::LOOP_FUSION => "loop-fusion",
            RuleId::STREAM_CONVERSION => "stream-conversion",
            RuleId::PARALLELIZE => "parallelize",
            RuleId::CONSTANT_FOLD => "constant-fold",
            RuleId::PRUNE_UNUSED => "prune-unused",
            _ => "custom",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name(), self.0)
    }
}

/// One place where a rule applies.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: RuleId,
    pub site: Vec<NodeId>,
}

/// Read-only parameters shared by all rules during one run.
#[derive(Clone, Copy, Debug)]
pub struct RuleContext<'a> {
    pub catalog: &'a AtomCatalog,
    pub energy: &'a EnergyConfig,
    pub core_count: u32,
}

impl<'a> RuleContext<'a> {
    pub fn new(catalog: &'a AtomCatalog, energy: &'a EnergyConfig, core_count: u32) -> Self {
        Self {
            catalog,
            energy,
            core_count: core_count.max(1),
        }
    }
}

/// Capability triple every rewrite rule provides, plus site enumeration.
///
/// `apply` is only called on sites for which `matches` returned true; the
/// engine checks this. `apply` never mutates its input.
pub trait TransformationRule: Send + Sync {
    fn id(&self) -> RuleId;

    fn description(&self) -> &'static str;

    /// Every site in `graph` where this rule applies, in ascending site order.
    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch>;

    /// Whether the rule applies at exactly this site.
    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool;

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> AtomGraph;

    /// Expected energy change of applying at `site`. Negative is an improvement.
    fn delta(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> f64;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable-after-build registry of rules keyed by id.
pub struct RuleSet {
    rules: BTreeMap<RuleId, Box<dyn TransformationRule>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// The built-in rules.
    pub fn standard() -> Self {
        let mut set = Self::empty();
        let built_in: [Box<dyn TransformationRule>; 5] = [
            Box::new(LoopFusion),
            Box::new(StreamConversion),
            Box::new(Parallelize),
            Box::new(ConstantFold),
            Box::new(PruneUnused),
        ];
        for rule in built_in {
            set.rules.insert(rule.id(), rule);
        }
        set
    }

    /// Register a rule. Ids are unique; re-registering one is an error.
    pub fn register(&mut self, rule: Box<dyn TransformationRule>) -> Result<()> {
        let id = rule.id();
        if self.rules.contains_key(&id) {
            return Err(SynthesisError::InvalidArgument(format!(
                "rule id {} is already registered",
                id.0
            )));
        }
        self.rules.insert(id, rule);
        Ok(())
    }

    /// Drop a rule, e.g. because a constraint forbids it.
    pub fn without(mut self, id: RuleId) -> Self {
        self.rules.remove(&id);
        self
    }

    pub fn get(&self, id: RuleId) -> Option<&dyn TransformationRule> {
        self.rules.get(&id).map(|r| r.as_ref())
    }

    pub fn ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.rules.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn TransformationRule> {
        self.rules.values().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All matches of all rules, ordered by rule id then site.
    pub fn find_all(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        let mut all: Vec<RuleMatch> = self
            .rules
            .values()
            .flat_map(|r| r.find_matches(graph))
            .collect();
        all.sort();
        all
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rules.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Shared rewrite helpers
// ---------------------------------------------------------------------------

/// Remove `id`, reconnecting its sequencing predecessors to its successors so
/// statement order survives.
fn remove_bridging(graph: &mut AtomGraph, id: NodeId) {
    let preds = graph.predecessors(id, EdgeKind::Sequencing);
    let succs = graph.successors(id, EdgeKind::Sequencing);
    graph.remove_node(id);
    for &p in &preds {
        for &s in &succs {
            graph.add_edge(p, s, EdgeKind::Sequencing);
        }
    }
}

fn contains_opaque(graph: &AtomGraph, nodes: &BTreeSet<NodeId>) -> bool {
    nodes
        .iter()
        .filter_map(|id| graph.node(*id))
        .any(|n| n.op == AtomOp::Opaque)
}

fn element_count(graph: &AtomGraph, id: NodeId, ctx: &RuleContext) -> f64 {
    graph
        .node(id)
        .map_or(ctx.energy.default_element_count as f64, |n| {
            ctx.energy.element_count(n)
        })
}

fn single(site: &[NodeId]) -> Option<NodeId> {
    match site {
        [id] => Some(*id),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Loop fusion
// ---------------------------------------------------------------------------

/// Two adjacent loops over the same collection become one loop running both
/// bodies in order.
pub struct LoopFusion;

impl LoopFusion {
    fn pair(site: &[NodeId]) -> Option<(NodeId, NodeId)> {
        match site {
            [a, b] => Some((*a, *b)),
            _ => None,
        }
    }
}

impl TransformationRule for LoopFusion {
    fn id(&self) -> RuleId {
        RuleId::LOOP_FUSION
    }

    fn description(&self) -> &'static str {
        "fuse adjacent loops over the same collection"
    }

    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        graph
            .edges()
            .filter(|e| e.kind == EdgeKind::Sequencing)
            .filter(|e| self.matches(graph, &[e.from, e.to]))
            .map(|e| RuleMatch {
                rule: self.id(),
                site: vec![e.from, e.to],
            })
            .collect()
    }

    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool {
        let Some((a, b)) = Self::pair(site) else {
            return false;
        };
        let (Some(la), Some(lb)) = (graph.node(a), graph.node(b)) else {
            return false;
        };
        if la.op != lb.op || !matches!(la.op, AtomOp::IterNext | AtomOp::MapEach) {
            return false;
        }
        match (la.attr_text("collection"), lb.attr_text("collection")) {
            (Some(ca), Some(cb)) if ca == cb => {}
            _ => return false,
        }
        if la.attr_bool("materialize") || lb.attr_bool("materialize") {
            return false;
        }
        if !graph.has_edge(a, b, EdgeKind::Sequencing) {
            return false;
        }

        let sub_a = graph.subtree(a);
        let sub_b = graph.subtree(b);
        if contains_opaque(graph, &sub_a) || contains_opaque(graph, &sub_b) {
            return false;
        }
        // No data may flow between the two loops in either direction.
        let from_a = graph.reachable(&sub_a, EdgeKind::Data);
        let from_b = graph.reachable(&sub_b, EdgeKind::Data);
        from_a.is_disjoint(&sub_b) && from_b.is_disjoint(&sub_a)
    }

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], _ctx: &RuleContext) -> AtomGraph {
        let mut out = graph.clone();
        let Some((a, b)) = Self::pair(site) else {
            return out;
        };
        let (Some(la), Some(lb)) = (graph.node(a), graph.node(b)) else {
            return out;
        };

        let body_a = graph.body(a);
        let body_b = graph.body(b);

        for edge in graph.outgoing(b) {
            if edge.to != a {
                out.add_edge(a, edge.to, edge.kind);
            }
        }
        for edge in graph.incoming(b) {
            if edge.from != a {
                out.add_edge(edge.from, a, edge.kind);
            }
        }
        if let (Some(&last_a), Some(&first_b)) = (body_a.last(), body_b.first()) {
            out.add_edge(last_a, first_b, EdgeKind::Sequencing);
        }

        // The second loop's variable now names the fused loop's element.
        let mut aliases: Vec<String> = la
            .attr_text("aliases")
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(var) = lb.attr_text("var").filter(|v| Some(*v) != la.attr_text("var")) {
            aliases.push(var.to_string());
        }
        let n = match (la.attr_number("n"), lb.attr_number("n")) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        };
        let fused = la.attr_int("fused").unwrap_or(1) + lb.attr_int("fused").unwrap_or(1);

        out.remove_node(b);
        if let Some(node) = out.node_mut(a) {
            if !aliases.is_empty() {
                node.set_attr("aliases", aliases.join(","));
            }
            if let Some(n) = n {
                node.set_attr("n", n as i64);
            }
            node.set_attr("fused", fused);
        }
        out
    }

    fn delta(&self, _graph: &AtomGraph, _site: &[NodeId], _ctx: &RuleContext) -> f64 {
        -LOOP_FUSION_SAVING
    }
}

// ---------------------------------------------------------------------------
// Stream conversion
// ---------------------------------------------------------------------------

/// A loop that collects its results before anyone reads them becomes a lazy
/// stream consumed incrementally.
pub struct StreamConversion;

impl TransformationRule for StreamConversion {
    fn id(&self) -> RuleId {
        RuleId::STREAM_CONVERSION
    }

    fn description(&self) -> &'static str {
        "produce loop results lazily instead of materializing them"
    }

    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        graph
            .nodes()
            .filter(|n| self.matches(graph, &[n.id]))
            .map(|n| RuleMatch {
                rule: self.id(),
                site: vec![n.id],
            })
            .collect()
    }

    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool {
        let Some(node) = single(site).and_then(|id| graph.node(id)) else {
            return false;
        };
        matches!(node.op, AtomOp::IterNext | AtomOp::MapEach)
            && node.attr_bool("materialize")
            && graph.outgoing(node.id).any(|e| e.kind == EdgeKind::Data)
    }

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> AtomGraph {
        let mut out = graph.clone();
        if let Some(node) = single(site).and_then(|id| out.node_mut(id)) {
            node.op = AtomOp::Stream;
            node.parallel = ctx.catalog.get(AtomOp::Stream).parallelizable;
            node.remove_attr("materialize");
            node.set_attr("lazy", true);
        }
        out
    }

    fn delta(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> f64 {
        let Some(id) = single(site) else {
            return 0.0;
        };
        -ctx.energy.materialize_cost_per_element * element_count(graph, id, ctx)
    }
}

// ---------------------------------------------------------------------------
// Parallelization
// ---------------------------------------------------------------------------

/// An element-wise loop whose whole body may run concurrently is wrapped in a
/// parallel dispatch across the available cores.
pub struct Parallelize;

impl TransformationRule for Parallelize {
    fn id(&self) -> RuleId {
        RuleId::PARALLELIZE
    }

    fn description(&self) -> &'static str {
        "dispatch an element-wise loop across cores"
    }

    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        graph
            .nodes()
            .filter(|n| self.matches(graph, &[n.id]))
            .map(|n| RuleMatch {
                rule: self.id(),
                site: vec![n.id],
            })
            .collect()
    }

    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool {
        let Some(node) = single(site).and_then(|id| graph.node(id)) else {
            return false;
        };
        node.op == AtomOp::MapEach
            && node.parallel
            && graph
                .body(node.id)
                .iter()
                .all(|child| graph.node(*child).is_some_and(|c| c.parallel && c.op != AtomOp::Opaque))
    }

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> AtomGraph {
        let mut out = graph.clone();
        if let Some(node) = single(site).and_then(|id| out.node_mut(id)) {
            node.op = AtomOp::ParDispatch;
            node.parallel = ctx.catalog.get(AtomOp::ParDispatch).parallelizable;
            node.set_attr("lanes", i64::from(ctx.core_count));
        }
        out
    }

    fn delta(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> f64 {
        let Some(id) = single(site) else {
            return 0.0;
        };
        let setup =
            ctx.catalog.base_energy(AtomOp::ParDispatch) - ctx.catalog.base_energy(AtomOp::MapEach);
        let n = element_count(graph, id, ctx);
        let per_element = ctx.energy.dispatch_cost_per_element;
        setup + per_element * n / f64::from(ctx.core_count) - per_element * n
    }
}

// ---------------------------------------------------------------------------
// Constant folding
// ---------------------------------------------------------------------------

/// An arithmetic chain whose inputs are all compile-time constants collapses
/// into one LOAD of the computed value.
pub struct ConstantFold;

/// What folding at a root would do.
struct FoldPlan {
    value: f64,
    /// Producers removed along with the root's arithmetic, ascending.
    removed: Vec<NodeId>,
}

impl ConstantFold {
    fn plan(graph: &AtomGraph, root: NodeId) -> Option<FoldPlan> {
        let node = graph.node(root)?;
        if node.op != AtomOp::Arith {
            return None;
        }
        let mut removed = BTreeSet::new();
        let mut visiting = BTreeSet::new();
        let value = Self::eval(graph, root, root, &mut removed, &mut visiting)?;
        Some(FoldPlan {
            value,
            removed: removed.into_iter().collect(),
        })
    }

    /// Evaluate `id` as a constant. Producers that feed only their single
    /// consumer inside the chain are collected into `removed`.
    fn eval(
        graph: &AtomGraph,
        root: NodeId,
        id: NodeId,
        removed: &mut BTreeSet<NodeId>,
        visiting: &mut BTreeSet<NodeId>,
    ) -> Option<f64> {
        if !visiting.insert(id) {
            return None;
        }
        let node = graph.node(id)?;
        let value = match node.op {
            AtomOp::Const | AtomOp::Load => node.attr_number("value")?,
            AtomOp::Arith => {
                let lhs = Self::operand(graph, root, id, "lhs", removed, visiting)?;
                let rhs = Self::operand(graph, root, id, "rhs", removed, visiting)?;
                let op = node.attr_text("op")?;
                apply_arith(op, lhs, rhs)?
            }
            _ => return None,
        };
        visiting.remove(&id);

        if id != root && Self::exclusively_feeds(graph, id) {
            removed.insert(id);
        }
        Some(value)
    }

    fn operand(
        graph: &AtomGraph,
        root: NodeId,
        owner: NodeId,
        side: &str,
        removed: &mut BTreeSet<NodeId>,
        visiting: &mut BTreeSet<NodeId>,
    ) -> Option<f64> {
        let node = graph.node(owner)?;
        if let Some(v) = node.attr_number(&format!("{side}_value")) {
            return Some(v);
        }
        let producer = NodeId(u32::try_from(node.attr_int(&format!("{side}_ref"))?).ok()?);
        if !graph.has_edge(producer, owner, EdgeKind::Data) {
            return None;
        }
        Self::eval(graph, root, producer, removed, visiting)
    }

    /// True when the atom's only outgoing dependency is a single data edge.
    fn exclusively_feeds(graph: &AtomGraph, id: NodeId) -> bool {
        let mut data = 0;
        for e in graph.outgoing(id) {
            match e.kind {
                EdgeKind::Data => data += 1,
                EdgeKind::Control => return false,
                EdgeKind::Sequencing => {}
            }
        }
        data == 1
    }
}

fn apply_arith(op: &str, lhs: f64, rhs: f64) -> Option<f64> {
    let v = match op {
        "+" => lhs + rhs,
        "-" => lhs - rhs,
        "*" => lhs * rhs,
        "/" if rhs != 0.0 => lhs / rhs,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

impl TransformationRule for ConstantFold {
    fn id(&self) -> RuleId {
        RuleId::CONSTANT_FOLD
    }

    fn description(&self) -> &'static str {
        "fold constant arithmetic chains into a single load"
    }

    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        graph
            .nodes()
            .filter(|n| n.op == AtomOp::Arith)
            .filter_map(|n| {
                let plan = Self::plan(graph, n.id)?;
                let mut site = vec![n.id];
                site.extend(plan.removed);
                Some(RuleMatch {
                    rule: self.id(),
                    site,
                })
            })
            .collect()
    }

    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool {
        let Some((&root, rest)) = site.split_first() else {
            return false;
        };
        Self::plan(graph, root).is_some_and(|plan| plan.removed == rest)
    }

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], _ctx: &RuleContext) -> AtomGraph {
        let mut out = graph.clone();
        let Some(&root) = site.first() else {
            return out;
        };
        let Some(plan) = Self::plan(graph, root) else {
            return out;
        };

        let inputs: Vec<_> = graph
            .incoming(root)
            .filter(|e| e.kind == EdgeKind::Data)
            .copied()
            .collect();
        for e in &inputs {
            out.remove_edge(e);
        }
        for id in plan.removed.iter().rev() {
            remove_bridging(&mut out, *id);
        }
        if let Some(node) = out.node_mut(root) {
            node.op = AtomOp::Load;
            for key in ["op", "lhs", "rhs", "lhs_ref", "rhs_ref", "lhs_value", "rhs_value"] {
                node.remove_attr(key);
            }
            node.set_attr("value", AttrValue::Float(plan.value));
        }
        out
    }

    fn delta(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> f64 {
        let folded: f64 = site
            .iter()
            .filter_map(|id| graph.node(*id))
            .map(|n| ctx.catalog.base_energy(n.op))
            .sum();
        ctx.catalog.base_energy(AtomOp::Load) - folded
    }
}

// ---------------------------------------------------------------------------
// Unused binding pruning
// ---------------------------------------------------------------------------

/// A pure atom that binds a name nobody reads is dropped.
pub struct PruneUnused;

impl TransformationRule for PruneUnused {
    fn id(&self) -> RuleId {
        RuleId::PRUNE_UNUSED
    }

    fn description(&self) -> &'static str {
        "drop pure bindings that are never read"
    }

    fn find_matches(&self, graph: &AtomGraph) -> Vec<RuleMatch> {
        graph
            .nodes()
            .filter(|n| self.matches(graph, &[n.id]))
            .map(|n| RuleMatch {
                rule: self.id(),
                site: vec![n.id],
            })
            .collect()
    }

    fn matches(&self, graph: &AtomGraph, site: &[NodeId]) -> bool {
        let Some(node) = single(site).and_then(|id| graph.node(id)) else {
            return false;
        };
        matches!(
            node.op,
            AtomOp::Const | AtomOp::Load | AtomOp::Arith | AtomOp::Transform
        ) && AtomCatalog::standard().get(node.op).pure
            && node.attr_text("binds").is_some()
            && graph
                .outgoing(node.id)
                .all(|e| e.kind == EdgeKind::Sequencing)
    }

    fn apply(&self, graph: &AtomGraph, site: &[NodeId], _ctx: &RuleContext) -> AtomGraph {
        let mut out = graph.clone();
        if let Some(id) = single(site) {
            remove_bridging(&mut out, id);
        }
        out
    }

    fn delta(&self, graph: &AtomGraph, site: &[NodeId], ctx: &RuleContext) -> f64 {
        single(site)
            .and_then(|id| graph.node(id))
            .map_or(0.0, |n| -ctx.catalog.base_energy(n.op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ctx() -> (&'static AtomCatalog, EnergyConfig) {
        (AtomCatalog::standard(), EnergyConfig::default())
    }

    fn loop_node(g: &mut AtomGraph, op: AtomOp, coll: &str, var: &str) -> NodeId {
        let id = g.add_node(op, 0);
        let node = g.node_mut(id).unwrap();
        node.set_attr("collection", coll);
        node.set_attr("var", var);
        id
    }

    /// for x in items: transform(x)   /   for y in items: transform(y)
    fn two_loops(op: AtomOp) -> AtomGraph {
        let mut g = AtomGraph::new();
        let a = loop_node(&mut g, op, "items", "x");
        let ta = g.add_node(AtomOp::Transform, 0);
        let b = loop_node(&mut g, op, "items", "y");
        let tb = g.add_node(AtomOp::Transform, 0);
        g.add_edge(a, ta, EdgeKind::Control);
        g.add_edge(b, tb, EdgeKind::Control);
        g.add_edge(a, b, EdgeKind::Sequencing);
        g
    }

    fn constant(g: &mut AtomGraph, name: &str, value: f64) -> NodeId {
        let id = g.add_node(AtomOp::Const, 0);
        let node = g.node_mut(id).unwrap();
        node.set_attr("binds", name);
        node.set_attr("value", value);
        id
    }

    fn arith(g: &mut AtomGraph, name: &str, op: &str, lhs: NodeId, rhs_value: f64) -> NodeId {
        let id = g.add_node(AtomOp::Arith, 0);
        g.add_edge(lhs, id, EdgeKind::Data);
        let node = g.node_mut(id).unwrap();
        node.set_attr("binds", name);
        node.set_attr("op", op);
        node.set_attr("lhs_ref", i64::from(lhs.0));
        node.set_attr("rhs_value", rhs_value);
        id
    }

    #[test]
    fn test_standard_ids_stable() {
        let set = RuleSet::standard();
        let ids: Vec<u16> = set.ids().map(|r| r.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(set.get(RuleId::LOOP_FUSION).unwrap().id(), RuleId::LOOP_FUSION);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut set = RuleSet::standard();
        assert!(set.register(Box::new(LoopFusion)).is_err());
    }

    #[test]
    fn test_without_removes_rule() {
        let set = RuleSet::standard().without(RuleId::PARALLELIZE);
        assert!(set.get(RuleId::PARALLELIZE).is_none());
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_fusion_matches_and_merges_bodies() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        let g = two_loops(AtomOp::IterNext);
        let matches = LoopFusion.find_matches(&g);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].site, vec![NodeId(0), NodeId(2)]);

        let fused = LoopFusion.apply(&g, &matches[0].site, &rc);
        assert!(fused.validate().is_ok());
        assert_eq!(fused.count_op(AtomOp::IterNext), 1);
        assert_eq!(fused.body(NodeId(0)), vec![NodeId(1), NodeId(3)]);
        assert!(fused.has_edge(NodeId(1), NodeId(3), EdgeKind::Sequencing));
        assert_eq!(fused.node(NodeId(0)).unwrap().attr_text("aliases"), Some("y"));
        assert_abs_diff_eq!(LoopFusion.delta(&g, &matches[0].site, &rc), -5.0);
    }

    #[test]
    fn test_fusion_output_does_not_rematch() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        let g = two_loops(AtomOp::MapEach);
        let site = LoopFusion.find_matches(&g)[0].site.clone();
        let fused = LoopFusion.apply(&g, &site, &rc);
        assert!(LoopFusion.find_matches(&fused).is_empty());
    }

    #[test]
    fn test_fusion_blocked_by_data_dependency() {
        let mut g = two_loops(AtomOp::IterNext);
        // Second body reads something the first body produced.
        g.add_edge(NodeId(1), NodeId(3), EdgeKind::Data);
        assert!(LoopFusion.find_matches(&g).is_empty());
    }

    #[test]
    fn test_fusion_requires_same_collection() {
        let mut g = two_loops(AtomOp::IterNext);
        g.node_mut(NodeId(2)).unwrap().set_attr("collection", "other");
        assert!(LoopFusion.find_matches(&g).is_empty());
    }

    #[test]
    fn test_fusion_never_touches_opaque_bodies() {
        let mut g = two_loops(AtomOp::IterNext);
        g.node_mut(NodeId(3)).unwrap().op = AtomOp::Opaque;
        assert!(LoopFusion.find_matches(&g).is_empty());
    }

    #[test]
    fn test_stream_conversion() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        let mut g = AtomGraph::new();
        let l = loop_node(&mut g, AtomOp::IterNext, "rows", "r");
        let sink = g.add_node(AtomOp::Emit, 0);
        g.add_edge(l, sink, EdgeKind::Data);
        g.node_mut(l).unwrap().set_attr("materialize", true);
        g.node_mut(l).unwrap().set_attr("n", 200i64);

        let m = StreamConversion.find_matches(&g);
        assert_eq!(m.len(), 1);
        assert_abs_diff_eq!(StreamConversion.delta(&g, &m[0].site, &rc), -100.0);

        let out = StreamConversion.apply(&g, &m[0].site, &rc);
        let node = out.node(l).unwrap();
        assert_eq!(node.op, AtomOp::Stream);
        assert!(!node.attr_bool("materialize"));
        assert!(StreamConversion.find_matches(&out).is_empty());
    }

    #[test]
    fn test_stream_conversion_needs_consumer() {
        let mut g = AtomGraph::new();
        let l = loop_node(&mut g, AtomOp::IterNext, "rows", "r");
        g.node_mut(l).unwrap().set_attr("materialize", true);
        assert!(StreamConversion.find_matches(&g).is_empty());
    }

    #[test]
    fn test_parallelize_delta_and_rewrite() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        let mut g = AtomGraph::new();
        let m = loop_node(&mut g, AtomOp::MapEach, "pixels", "p");
        let t = g.add_node(AtomOp::Transform, 0);
        g.add_edge(m, t, EdgeKind::Control);
        g.node_mut(m).unwrap().set_attr("n", 1000i64);

        let site = [m];
        assert!(Parallelize.matches(&g, &site));
        // setup 10 + 0.05·1000/4 − 0.05·1000
        assert_abs_diff_eq!(Parallelize.delta(&g, &site, &rc), -27.5);

        let out = Parallelize.apply(&g, &site, &rc);
        assert_eq!(out.node(m).unwrap().op, AtomOp::ParDispatch);
        assert_eq!(out.node(m).unwrap().attr_int("lanes"), Some(4));
        assert_eq!(out.body(m), vec![t]);
        assert!(!Parallelize.matches(&out, &site));
    }

    #[test]
    fn test_parallelize_blocked_by_impure_body() {
        let mut g = AtomGraph::new();
        let m = loop_node(&mut g, AtomOp::MapEach, "files", "f");
        let io = g.add_node(AtomOp::Call, 0);
        g.add_edge(m, io, EdgeKind::Control);
        assert!(Parallelize.find_matches(&g).is_empty());
    }

    #[test]
    fn test_sequential_loop_never_parallelized() {
        let g = two_loops(AtomOp::IterNext);
        assert!(Parallelize.find_matches(&g).is_empty());
    }

    #[test]
    fn test_constant_fold_chain() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        // a = 2 ; b = a * 3 ; c = b + 1 ; emit c
        let mut g = AtomGraph::new();
        let a = constant(&mut g, "a", 2.0);
        let b = arith(&mut g, "b", "*", a, 3.0);
        let c = arith(&mut g, "c", "+", b, 1.0);
        let out = g.add_node(AtomOp::Emit, 0);
        g.add_edge(c, out, EdgeKind::Data);
        g.add_edge(a, b, EdgeKind::Sequencing);
        g.add_edge(b, c, EdgeKind::Sequencing);
        g.add_edge(c, out, EdgeKind::Sequencing);

        let matches = ConstantFold.find_matches(&g);
        let best = matches.iter().find(|m| m.site[0] == c).unwrap();
        assert_eq!(best.site, vec![c, a, b]);
        // ARITH 1 + CONST 0.5 + ARITH 1 folded into LOAD 0
        assert_abs_diff_eq!(ConstantFold.delta(&g, &best.site, &rc), -2.5);

        let folded = ConstantFold.apply(&g, &best.site, &rc);
        assert!(folded.validate().is_ok());
        assert_eq!(folded.node_count(), 2);
        let load = folded.node(c).unwrap();
        assert_eq!(load.op, AtomOp::Load);
        assert_eq!(load.attr_number("value"), Some(7.0));
        assert!(folded.has_edge(c, out, EdgeKind::Data));
        assert!(ConstantFold.find_matches(&folded).is_empty());
    }

    #[test]
    fn test_constant_fold_keeps_shared_producer() {
        let mut g = AtomGraph::new();
        let a = constant(&mut g, "a", 4.0);
        let b = arith(&mut g, "b", "-", a, 1.0);
        let other = g.add_node(AtomOp::Emit, 0);
        g.add_edge(a, other, EdgeKind::Data);
        let m = ConstantFold.find_matches(&g);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].site, vec![b]);
    }

    #[test]
    fn test_constant_fold_rejects_division_by_zero() {
        let mut g = AtomGraph::new();
        let a = constant(&mut g, "a", 4.0);
        arith(&mut g, "b", "/", a, 0.0);
        assert!(ConstantFold.find_matches(&g).is_empty());
    }

    #[test]
    fn test_constant_fold_needs_known_inputs() {
        let mut g = AtomGraph::new();
        let input = g.add_node(AtomOp::Call, 0);
        arith(&mut g, "b", "+", input, 1.0);
        assert!(ConstantFold.find_matches(&g).is_empty());
    }

    #[test]
    fn test_prune_unused_binding() {
        let (catalog, energy) = ctx();
        let rc = RuleContext::new(catalog, &energy, 4);
        let mut g = AtomGraph::new();
        let first = g.add_node(AtomOp::Call, 0);
        let dead = constant(&mut g, "unused", 1.0);
        let last = g.add_node(AtomOp::Emit, 0);
        g.add_edge(first, dead, EdgeKind::Sequencing);
        g.add_edge(dead, last, EdgeKind::Sequencing);

        let m = PruneUnused.find_matches(&g);
        assert_eq!(m.len(), 1);
        assert_abs_diff_eq!(PruneUnused.delta(&g, &m[0].site, &rc), -0.5);
        let out = PruneUnused.apply(&g, &m[0].site, &rc);
        assert!(!out.contains(dead));
        assert!(out.has_edge(first, last, EdgeKind::Sequencing));
    }

    #[test]
    fn test_prune_skips_bare_expressions_and_impure_atoms() {
        let g = two_loops(AtomOp::IterNext);
        assert!(PruneUnused.find_matches(&g).is_empty());

        let mut g = AtomGraph::new();
        let call = g.add_node(AtomOp::Call, 0);
        g.node_mut(call).unwrap().set_attr("binds", "r");
        assert!(PruneUnused.find_matches(&g).is_empty());
    }

    #[test]
    fn test_find_all_sorted_by_rule_then_site() {
        let mut g = two_loops(AtomOp::MapEach);
        constant(&mut g, "unused", 1.0);
        let all = RuleSet::standard().find_all(&g);
        let rules: Vec<RuleId> = all.iter().map(|m| m.rule).collect();
        let mut sorted = rules.clone();
        sorted.sort();
        assert_eq!(rules, sorted);
        assert_eq!(rules.first(), Some(&RuleId::LOOP_FUSION));
        assert!(rules.contains(&RuleId::PARALLELIZE));
        assert!(rules.contains(&RuleId::PRUNE_UNUSED));
    }
}
