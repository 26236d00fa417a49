//! Atom graph: operation instances connected by typed dependency edges.
//!
//! Graphs are values. Rules never edit the graph they matched against; they
//! clone it and return the rewritten copy, so earlier generations stay intact.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{AtomCatalog, AtomOp};

/// Node identifier, unique within one graph. Never reused after removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Rule-specific metadata value on an atom.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Text(v) => f.write_str(v),
        }
    }
}

/// A single operation instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomNode {
    pub id: NodeId,
    pub op: AtomOp,
    /// Index into the field architecture's stages.
    pub stage: usize,
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl AtomNode {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_text(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttrValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(AttrValue::Bool(true)))
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Numeric attribute, accepting both integer and float storage.
    pub fn attr_number(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key) {
            Some(AttrValue::Int(v)) => Some(*v as f64),
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<AttrValue> {
        self.attributes.remove(key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    Control,
    Sequencing,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Data => "data",
            EdgeKind::Control => "control",
            EdgeKind::Sequencing => "sequencing",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(from: NodeId, to: NodeId, kind: EdgeKind) -> Self {
        Self { from, to, kind }
    }
}

/// Directed graph of atoms. Node and edge collections are ordered so that
/// iteration, hashing and serialization are deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomGraph {
    nodes: BTreeMap<NodeId, AtomNode>,
    edges: BTreeSet<Edge>,
    next_id: u32,
}

impl AtomGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, inheriting `parallel` from the catalog kind.
    pub fn add_node(&mut self, op: AtomOp, stage: usize) -> NodeId {
        let parallel = AtomCatalog::standard().get(op).parallelizable;
        self.add_node_with(op, stage, parallel, BTreeMap::new())
    }

    pub fn add_node_with(
        &mut self,
        op: AtomOp,
        stage: usize,
        parallel: bool,
        attributes: BTreeMap<String, AttrValue>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            AtomNode {
                id,
                op,
                stage,
                parallel,
                attributes,
            },
        );
        id
    }

    /// Rebuild a graph from its parts, checking the structural invariants.
    pub fn from_parts(
        nodes: Vec<AtomNode>,
        edges: Vec<Edge>,
        next_id: u32,
    ) -> std::result::Result<Self, String> {
        let mut graph = Self {
            nodes: BTreeMap::new(),
            edges: edges.into_iter().collect(),
            next_id,
        };
        for node in nodes {
            if graph.nodes.insert(node.id, node).is_some() {
                return Err("duplicate node id".to_string());
            }
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Id the next added node will receive.
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn node(&self, id: NodeId) -> Option<&AtomNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut AtomNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AtomNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes plus edges; the size rules see when scaling their deltas.
    pub fn size(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// Insert an edge. Self-loops are dropped. Returns whether the edge is new.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        if from == to {
            return false;
        }
        self.edges.insert(Edge::new(from, to, kind))
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        self.edges.contains(&Edge::new(from, to, kind))
    }

    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        self.edges.remove(edge)
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<AtomNode> {
        let node = self.nodes.remove(&id)?;
        self.edges.retain(|e| e.from != id && e.to != id);
        Some(node)
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn successors(&self, id: NodeId, kind: EdgeKind) -> Vec<NodeId> {
        self.outgoing(id)
            .filter(|e| e.kind == kind)
            .map(|e| e.to)
            .collect()
    }

    pub fn predecessors(&self, id: NodeId, kind: EdgeKind) -> Vec<NodeId> {
        self.incoming(id)
            .filter(|e| e.kind == kind)
            .map(|e| e.from)
            .collect()
    }

    /// Control children of a block atom, in declaration order.
    pub fn body(&self, id: NodeId) -> Vec<NodeId> {
        self.successors(id, EdgeKind::Control)
    }

    /// Every atom nested below `id` through control edges, including `id`.
    pub fn subtree(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.body(next));
            }
        }
        seen
    }

    /// Nodes reachable from `start` along edges of `kind` (excluding the
    /// start set itself unless reached again).
    pub fn reachable(&self, start: &BTreeSet<NodeId>, kind: EdgeKind) -> BTreeSet<NodeId> {
        let mut out: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for e in self.edges.iter().filter(|e| e.kind == kind) {
            out.entry(e.from).or_default().push(e.to);
        }
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = start.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if let Some(targets) = out.get(&next) {
                for &t in targets {
                    if seen.insert(t) {
                        queue.push_back(t);
                    }
                }
            }
        }
        seen
    }

    /// Check the structural invariants: every edge endpoint is live, node ids
    /// match their keys, and control edges form no cycle.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (key, node) in &self.nodes {
            if *key != node.id {
                return Err(format!("node keyed {key} carries id {}", node.id));
            }
            if node.id.0 >= self.next_id {
                return Err(format!("node {} is beyond the id allocator", node.id));
            }
        }
        for e in &self.edges {
            if !self.nodes.contains_key(&e.from) || !self.nodes.contains_key(&e.to) {
                return Err(format!(
                    "{} edge {} -> {} refers to a missing node",
                    e.kind.as_str(),
                    e.from,
                    e.to
                ));
            }
            if e.from == e.to {
                return Err(format!("self-loop on {}", e.from));
            }
        }
        self.check_control_acyclic()
    }

    /// Kahn's algorithm over control edges only.
    fn check_control_acyclic(&self) -> std::result::Result<(), String> {
        let mut indegree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&k| (k, 0)).collect();
        let mut out: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for e in self.edges.iter().filter(|e| e.kind == EdgeKind::Control) {
            *indegree.entry(e.to).or_default() += 1;
            out.entry(e.from).or_default().push(e.to);
        }
        let mut queue: VecDeque<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0;
        while let Some(n) = queue.pop_front() {
            visited += 1;
            if let Some(targets) = out.get(&n) {
                for t in targets {
                    if let Some(d) = indegree.get_mut(t) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*t);
                        }
                    }
                }
            }
        }
        if visited == self.nodes.len() {
            Ok(())
        } else {
            Err("control edges form a cycle".to_string())
        }
    }

    /// Check every node's stage index against an architecture of `stage_count` stages.
    pub fn validate_stages(&self, stage_count: usize) -> std::result::Result<(), String> {
        match self.nodes.values().find(|n| n.stage >= stage_count) {
            Some(n) => Err(format!(
                "{} is tagged with stage {} but only {stage_count} exist",
                n.id, n.stage
            )),
            None => Ok(()),
        }
    }

    /// Count atoms of a given kind.
    pub fn count_op(&self, op: AtomOp) -> usize {
        self.nodes.values().filter(|n| n.op == op).count()
    }
}
