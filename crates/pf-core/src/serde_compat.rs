//! JSON serde for the v1 result wire format.
//!
//! The wire format uses camelCase field names, spells rules by numeric id
//! plus name, and stores graphs as flat node and edge lists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::AtomOp;
use crate::certificate::{Alternative, AppliedRule, Certificate};
use crate::constants::DEFAULT_CORE_COUNT;
use crate::engine::{SynthesisResult, Termination};
use crate::error::{Result, SynthesisError};
use crate::field::{FieldArchitecture, Stage, StageRole};
use crate::graph::{AtomGraph, AtomNode, AttrValue, Edge, EdgeKind, NodeId};
use crate::rules::RuleId;

pub const CURRENT_VERSION: &str = "1.0";

// --- Wire format types ---

#[derive(Serialize, Deserialize, Debug)]
pub struct WireExport {
    pub version: String,
    pub task: String,
    pub stages: Vec<WireStage>,
    #[serde(rename = "initialGraph")]
    pub initial_graph: WireGraph,
    #[serde(rename = "finalGraph")]
    pub final_graph: WireGraph,
    #[serde(rename = "initialEnergy")]
    pub initial_energy: f64,
    #[serde(rename = "finalEnergy")]
    pub final_energy: f64,
    pub generations: usize,
    pub termination: Termination,
    #[serde(rename = "coreCount", default = "default_core_count")]
    pub core_count: u32,
    pub certificate: Vec<WireEntry>,
}

fn default_core_count() -> u32 {
    DEFAULT_CORE_COUNT
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireStage {
    pub name: String,
    pub role: StageRole,
    #[serde(rename = "phaseDegrees")]
    pub phase_degrees: f64,
    pub curvature: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireGraph {
    pub nodes: Vec<WireNode>,
    pub edges: Vec<WireEdge>,
    #[serde(rename = "nextId", default)]
    pub next_id: u32,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireNode {
    pub id: u32,
    pub op: AtomOp,
    pub stage: usize,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireEdge {
    pub from: u32,
    pub to: u32,
    pub kind: EdgeKind,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireEntry {
    #[serde(rename = "generationIndex")]
    pub generation_index: usize,
    #[serde(rename = "previousEnergy")]
    pub previous_energy: f64,
    #[serde(rename = "selectedEnergy")]
    pub selected_energy: f64,
    #[serde(rename = "rulesApplied")]
    pub rules_applied: Vec<WireApplied>,
    #[serde(default)]
    pub alternatives: Vec<WireAlternative>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireApplied {
    pub rule: u16,
    /// Informational; the id is authoritative on import.
    #[serde(rename = "ruleName", default)]
    pub rule_name: String,
    pub site: Vec<u32>,
    pub delta: f64,
    #[serde(rename = "observedDelta")]
    pub observed_delta: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireAlternative {
    pub rule: u16,
    pub energy: f64,
}

// --- Conversion: Domain → Wire ---

impl WireExport {
    pub fn from_result(result: &SynthesisResult) -> Self {
        WireExport {
            version: CURRENT_VERSION.to_string(),
            task: result.task.clone(),
            stages: result
                .architecture
                .stages
                .iter()
                .map(|s| WireStage {
                    name: s.name.clone(),
                    role: s.role,
                    phase_degrees: s.phase_degrees,
                    curvature: s.curvature,
                })
                .collect(),
            initial_graph: graph_to_wire(&result.initial_graph),
            final_graph: graph_to_wire(&result.final_graph),
            initial_energy: result.initial_energy,
            final_energy: result.final_energy,
            generations: result.generations,
            termination: result.termination,
            core_count: result.core_count,
            certificate: result
                .certificate
                .entries()
                .iter()
                .map(|e| WireEntry {
                    generation_index: e.generation_index,
                    previous_energy: e.previous_energy,
                    selected_energy: e.selected_energy,
                    rules_applied: e
                        .rules_applied
                        .iter()
                        .map(|a| WireApplied {
                            rule: a.rule.0,
                            rule_name: a.rule.name().to_string(),
                            site: a.site.iter().map(|n| n.0).collect(),
                            delta: a.delta,
                            observed_delta: a.observed_delta,
                        })
                        .collect(),
                    alternatives: e
                        .alternatives
                        .iter()
                        .map(|alt| WireAlternative {
                            rule: alt.rule.0,
                            energy: alt.energy,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    // --- Conversion: Wire → Domain ---

    pub fn into_result(self) -> Result<SynthesisResult> {
        let architecture = FieldArchitecture::from_stages(
            self.stages
                .into_iter()
                .map(|s| Stage {
                    name: s.name,
                    role: s.role,
                    phase_degrees: s.phase_degrees,
                    curvature: s.curvature,
                })
                .collect(),
        )?;
        let initial_graph = wire_to_graph(self.initial_graph, "initialGraph")?;
        let final_graph = wire_to_graph(self.final_graph, "finalGraph")?;

        let mut certificate = Certificate::new(self.initial_energy);
        for (position, entry) in self.certificate.into_iter().enumerate() {
            if entry.generation_index != position {
                return Err(SynthesisError::InvalidArgument(format!(
                    "certificate entry {position} carries generation index {}",
                    entry.generation_index
                )));
            }
            let applied = entry
                .rules_applied
                .into_iter()
                .map(|a| AppliedRule {
                    rule: RuleId(a.rule),
                    site: a.site.into_iter().map(NodeId).collect(),
                    delta: a.delta,
                    observed_delta: a.observed_delta,
                })
                .collect();
            let alternatives = entry
                .alternatives
                .into_iter()
                .map(|alt| Alternative {
                    rule: RuleId(alt.rule),
                    energy: alt.energy,
                })
                .collect();
            certificate.record(entry.previous_energy, entry.selected_energy, applied, alternatives);
        }
        certificate.final_energy = self.final_energy;

        Ok(SynthesisResult {
            task: self.task,
            architecture,
            initial_graph,
            final_graph,
            initial_energy: self.initial_energy,
            final_energy: self.final_energy,
            generations: self.generations,
            termination: self.termination,
            certificate,
            core_count: self.core_count.max(1),
        })
    }
}

fn graph_to_wire(graph: &AtomGraph) -> WireGraph {
    WireGraph {
        nodes: graph
            .nodes()
            .map(|n| WireNode {
                id: n.id.0,
                op: n.op,
                stage: n.stage,
                parallel: n.parallel,
                attributes: n.attributes.clone(),
            })
            .collect(),
        edges: graph
            .edges()
            .map(|e| WireEdge {
                from: e.from.0,
                to: e.to.0,
                kind: e.kind,
            })
            .collect(),
        next_id: graph.next_id(),
    }
}

fn wire_to_graph(wire: WireGraph, field: &str) -> Result<AtomGraph> {
    // Older exports may omit nextId; never hand out an id already in use.
    let mut next_id = wire.next_id;
    for node in &wire.nodes {
        let after = node.id.checked_add(1).ok_or_else(|| {
            SynthesisError::InvalidArgument(format!("{field}: node id {} is out of range", node.id))
        })?;
        next_id = next_id.max(after);
    }
    let nodes = wire
        .nodes
        .into_iter()
        .map(|n| AtomNode {
            id: NodeId(n.id),
            op: n.op,
            stage: n.stage,
            parallel: n.parallel,
            attributes: n.attributes,
        })
        .collect();
    let edges = wire
        .edges
        .into_iter()
        .map(|e| Edge::new(NodeId(e.from), NodeId(e.to), e.kind))
        .collect();
    AtomGraph::from_parts(nodes, edges, next_id)
        .map_err(|reason| SynthesisError::InvalidArgument(format!("{field}: {reason}")))
}

/// Deserialize a v1 JSON export into a synthesis result.
pub fn import_json(json: &str) -> Result<SynthesisResult> {
    let wire: WireExport = serde_json::from_str(json)
        .map_err(|e| SynthesisError::InvalidArgument(format!("malformed export: {e}")))?;
    wire.into_result()
}

/// Serialize a synthesis result to the v1 JSON wire format.
pub fn export_json(result: &SynthesisResult) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&WireExport::from_result(result))
}
