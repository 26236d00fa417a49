//! Energy functional over atom graphs.
//!
//! E = Σ base + Σ curvature + Σ coupling + Σ interference + Σ workload
//!
//! Every term is a single pass over nodes or edges. The interference term
//! sums sin²(φi − φj) over all pairs of a parallel group without visiting
//! pairs, using Σ_{i<j} sin²(Δ) = k(k−1)/4 − (|Σ e^{2iφ}|² − k)/4.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{AtomCatalog, AtomOp};
use crate::constants::{
    COUPLING_CONTROL, COUPLING_DATA, COUPLING_SEQUENCING, DEFAULT_ELEMENT_COUNT,
    DISPATCH_COST_PER_ELEMENT, FULL_TURN_DEGREES, INTERFERENCE_WEIGHT,
    MATERIALIZE_COST_PER_ELEMENT,
};
use crate::field::FieldArchitecture;
use crate::graph::{AtomGraph, AtomNode, EdgeKind, NodeId};

/// Coefficients of the energy functional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub coupling_data: f64,
    pub coupling_control: f64,
    pub coupling_sequencing: f64,
    pub interference_weight: f64,
    pub materialize_cost_per_element: f64,
    pub dispatch_cost_per_element: f64,
    /// Element count assumed for loops without an `n` attribute.
    pub default_element_count: u64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            coupling_data: COUPLING_DATA,
            coupling_control: COUPLING_CONTROL,
            coupling_sequencing: COUPLING_SEQUENCING,
            interference_weight: INTERFERENCE_WEIGHT,
            materialize_cost_per_element: MATERIALIZE_COST_PER_ELEMENT,
            dispatch_cost_per_element: DISPATCH_COST_PER_ELEMENT,
            default_element_count: DEFAULT_ELEMENT_COUNT,
        }
    }
}

impl EnergyConfig {
    pub fn coupling(&self, kind: EdgeKind) -> f64 {
        match kind {
            EdgeKind::Data => self.coupling_data,
            EdgeKind::Control => self.coupling_control,
            EdgeKind::Sequencing => self.coupling_sequencing,
        }
    }

    /// Element count estimate for a loop atom: its `n` attribute, else the
    /// configured default.
    pub fn element_count(&self, node: &AtomNode) -> f64 {
        node.attr_number("n")
            .filter(|n| *n >= 0.0)
            .unwrap_or(self.default_element_count as f64)
    }
}

/// Per-term energy split, for explanation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyBreakdown {
    pub base: f64,
    pub curvature: f64,
    pub coupling: f64,
    pub interference: f64,
    pub workload: f64,
}

impl EnergyBreakdown {
    pub fn total(&self) -> f64 {
        self.base + self.curvature + self.coupling + self.interference + self.workload
    }
}

/// Scores graphs against one architecture. Holds only shared references, so
/// it can be used from several threads at once.
#[derive(Clone, Copy, Debug)]
pub struct EnergyEvaluator<'a> {
    catalog: &'a AtomCatalog,
    architecture: &'a FieldArchitecture,
    config: &'a EnergyConfig,
}

impl<'a> EnergyEvaluator<'a> {
    pub fn new(
        catalog: &'a AtomCatalog,
        architecture: &'a FieldArchitecture,
        config: &'a EnergyConfig,
    ) -> Self {
        Self {
            catalog,
            architecture,
            config,
        }
    }

    pub fn config(&self) -> &EnergyConfig {
        self.config
    }

    pub fn energy(&self, graph: &AtomGraph) -> f64 {
        self.breakdown(graph).total()
    }

    pub fn breakdown(&self, graph: &AtomGraph) -> EnergyBreakdown {
        let mut out = EnergyBreakdown::default();

        for node in graph.nodes() {
            out.base += self.catalog.base_energy(node.op);
            out.curvature += self
                .architecture
                .stage(node.stage)
                .map_or(0.0, |s| s.curvature);
            out.workload += self.workload(node);
        }

        // Parallel groups: the bodies of parallel-dispatch atoms.
        // Accumulate Σ cos 2φ and Σ sin 2φ per group as we walk the edges.
        let mut groups: BTreeMap<NodeId, (f64, f64, usize)> = BTreeMap::new();
        for edge in graph.edges() {
            out.coupling += self.config.coupling(edge.kind);
            if edge.kind != EdgeKind::Control {
                continue;
            }
            let Some(owner) = graph.node(edge.from) else {
                continue;
            };
            if owner.op != AtomOp::ParDispatch {
                continue;
            }
            if let Some(member) = graph.node(edge.to) {
                let phi = 2.0 * self.atom_phase(member).to_radians();
                let acc = groups.entry(edge.from).or_insert((0.0, 0.0, 0));
                acc.0 += phi.cos();
                acc.1 += phi.sin();
                acc.2 += 1;
            }
        }
        for (c, s, k) in groups.values() {
            out.interference += self.config.interference_weight * pairwise_sin2(*c, *s, *k);
        }

        out
    }

    /// Effective phase of an atom: its stage phase offset by its kind's default phase.
    pub fn atom_phase(&self, node: &AtomNode) -> f64 {
        let stage_phase = self
            .architecture
            .stage(node.stage)
            .map_or(0.0, |s| s.phase_degrees);
        (stage_phase + self.catalog.get(node.op).default_phase_degrees)
            .rem_euclid(FULL_TURN_DEGREES)
    }

    /// Attribute-derived cost: materializing a collection, and per-element
    /// dispatch for element-wise loops divided across their lanes.
    fn workload(&self, node: &AtomNode) -> f64 {
        if !node.op.is_loop() {
            return 0.0;
        }
        let n = self.config.element_count(node);
        let mut cost = 0.0;
        if node.attr_bool("materialize") {
            cost += self.config.materialize_cost_per_element * n;
        }
        match node.op {
            AtomOp::MapEach => cost += self.config.dispatch_cost_per_element * n,
            AtomOp::ParDispatch => {
                let lanes = node.attr_number("lanes").filter(|l| *l >= 1.0).unwrap_or(1.0);
                cost += self.config.dispatch_cost_per_element * n / lanes;
            }
            _ => {}
        }
        cost
    }
}

/// Σ_{i<j} sin²(φi − φj) from the sums of cos 2φ and sin 2φ over k atoms.
fn pairwise_sin2(cos_sum: f64, sin_sum: f64, k: usize) -> f64 {
    if k < 2 {
        return 0.0;
    }
    let k = k as f64;
    let resultant = cos_sum * cos_sum + sin_sum * sin_sum;
    // Rounding can leave a tiny negative remainder when all phases coincide.
    (k * (k - 1.0) / 4.0 - (resultant - k) / 4.0).max(0.0)
}
