//! Append-only optimization trace.
//!
//! One entry per generation that changed the graph: the energy before and
//! after, the rule applied at which site, and what the other candidates of
//! that generation would have scored. Replaying the entries against the
//! initial graph reproduces the final graph exactly.

use serde::{Deserialize, Serialize};

use crate::energy::EnergyEvaluator;
use crate::error::{Result, SynthesisError};
use crate::graph::{AtomGraph, NodeId};
use crate::rules::{RuleContext, RuleId, RuleSet};

/// Relative tolerance when comparing recorded energies against recomputed ones.
const ENERGY_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedRule {
    pub rule: RuleId,
    pub site: Vec<NodeId>,
    /// Delta the rule declared before applying.
    pub delta: f64,
    /// Delta measured by re-scoring the rewritten graph.
    pub observed_delta: f64,
}

/// A candidate that was scored but not selected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub rule: RuleId,
    pub energy: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub generation_index: usize,
    pub previous_energy: f64,
    pub selected_energy: f64,
    pub rules_applied: Vec<AppliedRule>,
    pub alternatives: Vec<Alternative>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub initial_energy: f64,
    pub final_energy: f64,
    entries: Vec<CertificateEntry>,
}

fn energies_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= ENERGY_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

impl Certificate {
    pub fn new(initial_energy: f64) -> Self {
        Self {
            initial_energy,
            final_energy: initial_energy,
            entries: Vec::new(),
        }
    }

    /// Append an entry. The generation index is assigned here, in order.
    pub fn record(
        &mut self,
        previous_energy: f64,
        selected_energy: f64,
        rules_applied: Vec<AppliedRule>,
        alternatives: Vec<Alternative>,
    ) -> usize {
        let generation_index = self.entries.len();
        self.entries.push(CertificateEntry {
            generation_index,
            previous_energy,
            selected_energy,
            rules_applied,
            alternatives,
        });
        self.final_energy = selected_energy;
        generation_index
    }

    pub fn entries(&self) -> &[CertificateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of observed deltas; equals final minus initial energy.
    pub fn total_observed_delta(&self) -> f64 {
        self.entries
            .iter()
            .flat_map(|e| &e.rules_applied)
            .map(|a| a.observed_delta)
            .sum()
    }

    /// Rule ids in application order.
    pub fn rule_sequence(&self) -> Vec<RuleId> {
        self.entries
            .iter()
            .flat_map(|e| e.rules_applied.iter().map(|a| a.rule))
            .collect()
    }

    /// Reapply every recorded rewrite to `initial`, in order.
    ///
    /// Each step re-checks the rule's matcher at the recorded site and the
    /// graph invariants of the result.
    pub fn replay(
        &self,
        initial: &AtomGraph,
        rules: &RuleSet,
        ctx: &RuleContext,
    ) -> Result<AtomGraph> {
        let mut graph = initial.clone();
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.generation_index != position {
                return Err(SynthesisError::ReplayMismatch {
                    generation: position,
                    reason: format!(
                        "entry carries generation index {}",
                        entry.generation_index
                    ),
                });
            }
            for applied in &entry.rules_applied {
                let rule = rules.get(applied.rule).ok_or_else(|| {
                    SynthesisError::ReplayMismatch {
                        generation: position,
                        reason: format!("rule {} is not registered", applied.rule),
                    }
                })?;
                if !rule.matches(&graph, &applied.site) {
                    return Err(SynthesisError::ReplayMismatch {
                        generation: position,
                        reason: format!(
                            "rule {} no longer matches at {:?}",
                            applied.rule, applied.site
                        ),
                    });
                }
                let next = rule.apply(&graph, &applied.site, ctx);
                next.validate()
                    .map_err(|reason| SynthesisError::RuleViolation {
                        rule: applied.rule,
                        reason,
                    })?;
                graph = next;
            }
        }
        Ok(graph)
    }

    /// Replay and additionally check every recorded energy and the final graph.
    pub fn verify(
        &self,
        initial: &AtomGraph,
        expected_final: &AtomGraph,
        rules: &RuleSet,
        ctx: &RuleContext,
        evaluator: &EnergyEvaluator,
    ) -> Result<()> {
        let start = evaluator.energy(initial);
        if !energies_match(start, self.initial_energy) {
            return Err(SynthesisError::ReplayMismatch {
                generation: 0,
                reason: format!(
                    "initial energy {start} differs from recorded {}",
                    self.initial_energy
                ),
            });
        }

        let mut graph = initial.clone();
        for entry in &self.entries {
            let single = Certificate {
                initial_energy: entry.previous_energy,
                final_energy: entry.selected_energy,
                entries: vec![CertificateEntry {
                    generation_index: 0,
                    ..entry.clone()
                }],
            };
            graph = single
                .replay(&graph, rules, ctx)
                .map_err(|e| match e {
                    SynthesisError::ReplayMismatch { reason, .. } => {
                        SynthesisError::ReplayMismatch {
                            generation: entry.generation_index,
                            reason,
                        }
                    }
                    other => other,
                })?;
            let energy = evaluator.energy(&graph);
            if !energies_match(energy, entry.selected_energy) {
                return Err(SynthesisError::ReplayMismatch {
                    generation: entry.generation_index,
                    reason: format!(
                        "energy {energy} differs from recorded {}",
                        entry.selected_energy
                    ),
                });
            }
        }

        if &graph != expected_final {
            return Err(SynthesisError::ReplayMismatch {
                generation: self.entries.len(),
                reason: "replayed graph differs from the recorded final graph".to_string(),
            });
        }
        Ok(())
    }
}
