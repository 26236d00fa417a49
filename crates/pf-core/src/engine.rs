//! Synthesis engine: deterministic evolutionary search over atom graphs.
//!
//! Each generation enumerates every rule match on the current graph, builds
//! and scores one candidate per match, and keeps the lowest-energy candidate
//! if it improves on the current graph. Ties go to the lowest rule id, then
//! the lowest site. The loop stops at a local minimum, at the energy target,
//! or when the generation or wall-clock budget runs out; budgets are checked
//! between generations only.

use std::fmt;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::AtomCatalog;
use crate::certificate::{Alternative, AppliedRule, Certificate};
use crate::constants::{
    DEFAULT_CORE_COUNT, DEFAULT_MAX_CANDIDATES, DEFAULT_MAX_GENERATIONS, EPSILON,
};
use crate::decompose::{TaskHint, decompose};
use crate::energy::{EnergyConfig, EnergyEvaluator};
use crate::error::{Result, SynthesisError};
use crate::field::{FieldArchitecture, FieldConfig, build_architecture};
use crate::graph::AtomGraph;
use crate::input::{InputRecord, Quality};
use crate::rules::{RuleContext, RuleId, RuleMatch, RuleSet};

/// Search parameters. Everything that influences the outcome lives here, so
/// two runs with equal configs and inputs produce equal results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_generations: usize,
    pub max_candidates_per_generation: usize,
    pub max_time: Option<Duration>,
    pub energy_target: Option<f64>,
    pub core_count: u32,
    /// When set, oversized candidate pools are sampled with a `SmallRng`
    /// seeded from this value and the generation index instead of truncated.
    pub exploration_seed: Option<u64>,
    pub parallel_scoring: bool,
    pub disabled_rules: Vec<RuleId>,
    pub energy: EnergyConfig,
    pub field: FieldConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_generations: DEFAULT_MAX_GENERATIONS,
            max_candidates_per_generation: DEFAULT_MAX_CANDIDATES,
            max_time: None,
            energy_target: None,
            core_count: DEFAULT_CORE_COUNT,
            exploration_seed: None,
            parallel_scoring: true,
            disabled_rules: Vec::new(),
            energy: EnergyConfig::default(),
            field: FieldConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn for_quality(quality: Quality) -> Self {
        let (max_generations, max_candidates_per_generation) = quality.budget();
        Self {
            max_generations,
            max_candidates_per_generation,
            ..Self::default()
        }
    }

    /// Config derived from an input record: quality preset, time budget,
    /// energy target.
    pub fn for_input(input: &InputRecord) -> Result<Self> {
        let (_, quality) = input.validate()?;
        Ok(Self {
            max_time: input.max_time(),
            energy_target: input.energy_target,
            ..Self::for_quality(quality)
        })
    }
}

/// Rules a constraint tag forbids.
pub fn disabled_by_constraints<S: AsRef<str>>(constraints: &[S]) -> Vec<RuleId> {
    let sequential = constraints.iter().any(|c| {
        matches!(
            c.as_ref().trim().to_lowercase().replace('-', "_").as_str(),
            "sequential" | "single_threaded"
        )
    });
    if sequential {
        vec![RuleId::PARALLELIZE]
    } else {
        Vec::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    LocalMinimum,
    TargetReached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Generations,
    Time,
}

/// How a successful run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged(ConvergenceReason),
    BudgetExhausted(Budget),
}

impl Termination {
    pub fn is_converged(self) -> bool {
        matches!(self, Termination::Converged(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Converged(ConvergenceReason::LocalMinimum) => {
                f.write_str("converged (local minimum)")
            }
            Termination::Converged(ConvergenceReason::TargetReached) => {
                f.write_str("converged (energy target reached)")
            }
            Termination::BudgetExhausted(Budget::Generations) => {
                f.write_str("budget exhausted (generations)")
            }
            Termination::BudgetExhausted(Budget::Time) => f.write_str("budget exhausted (time)"),
        }
    }
}

/// Lifecycle of one evolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Evolving,
    Converged,
    BudgetExhausted,
    Failed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EngineState::Initializing | EngineState::Evolving)
    }
}

impl From<Termination> for EngineState {
    fn from(t: Termination) -> Self {
        match t {
            Termination::Converged(_) => EngineState::Converged,
            Termination::BudgetExhausted(_) => EngineState::BudgetExhausted,
        }
    }
}

/// A scored rewrite of the current graph. Lives for one generation.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub graph: AtomGraph,
    pub energy: f64,
    pub applied: AppliedRule,
}

/// Outcome of a search from a given graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evolution {
    pub final_graph: AtomGraph,
    pub initial_energy: f64,
    pub final_energy: f64,
    pub generations: usize,
    pub termination: Termination,
    pub certificate: Certificate,
}

/// Everything a synthesis run produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub task: String,
    pub architecture: FieldArchitecture,
    pub initial_graph: AtomGraph,
    pub final_graph: AtomGraph,
    pub initial_energy: f64,
    pub final_energy: f64,
    pub generations: usize,
    pub termination: Termination,
    pub certificate: Certificate,
    /// Lanes the parallelize rule wrote; replay needs the same value.
    pub core_count: u32,
}

impl SynthesisResult {
    /// Rule context matching the one this result was synthesized under.
    pub fn rule_context<'a>(&self, energy: &'a EnergyConfig) -> RuleContext<'a> {
        RuleContext::new(AtomCatalog::standard(), energy, self.core_count)
    }
}

pub struct Synthesizer {
    config: EngineConfig,
    rules: RuleSet,
    state: EngineState,
}

impl Synthesizer {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rules(config, RuleSet::standard())
    }

    /// Use a custom rule set. Rules listed in `config.disabled_rules` are
    /// still removed.
    pub fn with_rules(config: EngineConfig, rules: RuleSet) -> Self {
        let rules = config
            .disabled_rules
            .iter()
            .fold(rules, |set, id| set.without(*id));
        Self {
            config,
            rules,
            state: EngineState::Initializing,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Context the rules see during this engine's runs.
    pub fn rule_context(&self) -> RuleContext<'_> {
        RuleContext::new(
            AtomCatalog::standard(),
            &self.config.energy,
            self.config.core_count,
        )
    }

    /// Validate the record, build the architecture, decompose, and evolve.
    pub fn run(&mut self, input: &InputRecord) -> Result<SynthesisResult> {
        self.state = EngineState::Initializing;
        input.validate()?;

        // Constraint-disabled rules apply to this run only.
        let disabled = disabled_by_constraints(&input.constraints);
        for id in &disabled {
            tracing::debug!(rule = %id, "rule disabled by constraint");
        }

        let names = input.stage_names();
        let architecture =
            build_architecture(names.len(), &input.constraints, &names, &self.config.field)?;
        let hint = TaskHint {
            description: input.task.clone(),
            element_count: input.element_count,
        };
        let initial_graph = decompose(input.template.as_deref(), &hint, &architecture)
            .inspect_err(|_| self.state = EngineState::Failed)?;

        let evolution = self.evolve_excluding(&initial_graph, &architecture, &disabled)?;
        Ok(SynthesisResult {
            task: input.task.clone(),
            architecture,
            initial_graph,
            final_graph: evolution.final_graph,
            initial_energy: evolution.initial_energy,
            final_energy: evolution.final_energy,
            generations: evolution.generations,
            termination: evolution.termination,
            certificate: evolution.certificate,
            core_count: self.config.core_count.max(1),
        })
    }

    /// Run the generation loop from `initial` on `architecture`.
    pub fn evolve(
        &mut self,
        initial: &AtomGraph,
        architecture: &FieldArchitecture,
    ) -> Result<Evolution> {
        self.evolve_excluding(initial, architecture, &[])
    }

    fn evolve_excluding(
        &mut self,
        initial: &AtomGraph,
        architecture: &FieldArchitecture,
        excluded: &[RuleId],
    ) -> Result<Evolution> {
        self.state = EngineState::Initializing;
        initial
            .validate()
            .and_then(|_| initial.validate_stages(architecture.len()))
            .map_err(|reason| {
                self.state = EngineState::Failed;
                SynthesisError::InvalidArgument(format!("initial graph: {reason}"))
            })?;

        let catalog = AtomCatalog::standard();
        let evaluator = EnergyEvaluator::new(catalog, architecture, &self.config.energy);
        let ctx = RuleContext::new(catalog, &self.config.energy, self.config.core_count);

        let initial_energy = evaluator.energy(initial);
        let mut current = initial.clone();
        let mut energy = initial_energy;
        let mut certificate = Certificate::new(initial_energy);
        let mut generations = 0;
        let started = Instant::now();

        self.state = EngineState::Evolving;
        tracing::debug!(
            atoms = current.node_count(),
            energy = initial_energy,
            rules = self.rules.len(),
            "evolution started"
        );

        let termination = loop {
            if self.config.energy_target.is_some_and(|t| energy <= t) {
                break Termination::Converged(ConvergenceReason::TargetReached);
            }
            if generations >= self.config.max_generations {
                break Termination::BudgetExhausted(Budget::Generations);
            }
            if self.config.max_time.is_some_and(|max| started.elapsed() >= max) {
                break Termination::BudgetExhausted(Budget::Time);
            }

            let found = self
                .rules
                .find_all(&current)
                .into_iter()
                .filter(|m| !excluded.contains(&m.rule))
                .collect();
            let matches = self.select(found, generations);
            let candidates = match self.score(&current, energy, &matches, &evaluator, &ctx) {
                Ok(c) => c,
                Err(e) => {
                    self.state = EngineState::Failed;
                    tracing::warn!(generation = generations, error = %e, "evolution failed");
                    return Err(e);
                }
            };

            // Candidates arrive in (rule id, site) order, so the first
            // strictly lower energy wins ties.
            let best = candidates
                .iter()
                .enumerate()
                .fold(None::<(usize, f64)>, |best, (i, c)| match best {
                    Some((_, e)) if c.energy >= e => best,
                    _ => Some((i, c.energy)),
                });
            let Some((best_index, best_energy)) = best.filter(|(_, e)| energy - e > EPSILON)
            else {
                break Termination::Converged(ConvergenceReason::LocalMinimum);
            };

            let alternatives = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != best_index)
                .map(|(_, c)| Alternative {
                    rule: c.applied.rule,
                    energy: c.energy,
                })
                .collect::<Vec<_>>();
            let candidate_count = candidates.len();
            let Some(selected) = candidates.into_iter().nth(best_index) else {
                break Termination::Converged(ConvergenceReason::LocalMinimum);
            };

            tracing::debug!(
                generation = generations,
                rule = %selected.applied.rule,
                candidates = candidate_count,
                from = energy,
                to = best_energy,
                "generation selected"
            );

            certificate.record(energy, best_energy, vec![selected.applied], alternatives);
            current = selected.graph;
            energy = best_energy;
            generations += 1;
        };

        self.state = termination.into();
        tracing::info!(
            generations,
            initial_energy,
            final_energy = energy,
            termination = %termination,
            "evolution finished"
        );

        Ok(Evolution {
            final_graph: current,
            initial_energy,
            final_energy: energy,
            generations,
            termination,
            certificate,
        })
    }

    /// Cap the candidate pool. Without an exploration seed the first matches
    /// in (rule id, site) order are kept.
    fn select(&self, mut matches: Vec<RuleMatch>, generation: usize) -> Vec<RuleMatch> {
        let cap = self.config.max_candidates_per_generation.max(1);
        if matches.len() <= cap {
            return matches;
        }
        match self.config.exploration_seed {
            None => {
                matches.truncate(cap);
                matches
            }
            Some(seed) => {
                let mut rng = SmallRng::seed_from_u64(
                    seed ^ (generation as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                );
                let mut picked = rand::seq::index::sample(&mut rng, matches.len(), cap).into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| matches[i].clone()).collect()
            }
        }
    }

    /// Build and score one candidate per match, preserving match order.
    fn score(
        &self,
        current: &AtomGraph,
        current_energy: f64,
        matches: &[RuleMatch],
        evaluator: &EnergyEvaluator,
        ctx: &RuleContext,
    ) -> Result<Vec<Candidate>> {
        let build = |m: &RuleMatch| -> Result<Option<Candidate>> {
            let Some(rule) = self.rules.get(m.rule) else {
                return Ok(None);
            };
            if !rule.matches(current, &m.site) {
                return Ok(None);
            }
            let delta = rule.delta(current, &m.site, ctx);
            let graph = rule.apply(current, &m.site, ctx);
            graph
                .validate()
                .map_err(|reason| SynthesisError::RuleViolation { rule: m.rule, reason })?;
            let energy = evaluator.energy(&graph);
            Ok(Some(Candidate {
                graph,
                energy,
                applied: AppliedRule {
                    rule: m.rule,
                    site: m.site.clone(),
                    delta,
                    observed_delta: energy - current_energy,
                },
            }))
        };

        let built: Vec<Result<Option<Candidate>>> = if self.config.parallel_scoring {
            matches.par_iter().map(build).collect()
        } else {
            matches.iter().map(build).collect()
        };
        let mut out = Vec::with_capacity(built.len());
        for candidate in built {
            if let Some(c) = candidate? {
                out.push(c);
            }
        }
        Ok(out)
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Synthesize with the config the record implies.
pub fn synthesize(input: &InputRecord) -> Result<SynthesisResult> {
    let config = EngineConfig::for_input(input)?;
    Synthesizer::new(config).run(input)
}
