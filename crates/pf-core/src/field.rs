//! Field architecture: phase and curvature per synthesis stage.
//!
//! Phases follow golden-angle spacing, so adding a stage never moves the
//! phases already assigned. Curvature starts from a role default and sinks
//! with every constraint tag that touches the stage, bounded by a floor.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constants::{CURVATURE_FLOOR, CURVATURE_STEP, FULL_TURN_DEGREES, GOLDEN_ANGLE_DEGREES};
use crate::error::{Result, SynthesisError};

/// Pipeline role of a stage. Determines default curvature and which
/// constraint tags apply to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Input,
    Processing,
    Output,
}

impl StageRole {
    /// Role of stage `index` in a pipeline of `count` stages.
    pub fn for_position(index: usize, count: usize) -> Self {
        if index == 0 {
            StageRole::Input
        } else if index + 1 == count {
            StageRole::Output
        } else {
            StageRole::Processing
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageRole::Input => "input",
            StageRole::Processing => "processing",
            StageRole::Output => "output",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub role: StageRole,
    pub phase_degrees: f64,
    pub curvature: f64,
}

impl Stage {
    pub fn phase_radians(&self) -> f64 {
        self.phase_degrees.to_radians()
    }
}

/// Curvature parameters for the architect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub input_curvature: f64,
    pub processing_curvature: f64,
    pub output_curvature: f64,
    pub curvature_step: f64,
    pub curvature_floor: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            input_curvature: -0.2,
            processing_curvature: -0.4,
            output_curvature: -0.2,
            curvature_step: CURVATURE_STEP,
            curvature_floor: CURVATURE_FLOOR,
        }
    }
}

impl FieldConfig {
    fn default_curvature(&self, role: StageRole) -> f64 {
        match role {
            StageRole::Input => self.input_curvature,
            StageRole::Processing => self.processing_curvature,
            StageRole::Output => self.output_curvature,
        }
    }
}

/// Ordered stages of a synthesis pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldArchitecture {
    pub stages: Vec<Stage>,
}

impl FieldArchitecture {
    /// Build an architecture from explicit stages. Used by callers that
    /// already hold phases and curvatures (tests, stored runs).
    pub fn from_stages(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(SynthesisError::InvalidArgument(
                "architecture needs at least one stage".to_string(),
            ));
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Smallest angular gap between any two stage phases, in degrees.
    pub fn min_phase_gap(&self) -> f64 {
        let mut phases: Vec<f64> = self.stages.iter().map(|s| s.phase_degrees).collect();
        if phases.len() < 2 {
            return FULL_TURN_DEGREES;
        }
        phases.sort_by(f64::total_cmp);
        let wrap = FULL_TURN_DEGREES - phases[phases.len() - 1] + phases[0];
        phases
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(wrap, f64::min)
    }
}

/// Phase of stage `index` under golden-angle spacing, in [0, 360).
pub fn golden_phase(index: usize) -> f64 {
    (index as f64 * GOLDEN_ANGLE_DEGREES).rem_euclid(FULL_TURN_DEGREES)
}

/// Stage roles touched by a constraint tag. Unknown tags touch nothing.
fn constraint_roles(tag: &str) -> &'static [StageRole] {
    use StageRole::*;
    match tag {
        "parallel" | "low_memory" | "pure" | "vectorized" | "cache_friendly" => &[Processing],
        "io_bound" | "buffered_io" => &[Input, Output],
        "streaming" => &[Input, Processing],
        "low_latency" | "deterministic" => &[Input, Processing, Output],
        _ => &[],
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase().replace(['-', ' '], "_")
}

/// Build a field architecture with `stage_count` stages.
///
/// `names` supplies stage names in order; missing names default to
/// `stage-{i}`. The result is a pure function of its arguments.
pub fn build_architecture<S: AsRef<str>>(
    stage_count: usize,
    constraints: &[S],
    names: &[String],
    config: &FieldConfig,
) -> Result<FieldArchitecture> {
    if stage_count == 0 {
        return Err(SynthesisError::InvalidArgument(
            "stage count must be positive".to_string(),
        ));
    }

    let tags: BTreeSet<String> = constraints
        .iter()
        .map(|t| normalize_tag(t.as_ref()))
        .filter(|t| !t.is_empty())
        .collect();

    let stages = (0..stage_count)
        .map(|i| {
            let role = StageRole::for_position(i, stage_count);
            let applicable = tags
                .iter()
                .filter(|t| constraint_roles(t).contains(&role))
                .count();
            let curvature = (config.default_curvature(role)
                - config.curvature_step * applicable as f64)
                .max(config.curvature_floor);
            Stage {
                name: names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("stage-{i}")),
                role,
                phase_degrees: golden_phase(i),
                curvature,
            }
        })
        .collect();

    Ok(FieldArchitecture { stages })
}
