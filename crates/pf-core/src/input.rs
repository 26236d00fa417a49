//! The already-parsed task record the engine consumes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_CANDIDATES, DEFAULT_MAX_GENERATIONS};
use crate::error::{Result, SynthesisError};

/// Stage names used when the record declares none.
pub const DEFAULT_STAGES: [&str; 3] = ["input", "transform", "output"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Python,
    Rust,
    Cpp,
    Julia,
    JavaScript,
    Go,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Python => "python",
            Target::Rust => "rust",
            Target::Cpp => "cpp",
            Target::Julia => "julia",
            Target::JavaScript => "javascript",
            Target::Go => "go",
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Target::Python),
            "rust" | "rs" => Ok(Target::Rust),
            "cpp" | "c++" | "cxx" => Ok(Target::Cpp),
            "julia" | "jl" => Ok(Target::Julia),
            "javascript" | "js" => Ok(Target::JavaScript),
            "go" | "golang" => Ok(Target::Go),
            other => Err(format!("unknown target '{other}'")),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search effort preset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    FastCompile,
    Balanced,
    Optimal,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::FastCompile => "fast_compile",
            Quality::Balanced => "balanced",
            Quality::Optimal => "optimal",
        }
    }

    /// (max generations, max candidates per generation)
    pub fn budget(self) -> (usize, usize) {
        match self {
            Quality::FastCompile => (10, 16),
            Quality::Balanced => (DEFAULT_MAX_GENERATIONS, DEFAULT_MAX_CANDIDATES),
            Quality::Optimal => (200, 256),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fast_compile" | "fast" => Ok(Quality::FastCompile),
            "balanced" => Ok(Quality::Balanced),
            "optimal" => Ok(Quality::Optimal),
            other => Err(format!("unknown quality '{other}'")),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthesis request. Target and quality stay textual so an unknown value
/// surfaces as `InvalidSpec` rather than a deserialization failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRecord {
    pub task: String,
    pub constraints: Vec<String>,
    pub target: String,
    pub quality: String,
    /// Seed program in the template language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Wall-clock budget in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_target: Option<f64>,
    /// Stage names in pipeline order. Empty means [`DEFAULT_STAGES`].
    pub stages: Vec<String>,
    /// Element count for loops without their own annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_count: Option<u64>,
}

impl Default for InputRecord {
    fn default() -> Self {
        Self {
            task: String::new(),
            constraints: Vec::new(),
            target: Target::Python.as_str().to_string(),
            quality: Quality::Balanced.as_str().to_string(),
            template: None,
            max_time: None,
            energy_target: None,
            stages: Vec::new(),
            element_count: None,
        }
    }
}

impl InputRecord {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SynthesisError::InvalidSpec(e.to_string()))
    }

    pub fn target(&self) -> Result<Target> {
        self.target.parse().map_err(SynthesisError::InvalidSpec)
    }

    pub fn quality(&self) -> Result<Quality> {
        self.quality.parse().map_err(SynthesisError::InvalidSpec)
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    /// Stage names, falling back to the default three-stage pipeline.
    pub fn stage_names(&self) -> Vec<String> {
        if self.stages.is_empty() {
            DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
        } else {
            self.stages.clone()
        }
    }

    /// Reject records the engine cannot act on.
    pub fn validate(&self) -> Result<(Target, Quality)> {
        if self.task.trim().is_empty() {
            return Err(SynthesisError::InvalidSpec("task is empty".to_string()));
        }
        let target = self.target()?;
        let quality = self.quality()?;
        if let Some(t) = self.max_time {
            if Duration::try_from_secs_f64(t).is_err() {
                return Err(SynthesisError::InvalidSpec(format!(
                    "max_time must be a non-negative number of seconds, got {t}"
                )));
            }
        }
        if self.energy_target.is_some_and(|e| !e.is_finite()) {
            return Err(SynthesisError::InvalidSpec(
                "energy_target must be finite".to_string(),
            ));
        }
        if self.stages.iter().any(|s| s.trim().is_empty()) {
            return Err(SynthesisError::InvalidSpec(
                "stage names must not be blank".to_string(),
            ));
        }
        Ok((target, quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_task_rejected() {
        let err = InputRecord::new("   ").validate().unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidSpec(_)));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut rec = InputRecord::new("sum numbers");
        rec.target = "cobol".to_string();
        let err = rec.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid spec: unknown target 'cobol'");
    }

    #[test]
    fn test_unknown_quality_rejected() {
        let mut rec = InputRecord::new("sum numbers");
        rec.quality = "ludicrous".to_string();
        assert!(matches!(
            rec.validate().unwrap_err(),
            SynthesisError::InvalidSpec(_)
        ));
    }

    #[test]
    fn test_target_aliases() {
        assert_eq!("C++".parse::<Target>().unwrap(), Target::Cpp);
        assert_eq!("Julia".parse::<Target>().unwrap(), Target::Julia);
        assert_eq!("fast-compile".parse::<Quality>().unwrap(), Quality::FastCompile);
    }

    #[test]
    fn test_defaults_from_sparse_json() {
        let rec = InputRecord::from_json(r#"{"task": "resize images"}"#).unwrap();
        assert_eq!(rec.validate().unwrap(), (Target::Python, Quality::Balanced));
        assert_eq!(rec.stage_names(), vec!["input", "transform", "output"]);
    }

    #[test]
    fn test_negative_max_time_rejected() {
        let mut rec = InputRecord::new("t");
        rec.max_time = Some(-1.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_max_time_rejected() {
        let rec = InputRecord {
            max_time: Some(1e30),
            ..InputRecord::new("t")
        };
        assert!(matches!(rec.validate(), Err(SynthesisError::InvalidSpec(_))));
        assert_eq!(rec.max_time(), None);

        let rec = InputRecord {
            max_time: Some(f64::NAN),
            ..InputRecord::new("t")
        };
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_quality_budgets() {
        assert_eq!(Quality::FastCompile.budget(), (10, 16));
        assert_eq!(Quality::Balanced.budget(), (50, 64));
        assert_eq!(Quality::Optimal.budget(), (200, 256));
    }
}
