use std::fmt;

use crate::rules::RuleId;

/// Every way a synthesis run can fail. Budget exhaustion is not here: it is a
/// successful termination carried on the result.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisError {
    /// The input record is unusable (blank task, unknown target or quality).
    InvalidSpec(String),
    /// A caller passed an argument outside the operation's domain.
    InvalidArgument(String),
    /// The seed or task could not be turned into a valid atom graph.
    Decomposition {
        line: usize,
        construct: String,
        reason: String,
    },
    /// A rule produced a graph that breaks the graph invariants. This is a
    /// defect in the rule set.
    RuleViolation { rule: RuleId, reason: String },
    /// A recorded certificate did not reproduce against the given graph.
    ReplayMismatch { generation: usize, reason: String },
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisError::InvalidSpec(msg) => write!(f, "invalid spec: {msg}"),
            SynthesisError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            SynthesisError::Decomposition {
                line,
                construct,
                reason,
            } => {
                if *line == 0 {
                    write!(f, "decomposition error at `{construct}`: {reason}")
                } else {
                    write!(f, "decomposition error on line {line} `{construct}`: {reason}")
                }
            }
            SynthesisError::RuleViolation { rule, reason } => {
                write!(f, "rule {rule} produced an invalid graph: {reason}")
            }
            SynthesisError::ReplayMismatch { generation, reason } => {
                write!(f, "replay diverged at generation {generation}: {reason}")
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

pub type Result<T> = std::result::Result<T, SynthesisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_violation_names_rule() {
        let err = SynthesisError::RuleViolation {
            rule: RuleId::LOOP_FUSION,
            reason: "dangling edge".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("loop-fusion"), "got {msg}");
        assert!(msg.contains("dangling edge"));
    }

    #[test]
    fn test_decomposition_reports_line() {
        let err = SynthesisError::Decomposition {
            line: 3,
            construct: "for x in xs:".to_string(),
            reason: "block has no body".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "decomposition error on line 3 `for x in xs:`: block has no body"
        );
    }
}
