//! Phase-field program synthesis engine.
//!
//! Places a program's primitive operations ("atoms") on a scalar field over a
//! few synthesis stages, then searches semantics-preserving graph rewrites
//! that lower the total energy. Stage phases follow golden-angle spacing;
//! constraints deepen stage curvature. Every accepted rewrite is recorded in
//! a certificate that replays to the same final graph.
//!
//! Zero I/O: a pure engine with no opinions about transport or persistence.

pub mod catalog;
pub mod certificate;
pub mod constants;
pub mod decompose;
pub mod energy;
pub mod engine;
pub mod error;
pub mod field;
pub mod graph;
pub mod input;
pub mod render;
pub mod rules;
pub mod serde_compat;

pub use catalog::{AtomCatalog, AtomKind, AtomOp};
pub use certificate::{Alternative, AppliedRule, Certificate, CertificateEntry};
pub use constants::{DEFAULT_CORE_COUNT, GOLDEN_ANGLE_DEGREES};
pub use decompose::{TaskHint, decompose};
pub use energy::{EnergyBreakdown, EnergyConfig, EnergyEvaluator};
pub use engine::{
    Budget, ConvergenceReason, EngineConfig, EngineState, Evolution, SynthesisResult, Synthesizer,
    Termination, synthesize,
};
pub use error::{Result, SynthesisError};
pub use field::{FieldArchitecture, FieldConfig, Stage, StageRole, build_architecture};
pub use graph::{AtomGraph, AtomNode, AttrValue, Edge, EdgeKind, NodeId};
pub use input::{InputRecord, Quality, Target};
pub use render::{OutlineRenderer, Renderer};
pub use rules::{RuleContext, RuleId, RuleMatch, RuleSet, TransformationRule};
pub use serde_compat::{CURRENT_VERSION, export_json, import_json};
