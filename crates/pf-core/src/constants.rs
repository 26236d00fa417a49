/// Golden angle in degrees: 360 / φ², rounded as the stage generator uses it.
pub const GOLDEN_ANGLE_DEGREES: f64 = 137.508;

/// Full turn in degrees.
pub const FULL_TURN_DEGREES: f64 = 360.0;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Energy released by removing one loop-overhead atom during fusion.
pub const LOOP_FUSION_SAVING: f64 = 5.0;

/// Element count assumed for loops that carry no `n` attribute.
pub const DEFAULT_ELEMENT_COUNT: u64 = 1000;

/// Cost per element of materializing loop output into a collection.
pub const MATERIALIZE_COST_PER_ELEMENT: f64 = 0.5;

/// Cost per element of dispatching one element-wise iteration.
pub const DISPATCH_COST_PER_ELEMENT: f64 = 0.05;

/// Worker count assumed by the parallelization rule.
pub const DEFAULT_CORE_COUNT: u32 = 4;

/// Coupling coefficients per dependency edge kind.
pub const COUPLING_DATA: f64 = 0.5;
pub const COUPLING_CONTROL: f64 = 0.25;
pub const COUPLING_SEQUENCING: f64 = 0.1;

/// Weight of the sin² phase-interference term within a parallel group.
pub const INTERFERENCE_WEIGHT: f64 = 1.0;

/// Curvature step applied per constraint tag that touches a stage.
pub const CURVATURE_STEP: f64 = 0.1;

/// Curvature never drops below this, however many constraints apply.
pub const CURVATURE_FLOOR: f64 = -1.0;

/// Default generation budget for the evolutionary loop.
pub const DEFAULT_MAX_GENERATIONS: usize = 50;

/// Default cap on candidates scored per generation.
pub const DEFAULT_MAX_CANDIDATES: usize = 64;
