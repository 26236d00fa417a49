//! Atom catalog: the fixed registry of operation kinds.
//!
//! Every atom in a graph refers to one entry here. The catalog is plain data,
//! built once and shared by reference; nothing mutates it after construction.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Operation kind of an atom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtomOp {
    Load,
    Const,
    Arith,
    Transform,
    Branch,
    Call,
    Emit,
    IterNext,
    MapEach,
    Stream,
    ParDispatch,
    Opaque,
}

impl AtomOp {
    pub const ALL: [AtomOp; 12] = [
        AtomOp::Load,
        AtomOp::Const,
        AtomOp::Arith,
        AtomOp::Transform,
        AtomOp::Branch,
        AtomOp::Call,
        AtomOp::Emit,
        AtomOp::IterNext,
        AtomOp::MapEach,
        AtomOp::Stream,
        AtomOp::ParDispatch,
        AtomOp::Opaque,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AtomOp::Load => "LOAD",
            AtomOp::Const => "CONST",
            AtomOp::Arith => "ARITH",
            AtomOp::Transform => "TRANSFORM",
            AtomOp::Branch => "BRANCH",
            AtomOp::Call => "CALL",
            AtomOp::Emit => "EMIT",
            AtomOp::IterNext => "ITER_NEXT",
            AtomOp::MapEach => "MAP_EACH",
            AtomOp::Stream => "STREAM",
            AtomOp::ParDispatch => "PAR_DISPATCH",
            AtomOp::Opaque => "OPAQUE",
        }
    }

    /// Loop-shaped atoms own a body through control edges and iterate a collection.
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            AtomOp::IterNext | AtomOp::MapEach | AtomOp::Stream | AtomOp::ParDispatch
        )
    }

    /// Block headers own a body (loops plus conditionals).
    pub fn is_block(self) -> bool {
        self.is_loop() || self == AtomOp::Branch
    }

    /// Values known at compile time.
    pub fn is_constant(self) -> bool {
        matches!(self, AtomOp::Const | AtomOp::Load)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AtomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AtomOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AtomOp::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown atom kind: {s}"))
    }
}

/// Immutable catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AtomKind {
    pub op: AtomOp,
    pub name: &'static str,
    pub base_energy: f64,
    pub default_phase_degrees: f64,
    pub pure: bool,
    pub parallelizable: bool,
}

impl AtomKind {
    const fn new(
        op: AtomOp,
        name: &'static str,
        base_energy: f64,
        default_phase_degrees: f64,
        pure: bool,
        parallelizable: bool,
    ) -> Self {
        Self {
            op,
            name,
            base_energy,
            default_phase_degrees,
            pure,
            parallelizable,
        }
    }
}

/// Registry of all atom kinds, indexed by `AtomOp` for O(1) lookup.
#[derive(Clone, Debug)]
pub struct AtomCatalog {
    kinds: Vec<AtomKind>,
}

static STANDARD: LazyLock<AtomCatalog> = LazyLock::new(AtomCatalog::build_standard);

impl AtomCatalog {
    /// The process-wide standard catalog.
    pub fn standard() -> &'static AtomCatalog {
        &STANDARD
    }

    fn build_standard() -> Self {
        use AtomOp::*;
        let kinds = vec![
            AtomKind::new(Load, "LOAD", 0.0, 0.0, true, true),
            AtomKind::new(Const, "CONST", 0.5, 0.0, true, true),
            AtomKind::new(Arith, "ARITH", 1.0, 45.0, true, true),
            AtomKind::new(Transform, "TRANSFORM", 1.0, 90.0, true, true),
            AtomKind::new(Branch, "BRANCH", 1.5, 135.0, false, false),
            AtomKind::new(Call, "CALL", 3.0, 180.0, false, false),
            AtomKind::new(Emit, "EMIT", 2.0, 225.0, false, false),
            AtomKind::new(IterNext, "ITER_NEXT", 5.0, 270.0, false, false),
            AtomKind::new(MapEach, "MAP_EACH", 5.0, 270.0, false, true),
            AtomKind::new(Stream, "STREAM", 5.0, 300.0, false, false),
            AtomKind::new(ParDispatch, "PAR_DISPATCH", 15.0, 315.0, false, false),
            AtomKind::new(Opaque, "OPAQUE", 4.0, 0.0, false, false),
        ];
        debug_assert!(kinds.iter().enumerate().all(|(i, k)| k.op.index() == i));
        Self { kinds }
    }

    pub fn get(&self, op: AtomOp) -> &AtomKind {
        &self.kinds[op.index()]
    }

    pub fn base_energy(&self, op: AtomOp) -> f64 {
        self.get(op).base_energy
    }

    pub fn iter(&self) -> impl Iterator<Item = &AtomKind> {
        self.kinds.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_matches_op() {
        let catalog = AtomCatalog::standard();
        for op in AtomOp::ALL {
            assert_eq!(catalog.get(op).op, op);
            assert_eq!(catalog.get(op).name, op.as_str());
        }
    }

    #[test]
    fn test_energies_non_negative_and_phases_in_range() {
        for kind in AtomCatalog::standard().iter() {
            assert!(kind.base_energy >= 0.0, "{} has negative energy", kind.name);
            assert!((0.0..360.0).contains(&kind.default_phase_degrees));
        }
    }

    #[test]
    fn test_opaque_is_inert() {
        let opaque = AtomCatalog::standard().get(AtomOp::Opaque);
        assert!(!opaque.pure);
        assert!(!opaque.parallelizable);
    }

    #[test]
    fn test_parse_roundtrip_names() {
        assert_eq!("iter_next".parse::<AtomOp>().unwrap(), AtomOp::IterNext);
        assert_eq!("PAR_DISPATCH".parse::<AtomOp>().unwrap(), AtomOp::ParDispatch);
        assert!("GOTO".parse::<AtomOp>().is_err());
    }

    #[test]
    fn test_serde_uses_catalog_names() {
        let json = serde_json::to_string(&AtomOp::MapEach).unwrap();
        assert_eq!(json, "\"MAP_EACH\"");
    }

    #[test]
    fn test_loop_classification() {
        assert!(AtomOp::IterNext.is_loop());
        assert!(AtomOp::ParDispatch.is_loop());
        assert!(!AtomOp::Branch.is_loop());
        assert!(AtomOp::Branch.is_block());
        assert!(AtomOp::Load.is_constant());
    }
}
