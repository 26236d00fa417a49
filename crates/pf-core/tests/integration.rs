//! Integration tests exercising the full synthesis pipeline:
//! input record → architecture → decomposition → evolution → certificate.

use approx::assert_abs_diff_eq;
use pf_core::{
    AtomCatalog, AtomOp, ConvergenceReason, EnergyConfig, EnergyEvaluator, EngineConfig,
    FieldConfig, InputRecord, OutlineRenderer, Renderer, RuleId, SynthesisError, Synthesizer,
    Termination, build_architecture, export_json, import_json, synthesize,
};
use proptest::prelude::*;

const FUSION_SEED: &str = "\
for x in items:
    scale(x)
for y in items:
    clamp(y)
";

const PIPELINE_SEED: &str = "\
rows = read(\"input.csv\")
scaled = map r in rows:  # n=4000
    normalize(r)
for s in scaled:
    write(s)
limit = 10
half = limit / 2
emit half
";

fn flat_field() -> FieldConfig {
    FieldConfig {
        input_curvature: 0.0,
        processing_curvature: 0.0,
        output_curvature: 0.0,
        ..FieldConfig::default()
    }
}

fn with_seed(seed: &str) -> InputRecord {
    InputRecord {
        template: Some(seed.to_string()),
        ..InputRecord::new("integration task")
    }
}

/// Two adjacent loops over one collection fuse in a single generation.
#[test]
fn loop_fusion_scenario() {
    let config = EngineConfig {
        field: flat_field(),
        ..EngineConfig::default()
    };
    let result = Synthesizer::new(config).run(&with_seed(FUSION_SEED)).unwrap();

    assert_eq!(result.generations, 1);
    assert_eq!(result.final_graph.count_op(AtomOp::IterNext), 1);
    assert_eq!(result.final_graph.count_op(AtomOp::Transform), 2);
    assert_abs_diff_eq!(result.final_energy, result.initial_energy - 5.0, epsilon = 1e-9);

    let entries = result.certificate.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].rules_applied.len(), 1);
    assert_eq!(entries[0].rules_applied[0].rule, RuleId::LOOP_FUSION);
    assert_abs_diff_eq!(entries[0].rules_applied[0].delta, -5.0);
}

/// A blank task never reaches the engine.
#[test]
fn empty_task_scenario() {
    let err = synthesize(&InputRecord::new("")).unwrap_err();
    assert!(matches!(err, SynthesisError::InvalidSpec(_)));
}

/// A time budget too large for a Duration is refused instead of panicking.
#[test]
fn huge_time_budget_scenario() {
    let input = InputRecord {
        max_time: Some(1e30),
        ..with_seed(FUSION_SEED)
    };
    let err = synthesize(&input).unwrap_err();
    assert!(matches!(err, SynthesisError::InvalidSpec(_)));
}

/// Materialized map, I/O loop and constant arithmetic all get rewritten.
#[test]
fn pipeline_rewrites_and_replays() {
    let result = synthesize(&with_seed(PIPELINE_SEED)).unwrap();
    let rules = result.certificate.rule_sequence();
    assert!(rules.contains(&RuleId::STREAM_CONVERSION));
    assert!(rules.contains(&RuleId::CONSTANT_FOLD));
    assert!(result.termination.is_converged());
    assert_eq!(result.final_graph.count_op(AtomOp::Stream), 1);
    assert_eq!(result.final_graph.count_op(AtomOp::Arith), 0);

    let engine = Synthesizer::default();
    let replayed = result
        .certificate
        .replay(&result.initial_graph, engine.rules(), &engine.rule_context())
        .unwrap();
    assert_eq!(replayed, result.final_graph);

    let energy = EnergyConfig::default();
    let eval = EnergyEvaluator::new(AtomCatalog::standard(), &result.architecture, &energy);
    result
        .certificate
        .verify(
            &result.initial_graph,
            &result.final_graph,
            engine.rules(),
            &engine.rule_context(),
            &eval,
        )
        .unwrap();
}

/// Export, import, and the imported certificate still replays.
#[test]
fn export_import_replays() {
    let result = synthesize(&with_seed(PIPELINE_SEED)).unwrap();
    let json = export_json(&result).unwrap();
    let back = import_json(&json).unwrap();
    let engine = Synthesizer::default();
    let replayed = back
        .certificate
        .replay(&back.initial_graph, engine.rules(), &engine.rule_context())
        .unwrap();
    assert_eq!(replayed, result.final_graph);
}

/// OPAQUE statements survive synthesis verbatim and block rewrites around them.
#[test]
fn opaque_atoms_are_inert() {
    let seed = "for x in items:\n    launch rockets\nfor y in items:\n    g(y)\n";
    let result = synthesize(&with_seed(seed)).unwrap();
    assert!(!result.certificate.rule_sequence().contains(&RuleId::LOOP_FUSION));
    let text = OutlineRenderer::default().render(&result.final_graph, &result.architecture);
    assert!(text.contains("    launch rockets\n"), "got {text}");
}

/// Without a seed the skeleton still synthesizes.
#[test]
fn skeleton_synthesis() {
    let input = InputRecord {
        stages: vec!["load".into(), "resize".into(), "encode".into(), "store".into()],
        element_count: Some(2000),
        ..InputRecord::new("resize a folder of images")
    };
    let result = synthesize(&input).unwrap();
    assert_eq!(result.architecture.len(), 4);
    assert!(result.final_energy < result.initial_energy);
    assert_eq!(result.final_graph.count_op(AtomOp::MapEach), 0);
}

/// Quality preset budgets bound the generation count.
#[test]
fn fast_compile_budget() {
    let mut seed = String::new();
    for i in 0..30 {
        seed.push_str(&format!("unused{i} = {i}\n"));
    }
    let input = InputRecord {
        quality: "fast_compile".to_string(),
        ..with_seed(&seed)
    };
    let result = synthesize(&input).unwrap();
    assert_eq!(result.generations, 10);
    assert_eq!(
        result.termination,
        Termination::BudgetExhausted(pf_core::Budget::Generations)
    );
}

// --- Properties ---

const BLOCKS: &[&str] = &[
    "items = read(\"a\")",
    "for x in items:\n    f(x)",
    "for y in items:\n    g(y)",
    "ys = map z in items:  # n=200\n    h(z)",
    "map w in items:\n    k(w)",
    "c = 3",
    "d = c * 2",
    "e = d + c",
    "print(ys)",
    "if c:\n    write(c)",
    "emit d",
    "do something unusual",
];

fn seed_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(0..BLOCKS.len(), 1..10)
        .prop_map(|picks| picks.iter().map(|&i| BLOCKS[i]).collect::<Vec<_>>().join("\n"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_synthesis_is_deterministic(seed in seed_strategy()) {
        let a = synthesize(&with_seed(&seed)).unwrap();
        let b = synthesize(&with_seed(&seed)).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_energy_never_increases(seed in seed_strategy()) {
        let result = synthesize(&with_seed(&seed)).unwrap();
        for entry in result.certificate.entries() {
            prop_assert!(entry.selected_energy < entry.previous_energy);
        }
        prop_assert!(result.final_energy <= result.initial_energy);
        prop_assert!(result.generations <= EngineConfig::default().max_generations);
    }

    #[test]
    fn prop_certificate_replays_to_final_graph(seed in seed_strategy()) {
        let result = synthesize(&with_seed(&seed)).unwrap();
        let engine = Synthesizer::default();
        let replayed = result
            .certificate
            .replay(&result.initial_graph, engine.rules(), &engine.rule_context())
            .unwrap();
        prop_assert_eq!(replayed, result.final_graph);
    }

    #[test]
    fn prop_local_minimum_is_stable(seed in seed_strategy()) {
        let result = synthesize(&with_seed(&seed)).unwrap();
        if result.termination == Termination::Converged(ConvergenceReason::LocalMinimum) {
            let again = Synthesizer::default()
                .evolve(&result.final_graph, &result.architecture)
                .unwrap();
            prop_assert_eq!(again.generations, 0);
        }
    }

    #[test]
    fn prop_phase_gaps_stay_open(n in 2usize..300) {
        let arch = build_architecture::<&str>(n, &[], &[], &FieldConfig::default()).unwrap();
        let bound = 0.4 * 360.0 / n as f64;
        prop_assert!(arch.min_phase_gap() >= bound, "n={} gap={}", n, arch.min_phase_gap());
    }
}
