use formula_reactive::{
    extract_variables, validate_formula, Engine, EngineOptions, ManualClock, RawConfig, RawField,
    Snapshot,
};
use proptest::prelude::*;

const INPUTS: [&str; 3] = ["a", "b", "c"];

/// Inputs `a`, `b`, `c` feeding a fixed layered set of derived fields.
fn layered_config() -> RawConfig {
    RawConfig::new()
        .field("a", RawField::input(1.0))
        .field("b", RawField::input(2.0))
        .field("c", RawField::input(3.0))
        .field("ab", RawField::derived("a * b"))
        .field("bc", RawField::derived("b - c / 2"))
        .field("mix", RawField::derived("max(ab, bc) + abs(a - c)"))
        .field("scaled", RawField::derived("mix * 1.5 + round(ab)").with_precision(3))
}

fn run(writes: &[(usize, i32)]) -> Snapshot {
    let clock = ManualClock::new();
    let mut engine =
        Engine::initialize_with(layered_config(), EngineOptions::default(), clock).unwrap();
    for (idx, (input, value)) in writes.iter().enumerate() {
        engine.set(INPUTS[*input], f64::from(*value)).unwrap();
        if idx % 3 == 2 {
            engine.flush().unwrap();
        }
    }
    engine.flush().unwrap();
    engine.snapshot()
}

fn expected_scaled(a: f64, b: f64, c: f64) -> f64 {
    let ab = a * b;
    let bc = b - c / 2.0;
    let mix = ab.max(bc) + (a - c).abs();
    let scaled = mix * 1.5 + (ab + 0.5).floor();
    (scaled * 1000.0).round() / 1000.0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn same_writes_give_identical_snapshots(
        writes in prop::collection::vec((0usize..3, -50i32..50), 0..12)
    ) {
        prop_assert_eq!(run(&writes), run(&writes));
    }

    #[test]
    fn derived_fields_match_direct_evaluation(
        writes in prop::collection::vec((0usize..3, -50i32..50), 1..12)
    ) {
        let snapshot = run(&writes);
        let a = snapshot.value("a").unwrap();
        let b = snapshot.value("b").unwrap();
        let c = snapshot.value("c").unwrap();
        prop_assert_eq!(snapshot.value("ab"), Some(a * b));
        prop_assert_eq!(snapshot.value("scaled"), Some(expected_scaled(a, b, c)));
        prop_assert!(snapshot.errors().is_empty());
    }

    #[test]
    fn extraction_never_panics_and_skips_functions(formula in "[a-z_0-9+*/(), .-]{0,40}") {
        let vars = extract_variables(&formula);
        for name in ["sin", "cos", "sqrt", "pow", "min", "max"] {
            prop_assert!(!vars.contains(name));
        }
        let _ = validate_formula(&formula);
    }
}
