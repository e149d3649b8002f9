#![no_main]

use libfuzzer_sys::fuzz_target;

use formula_reactive::eval::Evaluator;
use formula_reactive::parser::parse_formula;

const MAX_FORMULA_CHARS: usize = 2_048;

fn truncate_to_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Deterministic value for any identifier, with `missing` left unresolved.
fn resolve(name: &str) -> Option<f64> {
    if name == "missing" {
        return None;
    }
    let hash = name
        .bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
    Some(((hash % 20_000) as f64) / 10.0 - 1_000.0)
}

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    let formula = truncate_to_chars(&input, MAX_FORMULA_CHARS);

    let Ok(expr) = parse_formula(formula) else {
        return;
    };
    // Errors are fine; results must never be NaN or infinite.
    if let Ok(value) = Evaluator::new(&resolve).eval(&expr) {
        assert!(value.is_finite(), "{formula:?} evaluated to {value}");
    }
});
