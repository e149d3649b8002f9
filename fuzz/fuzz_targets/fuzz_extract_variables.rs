#![no_main]

use libfuzzer_sys::fuzz_target;

use formula_reactive::parser::{check_formula, extract_variables, is_function_name, lex};

const MAX_FORMULA_CHARS: usize = 4_096;

fn truncate_to_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    let formula = truncate_to_chars(&input, MAX_FORMULA_CHARS);

    for token in lex(formula) {
        assert!(token.offset <= formula.len());
    }

    let vars = extract_variables(formula);
    for var in &vars {
        assert!(!is_function_name(var), "function name {var:?} reported as variable");
        assert!(formula.contains(var.as_str()));
    }

    // Anything that checks out must also yield the same variables on a second extraction.
    if check_formula(formula).is_ok() {
        assert_eq!(vars, extract_variables(formula));
    }
});
