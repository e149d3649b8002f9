//! Stateless numeric helpers: precision rounding, range validation and display formatting.

use serde::{Deserialize, Serialize};

/// Range/precision constraints for values written to an input field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Maximum number of decimal places.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

/// Round `value` to `precision` decimal places (half away from zero).
#[must_use]
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(15) as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// Check `value` against `rule`, returning a human readable reason on failure.
pub fn validate_number_range(value: f64, rule: &ValidationRule) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("{value} is not a finite number"));
    }
    if let Some(min) = rule.min {
        if value < min {
            return Err(format!("{value} is below the minimum {min}"));
        }
    }
    if let Some(max) = rule.max {
        if value > max {
            return Err(format!("{value} is above the maximum {max}"));
        }
    }
    if let Some(precision) = rule.precision {
        if round_to_precision(value, precision) != value {
            return Err(format!("{value} has more than {precision} decimal place(s)"));
        }
    }
    Ok(())
}

/// Format `value` with a fixed number of decimals, optional thousands separators and a unit
/// suffix, e.g. `1,234.50元`.
#[must_use]
pub fn format_number(value: f64, precision: u32, unit: &str, thousands_separator: bool) -> String {
    let fixed = format!("{value:.prec$}", prec = precision as usize);
    if !thousands_separator {
        return format!("{fixed}{unit}");
    }

    let (sign, digits) = match fixed.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", fixed.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac)) => (int_part, Some(frac)),
        None => (digits, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(frac) => format!("{sign}{grouped}.{frac}{unit}"),
        None => format!("{sign}{grouped}{unit}"),
    }
}
