use thiserror::Error;

use crate::parser::{BinaryOp, Expr, UnaryOp, MAX_EXPR_DEPTH};

/// Supplies current field values to the [`Evaluator`].
pub trait ValueResolver {
    fn value(&self, name: &str) -> Option<f64>;
}

impl<F> ValueResolver for F
where
    F: Fn(&str) -> Option<f64>,
{
    fn value(&self, name: &str) -> Option<f64> {
        self(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{name}() expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: &'static str,
        actual: usize,
    },

    #[error("{0}")]
    Domain(String),

    #[error("expression depth exceeds the limit of {0}")]
    TooDeep(usize),
}

pub struct Evaluator<'a, R: ValueResolver + ?Sized> {
    resolver: &'a R,
}

impl<'a, R: ValueResolver + ?Sized> Evaluator<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Evaluate `expr` to a finite number.
    ///
    /// `NaN` and infinite intermediate results are reported as [`EvalError::Domain`]. Trees taller
    /// than [`MAX_EXPR_DEPTH`] (never produced by the parser) fail with [`EvalError::TooDeep`].
    pub fn eval(&self, expr: &Expr) -> Result<f64, EvalError> {
        self.eval_at(expr, 1)
    }

    fn eval_at(&self, expr: &Expr, depth: usize) -> Result<f64, EvalError> {
        if depth > MAX_EXPR_DEPTH {
            return Err(EvalError::TooDeep(MAX_EXPR_DEPTH));
        }
        let value = match expr {
            Expr::Number(n) => *n,
            Expr::Variable(name) => self
                .resolver
                .value(name)
                .ok_or_else(|| EvalError::UnknownVariable(name.clone()))?,
            Expr::Unary { op, expr } => {
                let v = self.eval_at(expr, depth + 1)?;
                match op {
                    UnaryOp::Plus => v,
                    UnaryOp::Negate => -v,
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval_at(left, depth + 1)?;
                let r = self.eval_at(right, depth + 1)?;
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Subtract => l - r,
                    BinaryOp::Multiply => l * r,
                    BinaryOp::Divide => {
                        if r == 0.0 {
                            return Err(EvalError::Domain(format!("division by zero ({l} / {r})")));
                        }
                        l / r
                    }
                }
            }
            Expr::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval_at(arg, depth + 1))
                    .collect::<Result<Vec<f64>, EvalError>>()?;
                call_function(name, &args)?
            }
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err(EvalError::Domain(format!(
                "non-finite result {value} from {}",
                describe(expr)
            )))
        }
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Number(n) => n.to_string(),
        Expr::Variable(name) => name.clone(),
        Expr::Call { name, .. } => format!("{name}()"),
        Expr::Unary { .. } => "unary expression".to_string(),
        Expr::Binary { op, .. } => format!("`{op}` expression"),
    }
}

fn unary(name: &str, args: &[f64]) -> Result<f64, EvalError> {
    match args {
        [x] => Ok(*x),
        _ => Err(EvalError::Arity {
            name: name.to_string(),
            expected: "1",
            actual: args.len(),
        }),
    }
}

fn call_function(name: &str, args: &[f64]) -> Result<f64, EvalError> {
    match name {
        "sin" => Ok(unary(name, args)?.sin()),
        "cos" => Ok(unary(name, args)?.cos()),
        "tan" => Ok(unary(name, args)?.tan()),
        "abs" => Ok(unary(name, args)?.abs()),
        "floor" => Ok(unary(name, args)?.floor()),
        "ceil" => Ok(unary(name, args)?.ceil()),
        // Half-way cases round towards +inf.
        "round" => Ok((unary(name, args)? + 0.5).floor()),
        "sqrt" => {
            let x = unary(name, args)?;
            if x < 0.0 {
                return Err(EvalError::Domain(format!("sqrt of negative number {x}")));
            }
            Ok(x.sqrt())
        }
        "pow" => match args {
            [base, exp] => Ok(base.powf(*exp)),
            _ => Err(EvalError::Arity {
                name: name.to_string(),
                expected: "2",
                actual: args.len(),
            }),
        },
        "min" | "max" => {
            if args.is_empty() {
                return Err(EvalError::Arity {
                    name: name.to_string(),
                    expected: "at least 1",
                    actual: 0,
                });
            }
            let fold: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
            Ok(args.iter().copied().fold(args[0], fold))
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_formula;
    use std::collections::HashMap;

    fn eval_with(formula: &str, vars: &[(&str, f64)]) -> Result<f64, EvalError> {
        let vars: HashMap<String, f64> = vars.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let resolver = |name: &str| vars.get(name).copied();
        let expr = parse_formula(formula).expect("formula parses");
        Evaluator::new(&resolver).eval(&expr)
    }

    #[test]
    fn evaluates_arithmetic() {
        assert_eq!(eval_with("qty * price", &[("qty", 20.0), ("price", 2.0)]), Ok(40.0));
        assert_eq!(eval_with("-a + 10 / 4", &[("a", 1.0)]), Ok(1.5));
        assert_eq!(eval_with("(1 + 2) * 3", &[]), Ok(9.0));
    }

    #[test]
    fn evaluates_function_vocabulary() {
        assert_eq!(eval_with("pow(2, 10)", &[]), Ok(1024.0));
        assert_eq!(eval_with("max(1, x, 3)", &[("x", 7.0)]), Ok(7.0));
        assert_eq!(eval_with("min(4, -2)", &[]), Ok(-2.0));
        assert_eq!(eval_with("round(2.5) + floor(1.9) + ceil(1.1)", &[]), Ok(6.0));
        assert_eq!(eval_with("abs(-3) + sqrt(16)", &[]), Ok(7.0));
        assert_eq!(eval_with("sin(0) + cos(0) + tan(0)", &[]), Ok(1.0));
    }

    #[test]
    fn reports_unknown_variables() {
        assert_eq!(
            eval_with("a + missing", &[("a", 1.0)]),
            Err(EvalError::UnknownVariable("missing".into()))
        );
    }

    #[test]
    fn reports_domain_errors() {
        assert!(matches!(eval_with("sqrt(-1)", &[]), Err(EvalError::Domain(_))));
        assert!(matches!(eval_with("1 / (a - a)", &[("a", 3.0)]), Err(EvalError::Domain(_))));
        assert!(matches!(eval_with("pow(-8, 0.5)", &[]), Err(EvalError::Domain(_))));
    }

    #[test]
    fn reports_arity_errors() {
        assert!(matches!(eval_with("pow(2)", &[]), Err(EvalError::Arity { .. })));
        assert!(matches!(eval_with("sqrt(1, 2)", &[]), Err(EvalError::Arity { .. })));
        assert!(matches!(eval_with("max()", &[]), Err(EvalError::Arity { .. })));
    }

    #[test]
    fn hand_built_trees_past_the_depth_limit_fail() {
        let mut expr = Expr::Variable("a".into());
        for _ in 0..MAX_EXPR_DEPTH {
            expr = Expr::Unary {
                op: UnaryOp::Negate,
                expr: Box::new(expr),
            };
        }
        let resolver = |_: &str| Some(1.0);
        assert_eq!(
            Evaluator::new(&resolver).eval(&expr),
            Err(EvalError::TooDeep(MAX_EXPR_DEPTH))
        );
        let Expr::Unary { expr: inner, .. } = expr else {
            panic!("expected unary expression");
        };
        assert!(Evaluator::new(&resolver).eval(&inner).is_ok());
    }
}
