use thiserror::Error;

use crate::graph::CycleError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// Configuration-time structural errors ([`EngineError::InvalidConfig`],
/// [`EngineError::CyclicDependency`] on the initial graph) are fatal to
/// [`crate::Engine::initialize`]. The per-field kinds ([`EngineError::UnknownVariable`],
/// [`EngineError::InvalidFormulaSyntax`], [`EngineError::Evaluation`]) are non-fatal: they are
/// logged, attached to the pass report / snapshot, and the affected field keeps its previous
/// value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid configuration for field {field:?}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("circular dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("field {field:?} references unknown variable {variable:?}")]
    UnknownVariable { field: String, variable: String },

    #[error("invalid formula syntax in field {field:?} ({formula:?}): {reason}")]
    InvalidFormulaSyntax {
        field: String,
        formula: String,
        reason: String,
    },

    #[error("evaluation error in field {field:?}: {reason}")]
    Evaluation { field: String, reason: String },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("field {0:?} is derived from a formula and cannot be assigned directly")]
    DerivedFieldReadOnly(String),

    #[error("invalid value {value} for field {field:?}")]
    InvalidValue { field: String, value: f64 },

    #[error("value {value} rejected for field {field:?}: {reason}")]
    ValidationFailed {
        field: String,
        value: f64,
        reason: String,
    },
}

impl EngineError {
    /// Name of the field the error is attributed to, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            EngineError::InvalidConfig { field, .. }
            | EngineError::UnknownVariable { field, .. }
            | EngineError::InvalidFormulaSyntax { field, .. }
            | EngineError::Evaluation { field, .. }
            | EngineError::InvalidValue { field, .. }
            | EngineError::ValidationFailed { field, .. } => Some(field),
            EngineError::UnknownField(field) | EngineError::DerivedFieldReadOnly(field) => {
                Some(field)
            }
            EngineError::CyclicDependency { .. } => None,
        }
    }

    /// Whether the error leaves the engine fully functional (per-field diagnostics).
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownVariable { .. }
                | EngineError::InvalidFormulaSyntax { .. }
                | EngineError::Evaluation { .. }
        )
    }
}

impl From<CycleError> for EngineError {
    fn from(err: CycleError) -> Self {
        EngineError::CyclicDependency { path: err.path }
    }
}
