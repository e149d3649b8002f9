#![forbid(unsafe_code)]
#![deny(unreachable_patterns)]

//! Reactive, incrementally evaluated formula fields.
//!
//! A configuration declares named numeric fields. Input fields hold plain values; derived fields
//! hold an arithmetic formula over other fields (`qty * price`, `sqrt(pow(a, 2) + pow(b, 2))`).
//! [`Engine::initialize`] builds the dependency graph once (rejecting cycles), and afterwards:
//!
//! - [`Engine::set`] assigns an input field and schedules a debounced recompute pass;
//! - [`Engine::tick`] / [`Engine::flush`] run the pass, recomputing only the derived fields
//!   downstream of what changed, each exactly once, in dependency order;
//! - every completed pass publishes one immutable [`Snapshot`] to all subscribers.
//!
//! Per-field evaluation problems (unknown variables, domain errors such as `sqrt(-1)`) never stop
//! a pass: the failing field keeps its previous value and the error rides along in the snapshot.
//!
//! ## Example
//!
//! ```
//! use formula_reactive::{Engine, RawConfig, RawField};
//!
//! let raw = RawConfig::new()
//!     .field("qty", RawField::input(10.0))
//!     .field("price", RawField::input(2.0))
//!     .field("total", RawField::derived("qty * price"));
//! let mut engine = Engine::initialize(raw).unwrap();
//! assert_eq!(engine.get("total"), Some(20.0));
//!
//! engine.set("price", 4.0).unwrap();
//! let report = engine.flush().unwrap().expect("a pass was pending");
//! assert_eq!(report.recomputed, vec!["total".to_string()]);
//! assert_eq!(engine.get("total"), Some(40.0));
//! ```
//!
//! ## Driving the scheduler
//!
//! The engine never spawns threads or sleeps. Hosts call [`Engine::tick`] from their own loop,
//! using [`Engine::next_deadline`] to decide when; tests inject a [`ManualClock`] through
//! [`Engine::initialize_with`].

pub mod config;
pub mod debug;
mod engine;
pub mod error;
pub mod eval;
pub mod format;
pub mod graph;
pub mod parser;
pub mod scheduler;
pub mod snapshot;
pub mod store;

pub use crate::config::{Configuration, Field, FieldId, FieldMeta, RawConfig, RawField};
pub use crate::debug::{DebugRecorder, DebugSink, LogEvent, ValueChange};
pub use crate::engine::{Engine, EngineOptions, PassReport};
pub use crate::error::{EngineError, EngineResult};
pub use crate::format::ValidationRule;
pub use crate::graph::{CycleError, DependencyGraph};
pub use crate::parser::{check_formula, extract_variables, validate_formula, Expr, SyntaxError};
pub use crate::scheduler::{Clock, ManualClock, SystemClock};
pub use crate::snapshot::{Snapshot, SubscriberError, SubscriberResult, SubscriptionId};
pub use crate::store::{MetaCursor, Mutation};
