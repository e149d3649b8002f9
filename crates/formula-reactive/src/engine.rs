use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::{Configuration, Field, FieldId, RawConfig};
use crate::debug::{DebugSink, LogEvent};
use crate::error::{EngineError, EngineResult};
use crate::eval::{EvalError, Evaluator};
use crate::format::round_to_precision;
use crate::graph::DependencyGraph;
use crate::parser::{parse_formula, Expr, SyntaxError};
use crate::scheduler::{Clock, Debouncer, PendingPass, SystemClock};
use crate::snapshot::{Snapshot, SnapshotNotifier, SubscriberResult, SubscriptionId};
use crate::store::{MetaCursor, Mutation, ReactiveStore};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Writes closer together than this are coalesced into one recompute pass.
    pub debounce: Duration,
    /// Evaluate every derived field once during [`Engine::initialize`].
    pub evaluate_on_init: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            evaluate_on_init: true,
        }
    }
}

/// Outcome of one completed recompute pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    /// Revision of the snapshot published by this pass.
    pub revision: u64,
    /// Input fields written since the previous pass.
    pub changed: Vec<String>,
    /// Derived fields successfully recomputed, in evaluation order.
    pub recomputed: Vec<String>,
    /// Per-field errors raised by this pass; the affected fields kept their previous values.
    pub errors: Vec<EngineError>,
}

struct StagedPass {
    values: Vec<(FieldId, f64)>,
    errors: Vec<(FieldId, EngineError)>,
}

/// An incremental evaluation engine over a fixed set of fields.
///
/// Writes go through [`Engine::set`], which records the change and (re)arms the debounce timer.
/// The host advances the engine with [`Engine::tick`] (or [`Engine::flush`]); a due pass
/// recomputes the affected derived fields in dependency order and publishes one [`Snapshot`] to
/// every subscriber.
pub struct Engine {
    store: ReactiveStore,
    graph: DependencyGraph,
    /// Parsed formula per field (`None` for input fields).
    compiled: Vec<Option<Result<Expr, SyntaxError>>>,
    options: EngineOptions,
    clock: Box<dyn Clock>,
    debouncer: Debouncer,
    notifier: SnapshotNotifier,
    sinks: Vec<Box<dyn DebugSink>>,
    warnings: Vec<EngineError>,
    /// Outstanding evaluation error per field, cleared by the field's next successful evaluation.
    field_errors: BTreeMap<FieldId, EngineError>,
    revision: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("fields", &self.store.configuration().len())
            .field("revision", &self.revision)
            .field("options", &self.options)
            .field("debouncer", &self.debouncer)
            .field("notifier", &self.notifier)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Engine {
    /// Build an engine with default options and the system clock.
    pub fn initialize(raw: RawConfig) -> EngineResult<Self> {
        Self::initialize_with(raw, EngineOptions::default(), SystemClock)
    }

    /// Parse a JSON configuration and build an engine from it.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        Self::initialize(RawConfig::from_json_str(json)?)
    }

    pub fn initialize_with(
        raw: RawConfig,
        options: EngineOptions,
        clock: impl Clock + 'static,
    ) -> EngineResult<Self> {
        let (config, mut warnings) = Configuration::from_raw(&raw)?;
        let graph = DependencyGraph::build(&config)?;

        for unknown in graph.unknown_references() {
            warnings.push(EngineError::UnknownVariable {
                field: unknown.field.clone(),
                variable: unknown.variable.clone(),
            });
        }
        for warning in &warnings {
            log::warn!("{warning}");
        }

        let compiled = config
            .iter()
            .map(|field| field.formula.as_deref().map(parse_formula))
            .collect();

        let derived = config.iter().filter(|f| f.is_derived()).count();
        log::info!(
            "initialized engine with {} fields ({derived} derived), evaluation order: {}",
            config.len(),
            graph.topological_names().collect::<Vec<_>>().join(", ")
        );

        let mut engine = Self {
            store: ReactiveStore::new(config),
            graph,
            compiled,
            debouncer: Debouncer::new(options.debounce),
            options,
            clock: Box::new(clock),
            notifier: SnapshotNotifier::new(),
            sinks: Vec::new(),
            warnings,
            field_errors: BTreeMap::new(),
            revision: 0,
        };

        if engine.options.evaluate_on_init {
            let all_derived: Vec<FieldId> = engine
                .graph
                .topological_order()
                .iter()
                .copied()
                .filter(|&id| engine.compiled[id].is_some())
                .collect();
            let scope: BTreeSet<FieldId> = engine.graph.topological_order().iter().copied().collect();
            let staged = engine.recompute(&all_derived, &scope)?;
            for (_, err) in &staged.errors {
                log::warn!("{err}");
            }
            engine.commit(staged);
        }

        Ok(engine)
    }

    /// Standalone syntax check (see [`crate::parser::check_formula`]).
    #[must_use]
    pub fn validate(formula: &str) -> bool {
        crate::parser::validate_formula(formula)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.store.get(name)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.store.field(name)
    }

    /// Fields in configuration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.store.configuration().iter()
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Configuration-time warnings: formula syntax problems and unknown variables.
    #[must_use]
    pub fn warnings(&self) -> &[EngineError] {
        &self.warnings
    }

    /// Revision of the most recently published snapshot (0 before the first pass).
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Current state as a snapshot. Does not notify subscribers.
    ///
    /// Its errors are the outstanding per-field errors, in field order.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(
            self.revision,
            self.store.configuration(),
            self.field_errors.values().cloned().collect(),
        )
    }

    /// Assign an input field.
    ///
    /// A changed value schedules a recompute pass; writing the current value is a no-op.
    pub fn set(&mut self, name: &str, value: f64) -> EngineResult<()> {
        self.store.set(name, value)?;
        self.drain_mutations();
        Ok(())
    }

    /// Mutate a field's (possibly nested) metadata through a [`MetaCursor`].
    ///
    /// ```
    /// # use formula_reactive::{Engine, RawConfig, RawField};
    /// let mut engine = Engine::initialize(
    ///     RawConfig::new().field("qty", RawField::input(1.0)),
    /// ).unwrap();
    /// engine
    ///     .update_meta("qty", |meta| meta.at("validation").set("max", 100))
    ///     .unwrap();
    /// assert!(engine.set("qty", 500.0).is_err());
    /// ```
    pub fn update_meta<T>(
        &mut self,
        name: &str,
        update: impl FnOnce(MetaCursor<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let result = update(self.store.meta_mut(name)?);
        self.drain_mutations();
        result
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// When the pending pass becomes due, if there is one.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    /// Run the pending pass if its debounce deadline has passed.
    pub fn tick(&mut self) -> EngineResult<Option<PassReport>> {
        self.drain_mutations();
        match self.debouncer.take_due(self.clock.now()) {
            Some(pass) => self.run_pass(pass).map(Some),
            None => Ok(None),
        }
    }

    /// Run the pending pass now, ignoring the debounce deadline.
    pub fn flush(&mut self) -> EngineResult<Option<PassReport>> {
        self.drain_mutations();
        match self.debouncer.take() {
            Some(pass) => self.run_pass(pass).map(Some),
            None => Ok(None),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Snapshot) -> SubscriberResult + 'static,
    {
        let id = self.notifier.subscribe(callback);
        log::debug!("{id} registered");
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.notifier.len()
    }

    pub fn attach_debug_sink(&mut self, sink: impl DebugSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    fn emit(&mut self, level: log::Level, message: String, data: Option<serde_json::Value>) {
        log::log!(level, "{message}");
        if self.sinks.is_empty() {
            return;
        }
        let event = LogEvent::new(level, message, data);
        for sink in &mut self.sinks {
            sink.on_log(&event);
        }
    }

    fn drain_mutations(&mut self) {
        for mutation in self.store.take_mutations() {
            match mutation {
                Mutation::Value { field, old, new } => {
                    let deadline = self.debouncer.schedule(&field, self.clock.now());
                    let delay = deadline.saturating_duration_since(self.clock.now());
                    self.emit(
                        log::Level::Debug,
                        format!("{field} changed {old} -> {new}; recompute in {delay:?}"),
                        Some(json!({ "field": field, "old": old, "new": new })),
                    );
                }
                Mutation::Meta { field, path, value } => {
                    self.emit(
                        log::Level::Debug,
                        format!("{field} metadata changed at {}", path.join(".")),
                        Some(json!({ "field": field, "path": path, "value": value })),
                    );
                }
            }
        }
    }

    fn run_pass(&mut self, pass: PendingPass) -> EngineResult<PassReport> {
        let config = self.store.configuration();
        let roots: Vec<FieldId> = pass.changed.iter().filter_map(|f| config.id_of(f)).collect();
        let affected = self.graph.affected_by(&roots);
        let dirty: Vec<FieldId> = roots
            .iter()
            .flat_map(|&root| self.graph.direct_dependents(root).iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.emit(
            log::Level::Debug,
            format!(
                "recompute pass for [{}]: {} write(s) coalesced, {} field(s) affected",
                pass.changed.join(", "),
                pass.requests,
                affected.len()
            ),
            None,
        );

        let staged = match self.recompute(&dirty, &affected) {
            Ok(staged) => staged,
            Err(err) => {
                self.emit(
                    log::Level::Error,
                    format!("recompute pass aborted: {err}"),
                    Some(json!({ "changed": pass.changed })),
                );
                return Err(err);
            }
        };

        let mut recomputed = Vec::with_capacity(staged.values.len());
        for &(id, value) in &staged.values {
            let Some(name) = self.graph.name(id) else {
                continue;
            };
            for sink in &mut self.sinks {
                sink.on_field_computed(name, value);
            }
            recomputed.push(name.to_string());
        }
        let errors: Vec<EngineError> = staged.errors.iter().map(|(_, err)| err.clone()).collect();
        for err in &errors {
            self.emit(
                log::Level::Warn,
                err.to_string(),
                err.field().map(|field| json!({ "field": field })),
            );
        }

        self.commit(staged);
        self.revision += 1;
        let snapshot = self.snapshot();
        self.publish(&snapshot);

        Ok(PassReport {
            revision: self.revision,
            changed: pass.changed,
            recomputed,
            errors,
        })
    }

    fn publish(&mut self, snapshot: &Snapshot) {
        let failures = self.notifier.publish(snapshot);
        for (id, err) in failures {
            self.emit(
                log::Level::Warn,
                format!("{id} failed to handle snapshot {}: {err}", snapshot.revision()),
                None,
            );
        }
        for sink in &mut self.sinks {
            sink.on_snapshot(snapshot);
        }
        self.emit(
            log::Level::Info,
            format!(
                "published snapshot {} to {} subscriber(s)",
                snapshot.revision(),
                self.notifier.len()
            ),
            None,
        );
    }

    /// Evaluate `seeds` and everything downstream of them, in topological rank order.
    ///
    /// New values are staged and only returned; nothing is written unless the whole pass
    /// completes. A field whose evaluation fails keeps its value and does not enqueue its
    /// dependents.
    ///
    /// Every field in `scope` is evaluated at most once. Reaching a field a second time, or one
    /// outside `scope`, means the work would not terminate: the pass is aborted with
    /// [`EngineError::CyclicDependency`] naming the most recently evaluated fields.
    fn recompute(&self, seeds: &[FieldId], scope: &BTreeSet<FieldId>) -> EngineResult<StagedPass> {
        let config = self.store.configuration();
        let mut queue: BTreeSet<(usize, FieldId)> = seeds
            .iter()
            .filter_map(|&id| Some((self.graph.rank(id)?, id)))
            .collect();
        let mut staged: HashMap<FieldId, f64> = HashMap::new();
        let mut values = Vec::new();
        let mut errors = Vec::new();
        let mut evaluated: HashSet<FieldId> = HashSet::with_capacity(scope.len());
        let mut trail: Vec<FieldId> = Vec::new();

        while let Some((_, id)) = queue.pop_first() {
            trail.push(id);
            if !scope.contains(&id) || !evaluated.insert(id) {
                let path = trail[trail.len().saturating_sub(16)..]
                    .iter()
                    .filter_map(|&id| self.graph.name(id).map(str::to_string))
                    .collect();
                return Err(EngineError::CyclicDependency { path });
            }

            let Some(field) = config.by_id(id) else {
                continue;
            };
            let Some(compiled) = &self.compiled[id] else {
                continue;
            };

            match self.evaluate(field, compiled, &staged) {
                Ok(value) => {
                    staged.insert(id, value);
                    values.push((id, value));
                    for &dep in self.graph.direct_dependents(id) {
                        if let Some(rank) = self.graph.rank(dep) {
                            queue.insert((rank, dep));
                        }
                    }
                }
                Err(err) => errors.push((id, err)),
            }
        }

        Ok(StagedPass { values, errors })
    }

    fn evaluate(
        &self,
        field: &Field,
        compiled: &Result<Expr, SyntaxError>,
        staged: &HashMap<FieldId, f64>,
    ) -> EngineResult<f64> {
        let expr = compiled
            .as_ref()
            .map_err(|err| EngineError::InvalidFormulaSyntax {
                field: field.name.clone(),
                formula: field.formula.clone().unwrap_or_default(),
                reason: err.to_string(),
            })?;

        let config = self.store.configuration();
        let resolver = |name: &str| {
            let id = config.id_of(name)?;
            staged
                .get(&id)
                .copied()
                .or_else(|| config.by_id(id).map(|f| f.value))
        };

        let value = Evaluator::new(&resolver)
            .eval(expr)
            .map_err(|err| match err {
                EvalError::UnknownVariable(variable) => EngineError::UnknownVariable {
                    field: field.name.clone(),
                    variable,
                },
                other => EngineError::Evaluation {
                    field: field.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        Ok(match field.meta.precision() {
            Some(precision) => round_to_precision(value, precision),
            None => value,
        })
    }

    fn commit(&mut self, staged: StagedPass) {
        for (id, value) in staged.values {
            self.store.write_computed(id, value);
            self.field_errors.remove(&id);
        }
        self.field_errors.extend(staged.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawField;
    use crate::scheduler::ManualClock;
    use pretty_assertions::assert_eq;

    fn engine_with(raw: RawConfig, options: EngineOptions) -> (Engine, ManualClock) {
        let clock = ManualClock::new();
        let engine = Engine::initialize_with(raw, options, clock.clone()).unwrap();
        (engine, clock)
    }

    #[test]
    fn initial_pass_makes_derived_fields_consistent() {
        let raw = RawConfig::new()
            .field("qty", RawField::input(10.0))
            .field("price", RawField::input(2.0))
            .field("total", RawField::derived("qty * price"));
        let (engine, _) = engine_with(raw, EngineOptions::default());
        assert_eq!(engine.get("total"), Some(20.0));
        assert!(engine.field("total").unwrap().computed);
        assert_eq!(engine.revision(), 0);
    }

    #[test]
    fn seed_values_survive_without_initial_pass() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("b", RawField::derived("a + 1").with_value(7.0));
        let options = EngineOptions {
            evaluate_on_init: false,
            ..EngineOptions::default()
        };
        let (mut engine, _) = engine_with(raw, options);
        assert_eq!(engine.get("b"), Some(7.0));
        assert!(!engine.field("b").unwrap().computed);

        engine.set("a", 2.0).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.get("b"), Some(3.0));
    }

    #[test]
    fn pass_waits_for_debounce_deadline() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("b", RawField::derived("a * 10"));
        let (mut engine, clock) = engine_with(raw, EngineOptions::default());

        engine.set("a", 2.0).unwrap();
        assert!(engine.has_pending());
        assert_eq!(engine.tick().unwrap(), None);
        assert_eq!(engine.get("b"), Some(10.0));

        clock.advance(Duration::from_millis(200));
        let report = engine.tick().unwrap().expect("pass ran");
        assert_eq!(report.changed, vec!["a".to_string()]);
        assert_eq!(report.recomputed, vec!["b".to_string()]);
        assert_eq!(engine.get("b"), Some(20.0));
        assert!(!engine.has_pending());
    }

    #[test]
    fn derived_results_are_rounded_to_precision() {
        let raw = RawConfig::new()
            .field("a", RawField::input(100.0))
            .field("price", RawField::input(5.99))
            .field("discount", RawField::input(0.9))
            .field(
                "finalPrice",
                RawField::derived("a * price * discount").with_precision(2),
            );
        let (engine, _) = engine_with(raw, EngineOptions::default());
        assert_eq!(engine.get("finalPrice"), Some(539.1));
    }

    #[test]
    fn guard_aborts_when_work_leaves_the_affected_set() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("b", RawField::derived("a + 1"))
            .field("c", RawField::derived("b + 1"));
        let options = EngineOptions {
            evaluate_on_init: false,
            ..EngineOptions::default()
        };
        let (engine, _) = engine_with(raw, options);
        let b = engine.store.configuration().id_of("b").unwrap();

        let err = engine.recompute(&[b], &BTreeSet::from([b])).err();
        assert_eq!(
            err,
            Some(EngineError::CyclicDependency {
                path: vec!["b".into(), "c".into()]
            })
        );
        assert_eq!(engine.get("b"), Some(0.0));
        assert_eq!(engine.revision(), 0);
    }

    #[test]
    fn wide_acyclic_passes_are_never_cut_short() {
        let mut raw = RawConfig::new().field("x", RawField::input(1.0));
        let mut prev = "x".to_string();
        for i in 0..2_000 {
            let name = format!("f{i}");
            raw.push(name.clone(), RawField::derived(format!("{prev} + x")));
            prev = name;
        }
        let (mut engine, _) = engine_with(raw, EngineOptions::default());
        assert_eq!(engine.get("f1999"), Some(2_001.0));

        engine.set("x", 2.0).unwrap();
        let report = engine.flush().unwrap().unwrap();
        assert_eq!(report.recomputed.len(), 2_000);
        assert!(report.errors.is_empty());
        assert_eq!(engine.get("f1999"), Some(4_002.0));
    }

    #[test]
    fn metadata_updates_do_not_schedule_passes() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("b", RawField::derived("a * 3"));
        let (mut engine, _) = engine_with(raw, EngineOptions::default());

        engine
            .update_meta("b", |meta| meta.set("unit", "kg"))
            .unwrap();
        assert!(!engine.has_pending());
        assert_eq!(engine.field("b").unwrap().meta.unit(), Some("kg"));
    }

    #[test]
    fn precision_metadata_applies_to_next_pass() {
        let raw = RawConfig::new()
            .field("a", RawField::input(1.0))
            .field("third", RawField::derived("a / 3"));
        let (mut engine, _) = engine_with(raw, EngineOptions::default());

        engine
            .update_meta("third", |meta| meta.set("precision", 1))
            .unwrap();
        engine.set("a", 2.0).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.get("third"), Some(0.7));
    }
}
