use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::config::{Configuration, FieldId};

/// A formula reference to a name that is not a configured field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownReference {
    pub field: String,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Field names from the first revisited field around the loop, ending where it started.
    pub path: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circular dependency: {}", self.path.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

/// Read-only dependency graph over a [`Configuration`].
///
/// An edge `A -> B` means "A's formula references B". The graph is validated to be acyclic at
/// construction time and never changes afterwards.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// Fields referenced by each field's formula, sorted by id.
    precedents: Vec<Vec<FieldId>>,
    /// Fields whose formulas reference each field, sorted by id.
    dependents: Vec<Vec<FieldId>>,
    /// Topological order: every field appears after all of its precedents.
    order: Vec<FieldId>,
    /// Position of each field in `order`.
    rank: Vec<usize>,
    unknown: Vec<UnknownReference>,
}

impl DependencyGraph {
    /// Build and validate the graph.
    ///
    /// References to names that are not fields are dropped from the graph and reported via
    /// [`DependencyGraph::unknown_references`].
    pub fn build(config: &Configuration) -> Result<Self, CycleError> {
        let n = config.len();
        let mut names = Vec::with_capacity(n);
        let mut precedents = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        let mut unknown = Vec::new();

        for (id, field) in config.iter().enumerate() {
            names.push(field.name.clone());
            if !field.is_derived() {
                continue;
            }
            for variable in &field.depends_on {
                match config.id_of(variable) {
                    Some(precedent) => {
                        precedents[id].push(precedent);
                        dependents[precedent].push(id);
                    }
                    None => unknown.push(UnknownReference {
                        field: field.name.clone(),
                        variable: variable.clone(),
                    }),
                }
            }
        }

        for list in precedents.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }

        let mut graph = Self {
            names,
            precedents,
            dependents,
            order: Vec::new(),
            rank: Vec::new(),
            unknown,
        };
        graph.order = graph.topological_sort()?;
        graph.rank = vec![0; n];
        for (pos, &id) in graph.order.iter().enumerate() {
            graph.rank[id] = pos;
        }
        Ok(graph)
    }

    /// Depth-first search over precedent edges with a three-color scheme.
    ///
    /// Roots and neighbors are visited in insertion order, so the resulting post-order (which is
    /// a valid evaluation order) is deterministic. Reaching a node that is still in progress means
    /// a cycle; the path is reported starting at that node.
    fn topological_sort(&self) -> Result<Vec<FieldId>, CycleError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        struct Frame {
            node: FieldId,
            idx: usize,
        }

        let n = self.names.len();
        let mut color = vec![Color::White; n];
        let mut order = Vec::with_capacity(n);
        let mut stack: Vec<FieldId> = Vec::new();

        for start in 0..n {
            if color[start] != Color::White {
                continue;
            }

            let mut frames = vec![Frame { node: start, idx: 0 }];
            stack.push(start);
            color[start] = Color::Gray;

            while let Some(frame) = frames.last_mut() {
                let neighbors = &self.precedents[frame.node];
                if frame.idx >= neighbors.len() {
                    color[frame.node] = Color::Black;
                    order.push(frame.node);
                    stack.pop();
                    frames.pop();
                    continue;
                }

                let next = neighbors[frame.idx];
                frame.idx += 1;

                match color[next] {
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push(next);
                        frames.push(Frame { node: next, idx: 0 });
                    }
                    Color::Gray => {
                        let start_idx = stack.iter().position(|&id| id == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[start_idx..]
                            .iter()
                            .map(|&id| self.names[id].clone())
                            .collect();
                        path.push(self.names[next].clone());
                        return Err(CycleError { path });
                    }
                    Color::Black => {}
                }
            }
        }

        Ok(order)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn name(&self, id: FieldId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Fields referenced by `id`'s formula (known fields only).
    #[must_use]
    pub fn precedents_of(&self, id: FieldId) -> &[FieldId] {
        self.precedents.get(id).map_or(&[][..], Vec::as_slice)
    }

    /// Fields whose formulas reference `id` directly.
    #[must_use]
    pub fn direct_dependents(&self, id: FieldId) -> &[FieldId] {
        self.dependents.get(id).map_or(&[][..], Vec::as_slice)
    }

    /// Position of `id` in [`DependencyGraph::topological_order`].
    #[must_use]
    pub fn rank(&self, id: FieldId) -> Option<usize> {
        self.rank.get(id).copied()
    }

    /// A valid evaluation order over all fields: precedents before dependents.
    #[must_use]
    pub fn topological_order(&self) -> &[FieldId] {
        &self.order
    }

    /// Field names in topological order.
    pub fn topological_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(|&id| self.names[id].as_str())
    }

    #[must_use]
    pub fn unknown_references(&self) -> &[UnknownReference] {
        &self.unknown
    }

    /// All fields that transitively depend on any of `changed` (excluding `changed` itself
    /// unless it is reachable from another changed field).
    #[must_use]
    pub fn affected_by(&self, changed: &[FieldId]) -> BTreeSet<FieldId> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<FieldId> = changed.iter().copied().collect();
        while let Some(cur) = queue.pop_front() {
            for &dep in self.direct_dependents(cur) {
                if affected.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        affected
    }
}
