mod dependency_graph;

pub use dependency_graph::{CycleError, DependencyGraph, UnknownReference};
