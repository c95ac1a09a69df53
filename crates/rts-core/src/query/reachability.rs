//! Per-test dependency footprints over the finished call graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::indexer::callgraph::CallGraph;
use crate::models::DependencyId;
use crate::query::guards::bounded_pool;

/// Everything a test can reach, plus whether any reached method uses
/// reflection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Footprint {
    pub nodes: BTreeSet<usize>,
    pub reflective: bool,
}

impl Footprint {
    pub fn contains(&self, graph: &CallGraph, node: &DependencyId) -> bool {
        graph.id(node).is_some_and(|id| self.nodes.contains(&id))
    }

    /// Resolved node identities, in arena order.
    pub fn dependencies<'g>(&self, graph: &'g CallGraph) -> Vec<&'g DependencyId> {
        self.nodes.iter().filter_map(|&id| graph.node(id)).collect()
    }

    /// Units owning at least one reached node.
    pub fn units(&self, graph: &CallGraph) -> BTreeSet<String> {
        self.dependencies(graph)
            .into_iter()
            .map(|d| d.owner().to_string())
            .collect()
    }
}

/// Breadth-first traversal from `seeds`; the visited set guards cycles.
pub fn reach(graph: &CallGraph, seeds: &[usize]) -> Footprint {
    let mut visited: BTreeSet<usize> = BTreeSet::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    for &seed in seeds {
        if visited.insert(seed) {
            queue.push_back(seed);
        }
    }
    let mut reflective = false;
    while let Some(current) = queue.pop_front() {
        reflective |= graph.is_reflective(current);
        for &next in graph.callees(current) {
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }
    Footprint {
        nodes: visited,
        reflective,
    }
}

/// Footprint of a test unit, seeded with every method attributed to it.
pub fn test_footprint(graph: &CallGraph, test: &str) -> Footprint {
    reach(graph, graph.methods_of(test))
}

/// Footprints of many tests on a bounded pool. The traversals share only the
/// read-only graph; results land in a mutex-guarded map.
pub fn footprints(graph: &CallGraph, tests: &[String], workers: usize) -> BTreeMap<String, Footprint> {
    let results: Mutex<BTreeMap<String, Footprint>> = Mutex::new(BTreeMap::new());
    let run = || {
        tests.par_iter().for_each(|test| {
            let footprint = test_footprint(graph, test);
            results.lock().insert(test.clone(), footprint);
        });
    };
    match bounded_pool(workers) {
        Some(pool) => pool.install(run),
        None => {
            for test in tests {
                results.lock().insert(test.clone(), test_footprint(graph, test));
            }
        }
    }
    let results = results.into_inner();
    debug!(tests = results.len(), "Computed test footprints");
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionSettings;
    use crate::fixtures::{ClassBuilder, CodeBuilder};
    use crate::indexer::filesystem::MemoryResolver;
    use crate::indexer::parser::{ACC_PUBLIC, ACC_STATIC};
    use crate::indexer::pipeline::analyze;
    use crate::models::MethodKey;

    fn graph() -> CallGraph {
        let mut resolver = MemoryResolver::new();
        for b in [
            // ping and pong call each other.
            ClassBuilder::new("app.Ping")
                .method(
                    ACC_PUBLIC | ACC_STATIC,
                    "ping",
                    "()V",
                    CodeBuilder::new().invokestatic("app.Ping", "pong", "()V").ret(),
                )
                .method(
                    ACC_PUBLIC | ACC_STATIC,
                    "pong",
                    "()V",
                    CodeBuilder::new().invokestatic("app.Ping", "ping", "()V").ret(),
                ),
            ClassBuilder::new("app.Unused").method(
                ACC_PUBLIC | ACC_STATIC,
                "idle",
                "()V",
                CodeBuilder::new().ret(),
            ),
            ClassBuilder::new("app.PingTest").method(
                ACC_PUBLIC,
                "testPing",
                "()V",
                CodeBuilder::new().invokestatic("app.Ping", "ping", "()V").ret(),
            ),
            ClassBuilder::new("app.ReflectTest").method(
                ACC_PUBLIC,
                "testLoad",
                "()V",
                CodeBuilder::new()
                    .ldc_str("app.Unused")
                    .invokestatic("java.lang.Class", "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
                    .pop()
                    .ret(),
            ),
        ] {
            resolver.insert(b.name(), b.build());
        }
        analyze(&resolver, &SelectionSettings::default(), None).graph
    }

    #[test]
    fn test_cyclic_calls_terminate() {
        let graph = graph();
        let footprint = test_footprint(&graph, "app.PingTest");
        assert!(footprint.contains(&graph, &MethodKey::new("app.Ping", "ping()V").into()));
        assert!(footprint.contains(&graph, &MethodKey::new("app.Ping", "pong()V").into()));
        assert!(!footprint.contains(&graph, &MethodKey::new("app.Unused", "idle()V").into()));
        assert!(!footprint.reflective);
        assert_eq!(
            footprint.units(&graph),
            BTreeSet::from(["app.Ping".to_string(), "app.PingTest".to_string()])
        );
    }

    #[test]
    fn test_reflective_footprint_flagged() {
        let graph = graph();
        assert!(test_footprint(&graph, "app.ReflectTest").reflective);
    }

    #[test]
    fn test_unknown_test_has_empty_footprint() {
        let graph = graph();
        assert_eq!(test_footprint(&graph, "app.Nope"), Footprint::default());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let graph = graph();
        let tests = vec!["app.PingTest".to_string(), "app.ReflectTest".to_string()];
        let parallel = footprints(&graph, &tests, 4);
        for test in &tests {
            assert_eq!(parallel[test], test_footprint(&graph, test));
        }
    }
}
