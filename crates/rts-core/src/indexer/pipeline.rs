//! Analysis pipeline with Rayon-based parallelism.
//!
//! Units are decoded and fingerprinted independently on a bounded pool.
//! Fact collection and call-graph construction then run as fold/reduce over
//! per-worker builders, so no shared map is written concurrently. A unit
//! that fails to decode is recorded in [`Analysis::failed`] and never
//! reaches the graph.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::checksum::fingerprint::{fingerprint_bytes, UnitChecksums};
use crate::config::SelectionSettings;
use crate::errors::{RtsError, RtsResult};
use crate::indexer::callgraph::{CallGraph, CallGraphBuilder, ExternalEdgeSource};
use crate::indexer::filesystem::ArtifactResolver;
use crate::indexer::parser::ClassFile;
use crate::indexer::symbols::{FactCollector, Inventory};
use crate::models::{DependencyId, Fingerprint};
use crate::query::guards::bounded_pool;

pub struct ParsedUnit {
    pub class: ClassFile,
    pub checksums: UnitChecksums,
}

/// Everything one run knows about the current build.
#[derive(Debug, Default)]
pub struct Analysis {
    pub checksums: BTreeMap<String, UnitChecksums>,
    pub failed: BTreeSet<String>,
    pub inventory: Inventory,
    pub graph: CallGraph,
    pub elapsed_ms: u128,
}

impl Analysis {
    pub fn contains(&self, unit: &str) -> bool {
        self.checksums.contains_key(unit)
    }

    pub fn fingerprint_of(&self, id: &DependencyId) -> Option<&Fingerprint> {
        self.checksums.get(id.owner())?.fingerprint_of(id)
    }
}

fn parse_unit_worker(resolver: &dyn ArtifactResolver, unit: &str) -> RtsResult<ParsedUnit> {
    let bytes = resolver
        .locate(unit)
        .ok_or_else(|| RtsError::Artifact(format!("{unit} not found")))?;
    let (class, checksums) = fingerprint_bytes(&bytes, unit)?;
    if class.name != unit {
        return Err(RtsError::class_format(
            unit,
            format!("artifact declares {}", class.name),
        ));
    }
    Ok(ParsedUnit { class, checksums })
}

/// Decode every named unit, in parallel when a pool can be built.
pub fn parallel_parse(
    resolver: &dyn ArtifactResolver,
    units: &[String],
    workers: usize,
) -> Vec<(String, RtsResult<ParsedUnit>)> {
    if units.is_empty() {
        return vec![];
    }
    let run = || -> Vec<(String, RtsResult<ParsedUnit>)> {
        units
            .par_iter()
            .map(|unit| (unit.clone(), parse_unit_worker(resolver, unit)))
            .collect()
    };
    match bounded_pool(workers) {
        Some(pool) => pool.install(run),
        None => units
            .iter()
            .map(|unit| (unit.clone(), parse_unit_worker(resolver, unit)))
            .collect(),
    }
}

fn collect_inventory(classes: &[ClassFile], settings: &SelectionSettings) -> Inventory {
    classes
        .par_iter()
        .fold(
            || FactCollector::new(settings),
            |mut collector, class| {
                collector.collect_unit(class);
                collector
            },
        )
        .reduce(
            || FactCollector::new(settings),
            |mut left, right| {
                left.merge(right);
                left
            },
        )
        .finish()
}

fn build_graph<'a>(
    classes: &[ClassFile],
    inventory: &'a Inventory,
    settings: &'a SelectionSettings,
) -> CallGraphBuilder<'a> {
    classes
        .par_iter()
        .fold(
            || CallGraphBuilder::new(inventory, settings),
            |mut builder, class| {
                builder.add_unit(class);
                builder
            },
        )
        .reduce(
            || CallGraphBuilder::new(inventory, settings),
            |mut left, right| {
                left.merge(right);
                left
            },
        )
}

/// Run the full analysis over every unit the resolver knows about.
pub fn analyze(
    resolver: &dyn ArtifactResolver,
    settings: &SelectionSettings,
    external: Option<&dyn ExternalEdgeSource>,
) -> Analysis {
    let started = Instant::now();
    let available = resolver.units();
    let total = available.len();
    let units: Vec<String> = available
        .into_iter()
        .filter(|u| !settings.is_excluded(u))
        .collect();
    debug!("Excluded {} of {total} units by namespace", total - units.len());

    let mut checksums = BTreeMap::new();
    let mut failed = BTreeSet::new();
    let mut classes = Vec::with_capacity(units.len());
    for (unit, result) in parallel_parse(resolver, &units, settings.workers) {
        match result {
            Ok(parsed) => {
                checksums.insert(unit, parsed.checksums);
                classes.push(parsed.class);
            }
            Err(e) => {
                warn!("Skipping unit {unit}: {e}");
                failed.insert(unit);
            }
        }
    }

    let run = || {
        let inventory = collect_inventory(&classes, settings);
        let graph = {
            let mut builder = build_graph(&classes, &inventory, settings);
            if let Some(source) = external {
                builder.add_external_edges(source);
            }
            builder.finish()
        };
        (inventory, graph)
    };
    let (inventory, graph) = match bounded_pool(settings.workers) {
        Some(pool) => pool.install(run),
        None => run(),
    };

    let elapsed_ms = started.elapsed().as_millis();
    info!(
        units = checksums.len(),
        failed = failed.len(),
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        elapsed_ms,
        "Analysis complete"
    );
    Analysis {
        checksums,
        failed,
        inventory,
        graph,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassBuilder, CodeBuilder};
    use crate::indexer::filesystem::MemoryResolver;
    use crate::indexer::parser::{ACC_PUBLIC, ACC_STATIC};
    use crate::models::MethodKey;

    fn resolver() -> MemoryResolver {
        let mut resolver = MemoryResolver::new();
        for b in [
            ClassBuilder::new("app.A").method(ACC_PUBLIC | ACC_STATIC, "f", "()V", CodeBuilder::new().ret()),
            ClassBuilder::new("app.ATest").method(
                ACC_PUBLIC,
                "testF",
                "()V",
                CodeBuilder::new().invokestatic("app.A", "f", "()V").ret(),
            ),
            ClassBuilder::new("org.junit.Assert"),
        ] {
            resolver.insert(b.name(), b.build());
        }
        resolver.insert("app.Broken", vec![0xca, 0xfe]);
        resolver
    }

    #[test]
    fn test_analyze_builds_graph_and_records_failures() {
        let settings = SelectionSettings {
            workers: 2,
            ..SelectionSettings::default()
        };
        let analysis = analyze(&resolver(), &settings, None);
        assert!(analysis.contains("app.A"));
        assert!(analysis.contains("app.ATest"));
        assert!(!analysis.contains("org.junit.Assert"));
        assert_eq!(analysis.failed, BTreeSet::from(["app.Broken".to_string()]));
        assert!(analysis.graph.has_edge(
            &MethodKey::new("app.ATest", "testF()V").into(),
            &MethodKey::new("app.A", "f()V").into()
        ));
        assert!(analysis
            .fingerprint_of(&MethodKey::new("app.A", "f()V").into())
            .is_some());
    }

    #[test]
    fn test_mismatched_artifact_name_is_rejected() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("app.Moved", ClassBuilder::new("app.Original").build());
        let parsed = parallel_parse(&resolver, &["app.Moved".to_string()], 1);
        assert!(matches!(parsed[0].1, Err(RtsError::ClassFormat { .. })));
    }

    #[test]
    fn test_missing_artifact_is_artifact_error() {
        let parsed = parallel_parse(&MemoryResolver::new(), &["app.Gone".to_string()], 1);
        assert!(matches!(parsed[0].1, Err(RtsError::Artifact(_))));
    }

    #[test]
    fn test_external_edges_are_merged() {
        let edges = vec![("app.ATest".to_string(), "lib.Json".to_string())];
        let analysis = analyze(&resolver(), &SelectionSettings::default(), Some(&edges));
        assert!(analysis
            .graph
            .id(&DependencyId::Class("lib.Json".to_string()))
            .is_some());
    }
}
