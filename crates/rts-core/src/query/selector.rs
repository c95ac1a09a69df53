//! Test selection against the persisted baseline, and the incremental store
//! update that produces the next baseline.
//!
//! [`compute_change_data`] only reads: it resolves the artifact behind each
//! stored owner, skips byte-identical ones by CRC, and compares fingerprints
//! at the configured granularity. [`update_store`] then recomputes
//! footprints for the selected tests and carries every other test's
//! attributions forward. Whenever information is missing the affected set
//! grows; it never shrinks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checksum::classify::{
    added_instance_methods, classify, compute_changed_fields, compute_changed_methods,
    snapshots_equivalent,
};
use crate::checksum::fingerprint::{fingerprint_bytes, UnitChecksums};
use crate::config::{Granularity, SelectionSettings};
use crate::errors::{RtsError, RtsResult};
use crate::indexer::callgraph::ExternalEdgeSource;
use crate::indexer::filesystem::{raw_checksum, ArtifactResolver};
use crate::indexer::parser::parse_class;
use crate::indexer::pipeline::{analyze, Analysis};
use crate::models::{DependencyId, FieldKey, MethodKey};
use crate::query::guards::bounded_pool;
use crate::query::reachability::footprints;
use crate::store::database::{load_snapshots, save_snapshots, DependencyStore, StoredDependency};

// ---------------------------------------------------------------------------
// Test sources
// ---------------------------------------------------------------------------

/// Authoritative list of test units in the current build.
pub trait TestSource {
    fn tests(&self) -> Vec<String>;
}

impl TestSource for [String] {
    fn tests(&self) -> Vec<String> {
        self.to_vec()
    }
}

impl TestSource for Vec<String> {
    fn tests(&self) -> Vec<String> {
        self.clone()
    }
}

/// Concrete fixture classes found in the build.
#[derive(Clone, Debug, Default)]
pub struct ScannedTests {
    tests: Vec<String>,
}

impl ScannedTests {
    pub fn from_analysis(analysis: &Analysis, settings: &SelectionSettings) -> Self {
        let tests = analysis
            .inventory
            .units
            .iter()
            .filter(|(name, info)| {
                !info.is_interface && !info.is_abstract && settings.is_fixture(name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        Self { tests }
    }

    /// Decode only fixture-named units, without a full analysis.
    pub fn scan(resolver: &dyn ArtifactResolver, settings: &SelectionSettings) -> Self {
        let mut tests = Vec::new();
        for unit in resolver.units() {
            if settings.is_excluded(&unit) || !settings.is_fixture(&unit) {
                continue;
            }
            let Some(bytes) = resolver.locate(&unit) else {
                continue;
            };
            match parse_class(&bytes, &unit) {
                Ok(class) if !class.is_interface() && !class.is_abstract() => tests.push(unit),
                Ok(_) => {}
                Err(e) => {
                    // Keep it: an unreadable test must still run.
                    warn!("Cannot decode test unit {unit}: {e}");
                    tests.push(unit);
                }
            }
        }
        Self { tests }
    }
}

impl TestSource for ScannedTests {
    fn tests(&self) -> Vec<String> {
        self.tests.clone()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChangeData {
    /// No usable baseline existed.
    pub first_run: bool,
    pub affected_tests: BTreeSet<String>,
    pub non_affected_tests: BTreeSet<String>,
    pub changed_dependencies: BTreeSet<String>,
    /// Owners whose artifact no longer resolves.
    pub deleted_units: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub records: usize,
    pub refreshed_tests: usize,
    pub pruned_records: usize,
    pub wildcard_tests: usize,
}

#[derive(Debug, Default)]
struct OwnerOutcome {
    affected: BTreeSet<String>,
    changed: BTreeSet<DependencyId>,
    /// Ancestor methods whose dispatch is now shadowed; their records may
    /// belong to other owners.
    shadowed: BTreeSet<DependencyId>,
    deleted: bool,
}

impl OwnerOutcome {
    fn everything(records: &[(&DependencyId, &StoredDependency)]) -> Self {
        Self {
            affected: records
                .iter()
                .flat_map(|(_, r)| r.tests.iter().cloned())
                .collect(),
            changed: records.iter().map(|(id, _)| (*id).clone()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Accumulator {
    affected: BTreeSet<String>,
    changed: BTreeSet<DependencyId>,
    shadowed: BTreeSet<DependencyId>,
    deleted: BTreeSet<String>,
}

impl Accumulator {
    fn absorb(&mut self, unit: &str, outcome: OwnerOutcome) {
        self.affected.extend(outcome.affected);
        self.changed.extend(outcome.changed);
        self.shadowed.extend(outcome.shadowed);
        if outcome.deleted {
            self.deleted.insert(unit.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Per-owner diff
// ---------------------------------------------------------------------------

struct DiffContext<'a> {
    settings: &'a SelectionSettings,
    granularity: Granularity,
    snapshots: &'a BTreeMap<String, UnitChecksums>,
    /// Units named as a parent by some snapshot.
    parents: BTreeSet<&'a str>,
    tests: &'a BTreeSet<String>,
}

impl<'a> DiffContext<'a> {
    fn new(
        settings: &'a SelectionSettings,
        granularity: Granularity,
        snapshots: &'a BTreeMap<String, UnitChecksums>,
        tests: &'a BTreeSet<String>,
    ) -> Self {
        let parents = snapshots
            .values()
            .flat_map(|s| s.super_name.iter().chain(s.interfaces.iter()))
            .map(String::as_str)
            .collect();
        Self {
            settings,
            granularity,
            snapshots,
            parents,
            tests,
        }
    }

    fn in_hierarchy(&self, cur: &UnitChecksums) -> bool {
        let has_parent = cur
            .super_name
            .iter()
            .chain(cur.interfaces.iter())
            .any(|p| !self.settings.is_excluded(p));
        has_parent || self.parents.contains(cur.name.as_str())
    }

    /// Whether the last snapshot of `test` has `unit` among its ancestors.
    fn inherits_from(&self, test: &str, unit: &str) -> bool {
        self.snapshots
            .get(test)
            .is_some_and(|s| self.ancestors(s).iter().any(|a| a.name == unit))
    }

    /// Ancestors of `cur` in resolution order, looked up in the snapshots.
    fn ancestors(&self, cur: &UnitChecksums) -> Vec<&'a UnitChecksums> {
        let mut out = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::from([cur.name.as_str()]);
        let mut queue: VecDeque<String> = cur
            .super_name
            .iter()
            .chain(cur.interfaces.iter())
            .cloned()
            .collect();
        while let Some(name) = queue.pop_front() {
            if self.settings.is_excluded(&name) {
                continue;
            }
            let Some(snapshot) = self.snapshots.get(&name) else {
                continue;
            };
            if !seen.insert(snapshot.name.as_str()) {
                continue;
            }
            out.push(snapshot);
            queue.extend(snapshot.super_name.iter().cloned());
            queue.extend(snapshot.interfaces.iter().cloned());
        }
        out
    }
}

fn evaluate_owner(
    ctx: &DiffContext<'_>,
    resolver: &dyn ArtifactResolver,
    unit: &str,
    records: &[(&DependencyId, &StoredDependency)],
) -> OwnerOutcome {
    let Some(bytes) = resolver.locate(unit) else {
        debug!("Unit {unit} no longer resolves");
        return OwnerOutcome {
            deleted: true,
            ..OwnerOutcome::everything(records)
        };
    };
    let prev = ctx.snapshots.get(unit);
    if prev.is_some_and(|p| p.raw_crc == raw_checksum(&bytes)) {
        return OwnerOutcome::default();
    }
    let cur = match fingerprint_bytes(&bytes, unit) {
        Ok((_, cur)) => cur,
        Err(e) => {
            warn!("Treating dependents of {unit} as affected: {e}");
            return OwnerOutcome::everything(records);
        }
    };

    let mismatched: Vec<&(&DependencyId, &StoredDependency)> = records
        .iter()
        .filter(|(id, stored)| cur.fingerprint_of(id) != Some(&stored.fingerprint))
        .collect();
    if mismatched.is_empty() {
        return OwnerOutcome::default();
    }

    match (ctx.granularity, prev) {
        (Granularity::Class, Some(prev))
            if snapshots_equivalent(
                prev,
                &cur,
                ctx.settings.is_fixture(unit),
                ctx.in_hierarchy(&cur),
            ) =>
        {
            debug!("{unit} differs only in tolerated ways");
            OwnerOutcome::default()
        }
        (Granularity::Class, _) => {
            let mut outcome = OwnerOutcome::default();
            for (id, stored) in mismatched {
                outcome.changed.insert((*id).clone());
                outcome.affected.extend(stored.tests.iter().cloned());
            }
            outcome
        }
        (Granularity::Method, None) => {
            // No snapshot to classify against.
            OwnerOutcome::everything(records)
        }
        (Granularity::Method, Some(prev)) => method_outcome(ctx, unit, records, prev, &cur),
    }
}

fn method_outcome(
    ctx: &DiffContext<'_>,
    unit: &str,
    records: &[(&DependencyId, &StoredDependency)],
    prev: &UnitChecksums,
    cur: &UnitChecksums,
) -> OwnerOutcome {
    let classification = classify(prev, cur);
    if classification.is_empty() {
        debug!("{unit} has no observable change");
        return OwnerOutcome::default();
    }
    debug!(
        "{unit} changed: {}",
        classification
            .kinds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut outcome = OwnerOutcome::default();
    outcome.changed.insert(DependencyId::Class(unit.to_string()));
    outcome
        .changed
        .extend(compute_changed_methods(prev, cur).into_iter().map(DependencyId::from));
    outcome
        .changed
        .extend(compute_changed_fields(prev, cur).into_iter().map(DependencyId::from));

    let added = added_instance_methods(prev, cur);
    for sig in &added {
        let shadowed = ctx
            .ancestors(cur)
            .into_iter()
            .find(|a| a.instance_methods.contains_key(sig));
        if let Some(ancestor) = shadowed {
            outcome
                .shadowed
                .insert(MethodKey::new(ancestor.name.clone(), sig.clone()).into());
        }
    }

    let escalate = classification.is_conservative()
        || (ctx.settings.is_fixture(unit) && classification.adds_methods());
    let mut member_tests: BTreeSet<&String> = BTreeSet::new();
    let mut class_tests: BTreeSet<&String> = BTreeSet::new();
    for (id, stored) in records {
        if id.is_class() {
            class_tests.extend(stored.tests.iter());
            continue;
        }
        member_tests.extend(stored.tests.iter());
        if outcome.changed.contains(*id) {
            outcome.affected.extend(stored.tests.iter().cloned());
        }
    }
    for test in class_tests {
        // Tests that reach the unit only through class-level edges cannot
        // be cleared member by member.
        // Subclasses inherit new instance methods, test cases included.
        let inherits_addition = !added.is_empty() && ctx.inherits_from(test, unit);
        if escalate || inherits_addition || !member_tests.contains(test) {
            outcome.affected.insert(test.clone());
        }
    }
    if ctx.tests.contains(unit) {
        outcome.affected.insert(unit.to_string());
    }
    outcome
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Diff an in-memory baseline against the current build.
pub fn diff_store(
    store: &DependencyStore,
    snapshots: &BTreeMap<String, UnitChecksums>,
    granularity: Granularity,
    resolver: &dyn ArtifactResolver,
    tests: &BTreeSet<String>,
    settings: &SelectionSettings,
) -> ChangeData {
    let ctx = DiffContext::new(settings, granularity, snapshots, tests);
    let groups: Vec<(&str, Vec<(&DependencyId, &StoredDependency)>)> =
        store.by_owner().into_iter().collect();

    let acc = Mutex::new(Accumulator::default());
    let run = || {
        groups.par_iter().for_each(|(unit, records)| {
            let outcome = evaluate_owner(&ctx, resolver, unit, records);
            acc.lock().absorb(unit, outcome);
        });
    };
    match bounded_pool(settings.workers) {
        Some(pool) => pool.install(run),
        None => {
            for (unit, records) in &groups {
                let outcome = evaluate_owner(&ctx, resolver, unit, records);
                acc.lock().absorb(unit, outcome);
            }
        }
    }
    let mut acc = acc.into_inner();

    for id in std::mem::take(&mut acc.shadowed) {
        if let Some(stored) = store.records.get(&id) {
            acc.affected.extend(stored.tests.iter().cloned());
        }
        acc.changed.insert(id);
    }

    let known_owners: BTreeSet<&str> = store.records.keys().map(|id| id.owner()).collect();
    let new_units: Vec<String> = resolver
        .units()
        .into_iter()
        .filter(|u| !settings.is_excluded(u))
        .filter(|u| !snapshots.contains_key(u) && !known_owners.contains(u.as_str()))
        .collect();
    if !acc.changed.is_empty() || !new_units.is_empty() {
        acc.affected.extend(store.wildcard.iter().cloned());
    }

    let known_tests = store.tests();
    acc.affected
        .extend(tests.iter().filter(|t| !known_tests.contains(*t)).cloned());

    let affected: BTreeSet<String> = acc.affected.intersection(tests).cloned().collect();
    let non_affected = tests.difference(&affected).cloned().collect();
    info!(
        affected = affected.len(),
        changed = acc.changed.len(),
        new_units = new_units.len(),
        deleted = acc.deleted.len(),
        "Computed change data"
    );
    ChangeData {
        first_run: false,
        affected_tests: affected,
        non_affected_tests: non_affected,
        changed_dependencies: acc.changed.iter().map(ToString::to_string).collect(),
        deleted_units: acc.deleted,
    }
}

/// Select the tests affected since the baseline stored under `store_dir`.
/// A missing or unreadable baseline selects every test.
pub fn compute_change_data(
    store_dir: &Path,
    granularity: Granularity,
    resolver: &dyn ArtifactResolver,
    tests: &dyn TestSource,
    settings: &SelectionSettings,
) -> RtsResult<ChangeData> {
    let current: BTreeSet<String> = tests.tests().into_iter().collect();
    let Some(store) = DependencyStore::load(store_dir)? else {
        info!("First run: all {} tests affected", current.len());
        return Ok(ChangeData {
            first_run: true,
            affected_tests: current,
            ..ChangeData::default()
        });
    };
    let snapshots = load_snapshots(store_dir);
    Ok(diff_store(
        &store,
        &snapshots,
        granularity,
        resolver,
        &current,
        settings,
    ))
}

/// Build the next baseline from the previous one and this run's analysis.
pub fn next_store(
    previous: &DependencyStore,
    analysis: &Analysis,
    granularity: Granularity,
    tests: &BTreeSet<String>,
    refreshed: &BTreeSet<String>,
    workers: usize,
) -> DependencyStore {
    let mut next = DependencyStore::new();
    for (unit, checksums) in &analysis.checksums {
        next.insert(
            DependencyId::Class(unit.clone()),
            checksums.class.clone(),
            BTreeSet::new(),
        );
        if granularity == Granularity::Method {
            for sig in checksums.method_signatures() {
                let key = MethodKey::new(unit.clone(), sig.clone());
                if let Some(fp) = checksums.method(sig) {
                    next.insert(key.into(), fp.clone(), BTreeSet::new());
                }
            }
            for (slot, fp) in &checksums.field_fingerprints {
                if let Some((name, descriptor)) = slot.split_once(':') {
                    let key = FieldKey::new(unit, name, descriptor);
                    next.insert(key.into(), fp.clone(), BTreeSet::new());
                }
            }
        }
    }

    // Undecodable units keep their previous records so the next run still
    // sees them as dependencies.
    for (id, stored) in &previous.records {
        if analysis.failed.contains(id.owner()) {
            next.records.insert(id.clone(), stored.clone());
        }
    }

    for (id, stored) in &previous.records {
        let Some(record) = next.records.get_mut(id) else {
            continue;
        };
        record.tests.extend(
            stored
                .tests
                .iter()
                .filter(|t| tests.contains(*t) && !refreshed.contains(*t))
                .cloned(),
        );
    }
    next.wildcard = previous
        .wildcard
        .iter()
        .filter(|t| tests.contains(*t) && !refreshed.contains(*t))
        .cloned()
        .collect();

    let order: Vec<String> = refreshed.iter().cloned().collect();
    let graph = &analysis.graph;
    for (test, footprint) in footprints(graph, &order, workers) {
        if footprint.reflective {
            next.wildcard.insert(test.clone());
        }
        for node in footprint.dependencies(graph) {
            let class = DependencyId::Class(node.owner().to_string());
            if let Some(record) = next.records.get_mut(&class) {
                record.tests.insert(test.clone());
            }
            if granularity == Granularity::Method && !node.is_class() {
                if let Some(record) = next.records.get_mut(node) {
                    record.tests.insert(test.clone());
                }
            }
        }
    }
    next.known_tests = tests.clone();
    next
}

/// Validate `next` against the analysed build, then write it and the unit
/// snapshots. Nothing is written when validation fails.
pub fn persist(
    store_dir: &Path,
    next: &DependencyStore,
    analysis: &Analysis,
    settings: &SelectionSettings,
) -> RtsResult<()> {
    next.validate(|unit| analysis.contains(unit) || analysis.failed.contains(unit))?;
    next.save(store_dir, settings)?;
    save_snapshots(store_dir, analysis.checksums.values())
}

/// Refresh and persist the baseline after [`compute_change_data`].
///
/// Tests selected this run (all tests on a first run) get fresh footprints;
/// the rest keep their attributions. Records of deleted units are pruned
/// and every fingerprint is refreshed. The store is validated before
/// anything is written; the dependency file is written before snapshots.
pub fn update_store(
    store_dir: &Path,
    granularity: Granularity,
    settings: &SelectionSettings,
    analysis: &Analysis,
    tests: &dyn TestSource,
    change: &ChangeData,
) -> RtsResult<UpdateSummary> {
    let current: BTreeSet<String> = tests.tests().into_iter().collect();
    let previous = if change.first_run {
        DependencyStore::new()
    } else {
        // Rebuilding from nothing would drop every carried attribution.
        DependencyStore::load(store_dir)?.ok_or_else(|| {
            RtsError::Store(format!(
                "baseline in {} vanished after selection",
                store_dir.display()
            ))
        })?
    };
    let refreshed: BTreeSet<String> = if change.first_run {
        current.clone()
    } else {
        change.affected_tests.intersection(&current).cloned().collect()
    };

    let next = next_store(
        &previous,
        analysis,
        granularity,
        &current,
        &refreshed,
        settings.workers,
    );
    let pruned = previous
        .records
        .keys()
        .filter(|id| !next.records.contains_key(*id))
        .count();
    persist(store_dir, &next, analysis, settings)?;

    let summary = UpdateSummary {
        records: next.records.len(),
        refreshed_tests: refreshed.len(),
        pruned_records: pruned,
        wildcard_tests: next.wildcard.len(),
    };
    info!(
        records = summary.records,
        refreshed = summary.refreshed_tests,
        pruned = summary.pruned_records,
        "Updated dependency store"
    );
    Ok(summary)
}

/// Analyze, select and persist in one step. Without an explicit test
/// source the fixture classes of the build are used.
pub fn run_selection(
    store_dir: &Path,
    settings: &SelectionSettings,
    resolver: &dyn ArtifactResolver,
    tests: Option<&dyn TestSource>,
    external: Option<&dyn ExternalEdgeSource>,
) -> RtsResult<ChangeData> {
    let analysis = analyze(resolver, settings, external);
    let scanned;
    let tests: &dyn TestSource = match tests {
        Some(t) => t,
        None => {
            scanned = ScannedTests::from_analysis(&analysis, settings);
            &scanned
        }
    };
    let change = compute_change_data(store_dir, settings.granularity, resolver, tests, settings)?;
    update_store(
        store_dir,
        settings.granularity,
        settings,
        &analysis,
        tests,
        &change,
    )?;
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassBuilder, CodeBuilder};
    use crate::indexer::filesystem::MemoryResolver;
    use crate::indexer::parser::{ACC_PUBLIC, ACC_STATIC};
    use crate::models::Fingerprint;
    use crate::store::schema::{DEPENDENCIES_FILE, SNAPSHOTS_FILE};

    const PUBLIC_STATIC: u16 = ACC_PUBLIC | ACC_STATIC;

    fn settings(granularity: Granularity) -> SelectionSettings {
        SelectionSettings {
            granularity,
            workers: 2,
            ..SelectionSettings::default()
        }
    }

    fn resolver(builders: &[ClassBuilder]) -> MemoryResolver {
        let mut resolver = MemoryResolver::new();
        for b in builders {
            resolver.insert(b.name(), b.build());
        }
        resolver
    }

    fn lib_a(value: u8) -> ClassBuilder {
        ClassBuilder::new("app.A").method(
            PUBLIC_STATIC,
            "f",
            "()I",
            CodeBuilder::new().iconst(value).ireturn(),
        )
    }

    fn lib_b(value: u8) -> ClassBuilder {
        ClassBuilder::new("app.B").method(
            PUBLIC_STATIC,
            "g",
            "()I",
            CodeBuilder::new().iconst(value).ireturn(),
        )
    }

    fn caller(test: &str, owner: &str, name: &str) -> ClassBuilder {
        ClassBuilder::new(test).method(
            ACC_PUBLIC,
            "testIt",
            "()V",
            CodeBuilder::new().invokestatic(owner, name, "()I").pop().ret(),
        )
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn run(dir: &Path, settings: &SelectionSettings, builders: &[ClassBuilder]) -> ChangeData {
        run_selection(dir, settings, &resolver(builders), None, None).unwrap()
    }

    #[test]
    fn test_first_run_selects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tests = vec!["app.ATest".to_string()];
        let change = compute_change_data(
            dir.path(),
            Granularity::Method,
            &resolver(&[lib_a(1)]),
            &tests,
            &settings(Granularity::Method),
        )
        .unwrap();
        assert!(change.first_run);
        assert!(change.non_affected_tests.is_empty());
        assert_eq!(change.affected_tests, set(&["app.ATest"]));
    }

    #[test]
    fn test_method_edit_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        let first = run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        assert!(first.first_run);

        let prev = load_snapshots(dir.path())["app.A"].clone();
        let edited = lib_a(2);
        let (_, cur) = fingerprint_bytes(&edited.build(), "app.A").unwrap();
        assert_eq!(
            compute_changed_methods(&prev, &cur),
            BTreeSet::from([MethodKey::new("app.A", "f()I")])
        );

        let second = run(dir.path(), &s, &[lib_a(2), caller("app.ATest", "app.A", "f")]);
        assert_eq!(second.affected_tests, set(&["app.ATest"]));
        assert!(second.changed_dependencies.contains("app.A#f()I"));

        let third = run(dir.path(), &s, &[lib_a(2), caller("app.ATest", "app.A", "f")]);
        assert!(third.affected_tests.is_empty());
        assert_eq!(third.non_affected_tests, set(&["app.ATest"]));
    }

    #[test]
    fn test_unrelated_tests_are_not_selected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        let build = |b: u8| {
            vec![
                lib_a(1),
                lib_b(b),
                caller("app.ATest", "app.A", "f"),
                caller("app.BTest", "app.B", "g"),
            ]
        };
        run(dir.path(), &s, &build(1));
        let change = run(dir.path(), &s, &build(2));
        assert_eq!(change.affected_tests, set(&["app.BTest"]));
        assert_eq!(change.non_affected_tests, set(&["app.ATest"]));
    }

    #[test]
    fn test_debug_only_rebuild_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        let change = run(
            dir.path(),
            &s,
            &[lib_a(1).debug_lines(12).source_file("A.java"), caller("app.ATest", "app.A", "f")],
        );
        assert!(change.affected_tests.is_empty());
        assert!(change.changed_dependencies.is_empty());
    }

    #[test]
    fn test_new_override_shadows_ancestor() {
        let base = ClassBuilder::new("app.Base")
            .default_constructor()
            .method(ACC_PUBLIC, "m", "()V", CodeBuilder::new().ret());
        let derived = |with_override: bool| {
            let d = ClassBuilder::new("app.Derived").extends("app.Base").default_constructor();
            if with_override {
                d.method(ACC_PUBLIC, "m", "()V", CodeBuilder::new().iconst(1).pop().ret())
            } else {
                d
            }
        };
        let test = ClassBuilder::new("app.DispatchTest").method(
            ACC_PUBLIC,
            "testM",
            "()V",
            CodeBuilder::new()
                .new_object("app.Derived")
                .dup()
                .invokespecial("app.Derived", "<init>", "()V")
                .invokevirtual("app.Base", "m", "()V")
                .ret(),
        );
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[base.clone(), derived(false), test.clone()]);
        let change = run(dir.path(), &s, &[base, derived(true), test]);
        assert_eq!(change.affected_tests, set(&["app.DispatchTest"]));
        assert!(change.changed_dependencies.contains("app.Base#m()V"));
        assert!(change.changed_dependencies.contains("app.Derived#m()V"));
    }

    #[test]
    fn test_wildcard_bucket_escalates_on_any_change() {
        let reflective = ClassBuilder::new("app.PluginTest").method(
            ACC_PUBLIC,
            "testLoad",
            "()V",
            CodeBuilder::new()
                .ldc_str("app.Plugin")
                .invokestatic("java.lang.Class", "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
                .pop()
                .ret(),
        );
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f"), reflective.clone()]);
        let text = std::fs::read_to_string(dir.path().join(DEPENDENCIES_FILE)).unwrap();
        assert!(text.starts_with("* - app.PluginTest\n"));

        let quiet = run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f"), reflective.clone()]);
        assert!(quiet.affected_tests.is_empty());

        let change = run(dir.path(), &s, &[lib_a(2), caller("app.ATest", "app.A", "f"), reflective]);
        assert_eq!(change.affected_tests, set(&["app.ATest", "app.PluginTest"]));
    }

    #[test]
    fn test_new_unit_escalates_wildcard_only() {
        let reflective = ClassBuilder::new("app.PluginTest").method(
            ACC_PUBLIC,
            "testLoad",
            "()V",
            CodeBuilder::new()
                .ldc_str("app.Plugin")
                .invokestatic("java.lang.Class", "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
                .pop()
                .ret(),
        );
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f"), reflective.clone()]);
        let change = run(
            dir.path(),
            &s,
            &[lib_a(1), caller("app.ATest", "app.A", "f"), reflective, ClassBuilder::new("app.Plugin")],
        );
        assert_eq!(change.affected_tests, set(&["app.PluginTest"]));
    }

    #[test]
    fn test_deleted_unit_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), lib_b(1), caller("app.BTest", "app.B", "g")]);
        let change = run(dir.path(), &s, &[lib_a(1), caller("app.BTest", "app.B", "g")]);
        assert_eq!(change.deleted_units, set(&["app.B"]));
        assert_eq!(change.affected_tests, set(&["app.BTest"]));
        let store = DependencyStore::load(dir.path()).unwrap().unwrap();
        assert!(store.records.keys().all(|id| id.owner() != "app.B"));
    }

    #[test]
    fn test_new_test_is_affected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        let change = run(
            dir.path(),
            &s,
            &[lib_a(1), caller("app.ATest", "app.A", "f"), caller("app.OtherTest", "app.A", "f")],
        );
        assert_eq!(change.affected_tests, set(&["app.OtherTest"]));
    }

    #[test]
    fn test_corrupt_artifact_selects_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        let tests = vec!["app.ATest".to_string()];
        let good = resolver(&[lib_a(1), caller("app.ATest", "app.A", "f")]);
        run_selection(dir.path(), &s, &good, Some(&tests), None).unwrap();

        let mut broken = good.clone();
        broken.insert("app.A", vec![0xca, 0xfe, 0xba, 0xbe, 0x00]);
        let change = compute_change_data(dir.path(), Granularity::Method, &broken, &tests, &s).unwrap();
        assert_eq!(change.affected_tests, set(&["app.ATest"]));

        // The broken unit keeps its records through the update.
        run_selection(dir.path(), &s, &broken, Some(&tests), None).unwrap();
        let store = DependencyStore::load(dir.path()).unwrap().unwrap();
        assert!(store.records.contains_key(&DependencyId::Class("app.A".to_string())));
    }

    #[test]
    fn test_class_granularity() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Class);
        let two_methods = |v: u8| {
            ClassBuilder::new("app.A")
                .method(PUBLIC_STATIC, "f", "()I", CodeBuilder::new().iconst(1).ireturn())
                .method(PUBLIC_STATIC, "h", "()I", CodeBuilder::new().iconst(v).ireturn())
        };
        run(dir.path(), &s, &[two_methods(1), caller("app.ATest", "app.A", "f")]);
        let store = DependencyStore::load(dir.path()).unwrap().unwrap();
        assert!(store.records.keys().all(DependencyId::is_class));

        // A body change the test never calls still selects it at class level.
        let change = run(dir.path(), &s, &[two_methods(2), caller("app.ATest", "app.A", "f")]);
        assert_eq!(change.affected_tests, set(&["app.ATest"]));

        // An added helper on a standalone non-fixture class is tolerated.
        let with_helper = two_methods(2).method(
            PUBLIC_STATIC,
            "extra",
            "()V",
            CodeBuilder::new().ret(),
        );
        let change = run(dir.path(), &s, &[with_helper, caller("app.ATest", "app.A", "f")]);
        assert!(change.affected_tests.is_empty());
    }

    #[test]
    fn test_fixture_gaining_test_method_is_affected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        let grown = caller("app.ATest", "app.A", "f").method(
            ACC_PUBLIC,
            "testMore",
            "()V",
            CodeBuilder::new().ret(),
        );
        let change = run(dir.path(), &s, &[lib_a(1), grown]);
        assert_eq!(change.affected_tests, set(&["app.ATest"]));
    }

    #[test]
    fn test_test_method_added_to_base_selects_subclass_tests() {
        let base = |with_new: bool| {
            let b = ClassBuilder::new("app.IntegrationBase")
                .default_constructor()
                .method(ACC_PUBLIC, "testOld", "()V", CodeBuilder::new().ret());
            if with_new {
                b.method(ACC_PUBLIC, "testNew", "()V", CodeBuilder::new().ret())
            } else {
                b
            }
        };
        let concrete = ClassBuilder::new("app.ConcreteTest")
            .extends("app.IntegrationBase")
            .default_constructor();
        let unrelated = caller("app.ATest", "app.A", "f");

        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[base(false), concrete.clone(), lib_a(1), unrelated.clone()]);
        let change = run(dir.path(), &s, &[base(true), concrete, lib_a(1), unrelated]);
        assert_eq!(change.affected_tests, set(&["app.ConcreteTest"]));
        assert!(change.changed_dependencies.contains("app.IntegrationBase#testNew()V"));
    }

    fn store_bytes(dir: &Path) -> (Vec<u8>, Vec<u8>) {
        (
            std::fs::read(dir.join(DEPENDENCIES_FILE)).unwrap(),
            std::fs::read(dir.join(SNAPSHOTS_FILE)).unwrap(),
        )
    }

    #[test]
    fn test_inconsistent_store_is_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        let builders = [lib_a(1), caller("app.ATest", "app.A", "f")];
        run(dir.path(), &s, &builders);
        let before = store_bytes(dir.path());

        let analysis = analyze(&resolver(&[lib_a(2), caller("app.ATest", "app.A", "f")]), &s, None);
        let mut next = DependencyStore::load(dir.path()).unwrap().unwrap();
        next.insert(
            DependencyId::Class("app.Ghost".to_string()),
            Fingerprint::from_hex("abc123").unwrap(),
            set(&["app.ATest"]),
        );
        let result = persist(dir.path(), &next, &analysis, &s);
        assert!(matches!(result, Err(RtsError::Invariant(_))));
        assert_eq!(store_bytes(dir.path()), before);
    }

    #[test]
    fn test_failed_write_keeps_previous_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        let snapshots = std::fs::read(dir.path().join(SNAPSHOTS_FILE)).unwrap();

        // A directory in place of the dependency file makes the rename fail.
        std::fs::remove_file(dir.path().join(DEPENDENCIES_FILE)).unwrap();
        std::fs::create_dir(dir.path().join(DEPENDENCIES_FILE)).unwrap();
        let analysis = analyze(&resolver(&[lib_a(2), caller("app.ATest", "app.A", "f")]), &s, None);
        let next = DependencyStore::new();
        assert!(persist(dir.path(), &next, &analysis, &s).is_err());
        assert_eq!(std::fs::read(dir.path().join(SNAPSHOTS_FILE)).unwrap(), snapshots);
    }

    #[test]
    fn test_update_refuses_vanished_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        let tests = vec!["app.ATest".to_string()];
        let build = resolver(&[lib_a(2), caller("app.ATest", "app.A", "f")]);
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);

        let change = compute_change_data(dir.path(), Granularity::Method, &build, &tests, &s).unwrap();
        assert!(!change.first_run);
        std::fs::remove_file(dir.path().join(DEPENDENCIES_FILE)).unwrap();
        let analysis = analyze(&build, &s, None);
        let result = update_store(dir.path(), Granularity::Method, &s, &analysis, &tests, &change);
        assert!(matches!(result, Err(RtsError::Store(_))));
        assert!(!dir.path().join(DEPENDENCIES_FILE).exists());
    }

    #[test]
    fn test_removed_tests_are_dropped_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(Granularity::Method);
        run(
            dir.path(),
            &s,
            &[lib_a(1), caller("app.ATest", "app.A", "f"), caller("app.GoneTest", "app.A", "f")],
        );
        run(dir.path(), &s, &[lib_a(1), caller("app.ATest", "app.A", "f")]);
        let store = DependencyStore::load(dir.path()).unwrap().unwrap();
        assert!(!store.tests().contains("app.GoneTest"));
        assert!(store.tests().contains("app.ATest"));
    }

    #[test]
    fn test_scanned_tests_skip_abstract_fixtures() {
        let resolver = resolver(&[
            caller("app.ATest", "app.A", "f"),
            ClassBuilder::new("app.AbstractTest").access(0x0421),
            lib_a(1),
        ]);
        let s = settings(Granularity::Method);
        assert_eq!(ScannedTests::scan(&resolver, &s).tests(), vec!["app.ATest".to_string()]);
        let analysis = analyze(&resolver, &s, None);
        assert_eq!(
            ScannedTests::from_analysis(&analysis, &s).tests(),
            vec!["app.ATest".to_string()]
        );
    }
}
