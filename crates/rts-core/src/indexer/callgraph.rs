//! Call graph construction from the fact stream and the collected inventory.
//!
//! Nodes are interned [`DependencyId`]s held in an `IndexSet` arena; edges are
//! adjacency lists of arena indices, so mutually recursive methods and cyclic
//! interface hierarchies need no special handling. Resolution for a call site:
//! declared owner if it declares the signature, else the first declaring
//! ancestor; plus every overriding descendant of the declared owner unless the
//! target is an initializer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use tracing::debug;

use crate::config::SelectionSettings;
use crate::indexer::parser::{ClassFile, Fact};
use crate::indexer::symbols::Inventory;
use crate::models::{
    is_initializer, signature_name, DependencyId, FieldKey, MethodKey, CONSTRUCTOR_NAME,
    STATIC_INITIALIZER_NAME,
};

// ---------------------------------------------------------------------------
// Reflection detection
// ---------------------------------------------------------------------------

static REFLECTIVE_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:java\.lang\.Class#(?:forName|newInstance|getMethod\w*|getDeclared\w*|getConstructors?)\(|java\.lang\.reflect\.\w+#(?:invoke|newInstance)\(|java\.lang\.ClassLoader#loadClass\(|java\.util\.ServiceLoader#load\w*\()",
    )
    .unwrap()
});

/// Whether `owner#signature` is a reflective platform entry point.
pub fn is_reflective_call(owner: &str, signature: &str) -> bool {
    REFLECTIVE_CALL_RE.is_match(&format!("{owner}#{signature}"))
}

/// Coarse class-level edges supplied from outside the bytecode walk, e.g. a
/// third-party dependency extractor.
pub trait ExternalEdgeSource: Sync {
    /// `(dependent unit, dependency unit)` pairs.
    fn class_edges(&self) -> Vec<(String, String)>;
}

impl ExternalEdgeSource for [(String, String)] {
    fn class_edges(&self) -> Vec<(String, String)> {
        self.to_vec()
    }
}

impl ExternalEdgeSource for Vec<(String, String)> {
    fn class_edges(&self) -> Vec<(String, String)> {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// Immutable graph
// ---------------------------------------------------------------------------

/// Finished method-level graph. Every node reaches itself.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    nodes: IndexSet<DependencyId>,
    forward: Vec<Vec<usize>>,
    unit_methods: BTreeMap<String, Vec<usize>>,
    reflective: BTreeSet<usize>,
}

impl CallGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edge count excluding the reflexive self-edges.
    pub fn edge_count(&self) -> usize {
        self.forward
            .iter()
            .enumerate()
            .map(|(i, out)| out.iter().filter(|&&t| t != i).count())
            .sum()
    }

    pub fn id(&self, node: &DependencyId) -> Option<usize> {
        self.nodes.get_index_of(node)
    }

    pub fn node(&self, id: usize) -> Option<&DependencyId> {
        self.nodes.get_index(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyId> {
        self.nodes.iter()
    }

    /// Direct callees (and accessed fields) of a node, itself included.
    pub fn callees(&self, id: usize) -> &[usize] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_edge(&self, from: &DependencyId, to: &DependencyId) -> bool {
        match (self.id(from), self.id(to)) {
            (Some(a), Some(b)) => self.callees(a).contains(&b),
            _ => false,
        }
    }

    /// Method nodes attributed to a unit: declared methods plus inherited
    /// fixture methods.
    pub fn methods_of(&self, unit: &str) -> &[usize] {
        self.unit_methods
            .get(unit)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Methods that call into a reflective platform API.
    pub fn is_reflective(&self, id: usize) -> bool {
        self.reflective.contains(&id)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Per-run accumulator. Workers may own one each and [`merge`](Self::merge)
/// at the end; [`finish`](Self::finish) applies the closures.
pub struct CallGraphBuilder<'a> {
    inventory: &'a Inventory,
    settings: &'a SelectionSettings,
    nodes: IndexSet<DependencyId>,
    edges: BTreeSet<(usize, usize)>,
    unit_methods: BTreeMap<String, BTreeSet<usize>>,
    reflective: BTreeSet<usize>,
}

impl<'a> CallGraphBuilder<'a> {
    pub fn new(inventory: &'a Inventory, settings: &'a SelectionSettings) -> Self {
        Self {
            inventory,
            settings,
            nodes: IndexSet::new(),
            edges: BTreeSet::new(),
            unit_methods: BTreeMap::new(),
            reflective: BTreeSet::new(),
        }
    }

    fn intern(&mut self, node: DependencyId) -> usize {
        self.nodes.insert_full(node).0
    }

    fn add_edge(&mut self, from: DependencyId, to: DependencyId) {
        let a = self.intern(from);
        let b = self.intern(to);
        if a != b {
            self.edges.insert((a, b));
        }
    }

    fn attribute(&mut self, key: MethodKey) {
        let owner = key.owner.clone();
        let id = self.intern(DependencyId::Method(key));
        self.unit_methods.entry(owner).or_default().insert(id);
    }

    pub fn add_unit(&mut self, class: &ClassFile) {
        if self.settings.is_excluded(&class.name) || !self.inventory.contains(&class.name) {
            return;
        }
        for fact in class.facts() {
            self.observe(&fact);
        }
    }

    pub fn observe(&mut self, fact: &Fact) {
        match fact {
            Fact::Method { key, .. } => {
                self.attribute(key.clone());
                if key.name() != STATIC_INITIALIZER_NAME {
                    let clinit = format!("{STATIC_INITIALIZER_NAME}()V");
                    if self.inventory.declares_method(&key.owner, &clinit) {
                        self.add_edge(
                            key.clone().into(),
                            MethodKey::new(key.owner.clone(), clinit).into(),
                        );
                    }
                }
            }
            Fact::Field { key, .. } => {
                self.intern(key.clone().into());
            }
            Fact::Invoke {
                caller,
                owner,
                signature,
                ..
            } => self.resolve_invoke(caller, owner, signature),
            Fact::FieldAccess {
                caller,
                field,
                write,
                is_static,
            } => self.resolve_field_access(caller, field, *write, *is_static),
            Fact::Unit { .. } => {}
        }
    }

    fn resolve_invoke(&mut self, caller: &MethodKey, owner: &str, signature: &str) {
        if self.settings.is_excluded(owner) {
            if is_reflective_call(owner, signature) {
                let id = self.intern(caller.clone().into());
                self.reflective.insert(id);
            }
            return;
        }
        let inventory = self.inventory;
        if let Some(resolved) = inventory.resolve_method(owner, signature) {
            self.add_edge(
                caller.clone().into(),
                MethodKey::new(resolved, signature).into(),
            );
        }
        if is_initializer(signature_name(signature)) {
            return;
        }
        for overrider in inventory.overriders(owner, signature) {
            self.add_edge(
                caller.clone().into(),
                MethodKey::new(overrider, signature).into(),
            );
        }
    }

    fn resolve_field_access(
        &mut self,
        caller: &MethodKey,
        field: &FieldKey,
        write: bool,
        is_static: bool,
    ) {
        if self.settings.is_excluded(&field.owner) {
            return;
        }
        let Some(owner) = self
            .inventory
            .resolve_field(&field.owner, &field.name, &field.descriptor)
        else {
            return;
        };
        let resolved = FieldKey::new(&owner, &field.name, &field.descriptor);
        self.add_edge(caller.clone().into(), resolved.clone().into());

        let initializer = if is_static {
            STATIC_INITIALIZER_NAME
        } else {
            CONSTRUCTOR_NAME
        };
        if write && caller.name() == initializer {
            self.add_edge(resolved.into(), caller.clone().into());
        }
    }

    /// Merge coarse class-level edges: every method of `a` reaches the class
    /// node `b`, which reaches every method of `b`.
    pub fn add_external_edges<S: ExternalEdgeSource + ?Sized>(&mut self, source: &S) {
        let inventory = self.inventory;
        for (dependent, dependency) in source.class_edges() {
            if dependent == dependency {
                continue;
            }
            let class_node = DependencyId::Class(dependency.clone());
            self.intern(class_node.clone());
            if let Some(sigs) = inventory.methods.get(&dependent) {
                for sig in sigs {
                    self.add_edge(
                        MethodKey::new(dependent.clone(), sig.clone()).into(),
                        class_node.clone(),
                    );
                }
            }
            if let Some(sigs) = inventory.methods.get(&dependency) {
                for sig in sigs {
                    self.add_edge(
                        class_node.clone(),
                        MethodKey::new(dependency.clone(), sig.clone()).into(),
                    );
                }
            }
        }
    }

    pub fn merge(&mut self, other: CallGraphBuilder<'_>) {
        let remap: Vec<usize> = other
            .nodes
            .into_iter()
            .map(|node| self.intern(node))
            .collect();
        for (a, b) in other.edges {
            if remap[a] != remap[b] {
                self.edges.insert((remap[a], remap[b]));
            }
        }
        for (unit, ids) in other.unit_methods {
            let entry = self.unit_methods.entry(unit).or_default();
            entry.extend(ids.into_iter().map(|i| remap[i]));
        }
        self.reflective
            .extend(other.reflective.into_iter().map(|i| remap[i]));
    }

    /// Inherited methods of fixture hierarchies become `derived#sig ->
    /// base#sig` edges and are attributed to the derived unit.
    fn close_fixture_hierarchy(&mut self) {
        let inventory = self.inventory;
        let settings = self.settings;
        for unit in inventory.units.keys() {
            let unit_is_fixture = settings.is_fixture(unit);
            for ancestor in inventory.hierarchy.ancestors(unit) {
                if !unit_is_fixture && !settings.is_fixture(&ancestor) {
                    continue;
                }
                let Some(sigs) = inventory.methods.get(&ancestor) else {
                    continue;
                };
                for sig in sigs {
                    if is_initializer(signature_name(sig)) {
                        continue;
                    }
                    let derived = MethodKey::new(unit.clone(), sig.clone());
                    self.attribute(derived.clone());
                    self.add_edge(
                        derived.into(),
                        MethodKey::new(ancestor.clone(), sig.clone()).into(),
                    );
                }
            }
        }
    }

    pub fn finish(mut self) -> CallGraph {
        self.close_fixture_hierarchy();

        let n = self.nodes.len();
        let mut forward: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        for &(a, b) in &self.edges {
            forward[a].push(b);
        }
        for list in forward.iter_mut() {
            list.sort_unstable();
            list.dedup();
        }
        debug!(
            nodes = n,
            edges = self.edges.len(),
            reflective = self.reflective.len(),
            "Built call graph"
        );
        CallGraph {
            nodes: self.nodes,
            forward,
            unit_methods: self
                .unit_methods
                .into_iter()
                .map(|(unit, ids)| (unit, ids.into_iter().collect()))
                .collect(),
            reflective: self.reflective,
        }
    }
}
