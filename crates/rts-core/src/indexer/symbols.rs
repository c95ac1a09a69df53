//! Fact collection: per-unit method and field inventories plus the
//! application class hierarchy.
//!
//! A [`FactCollector`] consumes the [`Fact`] stream of each decoded unit.
//! Collectors are plain accumulators, so each worker can own one and
//! [`FactCollector::merge`] them at the end; [`FactCollector::finish`] then
//! produces the immutable [`Inventory`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::config::SelectionSettings;
use crate::indexer::parser::{ClassFile, Fact};

// ---------------------------------------------------------------------------
// Inventory types
// ---------------------------------------------------------------------------

/// Declaration-level view of one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitInfo {
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
    pub is_abstract: bool,
}

/// Bidirectional `child -> parents` / `parent -> children` association,
/// restricted to application namespaces.
#[derive(Clone, Debug, Default)]
pub struct Hierarchy {
    superclass: BTreeMap<String, String>,
    parents: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, BTreeSet<String>>,
}

impl Hierarchy {
    fn add_edge(&mut self, child: &str, parent: &str, is_super: bool) {
        if is_super {
            self.superclass.insert(child.to_string(), parent.to_string());
        }
        self.parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
        self.children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
    }

    pub fn superclass(&self, unit: &str) -> Option<&str> {
        self.superclass.get(unit).map(String::as_str)
    }

    pub fn parents(&self, unit: &str) -> impl Iterator<Item = &String> {
        self.parents.get(unit).into_iter().flatten()
    }

    pub fn children(&self, unit: &str) -> impl Iterator<Item = &String> {
        self.children.get(unit).into_iter().flatten()
    }

    /// Ancestors in resolution order: the superclass chain first, then
    /// interfaces breadth-first. Cycles are tolerated.
    pub fn ancestors(&self, unit: &str) -> Vec<String> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        seen.insert(unit);

        // Chain entries borrow from `self`, so `order` stays free to grow.
        let mut chain: Vec<&str> = Vec::new();
        let mut current = unit;
        while let Some(parent) = self.superclass(current) {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        let mut order: Vec<String> = chain.iter().map(|p| p.to_string()).collect();

        let mut queue: VecDeque<&str> = VecDeque::from([unit]);
        queue.extend(chain);
        while let Some(next) = queue.pop_front() {
            for parent in self.parents(next) {
                if seen.insert(parent.as_str()) {
                    order.push(parent.clone());
                    queue.push_back(parent.as_str());
                }
            }
        }
        order
    }

    /// Every transitive child of `unit`.
    pub fn descendants(&self, unit: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([unit]);
        while let Some(next) = queue.pop_front() {
            for child in self.children(next) {
                if child != unit && out.insert(child.clone()) {
                    queue.push_back(child.as_str());
                }
            }
        }
        out
    }
}

/// Immutable result of fact collection.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    pub units: BTreeMap<String, UnitInfo>,
    /// unit -> `name(descriptor)` of every declared method.
    pub methods: BTreeMap<String, BTreeSet<String>>,
    /// unit -> `name:descriptor` of every declared field.
    pub fields: BTreeMap<String, BTreeSet<String>>,
    pub hierarchy: Hierarchy,
}

impl Inventory {
    pub fn contains(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
    }

    pub fn declares_method(&self, unit: &str, signature: &str) -> bool {
        self.methods
            .get(unit)
            .is_some_and(|sigs| sigs.contains(signature))
    }

    pub fn declares_field(&self, unit: &str, name: &str, descriptor: &str) -> bool {
        self.fields
            .get(unit)
            .is_some_and(|f| f.contains(&format!("{name}:{descriptor}")))
    }

    /// The unit that actually declares `signature` when invoked on `owner`:
    /// `owner` itself, else its first declaring ancestor.
    pub fn resolve_method(&self, owner: &str, signature: &str) -> Option<String> {
        if self.declares_method(owner, signature) {
            return Some(owner.to_string());
        }
        self.hierarchy
            .ancestors(owner)
            .into_iter()
            .find(|a| self.declares_method(a, signature))
    }

    pub fn resolve_field(&self, owner: &str, name: &str, descriptor: &str) -> Option<String> {
        if self.declares_field(owner, name, descriptor) {
            return Some(owner.to_string());
        }
        self.hierarchy
            .ancestors(owner)
            .into_iter()
            .find(|a| self.declares_field(a, name, descriptor))
    }

    /// Descendants of `owner` that declare (override) `signature`.
    pub fn overriders(&self, owner: &str, signature: &str) -> Vec<String> {
        self.hierarchy
            .descendants(owner)
            .into_iter()
            .filter(|d| self.declares_method(d, signature))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

pub struct FactCollector<'s> {
    settings: &'s SelectionSettings,
    units: BTreeMap<String, UnitInfo>,
    methods: BTreeMap<String, BTreeSet<String>>,
    fields: BTreeMap<String, BTreeSet<String>>,
    skipped: usize,
}

impl<'s> FactCollector<'s> {
    pub fn new(settings: &'s SelectionSettings) -> Self {
        Self {
            settings,
            units: BTreeMap::new(),
            methods: BTreeMap::new(),
            fields: BTreeMap::new(),
            skipped: 0,
        }
    }

    /// Feed every fact of a decoded unit. Units in excluded namespaces are
    /// ignored.
    pub fn collect_unit(&mut self, class: &ClassFile) {
        if self.settings.is_excluded(&class.name) {
            self.skipped += 1;
            return;
        }
        for fact in class.facts() {
            self.observe(&fact);
        }
    }

    pub fn observe(&mut self, fact: &Fact) {
        match fact {
            Fact::Unit {
                name,
                super_name,
                interfaces,
                is_interface,
                is_abstract,
            } => {
                self.units.insert(
                    name.clone(),
                    UnitInfo {
                        super_name: super_name.clone(),
                        interfaces: interfaces.clone(),
                        is_interface: *is_interface,
                        is_abstract: *is_abstract,
                    },
                );
                self.methods.entry(name.clone()).or_default();
                self.fields.entry(name.clone()).or_default();
            }
            Fact::Method { key, .. } => {
                self.methods
                    .entry(key.owner.clone())
                    .or_default()
                    .insert(key.signature.clone());
            }
            Fact::Field { key, .. } => {
                self.fields
                    .entry(key.owner.clone())
                    .or_default()
                    .insert(format!("{}:{}", key.name, key.descriptor));
            }
            Fact::Invoke { .. } | Fact::FieldAccess { .. } => {}
        }
    }

    /// Absorb a partial collector built by another worker.
    pub fn merge(&mut self, other: FactCollector<'_>) {
        self.units.extend(other.units);
        for (unit, sigs) in other.methods {
            self.methods.entry(unit).or_default().extend(sigs);
        }
        for (unit, fields) in other.fields {
            self.fields.entry(unit).or_default().extend(fields);
        }
        self.skipped += other.skipped;
    }

    pub fn finish(self) -> Inventory {
        let mut hierarchy = Hierarchy::default();
        for (name, info) in &self.units {
            if let Some(parent) = &info.super_name {
                if !self.settings.is_excluded(parent) {
                    hierarchy.add_edge(name, parent, true);
                }
            }
            for interface in &info.interfaces {
                if !self.settings.is_excluded(interface) {
                    hierarchy.add_edge(name, interface, false);
                }
            }
        }
        debug!(
            units = self.units.len(),
            skipped = self.skipped,
            "Collected unit facts"
        );
        Inventory {
            units: self.units,
            methods: self.methods,
            fields: self.fields,
            hierarchy,
        }
    }
}
