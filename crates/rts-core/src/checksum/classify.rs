//! Structural change classification between two snapshots of one unit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::checksum::fingerprint::UnitChecksums;
use crate::models::{is_initializer, signature_name, FieldKey, Fingerprint, MethodKey};

/// Why two snapshots of a unit differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SuperClassChanged,
    InterfacesChanged,
    ClassModifierChanged,
    FieldAdded,
    FieldRemoved,
    FieldChanged,
    ConstructorUpdated,
    InstanceMethodAdded,
    InstanceMethodRemoved,
    InstanceMethodSignatureChanged,
    StaticMethodAdded,
    StaticMethodRemoved,
    StaticMethodSignatureChanged,
    ExceptionsChanged,
    ModifierChanged,
}

impl ChangeKind {
    /// Changes whose effect cannot be pinned to individual members.
    pub fn is_conservative(self) -> bool {
        matches!(
            self,
            ChangeKind::SuperClassChanged
                | ChangeKind::InterfacesChanged
                | ChangeKind::ClassModifierChanged
        )
    }

    pub fn adds_methods(self) -> bool {
        matches!(
            self,
            ChangeKind::InstanceMethodAdded | ChangeKind::StaticMethodAdded
        )
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::SuperClassChanged => "super class changed",
            ChangeKind::InterfacesChanged => "interfaces changed",
            ChangeKind::ClassModifierChanged => "class modifier changed",
            ChangeKind::FieldAdded => "field added",
            ChangeKind::FieldRemoved => "field removed",
            ChangeKind::FieldChanged => "field changed",
            ChangeKind::ConstructorUpdated => "constructor updated",
            ChangeKind::InstanceMethodAdded => "instance method added",
            ChangeKind::InstanceMethodRemoved => "instance method removed",
            ChangeKind::InstanceMethodSignatureChanged => "instance method signature changed",
            ChangeKind::StaticMethodAdded => "static method added",
            ChangeKind::StaticMethodRemoved => "static method removed",
            ChangeKind::StaticMethodSignatureChanged => "static method signature changed",
            ChangeKind::ExceptionsChanged => "exceptions changed",
            ChangeKind::ModifierChanged => "modifier changed",
        };
        f.write_str(label)
    }
}

/// The tag set produced by [`classify`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kinds: BTreeSet<ChangeKind>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// At least one tag forces every dependent of the unit to retest.
    pub fn is_conservative(&self) -> bool {
        self.kinds.iter().any(|k| k.is_conservative())
    }

    pub fn adds_methods(&self) -> bool {
        self.kinds.iter().any(|k| k.adds_methods())
    }

    fn insert(&mut self, kind: ChangeKind) {
        self.kinds.insert(kind);
    }
}

// ---------------------------------------------------------------------------
// Method map diff
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
struct MethodDiff {
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
    renamed: Vec<(String, String)>,
}

impl MethodDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.renamed.is_empty()
    }
}

fn diff_methods(
    prev: &BTreeMap<String, Fingerprint>,
    cur: &BTreeMap<String, Fingerprint>,
) -> MethodDiff {
    let mut old_left: BTreeMap<&String, &Fingerprint> = prev
        .iter()
        .filter(|(sig, fp)| cur.get(*sig) != Some(*fp))
        .collect();
    let mut new_left: BTreeMap<&String, &Fingerprint> = cur
        .iter()
        .filter(|(sig, fp)| prev.get(*sig) != Some(*fp))
        .collect();

    // An old body reappearing under a new slot is a signature change.
    let mut renamed = Vec::new();
    let old_sigs: Vec<&String> = old_left.keys().copied().collect();
    for old_sig in old_sigs {
        if cur.contains_key(old_sig) {
            continue;
        }
        let Some(old_fp) = old_left.get(old_sig).copied() else {
            continue;
        };
        let matched = new_left
            .iter()
            .find(|(new_sig, fp)| **fp == old_fp && !prev.contains_key(**new_sig))
            .map(|(new_sig, _)| *new_sig);
        if let Some(new_sig) = matched {
            old_left.remove(old_sig);
            new_left.remove(new_sig);
            renamed.push((old_sig.clone(), new_sig.clone()));
        }
    }

    MethodDiff {
        added: new_left.keys().map(|s| (*s).clone()).collect(),
        removed: old_left.keys().map(|s| (*s).clone()).collect(),
        renamed,
    }
}

fn classify_methods(
    diff: &MethodDiff,
    added: ChangeKind,
    removed: ChangeKind,
    renamed: ChangeKind,
    out: &mut Classification,
) {
    if !diff.renamed.is_empty() {
        out.insert(renamed);
    }
    if !diff.added.is_empty() {
        out.insert(added);
    }
    if !diff.removed.is_empty() {
        out.insert(removed);
    }
}

fn field_diff(prev: &UnitChecksums, cur: &UnitChecksums) -> (usize, usize) {
    let added = cur.fields.difference(&prev.fields).count();
    let removed = prev.fields.difference(&cur.fields).count();
    (added, removed)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Tag every structural difference between two snapshots of the same unit.
pub fn classify(prev: &UnitChecksums, cur: &UnitChecksums) -> Classification {
    let mut out = Classification::default();

    if prev.super_name != cur.super_name {
        out.insert(ChangeKind::SuperClassChanged);
    }
    if prev.interfaces != cur.interfaces {
        out.insert(ChangeKind::InterfacesChanged);
    }
    if prev.header != cur.header {
        out.insert(ChangeKind::ClassModifierChanged);
    }

    match field_diff(prev, cur) {
        (0, 0) => {}
        (_, 0) => out.insert(ChangeKind::FieldAdded),
        (0, _) => out.insert(ChangeKind::FieldRemoved),
        _ => out.insert(ChangeKind::FieldChanged),
    }
    let retagged = prev
        .field_fingerprints
        .iter()
        .any(|(k, fp)| cur.field_fingerprints.get(k).is_some_and(|c| c != fp));
    if retagged {
        out.insert(ChangeKind::FieldChanged);
    }

    if prev.constructors != cur.constructors {
        out.insert(ChangeKind::ConstructorUpdated);
    }

    classify_methods(
        &diff_methods(&prev.instance_methods, &cur.instance_methods),
        ChangeKind::InstanceMethodAdded,
        ChangeKind::InstanceMethodRemoved,
        ChangeKind::InstanceMethodSignatureChanged,
        &mut out,
    );
    classify_methods(
        &diff_methods(&prev.static_methods, &cur.static_methods),
        ChangeKind::StaticMethodAdded,
        ChangeKind::StaticMethodRemoved,
        ChangeKind::StaticMethodSignatureChanged,
        &mut out,
    );

    for (sig, before) in &prev.method_headers {
        let Some(after) = cur.method_headers.get(sig) else {
            continue;
        };
        if before.exceptions != after.exceptions {
            out.insert(ChangeKind::ExceptionsChanged);
        }
        if before.access != after.access {
            out.insert(ChangeKind::ModifierChanged);
        }
    }
    out
}

/// Method slots whose fingerprint differs or that exist on one side only.
pub fn compute_changed_methods(prev: &UnitChecksums, cur: &UnitChecksums) -> BTreeSet<MethodKey> {
    let before: BTreeMap<&String, &Fingerprint> = prev
        .constructors
        .iter()
        .chain(&prev.instance_methods)
        .chain(&prev.static_methods)
        .collect();
    let after: BTreeMap<&String, &Fingerprint> = cur
        .constructors
        .iter()
        .chain(&cur.instance_methods)
        .chain(&cur.static_methods)
        .collect();

    let mut changed = BTreeSet::new();
    for (sig, fp) in &before {
        if after.get(sig) != Some(fp) {
            changed.insert(MethodKey::new(prev.name.clone(), (*sig).clone()));
        }
    }
    for sig in after.keys() {
        if !before.contains_key(sig) {
            changed.insert(MethodKey::new(cur.name.clone(), (*sig).clone()));
        }
    }
    changed
}

/// Field slots whose fingerprint differs or that exist on one side only.
pub fn compute_changed_fields(prev: &UnitChecksums, cur: &UnitChecksums) -> BTreeSet<FieldKey> {
    let mut changed = BTreeSet::new();
    let keys: BTreeSet<&String> = prev
        .field_fingerprints
        .keys()
        .chain(cur.field_fingerprints.keys())
        .collect();
    for key in keys {
        if prev.field_fingerprints.get(key) == cur.field_fingerprints.get(key) {
            continue;
        }
        if let Some((name, descriptor)) = key.split_once(':') {
            changed.insert(FieldKey::new(&cur.name, name, descriptor));
        }
    }
    changed
}

/// Instance methods present only in `cur`, excluding initializers. These
/// may shadow an ancestor's implementation.
pub fn added_instance_methods(prev: &UnitChecksums, cur: &UnitChecksums) -> BTreeSet<String> {
    cur.instance_methods
        .keys()
        .filter(|sig| !prev.instance_methods.contains_key(*sig))
        .filter(|sig| !is_initializer(signature_name(sig)))
        .cloned()
        .collect()
}

/// Coarse-grained equality used by the class-level policy.
///
/// Field sets may differ on one side only, constructors must be identical,
/// and method maps must match, except that purely added methods are
/// tolerated on a unit that is neither a fixture nor part of an application
/// hierarchy.
pub fn snapshots_equivalent(
    prev: &UnitChecksums,
    cur: &UnitChecksums,
    is_fixture: bool,
    in_hierarchy: bool,
) -> bool {
    if prev.super_name != cur.super_name
        || prev.interfaces != cur.interfaces
        || prev.header != cur.header
    {
        return false;
    }
    let (added, removed) = field_diff(prev, cur);
    if added > 0 && removed > 0 {
        return false;
    }
    if prev.constructors != cur.constructors {
        return false;
    }
    let instance = diff_methods(&prev.instance_methods, &cur.instance_methods);
    let statics = diff_methods(&prev.static_methods, &cur.static_methods);
    if instance.is_empty() && statics.is_empty() {
        return prev.method_headers == cur.method_headers;
    }
    let only_added = instance.removed.is_empty()
        && instance.renamed.is_empty()
        && statics.removed.is_empty()
        && statics.renamed.is_empty();
    only_added && !is_fixture && !in_hierarchy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::fingerprint::fingerprint_bytes;
    use crate::fixtures::{ClassBuilder, CodeBuilder};
    use crate::indexer::parser::{ACC_PUBLIC, ACC_STATIC};

    fn snap(builder: ClassBuilder) -> UnitChecksums {
        fingerprint_bytes(&builder.build(), builder.name()).unwrap().1
    }

    fn base(name: &str) -> ClassBuilder {
        ClassBuilder::new(name)
            .default_constructor()
            .method(ACC_PUBLIC, "f", "()I", CodeBuilder::new().iconst(1).ireturn())
            .method(ACC_STATIC, "s", "()V", CodeBuilder::new().ret())
    }

    #[test]
    fn test_identical_snapshots_classify_empty() {
        let a = snap(base("app.A"));
        let b = snap(base("app.A").debug_lines(10));
        assert!(classify(&a, &b).is_empty());
        assert!(compute_changed_methods(&a, &b).is_empty());
        assert!(snapshots_equivalent(&a, &b, true, true));
    }

    #[test]
    fn test_body_edit_is_added_and_removed() {
        let a = snap(base("app.A"));
        let b = snap(
            ClassBuilder::new("app.A")
                .default_constructor()
                .method(ACC_PUBLIC, "f", "()I", CodeBuilder::new().iconst(2).ireturn())
                .method(ACC_STATIC, "s", "()V", CodeBuilder::new().ret()),
        );
        let c = classify(&a, &b);
        assert!(c.contains(ChangeKind::InstanceMethodAdded));
        assert!(c.contains(ChangeKind::InstanceMethodRemoved));
        assert!(!c.is_conservative());
        assert_eq!(
            compute_changed_methods(&a, &b),
            BTreeSet::from([MethodKey::new("app.A", "f()I")])
        );
        assert!(!snapshots_equivalent(&a, &b, false, false));
    }

    #[test]
    fn test_rename_is_signature_change() {
        let a = snap(base("app.A"));
        let b = snap(
            ClassBuilder::new("app.A")
                .default_constructor()
                .method(ACC_PUBLIC, "g", "()I", CodeBuilder::new().iconst(1).ireturn())
                .method(ACC_STATIC, "s", "()V", CodeBuilder::new().ret()),
        );
        let c = classify(&a, &b);
        assert_eq!(
            c.kinds,
            BTreeSet::from([ChangeKind::InstanceMethodSignatureChanged])
        );
        assert_eq!(compute_changed_methods(&a, &b).len(), 2);
    }

    #[test]
    fn test_field_added_when_previous_set_empty() {
        let a = snap(ClassBuilder::new("app.F"));
        let b = snap(ClassBuilder::new("app.F").field(0, "x", "I"));
        let c = classify(&a, &b);
        assert!(c.contains(ChangeKind::FieldAdded));
        assert!(!c.contains(ChangeKind::FieldRemoved));
        assert!(!c.contains(ChangeKind::FieldChanged));
        assert!(snapshots_equivalent(&a, &b, false, false));
        assert_eq!(
            compute_changed_fields(&a, &b),
            BTreeSet::from([FieldKey::new("app.F", "x", "I")])
        );
    }

    #[test]
    fn test_field_constant_change_is_field_changed() {
        let a = snap(ClassBuilder::new("app.F").int_constant_field("N", 1));
        let b = snap(ClassBuilder::new("app.F").int_constant_field("N", 2));
        let c = classify(&a, &b);
        assert!(c.contains(ChangeKind::FieldChanged));
        assert!(!snapshots_equivalent(&a, &b, false, false));
    }

    #[test]
    fn test_field_removed() {
        let a = snap(ClassBuilder::new("app.F").field(0, "x", "I"));
        let b = snap(ClassBuilder::new("app.F"));
        assert!(classify(&a, &b).contains(ChangeKind::FieldRemoved));
    }

    #[test]
    fn test_super_class_change_is_conservative() {
        let a = snap(ClassBuilder::new("app.S"));
        let b = snap(ClassBuilder::new("app.S").extends("app.Base"));
        let c = classify(&a, &b);
        assert!(c.contains(ChangeKind::SuperClassChanged));
        assert!(c.is_conservative());
        assert!(!snapshots_equivalent(&a, &b, false, false));
    }

    #[test]
    fn test_constructor_statement_order_is_ignored() {
        let ctor = |first: &str, second: &str| {
            ClassBuilder::new("app.P")
                .field(0, "a", "I")
                .field(0, "b", "I")
                .method(
                    ACC_PUBLIC,
                    "<init>",
                    "()V",
                    CodeBuilder::new()
                        .aload(0)
                        .invokespecial("java.lang.Object", "<init>", "()V")
                        .aload(0)
                        .iconst(1)
                        .putfield("app.P", first, "I")
                        .aload(0)
                        .iconst(1)
                        .putfield("app.P", second, "I")
                        .ret(),
                )
        };
        let a = snap(ctor("a", "b"));
        let b = snap(ctor("b", "a"));
        assert_eq!(a.constructors, b.constructors);
        assert!(!classify(&a, &b).contains(ChangeKind::ConstructorUpdated));
    }

    #[test]
    fn test_exceptions_and_modifiers() {
        let a = snap(ClassBuilder::new("app.E").method(ACC_PUBLIC, "io", "()V", CodeBuilder::new().ret()));
        let b = snap(
            ClassBuilder::new("app.E")
                .method(ACC_PUBLIC, "io", "()V", CodeBuilder::new().ret())
                .throws("java.io.IOException"),
        );
        assert!(classify(&a, &b).contains(ChangeKind::ExceptionsChanged));

        let c = snap(ClassBuilder::new("app.E").method(0, "io", "()V", CodeBuilder::new().ret()));
        assert!(classify(&a, &c).contains(ChangeKind::ModifierChanged));
    }

    #[test]
    fn test_added_method_asymmetry() {
        let a = snap(ClassBuilder::new("app.Util"));
        let b = snap(
            ClassBuilder::new("app.Util").method(ACC_PUBLIC, "helper", "()V", CodeBuilder::new().ret()),
        );
        assert!(snapshots_equivalent(&a, &b, false, false));
        assert!(!snapshots_equivalent(&a, &b, true, false));
        assert!(!snapshots_equivalent(&a, &b, false, true));
        assert_eq!(
            added_instance_methods(&a, &b),
            BTreeSet::from(["helper()V".to_string()])
        );
        assert!(classify(&a, &b).adds_methods());
    }
}
