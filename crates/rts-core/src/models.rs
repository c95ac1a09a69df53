//! Shared typed models used across indexing, checksum, storage, and query layers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Name of instance constructors in compiled units.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// Name of the type (static) initializer in compiled units.
pub const STATIC_INITIALIZER_NAME: &str = "<clinit>";

/// Identifier of the wildcard dependency ("depended on by every test").
pub const WILDCARD_ID: &str = "*";

// ---------------------------------------------------------------------------
// Name helpers
// ---------------------------------------------------------------------------

/// Convert an internal binary name (`com/foo/A`) to its dotted form (`com.foo.A`).
pub fn dotted_name(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Convert a dotted unit name to the relative artifact path (`com/foo/A.class`).
pub fn artifact_path(unit: &str) -> String {
    format!("{}.class", unit.replace('.', "/"))
}

/// Last segment of a dotted unit name (`com.foo.A$B` -> `A$B`).
pub fn simple_name(unit: &str) -> &str {
    unit.rsplit('.').next().unwrap_or(unit)
}

/// Whether a method name denotes a constructor or a type initializer.
pub fn is_initializer(method_name: &str) -> bool {
    method_name == CONSTRUCTOR_NAME || method_name == STATIC_INITIALIZER_NAME
}

/// Name part of a `name(descriptor)` signature.
pub fn signature_name(signature: &str) -> &str {
    signature.split('(').next().unwrap_or(signature)
}

// ---------------------------------------------------------------------------
// MethodKey / FieldKey
// ---------------------------------------------------------------------------

/// A method slot: owning unit plus `name(descriptor)`.
///
/// Rendered as `com.foo.A#f()V`. A signature change is a different key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub owner: String,
    pub signature: String,
}

impl MethodKey {
    pub fn new(owner: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            signature: signature.into(),
        }
    }

    /// Build a key from a method name and its erased descriptor.
    pub fn from_parts(owner: &str, name: &str, descriptor: &str) -> Self {
        Self::new(owner, format!("{name}{descriptor}"))
    }

    pub fn name(&self) -> &str {
        signature_name(&self.signature)
    }

    /// Constructors and type initializers are never dispatched dynamically.
    pub fn is_initializer(&self) -> bool {
        is_initializer(self.name())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (owner, signature) = value.split_once('#')?;
        if owner.is_empty() || !signature.contains('(') {
            return None;
        }
        Some(Self::new(owner, signature))
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.signature)
    }
}

/// A field slot, rendered as `com.foo.A.count:I`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl FieldKey {
    pub fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.contains('#') {
            return None;
        }
        let (head, descriptor) = value.split_once(':')?;
        let (owner, name) = head.rsplit_once('.')?;
        if owner.is_empty() || name.is_empty() || descriptor.is_empty() {
            return None;
        }
        Some(Self::new(owner, name, descriptor))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor)
    }
}

// ---------------------------------------------------------------------------
// DependencyId
// ---------------------------------------------------------------------------

/// Identity of a tracked dependency in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyId {
    Class(String),
    Method(MethodKey),
    Field(FieldKey),
}

impl DependencyId {
    /// The unit whose artifact must be resolved to fingerprint this dependency.
    pub fn owner(&self) -> &str {
        match self {
            DependencyId::Class(name) => name,
            DependencyId::Method(key) => &key.owner,
            DependencyId::Field(key) => &key.owner,
        }
    }

    pub fn is_class(&self) -> bool {
        matches!(self, DependencyId::Class(_))
    }

    /// Parse a store identifier. Returns `None` for malformed identifiers.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || value == WILDCARD_ID || value.contains(char::is_whitespace) {
            return None;
        }
        if value.contains('#') {
            return MethodKey::parse(value).map(DependencyId::Method);
        }
        if value.contains(':') {
            return FieldKey::parse(value).map(DependencyId::Field);
        }
        Some(DependencyId::Class(value.to_string()))
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyId::Class(name) => f.write_str(name),
            DependencyId::Method(key) => key.fmt(f),
            DependencyId::Field(key) => key.fmt(f),
        }
    }
}

impl From<MethodKey> for DependencyId {
    fn from(key: MethodKey) -> Self {
        DependencyId::Method(key)
    }
}

impl From<FieldKey> for DependencyId {
    fn from(key: FieldKey) -> Self {
        DependencyId::Field(key)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of a normalized representation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the lines in the order given.
    pub fn ordered<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.as_ref().as_bytes());
            hasher.update(b"\n");
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Hash the lines as a multiset: any permutation yields the same value.
    pub fn unordered<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut sorted: Vec<&str> = lines.iter().map(|l| l.as_ref()).collect();
        sorted.sort_unstable();
        Self::ordered(&sorted)
    }

    /// Accept a stored hex digest. Returns `None` for anything non-hex.
    pub fn from_hex(value: &str) -> Option<Self> {
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Fingerprint(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
