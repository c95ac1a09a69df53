//! On-disk layout of the dependency store.
//!
//! ```text
//! * - T1,T2                   optional wildcard line (always names)
//! rts-store v1 names          discriminator: `names` or `indexed`
//! 2                           indexed only: test count
//! T1                          indexed only: ordered test names
//! T2
//! com.a.A 9f0c... T1,T2       <identifier> <fingerprint> [<tests>]
//! ```
//!
//! `checksums.jsonl` holds one [`SnapshotHeader`] line followed by one unit
//! snapshot per line.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::StoreEncoding;
use crate::models::{DependencyId, Fingerprint, WILDCARD_ID};

pub const DEPENDENCIES_FILE: &str = "dependencies";
pub const SNAPSHOTS_FILE: &str = "checksums.jsonl";

pub const STORE_MAGIC: &str = "rts-store";

/// Current format version. Stores written by any other version are read as
/// absent, which degrades to first-run behavior.
pub const STORE_VERSION: u32 = 1;

/// Placeholder fingerprint of the wildcard line.
pub const WILDCARD_FINGERPRINT: &str = "-";

const TEST_SEPARATOR: char = ',';

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
        }
    }
}

fn encoding_label(encoding: StoreEncoding) -> &'static str {
    match encoding {
        StoreEncoding::Names => "names",
        StoreEncoding::Indexed => "indexed",
    }
}

pub fn discriminator_line(encoding: StoreEncoding) -> String {
    format!("{STORE_MAGIC} v{STORE_VERSION} {}", encoding_label(encoding))
}

/// Parse a discriminator line. `None` for a foreign or future format.
pub fn parse_discriminator(line: &str) -> Option<StoreEncoding> {
    let mut parts = line.split_whitespace();
    if parts.next()? != STORE_MAGIC {
        return None;
    }
    let version: u32 = parts.next()?.strip_prefix('v')?.parse().ok()?;
    if version != STORE_VERSION {
        return None;
    }
    let encoding = match parts.next()? {
        "names" => StoreEncoding::Names,
        "indexed" => StoreEncoding::Indexed,
        _ => return None,
    };
    parts.next().is_none().then_some(encoding)
}

pub fn wildcard_line(tests: &BTreeSet<String>) -> String {
    let joined: Vec<&str> = tests.iter().map(String::as_str).collect();
    format!(
        "{WILDCARD_ID} {WILDCARD_FINGERPRINT} {}",
        joined.join(&TEST_SEPARATOR.to_string())
    )
    .trim_end()
    .to_string()
}

/// Parse the optional leading wildcard line.
pub fn parse_wildcard_line(line: &str) -> Option<BTreeSet<String>> {
    let mut parts = line.split_whitespace();
    if parts.next()? != WILDCARD_ID || parts.next()? != WILDCARD_FINGERPRINT {
        return None;
    }
    let tests = parts.next().map(split_tests).unwrap_or_default();
    parts.next().is_none().then_some(tests)
}

fn split_tests(field: &str) -> BTreeSet<String> {
    field
        .split(TEST_SEPARATOR)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render one record. `index_of` maps a test to its position in the
/// ordered test list when the indexed encoding is in use.
pub fn record_line(
    id: &DependencyId,
    fingerprint: &Fingerprint,
    tests: &BTreeSet<String>,
    index_of: Option<&dyn Fn(&str) -> Option<usize>>,
) -> String {
    let rendered: Vec<String> = match index_of {
        Some(lookup) => {
            let mut indices: Vec<usize> = tests.iter().filter_map(|t| lookup(t)).collect();
            indices.sort_unstable();
            indices.iter().map(usize::to_string).collect()
        }
        None => tests.iter().cloned().collect(),
    };
    if rendered.is_empty() {
        format!("{id} {fingerprint}")
    } else {
        format!("{id} {fingerprint} {}", rendered.join(&TEST_SEPARATOR.to_string()))
    }
}

/// Parse one record line. `names` resolves indices in the indexed encoding;
/// an out-of-range index makes the whole line malformed.
pub fn parse_record_line(
    line: &str,
    names: Option<&[String]>,
) -> Option<(DependencyId, Fingerprint, BTreeSet<String>)> {
    let mut parts = line.split_whitespace();
    let id = DependencyId::parse(parts.next()?)?;
    let fingerprint = Fingerprint::from_hex(parts.next()?)?;
    let raw = parts.next().map(split_tests).unwrap_or_default();
    if parts.next().is_some() {
        return None;
    }
    let tests = match names {
        Some(names) => raw
            .iter()
            .map(|i| i.parse::<usize>().ok().and_then(|i| names.get(i).cloned()))
            .collect::<Option<BTreeSet<String>>>()?,
        None => raw,
    };
    Some((id, fingerprint, tests))
}
