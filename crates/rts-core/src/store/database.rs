//! Persistent dependency store.
//!
//! Loading is tolerant: a missing or unreadable store is reported as absent
//! (first run), malformed record lines are skipped. Saving is atomic per
//! file: content goes to a temporary file in the store directory and is
//! renamed over the target, so a crash leaves the previous store intact.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::checksum::fingerprint::UnitChecksums;
use crate::config::{SelectionSettings, StoreEncoding};
use crate::errors::{RtsError, RtsResult};
use crate::models::{DependencyId, Fingerprint};
use crate::store::schema::{
    self, discriminator_line, parse_discriminator, parse_record_line, parse_wildcard_line,
    record_line, wildcard_line, SnapshotHeader, DEPENDENCIES_FILE, SNAPSHOTS_FILE,
};

/// One persisted record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredDependency {
    pub fingerprint: Fingerprint,
    pub tests: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyStore {
    /// Tests attributed to every dependency.
    pub wildcard: BTreeSet<String>,
    pub records: BTreeMap<DependencyId, StoredDependency>,
    /// Ordered test list read from an indexed store.
    pub known_tests: BTreeSet<String>,
}

fn write_atomically(dir: &Path, file_name: &str, content: &str) -> RtsResult<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    Ok(())
}

impl DependencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: DependencyId, fingerprint: Fingerprint, tests: BTreeSet<String>) {
        self.records
            .insert(id, StoredDependency { fingerprint, tests });
    }

    /// Every test the store has seen: wildcard, indexed list and record
    /// attributions.
    pub fn tests(&self) -> BTreeSet<String> {
        let mut all = self.wildcard.clone();
        all.extend(self.known_tests.iter().cloned());
        for record in self.records.values() {
            all.extend(record.tests.iter().cloned());
        }
        all
    }

    /// Records grouped by the unit whose artifact backs them.
    pub fn by_owner(&self) -> BTreeMap<&str, Vec<(&DependencyId, &StoredDependency)>> {
        let mut grouped: BTreeMap<&str, Vec<(&DependencyId, &StoredDependency)>> = BTreeMap::new();
        for (id, record) in &self.records {
            grouped.entry(id.owner()).or_default().push((id, record));
        }
        grouped
    }

    /// Reject a store that would persist an inconsistent baseline: every
    /// record must be backed by a unit of the current build.
    pub fn validate(&self, unit_exists: impl Fn(&str) -> bool) -> RtsResult<()> {
        let orphans: Vec<String> = self
            .records
            .keys()
            .filter(|id| !unit_exists(id.owner()))
            .map(ToString::to_string)
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        Err(RtsError::Invariant(format!(
            "{} record(s) reference units absent from the build, e.g. {}",
            orphans.len(),
            orphans[0]
        )))
    }

    // -----------------------------------------------------------------------
    // Text format
    // -----------------------------------------------------------------------

    pub fn render(&self, encoding: StoreEncoding) -> String {
        let mut out = String::new();
        if !self.wildcard.is_empty() {
            out.push_str(&wildcard_line(&self.wildcard));
            out.push('\n');
        }
        out.push_str(&discriminator_line(encoding));
        out.push('\n');
        match encoding {
            StoreEncoding::Names => {
                for (id, record) in &self.records {
                    out.push_str(&record_line(id, &record.fingerprint, &record.tests, None));
                    out.push('\n');
                }
            }
            StoreEncoding::Indexed => {
                let mut order: BTreeSet<String> = self.known_tests.clone();
                for record in self.records.values() {
                    order.extend(record.tests.iter().cloned());
                }
                let order: Vec<String> = order.into_iter().collect();
                out.push_str(&format!("{}\n", order.len()));
                for name in &order {
                    out.push_str(name);
                    out.push('\n');
                }
                let lookup = |t: &str| order.binary_search_by(|n| n.as_str().cmp(t)).ok();
                for (id, record) in &self.records {
                    out.push_str(&record_line(
                        id,
                        &record.fingerprint,
                        &record.tests,
                        Some(&lookup),
                    ));
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Parse store text. `None` when the header is unusable.
    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let mut store = DependencyStore::new();

        let first = lines.next()?;
        let header = match parse_wildcard_line(first) {
            Some(tests) => {
                store.wildcard = tests;
                lines.next()?
            }
            None => first,
        };
        let Some(encoding) = parse_discriminator(header) else {
            warn!("Unrecognized dependency store header: {header}");
            return None;
        };

        let names: Option<Vec<String>> = match encoding {
            StoreEncoding::Names => None,
            StoreEncoding::Indexed => {
                let count: usize = match lines.next()?.trim().parse() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!("Dependency store test count is not a number");
                        return None;
                    }
                };
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(lines.next()?.trim().to_string());
                }
                store.known_tests = names.iter().cloned().collect();
                Some(names)
            }
        };

        let mut skipped = 0usize;
        for line in lines {
            match parse_record_line(line, names.as_deref()) {
                Some((id, fingerprint, tests)) => store.insert(id, fingerprint, tests),
                None => {
                    skipped += 1;
                    warn!("Skipping malformed dependency line: {line}");
                }
            }
        }
        debug!(
            records = store.records.len(),
            skipped,
            wildcard = store.wildcard.len(),
            "Parsed dependency store"
        );
        Some(store)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Load the store under `dir`. `Ok(None)` signals a first run.
    pub fn load(dir: &Path) -> RtsResult<Option<Self>> {
        let path = dir.join(DEPENDENCIES_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No dependency store at {}; treating as first run", path.display());
                return Ok(None);
            }
            Err(e) => {
                warn!("Cannot read {}: {e}; treating as first run", path.display());
                return Ok(None);
            }
        };
        Ok(Self::parse(&content))
    }

    pub fn save(&self, dir: &Path, settings: &SelectionSettings) -> RtsResult<()> {
        let encoding = settings.encoding_for(self.tests().len());
        write_atomically(dir, DEPENDENCIES_FILE, &self.render(encoding))?;
        debug!(records = self.records.len(), ?encoding, "Saved dependency store");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit snapshots
// ---------------------------------------------------------------------------

/// Load per-unit snapshots. Missing, foreign-version or unreadable files
/// yield an empty map; malformed lines are skipped.
pub fn load_snapshots(dir: &Path) -> BTreeMap<String, UnitChecksums> {
    let path = dir.join(SNAPSHOTS_FILE);
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Cannot read {}: {e}", path.display());
            }
            return BTreeMap::new();
        }
    };
    let mut lines = BufReader::new(file).lines();
    let header: Option<SnapshotHeader> = lines
        .next()
        .and_then(Result::ok)
        .and_then(|l| serde_json::from_str(&l).ok());
    match header {
        Some(h) if h.version == schema::STORE_VERSION => {}
        _ => {
            warn!("Ignoring snapshots with unknown header at {}", path.display());
            return BTreeMap::new();
        }
    }

    let mut snapshots = BTreeMap::new();
    for line in lines {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("Stopping snapshot read at {}: {e}", path.display());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UnitChecksums>(&line) {
            Ok(snapshot) => {
                snapshots.insert(snapshot.name.clone(), snapshot);
            }
            Err(e) => warn!("Skipping malformed snapshot line: {e}"),
        }
    }
    snapshots
}

pub fn save_snapshots<'a>(
    dir: &Path,
    snapshots: impl IntoIterator<Item = &'a UnitChecksums>,
) -> RtsResult<()> {
    let mut out = serde_json::to_string(&SnapshotHeader::default())?;
    out.push('\n');
    for snapshot in snapshots {
        out.push_str(&serde_json::to_string(snapshot)?);
        out.push('\n');
    }
    write_atomically(dir, SNAPSHOTS_FILE, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldKey, MethodKey};

    fn fp(hex: &str) -> Fingerprint {
        Fingerprint::from_hex(hex).unwrap()
    }

    fn sample() -> DependencyStore {
        let mut store = DependencyStore::new();
        store.wildcard.insert("app.ReflectTest".to_string());
        store.insert(
            DependencyId::Class("app.A".to_string()),
            fp("aa"),
            BTreeSet::from(["app.ATest".to_string(), "app.BTest".to_string()]),
        );
        store.insert(
            MethodKey::new("app.A", "f()V").into(),
            fp("bb"),
            BTreeSet::from(["app.ATest".to_string()]),
        );
        store.insert(FieldKey::new("app.A", "x", "I").into(), fp("cc"), BTreeSet::new());
        store
    }

    #[test]
    fn test_names_encoding_round_trip() {
        let store = sample();
        let text = store.render(StoreEncoding::Names);
        assert!(text.starts_with("* - app.ReflectTest\nrts-store v1 names\n"));
        assert!(text.contains("app.A.x:I cc\n"));
        assert_eq!(DependencyStore::parse(&text), Some(store));
    }

    #[test]
    fn test_indexed_encoding_round_trip() {
        let store = sample();
        let text = store.render(StoreEncoding::Indexed);
        assert!(text.contains("rts-store v1 indexed\n2\napp.ATest\napp.BTest\n"));
        assert!(text.contains("app.A aa 0,1\n"));
        let parsed = DependencyStore::parse(&text).unwrap();
        assert_eq!(parsed.records, store.records);
        assert_eq!(parsed.wildcard, store.wildcard);
        assert_eq!(parsed.tests(), store.tests());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let text = "rts-store v1 names\napp.A aa T1\ngarbage\napp.B zz!\napp.C cc T2\n";
        let store = DependencyStore::parse(text).unwrap();
        assert_eq!(store.records.len(), 2);
    }

    #[test]
    fn test_unusable_header_is_first_run() {
        assert!(DependencyStore::parse("").is_none());
        assert!(DependencyStore::parse("rts-store v9 names\n").is_none());
        assert!(DependencyStore::parse("rts-store v1 indexed\n3\nT1\n").is_none());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DependencyStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_with_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SelectionSettings {
            index_threshold: 1,
            ..SelectionSettings::default()
        };
        let store = sample();
        store.save(dir.path(), &settings).unwrap();
        let text = std::fs::read_to_string(dir.path().join(DEPENDENCIES_FILE)).unwrap();
        assert!(text.contains("indexed"));
        let loaded = DependencyStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.records, store.records);
    }

    #[test]
    fn test_validate_rejects_orphans() {
        let store = sample();
        assert!(store.validate(|u| u == "app.A").is_ok());
        assert!(matches!(
            store.validate(|_| false),
            Err(RtsError::Invariant(_))
        ));
    }

    #[test]
    fn test_snapshots_missing_and_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshots(dir.path()).is_empty());
        std::fs::write(dir.path().join(SNAPSHOTS_FILE), "{\"version\":42}\n").unwrap();
        assert!(load_snapshots(dir.path()).is_empty());
    }
}
