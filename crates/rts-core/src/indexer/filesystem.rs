//! Locating compiled units on disk or in memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::artifact_path;

const CLASS_EXTENSION: &str = "class";

/// Skipped everywhere: module and package descriptors carry no code.
const IMPLICIT_IGNORED_UNITS: &[&str] = &["module-info", "package-info"];

/// Resolves a dotted unit name to its compiled bytes.
///
/// `locate` returns `None` for deleted or renamed units; it never fails the
/// caller.
pub trait ArtifactResolver: Sync {
    fn locate(&self, unit: &str) -> Option<Vec<u8>>;

    /// Every unit currently available, in a stable order.
    fn units(&self) -> Vec<String>;
}

/// CRC-32 of the raw artifact bytes; equal checksums skip re-parsing.
pub fn raw_checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn is_ignored_unit(unit: &str) -> bool {
    let simple = unit.rsplit('.').next().unwrap_or(unit);
    IMPLICIT_IGNORED_UNITS.contains(&simple)
}

// ---------------------------------------------------------------------------
// Output directories
// ---------------------------------------------------------------------------

/// Resolver over one or more build output directories.
///
/// Earlier roots shadow later ones, matching classpath order.
#[derive(Clone, Debug)]
pub struct ClassDirResolver {
    roots: Vec<PathBuf>,
}

impl ClassDirResolver {
    pub fn new<P: Into<PathBuf>>(roots: impl IntoIterator<Item = P>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

fn unit_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}

impl ArtifactResolver for ClassDirResolver {
    fn locate(&self, unit: &str) -> Option<Vec<u8>> {
        let rel = artifact_path(unit);
        for root in &self.roots {
            let candidate = root.join(&rel);
            match std::fs::read(&candidate) {
                Ok(bytes) => return Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Cannot read {}: {e}", candidate.display());
                    return None;
                }
            }
        }
        None
    }

    fn units(&self) -> Vec<String> {
        let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();
        for root in &self.roots {
            if !root.is_dir() {
                debug!("Skipping missing output directory {}", root.display());
                continue;
            }
            for entry in WalkDir::new(root).follow_links(true).into_iter() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Skipping unreadable entry under {}: {e}", root.display());
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some(CLASS_EXTENSION)
                {
                    continue;
                }
                if let Some(name) = unit_name(root, path) {
                    if !is_ignored_unit(&name) {
                        found.entry(name).or_insert_with(|| path.to_path_buf());
                    }
                }
            }
        }
        found.into_keys().collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Resolver over bytes held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryResolver {
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: &str, bytes: Vec<u8>) {
        self.artifacts.insert(unit.to_string(), bytes);
    }

    pub fn remove(&mut self, unit: &str) -> Option<Vec<u8>> {
        self.artifacts.remove(unit)
    }

    pub fn with(mut self, unit: &str, bytes: Vec<u8>) -> Self {
        self.insert(unit, bytes);
        self
    }
}

impl ArtifactResolver for MemoryResolver {
    fn locate(&self, unit: &str) -> Option<Vec<u8>> {
        self.artifacts.get(unit).cloned()
    }

    fn units(&self) -> Vec<String> {
        self.artifacts
            .keys()
            .filter(|u| !is_ignored_unit(u))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_class_dir_units_and_locate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "com/a/A.class", b"a");
        write(dir.path(), "com/a/A$Inner.class", b"inner");
        write(dir.path(), "com/a/notes.txt", b"x");
        write(dir.path(), "module-info.class", b"m");

        let resolver = ClassDirResolver::new([dir.path()]);
        assert_eq!(
            resolver.units(),
            vec!["com.a.A".to_string(), "com.a.A$Inner".to_string()]
        );
        assert_eq!(resolver.locate("com.a.A$Inner"), Some(b"inner".to_vec()));
        assert_eq!(resolver.locate("com.a.Gone"), None);
    }

    #[test]
    fn test_earlier_root_shadows_later() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write(first.path(), "p/X.class", b"first");
        write(second.path(), "p/X.class", b"second");
        write(second.path(), "p/Y.class", b"y");
        let resolver = ClassDirResolver::new([first.path(), second.path()]);
        assert_eq!(resolver.locate("p.X"), Some(b"first".to_vec()));
        assert_eq!(resolver.units(), vec!["p.X".to_string(), "p.Y".to_string()]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let resolver = ClassDirResolver::new([PathBuf::from("/definitely/not/here")]);
        assert!(resolver.units().is_empty());
        assert!(resolver.locate("a.B").is_none());
    }

    #[test]
    fn test_memory_resolver() {
        let mut resolver = MemoryResolver::new().with("a.B", vec![1, 2]);
        assert_eq!(resolver.locate("a.B"), Some(vec![1, 2]));
        resolver.remove("a.B");
        assert!(resolver.locate("a.B").is_none());
        assert!(resolver.units().is_empty());
    }

    #[test]
    fn test_raw_checksum_is_stable() {
        assert_eq!(raw_checksum(b"hello"), 907060870);
        assert_ne!(raw_checksum(b"hello"), raw_checksum(b"hellp"));
    }
}
