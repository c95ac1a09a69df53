//! Selection settings: defaults, environment overrides, and JSON loading.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::errors::{RtsError, RtsResult};
use crate::query::guards::{
    clamp_index_threshold, clamp_workers, default_workers, DEFAULT_INDEX_THRESHOLD,
};

/// Namespaces that are never analysed: platform, test frameworks, build tooling.
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    "java.",
    "javax.",
    "jdk.",
    "sun.",
    "com.sun.",
    "kotlin.",
    "scala.",
    "org.junit.",
    "junit.",
    "org.testng.",
    "org.hamcrest.",
    "org.mockito.",
    "org.assertj.",
    "org.apache.maven.",
    "org.gradle.",
];

pub const DEFAULT_FIXTURE_MARKER: &str = "Test";

/// Level at which dependencies are tracked and compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One record per unit; any fingerprint change affects every dependent test.
    Class,
    /// Unit records plus one record per method and field.
    Method,
}

impl Granularity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "class" => Some(Granularity::Class),
            "method" | "fine" => Some(Granularity::Method),
            _ => None,
        }
    }
}

/// How dependent tests are written in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEncoding {
    /// Test names inline on every record.
    Names,
    /// Integer indices into an ordered test list stored once.
    Indexed,
}

impl StoreEncoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "names" => Some(StoreEncoding::Names),
            "indexed" | "index" => Some(StoreEncoding::Indexed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SelectionSettings {
    pub granularity: Granularity,
    pub workers: usize,
    pub excluded_prefixes: Vec<String>,
    pub fixture_marker: String,
    pub index_threshold: usize,
    /// Forces an encoding regardless of `index_threshold`.
    pub encoding: Option<StoreEncoding>,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            granularity: Granularity::Method,
            workers: default_workers(),
            excluded_prefixes: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            fixture_marker: DEFAULT_FIXTURE_MARKER.to_string(),
            index_threshold: DEFAULT_INDEX_THRESHOLD as usize,
            encoding: None,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        _ => None,
    }
}

impl SelectionSettings {
    /// Defaults overlaid with `RTS_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> RtsResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: SelectionSettings = serde_json::from_str(&content)
            .map_err(|e| RtsError::Config(format!("{}: {e}", path.display())))?;
        settings.workers = clamp_workers(settings.workers as i64);
        Ok(settings)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_value("RTS_GRANULARITY") {
            match Granularity::parse(&v) {
                Some(g) => self.granularity = g,
                None => warn!("Ignoring RTS_GRANULARITY={v}"),
            }
        }
        if let Some(v) = env_value("RTS_WORKERS") {
            match v.parse::<i64>() {
                Ok(n) => self.workers = clamp_workers(n),
                Err(_) => warn!("Ignoring RTS_WORKERS={v}"),
            }
        }
        if let Some(v) = env_value("RTS_EXCLUDE") {
            self.excluded_prefixes.extend(
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(v) = env_value("RTS_FIXTURE_MARKER") {
            self.fixture_marker = v;
        }
        if let Some(v) = env_value("RTS_INDEX_THRESHOLD") {
            match v.parse::<i64>() {
                Ok(n) => self.index_threshold = clamp_index_threshold(n),
                Err(_) => warn!("Ignoring RTS_INDEX_THRESHOLD={v}"),
            }
        }
        if let Some(v) = env_value("RTS_STORE_ENCODING") {
            match StoreEncoding::parse(&v) {
                Some(e) => self.encoding = Some(e),
                None => warn!("Ignoring RTS_STORE_ENCODING={v}"),
            }
        }
        self
    }

    /// Whether a dotted unit name falls under an excluded namespace.
    pub fn is_excluded(&self, unit: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| unit.starts_with(prefix.as_str()))
    }

    /// Fixture-role heuristic: the simple name contains the marker.
    pub fn is_fixture(&self, unit: &str) -> bool {
        !self.fixture_marker.is_empty()
            && crate::models::simple_name(unit).contains(self.fixture_marker.as_str())
    }

    pub fn encoding_for(&self, test_count: usize) -> StoreEncoding {
        match self.encoding {
            Some(forced) => forced,
            None if test_count > self.index_threshold => StoreEncoding::Indexed,
            None => StoreEncoding::Names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exclusions() {
        let settings = SelectionSettings::default();
        assert!(settings.is_excluded("java.lang.Object"));
        assert!(settings.is_excluded("org.junit.Assert"));
        assert!(!settings.is_excluded("com.example.Service"));
        assert!(!settings.is_excluded("javalike.Thing"));
    }

    #[test]
    fn test_fixture_heuristic_uses_simple_name() {
        let settings = SelectionSettings::default();
        assert!(settings.is_fixture("com.example.ServiceTest"));
        assert!(settings.is_fixture("com.example.TestBase"));
        assert!(!settings.is_fixture("com.test.Service"));
    }

    #[test]
    fn test_encoding_threshold() {
        let settings = SelectionSettings {
            index_threshold: 2,
            ..SelectionSettings::default()
        };
        assert_eq!(settings.encoding_for(2), StoreEncoding::Names);
        assert_eq!(settings.encoding_for(3), StoreEncoding::Indexed);
        let forced = SelectionSettings {
            encoding: Some(StoreEncoding::Indexed),
            ..SelectionSettings::default()
        };
        assert_eq!(forced.encoding_for(1), StoreEncoding::Indexed);
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rts.json");
        std::fs::write(&path, r#"{"granularity":"class","workers":500}"#).unwrap();
        let settings = SelectionSettings::from_json_file(&path).unwrap();
        assert_eq!(settings.granularity, Granularity::Class);
        assert_eq!(settings.workers, 64);
        assert_eq!(settings.fixture_marker, "Test");
    }

    #[test]
    fn test_from_json_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rts.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SelectionSettings::from_json_file(&path),
            Err(RtsError::Config(_))
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(Granularity::parse(" Method "), Some(Granularity::Method));
        assert_eq!(Granularity::parse("class"), Some(Granularity::Class));
        assert_eq!(Granularity::parse("file"), None);
        assert_eq!(StoreEncoding::parse("index"), Some(StoreEncoding::Indexed));
    }
}
