use std::collections::BTreeMap;
use std::path::Path;
use serde::Deserialize;
use tracing::{debug, info};
use crate::Nl2SqlError;

/// User-facing alternate terms for enum labels.
///
/// Keyed by the lowercase canonical label; this is configuration data and is
/// never derived from the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynonymTable {
    entries: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SynonymFile {
    #[serde(default)]
    synonyms: BTreeMap<String, Vec<String>>,
}

impl SynonymTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Employment-status synonyms used by the HR database.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert("intern", ["magang", "internship", "trainee"]);
        table.insert("probation", ["percobaan", "masa percobaan", "probasi", "trial"]);
        table.insert("permanent", ["tetap", "karyawan tetap", "permanen", "full-time"]);
        table.insert("contract", ["kontrak", "freelance", "kontrak kerja"]);
        table
    }

    /// Replace the synonyms of `canonical`.
    pub fn insert<I, S>(&mut self, canonical: &str, synonyms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let synonyms: Vec<String> = synonyms
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        self.entries.insert(canonical.to_lowercase(), synonyms);
    }

    /// Synonyms configured for a canonical label (case-insensitive).
    pub fn synonyms_for(&self, canonical: &str) -> &[String] {
        self.entries
            .get(&canonical.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Overlay another table; its keys replace ours.
    pub fn extend(&mut self, other: SynonymTable) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a `[synonyms]` table from a TOML, JSON or YAML file.
    pub fn from_file(path: &Path) -> Result<Self, Nl2SqlError> {
        debug!("Loading enum synonyms from {}", path.display());

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| Nl2SqlError::Config(format!("cannot read synonyms file {}: {}", path.display(), e)))?;

        let file: SynonymFile = settings
            .try_deserialize()
            .map_err(|e| Nl2SqlError::Config(format!("invalid synonyms file {}: {}", path.display(), e)))?;

        let mut table = Self::new();
        for (canonical, synonyms) in file.synonyms {
            table.insert(&canonical, synonyms);
        }

        info!("Loaded synonyms for {} enum values from {}", table.len(), path.display());
        Ok(table)
    }

    /// Built-in table, overlaid with the file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, Nl2SqlError> {
        let mut table = Self::builtin();
        if let Some(path) = path {
            table.extend(Self::from_file(path)?);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_lookup_is_case_insensitive() {
        let table = SynonymTable::builtin();
        assert_eq!(table.synonyms_for("Intern"), ["magang", "internship", "trainee"]);
        assert!(table.synonyms_for("resigned").is_empty());
    }

    #[test]
    fn test_blank_synonyms_dropped() {
        let mut table = SynonymTable::new();
        table.insert("retired", ["pensiun", "  ", ""]);
        assert_eq!(table.synonyms_for("retired"), ["pensiun"]);
    }

    #[test]
    fn test_load_overlays_file() {
        let path = std::env::temp_dir().join(format!("nl2sql_synonyms_{}.toml", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "[synonyms]").unwrap();
            writeln!(file, "intern = [\"magang\"]").unwrap();
            writeln!(file, "resigned = [\"keluar\", \"resign\"]").unwrap();
        }

        let table = SynonymTable::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(table.synonyms_for("intern"), ["magang"]);
        assert_eq!(table.synonyms_for("resigned"), ["keluar", "resign"]);
        assert_eq!(table.synonyms_for("contract"), ["kontrak", "freelance", "kontrak kerja"]);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SynonymTable::from_file(Path::new("/nonexistent/synonyms.toml")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
