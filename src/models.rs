//! Model descriptors and the local model catalog

use crate::error::{EnhanceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the catalog manifest inside the model root
pub const CATALOG_FILE: &str = "models.json";

/// A model file resolved against a model root
///
/// The key (e.g. `"4x/RealESRGAN.pth"`) is the stable reference recorded on operations so
/// they can be re-run later; the display name is `<parent dir>_<file stem>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    key: String,
    path: PathBuf,
    name: String,
}

impl ModelDescriptor {
    pub fn new<P: AsRef<Path>, S: Into<String>>(root: P, key: S) -> Self {
        let key = key.into();
        let path = root.as_ref().join(&key);
        let name = Self::display_name(&path);
        Self { key, path, name }
    }

    fn display_name(path: &Path) -> String {
        let file_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir_stem = path
            .parent()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{dir_stem}_{file_stem}")
    }

    /// Display name used in cache filenames and logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key relative to the model root
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Full path of the model file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// Catalog metadata for one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operation: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub installed: bool,
}

/// Model path → metadata, persisted as `models.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ModelCatalog {
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog manifest; a missing file yields an empty catalog
    ///
    /// # Errors
    /// - Unreadable file
    /// - Malformed JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No model catalog at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| EnhanceError::file_io_error("read model catalog", path, &e))?;
        let catalog: Self = serde_json::from_str(&content)?;
        log::debug!("Loaded {} catalog entries from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// # Errors
    /// - Directory creation or write failures
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| EnhanceError::file_io_error("create catalog directory", parent, &e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| EnhanceError::file_io_error("write model catalog", path, &e))?;
        Ok(())
    }

    pub fn insert<S: Into<String>>(&mut self, path: S, entry: ModelEntry) {
        self.entries.insert(path.into(), entry);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ModelEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Installed entries, ordered by path
    #[must_use]
    pub fn installed(&self) -> Vec<(&String, &ModelEntry)> {
        self.entries.iter().filter(|(_, e)| e.installed).collect()
    }

    /// Entries whose first listed operation matches `operation`
    #[must_use]
    pub fn by_operation(&self, operation: &str) -> Vec<(&String, &ModelEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.operation.first().is_some_and(|op| op == operation))
            .collect()
    }

    /// # Errors
    /// - Unknown model path
    pub fn mark_installed(&mut self, path: &str, installed: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| EnhanceError::model(format!("Unknown model '{path}'")))?;
        entry.installed = installed;
        Ok(())
    }

    /// Set every `installed` flag from the presence of the file under `root`
    ///
    /// Returns the number of entries whose flag changed.
    pub fn refresh_installed<P: AsRef<Path>>(&mut self, root: P) -> usize {
        let root = root.as_ref();
        let mut changed = 0;
        for (path, entry) in &mut self.entries {
            let present = root.join(path).is_file();
            if entry.installed != present {
                entry.installed = present;
                changed += 1;
            }
        }
        if changed > 0 {
            log::info!("📦 Refreshed install state of {changed} models");
        }
        changed
    }

    /// Adopt remote metadata while keeping local install flags
    ///
    /// Entries known only locally are kept.
    pub fn merge(&mut self, remote: Self) {
        for (path, mut entry) in remote.entries {
            entry.installed = self.entries.get(&path).is_some_and(|e| e.installed);
            self.entries.insert(path, entry);
        }
    }
}
