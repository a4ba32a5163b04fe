use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use datapipe_core::ArgValue;

use crate::entry::{CatalogError, File, FileEntry, RawEntry};

/// The file catalog: an ordered list of entries loaded from a YAML
/// stream (one entry per document, or documents holding entry lists).
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    entries: Vec<FileEntry>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        let mut entries = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document)?;
            match value {
                serde_yaml::Value::Sequence(items) => {
                    for item in items {
                        entries.push(FileEntry::from_raw(serde_yaml::from_value::<RawEntry>(
                            item,
                        )?)?);
                    }
                }
                serde_yaml::Value::Null => {}
                other => {
                    entries.push(FileEntry::from_raw(serde_yaml::from_value::<RawEntry>(
                        other,
                    )?)?);
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&entry.to_raw())?);
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    pub fn append(&mut self, entry: FileEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Narrow the catalog: keep entries whose description contains every
    /// keyword (case-insensitive) and which can satisfy all option
    /// filters; matching entries come back with their options narrowed.
    pub fn select(
        &self,
        keywords: &[&str],
        filters: &BTreeMap<String, Vec<ArgValue>>,
    ) -> Result<FileCatalog, CatalogError> {
        let mut entries = Vec::new();
        for entry in &self.entries {
            let description = entry.description.to_lowercase();
            if !keywords
                .iter()
                .all(|kw| description.contains(&kw.to_lowercase()))
            {
                continue;
            }
            if !filters.keys().all(|name| entry.options.contains_key(name)) {
                continue;
            }
            entries.push(entry.select(filters)?);
        }
        Ok(FileCatalog { entries })
    }

    /// Iterate every concrete file of every entry.
    pub fn files(&self) -> impl Iterator<Item = File> + '_ {
        self.entries.iter().flat_map(|entry| entry.iter())
    }
}
