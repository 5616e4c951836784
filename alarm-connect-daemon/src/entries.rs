//! Persisted Panel Entries
//!
//! Panel configuration entries live in `entries.toml`:
//!
//! ```toml
//! [[entry]]
//! entry_id = "0c3f6a52-..."
//! version = 2
//! title = "Panel 0"
//!
//! [entry.data]
//! panel_number = 0
//! device_type = "ethernet"
//! host = "192.168.1.40"
//! port = 10628
//!
//! [entry.options]
//! emulation_mode = "Standard"
//! ```
//!
//! Entries without an `entry_id` are given one on load.

use alarm_connect_core::{ConfigEntry, ConfigMap, ConnectionId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntryFile {
    #[serde(default, rename = "entry")]
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry_id: Option<ConnectionId>,
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    data: ConfigMap,
    #[serde(default)]
    options: ConfigMap,
}

/// Entries written before versioning are version 1
fn legacy_version() -> u32 {
    1
}

impl From<&ConfigEntry> for StoredEntry {
    fn from(entry: &ConfigEntry) -> Self {
        Self {
            entry_id: Some(entry.entry_id.clone()),
            version: entry.version,
            title: entry.title.clone(),
            data: entry.data.clone(),
            options: entry.options.clone(),
        }
    }
}

/// Entries file and its contents
#[derive(Debug)]
pub struct EntryStore {
    path: PathBuf,
    entries: Vec<ConfigEntry>,
}

impl EntryStore {
    /// Load entries from `path`
    ///
    /// A missing file is an empty store. Entries without an id get a fresh
    /// one and the file is written back.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                entries: Vec::new(),
            });
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read entries file {}", path.display()))?;
        let file: EntryFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse entries file {}", path.display()))?;

        let mut assigned = false;
        let entries = file
            .entries
            .into_iter()
            .map(|stored| {
                let entry_id = stored.entry_id.unwrap_or_else(|| {
                    assigned = true;
                    ConnectionId::new(Uuid::new_v4().to_string())
                });
                ConfigEntry {
                    entry_id,
                    version: stored.version,
                    title: stored.title,
                    data: stored.data,
                    options: stored.options,
                }
            })
            .collect();

        let store = Self {
            path: path.to_path_buf(),
            entries,
        };

        if assigned {
            info!("Assigned ids to new entries in {}", path.display());
            store.save()?;
        }

        Ok(store)
    }

    /// Write all entries back to the file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create entries directory")?;
        }

        let file = EntryFile {
            entries: self.entries.iter().map(StoredEntry::from).collect(),
        };
        let contents = toml::to_string_pretty(&file).context("Failed to serialize entries")?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write entries file {}", self.path.display()))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [ConfigEntry] {
        &mut self.entries
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConfigEntry> {
        self.entries.iter().find(|entry| &entry.entry_id == id)
    }

    /// Insert or replace an entry
    pub fn upsert(&mut self, entry: ConfigEntry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.entry_id == entry.entry_id)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConfigEntry> {
        let index = self.entries.iter().position(|entry| &entry.entry_id == id)?;
        Some(self.entries.remove(index))
    }
}

/// Difference between the running entries and a freshly loaded file
#[derive(Debug, Default, PartialEq)]
pub struct EntryChanges {
    /// Entries that are new in the file
    pub added: Vec<ConfigEntry>,
    /// Entries no longer in the file
    pub removed: Vec<ConnectionId>,
    /// Entries whose stored data changed and need a new connection
    pub replaced: Vec<ConfigEntry>,
    /// Entries whose options changed
    pub reconfigured: Vec<ConfigEntry>,
}

impl EntryChanges {
    /// Compare `current` entries with `loaded` ones
    pub fn between(current: &[ConfigEntry], loaded: &[ConfigEntry]) -> Self {
        let mut changes = Self::default();

        for entry in loaded {
            match current.iter().find(|c| c.entry_id == entry.entry_id) {
                None => changes.added.push(entry.clone()),
                Some(existing) if existing.data != entry.data || existing.version != entry.version => {
                    changes.replaced.push(entry.clone())
                }
                Some(existing) if existing.options != entry.options => {
                    changes.reconfigured.push(entry.clone())
                }
                Some(_) => {}
            }
        }

        changes.removed = current
            .iter()
            .filter(|c| !loaded.iter().any(|l| l.entry_id == c.entry_id))
            .map(|c| c.entry_id.clone())
            .collect();

        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.replaced.is_empty()
            && self.reconfigured.is_empty()
    }
}
