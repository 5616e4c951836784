//! Configuration Schema Migration
//!
//! Stored connection configuration carries a schema version. When the
//! schema changes, a migration step keyed by its source version upgrades the
//! stored shape. Steps are applied one after another until the target version
//! is reached or no step matches the current version.
//!
//! ## Version History
//!
//! - **1**: boolean `force_standard` flag
//! - **2**: `emulation_mode` label, `force_standard` left in place

use crate::config::{combine, ConfigEntry, ConfigMap, EmulationMode};
use crate::config::{CONF_EMULATION_MODE, CONF_FORCE_STANDARD};
use crate::{LinkError, Result, CURRENT_SCHEMA_VERSION};
use tracing::{debug, info, warn};

/// A single migration transform over a configuration mapping
pub type MigrationFn = fn(&mut ConfigMap) -> Result<()>;

/// One versioned migration step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version this step applies to
    pub from_version: u32,
    /// Version after this step
    pub to_version: u32,
    /// Short description for logs
    pub description: &'static str,
    /// Transform applied to the mapping
    pub transform: MigrationFn,
}

/// Ordered set of migration steps
#[derive(Debug, Clone)]
pub struct Migrator {
    migrations: Vec<Migration>,
    target_version: u32,
}

impl Default for Migrator {
    fn default() -> Self {
        let mut migrator = Self::new(CURRENT_SCHEMA_VERSION);
        migrator.migrations.push(Migration {
            from_version: 1,
            to_version: 2,
            description: "force_standard flag to emulation_mode",
            transform: force_standard_to_emulation_mode,
        });
        migrator
    }
}

impl Migrator {
    /// Create an empty migrator targeting `target_version`
    pub fn new(target_version: u32) -> Self {
        Self {
            migrations: Vec::new(),
            target_version,
        }
    }

    /// Register a migration step
    ///
    /// Steps must move forward and there can be only one step per source
    /// version.
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if migration.to_version <= migration.from_version {
            return Err(LinkError::InvalidState(format!(
                "migration {} -> {} does not move forward",
                migration.from_version, migration.to_version
            )));
        }
        if self
            .migrations
            .iter()
            .any(|m| m.from_version == migration.from_version)
        {
            return Err(LinkError::InvalidState(format!(
                "a migration from version {} is already registered",
                migration.from_version
            )));
        }
        self.migrations.push(migration);
        Ok(())
    }

    /// Schema version this migrator upgrades to
    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Migrate `data` stored at `stored_version`
    ///
    /// Returns the new version and the migrated mapping. Data already at the
    /// target version comes back unchanged. Unknown keys are preserved.
    pub fn migrate(&self, stored_version: u32, data: &ConfigMap) -> Result<(u32, ConfigMap)> {
        let mut version = stored_version;
        let mut migrated = data.clone();

        if version > self.target_version {
            warn!(
                "Stored configuration version {} is newer than supported version {}",
                version, self.target_version
            );
        }

        while version < self.target_version {
            let Some(step) = self.migrations.iter().find(|m| m.from_version == version) else {
                debug!("No migration registered from version {}", version);
                break;
            };

            debug!(
                "Migrating from version {} to {}: {}",
                step.from_version, step.to_version, step.description
            );
            (step.transform)(&mut migrated)?;
            version = step.to_version;
        }

        if version != stored_version {
            info!("Migration to version {} successful", version);
        }

        Ok((version, migrated))
    }

    /// Migrate then combine with override data
    pub fn migrate_and_combine(
        &self,
        stored_version: u32,
        data: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<(u32, ConfigMap)> {
        let (version, migrated) = self.migrate(stored_version, data)?;
        Ok((version, combine(&migrated, overrides)))
    }

    /// Migrate a persisted entry in place
    ///
    /// `data` is always migrated. `options` is migrated too when it still
    /// carries the legacy flag; otherwise it is left as is and picks up the
    /// migrated keys when setup stores the merged config as options.
    /// On failure the entry is left untouched. Returns whether the entry
    /// changed.
    pub fn migrate_entry(&self, entry: &mut ConfigEntry) -> Result<bool> {
        if entry.version >= self.target_version {
            return Ok(false);
        }

        debug!("Migrating entry {} from version {}", entry.entry_id, entry.version);

        let (version, data) = self.migrate(entry.version, &entry.data)?;
        let options = if entry.options.contains_key(CONF_FORCE_STANDARD) {
            Some(self.migrate(entry.version, &entry.options)?.1)
        } else {
            None
        };

        let changed = version != entry.version;
        entry.version = version;
        entry.data = data;
        if let Some(options) = options {
            entry.options = options;
        }

        Ok(changed)
    }
}

/// Migrate `data` with the built-in migration chain
pub fn migrate(stored_version: u32, data: &ConfigMap) -> Result<(u32, ConfigMap)> {
    Migrator::default().migrate(stored_version, data)
}

/// Migrate `data` with the built-in chain and combine it with `overrides`
pub fn migrate_and_combine(
    stored_version: u32,
    data: &ConfigMap,
    overrides: &ConfigMap,
) -> Result<(u32, ConfigMap)> {
    Migrator::default().migrate_and_combine(stored_version, data, overrides)
}

/// Version 1 -> 2: derive `emulation_mode` from `force_standard`
fn force_standard_to_emulation_mode(data: &mut ConfigMap) -> Result<()> {
    let flag = data.get(CONF_FORCE_STANDARD).ok_or_else(|| {
        LinkError::MalformedLegacyConfig(format!("missing {}", CONF_FORCE_STANDARD))
    })?;

    let force_standard = flag.as_bool().ok_or_else(|| {
        LinkError::MalformedLegacyConfig(format!(
            "{} must be a boolean, found {}",
            CONF_FORCE_STANDARD, flag
        ))
    })?;

    let mode = EmulationMode::from_force_standard(force_standard);
    info!(
        "Migration: {} is {} so using {}",
        CONF_FORCE_STANDARD, force_standard, mode
    );
    data.insert(CONF_EMULATION_MODE.to_string(), mode.as_str().into());
    Ok(())
}
