//! Persistence of normalized records.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::HarvestConfig;
use crate::model::{CanonicalRecord, CommonData, PackageId};
use crate::traits::{PackageSink, SinkError};

/// One category of the in-memory database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecords {
    pub common: Option<CommonData>,

    /// Keyed by `name-version`
    pub packages: BTreeMap<String, StoredPackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPackage {
    pub id: PackageId,
    pub record: CanonicalRecord,
}

/// [`PackageSink`] that keeps everything in memory and can dump it as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDatabase {
    pub categories: BTreeMap<String, CategoryRecords>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package_count(&self) -> usize {
        self.categories.values().map(|c| c.packages.len()).sum()
    }

    pub fn get(&self, id: &PackageId) -> Option<&CanonicalRecord> {
        self.categories
            .get(&id.category)?
            .packages
            .get(&format!("{}-{}", id.name, id.version))
            .map(|stored| &stored.record)
    }

    /// Writes the database as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), SinkError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn category_mut(&mut self, name: &str) -> Result<&mut CategoryRecords, SinkError> {
        self.categories
            .get_mut(name)
            .ok_or_else(|| SinkError::UnknownCategory(name.to_string()))
    }
}

impl PackageSink for MemoryDatabase {
    fn add_category(&mut self, name: &str) -> Result<(), SinkError> {
        self.categories.entry(name.to_string()).or_default();
        Ok(())
    }

    fn set_common_data(&mut self, category: &str, data: &CommonData) -> Result<(), SinkError> {
        self.category_mut(category)?.common = Some(data.clone());
        Ok(())
    }

    fn add_package(&mut self, id: PackageId, record: CanonicalRecord) -> Result<(), SinkError> {
        let key = format!("{}-{}", id.name, id.version);
        self.category_mut(&id.category)?
            .packages
            .insert(key, StoredPackage { id, record });
        Ok(())
    }
}

/// Registers the configured category with its common data and hands every
/// record to the sink. Returns the number of records written.
///
/// # Errors
///
/// Stops at the first [`SinkError`].
pub fn publish<S, I>(sink: &mut S, config: &HarvestConfig, records: I) -> Result<usize, SinkError>
where
    S: PackageSink + ?Sized,
    I: IntoIterator<Item = (PackageId, CanonicalRecord)>,
{
    sink.add_category(&config.category)?;
    sink.set_common_data(&config.category, &config.common)?;

    let mut written = 0;
    for (id, record) in records {
        sink.add_package(id, record)?;
        written += 1;
    }
    info!(category = %config.category, packages = written, "Published records");
    Ok(written)
}
