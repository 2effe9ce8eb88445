//! In-memory config store
//!
//! Backs tests and the simulated mode of the binary.

use super::RECORD_KIND;
use crate::domain::{ConfigRecord, ConfigStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Config store holding records in a map
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: RwLock<BTreeMap<String, ConfigRecord>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all records, sorted
    pub fn names(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, name: &str) -> Result<Option<ConfigRecord>> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn create(&self, name: &str, data: ConfigRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(name) {
            return Err(Error::exists(RECORD_KIND, name));
        }
        records.insert(name.to_string(), data);
        Ok(())
    }

    async fn update(&self, name: &str, data: ConfigRecord) -> Result<()> {
        match self.records.write().get_mut(name) {
            Some(existing) => {
                *existing = data;
                Ok(())
            }
            None => Err(Error::not_found(RECORD_KIND, name)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.records
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(RECORD_KIND, name))
    }
}
