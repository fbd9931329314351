use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{Backend, Table};
use crate::error::{FleetError, Result};

/// Process-local backend. Used by tests and by engines that do not need to
/// survive a restart.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> FleetError {
    FleetError::Store("memory backend mutex poisoned".to_string())
}

impl Backend for MemoryBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    fn cas(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        let rows = tables.entry(table).or_default();
        if rows.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(bytes) => {
                rows.insert(key.to_string(), bytes.to_vec());
            }
            None => {
                rows.remove(key);
            }
        }
        Ok(true)
    }

    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_insert_only_when_absent() {
        let b = MemoryBackend::new();
        assert!(b.cas(Table::Locks, "node:1", None, Some(b"a")).unwrap());
        assert!(!b.cas(Table::Locks, "node:1", None, Some(b"b")).unwrap());
        assert_eq!(b.get(Table::Locks, "node:1").unwrap().unwrap(), b"a");
    }

    #[test]
    fn cas_replace_and_delete_need_current_value() {
        let b = MemoryBackend::new();
        b.cas(Table::Actions, "k", None, Some(b"v1")).unwrap();
        assert!(!b.cas(Table::Actions, "k", Some(b"stale"), Some(b"v2")).unwrap());
        assert!(b.cas(Table::Actions, "k", Some(b"v1"), Some(b"v2")).unwrap());
        assert!(b.cas(Table::Actions, "k", Some(b"v2"), None).unwrap());
        assert!(b.get(Table::Actions, "k").unwrap().is_none());
    }

    #[test]
    fn tables_are_isolated() {
        let b = MemoryBackend::new();
        b.cas(Table::Nodes, "x", None, Some(b"n")).unwrap();
        assert!(b.scan(Table::Clusters).unwrap().is_empty());
        assert_eq!(b.scan(Table::Nodes).unwrap().len(), 1);
    }
}
