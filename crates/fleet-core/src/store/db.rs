//! Persistent backend on redb.
//!
//! One redb table per [`Table`], keyed by string and holding JSON bytes.
//! Compare-and-swap runs inside a single write transaction; redb serializes
//! write transactions, so the read and the write cannot interleave with
//! another writer.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use super::{Backend, Table};
use crate::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");
const BINDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bindings");

fn definition(table: Table) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match table {
        Table::Actions => ACTIONS,
        Table::Locks => LOCKS,
        Table::Clusters => CLUSTERS,
        Table::Nodes => NODES,
        Table::Policies => POLICIES,
        Table::Bindings => BINDINGS,
    }
}

fn db_err(e: impl ToString) -> FleetError {
    FleetError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbBackend
// ---------------------------------------------------------------------------

pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for table in Table::all() {
            wt.open_table(definition(*table)).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(definition(table)).map_err(db_err)?;
        let value = t.get(key).map_err(db_err)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn cas(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let swapped = {
            let mut t = wt.open_table(definition(table)).map_err(db_err)?;
            let current = t.get(key).map_err(db_err)?.map(|v| v.value().to_vec());
            if current.as_deref() != expected {
                false
            } else {
                match new {
                    Some(bytes) => {
                        t.insert(key, bytes).map_err(db_err)?;
                    }
                    None => {
                        t.remove(key).map_err(db_err)?;
                    }
                }
                true
            }
        };
        if swapped {
            wt.commit().map_err(db_err)?;
        } else {
            wt.abort().map_err(db_err)?;
        }
        Ok(swapped)
    }

    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(definition(table)).map_err(db_err)?;
        let mut rows = Vec::new();
        for entry in t.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            rows.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbBackend) {
        let dir = TempDir::new().unwrap();
        let db = RedbBackend::open(&dir.path().join("fleet.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn cas_semantics_match_memory_backend() {
        let (_dir, db) = open_tmp();
        assert!(db.cas(Table::Locks, "cluster:c1", None, Some(b"a")).unwrap());
        assert!(!db.cas(Table::Locks, "cluster:c1", None, Some(b"b")).unwrap());
        assert!(!db
            .cas(Table::Locks, "cluster:c1", Some(b"b"), Some(b"c"))
            .unwrap());
        assert!(db.cas(Table::Locks, "cluster:c1", Some(b"a"), None).unwrap());
        assert!(db.get(Table::Locks, "cluster:c1").unwrap().is_none());
    }

    #[test]
    fn scan_returns_key_order() {
        let (_dir, db) = open_tmp();
        for key in ["b", "c", "a"] {
            db.cas(Table::Nodes, key, None, Some(key.as_bytes())).unwrap();
        }
        let keys: Vec<String> = db.scan(Table::Nodes).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.db");
        {
            let db = RedbBackend::open(&path).unwrap();
            db.cas(Table::Clusters, "c1", None, Some(b"{}")).unwrap();
        }
        let db = RedbBackend::open(&path).unwrap();
        assert_eq!(db.get(Table::Clusters, "c1").unwrap().unwrap(), b"{}");
    }
}
