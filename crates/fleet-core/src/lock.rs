//! Per-resource exclusive locks with leases.
//!
//! A lock row lives in [`Table::Locks`] under `"<type>:<id>"`. Acquisition is
//! a non-blocking compare-and-swap; an expired row counts as absent, and its
//! displaced holder is queued as an orphan so the reclaim sweep can requeue
//! or fail the action that lost it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::store::{Backend, Store, Table};
use crate::types::ResourceType;

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub holder_action: Uuid,
    pub holder_engine: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }

    pub fn key(&self) -> String {
        lock_key(self.resource_type, &self.resource_id)
    }
}

pub fn lock_key(resource_type: ResourceType, resource_id: &str) -> String {
    format!("{}:{}", resource_type.as_str(), resource_id)
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

pub struct LockManager {
    backend: Arc<dyn Backend>,
    orphans: Mutex<Vec<LockRecord>>,
}

impl LockManager {
    pub fn new(store: &Store) -> Self {
        Self {
            backend: Arc::clone(store.backend()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    fn read(&self, key: &str) -> Result<Option<(LockRecord, Vec<u8>)>> {
        match self.backend.get(Table::Locks, key)? {
            Some(bytes) => Ok(Some((serde_json::from_slice(&bytes)?, bytes))),
            None => Ok(None),
        }
    }

    fn push_orphan(&self, record: LockRecord) {
        match self.orphans.lock() {
            Ok(mut orphans) => orphans.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    /// Try to take the lock for `action`. Never blocks: returns `false` when
    /// another action holds a live lease. Re-acquiring a lock the action
    /// already holds succeeds.
    pub fn try_acquire(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        action: Uuid,
        engine: &str,
        lease: Duration,
    ) -> Result<bool> {
        let key = lock_key(resource_type, resource_id);
        loop {
            let now = Utc::now();
            let record = LockRecord {
                resource_type,
                resource_id: resource_id.to_string(),
                holder_action: action,
                holder_engine: engine.to_string(),
                acquired_at: now,
                lease_expires_at: lease_deadline(now, lease),
            };
            let bytes = serde_json::to_vec(&record)?;

            match self.read(&key)? {
                None => {
                    if self.backend.cas(Table::Locks, &key, None, Some(&bytes))? {
                        debug!(lock = %key, action_id = %action, "lock acquired");
                        return Ok(true);
                    }
                }
                Some((held, current)) if held.holder_action == action => {
                    if self
                        .backend
                        .cas(Table::Locks, &key, Some(&current), Some(&bytes))?
                    {
                        return Ok(true);
                    }
                }
                Some((held, _)) if !held.is_expired(now) => return Ok(false),
                Some((held, current)) => {
                    if self
                        .backend
                        .cas(Table::Locks, &key, Some(&current), Some(&bytes))?
                    {
                        warn!(
                            lock = %key,
                            action_id = %action,
                            displaced = %held.holder_action,
                            "took over expired lock"
                        );
                        self.push_orphan(held);
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Release a lock held by `action`. Fails with `LockNotHeld` when the
    /// lock is absent or held by someone else; the row is left untouched.
    pub fn release(&self, resource_type: ResourceType, resource_id: &str, action: Uuid) -> Result<()> {
        let key = lock_key(resource_type, resource_id);
        loop {
            match self.read(&key)? {
                Some((held, current)) if held.holder_action == action => {
                    if self.backend.cas(Table::Locks, &key, Some(&current), None)? {
                        debug!(lock = %key, action_id = %action, "lock released");
                        return Ok(());
                    }
                }
                _ => {
                    return Err(FleetError::LockNotHeld {
                        resource: key,
                        action: action.to_string(),
                    })
                }
            }
        }
    }

    /// Push the lease of a held lock forward. Returns `false` if `action` no
    /// longer holds it.
    pub fn renew(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        action: Uuid,
        lease: Duration,
    ) -> Result<bool> {
        let key = lock_key(resource_type, resource_id);
        loop {
            let Some((mut held, current)) = self.read(&key)? else {
                return Ok(false);
            };
            if held.holder_action != action {
                return Ok(false);
            }
            held.lease_expires_at = lease_deadline(Utc::now(), lease);
            let next = serde_json::to_vec(&held)?;
            if self
                .backend
                .cas(Table::Locks, &key, Some(&current), Some(&next))?
            {
                return Ok(true);
            }
        }
    }

    /// Delete every lock whose lease expired before `now` and hand back the
    /// displaced records, together with any takeovers seen since the last
    /// call.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>> {
        let mut reclaimed = self.take_orphans();
        for (key, bytes) in self.backend.scan(Table::Locks)? {
            let held: LockRecord = serde_json::from_slice(&bytes)?;
            if held.is_expired(now) && self.backend.cas(Table::Locks, &key, Some(&bytes), None)? {
                warn!(lock = %key, action_id = %held.holder_action, "reclaimed expired lock");
                reclaimed.push(held);
            }
        }
        Ok(reclaimed)
    }

    pub fn take_orphans(&self) -> Vec<LockRecord> {
        match self.orphans.lock() {
            Ok(mut orphans) => std::mem::take(&mut *orphans),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Current row for a resource, live or expired.
    pub fn holder(&self, resource_type: ResourceType, resource_id: &str) -> Result<Option<LockRecord>> {
        Ok(self
            .read(&lock_key(resource_type, resource_id))?
            .map(|(held, _)| held))
    }

    pub fn list(&self) -> Result<Vec<LockRecord>> {
        self.backend
            .scan(Table::Locks)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(FleetError::from))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn manager() -> LockManager {
        LockManager::new(&Store::memory())
    }

    #[test]
    fn second_holder_is_refused() {
        let locks = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(locks.try_acquire(ResourceType::Node, "n1", a, "e1", LEASE).unwrap());
        assert!(!locks.try_acquire(ResourceType::Node, "n1", b, "e1", LEASE).unwrap());
        assert!(locks.try_acquire(ResourceType::Node, "n2", b, "e1", LEASE).unwrap());
    }

    #[test]
    fn same_id_on_different_types_does_not_conflict() {
        let locks = manager();
        assert!(locks
            .try_acquire(ResourceType::Node, "x", Uuid::new_v4(), "e1", LEASE)
            .unwrap());
        assert!(locks
            .try_acquire(ResourceType::Cluster, "x", Uuid::new_v4(), "e1", LEASE)
            .unwrap());
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let locks = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        locks.try_acquire(ResourceType::Cluster, "c1", a, "e1", LEASE).unwrap();
        let err = locks.release(ResourceType::Cluster, "c1", b).unwrap_err();
        assert!(matches!(err, FleetError::LockNotHeld { .. }));
        assert_eq!(
            locks.holder(ResourceType::Cluster, "c1").unwrap().unwrap().holder_action,
            a
        );
        locks.release(ResourceType::Cluster, "c1", a).unwrap();
        assert!(locks.holder(ResourceType::Cluster, "c1").unwrap().is_none());
    }

    #[test]
    fn expired_lock_is_taken_over_and_orphan_reported() {
        let locks = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        locks
            .try_acquire(ResourceType::Node, "n1", a, "dead-engine", Duration::ZERO)
            .unwrap();
        assert!(locks.try_acquire(ResourceType::Node, "n1", b, "e2", LEASE).unwrap());
        let orphans = locks.take_orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].holder_action, a);
        assert_eq!(orphans[0].holder_engine, "dead-engine");
    }

    #[test]
    fn reclaim_only_removes_expired_rows() {
        let locks = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        locks
            .try_acquire(ResourceType::Node, "old", a, "e1", Duration::from_secs(1))
            .unwrap();
        locks.try_acquire(ResourceType::Node, "new", b, "e1", LEASE).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        let reclaimed = locks.reclaim_expired(later).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].resource_id, "old");
        assert_eq!(locks.list().unwrap().len(), 1);
    }

    #[test]
    fn renew_extends_only_for_holder() {
        let locks = manager();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        locks
            .try_acquire(ResourceType::Node, "n1", a, "e1", Duration::from_secs(1))
            .unwrap();
        let before = locks.holder(ResourceType::Node, "n1").unwrap().unwrap();
        assert!(locks.renew(ResourceType::Node, "n1", a, LEASE).unwrap());
        assert!(!locks.renew(ResourceType::Node, "n1", b, LEASE).unwrap());
        let after = locks.holder(ResourceType::Node, "n1").unwrap().unwrap();
        assert!(after.lease_expires_at > before.lease_expires_at);
    }
}
