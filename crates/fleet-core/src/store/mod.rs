//! Record store shared by every engine component.
//!
//! A [`Backend`] is a set of byte-keyed tables with a single compare-and-swap
//! primitive. Everything that reads then writes (status transitions, fan-in
//! counters, capacity reservations, lock rows) goes through that primitive,
//! so two engines sharing one backend never lose an update.
//!
//! [`Store`] layers typed JSON records on top: each `update_*` call re-reads,
//! applies a closure and retries the swap until it wins.

pub mod db;
pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::action::{Action, ActionFilter};
use crate::cluster::{Cluster, Node};
use crate::error::{FleetError, Result};
use crate::policy::{Binding, Policy};

pub use db::RedbBackend;
pub use memory::MemoryBackend;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Actions,
    Locks,
    Clusters,
    Nodes,
    Policies,
    Bindings,
}

impl Table {
    pub fn all() -> &'static [Table] {
        &[
            Table::Actions,
            Table::Locks,
            Table::Clusters,
            Table::Nodes,
            Table::Policies,
            Table::Bindings,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Actions => "actions",
            Table::Locks => "locks",
            Table::Clusters => "clusters",
            Table::Nodes => "nodes",
            Table::Policies => "policies",
            Table::Bindings => "bindings",
        }
    }
}

pub trait Backend: Send + Sync {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` meaning absent). `new = None` deletes the key. Returns whether
    /// the swap happened.
    fn cas(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;

    /// All entries of a table in key order.
    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>>;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open (or create) the redb file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(RedbBackend::open(path)?)))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Generic record helpers
    // -----------------------------------------------------------------------

    fn read<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<(T, Vec<u8>)>> {
        match self.backend.get(table, key)? {
            Some(bytes) => Ok(Some((serde_json::from_slice(&bytes)?, bytes))),
            None => Ok(None),
        }
    }

    fn create<T: Serialize>(&self, table: Table, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        if self.backend.cas(table, key, None, Some(&bytes))? {
            Ok(())
        } else {
            Err(FleetError::Store(format!(
                "{} record '{key}' already exists",
                table.name()
            )))
        }
    }

    /// Read-modify-swap loop. Returns `None` when the record does not exist.
    /// An error from `f` aborts without writing.
    fn modify<T, F>(&self, table: Table, key: &str, mut f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> Result<()>,
    {
        loop {
            let Some((mut value, current)) = self.read::<T>(table, key)? else {
                return Ok(None);
            };
            f(&mut value)?;
            let next = serde_json::to_vec(&value)?;
            if self.backend.cas(table, key, Some(&current), Some(&next))? {
                return Ok(Some(value));
            }
            debug!(table = table.name(), key, "compare-and-swap lost, retrying");
        }
    }

    fn remove(&self, table: Table, key: &str) -> Result<bool> {
        loop {
            let Some(current) = self.backend.get(table, key)? else {
                return Ok(false);
            };
            if self.backend.cas(table, key, Some(&current), None)? {
                return Ok(true);
            }
        }
    }

    fn all<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        self.backend
            .scan(table)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(FleetError::from))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub fn insert_action(&self, action: &Action) -> Result<()> {
        self.create(Table::Actions, &action.id.to_string(), action)
    }

    pub fn action(&self, id: Uuid) -> Result<Action> {
        self.read::<Action>(Table::Actions, &id.to_string())?
            .map(|(a, _)| a)
            .ok_or_else(|| FleetError::ActionNotFound(id.to_string()))
    }

    /// Atomically apply `f` to the stored action, bumping its version.
    pub fn update_action<F>(&self, id: Uuid, mut f: F) -> Result<Action>
    where
        F: FnMut(&mut Action) -> Result<()>,
    {
        self.modify::<Action, _>(Table::Actions, &id.to_string(), |a| {
            f(a)?;
            a.version += 1;
            a.updated_at = chrono::Utc::now();
            Ok(())
        })?
        .ok_or_else(|| FleetError::ActionNotFound(id.to_string()))
    }

    /// Actions matching `filter`, oldest first.
    pub fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let mut actions: Vec<Action> = self
            .all::<Action>(Table::Actions)?
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(actions)
    }

    // -----------------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------------

    pub fn insert_cluster(&self, cluster: &Cluster) -> Result<()> {
        if self
            .list_clusters()?
            .iter()
            .any(|c| c.name == cluster.name && c.status != crate::cluster::ClusterStatus::Deleted)
        {
            return Err(FleetError::Validation(format!(
                "cluster name '{}' is already in use",
                cluster.name
            )));
        }
        self.create(Table::Clusters, &cluster.id, cluster)
    }

    pub fn cluster(&self, id: &str) -> Result<Cluster> {
        self.read::<Cluster>(Table::Clusters, id)?
            .map(|(c, _)| c)
            .ok_or_else(|| FleetError::ClusterNotFound(id.to_string()))
    }

    /// Look a cluster up by id, then by name.
    pub fn find_cluster(&self, id_or_name: &str) -> Result<Cluster> {
        if let Some((c, _)) = self.read::<Cluster>(Table::Clusters, id_or_name)? {
            return Ok(c);
        }
        self.list_clusters()?
            .into_iter()
            .find(|c| c.name == id_or_name && c.status != crate::cluster::ClusterStatus::Deleted)
            .ok_or_else(|| FleetError::ClusterNotFound(id_or_name.to_string()))
    }

    pub fn update_cluster<F>(&self, id: &str, mut f: F) -> Result<Cluster>
    where
        F: FnMut(&mut Cluster) -> Result<()>,
    {
        self.modify::<Cluster, _>(Table::Clusters, id, |c| {
            f(c)?;
            c.updated_at = chrono::Utc::now();
            Ok(())
        })?
        .ok_or_else(|| FleetError::ClusterNotFound(id.to_string()))
    }

    pub fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut clusters = self.all::<Cluster>(Table::Clusters)?;
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(clusters)
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub fn insert_node(&self, node: &Node) -> Result<()> {
        self.create(Table::Nodes, &node.id, node)
    }

    pub fn node(&self, id: &str) -> Result<Node> {
        self.read::<Node>(Table::Nodes, id)?
            .map(|(n, _)| n)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))
    }

    pub fn find_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.read::<Node>(Table::Nodes, id)?.map(|(n, _)| n))
    }

    pub fn update_node<F>(&self, id: &str, mut f: F) -> Result<Node>
    where
        F: FnMut(&mut Node) -> Result<()>,
    {
        self.modify::<Node, _>(Table::Nodes, id, |n| {
            f(n)?;
            n.updated_at = chrono::Utc::now();
            Ok(())
        })?
        .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))
    }

    pub fn remove_node(&self, id: &str) -> Result<bool> {
        self.remove(Table::Nodes, id)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.all::<Node>(Table::Nodes)?;
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.index.cmp(&b.index)));
        Ok(nodes)
    }

    /// Members of `cluster_id`, in index order.
    pub fn cluster_nodes(&self, cluster_id: &str) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .all::<Node>(Table::Nodes)?
            .into_iter()
            .filter(|n| n.cluster_id.as_deref() == Some(cluster_id))
            .collect();
        nodes.sort_by_key(|n| n.index);
        Ok(nodes)
    }

    // -----------------------------------------------------------------------
    // Policies and bindings
    // -----------------------------------------------------------------------

    pub fn insert_policy(&self, policy: &Policy) -> Result<()> {
        self.create(Table::Policies, &policy.id, policy)
    }

    pub fn policy(&self, id: &str) -> Result<Policy> {
        self.read::<Policy>(Table::Policies, id)?
            .map(|(p, _)| p)
            .ok_or_else(|| FleetError::PolicyNotFound(id.to_string()))
    }

    pub fn find_policy(&self, id_or_name: &str) -> Result<Policy> {
        if let Some((p, _)) = self.read::<Policy>(Table::Policies, id_or_name)? {
            return Ok(p);
        }
        self.list_policies()?
            .into_iter()
            .find(|p| p.name == id_or_name)
            .ok_or_else(|| FleetError::PolicyNotFound(id_or_name.to_string()))
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>> {
        let mut policies = self.all::<Policy>(Table::Policies)?;
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(policies)
    }

    /// Bindings of one cluster, lowest priority first.
    pub fn bindings(&self, cluster_id: &str) -> Result<Vec<Binding>> {
        let prefix = format!("{cluster_id}:");
        let mut bindings = self
            .backend
            .scan(Table::Bindings)?
            .into_iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, bytes)| serde_json::from_slice::<Binding>(&bytes).map_err(FleetError::from))
            .collect::<Result<Vec<_>>>()?;
        bindings.sort_by_key(|b| b.priority);
        Ok(bindings)
    }

    pub fn insert_binding(&self, binding: &Binding) -> Result<()> {
        self.create(Table::Bindings, &binding.key(), binding)
    }

    pub fn update_binding<F>(&self, cluster_id: &str, policy_id: &str, f: F) -> Result<Binding>
    where
        F: FnMut(&mut Binding) -> Result<()>,
    {
        let key = Binding::key_for(cluster_id, policy_id);
        self.modify::<Binding, _>(Table::Bindings, &key, f)?
            .ok_or_else(|| FleetError::PolicyNotFound(format!("{policy_id} on cluster {cluster_id}")))
    }

    pub fn remove_binding(&self, cluster_id: &str, policy_id: &str) -> Result<bool> {
        self.remove(Table::Bindings, &Binding::key_for(cluster_id, policy_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
