//! The action engine: submission, dispatch, fan-in and reclaim.
//!
//! `Engine` is a cheap handle around shared state. Submission is
//! synchronous: the action is validated, persisted and either expanded into
//! children (compound intents) or put on the ready queue. A fixed pool of
//! tokio workers drains the queue once [`Engine::start`] is called.

mod dispatch;
mod handlers;
mod plan;
mod queue;
mod reclaim;
mod settle;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionFilter, ActionStatus};
use crate::cluster::{Cluster, ClusterStatus, Profile};
use crate::config::EngineConfig;
use crate::driver::{CancelToken, DriverRegistry, RetryPolicy};
use crate::error::{FleetError, Result};
use crate::graph::{self, Resolution};
use crate::lock::LockManager;
use crate::policy::{Policy, PolicySpec};
use crate::store::Store;
use crate::types::{ActionKind, Cause, ResourceType};

pub use queue::ReadyQueue;
pub use reclaim::ReclaimReport;

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A request to run one action.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: ActionKind,
    pub target: String,
    pub inputs: Map<String, Value>,
    pub cause: Cause,
    pub priority: i32,
    pub timeout_secs: Option<u64>,
}

impl Submission {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            inputs: Map::new(),
            cause: Cause::User,
            priority: 0,
            timeout_secs: None,
        }
    }

    pub fn inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.to_string(), value.into());
        self
    }

    pub fn cause(mut self, cause: Cause) -> Self {
        self.cause = cause;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Inner {
    id: String,
    config: EngineConfig,
    store: Store,
    locks: LockManager,
    drivers: DriverRegistry,
    retry: RetryPolicy,
    queue: Arc<ReadyQueue>,
    running: Mutex<HashMap<Uuid, CancelToken>>,
    in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Running worker pool. Dropping the handle leaves the workers running;
/// call [`EngineHandle::shutdown`] to stop them.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop taking new work and wait for in-flight actions to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
    }
}

impl Engine {
    pub fn new(store: Store, drivers: DriverRegistry, config: EngineConfig) -> Self {
        let short: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                id: format!("engine-{short}"),
                locks: LockManager::new(&store),
                store,
                drivers,
                retry,
                config,
                queue: Arc::new(ReadyQueue::new()),
                running: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn running_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancelToken>> {
        match self.inner.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_running_here(&self, id: Uuid) -> bool {
        self.running_tokens().contains_key(&id)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Register a cluster and submit its CLUSTER_CREATE. Returns the cluster
    /// and the id of the create action.
    pub fn create_cluster(
        &self,
        name: &str,
        profile: Profile,
        min_size: u32,
        max_size: Option<u32>,
        desired: u32,
    ) -> Result<(Cluster, Uuid)> {
        crate::paths::validate_name(name)?;
        if profile.steps.is_empty() {
            return Err(FleetError::Validation("profile has no provisioning steps".into()));
        }
        for step in &profile.steps {
            self.inner.drivers.get(&step.driver)?;
        }
        crate::cluster::check_size_params(
            &Cluster::new(name, profile.clone(), min_size, max_size, desired),
            i64::from(desired),
            Some(min_size),
            max_size,
            true,
        )?;
        if desired > self.inner.config.max_members_per_cluster {
            return Err(FleetError::Validation(format!(
                "desired capacity {desired} exceeds the per-cluster limit of {}",
                self.inner.config.max_members_per_cluster
            )));
        }
        let cluster = Cluster::new(name, profile, min_size, max_size, desired);
        self.inner.store.insert_cluster(&cluster)?;
        info!(cluster_id = %cluster.id, name, desired, "cluster registered");
        let action_id = self.submit(ActionKind::ClusterCreate, &cluster.id, Map::new())?;
        let cluster = self.inner.store.cluster(&cluster.id)?;
        Ok((cluster, action_id))
    }

    pub fn create_policy(&self, name: &str, spec: PolicySpec) -> Result<Policy> {
        if self.inner.store.find_policy(name).is_ok() {
            return Err(FleetError::Validation(format!(
                "policy name '{name}' is already in use"
            )));
        }
        if let PolicySpec::LoadBalance(lb) = &spec {
            self.inner.drivers.get(&lb.driver)?;
        }
        let policy = Policy::new(name, spec)?;
        self.inner.store.insert_policy(&policy)?;
        info!(policy_id = %policy.id, name, kind = %policy.kind(), "policy created");
        Ok(policy)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub fn submit(&self, kind: ActionKind, target: &str, inputs: Map<String, Value>) -> Result<Uuid> {
        self.submit_request(Submission::new(kind, target).inputs(inputs))
    }

    /// Validate and persist an action. Compound intents are expanded here,
    /// so policy aborts and capacity violations resolve the action before
    /// this returns.
    pub fn submit_request(&self, req: Submission) -> Result<Uuid> {
        let (target, inputs) = self.validate_submission(&req)?;
        let timeout = req
            .timeout_secs
            .unwrap_or(self.inner.config.default_action_timeout_secs);
        let mut action = Action::new(req.kind, target, inputs, req.cause, timeout);
        action.priority = req.priority;
        self.inner.store.insert_action(&action)?;
        info!(
            action_id = %action.id,
            kind = %action.kind,
            target = %action.target,
            cause = %action.cause,
            "action submitted"
        );

        if action.is_compound() {
            plan::expand(self, action.id)?;
        } else {
            let ready = self
                .inner
                .store
                .update_action(action.id, |a| a.transition(ActionStatus::Ready, ""))?;
            self.inner.queue.push(ready.id, ready.priority);
        }
        Ok(action.id)
    }

    pub fn get(&self, id: Uuid) -> Result<Action> {
        self.inner.store.action(id)
    }

    pub fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        self.inner.store.list_actions(filter)
    }

    /// Request cancellation. Actions that have not started are cancelled at
    /// once; a running action stops at its next checkpoint; a compound parent
    /// cancels its unstarted children and resolves when the rest finish.
    pub fn cancel(&self, id: Uuid) -> Result<Action> {
        let current = self.inner.store.action(id)?;
        if current.is_terminal() {
            return Err(FleetError::InvalidTransition {
                from: current.status.to_string(),
                to: ActionStatus::Cancelled.to_string(),
                reason: format!("action {id} already finished"),
            });
        }

        let action = self.inner.store.update_action(id, |a| {
            if a.is_terminal() {
                return Ok(());
            }
            a.cancel_requested = true;
            let unstarted = matches!(a.status, ActionStatus::Init | ActionStatus::Ready)
                || (a.status == ActionStatus::Waiting && !a.is_compound());
            if unstarted {
                a.transition(ActionStatus::Cancelled, "cancelled by request")?;
            }
            Ok(())
        })?;
        info!(action_id = %id, status = %action.status, "cancel requested");

        if action.is_terminal() {
            self.propagate(action.clone())?;
        } else if action.is_compound() {
            for child in graph::cancel_children(&self.inner.store, id)? {
                self.propagate(child)?;
            }
            let running = self.running_tokens();
            for child in &action.depends_on {
                if let Some(token) = running.get(child) {
                    token.cancel();
                }
            }
        } else if let Some(token) = self.running_tokens().get(&id) {
            token.cancel();
        }
        self.inner.store.action(id)
    }

    /// Report a terminal action to its dependents and follow whatever that
    /// unlocks: ready dependents are queued, resolved dependents and settled
    /// parents are reported in turn.
    fn propagate(&self, done: Action) -> Result<()> {
        let mut work = vec![done];
        while let Some(action) = work.pop() {
            for resolution in graph::on_terminal(&self.inner.store, &action)? {
                match resolution {
                    Resolution::Ready(id) => {
                        let ready = self.inner.store.action(id)?;
                        debug!(action_id = %id, "dependencies met");
                        self.inner.queue.push(id, ready.priority);
                    }
                    Resolution::Resolved(dependent) => work.push(dependent),
                    Resolution::FanIn(parent) => {
                        if let Some(settled) = settle::finalize(self, parent)? {
                            work.push(settled);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission checks
    // -----------------------------------------------------------------------

    fn validate_submission(&self, req: &Submission) -> Result<(String, Map<String, Value>)> {
        let store = &self.inner.store;
        let mut inputs = req.inputs.clone();

        if req.kind.target_type() == ResourceType::Node {
            // Deleting a node that is already gone is a successful no-op.
            if req.kind != ActionKind::NodeDelete {
                store.node(&req.target)?;
            }
            if req.kind == ActionKind::NodeJoin {
                let cluster = store.find_cluster(input_str(&inputs, "cluster")?)?;
                inputs.insert("cluster".into(), Value::from(cluster.id));
            }
            return Ok((req.target.clone(), inputs));
        }

        let cluster = store.find_cluster(&req.target)?;
        if cluster.status == ClusterStatus::Deleted {
            return Err(FleetError::Validation(format!(
                "cluster {} has been deleted",
                cluster.name
            )));
        }
        if cluster.status == ClusterStatus::Deleting && req.kind != ActionKind::ClusterDelete {
            return Err(FleetError::Validation(format!(
                "cluster {} is being deleted",
                cluster.name
            )));
        }

        match req.kind {
            ActionKind::ClusterScaleOut | ActionKind::ClusterScaleIn => {
                if let Some(v) = inputs.get("count") {
                    if v.as_u64().map_or(true, |n| n == 0) {
                        return Err(FleetError::Validation(
                            "count must be a positive integer".into(),
                        ));
                    }
                }
            }
            ActionKind::ClusterResize => {
                crate::cluster::ResizeRequest::from_inputs(&inputs)?;
            }
            ActionKind::ClusterAddNodes => {
                for id in node_list(&inputs)? {
                    let node = store.node(&id)?;
                    if let Some(owner) = node.cluster_id.as_deref() {
                        return Err(FleetError::Validation(format!(
                            "node {id} already belongs to cluster {owner}"
                        )));
                    }
                }
            }
            ActionKind::ClusterDelNodes | ActionKind::ClusterReplaceNodes => {
                for id in node_list(&inputs)? {
                    let node = store.node(&id)?;
                    if node.cluster_id.as_deref() != Some(cluster.id.as_str()) {
                        return Err(FleetError::Validation(format!(
                            "node {id} is not a member of cluster {}",
                            cluster.name
                        )));
                    }
                }
            }
            ActionKind::ClusterRecover => {
                if inputs.contains_key("nodes") {
                    node_list(&inputs)?;
                }
            }
            ActionKind::ClusterUpdate => {
                let profile: Profile = serde_json::from_value(
                    inputs
                        .get("profile")
                        .cloned()
                        .ok_or_else(|| FleetError::Validation("update requires a profile".into()))?,
                )?;
                if profile.steps.is_empty() {
                    return Err(FleetError::Validation("profile has no provisioning steps".into()));
                }
                for step in &profile.steps {
                    self.inner.drivers.get(&step.driver)?;
                }
            }
            ActionKind::ClusterAttachPolicy
            | ActionKind::ClusterDetachPolicy
            | ActionKind::ClusterUpdatePolicy => {
                let policy = store.find_policy(input_str(&inputs, "policy")?)?;
                inputs.insert("policy".into(), Value::from(policy.id));
                if let Some(p) = inputs.get("priority") {
                    if p.as_u64().and_then(|n| u32::try_from(n).ok()).is_none() {
                        return Err(FleetError::Validation(
                            "priority must be a non-negative integer".into(),
                        ));
                    }
                }
                if let Some(e) = inputs.get("enabled") {
                    if !e.is_boolean() {
                        return Err(FleetError::Validation("enabled must be a boolean".into()));
                    }
                }
            }
            _ => {}
        }
        Ok((cluster.id, inputs))
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Recover persisted work, then spawn the worker pool and the lease
    /// sweeper.
    pub fn start(&self) -> Result<EngineHandle> {
        reclaim::recover(self)?;
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for worker in 0..self.inner.config.workers.max(1) {
            let engine = self.clone();
            let mut shutdown = rx.clone();
            tasks.push(tokio::spawn(async move {
                debug!(engine = %engine.id(), worker, "worker started");
                loop {
                    let id = tokio::select! {
                        id = engine.inner.queue.pop() => id,
                        _ = shutdown.changed() => break,
                    };
                    engine.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                    dispatch::run(&engine, id).await;
                    engine.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        let engine = self.clone();
        let mut shutdown = rx;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.inner.config.reclaim_interval());
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = engine.reclaim() {
                            warn!(error = %e, "lease sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!(engine = %self.id(), workers = self.inner.config.workers, "engine started");
        Ok(EngineHandle {
            shutdown: tx,
            tasks,
        })
    }

    /// Run one lease sweep now.
    pub fn reclaim(&self) -> Result<ReclaimReport> {
        reclaim::sweep(self)
    }

    /// True when nothing is queued, running or waiting on a retry timer.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_empty()
            && self.inner.queue.pending_timers() == 0
            && self.inner.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Start workers, wait until the engine goes idle, then stop them.
    pub async fn run_until_idle(&self, timeout: Duration) -> Result<()> {
        let handle = self.start()?;
        let deadline = Instant::now() + timeout;
        let mut quiet = 0;
        let result = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            quiet = if self.is_idle() { quiet + 1 } else { 0 };
            if quiet >= 3 {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(FleetError::Timeout(timeout.as_secs()));
            }
        };
        handle.shutdown().await;
        result
    }

    /// Poll until `id` is terminal.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration) -> Result<Action> {
        let deadline = Instant::now() + timeout;
        loop {
            let action = self.get(id)?;
            if action.is_terminal() {
                return Ok(action);
            }
            if Instant::now() >= deadline {
                return Err(FleetError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn input_str<'a>(inputs: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FleetError::Validation(format!("missing input '{key}'")))
}

/// The `nodes` input as a non-empty list of ids.
fn node_list(inputs: &Map<String, Value>) -> Result<Vec<String>> {
    let list = inputs
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| FleetError::Validation("missing input 'nodes'".into()))?;
    if list.is_empty() {
        return Err(FleetError::Validation("'nodes' must not be empty".into()));
    }
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| FleetError::Validation("'nodes' must hold node ids".into()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimDriver;
    use serde_json::json;

    fn engine() -> Engine {
        let drivers = DriverRegistry::new().with(Arc::new(SimDriver::default()));
        Engine::new(Store::memory(), drivers, EngineConfig::default())
    }

    #[test]
    fn unknown_target_is_rejected_without_an_action() {
        let e = engine();
        let err = e
            .submit(ActionKind::ClusterScaleOut, "nope", Map::new())
            .unwrap_err();
        assert!(matches!(err, FleetError::ClusterNotFound(_)));
        assert!(e.list(&ActionFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn zero_count_is_a_validation_error() {
        let e = engine();
        let (cluster, _) = e.create_cluster("web", Profile::default(), 0, None, 0).unwrap();
        let inputs = json!({ "count": 0 }).as_object().cloned().unwrap();
        let err = e
            .submit(ActionKind::ClusterScaleOut, &cluster.name, inputs)
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn empty_create_succeeds_immediately() {
        let e = engine();
        let (cluster, create) = e.create_cluster("web", Profile::default(), 0, None, 0).unwrap();
        assert_eq!(e.get(create).unwrap().status, ActionStatus::Succeeded);
        assert_eq!(e.store().cluster(&cluster.id).unwrap().status, ClusterStatus::Active);
    }

    #[test]
    fn leaf_submission_is_ready() {
        let e = engine();
        let (cluster, _) = e.create_cluster("web", Profile::default(), 0, None, 0).unwrap();
        let policy = e
            .create_policy(
                "spread",
                PolicySpec::Placement(crate::policy::PlacementSpec {
                    zones: vec!["az1".into()],
                }),
            )
            .unwrap();
        let inputs = json!({ "policy": "spread" }).as_object().cloned().unwrap();
        let id = e
            .submit(ActionKind::ClusterAttachPolicy, &cluster.name, inputs)
            .unwrap();
        let action = e.get(id).unwrap();
        assert_eq!(action.status, ActionStatus::Ready);
        assert_eq!(action.target, cluster.id);
        assert_eq!(action.input_str("policy"), Some(policy.id.as_str()));
    }

    #[test]
    fn cancel_before_dispatch_is_immediate() {
        let e = engine();
        let (cluster, _) = e.create_cluster("web", Profile::default(), 0, None, 0).unwrap();
        e.create_policy(
            "spread",
            PolicySpec::Placement(crate::policy::PlacementSpec {
                zones: vec!["az1".into()],
            }),
        )
        .unwrap();
        let inputs = json!({ "policy": "spread" }).as_object().cloned().unwrap();
        let id = e
            .submit(ActionKind::ClusterAttachPolicy, &cluster.id, inputs)
            .unwrap();
        let cancelled = e.cancel(id).unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert!(matches!(
            e.cancel(id),
            Err(FleetError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn duplicate_policy_names_are_rejected() {
        let e = engine();
        let spec = PolicySpec::Health(crate::policy::HealthSpec::default());
        e.create_policy("hc", spec.clone()).unwrap();
        assert!(matches!(
            e.create_policy("hc", spec),
            Err(FleetError::Validation(_))
        ));
    }
}
