//! Leaf action handlers. Each runs with the target's lock held and returns
//! the outputs to record on success.

use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

use super::Engine;
use crate::action::Action;
use crate::cluster::{Node, NodeStatus, Profile, ProvisionedResource};
use crate::driver::workflow::deprovision;
use crate::driver::{CancelToken, Journal, Step, Workflow};
use crate::error::{FleetError, Result};
use crate::policy::{next_priority, Binding};
use crate::types::ActionKind;

type Outputs = Map<String, Value>;

/// Node reason while an update removes the resources it replaced.
const REPLACING: &str = "removing replaced resources";

pub(super) async fn run(
    engine: &Engine,
    action: &Action,
    journal: &Journal,
    token: &CancelToken,
) -> Result<Outputs> {
    match action.kind {
        ActionKind::NodeCreate => node_create(engine, action, journal, token).await,
        ActionKind::NodeDelete => node_delete(engine, action, token).await,
        ActionKind::NodeUpdate => node_update(engine, action, journal, token).await,
        ActionKind::NodeJoin => node_join(engine, action),
        ActionKind::NodeLeave => node_leave(engine, action),
        ActionKind::NodeCheck => node_check(engine, action).await,
        ActionKind::NodeRecover => node_recover(engine, action, journal, token).await,
        ActionKind::ClusterAttachPolicy => attach_policy(engine, action),
        ActionKind::ClusterDetachPolicy => detach_policy(engine, action),
        ActionKind::ClusterUpdatePolicy => update_policy(engine, action),
        kind => Err(FleetError::Validation(format!(
            "{kind} is a compound action and is never dispatched"
        ))),
    }
}

/// Record what a timed-out workflow left behind on its node.
pub(super) fn after_timeout(engine: &Engine, action: &Action, journal: &Journal) {
    if !matches!(
        action.kind,
        ActionKind::NodeCreate | ActionKind::NodeUpdate | ActionKind::NodeRecover
    ) {
        return;
    }
    let leftover = journal.entries();
    let result = engine.inner.store.update_node(&action.target, |n| {
        n.resources.extend(leftover.iter().cloned());
        let reason = if n.status_reason == REPLACING {
            format!(
                "timed out removing replaced resources; {} resources listed",
                n.resources.len()
            )
        } else {
            "timed out".to_string()
        };
        n.set_status(NodeStatus::Error, reason);
        Ok(())
    });
    if let Err(e) = result {
        warn!(action_id = %action.id, error = %e, "could not record timeout on node");
    }
}

// ---------------------------------------------------------------------------
// Node handlers
// ---------------------------------------------------------------------------

/// Steps for building `node`: the profile, plus load-balancer membership
/// when a policy asked for it.
fn build_steps(profile: &Profile, action: &Action) -> Vec<Step> {
    let mut steps: Vec<Step> = profile.steps.iter().map(Step::from).collect();
    if let Some(lb) = action.inputs.get("lb_member").and_then(Value::as_object) {
        let driver = lb
            .get("driver")
            .and_then(Value::as_str)
            .unwrap_or("sim")
            .to_string();
        let mut spec = lb.clone();
        spec.remove("driver");
        steps.push(Step {
            name: "lb_member".into(),
            driver,
            spec,
        });
    }
    steps
}

fn node_profile(engine: &Engine, node: &Node) -> Result<Profile> {
    let cluster_id = node.cluster_id.as_deref().ok_or_else(|| {
        FleetError::Validation(format!("node {} does not belong to a cluster", node.name))
    })?;
    Ok(engine.inner.store.cluster(cluster_id)?.profile)
}

fn resource_ids(resources: &[ProvisionedResource]) -> Value {
    Value::Array(
        resources
            .iter()
            .map(|r| Value::from(r.resource_id.clone()))
            .collect(),
    )
}

/// Provision `steps` for `node`, recording either the new resources or the
/// failure on the node record.
async fn provision(
    engine: &Engine,
    node: &Node,
    steps: &[Step],
    journal: &Journal,
    token: &CancelToken,
) -> Result<Vec<ProvisionedResource>> {
    let store = &engine.inner.store;
    let wf = Workflow::new(&engine.inner.drivers, &engine.inner.retry, journal.clone(), token.clone());
    match wf.run(&node.name, steps).await {
        Ok(resources) => Ok(resources),
        Err(e) => {
            let leftover = journal.entries();
            let reason = e.to_string();
            store.update_node(&node.id, |n| {
                n.resources.extend(leftover.iter().cloned());
                n.set_status(NodeStatus::Error, reason.clone());
                Ok(())
            })?;
            Err(e)
        }
    }
}

/// Deprovision `resources` newest first. Stops at the first failure and
/// returns what is still present.
async fn teardown(
    engine: &Engine,
    resources: &[ProvisionedResource],
) -> std::result::Result<(), (FleetError, Vec<ProvisionedResource>)> {
    for (i, resource) in resources.iter().enumerate().rev() {
        if let Err(e) = deprovision(&engine.inner.drivers, &engine.inner.retry, resource).await {
            return Err((e, resources[..=i].to_vec()));
        }
    }
    Ok(())
}

async fn node_create(
    engine: &Engine,
    action: &Action,
    journal: &Journal,
    token: &CancelToken,
) -> Result<Outputs> {
    let store = &engine.inner.store;
    let node = store.node(&action.target)?;
    let steps = build_steps(&node_profile(engine, &node)?, action);
    let resources = provision(engine, &node, &steps, journal, token).await?;
    let ids = resource_ids(&resources);
    store.update_node(&node.id, |n| {
        n.resources = resources.clone();
        n.set_status(NodeStatus::Active, "created");
        Ok(())
    })?;
    info!(node = %node.name, resources = resources.len(), "node created");
    Ok(json!({ "node_id": node.id, "resources": ids })
        .as_object()
        .cloned()
        .unwrap_or_default())
}

async fn node_delete(engine: &Engine, action: &Action, token: &CancelToken) -> Result<Outputs> {
    let store = &engine.inner.store;
    let Some(node) = store.find_node(&action.target)? else {
        info!(node_id = %action.target, "node already gone");
        return Ok(outputs([("deleted", Value::Bool(false))]));
    };

    let grace = action.input_u64("grace_period").unwrap_or(0);
    if grace > 0 {
        tokio::time::sleep(Duration::from_secs(grace)).await;
    }
    token.checkpoint("before teardown")?;

    if let Err((e, leftover)) = teardown(engine, &node.resources).await {
        let reason = e.to_string();
        store.update_node(&node.id, |n| {
            n.resources = leftover.clone();
            n.set_status(NodeStatus::Error, reason.clone());
            Ok(())
        })?;
        return Err(e);
    }
    store.remove_node(&node.id)?;

    // A standalone delete shrinks the cluster it belonged to; deletes that
    // are part of a cluster action, or of a node that action claimed, were
    // already counted by that action.
    if action.parent.is_none() && node.status != NodeStatus::Deleting {
        if let Some(cluster_id) = node.cluster_id.as_deref() {
            store.update_cluster(cluster_id, |c| {
                c.desired_capacity = c.desired_capacity.saturating_sub(1);
                Ok(())
            })?;
        }
    }
    info!(node = %node.name, "node deleted");
    Ok(outputs([("deleted", Value::Bool(true))]))
}

async fn node_update(
    engine: &Engine,
    action: &Action,
    journal: &Journal,
    token: &CancelToken,
) -> Result<Outputs> {
    let store = &engine.inner.store;
    let node = store.node(&action.target)?;
    let profile = match action.inputs.get("profile") {
        Some(p) => serde_json::from_value::<Profile>(p.clone())?,
        None => node_profile(engine, &node)?,
    };
    let steps = build_steps(&profile, action);
    let fresh = provision(engine, &node, &steps, journal, token).await?;

    // The new resources belong to the node from here on, so a timeout while
    // the old ones go must not unwind them.
    store.update_node(&node.id, |n| {
        n.resources.extend(fresh.iter().cloned());
        let status = n.status;
        n.set_status(status, REPLACING);
        Ok(())
    })?;
    journal.clear();

    for old in node.resources.iter().rev() {
        if let Err(e) = deprovision(&engine.inner.drivers, &engine.inner.retry, old).await {
            let reason = format!("replaced resource {} not removed: {e}", old.resource_id);
            store.update_node(&node.id, |n| {
                n.set_status(NodeStatus::Error, reason.clone());
                Ok(())
            })?;
            return Err(e);
        }
        store.update_node(&node.id, |n| {
            n.resources.retain(|r| r != old);
            Ok(())
        })?;
    }
    store.update_node(&node.id, |n| {
        n.set_status(NodeStatus::Active, "updated");
        Ok(())
    })?;
    info!(node = %node.name, resources = fresh.len(), "node updated");
    Ok(outputs([("resources", resource_ids(&fresh))]))
}

fn node_join(engine: &Engine, action: &Action) -> Result<Outputs> {
    let store = &engine.inner.store;
    let cluster_id = action
        .input_str("cluster")
        .ok_or_else(|| FleetError::Validation("join requires a cluster".into()))?
        .to_string();
    let node = store.node(&action.target)?;
    match node.cluster_id.as_deref() {
        Some(current) if current == cluster_id => {
            return Ok(outputs([("joined", Value::Bool(false))]));
        }
        Some(other) => {
            return Err(FleetError::Validation(format!(
                "node {} already belongs to cluster {other}",
                node.name
            )))
        }
        None => {}
    }

    let mut index = 0;
    store.update_cluster(&cluster_id, |c| {
        index = c.take_index();
        Ok(())
    })?;
    store.update_node(&node.id, |n| {
        n.cluster_id = Some(cluster_id.clone());
        n.index = index;
        if !n.resources.is_empty() && n.status == NodeStatus::Init {
            n.set_status(NodeStatus::Active, "joined");
        }
        Ok(())
    })?;
    info!(node = %node.name, cluster_id = %cluster_id, index, "node joined");
    Ok(outputs([("joined", Value::Bool(true))]))
}

fn node_leave(engine: &Engine, action: &Action) -> Result<Outputs> {
    let node = engine.inner.store.update_node(&action.target, |n| {
        n.cluster_id = None;
        n.index = 0;
        n.zone = None;
        if n.status == NodeStatus::Deleting {
            n.set_status(NodeStatus::Active, "left its cluster");
        }
        Ok(())
    })?;
    info!(node = %node.name, "node left its cluster");
    Ok(outputs([("left", Value::Bool(true))]))
}

async fn node_check(engine: &Engine, action: &Action) -> Result<Outputs> {
    let store = &engine.inner.store;
    let node = store.node(&action.target)?;
    let poll = engine.inner.retry.readiness_poll;
    let mut healthy = !node.resources.is_empty();
    for resource in &node.resources {
        let driver = engine.inner.drivers.get(&resource.driver)?;
        match driver.is_ready(&resource.resource_id, poll).await {
            Ok(true) => {}
            Ok(false) => healthy = false,
            Err(e) => {
                warn!(node = %node.name, resource_id = %resource.resource_id, error = %e, "health probe failed");
                healthy = false;
            }
        }
    }
    store.update_node(&node.id, |n| {
        if n.status == NodeStatus::Deleting {
            return Ok(());
        }
        if healthy {
            n.set_status(NodeStatus::Active, "healthy");
        } else {
            n.set_status(NodeStatus::Error, "health check failed");
        }
        Ok(())
    })?;
    Ok(json!({ "node_id": node.id, "healthy": healthy })
        .as_object()
        .cloned()
        .unwrap_or_default())
}

async fn node_recover(
    engine: &Engine,
    action: &Action,
    journal: &Journal,
    token: &CancelToken,
) -> Result<Outputs> {
    let store = &engine.inner.store;
    let node = store.node(&action.target)?;
    let steps = build_steps(&node_profile(engine, &node)?, action);

    if let Err((e, leftover)) = teardown(engine, &node.resources).await {
        let reason = e.to_string();
        store.update_node(&node.id, |n| {
            n.resources = leftover.clone();
            n.set_status(NodeStatus::Error, reason.clone());
            Ok(())
        })?;
        return Err(e);
    }
    store.update_node(&node.id, |n| {
        n.resources.clear();
        Ok(())
    })?;
    token.checkpoint("before rebuild")?;

    let resources = provision(engine, &node, &steps, journal, token).await?;
    let ids = resource_ids(&resources);
    store.update_node(&node.id, |n| {
        n.resources = resources.clone();
        n.set_status(NodeStatus::Active, "recovered");
        Ok(())
    })?;
    info!(node = %node.name, "node recovered");
    Ok(outputs([("resources", ids)]))
}

// ---------------------------------------------------------------------------
// Policy bindings
// ---------------------------------------------------------------------------

fn policy_input(action: &Action) -> Result<String> {
    action
        .input_str("policy")
        .map(str::to_string)
        .ok_or_else(|| FleetError::Validation("missing input 'policy'".into()))
}

fn priority_input(action: &Action) -> Option<u32> {
    action.input_u64("priority").and_then(|p| u32::try_from(p).ok())
}

fn attach_policy(engine: &Engine, action: &Action) -> Result<Outputs> {
    let store = &engine.inner.store;
    let cluster_id = &action.target;
    let policy = store.policy(&policy_input(action)?)?;
    let bindings = store.bindings(cluster_id)?;

    if bindings.iter().any(|b| b.policy_id == policy.id) {
        return Ok(outputs([("attached", Value::Bool(false))]));
    }
    for b in &bindings {
        if let Ok(existing) = store.policy(&b.policy_id) {
            if existing.kind() == policy.kind() {
                return Err(FleetError::Validation(format!(
                    "a {} policy ('{}') is already attached",
                    policy.kind(),
                    existing.name
                )));
            }
        }
    }
    let priority = priority_input(action).unwrap_or_else(|| next_priority(&bindings));
    if bindings.iter().any(|b| b.priority == priority) {
        return Err(FleetError::PriorityConflict {
            cluster: cluster_id.clone(),
            priority,
        });
    }

    let mut binding = Binding::new(cluster_id.as_str(), policy.id.as_str(), priority);
    if let Some(enabled) = action.inputs.get("enabled").and_then(Value::as_bool) {
        binding.enabled = enabled;
    }
    store.insert_binding(&binding)?;
    info!(cluster_id = %cluster_id, policy = %policy.name, priority, "policy attached");
    Ok(json!({ "attached": true, "priority": priority })
        .as_object()
        .cloned()
        .unwrap_or_default())
}

fn detach_policy(engine: &Engine, action: &Action) -> Result<Outputs> {
    let policy_id = policy_input(action)?;
    let removed = engine.inner.store.remove_binding(&action.target, &policy_id)?;
    if removed {
        info!(cluster_id = %action.target, policy_id = %policy_id, "policy detached");
    }
    Ok(outputs([("detached", Value::Bool(removed))]))
}

fn update_policy(engine: &Engine, action: &Action) -> Result<Outputs> {
    let store = &engine.inner.store;
    let cluster_id = &action.target;
    let policy_id = policy_input(action)?;
    let bindings = store.bindings(cluster_id)?;
    if !bindings.iter().any(|b| b.policy_id == policy_id) {
        return Err(FleetError::PolicyNotFound(format!(
            "{policy_id} is not attached to cluster {cluster_id}"
        )));
    }

    let priority = priority_input(action);
    let enabled = action.inputs.get("enabled").and_then(Value::as_bool);
    if priority.is_none() && enabled.is_none() {
        return Ok(outputs([("updated", Value::Bool(false))]));
    }
    if let Some(p) = priority {
        if bindings.iter().any(|b| b.priority == p && b.policy_id != policy_id) {
            return Err(FleetError::PriorityConflict {
                cluster: cluster_id.clone(),
                priority: p,
            });
        }
    }
    let binding = store.update_binding(cluster_id, &policy_id, |b| {
        if let Some(p) = priority {
            b.priority = p;
        }
        if let Some(e) = enabled {
            b.enabled = e;
        }
        Ok(())
    })?;
    info!(
        cluster_id = %cluster_id,
        policy_id = %policy_id,
        priority = binding.priority,
        enabled = binding.enabled,
        "policy binding updated"
    );
    Ok(json!({ "updated": true, "priority": binding.priority, "enabled": binding.enabled })
        .as_object()
        .cloned()
        .unwrap_or_default())
}

fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> Outputs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
