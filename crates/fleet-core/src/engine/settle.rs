//! Resolving compound parents and running post-checks.

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Engine, Submission};
use crate::action::{Action, ActionStatus};
use crate::cluster::{Cluster, ClusterStatus, NodeStatus};
use crate::error::Result;
use crate::graph;
use crate::policy::{CheckContext, Pipeline};
use crate::store::Store;
use crate::types::{ActionKind, Cause, ResourceType};

/// The cluster an action's policies come from: its target, or the cluster
/// its target node belongs to.
pub(super) fn cluster_of(store: &Store, action: &Action) -> Result<Option<Cluster>> {
    let cluster_id = match action.target_type {
        ResourceType::Cluster => Some(action.target.clone()),
        ResourceType::Node => store.find_node(&action.target)?.and_then(|n| n.cluster_id),
    };
    match cluster_id {
        Some(id) => match store.cluster(&id) {
            Ok(c) => Ok(Some(c)),
            Err(crate::error::FleetError::ClusterNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        },
        None => Ok(None),
    }
}

/// Run post-checks for a terminal action and submit the follow-ups they
/// request. Failures are logged; they never change the action's result.
pub(super) fn post_checks(engine: &Engine, action: &Action) {
    if let Err(e) = try_post_checks(engine, action) {
        warn!(action_id = %action.id, error = %e, "post-checks failed");
    }
}

fn try_post_checks(engine: &Engine, action: &Action) -> Result<()> {
    let store = &engine.inner.store;
    let Some(cluster) = cluster_of(store, action)? else {
        return Ok(());
    };
    let pipeline = Pipeline::load(store, &cluster.id)?;
    if pipeline.is_empty() {
        return Ok(());
    }
    let members = store.cluster_nodes(&cluster.id)?;
    let ctx = CheckContext {
        cluster: &cluster,
        members: &members,
    };
    for follow_up in pipeline.post_check(&ctx, action) {
        let req = Submission::new(follow_up.kind, follow_up.target)
            .inputs(follow_up.inputs)
            .cause(Cause::Derived);
        match engine.submit_request(req) {
            Ok(id) => info!(action_id = %action.id, follow_up = %id, "remediation submitted"),
            Err(e) => warn!(action_id = %action.id, error = %e, "remediation rejected"),
        }
    }
    Ok(())
}

/// Resolve a compound parent whose children have all settled (or that had
/// none). Returns the terminal parent, or `None` if it was already
/// resolved.
pub(super) fn finalize(engine: &Engine, parent_id: Uuid) -> Result<Option<Action>> {
    let store = &engine.inner.store;
    let parent = store.action(parent_id)?;
    if parent.is_terminal() {
        return Ok(None);
    }
    let (status, reason) = if parent.depends_on.is_empty() {
        if parent.cancel_requested {
            (ActionStatus::Cancelled, "cancelled".to_string())
        } else {
            (ActionStatus::Succeeded, "nothing to do".to_string())
        }
    } else {
        graph::aggregate(&parent)
    };
    let children = parent
        .depends_on
        .iter()
        .map(|id| store.action(*id))
        .collect::<Result<Vec<_>>>()?;

    reconcile(engine, &parent, &children, status)?;

    let unhealthy: Vec<Value> = children
        .iter()
        .filter(|c| c.kind == ActionKind::NodeCheck)
        .filter(|c| c.outputs.get("healthy").and_then(Value::as_bool) == Some(false))
        .map(|c| Value::from(c.target.clone()))
        .collect();

    let done = store.update_action(parent_id, |a| {
        if parent.kind == ActionKind::ClusterCheck {
            a.outputs
                .insert("unhealthy".into(), Value::Array(unhealthy.clone()));
        }
        a.transition(status, reason.clone())
    })?;
    info!(action_id = %parent_id, kind = %done.kind, status = %done.status, reason = %done.status_reason, "compound action resolved");
    post_checks(engine, &done);
    Ok(Some(done))
}

/// Bring the cluster record in line with what the children achieved.
fn reconcile(engine: &Engine, parent: &Action, children: &[Action], status: ActionStatus) -> Result<()> {
    let store = &engine.inner.store;

    for c in children.iter().filter(|c| c.status != ActionStatus::Succeeded) {
        match c.kind {
            // Failed creates that rolled back cleanly leave nothing worth
            // keeping.
            ActionKind::NodeCreate => {
                if let Some(node) = store.find_node(&c.target)? {
                    if node.resources.is_empty() {
                        store.remove_node(&node.id)?;
                    }
                }
            }
            // A removal that never happened gives its claim back.
            ActionKind::NodeDelete | ActionKind::NodeLeave => {
                if store.find_node(&c.target)?.is_some() {
                    let reason = format!("{} ended {}", c.kind, c.status);
                    store.update_node(&c.target, |n| {
                        if n.status == NodeStatus::Deleting {
                            let back = if n.resources.is_empty() {
                                NodeStatus::Error
                            } else {
                                NodeStatus::Active
                            };
                            n.set_status(back, reason.clone());
                        }
                        Ok(())
                    })?;
                }
            }
            _ => {}
        }
    }

    let mut delta: i64 = 0;
    if parent.kind != ActionKind::ClusterReplaceNodes && parent.kind != ActionKind::ClusterDelete {
        for c in children.iter().filter(|c| c.status != ActionStatus::Succeeded) {
            match c.kind {
                ActionKind::NodeCreate | ActionKind::NodeJoin => delta -= 1,
                ActionKind::NodeDelete | ActionKind::NodeLeave => delta += 1,
                _ => {}
            }
        }
    }

    let unhealthy = children.iter().any(|c| {
        c.kind == ActionKind::NodeCheck
            && c.outputs.get("healthy").and_then(Value::as_bool) == Some(false)
    });

    let cluster_id = parent.target.clone();
    let kind = parent.kind;
    let reason = match status {
        ActionStatus::Succeeded => format!("{kind} succeeded"),
        other => format!("{kind} ended {other}"),
    };
    store.update_cluster(&cluster_id, |c| {
        let next = i64::from(c.desired_capacity) + delta;
        c.desired_capacity = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
        let next_status = match (kind, status) {
            (ActionKind::ClusterDelete, ActionStatus::Succeeded) => ClusterStatus::Deleted,
            (ActionKind::ClusterDelete, _) | (ActionKind::ClusterCreate, ActionStatus::Failed) => {
                ClusterStatus::Error
            }
            (ActionKind::ClusterCheck, ActionStatus::Succeeded) if unhealthy => ClusterStatus::Warning,
            (_, ActionStatus::Succeeded) => ClusterStatus::Active,
            _ => ClusterStatus::Warning,
        };
        c.set_status(next_status, reason.clone());
        Ok(())
    })?;

    if kind == ActionKind::ClusterDelete && status == ActionStatus::Succeeded {
        for binding in store.bindings(&cluster_id)? {
            store.remove_binding(&cluster_id, &binding.policy_id)?;
        }
    }
    Ok(())
}
