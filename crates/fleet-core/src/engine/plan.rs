//! Expansion of compound cluster actions into node-level children.
//!
//! Runs at submission: the cluster's pre-checks first, then a capacity
//! reservation on the cluster record (compare-and-swap), then node records
//! and child actions. A refusal at any stage fails the parent without
//! creating children.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{settle, Engine};
use crate::action::{Action, ActionStatus};
use crate::cluster::{Cluster, ClusterStatus, Node, NodeStatus, Profile, ResizeRequest};
use crate::error::{FleetError, Result};
use crate::graph::{self, ChildPlan};
use crate::policy::{CheckContext, Pipeline};
use crate::types::{ActionKind, Cause};

pub(super) fn expand(engine: &Engine, parent_id: Uuid) -> Result<()> {
    let store = &engine.inner.store;
    let mut parent = store.action(parent_id)?;
    let cluster = store.cluster(&parent.target)?;
    let members = store.cluster_nodes(&cluster.id)?;

    let pipeline = Pipeline::load(store, &cluster.id)?;
    let ctx = CheckContext {
        cluster: &cluster,
        members: &members,
    };
    let checked = pipeline.pre_check(&ctx, &mut parent);
    let inputs = parent.inputs.clone();
    store.update_action(parent_id, |a| {
        a.inputs = inputs.clone();
        Ok(())
    })?;
    if let Err(e) = checked {
        return refuse(engine, parent_id, e);
    }

    let plans = match build(engine, &parent, &cluster, &members) {
        Ok(plans) => plans,
        Err(e) => return refuse(engine, parent_id, e),
    };

    if plans.is_empty() {
        if let Some(done) = settle::finalize(engine, parent_id)? {
            engine.propagate(done)?;
        }
        return Ok(());
    }

    let count = plans.len();
    for id in graph::expand(store, parent_id, plans)? {
        let child = store.action(id)?;
        engine.inner.queue.push(id, child.priority);
    }
    info!(action_id = %parent_id, kind = %parent.kind, children = count, "expanded");
    Ok(())
}

/// Fail the parent before any child exists, still giving post-checks a look.
fn refuse(engine: &Engine, parent_id: Uuid, err: FleetError) -> Result<()> {
    let reason = err.to_string();
    warn!(action_id = %parent_id, %reason, "compound action refused");
    let done = engine
        .inner
        .store
        .update_action(parent_id, |a| a.transition(ActionStatus::Failed, reason.clone()))?;
    settle::post_checks(engine, &done);
    engine.propagate(done)
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

fn child(kind: ActionKind, target: &str, parent: &Action, inputs: Map<String, Value>) -> Action {
    Action::new(kind, target, inputs, Cause::Derived, parent.timeout_secs)
}

fn ids(inputs: &Map<String, Value>, key: &str) -> Vec<String> {
    inputs
        .get(key)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn zone_at(parent: &Action, i: usize) -> Option<String> {
    parent
        .inputs
        .get("placement")
        .and_then(Value::as_array)
        .and_then(|zones| zones.get(i))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn count_input(parent: &Action) -> u32 {
    parent
        .input_u64("count")
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1)
}

fn live(members: &[Node]) -> Vec<&Node> {
    members
        .iter()
        .filter(|n| n.status != NodeStatus::Deleted)
        .collect()
}

/// Members that stay after the removals already under way.
fn staying(members: &[Node]) -> Vec<&Node> {
    members.iter().filter(|n| n.is_removable()).collect()
}

/// Size bounds a resize commits in the same swap as its capacity change.
#[derive(Debug, Clone, Copy, Default)]
struct Bounds {
    min_size: Option<u32>,
    max_size: Option<u32>,
}

/// Reserve `delta` nodes of capacity (negative shrinks) and, when growing,
/// allocate `new_nodes` member indices. New bounds are applied and checked
/// inside the swap, so a refusal leaves the cluster record untouched.
fn reserve(
    engine: &Engine,
    cluster_id: &str,
    delta: i64,
    new_nodes: u32,
    bounds: Bounds,
) -> Result<(Cluster, Vec<u32>)> {
    let limit = i64::from(engine.inner.config.max_members_per_cluster);
    let mut indices = Vec::new();
    let cluster = engine.inner.store.update_cluster(cluster_id, |c| {
        indices.clear();
        if let Some(min) = bounds.min_size {
            c.min_size = min;
        }
        if let Some(max) = bounds.max_size {
            c.max_size = Some(max);
        }
        let next = i64::from(c.desired_capacity) + delta;
        if delta > 0 {
            if let Some(max) = c.max_size {
                if next > i64::from(max) {
                    return Err(FleetError::Validation(
                        "Attempted scaling exceeds maximum size".into(),
                    ));
                }
            }
            if next > limit {
                return Err(FleetError::Validation(format!(
                    "cluster would exceed the limit of {limit} members"
                )));
            }
        }
        if delta < 0 && next < i64::from(c.min_size) {
            return Err(FleetError::Validation(
                "Attempted scaling exceeds minimum size".into(),
            ));
        }
        c.desired_capacity = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
        for _ in 0..new_nodes {
            indices.push(c.take_index());
        }
        Ok(())
    })?;
    Ok((cluster, indices))
}

// ---------------------------------------------------------------------------
// Removal claims
// ---------------------------------------------------------------------------

/// Attempts at picking victims before a shrink gives up on concurrent
/// claimers.
const CLAIM_ATTEMPTS: usize = 5;

/// A node marked DELETING, with the status to restore if the removal is
/// abandoned.
struct Claim {
    node_id: String,
    previous: NodeStatus,
}

/// Mark every node in `ids` DELETING, each with its own swap. Returns `None`
/// when another action claimed one of them first; whatever this call had
/// claimed is handed back.
fn claim(engine: &Engine, parent: &Action, ids: &[String]) -> Result<Option<Vec<Claim>>> {
    let store = &engine.inner.store;
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let mut previous = None;
        let mut taken = false;
        let result = store.update_node(id, |n| {
            previous = None;
            taken = !n.is_removable();
            if taken {
                return Ok(());
            }
            previous = Some(n.status);
            n.set_status(NodeStatus::Deleting, format!("removal by {}", parent.id));
            Ok(())
        });
        let lost = match result {
            Ok(_) => taken,
            Err(FleetError::NodeNotFound(_)) => true,
            Err(e) => {
                unclaim(engine, &claimed);
                return Err(e);
            }
        };
        match previous {
            Some(previous) if !lost => claimed.push(Claim {
                node_id: id.clone(),
                previous,
            }),
            _ => {
                debug!(action_id = %parent.id, node_id = %id, "node already claimed");
                unclaim(engine, &claimed);
                return Ok(None);
            }
        }
    }
    Ok(Some(claimed))
}

fn unclaim(engine: &Engine, claims: &[Claim]) {
    for c in claims {
        let result = engine.inner.store.update_node(&c.node_id, |n| {
            if n.status == NodeStatus::Deleting {
                n.set_status(c.previous, "removal abandoned");
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(node_id = %c.node_id, error = %e, "could not release removal claim");
        }
    }
}

/// Claim `count` victims, then reserve the smaller size. Victims are picked
/// again from a fresh view when a concurrent action claims one first.
fn shrink(engine: &Engine, parent: &Action, cluster_id: &str, count: u32, bounds: Bounds) -> Result<Vec<ChildPlan>> {
    let store = &engine.inner.store;
    for _ in 0..CLAIM_ATTEMPTS {
        let members = store.cluster_nodes(cluster_id)?;
        let chosen = victims(parent, &members, count as usize)?;
        let Some(claims) = claim(engine, parent, &chosen)? else {
            continue;
        };
        if let Err(e) = reserve(engine, cluster_id, -i64::from(count), 0, bounds) {
            unclaim(engine, &claims);
            return Err(e);
        }
        return Ok(removals(parent, &chosen));
    }
    Err(FleetError::Validation(format!(
        "could not claim {count} nodes for removal: members are being removed concurrently"
    )))
}

/// Claim nodes the caller named. Unlike [`shrink`] there is nothing to pick
/// again, so a node claimed elsewhere refuses the action.
fn claim_named(engine: &Engine, parent: &Action, ids: &[String]) -> Result<Vec<Claim>> {
    claim(engine, parent, ids)?.ok_or_else(|| {
        FleetError::Validation(format!(
            "one of {} is already being removed",
            ids.join(", ")
        ))
    })
}

/// One NODE_CREATE per index, each with a fresh node record.
fn creates(engine: &Engine, parent: &Action, cluster: &Cluster, indices: &[u32]) -> Result<Vec<ChildPlan>> {
    let mut plans = Vec::with_capacity(indices.len());
    for (i, &idx) in indices.iter().enumerate() {
        let mut node = Node::new(cluster.node_name(idx), Some(cluster.id.clone()), idx);
        node.zone = zone_at(parent, i);
        engine.inner.store.insert_node(&node)?;
        let mut inputs = Map::new();
        if let Some(zone) = &node.zone {
            inputs.insert("zone".into(), Value::from(zone.clone()));
        }
        plans.push(ChildPlan::new(child(ActionKind::NodeCreate, &node.id, parent, inputs)));
    }
    Ok(plans)
}

/// NODE_DELETE, or NODE_LEAVE when the deletion policy keeps resources.
fn removals(parent: &Action, victims: &[String]) -> Vec<ChildPlan> {
    let destroy = parent
        .inputs
        .get("destroy_after_deletion")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let kind = if destroy {
        ActionKind::NodeDelete
    } else {
        ActionKind::NodeLeave
    };
    let mut inputs = Map::new();
    if let Some(grace) = parent.input_u64("grace_period") {
        inputs.insert("grace_period".into(), Value::from(grace));
    }
    victims
        .iter()
        .map(|id| ChildPlan::new(child(kind, id, parent, inputs.clone())))
        .collect()
}

/// Victims for a shrink by `count`: policy candidates first, then the
/// highest-indexed members. Nodes another action already claimed are never
/// picked.
fn victims(parent: &Action, members: &[Node], count: usize) -> Result<Vec<String>> {
    let free = staying(members);
    if count > free.len() {
        return Err(FleetError::Validation(format!(
            "cannot remove {count} nodes from a cluster of {}",
            free.len()
        )));
    }
    let mut chosen: Vec<String> = ids(&parent.inputs, "candidates")
        .into_iter()
        .filter(|id| free.iter().any(|n| &n.id == id))
        .take(count)
        .collect();
    let mut rest: Vec<&Node> = free
        .into_iter()
        .filter(|n| !chosen.contains(&n.id))
        .collect();
    rest.sort_by(|a, b| b.index.cmp(&a.index));
    for node in rest {
        if chosen.len() >= count {
            break;
        }
        chosen.push(node.id.clone());
    }
    Ok(chosen)
}

fn build(engine: &Engine, parent: &Action, cluster: &Cluster, members: &[Node]) -> Result<Vec<ChildPlan>> {
    let store = &engine.inner.store;
    match parent.kind {
        ActionKind::ClusterCreate => {
            let missing = cluster
                .desired_capacity
                .saturating_sub(live(members).len() as u32);
            let (cluster, indices) = reserve(engine, &cluster.id, 0, missing, Bounds::default())?;
            creates(engine, parent, &cluster, &indices)
        }

        ActionKind::ClusterScaleOut => {
            let count = count_input(parent);
            let (cluster, indices) =
                reserve(engine, &cluster.id, i64::from(count), count, Bounds::default())?;
            creates(engine, parent, &cluster, &indices)
        }

        ActionKind::ClusterScaleIn => {
            shrink(engine, parent, &cluster.id, count_input(parent), Bounds::default())
        }

        ActionKind::ClusterResize => {
            let req = ResizeRequest::from_inputs(&parent.inputs)?;
            let target = req.target(cluster)?;
            let current = cluster.desired_capacity;
            let bounds = Bounds {
                min_size: req.min_size,
                max_size: req.max_size,
            };
            if target > current {
                let grow = target - current;
                let (cluster, indices) = reserve(engine, &cluster.id, i64::from(grow), grow, bounds)?;
                creates(engine, parent, &cluster, &indices)
            } else if target < current {
                shrink(engine, parent, &cluster.id, current - target, bounds)
            } else {
                reserve(engine, &cluster.id, 0, 0, bounds)?;
                Ok(Vec::new())
            }
        }

        ActionKind::ClusterAddNodes => {
            let nodes = ids(&parent.inputs, "nodes");
            reserve(engine, &cluster.id, nodes.len() as i64, 0, Bounds::default())?;
            let mut inputs = Map::new();
            inputs.insert("cluster".into(), Value::from(cluster.id.clone()));
            Ok(nodes
                .iter()
                .map(|id| ChildPlan::new(child(ActionKind::NodeJoin, id, parent, inputs.clone())))
                .collect())
        }

        ActionKind::ClusterDelNodes => {
            let nodes = ids(&parent.inputs, "nodes");
            let claims = claim_named(engine, parent, &nodes)?;
            if let Err(e) = reserve(engine, &cluster.id, -(nodes.len() as i64), 0, Bounds::default()) {
                unclaim(engine, &claims);
                return Err(e);
            }
            Ok(removals(parent, &nodes))
        }

        ActionKind::ClusterReplaceNodes => {
            let old = ids(&parent.inputs, "nodes");
            let claims = claim_named(engine, parent, &old)?;
            let (cluster, indices) =
                match reserve(engine, &cluster.id, 0, old.len() as u32, Bounds::default()) {
                    Ok(reserved) => reserved,
                    Err(e) => {
                        unclaim(engine, &claims);
                        return Err(e);
                    }
                };
            let mut plans = creates(engine, parent, &cluster, &indices)?;
            // Each old node goes only once its replacement is up.
            for (i, id) in old.iter().enumerate() {
                let delete = child(ActionKind::NodeDelete, id, parent, Map::new());
                plans.push(ChildPlan::new(delete).after(i));
            }
            Ok(plans)
        }

        ActionKind::ClusterDelete => {
            store.update_cluster(&cluster.id, |c| {
                c.set_status(ClusterStatus::Deleting, "deleting");
                c.desired_capacity = 0;
                Ok(())
            })?;
            Ok(live(members)
                .into_iter()
                .map(|n| ChildPlan::new(child(ActionKind::NodeDelete, &n.id, parent, Map::new())))
                .collect())
        }

        ActionKind::ClusterUpdate => {
            let value = parent
                .inputs
                .get("profile")
                .cloned()
                .ok_or_else(|| FleetError::Validation("update requires a profile".into()))?;
            let profile: Profile = serde_json::from_value(value.clone())?;
            store.update_cluster(&cluster.id, |c| {
                c.profile = profile.clone();
                Ok(())
            })?;
            let mut inputs = Map::new();
            inputs.insert("profile".into(), value);
            Ok(staying(members)
                .into_iter()
                .map(|n| ChildPlan::new(child(ActionKind::NodeUpdate, &n.id, parent, inputs.clone())))
                .collect())
        }

        ActionKind::ClusterCheck => Ok(staying(members)
            .into_iter()
            .map(|n| ChildPlan::new(child(ActionKind::NodeCheck, &n.id, parent, Map::new())))
            .collect()),

        ActionKind::ClusterRecover => {
            let listed = ids(&parent.inputs, "nodes");
            let targets: Vec<String> = if listed.is_empty() {
                staying(members)
                    .into_iter()
                    .filter(|n| n.status == NodeStatus::Error)
                    .map(|n| n.id.clone())
                    .collect()
            } else {
                listed
            };
            Ok(targets
                .iter()
                .map(|id| ChildPlan::new(child(ActionKind::NodeRecover, id, parent, Map::new())))
                .collect())
        }

        kind => Err(FleetError::Validation(format!("{kind} does not expand"))),
    }
}
