//! Dependency bookkeeping between actions.
//!
//! A compound action expands into children and depends on every one of them.
//! Children may also depend on each other. Each action counts its pending
//! dependencies; a child's terminal transition decrements that counter on
//! every dependent with a compare-and-swap, and remembers itself in
//! `settled` so a repeated notification is a no-op.

use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

use crate::action::{Action, ActionStatus};
use crate::error::{FleetError, Result};
use crate::store::Store;
use crate::types::Cause;

/// One child of a compound action. `after` holds indices of earlier or later
/// siblings in the same plan that must succeed first.
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub action: Action,
    pub after: Vec<usize>,
}

impl ChildPlan {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            after: Vec::new(),
        }
    }

    pub fn after(mut self, index: usize) -> Self {
        if !self.after.contains(&index) {
            self.after.push(index);
        }
        self
    }
}

/// What a terminal transition unlocked.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A dependent whose prerequisites all succeeded.
    Ready(Uuid),
    /// A dependent resolved to a terminal state without running.
    Resolved(Action),
    /// A parent whose last child finished.
    FanIn(Uuid),
}

/// Kahn's algorithm over `after` edges. Fails with the indices left on a
/// cycle.
pub fn check_acyclic(plans: &[ChildPlan]) -> Result<()> {
    let n = plans.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, plan) in plans.iter().enumerate() {
        for &dep in &plan.after {
            if dep >= n {
                return Err(FleetError::Validation(format!(
                    "child {i} depends on unknown child {dep}"
                )));
            }
            indegree[i] += 1;
            dependents[dep].push(i);
        }
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if visited == n {
        Ok(())
    } else {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| plans[i].action.name.clone())
            .collect();
        Err(FleetError::CyclicDependency(stuck.join(" -> ")))
    }
}

/// Persist `plans` as children of `parent_id` and move the parent to
/// WAITING. Returns the ids of children that are immediately READY.
pub fn expand(store: &Store, parent_id: Uuid, plans: Vec<ChildPlan>) -> Result<Vec<Uuid>> {
    check_acyclic(&plans)?;
    let parent = store.action(parent_id)?;
    let ids: Vec<Uuid> = plans.iter().map(|p| p.action.id).collect();

    let mut dependents: Vec<Vec<Uuid>> = vec![Vec::new(); plans.len()];
    for (i, plan) in plans.iter().enumerate() {
        for &dep in &plan.after {
            dependents[dep].push(ids[i]);
        }
    }

    let mut ready = Vec::new();
    for (i, plan) in plans.into_iter().enumerate() {
        let mut child = plan.action;
        child.parent = Some(parent_id);
        child.cause = Cause::Derived;
        child.priority = parent.priority;
        child.depends_on = plan.after.iter().map(|&d| ids[d]).collect();
        child.depended_by = std::mem::take(&mut dependents[i]);
        child.depended_by.push(parent_id);
        child.pending = child.depends_on.len() as u32;
        if child.pending == 0 {
            child.transition(ActionStatus::Ready, "")?;
            ready.push(child.id);
        } else {
            child.transition(ActionStatus::Waiting, "waiting on prerequisites")?;
        }
        store.insert_action(&child)?;
    }

    let count = ids.len();
    store.update_action(parent_id, |p| {
        p.depends_on = ids.clone();
        p.pending = count as u32;
        p.transition(ActionStatus::Waiting, format!("waiting on {count} children"))
    })?;
    debug!(action_id = %parent_id, children = count, ready = ready.len(), "expanded");
    Ok(ready)
}

fn push_id(outputs: &mut serde_json::Map<String, Value>, key: &str, id: Uuid) {
    let entry = outputs
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = entry {
        list.push(Value::from(id.to_string()));
    }
}

fn bucket(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Succeeded => "succeeded",
        ActionStatus::Cancelled => "cancelled",
        _ => "failed",
    }
}

/// Report that `child` reached a terminal state to everything depending on
/// it.
pub fn on_terminal(store: &Store, child: &Action) -> Result<Vec<Resolution>> {
    if !child.is_terminal() {
        return Err(FleetError::InvalidTransition {
            from: child.status.to_string(),
            to: "fan-in".into(),
            reason: format!("action {} is not terminal", child.id),
        });
    }
    let mut resolutions = Vec::new();
    for &dependent in &child.depended_by {
        let mut outcome = None;
        let is_parent = child.parent == Some(dependent);
        store.update_action(dependent, |d| {
            outcome = None;
            if d.is_terminal() || d.settled.contains(&child.id) {
                return Ok(());
            }
            d.settled.push(child.id);
            d.pending = d.pending.saturating_sub(1);
            if is_parent {
                push_id(&mut d.outputs, bucket(child.status), child.id);
                if d.pending == 0 {
                    outcome = Some(Resolution::FanIn(d.id));
                }
                return Ok(());
            }
            if d.status != ActionStatus::Waiting {
                return Ok(());
            }
            match child.status {
                ActionStatus::Succeeded if d.pending == 0 => {
                    d.transition(ActionStatus::Ready, "prerequisites succeeded")?;
                    outcome = Some(Resolution::Ready(d.id));
                }
                ActionStatus::Succeeded => {}
                ActionStatus::Cancelled => {
                    d.transition(
                        ActionStatus::Cancelled,
                        format!("prerequisite {} was cancelled", child.id),
                    )?;
                    outcome = Some(Resolution::Resolved(d.clone()));
                }
                other => {
                    d.transition(
                        ActionStatus::Failed,
                        format!("prerequisite {} ended {other}", child.id),
                    )?;
                    outcome = Some(Resolution::Resolved(d.clone()));
                }
            }
            Ok(())
        })?;
        if let Some(r) = outcome {
            resolutions.push(r);
        }
    }
    Ok(resolutions)
}

fn list_len(action: &Action, key: &str) -> usize {
    action
        .outputs
        .get(key)
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

/// Terminal status of a parent from its settled children. Any failed or
/// timed-out child fails the parent; otherwise a cancel request or a
/// cancelled child cancels it.
pub fn aggregate(parent: &Action) -> (ActionStatus, String) {
    let total = parent.depends_on.len();
    let failed = list_len(parent, "failed");
    let cancelled = list_len(parent, "cancelled");
    if failed > 0 {
        (
            ActionStatus::Failed,
            format!("{failed} of {total} children failed"),
        )
    } else if parent.cancel_requested || cancelled > 0 {
        (
            ActionStatus::Cancelled,
            format!("cancelled; {cancelled} of {total} children did not run"),
        )
    } else {
        (
            ActionStatus::Succeeded,
            format!("all {total} children succeeded"),
        )
    }
}

/// Cancel every child of `parent_id` that has not started and flag running
/// ones so they stop at their next checkpoint. Returns the children that
/// were cancelled so their dependents can be notified.
pub fn cancel_children(store: &Store, parent_id: Uuid) -> Result<Vec<Action>> {
    let parent = store.action(parent_id)?;
    let mut cancelled = Vec::new();
    for &child_id in &parent.depends_on {
        let mut changed = false;
        let child = store.update_action(child_id, |c| {
            changed = false;
            if matches!(
                c.status,
                ActionStatus::Init | ActionStatus::Waiting | ActionStatus::Ready
            ) {
                c.cancel_requested = true;
                c.transition(ActionStatus::Cancelled, "parent cancelled")?;
                changed = true;
            } else if c.status == ActionStatus::Running {
                c.cancel_requested = true;
            }
            Ok(())
        })?;
        if changed {
            cancelled.push(child);
        }
    }
    Ok(cancelled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
