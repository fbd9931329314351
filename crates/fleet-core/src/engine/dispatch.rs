//! Running one leaf action on a worker.

use serde_json::{Map, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{handlers, settle, Engine};
use crate::action::{Action, ActionStatus};
use crate::backoff;
use crate::driver::{unwind, CancelToken, Journal};
use crate::error::{FleetError, Result};
use crate::lock::lock_key;
use crate::policy::{CheckContext, Pipeline};

struct Outcome {
    status: ActionStatus,
    reason: String,
    outputs: Map<String, Value>,
}

impl Outcome {
    fn new(status: ActionStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            outputs: Map::new(),
        }
    }
}

/// Dispatch `id`, logging instead of propagating: a failing action must
/// never take its worker down.
pub(super) async fn run(engine: &Engine, id: Uuid) {
    if let Err(e) = dispatch(engine, id).await {
        error!(action_id = %id, error = %e, "dispatch failed");
    }
}

async fn dispatch(engine: &Engine, id: Uuid) -> Result<()> {
    let inner = &engine.inner;
    let action = inner.store.action(id)?;
    if action.status != ActionStatus::Ready {
        debug!(action_id = %id, status = %action.status, "not ready, skipping");
        return Ok(());
    }
    if action.cancel_requested {
        let done = inner.store.update_action(id, |a| {
            a.transition(ActionStatus::Cancelled, "cancelled before dispatch")
        })?;
        return engine.propagate(done);
    }

    let (rt, rid) = (action.target_type, action.target.as_str());
    let lease = inner.config.lock_lease();
    if !inner.locks.try_acquire(rt, rid, id, &inner.id, lease)? {
        return lock_busy(engine, &action);
    }

    // Lost a race with a cancel or another engine: give the lock back.
    let claimed = match inner.store.update_action(id, |a| {
        a.transition(ActionStatus::Running, "")?;
        a.owner = Some(inner.id.clone());
        Ok(())
    }) {
        Ok(a) => a,
        Err(FleetError::InvalidTransition { from, .. }) => {
            debug!(action_id = %id, status = %from, "action moved before it could run");
            // A RUNNING action is owned by another dispatch of the same id,
            // and the lock it holds is that dispatch's to release.
            if from != ActionStatus::Running.to_string() {
                release(engine, &action);
            }
            return Ok(());
        }
        Err(e) => {
            release(engine, &action);
            return Err(e);
        }
    };
    info!(action_id = %id, kind = %claimed.kind, target = %claimed.target, "running");

    let token = CancelToken::new();
    if claimed.cancel_requested {
        token.cancel();
    }
    engine.running_tokens().insert(id, token.clone());
    let heartbeat = spawn_heartbeat(engine.clone(), &claimed, token.clone());

    let outcome = execute(engine, claimed, &token).await;

    heartbeat.abort();
    engine.running_tokens().remove(&id);

    // Post-checks see the result first, then the lock goes, and only then
    // is the result recorded, so a terminal action never holds its lock.
    let current = match inner.store.action(id) {
        Ok(current) => current,
        Err(e) => {
            release(engine, &action);
            return Err(e);
        }
    };
    if current.status != ActionStatus::Running
        || current.owner.as_deref() != Some(inner.id.as_str())
    {
        // The sweeper already requeued or failed this action.
        warn!(action_id = %id, status = %current.status, "result dropped, action was reclaimed");
        return Ok(());
    }
    let mut result = current;
    if let Err(e) = record(&mut result, &outcome) {
        release(engine, &result);
        return Err(e);
    }
    match result.status {
        ActionStatus::Succeeded => info!(action_id = %id, "succeeded"),
        status => warn!(action_id = %id, %status, reason = %result.status_reason, "finished"),
    }
    settle::post_checks(engine, &result);
    release(engine, &result);

    match inner.store.update_action(id, |a| record(a, &outcome)) {
        Ok(done) => engine.propagate(done),
        Err(FleetError::InvalidTransition { from, .. }) => {
            warn!(action_id = %id, status = %from, "result dropped, action was reclaimed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn record(action: &mut Action, outcome: &Outcome) -> Result<()> {
    for (k, v) in &outcome.outputs {
        action.outputs.insert(k.clone(), v.clone());
    }
    action.transition(outcome.status, outcome.reason.clone())
}

fn release(engine: &Engine, action: &Action) {
    if let Err(e) = engine
        .inner
        .locks
        .release(action.target_type, &action.target, action.id)
    {
        warn!(action_id = %action.id, error = %e, "lock release failed");
    }
}

/// The target is locked by someone else: retry later, or give up.
fn lock_busy(engine: &Engine, action: &Action) -> Result<()> {
    let inner = &engine.inner;
    let holder = inner
        .locks
        .holder(action.target_type, &action.target)?
        .map(|h| h.holder_action.to_string())
        .unwrap_or_default();
    let updated = inner.store.update_action(action.id, |a| {
        if a.status == ActionStatus::Ready {
            a.lock_attempts += 1;
        }
        Ok(())
    })?;
    // A duplicate queue entry raced the dispatch that now owns the action.
    if updated.status != ActionStatus::Ready {
        return Ok(());
    }

    if updated.lock_attempts > inner.config.lock_retry_limit {
        let err = FleetError::LockConflict {
            resource: lock_key(action.target_type, &action.target),
            holder,
        };
        warn!(action_id = %action.id, attempts = updated.lock_attempts, error = %err, "giving up on lock");
        let done = inner.store.update_action(action.id, |a| {
            if a.status == ActionStatus::Ready {
                a.transition(ActionStatus::Failed, err.to_string())?;
            }
            Ok(())
        })?;
        if done.status != ActionStatus::Failed {
            return Ok(());
        }
        return engine.propagate(done);
    }

    let delay = backoff::jittered(
        inner.config.lock_retry_base(),
        inner.config.lock_retry_max(),
        updated.lock_attempts - 1,
    );
    debug!(
        action_id = %action.id,
        holder = %holder,
        attempt = updated.lock_attempts,
        retry_in_ms = delay.as_millis() as u64,
        "target locked, requeueing"
    );
    inner.queue.defer(action.id, updated.priority, delay);
    Ok(())
}

/// Keep the lease alive while the action runs, and forward cancel requests
/// made through the store (possibly by another process).
fn spawn_heartbeat(engine: Engine, action: &Action, token: CancelToken) -> JoinHandle<()> {
    let (id, rt, rid) = (action.id, action.target_type, action.target.clone());
    let lease = engine.inner.config.lock_lease();
    let period = (lease / 3).max(Duration::from_millis(50));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            match engine.inner.locks.renew(rt, &rid, id, lease) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(action_id = %id, "lock lost while running, cancelling");
                    token.cancel();
                    return;
                }
                Err(e) => warn!(action_id = %id, error = %e, "lease renewal failed"),
            }
            if let Ok(current) = engine.inner.store.action(id) {
                if current.cancel_requested {
                    token.cancel();
                }
            }
        }
    })
}

/// Checkpoints, pre-checks, then the handler under the action deadline.
async fn execute(engine: &Engine, mut action: Action, token: &CancelToken) -> Outcome {
    if token.is_cancelled() {
        return Outcome::new(ActionStatus::Cancelled, "cancelled after lock acquisition");
    }

    if let Err(e) = pre_check(engine, &mut action) {
        let status = match e {
            FleetError::Cancelled(_) => ActionStatus::Cancelled,
            _ => ActionStatus::Failed,
        };
        return Outcome::new(status, e.to_string());
    }

    if token.is_cancelled() {
        return Outcome::new(ActionStatus::Cancelled, "cancelled before execution");
    }

    let journal = Journal::new();
    let deadline = Duration::from_secs(action.timeout_secs);
    let work = handlers::run(engine, &action, &journal, token);
    match tokio::time::timeout(deadline, work).await {
        Ok(Ok(outputs)) => Outcome {
            status: ActionStatus::Succeeded,
            reason: String::new(),
            outputs,
        },
        Ok(Err(FleetError::Cancelled(reason))) => Outcome::new(ActionStatus::Cancelled, reason),
        Ok(Err(e)) => Outcome::new(ActionStatus::Failed, e.to_string()),
        Err(_) => {
            warn!(action_id = %action.id, timeout_secs = action.timeout_secs, "deadline exceeded, rolling back");
            if let Err(e) = unwind(&engine.inner.drivers, &engine.inner.retry, &journal).await {
                warn!(action_id = %action.id, error = %e, "rollback after timeout incomplete");
            }
            handlers::after_timeout(engine, &action, &journal);
            Outcome::new(
                ActionStatus::Timeout,
                FleetError::Timeout(action.timeout_secs).to_string(),
            )
        }
    }
}

/// Run the cluster's pre-checks against a leaf action and persist the
/// merged inputs.
fn pre_check(engine: &Engine, action: &mut Action) -> Result<()> {
    let store = &engine.inner.store;
    let Some(cluster) = settle::cluster_of(store, action)? else {
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
    pipeline.pre_check(&ctx, action)?;
    let inputs = action.inputs.clone();
    store.update_action(action.id, |a| {
        a.inputs = inputs.clone();
        Ok(())
    })?;
    Ok(())
}
