//! Lease sweeps and startup recovery.
//!
//! An action whose lock expired without its engine renewing it is an
//! orphan. Idempotent kinds go back on the queue; everything else fails,
//! because re-running it could double-provision.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{settle, Engine};
use crate::action::{ActionFilter, ActionStatus};
use crate::error::{FleetError, Result};
use crate::lock::LockRecord;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclaimReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Delete expired locks and settle the actions that held them.
pub(super) fn sweep(engine: &Engine) -> Result<ReclaimReport> {
    let mut report = ReclaimReport::default();
    for record in engine.inner.locks.reclaim_expired(Utc::now())? {
        handle_orphan(engine, record.holder_action, &mut report)?;
    }
    if !report.is_empty() {
        info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "lease sweep reclaimed actions"
        );
    }
    Ok(report)
}

fn handle_orphan(engine: &Engine, id: Uuid, report: &mut ReclaimReport) -> Result<()> {
    let store = &engine.inner.store;
    let action = match store.action(id) {
        Ok(a) => a,
        Err(FleetError::ActionNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if action.status != ActionStatus::Running {
        return Ok(());
    }
    if engine.is_running_here(id) {
        // Still executing in this process; the heartbeat will notice the
        // lost lock and cancel it.
        warn!(action_id = %id, "lease expired under a local action");
        return Ok(());
    }

    if action.kind.is_idempotent() {
        let ready = store.update_action(id, |a| {
            a.transition(ActionStatus::Ready, "requeued after lost lease")
        })?;
        warn!(action_id = %id, kind = %ready.kind, previous_owner = ?action.owner, "orphan requeued");
        engine.inner.queue.push(id, ready.priority);
        report.requeued.push(id);
    } else {
        let done = store.update_action(id, |a| {
            a.transition(ActionStatus::Failed, "orphaned: lock lease expired")
        })?;
        warn!(action_id = %id, kind = %done.kind, previous_owner = ?action.owner, "orphan failed");
        report.failed.push(id);
        engine.propagate(done)?;
    }
    Ok(())
}

/// Rebuild in-memory state from the store before the workers start.
pub(super) fn recover(engine: &Engine) -> Result<()> {
    let store = &engine.inner.store;
    let locks = &engine.inner.locks;
    let now = Utc::now();

    let stalled = resume_unplanned(engine)?;

    let ready = store.list_actions(&ActionFilter {
        status: Some(ActionStatus::Ready),
        ..ActionFilter::default()
    })?;
    for action in ready.iter().filter(|a| !engine.inner.queue.contains(a.id)) {
        engine.inner.queue.push(action.id, action.priority);
    }

    let mut report = ReclaimReport::default();
    let running = store.list_actions(&ActionFilter {
        status: Some(ActionStatus::Running),
        ..ActionFilter::default()
    })?;
    for action in running {
        if engine.is_running_here(action.id) {
            continue;
        }
        let held = locks
            .holder(action.target_type, &action.target)?
            .filter(|h: &LockRecord| h.holder_action == action.id && !h.is_expired(now));
        if held.is_none() {
            handle_orphan(engine, action.id, &mut report)?;
        }
    }

    let repropagated = replay_fan_in(engine)?;

    let waiting = store.list_actions(&ActionFilter {
        status: Some(ActionStatus::Waiting),
        ..ActionFilter::default()
    })?;
    for parent in waiting.iter().filter(|a| a.is_compound() && a.pending == 0) {
        if let Some(done) = settle::finalize(engine, parent.id)? {
            engine.propagate(done)?;
        }
    }

    info!(
        engine = %engine.id(),
        queued = ready.len(),
        requeued = report.requeued.len(),
        failed = report.failed.len(),
        stalled,
        repropagated,
        "recovered persisted actions"
    );
    Ok(())
}

/// Report terminal actions whose dependents never counted them, which
/// happens when a process stops between recording a result and fanning it
/// in. Counting is keyed on `settled`, so a report that did arrive is not
/// counted twice.
fn replay_fan_in(engine: &Engine) -> Result<usize> {
    let store = &engine.inner.store;
    let mut replayed = 0;
    for action in store.list_actions(&ActionFilter::default())? {
        if !action.is_terminal() || action.depended_by.is_empty() {
            continue;
        }
        let mut unreported = false;
        for dependent in &action.depended_by {
            match store.action(*dependent) {
                Ok(d) if !d.is_terminal() && !d.settled.contains(&action.id) => unreported = true,
                Ok(_) | Err(FleetError::ActionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if unreported {
            warn!(action_id = %action.id, status = %action.status, "result was never fanned in, reporting it again");
            engine.propagate(action)?;
            replayed += 1;
        }
    }
    Ok(replayed)
}

/// Actions still in INIT after a lease period were abandoned by a submitter
/// that stopped. A leaf has done nothing yet and is queued; a compound may
/// have reserved capacity without planning children, so it fails.
fn resume_unplanned(engine: &Engine) -> Result<usize> {
    let store = &engine.inner.store;
    let grace = chrono::Duration::from_std(engine.inner.config.lock_lease())
        .unwrap_or_else(|_| chrono::Duration::zero());
    let cutoff = Utc::now() - grace;
    let stalled = store.list_actions(&ActionFilter {
        status: Some(ActionStatus::Init),
        ..ActionFilter::default()
    })?;
    let mut resumed = 0;
    for action in stalled.into_iter().filter(|a| a.updated_at <= cutoff) {
        if action.is_compound() {
            let done = store.update_action(action.id, |a| {
                a.transition(ActionStatus::Failed, "interrupted before its children were planned")
            })?;
            warn!(action_id = %action.id, kind = %action.kind, "unplanned compound action failed");
            settle::post_checks(engine, &done);
            engine.propagate(done)?;
        } else {
            let ready = store.update_action(action.id, |a| a.transition(ActionStatus::Ready, ""))?;
            info!(action_id = %action.id, kind = %action.kind, "unqueued action resumed");
            engine.inner.queue.push(ready.id, ready.priority);
        }
        resumed += 1;
    }
    Ok(resumed)
}
