//! Action records and their state machine.
//!
//! An `Action` is one unit of asynchronous work against a cluster or a node.
//! Compound actions (see [`ActionKind::is_compound`]) carry children and only
//! reach a terminal state through fan-in; leaf actions are dispatched by a
//! worker that holds the lock on their target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::types::{ActionKind, Cause, ResourceType};

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an action.
///
/// ```text
/// INIT → WAITING → READY → RUNNING → SUCCEEDED | FAILED | CANCELLED | TIMEOUT
/// ```
///
/// WAITING may resolve straight to a terminal state when its dependencies do
/// (fan-in, failed prerequisite, cancellation). RUNNING only goes back to
/// READY when the lease sweeper requeues an idempotent orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Init,
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Init => "INIT",
            ActionStatus::Waiting => "WAITING",
            ActionStatus::Ready => "READY",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Succeeded => "SUCCEEDED",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Cancelled => "CANCELLED",
            ActionStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded
                | ActionStatus::Failed
                | ActionStatus::Cancelled
                | ActionStatus::Timeout
        )
    }

    pub fn can_transition_to(self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Init, Waiting | Ready | Succeeded | Failed | Cancelled)
                | (Waiting, Ready | Succeeded | Failed | Cancelled)
                | (Ready, Running | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled | Timeout | Ready)
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INIT" => Ok(ActionStatus::Init),
            "WAITING" => Ok(ActionStatus::Waiting),
            "READY" => Ok(ActionStatus::Ready),
            "RUNNING" => Ok(ActionStatus::Running),
            "SUCCEEDED" => Ok(ActionStatus::Succeeded),
            "FAILED" => Ok(ActionStatus::Failed),
            "CANCELLED" => Ok(ActionStatus::Cancelled),
            "TIMEOUT" => Ok(ActionStatus::Timeout),
            _ => Err(FleetError::Validation(format!("unknown action status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub target_type: ResourceType,
    pub target: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Engine that last moved this action to RUNNING.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub parent: Option<Uuid>,
    pub cause: Cause,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub depended_by: Vec<Uuid>,
    /// Dependencies that have not reached a terminal state yet.
    #[serde(default)]
    pub pending: u32,
    /// Dependencies already counted against `pending`.
    #[serde(default)]
    pub settled: Vec<Uuid>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub timeout_secs: u64,
    /// Higher values are dispatched first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub lock_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every persisted change.
    #[serde(default)]
    pub version: u64,
}

impl Action {
    pub fn new(
        kind: ActionKind,
        target: impl Into<String>,
        inputs: Map<String, Value>,
        cause: Cause,
        timeout_secs: u64,
    ) -> Self {
        let target = target.into();
        let now = Utc::now();
        let short: String = target.chars().take(8).collect();
        Self {
            id: Uuid::new_v4(),
            name: format!("{}_{}", kind.as_str().to_ascii_lowercase(), short),
            target_type: kind.target_type(),
            target,
            kind,
            status: ActionStatus::Init,
            status_reason: String::new(),
            inputs,
            outputs: Map::new(),
            owner: None,
            parent: None,
            cause,
            depends_on: Vec::new(),
            depended_by: Vec::new(),
            pending: 0,
            settled: Vec::new(),
            cancel_requested: false,
            timeout_secs,
            priority: 0,
            lock_attempts: 0,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_compound(&self) -> bool {
        self.kind.is_compound()
    }

    /// Move to `next`, stamping start/end times. Rejects edges the state
    /// machine does not allow.
    pub fn transition(&mut self, next: ActionStatus, reason: impl Into<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
                reason: format!("action {} ({})", self.id, self.kind),
            });
        }
        let now = Utc::now();
        match next {
            ActionStatus::Running => self.started_at = Some(now),
            ActionStatus::Ready if self.status == ActionStatus::Running => {
                self.started_at = None;
                self.owner = None;
            }
            s if s.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.status_reason = reason.into();
        Ok(())
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    pub fn input_u64(&self, key: &str) -> Option<u64> {
        self.inputs.get(key).and_then(Value::as_u64)
    }

    /// Shallow merge: keys in `overrides` replace keys in `inputs`.
    pub fn merge_inputs(&mut self, overrides: Map<String, Value>) {
        for (k, v) in overrides {
            self.inputs.insert(k, v);
        }
    }
}

// ---------------------------------------------------------------------------
// ActionFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub target: Option<String>,
    pub cause: Option<Cause>,
    pub parent: Option<Uuid>,
    pub kind: Option<ActionKind>,
}

impl ActionFilter {
    pub fn matches(&self, action: &Action) -> bool {
        self.status.map_or(true, |s| action.status == s)
            && self.target.as_deref().map_or(true, |t| action.target == t)
            && self.cause.map_or(true, |c| action.cause == c)
            && self.parent.map_or(true, |p| action.parent == Some(p))
            && self.kind.map_or(true, |k| action.kind == k)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
