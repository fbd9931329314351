//! Policies bound to clusters and the pipeline that runs them.
//!
//! The set of policy kinds is closed: each variant of [`PolicySpec`] carries
//! its own configuration and implements a pre-check (proceed with input
//! overrides, or abort) and a post-check (ok, or remediate with a follow-up
//! action). A [`Pipeline`] runs the enabled bindings of one cluster in
//! ascending priority order.

pub mod deletion;
pub mod health;
pub mod load_balance;
pub mod placement;
pub mod scaling;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::cluster::{Cluster, Node};
use crate::error::{FleetError, Result};
use crate::store::Store;
use crate::types::ActionKind;

pub use deletion::{Criteria, DeletionSpec};
pub use health::{HealthSpec, Recovery};
pub use load_balance::LoadBalanceSpec;
pub use placement::PlacementSpec;
pub use scaling::{Adjustment, ScalingSpec};

// ---------------------------------------------------------------------------
// PolicyKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Scaling,
    Health,
    LoadBalance,
    Placement,
    Deletion,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Scaling => "scaling",
            PolicyKind::Health => "health",
            PolicyKind::LoadBalance => "load_balance",
            PolicyKind::Placement => "placement",
            PolicyKind::Deletion => "deletion",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PreVerdict {
    /// Continue, merging these keys into the action inputs.
    Proceed(Map<String, Value>),
    Abort(String),
}

impl PreVerdict {
    pub fn proceed() -> Self {
        PreVerdict::Proceed(Map::new())
    }
}

/// A new top-level action a post-check asks the engine to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub kind: ActionKind,
    pub target: String,
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostVerdict {
    Ok,
    Remediate(FollowUp),
}

/// What a check may look at besides the action itself.
pub struct CheckContext<'a> {
    pub cluster: &'a Cluster,
    pub members: &'a [Node],
}

// ---------------------------------------------------------------------------
// PolicySpec / Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySpec {
    Scaling(ScalingSpec),
    Health(HealthSpec),
    LoadBalance(LoadBalanceSpec),
    Placement(PlacementSpec),
    Deletion(DeletionSpec),
}

impl PolicySpec {
    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicySpec::Scaling(_) => PolicyKind::Scaling,
            PolicySpec::Health(_) => PolicyKind::Health,
            PolicySpec::LoadBalance(_) => PolicyKind::LoadBalance,
            PolicySpec::Placement(_) => PolicyKind::Placement,
            PolicySpec::Deletion(_) => PolicyKind::Deletion,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PolicySpec::Scaling(s) => s.validate(),
            PolicySpec::Placement(p) => p.validate(),
            PolicySpec::LoadBalance(lb) => lb.validate(),
            PolicySpec::Health(_) | PolicySpec::Deletion(_) => Ok(()),
        }
    }

    pub fn pre_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PreVerdict {
        match self {
            PolicySpec::Scaling(s) => s.pre_check(ctx, action),
            PolicySpec::Deletion(d) => d.pre_check(ctx, action),
            PolicySpec::Placement(p) => p.pre_check(ctx, action),
            PolicySpec::LoadBalance(lb) => lb.pre_check(action),
            PolicySpec::Health(_) => PreVerdict::proceed(),
        }
    }

    pub fn post_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PostVerdict {
        match self {
            PolicySpec::Health(h) => h.post_check(ctx, action),
            _ => PostVerdict::Ok,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub spec: PolicySpec,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(name: impl Into<String>, spec: PolicySpec) -> Result<Self> {
        let name = name.into();
        crate::paths::validate_name(&name)?;
        spec.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name,
            spec,
            created_at: Utc::now(),
        })
    }

    pub fn kind(&self) -> PolicyKind {
        self.spec.kind()
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub cluster_id: String,
    pub policy_id: String,
    pub priority: u32,
    pub enabled: bool,
    pub bound_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(cluster_id: impl Into<String>, policy_id: impl Into<String>, priority: u32) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            policy_id: policy_id.into(),
            priority,
            enabled: true,
            bound_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.cluster_id, &self.policy_id)
    }

    pub fn key_for(cluster_id: &str, policy_id: &str) -> String {
        format!("{cluster_id}:{policy_id}")
    }
}

/// Priority handed to a binding when the caller does not choose one.
pub fn next_priority(existing: &[Binding]) -> u32 {
    existing
        .iter()
        .map(|b| b.priority)
        .max()
        .map_or(50, |p| p.saturating_add(10))
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Enabled policies of one cluster, lowest priority first.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    entries: Vec<(Binding, Policy)>,
}

impl Pipeline {
    pub fn load(store: &Store, cluster_id: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for binding in store.bindings(cluster_id)? {
            if !binding.enabled {
                continue;
            }
            match store.policy(&binding.policy_id) {
                Ok(policy) => entries.push((binding, policy)),
                Err(FleetError::PolicyNotFound(id)) => {
                    warn!(cluster_id, policy_id = %id, "binding points at a missing policy");
                }
                Err(e) => return Err(e),
            }
        }
        entries.sort_by_key(|(b, _)| b.priority);
        Ok(Self { entries })
    }

    pub fn from_entries(mut entries: Vec<(Binding, Policy)>) -> Self {
        entries.retain(|(b, _)| b.enabled);
        entries.sort_by_key(|(b, _)| b.priority);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every pre-check in order, merging overrides into `action.inputs`
    /// as it goes. The first abort stops the pipeline.
    pub fn pre_check(&self, ctx: &CheckContext<'_>, action: &mut Action) -> Result<()> {
        for (binding, policy) in &self.entries {
            match policy.spec.pre_check(ctx, action) {
                PreVerdict::Proceed(overrides) => action.merge_inputs(overrides),
                PreVerdict::Abort(reason) => {
                    info!(
                        action_id = %action.id,
                        policy = %policy.name,
                        priority = binding.priority,
                        %reason,
                        "policy aborted action"
                    );
                    return Err(FleetError::PolicyAbort {
                        policy: policy.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run every post-check in order and collect the follow-ups they ask for.
    pub fn post_check(&self, ctx: &CheckContext<'_>, action: &Action) -> Vec<FollowUp> {
        self.entries
            .iter()
            .filter_map(|(_, policy)| match policy.spec.post_check(ctx, action) {
                PostVerdict::Ok => None,
                PostVerdict::Remediate(follow_up) => {
                    info!(
                        action_id = %action.id,
                        policy = %policy.name,
                        kind = %follow_up.kind,
                        target = %follow_up.target,
                        "policy requested remediation"
                    );
                    Some(follow_up)
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{AdjustmentType, Profile};
    use crate::types::Cause;
    use serde_json::json;

    fn scaling(max: u32) -> PolicySpec {
        PolicySpec::Scaling(ScalingSpec {
            min_size: 0,
            max_size: Some(max),
            adjustment: Adjustment {
                adjustment_type: AdjustmentType::ChangeInCapacity,
                number: 1.0,
                min_step: 1,
            },
        })
    }

    fn scale_out(cluster: &Cluster, count: u64) -> Action {
        let inputs = json!({ "count": count });
        Action::new(
            ActionKind::ClusterScaleOut,
            cluster.id.clone(),
            inputs.as_object().cloned().unwrap_or_default(),
            Cause::User,
            60,
        )
    }

    #[test]
    fn spec_yaml_is_tagged_by_type() {
        let yaml = "type: deletion\ncriteria: OLDEST_FIRST\ndestroy_after_deletion: false\n";
        let spec: PolicySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind(), PolicyKind::Deletion);
        let PolicySpec::Deletion(d) = spec else {
            panic!("expected deletion");
        };
        assert_eq!(d.criteria, Criteria::OldestFirst);
        assert!(!d.destroy_after_deletion);
    }

    #[test]
    fn invalid_policy_name_rejected() {
        assert!(Policy::new("Bad Name", scaling(3)).is_err());
    }

    #[test]
    fn next_priority_steps_past_highest() {
        assert_eq!(next_priority(&[]), 50);
        let b = vec![Binding::new("c", "p1", 20), Binding::new("c", "p2", 70)];
        assert_eq!(next_priority(&b), 80);
    }

    #[test]
    fn pipeline_runs_in_priority_order_and_merges() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 2);
        let place = Policy::new(
            "spread",
            PolicySpec::Placement(PlacementSpec {
                zones: vec!["az1".into(), "az2".into()],
            }),
        )
        .unwrap();
        let scale = Policy::new("bounded", scaling(10)).unwrap();
        // placement sits after scaling, so it sees the count scaling left in place
        let pipeline = Pipeline::from_entries(vec![
            (Binding::new(&cluster.id, &place.id, 20), place),
            (Binding::new(&cluster.id, &scale.id, 10), scale),
        ]);
        let mut action = scale_out(&cluster, 3);
        let ctx = CheckContext {
            cluster: &cluster,
            members: &[],
        };
        pipeline.pre_check(&ctx, &mut action).unwrap();
        assert_eq!(action.input_u64("count"), Some(3));
        assert_eq!(
            action.inputs["placement"],
            json!(["az1", "az2", "az1"])
        );
    }

    #[test]
    fn first_abort_short_circuits() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 2);
        let strict = Policy::new("strict", scaling(3)).unwrap();
        let place = Policy::new(
            "spread",
            PolicySpec::Placement(PlacementSpec {
                zones: vec!["az1".into()],
            }),
        )
        .unwrap();
        let pipeline = Pipeline::from_entries(vec![
            (Binding::new(&cluster.id, &strict.id, 10), strict),
            (Binding::new(&cluster.id, &place.id, 20), place),
        ]);
        let mut action = scale_out(&cluster, 3);
        let ctx = CheckContext {
            cluster: &cluster,
            members: &[],
        };
        let err = pipeline.pre_check(&ctx, &mut action).unwrap_err();
        match err {
            FleetError::PolicyAbort { policy, reason } => {
                assert_eq!(policy, "strict");
                assert!(reason.contains("maximum size"), "reason: {reason}");
            }
            other => panic!("expected PolicyAbort, got {other:?}"),
        }
        assert!(!action.inputs.contains_key("placement"));
    }

    #[test]
    fn disabled_bindings_are_skipped() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 2);
        let strict = Policy::new("strict", scaling(3)).unwrap();
        let mut binding = Binding::new(&cluster.id, &strict.id, 10);
        binding.enabled = false;
        let pipeline = Pipeline::from_entries(vec![(binding, strict)]);
        assert!(pipeline.is_empty());
        let mut action = scale_out(&cluster, 3);
        let ctx = CheckContext {
            cluster: &cluster,
            members: &[],
        };
        pipeline.pre_check(&ctx, &mut action).unwrap();
    }

    #[test]
    fn load_skips_dangling_bindings() {
        let store = Store::memory();
        let policy = Policy::new("strict", scaling(3)).unwrap();
        store.insert_policy(&policy).unwrap();
        store.insert_binding(&Binding::new("c1", &policy.id, 10)).unwrap();
        store.insert_binding(&Binding::new("c1", "gone", 20)).unwrap();
        let pipeline = Pipeline::load(&store, "c1").unwrap();
        assert_eq!(pipeline.entries.len(), 1);
    }
}
