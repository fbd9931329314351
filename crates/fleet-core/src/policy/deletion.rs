use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CheckContext, PreVerdict};
use crate::action::Action;
use crate::cluster::{Node, NodeStatus, ResizeRequest};
use crate::types::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Criteria {
    OldestFirst,
    YoungestFirst,
    Random,
}

/// Chooses which members leave a shrinking cluster and how they leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionSpec {
    #[serde(default = "default_criteria")]
    pub criteria: Criteria,
    /// When false, victims only leave the cluster and keep their resources.
    #[serde(default = "default_destroy")]
    pub destroy_after_deletion: bool,
    /// Seconds to wait before a victim is torn down.
    #[serde(default)]
    pub grace_period: u64,
}

fn default_criteria() -> Criteria {
    Criteria::Random
}

fn default_destroy() -> bool {
    true
}

impl Default for DeletionSpec {
    fn default() -> Self {
        Self {
            criteria: default_criteria(),
            destroy_after_deletion: default_destroy(),
            grace_period: 0,
        }
    }
}

/// Pick `count` victims. Members in error go first, the rest follow the
/// criteria.
pub fn select_candidates(members: &[Node], count: usize, criteria: Criteria) -> Vec<String> {
    let (mut broken, mut healthy): (Vec<&Node>, Vec<&Node>) = members
        .iter()
        .filter(|n| n.is_removable())
        .partition(|n| n.status == NodeStatus::Error);
    order_by(&mut broken, criteria);
    order_by(&mut healthy, criteria);
    broken
        .into_iter()
        .chain(healthy)
        .take(count)
        .map(|n| n.id.clone())
        .collect()
}

fn order_by(nodes: &mut [&Node], criteria: Criteria) {
    match criteria {
        Criteria::OldestFirst => {
            nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.index.cmp(&b.index)))
        }
        Criteria::YoungestFirst => {
            nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.index.cmp(&a.index)))
        }
        Criteria::Random => nodes.shuffle(&mut rand::thread_rng()),
    }
}

impl DeletionSpec {
    fn shrink_count(&self, ctx: &CheckContext<'_>, action: &Action) -> Option<usize> {
        match action.kind {
            ActionKind::ClusterScaleIn => Some(action.input_u64("count").unwrap_or(1) as usize),
            ActionKind::ClusterResize => {
                let target = ResizeRequest::from_inputs(&action.inputs)
                    .and_then(|req| req.target(ctx.cluster))
                    .ok()?;
                let current = ctx.cluster.desired_capacity;
                (target < current).then(|| (current - target) as usize)
            }
            _ => None,
        }
    }

    pub fn pre_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PreVerdict {
        if !matches!(
            action.kind,
            ActionKind::ClusterScaleIn | ActionKind::ClusterDelNodes | ActionKind::ClusterResize
        ) {
            return PreVerdict::proceed();
        }

        let mut overrides = Map::new();
        overrides.insert(
            "destroy_after_deletion".into(),
            Value::from(self.destroy_after_deletion),
        );
        overrides.insert("grace_period".into(), Value::from(self.grace_period));

        if let Some(count) = self.shrink_count(ctx, action) {
            let candidates = select_candidates(ctx.members, count, self.criteria);
            overrides.insert(
                "candidates".into(),
                Value::Array(candidates.into_iter().map(Value::from).collect()),
            );
        }
        PreVerdict::Proceed(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, Profile};
    use crate::types::Cause;
    use chrono::{Duration, Utc};

    fn members() -> Vec<Node> {
        (1..=4)
            .map(|i| {
                let mut n = Node::new(format!("n{i}"), Some("c1".into()), i);
                n.status = NodeStatus::Active;
                n.created_at = Utc::now() - Duration::minutes(10 - i64::from(i));
                n
            })
            .collect()
    }

    fn names(members: &[Node], ids: &[String]) -> Vec<String> {
        ids.iter()
            .map(|id| members.iter().find(|n| &n.id == id).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn oldest_and_youngest_first() {
        let m = members();
        let oldest = select_candidates(&m, 2, Criteria::OldestFirst);
        assert_eq!(names(&m, &oldest), ["n1", "n2"]);
        let youngest = select_candidates(&m, 2, Criteria::YoungestFirst);
        assert_eq!(names(&m, &youngest), ["n4", "n3"]);
    }

    #[test]
    fn error_nodes_are_chosen_first() {
        let mut m = members();
        m[3].status = NodeStatus::Error;
        let picked = select_candidates(&m, 2, Criteria::OldestFirst);
        assert_eq!(names(&m, &picked), ["n4", "n1"]);
    }

    #[test]
    fn nodes_already_being_removed_are_skipped() {
        let mut m = members();
        m[0].status = NodeStatus::Deleting;
        let picked = select_candidates(&m, 2, Criteria::OldestFirst);
        assert_eq!(names(&m, &picked), ["n2", "n3"]);
    }

    #[test]
    fn random_picks_distinct_members() {
        let m = members();
        let mut picked = select_candidates(&m, 3, Criteria::Random);
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn scale_in_gets_candidates_and_flags() {
        let m = members();
        let cluster = Cluster::new("web", Profile::default(), 0, None, 4);
        let mut inputs = Map::new();
        inputs.insert("count".into(), Value::from(1));
        let action = Action::new(
            ActionKind::ClusterScaleIn,
            cluster.id.clone(),
            inputs,
            Cause::User,
            60,
        );
        let spec = DeletionSpec {
            criteria: Criteria::OldestFirst,
            destroy_after_deletion: false,
            grace_period: 5,
        };
        let ctx = CheckContext {
            cluster: &cluster,
            members: &m,
        };
        let PreVerdict::Proceed(o) = spec.pre_check(&ctx, &action) else {
            panic!("deletion policy never aborts");
        };
        assert_eq!(o["candidates"], serde_json::json!([m[0].id]));
        assert_eq!(o["destroy_after_deletion"], Value::Bool(false));
        assert_eq!(o["grace_period"], Value::from(5));
    }

    #[test]
    fn resize_shrink_computes_victims() {
        let m = members();
        let cluster = Cluster::new("web", Profile::default(), 0, None, 4);
        let inputs = serde_json::json!({ "adjustment_type": "EXACT_CAPACITY", "number": 1 });
        let action = Action::new(
            ActionKind::ClusterResize,
            cluster.id.clone(),
            inputs.as_object().cloned().unwrap_or_default(),
            Cause::User,
            60,
        );
        let ctx = CheckContext {
            cluster: &cluster,
            members: &m,
        };
        let PreVerdict::Proceed(o) = DeletionSpec::default().pre_check(&ctx, &action) else {
            panic!("deletion policy never aborts");
        };
        assert_eq!(o["candidates"].as_array().unwrap().len(), 3);
    }
}
