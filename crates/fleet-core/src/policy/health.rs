use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CheckContext, FollowUp, PostVerdict};
use crate::action::{Action, ActionStatus};
use crate::types::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recovery {
    /// Tear the node's resources down and provision them again.
    Recreate,
    /// Record the failure and do nothing else.
    Nop,
}

/// Turns failed health checks into recover actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSpec {
    #[serde(default = "default_recovery")]
    pub recovery: Recovery,
}

fn default_recovery() -> Recovery {
    Recovery::Recreate
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            recovery: default_recovery(),
        }
    }
}

impl HealthSpec {
    pub fn post_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PostVerdict {
        if self.recovery == Recovery::Nop || action.status != ActionStatus::Succeeded {
            return PostVerdict::Ok;
        }
        match action.kind {
            // Checks run as part of a CLUSTER_CHECK are judged once, at the parent.
            ActionKind::NodeCheck if action.parent.is_none() => {
                if action.outputs.get("healthy").and_then(Value::as_bool) == Some(false) {
                    PostVerdict::Remediate(FollowUp {
                        kind: ActionKind::NodeRecover,
                        target: action.target.clone(),
                        inputs: Map::new(),
                    })
                } else {
                    PostVerdict::Ok
                }
            }
            ActionKind::ClusterCheck => {
                let unhealthy = action
                    .outputs
                    .get("unhealthy")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if unhealthy.is_empty() {
                    return PostVerdict::Ok;
                }
                let mut inputs = Map::new();
                inputs.insert("nodes".into(), Value::Array(unhealthy));
                PostVerdict::Remediate(FollowUp {
                    kind: ActionKind::ClusterRecover,
                    target: ctx.cluster.id.clone(),
                    inputs,
                })
            }
            _ => PostVerdict::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, Profile};
    use crate::types::Cause;
    use serde_json::json;

    fn finished(kind: ActionKind, target: &str, outputs: Value) -> Action {
        let mut a = Action::new(kind, target, Map::new(), Cause::User, 60);
        a.outputs = outputs.as_object().cloned().unwrap_or_default();
        a.transition(ActionStatus::Ready, "").unwrap();
        a.transition(ActionStatus::Running, "").unwrap();
        a.transition(ActionStatus::Succeeded, "").unwrap();
        a
    }

    fn ctx(cluster: &Cluster) -> CheckContext<'_> {
        CheckContext {
            cluster,
            members: &[],
        }
    }

    #[test]
    fn unhealthy_node_check_requests_recover() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 1);
        let check = finished(ActionKind::NodeCheck, "n1", json!({ "healthy": false }));
        let verdict = HealthSpec::default().post_check(&ctx(&cluster), &check);
        assert_eq!(
            verdict,
            PostVerdict::Remediate(FollowUp {
                kind: ActionKind::NodeRecover,
                target: "n1".into(),
                inputs: Map::new(),
            })
        );
    }

    #[test]
    fn child_checks_are_left_to_the_parent() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 1);
        let mut check = finished(ActionKind::NodeCheck, "n1", json!({ "healthy": false }));
        check.parent = Some(uuid::Uuid::new_v4());
        assert_eq!(
            HealthSpec::default().post_check(&ctx(&cluster), &check),
            PostVerdict::Ok
        );
    }

    #[test]
    fn cluster_check_recovers_listed_nodes() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 3);
        let check = finished(
            ActionKind::ClusterCheck,
            &cluster.id,
            json!({ "unhealthy": ["n2", "n3"] }),
        );
        let PostVerdict::Remediate(f) = HealthSpec::default().post_check(&ctx(&cluster), &check)
        else {
            panic!("expected remediation");
        };
        assert_eq!(f.kind, ActionKind::ClusterRecover);
        assert_eq!(f.target, cluster.id);
        assert_eq!(f.inputs["nodes"], json!(["n2", "n3"]));
    }

    #[test]
    fn nop_recovery_never_remediates() {
        let cluster = Cluster::new("web", Profile::default(), 0, None, 1);
        let check = finished(ActionKind::NodeCheck, "n1", json!({ "healthy": false }));
        let spec = HealthSpec {
            recovery: Recovery::Nop,
        };
        assert_eq!(spec.post_check(&ctx(&cluster), &check), PostVerdict::Ok);
    }
}
