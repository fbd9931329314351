use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FleetError;

// ---------------------------------------------------------------------------
// ResourceType
// ---------------------------------------------------------------------------

/// The kind of resource an action targets and a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cluster,
    Node,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Cluster => "cluster",
            ResourceType::Node => "node",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(ResourceType::Cluster),
            "node" => Ok(ResourceType::Node),
            _ => Err(FleetError::Validation(format!("unknown resource type: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// Fixed catalogue of operations the engine knows how to run.
///
/// Cluster operations other than the three policy operations are compound:
/// they expand into node-level children and finish through fan-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ClusterCreate,
    ClusterDelete,
    ClusterUpdate,
    ClusterScaleOut,
    ClusterScaleIn,
    ClusterResize,
    ClusterAddNodes,
    ClusterDelNodes,
    ClusterReplaceNodes,
    ClusterAttachPolicy,
    ClusterDetachPolicy,
    ClusterUpdatePolicy,
    ClusterCheck,
    ClusterRecover,
    NodeCreate,
    NodeDelete,
    NodeUpdate,
    NodeJoin,
    NodeLeave,
    NodeCheck,
    NodeRecover,
}

impl ActionKind {
    pub fn all() -> &'static [ActionKind] {
        &[
            ActionKind::ClusterCreate,
            ActionKind::ClusterDelete,
            ActionKind::ClusterUpdate,
            ActionKind::ClusterScaleOut,
            ActionKind::ClusterScaleIn,
            ActionKind::ClusterResize,
            ActionKind::ClusterAddNodes,
            ActionKind::ClusterDelNodes,
            ActionKind::ClusterReplaceNodes,
            ActionKind::ClusterAttachPolicy,
            ActionKind::ClusterDetachPolicy,
            ActionKind::ClusterUpdatePolicy,
            ActionKind::ClusterCheck,
            ActionKind::ClusterRecover,
            ActionKind::NodeCreate,
            ActionKind::NodeDelete,
            ActionKind::NodeUpdate,
            ActionKind::NodeJoin,
            ActionKind::NodeLeave,
            ActionKind::NodeCheck,
            ActionKind::NodeRecover,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ClusterCreate => "CLUSTER_CREATE",
            ActionKind::ClusterDelete => "CLUSTER_DELETE",
            ActionKind::ClusterUpdate => "CLUSTER_UPDATE",
            ActionKind::ClusterScaleOut => "CLUSTER_SCALE_OUT",
            ActionKind::ClusterScaleIn => "CLUSTER_SCALE_IN",
            ActionKind::ClusterResize => "CLUSTER_RESIZE",
            ActionKind::ClusterAddNodes => "CLUSTER_ADD_NODES",
            ActionKind::ClusterDelNodes => "CLUSTER_DEL_NODES",
            ActionKind::ClusterReplaceNodes => "CLUSTER_REPLACE_NODES",
            ActionKind::ClusterAttachPolicy => "CLUSTER_ATTACH_POLICY",
            ActionKind::ClusterDetachPolicy => "CLUSTER_DETACH_POLICY",
            ActionKind::ClusterUpdatePolicy => "CLUSTER_UPDATE_POLICY",
            ActionKind::ClusterCheck => "CLUSTER_CHECK",
            ActionKind::ClusterRecover => "CLUSTER_RECOVER",
            ActionKind::NodeCreate => "NODE_CREATE",
            ActionKind::NodeDelete => "NODE_DELETE",
            ActionKind::NodeUpdate => "NODE_UPDATE",
            ActionKind::NodeJoin => "NODE_JOIN",
            ActionKind::NodeLeave => "NODE_LEAVE",
            ActionKind::NodeCheck => "NODE_CHECK",
            ActionKind::NodeRecover => "NODE_RECOVER",
        }
    }

    pub fn target_type(self) -> ResourceType {
        if self.as_str().starts_with("NODE_") {
            ResourceType::Node
        } else {
            ResourceType::Cluster
        }
    }

    /// Compound kinds never run a handler themselves; their outcome is the
    /// aggregate of the children they expand into.
    pub fn is_compound(self) -> bool {
        self.target_type() == ResourceType::Cluster
            && !matches!(
                self,
                ActionKind::ClusterAttachPolicy
                    | ActionKind::ClusterDetachPolicy
                    | ActionKind::ClusterUpdatePolicy
            )
    }

    /// Kinds that can safely run again after their holder vanished.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            ActionKind::NodeDelete
                | ActionKind::NodeLeave
                | ActionKind::NodeJoin
                | ActionKind::NodeCheck
                | ActionKind::ClusterAttachPolicy
                | ActionKind::ClusterDetachPolicy
                | ActionKind::ClusterUpdatePolicy
        )
    }

    /// Compound kinds that add capacity to a cluster.
    pub fn grows_cluster(self) -> bool {
        matches!(
            self,
            ActionKind::ClusterCreate | ActionKind::ClusterScaleOut | ActionKind::ClusterAddNodes
        )
    }

    /// Compound kinds that remove capacity from a cluster.
    pub fn shrinks_cluster(self) -> bool {
        matches!(
            self,
            ActionKind::ClusterScaleIn | ActionKind::ClusterDelNodes | ActionKind::ClusterDelete
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        ActionKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| FleetError::Validation(format!("unknown action kind: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// Who asked for an action: an external caller or the engine itself
/// (children of compound actions and policy remediations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    User,
    Derived,
}

impl Cause {
    pub fn as_str(self) -> &'static str {
        match self {
            Cause::User => "user",
            Cause::Derived => "derived",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Cause {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Cause::User),
            "derived" => Ok(Cause::Derived),
            _ => Err(FleetError::Validation(format!("unknown cause: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_loose_spellings() {
        assert_eq!(
            "cluster-scale-out".parse::<ActionKind>().unwrap(),
            ActionKind::ClusterScaleOut
        );
        assert_eq!("NODE_CREATE".parse::<ActionKind>().unwrap(), ActionKind::NodeCreate);
        assert!("CLUSTER_EXPLODE".parse::<ActionKind>().is_err());
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ActionKind::ClusterReplaceNodes).unwrap();
        assert_eq!(json, "\"CLUSTER_REPLACE_NODES\"");
    }

    #[test]
    fn policy_operations_are_cluster_leaves() {
        for kind in [
            ActionKind::ClusterAttachPolicy,
            ActionKind::ClusterDetachPolicy,
            ActionKind::ClusterUpdatePolicy,
        ] {
            assert_eq!(kind.target_type(), ResourceType::Cluster);
            assert!(!kind.is_compound());
        }
        assert!(ActionKind::ClusterScaleOut.is_compound());
        assert!(!ActionKind::NodeCreate.is_compound());
    }

    #[test]
    fn node_create_is_not_replayable() {
        assert!(!ActionKind::NodeCreate.is_idempotent());
        assert!(!ActionKind::NodeRecover.is_idempotent());
        assert!(ActionKind::NodeDelete.is_idempotent());
    }
}
