//! Cluster and node records plus the size arithmetic shared by resize-style
//! intents and the scaling/deletion policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// One ordered provisioning step: which driver to call and what to pass it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionStep {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub spec: Map<String, Value>,
}

/// How a node of this cluster is built. Steps run in order and unwind in
/// reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub steps: Vec<ProvisionStep>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            steps: vec![ProvisionStep {
                name: "server".to_string(),
                driver: "sim".to_string(),
                spec: Map::new(),
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Init,
    Active,
    Warning,
    Error,
    Deleting,
    Deleted,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Init => "INIT",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Warning => "WARNING",
            ClusterStatus::Error => "ERROR",
            ClusterStatus::Deleting => "DELETING",
            ClusterStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub profile: Profile,
    pub min_size: u32,
    /// `None` means unbounded.
    #[serde(default)]
    pub max_size: Option<u32>,
    /// Capacity the cluster converges towards, including in-flight reservations.
    pub desired_capacity: u32,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_reason: String,
    /// Next index handed to a joining or created node.
    #[serde(default)]
    pub next_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        profile: Profile,
        min_size: u32,
        max_size: Option<u32>,
        desired_capacity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            profile,
            min_size,
            max_size,
            desired_capacity,
            status: ClusterStatus::Init,
            status_reason: String::new(),
            next_index: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ClusterStatus, reason: impl Into<String>) {
        self.status = status;
        self.status_reason = reason.into();
        self.updated_at = Utc::now();
    }

    /// Allocate the next member index.
    pub fn take_index(&mut self) -> u32 {
        let idx = self.next_index.max(1);
        self.next_index = idx + 1;
        idx
    }

    pub fn node_name(&self, index: u32) -> String {
        let short: String = self.id.chars().take(8).collect();
        format!("node-{short}-{index}")
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Init,
    Active,
    Error,
    /// Picked for removal by a cluster action that has not finished yet.
    Deleting,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Init => "INIT",
            NodeStatus::Active => "ACTIVE",
            NodeStatus::Error => "ERROR",
            NodeStatus::Deleting => "DELETING",
            NodeStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend resource created by one provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub step: String,
    pub driver: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub index: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub resources: Vec<ProvisionedResource>,
    /// Availability zone chosen by placement, if any.
    #[serde(default)]
    pub zone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(name: impl Into<String>, cluster_id: Option<String>, index: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cluster_id,
            index,
            status: NodeStatus::Init,
            status_reason: String::new(),
            resources: Vec::new(),
            zone: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: NodeStatus, reason: impl Into<String>) {
        self.status = status;
        self.status_reason = reason.into();
        self.updated_at = Utc::now();
    }

    /// Still a member nobody has claimed for removal.
    pub fn is_removable(&self) -> bool {
        !matches!(self.status, NodeStatus::Deleting | NodeStatus::Deleted)
    }
}

// ---------------------------------------------------------------------------
// Size arithmetic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentType {
    ExactCapacity,
    ChangeInCapacity,
    ChangeInPercentage,
}

impl std::str::FromStr for AdjustmentType {
    type Err = FleetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EXACT_CAPACITY" => Ok(AdjustmentType::ExactCapacity),
            "CHANGE_IN_CAPACITY" => Ok(AdjustmentType::ChangeInCapacity),
            "CHANGE_IN_PERCENTAGE" => Ok(AdjustmentType::ChangeInPercentage),
            _ => Err(FleetError::Validation(format!("unknown adjustment type: {s}"))),
        }
    }
}

/// Desired capacity after applying an adjustment to `current`.
///
/// Percentage changes round away from zero below one node and towards zero
/// above it; `min_step` forces at least that many nodes of change.
pub fn calculate_desired(
    current: u32,
    adj_type: AdjustmentType,
    number: f64,
    min_step: Option<u32>,
) -> i64 {
    let current = i64::from(current);
    match adj_type {
        AdjustmentType::ExactCapacity => number as i64,
        AdjustmentType::ChangeInCapacity => current + number as i64,
        AdjustmentType::ChangeInPercentage => {
            let delta = number * current as f64 / 100.0;
            let rounded = (if delta > 0.0 {
                if delta < 1.0 {
                    delta.ceil()
                } else {
                    delta.floor()
                }
            } else if delta.abs() < 1.0 {
                delta.floor()
            } else {
                delta.ceil()
            }) as i64;
            match min_step {
                Some(step) if i64::from(step) > rounded.abs() => {
                    let step = i64::from(step);
                    current + if rounded >= 0 { step } else { -step }
                }
                _ => current + rounded,
            }
        }
    }
}

/// Clamp `desired` into the requested or the cluster's bounds.
pub fn truncate_desired(
    cluster: &Cluster,
    desired: i64,
    min_size: Option<u32>,
    max_size: Option<u32>,
) -> u32 {
    let lower = i64::from(min_size.unwrap_or(cluster.min_size));
    let mut desired = desired.max(lower).max(0);
    if let Some(upper) = max_size.or(cluster.max_size) {
        desired = desired.min(i64::from(upper));
    }
    u32::try_from(desired).unwrap_or(u32::MAX)
}

/// Validate a target size against the requested or current bounds.
///
/// Bound consistency is always checked; the desired capacity itself is only
/// checked when `strict` is set.
pub fn check_size_params(
    cluster: &Cluster,
    desired: i64,
    min_size: Option<u32>,
    max_size: Option<u32>,
    strict: bool,
) -> Result<()> {
    let lower = min_size.unwrap_or(cluster.min_size);
    let upper = max_size.or(cluster.max_size);

    if let Some(upper) = upper {
        if lower > upper {
            return Err(FleetError::Validation(format!(
                "min_size ({lower}) is greater than max_size ({upper})"
            )));
        }
    }
    if desired < 0 {
        return Err(FleetError::Validation(format!(
            "the target capacity ({desired}) cannot be negative"
        )));
    }
    if strict {
        if desired < i64::from(lower) {
            return Err(FleetError::Validation(format!(
                "the target capacity ({desired}) is less than the min_size ({lower})"
            )));
        }
        if let Some(upper) = upper {
            if desired > i64::from(upper) {
                return Err(FleetError::Validation(format!(
                    "the target capacity ({desired}) is greater than the max_size ({upper})"
                )));
            }
        }
    }
    Ok(())
}

/// Parameters of a CLUSTER_RESIZE request, read from action inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeRequest {
    pub adjustment: Option<(AdjustmentType, f64)>,
    pub min_step: Option<u32>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub strict: bool,
}

impl ResizeRequest {
    pub fn from_inputs(inputs: &Map<String, Value>) -> Result<Self> {
        let adjustment = match inputs.get("adjustment_type").and_then(Value::as_str) {
            Some(t) => {
                let adj_type: AdjustmentType = t.parse()?;
                let number = inputs
                    .get("number")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        FleetError::Validation(
                            "resize requires 'number' with 'adjustment_type'".into(),
                        )
                    })?;
                Some((adj_type, number))
            }
            None => None,
        };
        let as_u32 = |key: &str| -> Result<Option<u32>> {
            match inputs.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(Some)
                    .ok_or_else(|| {
                        FleetError::Validation(format!("'{key}' must be a non-negative integer"))
                    }),
            }
        };
        Ok(Self {
            adjustment,
            min_step: as_u32("min_step")?,
            min_size: as_u32("min_size")?,
            max_size: as_u32("max_size")?,
            strict: inputs.get("strict").and_then(Value::as_bool).unwrap_or(true),
        })
    }

    /// Resolve the request into a target capacity for `cluster`.
    pub fn target(&self, cluster: &Cluster) -> Result<u32> {
        let mut desired = match self.adjustment {
            Some((adj_type, number)) => {
                calculate_desired(cluster.desired_capacity, adj_type, number, self.min_step)
            }
            None => i64::from(cluster.desired_capacity),
        };
        if !self.strict {
            desired = i64::from(truncate_desired(cluster, desired, self.min_size, self.max_size));
        }
        check_size_params(cluster, desired, self.min_size, self.max_size, self.strict)?;
        Ok(u32::try_from(desired).unwrap_or(u32::MAX))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster(min: u32, max: Option<u32>, desired: u32) -> Cluster {
        Cluster::new("web", Profile::default(), min, max, desired)
    }

    #[test]
    fn exact_and_change_in_capacity() {
        assert_eq!(calculate_desired(4, AdjustmentType::ExactCapacity, 7.0, None), 7);
        assert_eq!(calculate_desired(4, AdjustmentType::ChangeInCapacity, -3.0, None), 1);
    }

    #[test]
    fn percentage_rounds_small_changes_up_to_one_node() {
        assert_eq!(calculate_desired(10, AdjustmentType::ChangeInPercentage, 5.0, None), 11);
        assert_eq!(calculate_desired(10, AdjustmentType::ChangeInPercentage, -5.0, None), 9);
        assert_eq!(calculate_desired(10, AdjustmentType::ChangeInPercentage, 25.0, None), 12);
    }

    #[test]
    fn percentage_honours_min_step() {
        assert_eq!(calculate_desired(10, AdjustmentType::ChangeInPercentage, 10.0, Some(3)), 13);
        assert_eq!(calculate_desired(10, AdjustmentType::ChangeInPercentage, -10.0, Some(3)), 7);
    }

    #[test]
    fn truncate_prefers_request_bounds_then_cluster_bounds() {
        let c = cluster(2, Some(5), 3);
        assert_eq!(truncate_desired(&c, 9, None, None), 5);
        assert_eq!(truncate_desired(&c, 0, None, None), 2);
        assert_eq!(truncate_desired(&c, 9, None, Some(7)), 7);
        assert_eq!(truncate_desired(&c, 0, Some(1), None), 1);
        let unbounded = cluster(0, None, 3);
        assert_eq!(truncate_desired(&unbounded, 40, None, None), 40);
    }

    #[test]
    fn strict_check_rejects_out_of_range() {
        let c = cluster(1, Some(4), 2);
        assert!(check_size_params(&c, 5, None, None, true).is_err());
        assert!(check_size_params(&c, 0, None, None, true).is_err());
        assert!(check_size_params(&c, 5, None, None, false).is_ok());
        assert!(check_size_params(&c, 3, Some(5), Some(4), false).is_err());
    }

    #[test]
    fn resize_request_non_strict_truncates() {
        let c = cluster(1, Some(4), 2);
        let inputs = json!({
            "adjustment_type": "CHANGE_IN_CAPACITY",
            "number": 10,
            "strict": false
        });
        let req = ResizeRequest::from_inputs(inputs.as_object().unwrap()).unwrap();
        assert_eq!(req.target(&c).unwrap(), 4);
    }

    #[test]
    fn resize_request_requires_number() {
        let inputs = json!({ "adjustment_type": "EXACT_CAPACITY" });
        assert!(ResizeRequest::from_inputs(inputs.as_object().unwrap()).is_err());
    }

    #[test]
    fn node_names_use_cluster_prefix() {
        let mut c = cluster(0, None, 0);
        let idx = c.take_index();
        assert_eq!(idx, 1);
        assert_eq!(c.take_index(), 2);
        assert!(c.node_name(idx).starts_with("node-"));
        assert!(c.node_name(idx).ends_with("-1"));
    }
}
