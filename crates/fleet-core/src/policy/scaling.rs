use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CheckContext, PreVerdict};
use crate::action::Action;
use crate::cluster::AdjustmentType;
use crate::error::{FleetError, Result};
use crate::types::ActionKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    #[serde(rename = "type", default = "default_adjustment_type")]
    pub adjustment_type: AdjustmentType,
    #[serde(default = "default_number")]
    pub number: f64,
    /// Lower bound on the change for percentage adjustments.
    #[serde(default = "default_min_step")]
    pub min_step: u32,
}

fn default_adjustment_type() -> AdjustmentType {
    AdjustmentType::ChangeInCapacity
}

fn default_number() -> f64 {
    1.0
}

fn default_min_step() -> u32 {
    1
}

impl Default for Adjustment {
    fn default() -> Self {
        Self {
            adjustment_type: default_adjustment_type(),
            number: default_number(),
            min_step: default_min_step(),
        }
    }
}

/// Decides how many nodes a scale-out or scale-in moves, and refuses moves
/// that leave the policy's size window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingSpec {
    #[serde(default)]
    pub min_size: u32,
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub adjustment: Adjustment,
}

impl ScalingSpec {
    pub fn validate(&self) -> Result<()> {
        if !self.adjustment.number.is_finite() {
            return Err(FleetError::Validation(
                "scaling adjustment number must be finite".into(),
            ));
        }
        if let Some(max) = self.max_size {
            if max < self.min_size {
                return Err(FleetError::Validation(format!(
                    "scaling policy max_size ({max}) is below min_size ({})",
                    self.min_size
                )));
            }
        }
        Ok(())
    }

    /// Node count implied by the adjustment, as a positive magnitude.
    pub fn computed_count(&self, current: u32, kind: ActionKind) -> i64 {
        let current = i64::from(current);
        let number = self.adjustment.number;
        match self.adjustment.adjustment_type {
            AdjustmentType::ExactCapacity => {
                let target = number as i64;
                if kind == ActionKind::ClusterScaleIn {
                    current - target
                } else {
                    target - current
                }
            }
            AdjustmentType::ChangeInCapacity => (number as i64).abs(),
            AdjustmentType::ChangeInPercentage => {
                let count = (number.abs() * current as f64 / 100.0) as i64;
                count.max(i64::from(self.adjustment.min_step))
            }
        }
    }

    pub fn pre_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PreVerdict {
        if !matches!(
            action.kind,
            ActionKind::ClusterScaleOut | ActionKind::ClusterScaleIn
        ) {
            return PreVerdict::proceed();
        }

        let current = ctx.cluster.desired_capacity;
        // An explicit count from the caller wins; the policy only bounds it.
        let count = match action.input_u64("count") {
            Some(n) => i64::try_from(n).unwrap_or(i64::MAX),
            None => self.computed_count(current, action.kind),
        };
        if count <= 0 {
            return PreVerdict::Abort(format!(
                "scaling adjustment yields no change for {} at size {current}",
                action.kind
            ));
        }

        let current = i64::from(current);
        if action.kind == ActionKind::ClusterScaleOut {
            if let Some(max) = self.max_size {
                if current + count > i64::from(max) {
                    return PreVerdict::Abort("Attempted scaling exceeds maximum size".into());
                }
            }
        } else if current - count < i64::from(self.min_size) {
            return PreVerdict::Abort("Attempted scaling exceeds minimum size".into());
        }

        let mut overrides = Map::new();
        overrides.insert("count".into(), Value::from(count));
        PreVerdict::Proceed(overrides)
    }
}
