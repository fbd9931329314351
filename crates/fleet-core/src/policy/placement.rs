use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{CheckContext, PreVerdict};
use crate::action::Action;
use crate::cluster::{NodeStatus, ResizeRequest};
use crate::error::{FleetError, Result};
use crate::types::ActionKind;

/// Spreads new nodes across availability zones, least loaded first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementSpec {
    pub zones: Vec<String>,
}

impl PlacementSpec {
    pub fn validate(&self) -> Result<()> {
        if self.zones.is_empty() {
            return Err(FleetError::Validation(
                "placement policy needs at least one zone".into(),
            ));
        }
        Ok(())
    }

    /// Zones for `count` new nodes given the zones existing members sit in.
    /// Ties go to the zone listed first.
    pub fn assign<'a>(&self, existing: impl IntoIterator<Item = &'a str>, count: usize) -> Vec<String> {
        let mut load: HashMap<&str, usize> = self.zones.iter().map(|z| (z.as_str(), 0)).collect();
        for zone in existing {
            if let Some(n) = load.get_mut(zone) {
                *n += 1;
            }
        }
        let mut placed = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(zone) = self
                .zones
                .iter()
                .min_by_key(|z| load.get(z.as_str()).copied().unwrap_or(0))
            else {
                break;
            };
            if let Some(n) = load.get_mut(zone.as_str()) {
                *n += 1;
            }
            placed.push(zone.clone());
        }
        placed
    }

    fn new_nodes(&self, ctx: &CheckContext<'_>, action: &Action) -> usize {
        match action.kind {
            ActionKind::ClusterCreate => {
                let existing = ctx
                    .members
                    .iter()
                    .filter(|n| n.status != NodeStatus::Deleted)
                    .count();
                (ctx.cluster.desired_capacity as usize).saturating_sub(existing)
            }
            ActionKind::ClusterScaleOut => action.input_u64("count").unwrap_or(1) as usize,
            ActionKind::ClusterResize => ResizeRequest::from_inputs(&action.inputs)
                .and_then(|req| req.target(ctx.cluster))
                .map(|target| target.saturating_sub(ctx.cluster.desired_capacity) as usize)
                .unwrap_or(0),
            ActionKind::ClusterReplaceNodes => action
                .inputs
                .get("nodes")
                .and_then(Value::as_array)
                .map_or(0, Vec::len),
            _ => 0,
        }
    }

    pub fn pre_check(&self, ctx: &CheckContext<'_>, action: &Action) -> PreVerdict {
        let count = self.new_nodes(ctx, action);
        if count == 0 {
            return PreVerdict::proceed();
        }
        let existing = ctx
            .members
            .iter()
            .filter(|n| n.status != NodeStatus::Deleted)
            .filter_map(|n| n.zone.as_deref());
        let placed = self.assign(existing, count);
        let mut overrides = Map::new();
        overrides.insert(
            "placement".into(),
            Value::Array(placed.into_iter().map(Value::from).collect()),
        );
        PreVerdict::Proceed(overrides)
    }
}
