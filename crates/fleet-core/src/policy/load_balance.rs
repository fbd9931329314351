use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

use super::PreVerdict;
use crate::action::Action;
use crate::error::{FleetError, Result};
use crate::types::ActionKind;

/// Registers every node built for the cluster as a member of a load-balancer
/// pool. Membership is provisioned as one more workflow step, so it unwinds
/// with the rest of the node on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalanceSpec {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub pool: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_driver() -> String {
    "sim".to_string()
}

fn default_port() -> u16 {
    80
}

impl LoadBalanceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.pool.trim().is_empty() {
            return Err(FleetError::Validation(
                "load_balance policy needs a pool".into(),
            ));
        }
        Ok(())
    }

    pub fn pre_check(&self, action: &Action) -> PreVerdict {
        if !matches!(
            action.kind,
            ActionKind::NodeCreate | ActionKind::NodeRecover | ActionKind::NodeUpdate
        ) {
            return PreVerdict::proceed();
        }
        let mut overrides = Map::new();
        overrides.insert(
            "lb_member".into(),
            json!({ "driver": self.driver, "pool": self.pool, "port": self.port }),
        );
        PreVerdict::Proceed(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cause;

    fn spec() -> LoadBalanceSpec {
        serde_yaml::from_str("pool: web-pool\n").unwrap()
    }

    #[test]
    fn defaults_fill_driver_and_port() {
        let s = spec();
        assert_eq!(s.driver, "sim");
        assert_eq!(s.port, 80);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn empty_pool_is_invalid() {
        let mut s = spec();
        s.pool = " ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn node_builds_get_membership() {
        let a = Action::new(ActionKind::NodeCreate, "n1", Map::new(), Cause::Derived, 60);
        let PreVerdict::Proceed(o) = spec().pre_check(&a) else {
            panic!("load balancing never aborts");
        };
        assert_eq!(o["lb_member"]["pool"], "web-pool");

        let delete = Action::new(ActionKind::NodeDelete, "n1", Map::new(), Cause::Derived, 60);
        assert_eq!(spec().pre_check(&delete), PreVerdict::proceed());
    }
}
