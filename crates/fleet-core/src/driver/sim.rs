//! In-memory backend used by the CLI and the test suites.
//!
//! Resources live in a map keyed by id. Faults are injected per provisioning
//! step name so a test can make "the second step of every node" fail without
//! knowing resource ids in advance.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{DriverError, ProvisionRequest, ResourceDriver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Provisioned { id: String, step: String, node: String },
    Deprovisioned { id: String, step: String },
}

#[derive(Debug, Clone)]
struct SimResource {
    step: String,
    healthy: bool,
}

#[derive(Debug, Default)]
struct Faults {
    fatal: HashMap<String, u32>,
    transient: HashMap<String, u32>,
    delay: HashMap<String, Duration>,
    never_ready: HashSet<String>,
    teardown: HashSet<String>,
    teardown_delay: HashMap<String, Duration>,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<String, SimResource>,
    faults: Faults,
    events: Vec<SimEvent>,
}

#[derive(Debug)]
pub struct SimDriver {
    name: String,
    seq: AtomicU64,
    provision_calls: AtomicU64,
    deprovision_calls: AtomicU64,
    state: Mutex<State>,
}

/// Take one charge from a countdown fault, if any remain.
fn consume(counts: &mut HashMap<String, u32>, step: &str) -> bool {
    match counts.get_mut(step) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::named("sim")
    }
}

impl SimDriver {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: AtomicU64::new(0),
            provision_calls: AtomicU64::new(0),
            deprovision_calls: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// The next `times` provisions of `step` fail permanently.
    pub fn fail_step(&self, step: &str, times: u32) {
        self.with(|s| s.faults.fatal.insert(step.to_string(), times));
    }

    /// The next `times` provisions of `step` fail with a transient error.
    pub fn flaky_step(&self, step: &str, times: u32) {
        self.with(|s| s.faults.transient.insert(step.to_string(), times));
    }

    /// Provisioning `step` takes `delay` before it returns.
    pub fn slow_step(&self, step: &str, delay: Duration) {
        self.with(|s| s.faults.delay.insert(step.to_string(), delay));
    }

    /// Resources of `step` are created but never report ready.
    pub fn never_ready(&self, step: &str) {
        self.with(|s| s.faults.never_ready.insert(step.to_string()));
    }

    /// Deprovisioning resources of `step` always fails.
    pub fn fail_teardown(&self, step: &str) {
        self.with(|s| s.faults.teardown.insert(step.to_string()));
    }

    /// Deprovisioning resources of `step` takes `delay` before it acts.
    pub fn slow_teardown(&self, step: &str, delay: Duration) {
        self.with(|s| s.faults.teardown_delay.insert(step.to_string(), delay));
    }

    pub fn set_healthy(&self, resource_id: &str, healthy: bool) {
        self.with(|s| {
            if let Some(r) = s.resources.get_mut(resource_id) {
                r.healthy = healthy;
            }
        });
    }

    pub fn clear_faults(&self) {
        self.with(|s| s.faults = Faults::default());
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn provision_calls(&self) -> u64 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn deprovision_calls(&self) -> u64 {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    /// Ids of resources that currently exist, sorted.
    pub fn live_resources(&self) -> Vec<String> {
        self.with(|s| s.resources.keys().cloned().collect())
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.with(|s| s.events.clone())
    }
}

#[async_trait]
impl ResourceDriver for SimDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<String, DriverError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.with(|s| s.faults.delay.get(req.step).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with(|s| {
            if consume(&mut s.faults.transient, req.step) {
                return Err(DriverError::Transient(format!(
                    "{}: backend busy provisioning '{}'",
                    self.name, req.step
                )));
            }
            if consume(&mut s.faults.fatal, req.step) {
                return Err(DriverError::Fatal(format!(
                    "{}: backend rejected '{}' for {}",
                    self.name, req.step, req.node
                )));
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("{}-{seq:05}", req.step);
            let healthy = !s.faults.never_ready.contains(req.step);
            s.resources.insert(
                id.clone(),
                SimResource {
                    step: req.step.to_string(),
                    healthy,
                },
            );
            s.events.push(SimEvent::Provisioned {
                id: id.clone(),
                step: req.step.to_string(),
                node: req.node.to_string(),
            });
            debug!(driver = %self.name, resource_id = %id, "sim provisioned");
            Ok(id)
        })
    }

    async fn is_ready(&self, resource_id: &str, _timeout: Duration) -> Result<bool, DriverError> {
        self.with(|s| match s.resources.get(resource_id) {
            Some(r) => Ok(r.healthy),
            None => Err(DriverError::NotFound(resource_id.to_string())),
        })
    }

    async fn deprovision(&self, resource_id: &str) -> Result<(), DriverError> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.with(|s| {
            let step = &s.resources.get(resource_id)?.step;
            s.faults.teardown_delay.get(step).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            let Some(r) = s.resources.get(resource_id) else {
                return Ok(());
            };
            if s.faults.teardown.contains(&r.step) {
                return Err(DriverError::Fatal(format!(
                    "{}: cannot delete {resource_id}",
                    self.name
                )));
            }
            let step = r.step.clone();
            s.resources.remove(resource_id);
            s.events.push(SimEvent::Deprovisioned {
                id: resource_id.to_string(),
                step,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn req<'a>(step: &'a str, spec: &'a Map<String, serde_json::Value>) -> ProvisionRequest<'a> {
        ProvisionRequest {
            step,
            node: "n1",
            spec,
        }
    }

    #[tokio::test]
    async fn deprovision_of_absent_resource_succeeds() {
        let sim = SimDriver::default();
        sim.deprovision("never-existed").await.unwrap();
        let spec = Map::new();
        let id = sim.provision(&req("vm", &spec)).await.unwrap();
        sim.deprovision(&id).await.unwrap();
        sim.deprovision(&id).await.unwrap();
        assert!(sim.live_resources().is_empty());
    }

    #[tokio::test]
    async fn fatal_fault_is_consumed() {
        let sim = SimDriver::default();
        sim.fail_step("vm", 1);
        let spec = Map::new();
        assert!(matches!(
            sim.provision(&req("vm", &spec)).await,
            Err(DriverError::Fatal(_))
        ));
        assert!(sim.provision(&req("vm", &spec)).await.is_ok());
    }

    #[tokio::test]
    async fn health_can_be_flipped() {
        let sim = SimDriver::default();
        let spec = Map::new();
        let id = sim.provision(&req("vm", &spec)).await.unwrap();
        assert!(sim.is_ready(&id, Duration::ZERO).await.unwrap());
        sim.set_healthy(&id, false);
        assert!(!sim.is_ready(&id, Duration::ZERO).await.unwrap());
        assert!(matches!(
            sim.is_ready("gone", Duration::ZERO).await,
            Err(DriverError::NotFound(_))
        ));
    }
}
