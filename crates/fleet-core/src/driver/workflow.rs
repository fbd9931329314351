//! Multi-step provisioning with compensating rollback.
//!
//! Steps run in order. After each provision the workflow polls readiness and
//! appends the resource to a [`Journal`]. When any step fails, is cancelled,
//! or never becomes ready, every journaled resource is deprovisioned in
//! reverse order before the error is reported.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{DriverError, DriverRegistry, ProvisionRequest, ResourceDriver};
use crate::backoff;
use crate::cluster::{ProvisionStep, ProvisionedResource};
use crate::config::EngineConfig;
use crate::error::{FleetError, Result};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub driver: String,
    pub spec: Map<String, Value>,
}

impl From<&ProvisionStep> for Step {
    fn from(p: &ProvisionStep) -> Self {
        Self {
            name: p.name.clone(),
            driver: p.driver.clone(),
            spec: p.spec.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Journal / CancelToken
// ---------------------------------------------------------------------------

/// Append-only record of resources a workflow has created. Shared with the
/// dispatcher so a timed-out workflow can still be unwound.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<ProvisionedResource>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<ProvisionedResource>) -> R) -> R {
        match self.0.lock() {
            Ok(mut entries) => f(&mut entries),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn record(&self, resource: ProvisionedResource) {
        self.with(|entries| entries.push(resource));
    }

    pub fn entries(&self) -> Vec<ProvisionedResource> {
        self.with(|entries| entries.clone())
    }

    pub fn len(&self) -> usize {
        self.with(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry once the caller has recorded the resources
    /// elsewhere and they must no longer be unwound.
    pub fn clear(&self) {
        self.with(Vec::clear);
    }

    fn pop(&self) -> Option<ProvisionedResource> {
        self.with(|entries| entries.pop())
    }

    fn replace(&self, resources: Vec<ProvisionedResource>) {
        self.with(|entries| *entries = resources);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self, at: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(FleetError::Cancelled(format!("cancelled {at}")))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient errors.
    pub limit: u32,
    pub base: Duration,
    pub max: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
}

impl RetryPolicy {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            limit: engine.driver_retry_limit,
            base: engine.driver_retry_base(),
            max: engine.driver_retry_base() * 32,
            readiness_timeout: engine.readiness_timeout(),
            readiness_poll: engine.readiness_poll(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Call `op` until it succeeds, retrying transient errors with backoff.
/// Exhausting the retry budget turns the last transient error fatal.
async fn retrying<T, F, Fut>(retry: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DriverError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(DriverError::Transient(msg)) if attempt < retry.limit => {
                let delay = backoff::jittered(retry.base, retry.max, attempt);
                attempt += 1;
                warn!(
                    call = what,
                    error = %msg,
                    retry_attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient driver error, retrying"
                );
                sleep(delay).await;
            }
            Err(DriverError::Transient(msg)) => {
                return Err(FleetError::DriverFatal(format!(
                    "{what}: gave up after {} attempt(s): {msg}",
                    attempt + 1
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct Workflow<'a> {
    registry: &'a DriverRegistry,
    retry: &'a RetryPolicy,
    journal: Journal,
    cancel: CancelToken,
}

impl<'a> Workflow<'a> {
    pub fn new(
        registry: &'a DriverRegistry,
        retry: &'a RetryPolicy,
        journal: Journal,
        cancel: CancelToken,
    ) -> Self {
        Self {
            registry,
            retry,
            journal,
            cancel,
        }
    }

    /// Provision every step for `node`. On success the journal holds one
    /// resource per step, in order. On failure the journal has been unwound
    /// and the first error is returned.
    pub async fn run(&self, node: &str, steps: &[Step]) -> Result<Vec<ProvisionedResource>> {
        for step in steps {
            if let Err(e) = self.run_step(node, step).await {
                warn!(node, step = %step.name, error = %e, "provisioning failed, rolling back");
                return Err(self.fail(e).await);
            }
        }
        Ok(self.journal.entries())
    }

    async fn run_step(&self, node: &str, step: &Step) -> Result<()> {
        self.cancel.checkpoint(&format!("before step '{}'", step.name))?;
        let driver = self.registry.get(&step.driver)?;
        let req = ProvisionRequest {
            step: &step.name,
            node,
            spec: &step.spec,
        };
        let what = format!("provision {}/{}", step.driver, step.name);
        let resource_id = retrying(self.retry, &what, || driver.provision(&req)).await?;
        debug!(node, step = %step.name, resource_id = %resource_id, "provisioned");
        self.journal.record(ProvisionedResource {
            step: step.name.clone(),
            driver: step.driver.clone(),
            resource_id: resource_id.clone(),
        });
        self.wait_ready(driver.as_ref(), &resource_id).await
    }

    async fn wait_ready(&self, driver: &dyn ResourceDriver, resource_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.retry.readiness_timeout;
        loop {
            let what = format!("is_ready {resource_id}");
            let poll = self.retry.readiness_poll;
            if retrying(self.retry, &what, || driver.is_ready(resource_id, poll)).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::DriverFatal(format!(
                    "resource {resource_id} not ready within {}s",
                    self.retry.readiness_timeout.as_secs()
                )));
            }
            sleep(poll).await;
        }
    }

    /// Unwind the journal and fold any rollback failure into `cause`.
    async fn fail(&self, cause: FleetError) -> FleetError {
        match unwind(self.registry, self.retry, &self.journal).await {
            Ok(()) => cause,
            Err(e) => FleetError::DriverFatal(format!("{cause}; {e}")),
        }
    }
}

/// Deprovision every journaled resource, newest first. Resources that could
/// not be removed stay in the journal and the call fails with
/// "rollback incomplete".
pub async fn unwind(registry: &DriverRegistry, retry: &RetryPolicy, journal: &Journal) -> Result<()> {
    let mut leftover = Vec::new();
    while let Some(resource) = journal.pop() {
        match deprovision(registry, retry, &resource).await {
            Ok(()) => info!(
                step = %resource.step,
                resource_id = %resource.resource_id,
                "rolled back"
            ),
            Err(e) => {
                warn!(
                    step = %resource.step,
                    resource_id = %resource.resource_id,
                    error = %e,
                    "rollback step failed"
                );
                leftover.push(resource);
            }
        }
    }
    if leftover.is_empty() {
        return Ok(());
    }
    leftover.reverse();
    let ids: Vec<String> = leftover.iter().map(|r| r.resource_id.clone()).collect();
    journal.replace(leftover);
    Err(FleetError::DriverFatal(format!(
        "rollback incomplete, still present: {}",
        ids.join(", ")
    )))
}

/// Remove one resource, retrying transient errors.
pub async fn deprovision(
    registry: &DriverRegistry,
    retry: &RetryPolicy,
    resource: &ProvisionedResource,
) -> Result<()> {
    let driver = registry.get(&resource.driver)?;
    let what = format!("deprovision {}/{}", resource.driver, resource.resource_id);
    retrying(retry, &what, || driver.deprovision(&resource.resource_id)).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
