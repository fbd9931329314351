//! Backend adapters.
//!
//! A [`ResourceDriver`] turns abstract provisioning calls into backend
//! operations. Drivers are registered by name in a [`DriverRegistry`]; a
//! cluster profile names the driver for each provisioning step.

pub mod sim;
pub mod workflow;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::FleetError;

pub use sim::SimDriver;
pub use workflow::{unwind, CancelToken, Journal, RetryPolicy, Step, Workflow};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The backend is temporarily unavailable; the call may be retried.
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("resource not found: {0}")]
    NotFound(String),
}

impl From<DriverError> for FleetError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Transient(msg) => FleetError::DriverTransient(msg),
            DriverError::Fatal(msg) => FleetError::DriverFatal(msg),
            DriverError::NotFound(id) => FleetError::DriverFatal(format!("resource not found: {id}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceDriver
// ---------------------------------------------------------------------------

/// What a driver is asked to build.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub step: &'a str,
    pub node: &'a str,
    pub spec: &'a Map<String, Value>,
}

#[async_trait]
pub trait ResourceDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Create the backend resource and return its id.
    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<String, DriverError>;

    /// Whether the resource is usable, waiting at most `timeout`.
    async fn is_ready(&self, resource_id: &str, timeout: Duration) -> Result<bool, DriverError>;

    /// Destroy the resource. Deprovisioning an absent resource succeeds.
    async fn deprovision(&self, resource_id: &str) -> Result<(), DriverError>;
}

// ---------------------------------------------------------------------------
// DriverRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under its own name, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn ResourceDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn with(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ResourceDriver>, FleetError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::Validation(format!("no driver registered as '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
