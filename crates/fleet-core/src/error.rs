use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not initialized: run 'fleet init'")]
    NotInitialized,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid cluster name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidName(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("resource {resource} is locked by action {holder}")]
    LockConflict { resource: String, holder: String },

    #[error("lock on {resource} is not held by action {action}")]
    LockNotHeld { resource: String, action: String },

    #[error("policy '{policy}' rejected the action: {reason}")]
    PolicyAbort { policy: String, reason: String },

    #[error("priority {priority} is already used on cluster {cluster}")]
    PriorityConflict { cluster: String, priority: u32 },

    #[error("dependency cycle detected: {0}")]
    CyclicDependency(String),

    #[error("backend unavailable: {0}")]
    DriverTransient(String),

    #[error("backend failure: {0}")]
    DriverFatal(String),

    #[error("deadline of {0}s exceeded")]
    Timeout(u64),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
