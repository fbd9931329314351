pub mod action;
pub mod backoff;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod io;
pub mod lock;
pub mod paths;
pub mod policy;
pub mod store;
pub mod types;

pub use error::{FleetError, Result};
