pub mod action;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod init;
pub mod lock;
pub mod node;
pub mod policy;

use crate::output::{print_json, print_table, short};
use anyhow::Context;
use fleet_core::action::Action;
use fleet_core::config::Config;
use fleet_core::driver::{DriverRegistry, SimDriver};
use fleet_core::engine::Engine;
use fleet_core::paths;
use fleet_core::store::Store;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Copy)]
pub struct Opts {
    pub json: bool,
    pub wait: bool,
}

/// How long `--wait` lets the engine run before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(600);

/// Open the workspace store and build an engine over it. Only the sim
/// driver is built in.
pub fn open_engine(root: &Path) -> anyhow::Result<Engine> {
    let config = Config::load(root).context("failed to load config")?;
    let store = Store::open(&paths::db_path(root)).context("failed to open store")?;
    let drivers = DriverRegistry::new().with(Arc::new(SimDriver::default()));
    Ok(Engine::new(store, drivers, config.engine))
}

pub fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(rt.block_on(future))
}

/// Drain the queue in-process.
pub fn drain(engine: &Engine) -> anyhow::Result<()> {
    block_on(engine.run_until_idle(WAIT_LIMIT))?.context("engine did not go idle")?;
    Ok(())
}

/// Report a freshly submitted action, running it first with `--wait`.
pub fn submitted(engine: &Engine, id: Uuid, opts: Opts) -> anyhow::Result<()> {
    if opts.wait {
        drain(engine)?;
    }
    let action = engine.get(id)?;
    if opts.json {
        print_json(&action)?;
    } else {
        println!("{} {} {}", action.id, action.kind, action.status);
        if !action.status_reason.is_empty() {
            println!("  {}", action.status_reason);
        }
    }
    Ok(())
}

pub fn action_rows(actions: &[Action]) -> Vec<Vec<String>> {
    actions
        .iter()
        .map(|a| {
            vec![
                short(&a.id.to_string()),
                a.kind.to_string(),
                short(&a.target),
                a.status.to_string(),
                a.cause.to_string(),
                a.status_reason.clone(),
            ]
        })
        .collect()
}

pub fn print_actions(actions: &[Action]) {
    print_table(
        &["ID", "KIND", "TARGET", "STATUS", "CAUSE", "REASON"],
        action_rows(actions),
    );
}
