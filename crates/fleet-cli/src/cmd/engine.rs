use super::{block_on, open_engine, Opts};
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Subcommand)]
pub enum EngineSubcommand {
    /// Run the worker pool over the persisted queue
    Run {
        /// Exit once nothing is queued or running
        #[arg(long)]
        until_idle: bool,
        /// Give up after this many seconds (with --until-idle)
        #[arg(long, default_value = "600")]
        timeout: u64,
    },
    /// Sweep expired lock leases once and settle their orphaned actions
    Reclaim,
}

pub fn run(root: &Path, subcmd: EngineSubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        EngineSubcommand::Run {
            until_idle: true,
            timeout,
        } => {
            block_on(engine.run_until_idle(Duration::from_secs(timeout)))?
                .context("engine did not go idle")?;
            println!("idle");
            Ok(())
        }
        EngineSubcommand::Run { .. } => block_on(async {
            let handle = engine.start()?;
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!(engine = %engine.id(), "shutting down");
            handle.shutdown().await;
            anyhow::Ok(())
        })?,
        EngineSubcommand::Reclaim => {
            let report = engine.reclaim().context("lease sweep failed")?;
            if opts.json {
                return print_json(&report);
            }
            if report.is_empty() {
                println!("Nothing to reclaim.");
                return Ok(());
            }
            for id in &report.requeued {
                println!("requeued {id}");
            }
            for id in &report.failed {
                println!("failed   {id}");
            }
            Ok(())
        }
    }
}
