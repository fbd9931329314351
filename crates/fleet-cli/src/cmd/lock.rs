use super::{open_engine, Opts};
use crate::output::{lease_left, print_json, print_table, short};
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum LockSubcommand {
    /// List held locks and their leases
    List,
}

pub fn run(root: &Path, subcmd: LockSubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        LockSubcommand::List => {
            let locks = engine.locks().list()?;
            if opts.json {
                return print_json(&locks);
            }
            if locks.is_empty() {
                println!("No locks held.");
                return Ok(());
            }
            let now = Utc::now();
            let rows = locks
                .iter()
                .map(|l| {
                    vec![
                        l.resource_type.to_string(),
                        short(&l.resource_id),
                        short(&l.holder_action.to_string()),
                        l.holder_engine.clone(),
                        lease_left(l, now),
                    ]
                })
                .collect();
            print_table(&["TYPE", "RESOURCE", "ACTION", "ENGINE", "LEASE"], rows);
            Ok(())
        }
    }
}
