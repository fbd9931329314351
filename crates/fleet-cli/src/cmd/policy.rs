use super::{open_engine, Opts};
use crate::output::{print_json, print_table, short};
use anyhow::Context;
use clap::Subcommand;
use fleet_core::policy::PolicySpec;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum PolicySubcommand {
    /// Create a policy from a YAML spec (`type: scaling|health|load_balance|placement|deletion`)
    Create {
        name: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// List policies
    List,
    /// Show a policy spec
    Show { policy: String },
}

pub fn run(root: &Path, subcmd: PolicySubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        PolicySubcommand::Create { name, file } => {
            let data = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let spec: PolicySpec = serde_yaml::from_str(&data)
                .with_context(|| format!("invalid policy spec {}", file.display()))?;
            let policy = engine
                .create_policy(&name, spec)
                .with_context(|| format!("failed to create policy '{name}'"))?;
            if opts.json {
                return print_json(&policy);
            }
            println!("policy {} ({}) {}", policy.name, policy.id, policy.kind());
            Ok(())
        }
        PolicySubcommand::List => {
            let policies = engine.store().list_policies()?;
            if opts.json {
                return print_json(&policies);
            }
            if policies.is_empty() {
                println!("No policies.");
                return Ok(());
            }
            let rows = policies
                .iter()
                .map(|p| vec![p.name.clone(), short(&p.id), p.kind().to_string()])
                .collect();
            print_table(&["NAME", "ID", "TYPE"], rows);
            Ok(())
        }
        PolicySubcommand::Show { policy } => {
            let policy = engine.store().find_policy(&policy)?;
            if opts.json {
                return print_json(&policy);
            }
            println!("Policy: {} ({})", policy.name, policy.id);
            print!("{}", serde_yaml::to_string(&policy.spec)?);
            Ok(())
        }
    }
}
