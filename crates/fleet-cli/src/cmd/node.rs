use super::{open_engine, submitted, Opts};
use crate::output::{or_dash, print_json, print_table, short};
use anyhow::Context;
use clap::Subcommand;
use fleet_core::engine::{Engine, Submission};
use fleet_core::types::ActionKind;
use std::path::Path;

#[derive(Subcommand)]
pub enum NodeSubcommand {
    /// List nodes, optionally only the members of one cluster
    List {
        #[arg(long)]
        cluster: Option<String>,
    },
    /// Show a node and what it has provisioned
    Show { node: String },
    /// Tear a node down
    Delete {
        node: String,
        /// Seconds to wait before deprovisioning
        #[arg(long)]
        grace_period: Option<u64>,
    },
    /// Probe a node's resources
    Check { node: String },
    /// Rebuild a node's resources
    Recover { node: String },
    /// Rebuild a node from its cluster's current profile
    Update { node: String },
    /// Adopt an unowned node into a cluster
    Join {
        node: String,
        #[arg(long)]
        cluster: String,
    },
    /// Detach a node from its cluster without deprovisioning it
    Leave { node: String },
}

pub fn run(root: &Path, subcmd: NodeSubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        NodeSubcommand::List { cluster } => list(&engine, cluster.as_deref(), opts),
        NodeSubcommand::Show { node } => show(&engine, &node, opts),
        NodeSubcommand::Delete { node, grace_period } => {
            let mut req = Submission::new(ActionKind::NodeDelete, &node);
            if let Some(grace) = grace_period {
                req = req.input("grace_period", grace);
            }
            submit(&engine, req, opts)
        }
        NodeSubcommand::Check { node } => {
            submit(&engine, Submission::new(ActionKind::NodeCheck, &node), opts)
        }
        NodeSubcommand::Recover { node } => {
            submit(&engine, Submission::new(ActionKind::NodeRecover, &node), opts)
        }
        NodeSubcommand::Update { node } => {
            submit(&engine, Submission::new(ActionKind::NodeUpdate, &node), opts)
        }
        NodeSubcommand::Join { node, cluster } => submit(
            &engine,
            Submission::new(ActionKind::NodeJoin, &node).input("cluster", cluster),
            opts,
        ),
        NodeSubcommand::Leave { node } => {
            submit(&engine, Submission::new(ActionKind::NodeLeave, &node), opts)
        }
    }
}

fn submit(engine: &Engine, req: Submission, opts: Opts) -> anyhow::Result<()> {
    let kind = req.kind;
    let id = engine
        .submit_request(req)
        .with_context(|| format!("{kind} rejected"))?;
    submitted(engine, id, opts)
}

fn list(engine: &Engine, cluster: Option<&str>, opts: Opts) -> anyhow::Result<()> {
    let store = engine.store();
    let nodes = match cluster {
        Some(name) => {
            let cluster = store.find_cluster(name)?;
            store.cluster_nodes(&cluster.id)?
        }
        None => store.list_nodes()?,
    };
    if opts.json {
        return print_json(&nodes);
    }
    if nodes.is_empty() {
        println!("No nodes.");
        return Ok(());
    }
    let rows = nodes
        .iter()
        .map(|n| {
            vec![
                n.id.clone(),
                n.name.clone(),
                or_dash(n.cluster_id.as_deref().map(short)),
                n.status.to_string(),
                n.status_reason.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "CLUSTER", "STATUS", "REASON"], rows);
    Ok(())
}

fn show(engine: &Engine, id: &str, opts: Opts) -> anyhow::Result<()> {
    let node = engine.store().node(id)?;
    if opts.json {
        return print_json(&node);
    }
    println!("Node:    {} ({})", node.name, node.id);
    println!("Cluster: {}", or_dash(node.cluster_id.as_deref()));
    println!("Status:  {} {}", node.status, node.status_reason);
    if let Some(zone) = &node.zone {
        println!("Zone:    {zone}");
    }
    if node.resources.is_empty() {
        return Ok(());
    }
    println!();
    let rows = node
        .resources
        .iter()
        .map(|r| vec![r.step.clone(), r.driver.clone(), r.resource_id.clone()])
        .collect();
    print_table(&["STEP", "DRIVER", "RESOURCE"], rows);
    Ok(())
}
