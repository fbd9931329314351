use super::{open_engine, submitted, Opts};
use crate::output::{or_dash, print_json, print_table, short, size_bounds};
use anyhow::Context;
use clap::Subcommand;
use fleet_core::cluster::Profile;
use fleet_core::engine::{Engine, Submission};
use fleet_core::types::ActionKind;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ClusterSubcommand {
    /// Register a cluster and build its initial nodes
    Create {
        name: String,
        /// Provisioning profile (YAML); defaults to one sim "server" step
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long, default_value = "0")]
        min_size: u32,
        #[arg(long)]
        max_size: Option<u32>,
        #[arg(long, default_value = "0")]
        desired: u32,
    },
    /// List clusters
    List,
    /// Show a cluster, its members and its policy bindings
    Show { cluster: String },
    /// Add nodes
    ScaleOut {
        cluster: String,
        /// Nodes to add (default: decided by the scaling policy, else 1)
        #[arg(long)]
        count: Option<u64>,
    },
    /// Remove nodes
    ScaleIn {
        cluster: String,
        #[arg(long)]
        count: Option<u64>,
    },
    /// Change the desired capacity and/or size bounds
    Resize {
        cluster: String,
        /// EXACT_CAPACITY, CHANGE_IN_CAPACITY or CHANGE_IN_PERCENTAGE
        #[arg(long = "type", value_name = "TYPE")]
        adjustment_type: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        number: Option<f64>,
        #[arg(long)]
        min_step: Option<u32>,
        #[arg(long)]
        min_size: Option<u32>,
        #[arg(long)]
        max_size: Option<u32>,
        /// Clamp the target into the bounds instead of rejecting it
        #[arg(long)]
        loose: bool,
    },
    /// Adopt existing unowned nodes
    AddNodes {
        cluster: String,
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Remove specific member nodes
    DelNodes {
        cluster: String,
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Replace member nodes with freshly built ones
    ReplaceNodes {
        cluster: String,
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Rebuild every member from a new profile
    Update {
        cluster: String,
        #[arg(long)]
        profile: PathBuf,
    },
    /// Health-check every member
    Check { cluster: String },
    /// Rebuild members in error (or the listed ones)
    Recover {
        cluster: String,
        nodes: Vec<String>,
    },
    /// Tear down every member and delete the cluster
    Delete { cluster: String },
    /// Attach a policy
    Attach {
        cluster: String,
        policy: String,
        #[arg(long)]
        priority: Option<u32>,
        /// Attach without enabling it
        #[arg(long)]
        disabled: bool,
    },
    /// Detach a policy
    Detach { cluster: String, policy: String },
    /// Change the priority or enabled flag of an attached policy
    UpdatePolicy {
        cluster: String,
        policy: String,
        #[arg(long)]
        priority: Option<u32>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

pub fn run(root: &Path, subcmd: ClusterSubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        ClusterSubcommand::Create {
            name,
            profile,
            min_size,
            max_size,
            desired,
        } => create(&engine, &name, profile.as_deref(), min_size, max_size, desired, opts),
        ClusterSubcommand::List => list(&engine, opts),
        ClusterSubcommand::Show { cluster } => show(&engine, &cluster, opts),
        ClusterSubcommand::ScaleOut { cluster, count } => {
            let inputs = count.map(|n| json!({ "count": n })).unwrap_or(json!({}));
            submit(&engine, ActionKind::ClusterScaleOut, &cluster, inputs, opts)
        }
        ClusterSubcommand::ScaleIn { cluster, count } => {
            let inputs = count.map(|n| json!({ "count": n })).unwrap_or(json!({}));
            submit(&engine, ActionKind::ClusterScaleIn, &cluster, inputs, opts)
        }
        ClusterSubcommand::Resize {
            cluster,
            adjustment_type,
            number,
            min_step,
            min_size,
            max_size,
            loose,
        } => {
            let inputs = json!({
                "adjustment_type": adjustment_type,
                "number": number,
                "min_step": min_step,
                "min_size": min_size,
                "max_size": max_size,
                "strict": !loose,
            });
            submit(&engine, ActionKind::ClusterResize, &cluster, strip_nulls(inputs), opts)
        }
        ClusterSubcommand::AddNodes { cluster, nodes } => submit(
            &engine,
            ActionKind::ClusterAddNodes,
            &cluster,
            json!({ "nodes": nodes }),
            opts,
        ),
        ClusterSubcommand::DelNodes { cluster, nodes } => submit(
            &engine,
            ActionKind::ClusterDelNodes,
            &cluster,
            json!({ "nodes": nodes }),
            opts,
        ),
        ClusterSubcommand::ReplaceNodes { cluster, nodes } => submit(
            &engine,
            ActionKind::ClusterReplaceNodes,
            &cluster,
            json!({ "nodes": nodes }),
            opts,
        ),
        ClusterSubcommand::Update { cluster, profile } => {
            let profile = read_profile(&profile)?;
            submit(
                &engine,
                ActionKind::ClusterUpdate,
                &cluster,
                json!({ "profile": profile }),
                opts,
            )
        }
        ClusterSubcommand::Check { cluster } => {
            submit(&engine, ActionKind::ClusterCheck, &cluster, json!({}), opts)
        }
        ClusterSubcommand::Recover { cluster, nodes } => {
            let inputs = if nodes.is_empty() {
                json!({})
            } else {
                json!({ "nodes": nodes })
            };
            submit(&engine, ActionKind::ClusterRecover, &cluster, inputs, opts)
        }
        ClusterSubcommand::Delete { cluster } => {
            submit(&engine, ActionKind::ClusterDelete, &cluster, json!({}), opts)
        }
        ClusterSubcommand::Attach {
            cluster,
            policy,
            priority,
            disabled,
        } => {
            let inputs = json!({ "policy": policy, "priority": priority, "enabled": !disabled });
            submit(&engine, ActionKind::ClusterAttachPolicy, &cluster, strip_nulls(inputs), opts)
        }
        ClusterSubcommand::Detach { cluster, policy } => submit(
            &engine,
            ActionKind::ClusterDetachPolicy,
            &cluster,
            json!({ "policy": policy }),
            opts,
        ),
        ClusterSubcommand::UpdatePolicy {
            cluster,
            policy,
            priority,
            enabled,
        } => {
            let inputs = json!({ "policy": policy, "priority": priority, "enabled": enabled });
            submit(&engine, ActionKind::ClusterUpdatePolicy, &cluster, strip_nulls(inputs), opts)
        }
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => other,
    }
}

fn read_profile(path: &Path) -> anyhow::Result<Profile> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("invalid profile {}", path.display()))
}

fn submit(engine: &Engine, kind: ActionKind, cluster: &str, inputs: Value, opts: Opts) -> anyhow::Result<()> {
    let inputs: Map<String, Value> = match inputs {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let id = engine
        .submit_request(Submission::new(kind, cluster).inputs(inputs))
        .with_context(|| format!("{kind} rejected"))?;
    submitted(engine, id, opts)
}

// ---------------------------------------------------------------------------
// create / list / show
// ---------------------------------------------------------------------------

fn create(
    engine: &Engine,
    name: &str,
    profile: Option<&Path>,
    min_size: u32,
    max_size: Option<u32>,
    desired: u32,
    opts: Opts,
) -> anyhow::Result<()> {
    let profile = match profile {
        Some(path) => read_profile(path)?,
        None => Profile::default(),
    };
    let (cluster, action) = engine
        .create_cluster(name, profile, min_size, max_size, desired)
        .with_context(|| format!("failed to create cluster '{name}'"))?;
    if !opts.json {
        println!("cluster {} ({})", cluster.name, cluster.id);
    }
    submitted(engine, action, opts)
}

fn list(engine: &Engine, opts: Opts) -> anyhow::Result<()> {
    let clusters = engine.store().list_clusters()?;
    if opts.json {
        return print_json(&clusters);
    }
    if clusters.is_empty() {
        println!("No clusters.");
        return Ok(());
    }
    let rows = clusters
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                short(&c.id),
                c.status.to_string(),
                c.desired_capacity.to_string(),
                size_bounds(c.min_size, c.max_size),
            ]
        })
        .collect();
    print_table(&["NAME", "ID", "STATUS", "DESIRED", "BOUNDS"], rows);
    Ok(())
}

fn show(engine: &Engine, name: &str, opts: Opts) -> anyhow::Result<()> {
    let store = engine.store();
    let cluster = store.find_cluster(name)?;
    let nodes = store.cluster_nodes(&cluster.id)?;
    let bindings = store.bindings(&cluster.id)?;
    if opts.json {
        return print_json(&json!({
            "cluster": cluster,
            "nodes": nodes,
            "bindings": bindings,
        }));
    }

    println!("Cluster: {} ({})", cluster.name, cluster.id);
    println!("Status:  {} {}", cluster.status, cluster.status_reason);
    println!(
        "Size:    desired {} within {}",
        cluster.desired_capacity,
        size_bounds(cluster.min_size, cluster.max_size)
    );
    let steps: Vec<&str> = cluster.profile.steps.iter().map(|s| s.name.as_str()).collect();
    println!("Profile: {}", steps.join(" -> "));

    println!();
    let rows = nodes
        .iter()
        .map(|n| {
            vec![
                n.name.clone(),
                n.id.clone(),
                n.status.to_string(),
                or_dash(n.zone.as_deref()),
                n.resources.len().to_string(),
            ]
        })
        .collect();
    print_table(&["NODE", "ID", "STATUS", "ZONE", "RESOURCES"], rows);

    if !bindings.is_empty() {
        println!();
        let rows = bindings
            .iter()
            .map(|b| {
                let name = store
                    .policy(&b.policy_id)
                    .map(|p| p.name)
                    .unwrap_or_else(|_| b.policy_id.clone());
                vec![name, b.priority.to_string(), b.enabled.to_string()]
            })
            .collect();
        print_table(&["POLICY", "PRIORITY", "ENABLED"], rows);
    }
    Ok(())
}
