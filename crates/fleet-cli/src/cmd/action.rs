use super::{open_engine, print_actions, submitted, Opts};
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use fleet_core::action::{ActionFilter, ActionStatus};
use fleet_core::engine::{Engine, Submission};
use fleet_core::types::{ActionKind, Cause};
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum ActionSubcommand {
    /// Submit any action by kind
    Submit {
        /// Action kind, e.g. CLUSTER_SCALE_OUT or node-check
        kind: String,
        /// Cluster name/id or node id
        target: String,
        /// Input as key=value; the value is parsed as JSON when it can be
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Higher runs first
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
        /// Overrides engine.default_action_timeout_secs
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show one action
    Get { id: Uuid },
    /// List actions
    List {
        #[arg(long)]
        status: Option<String>,
        /// Only actions targeting this cluster
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        /// user or derived
        #[arg(long)]
        cause: Option<String>,
        /// Only the children of this action
        #[arg(long)]
        parent: Option<Uuid>,
    },
    /// Request cancellation
    Cancel { id: Uuid },
}

pub fn run(root: &Path, subcmd: ActionSubcommand, opts: Opts) -> anyhow::Result<()> {
    let engine = open_engine(root)?;
    match subcmd {
        ActionSubcommand::Submit {
            kind,
            target,
            inputs,
            priority,
            timeout,
        } => submit(&engine, &kind, &target, &inputs, priority, timeout, opts),
        ActionSubcommand::Get { id } => get(&engine, id, opts),
        ActionSubcommand::List {
            status,
            cluster,
            kind,
            cause,
            parent,
        } => {
            let mut filter = ActionFilter {
                parent,
                ..ActionFilter::default()
            };
            if let Some(s) = status {
                filter.status = Some(s.parse::<ActionStatus>()?);
            }
            if let Some(k) = kind {
                filter.kind = Some(k.parse::<ActionKind>()?);
            }
            if let Some(c) = cause {
                filter.cause = Some(c.parse::<Cause>()?);
            }
            if let Some(name) = cluster {
                filter.target = Some(engine.store().find_cluster(&name)?.id);
            }
            list(&engine, &filter, opts)
        }
        ActionSubcommand::Cancel { id } => cancel(&engine, id, opts),
    }
}

/// Split `key=value`, reading the value as JSON and falling back to a plain
/// string.
fn parse_input(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{raw}' is not KEY=VALUE"))?;
    if key.is_empty() {
        anyhow::bail!("input '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn submit(
    engine: &Engine,
    kind: &str,
    target: &str,
    raw_inputs: &[String],
    priority: i32,
    timeout: Option<u64>,
    opts: Opts,
) -> anyhow::Result<()> {
    let kind: ActionKind = kind.parse()?;
    let mut inputs = Map::new();
    for raw in raw_inputs {
        let (key, value) = parse_input(raw)?;
        inputs.insert(key, value);
    }
    let mut req = Submission::new(kind, target).inputs(inputs).priority(priority);
    if let Some(secs) = timeout {
        req = req.timeout_secs(secs);
    }
    let id = engine
        .submit_request(req)
        .with_context(|| format!("{kind} rejected"))?;
    submitted(engine, id, opts)
}

fn get(engine: &Engine, id: Uuid, opts: Opts) -> anyhow::Result<()> {
    let action = engine.get(id)?;
    if opts.json {
        return print_json(&action);
    }
    println!("Action:  {} ({})", action.id, action.name);
    println!("Kind:    {}", action.kind);
    println!("Target:  {} {}", action.target_type, action.target);
    println!("Status:  {} {}", action.status, action.status_reason);
    println!("Cause:   {}", action.cause);
    if let Some(parent) = action.parent {
        println!("Parent:  {parent}");
    }
    if let Some(owner) = &action.owner {
        println!("Owner:   {owner}");
    }
    if !action.depends_on.is_empty() {
        println!("Waits on {} action(s), {} pending", action.depends_on.len(), action.pending);
    }
    if !action.outputs.is_empty() {
        println!("Outputs: {}", Value::Object(action.outputs.clone()));
    }
    Ok(())
}

fn list(engine: &Engine, filter: &ActionFilter, opts: Opts) -> anyhow::Result<()> {
    let actions = engine.list(filter)?;
    if opts.json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No actions.");
        return Ok(());
    }
    print_actions(&actions);
    Ok(())
}

fn cancel(engine: &Engine, id: Uuid, opts: Opts) -> anyhow::Result<()> {
    let action = engine
        .cancel(id)
        .with_context(|| format!("cannot cancel {id}"))?;
    if opts.json {
        return print_json(&action);
    }
    println!("{} {} {}", action.id, action.kind, action.status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_parse_as_json_or_string() {
        assert_eq!(parse_input("count=3").unwrap(), ("count".into(), Value::from(3)));
        assert_eq!(
            parse_input("strict=false").unwrap(),
            ("strict".into(), Value::Bool(false))
        );
        assert_eq!(
            parse_input("adjustment_type=EXACT_CAPACITY").unwrap(),
            ("adjustment_type".into(), Value::from("EXACT_CAPACITY"))
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=1").is_err());
    }
}
