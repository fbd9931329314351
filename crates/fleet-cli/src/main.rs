mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    action::ActionSubcommand, cluster::ClusterSubcommand, config::ConfigSubcommand,
    engine::EngineSubcommand, lock::LockSubcommand, node::NodeSubcommand,
    policy::PolicySubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fleet",
    about = "Cluster lifecycle engine: submit, run and inspect cluster actions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .fleet/)
    #[arg(long, global = true, env = "FLEET_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// After submitting, run the engine in-process until it goes idle
    #[arg(long, global = true)]
    wait: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a fleet workspace in the current directory
    Init,

    /// Manage clusters and submit cluster actions
    Cluster {
        #[command(subcommand)]
        subcommand: ClusterSubcommand,
    },

    /// Inspect nodes and submit node actions
    Node {
        #[command(subcommand)]
        subcommand: NodeSubcommand,
    },

    /// Manage policies
    Policy {
        #[command(subcommand)]
        subcommand: PolicySubcommand,
    },

    /// Inspect and cancel actions
    Action {
        #[command(subcommand)]
        subcommand: ActionSubcommand,
    },

    /// Inspect resource locks
    Lock {
        #[command(subcommand)]
        subcommand: LockSubcommand,
    },

    /// Run the dispatcher
    Engine {
        #[command(subcommand)]
        subcommand: EngineSubcommand,
    },

    /// Show or validate the engine configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Engine { .. } => tracing::Level::INFO,
        _ if cli.wait => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref(), matches!(cli.command, Commands::Init));
    let opts = cmd::Opts {
        json: cli.json,
        wait: cli.wait,
    };

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Cluster { subcommand } => cmd::cluster::run(&root, subcommand, opts),
        Commands::Node { subcommand } => cmd::node::run(&root, subcommand, opts),
        Commands::Policy { subcommand } => cmd::policy::run(&root, subcommand, opts),
        Commands::Action { subcommand } => cmd::action::run(&root, subcommand, opts),
        Commands::Lock { subcommand } => cmd::lock::run(&root, subcommand, opts),
        Commands::Engine { subcommand } => cmd::engine::run(&root, subcommand, opts),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, opts),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
