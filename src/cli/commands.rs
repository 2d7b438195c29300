use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    long_version = env!("MENDER_LONG_VERSION"),
    about = "Drive a fleet of coding agents through test-failure remediation workflows"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow against one reported test failure
    Run(RunArgs),
    /// Show the agents listed in the registry and their health
    Agents(AgentsArgs),
    /// Print the execution order of a workflow file
    Order(OrderArgs),
    /// Validate a configuration file
    Validate(ValidateArgs),
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Workflow id (file stem or embedded name)
    #[arg(short, long)]
    pub workflow: String,

    /// JSON file describing the failure
    #[arg(short, long)]
    pub failure: String,

    /// Project the failure belongs to
    #[arg(short, long)]
    pub project: Option<String>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds to wait for a connected agent before running
    #[arg(long, default_value = "15")]
    pub wait_agents: u64,
}

#[derive(Args, Clone)]
pub struct AgentsArgs {
    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone)]
pub struct OrderArgs {
    /// Workflow JSON file
    pub workflow: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone)]
pub struct ValidateArgs {
    /// Config file to validate
    pub config: String,
}
