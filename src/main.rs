use clap::Parser;
use mender::cli::{self, Commands};
use mender::errors::MenderError;
use mender::pipeline::FailureStatus;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Initialize logging
    let log_level = match (cli.quiet, cli.verbose) {
        (true, 0) => "warn",
        (_, 0) => "info",
        (_, 1) => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(!cli.no_color)
            .with_writer(std::io::stderr)
            .init();
    }
    if cli.no_color {
        console::set_colors_enabled(false);
    }

    let result = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, cli.quiet).await.map(|status| match status {
            FailureStatus::Completed => 0,
            _ => 4,
        }),
        Commands::Agents(args) => cli::agents::handle_agents(args).await.map(|_| 0),
        Commands::Order(args) => cli::order::handle_order(args).await.map(|_| 0),
        Commands::Validate(args) => cli::validate::handle_validate(args).await.map(|_| 0),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            let exit_code = match &e {
                MenderError::Config(_) | MenderError::Yaml(_) => 2,
                MenderError::WorkflowNotFound(_) => 3,
                _ => 1,
            };
            std::process::exit(exit_code);
        }
    }
}
