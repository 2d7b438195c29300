use std::path::PathBuf;

use console::style;
use tracing::info;

use crate::agents::{AgentSummary, Health};
use crate::cli::commands::AgentsArgs;
use crate::config;
use crate::engine::Engine;
use crate::errors::MenderError;

pub async fn handle_agents(args: AgentsArgs) -> Result<(), MenderError> {
    let config_path = args.config.as_ref().map(PathBuf::from);
    let config = config::load_or_default(config_path.as_deref()).await?;
    let engine = Engine::from_config(config)?;

    let report = engine.reconciler().reconcile_once().await;
    info!(added = report.added.len(), "Registry read");
    engine.heartbeat().check_all().await;
    let agents = engine.pool().get_agents_summary().await;
    engine.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    if agents.is_empty() {
        println!("No agents registered in {}", engine.config().registry_path().display());
        return Ok(());
    }
    for agent in &agents {
        println!("{}", format_agent(agent));
    }
    Ok(())
}

fn format_agent(agent: &AgentSummary) -> String {
    let health = match agent.health {
        Health::Healthy => style(agent.health.as_str()).green(),
        Health::Stale => style(agent.health.as_str()).yellow(),
        Health::Disconnected => style(agent.health.as_str()).red(),
    };
    let endpoint = match (&agent.address, agent.port) {
        (Some(address), _) => address.clone(),
        (None, Some(port)) => format!("port {}", port),
        (None, None) => "-".to_string(),
    };
    let mut line = format!(
        "{:<24} {:<12} {:<20} {}",
        agent.instance_id, health, agent.project_name, endpoint
    );
    if let Some(role) = &agent.role {
        line.push_str(&format!("  [{}]", role));
    }
    if agent.busy {
        line.push_str(&format!("  {}", style("busy").dim()));
    }
    line
}
