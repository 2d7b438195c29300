use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::cli::commands::RunArgs;
use crate::cli::progress::RunProgress;
use crate::config;
use crate::engine::Engine;
use crate::errors::MenderError;
use crate::pipeline::{FailureInput, FailureStatus};

pub async fn handle_run(args: RunArgs, quiet: bool) -> Result<FailureStatus, MenderError> {
    let config_path = args.config.as_ref().map(PathBuf::from);
    let config = config::load_or_default(config_path.as_deref()).await?;
    let input = read_failure(Path::new(&args.failure), args.project.as_deref()).await?;

    let engine = Engine::from_config(config)?;
    let mut events = engine.broadcaster().subscribe();
    engine.start().await;

    let status = drive(&engine, &args, input, &mut events, quiet).await;
    engine.shutdown().await;
    let (failure_id, status) = status?;

    if let Some(failure) = engine.executor().get_failure(&failure_id) {
        println!("{}", serde_json::to_string_pretty(&failure)?);
    }
    Ok(status)
}

async fn drive(
    engine: &Engine,
    args: &RunArgs,
    input: FailureInput,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<crate::events::Event>,
    quiet: bool,
) -> Result<(String, FailureStatus), MenderError> {
    let executor = engine.executor();
    executor
        .set_active_workflow(&args.workflow, args.project.clone())
        .await?;

    if !engine
        .wait_for_agents(Duration::from_secs(args.wait_agents))
        .await
    {
        warn!(
            waited_secs = args.wait_agents,
            "No agent connected, prompt steps will fail"
        );
    }

    let failure = executor.create_failure(input);
    executor.queue_failure(&failure.id, None)?;
    info!(failure_id = %failure.id, workflow_id = %args.workflow, "Run queued");

    let mut progress = RunProgress::new(&failure.id, quiet);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.abandon("Interrupted");
                return Err(MenderError::Internal("interrupted".into()));
            }
            event = events.recv() => {
                let Some(event) = event else {
                    progress.abandon("Event stream closed");
                    return Err(MenderError::Internal("event stream closed".into()));
                };
                if let Some(status) = progress.handle_event(&event) {
                    return Ok((failure.id, status));
                }
            }
        }
    }
}

/// Failure JSON from disk. `--project` fills `context.project_path` when the
/// file does not name one.
async fn read_failure(path: &Path, project: Option<&str>) -> Result<FailureInput, MenderError> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut input: FailureInput = serde_json::from_str(&content)?;
    if let Some(project) = project {
        let named = ["project_path", "projectPath"]
            .iter()
            .any(|key| input.context.contains_key(*key));
        if !named {
            input
                .context
                .insert("project_path".into(), Value::String(project.to_string()));
        }
    }
    Ok(input)
}
