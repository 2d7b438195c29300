use std::path::PathBuf;

use crate::cli::commands::ValidateArgs;
use crate::config;
use crate::errors::MenderError;

pub async fn handle_validate(args: ValidateArgs) -> Result<(), MenderError> {
    let path = PathBuf::from(&args.config);
    let config = config::parse_config(&path).await?;
    println!("Configuration is valid: {}", args.config);
    println!("  registry: {}", config.registry_path().display());
    println!("  storage:  {}", config.storage.home_dir().display());
    Ok(())
}
