pub mod agents;
pub mod commands;
pub mod order;
pub mod progress;
pub mod run;
pub mod validate;

pub use commands::{Cli, Commands};
