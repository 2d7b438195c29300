pub mod agents;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod utils;
pub mod workflow;

pub use engine::Engine;
pub use errors::MenderError;
