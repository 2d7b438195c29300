pub mod types;
pub mod classification;

pub use types::MenderError;
pub use classification::ErrorClassification;
