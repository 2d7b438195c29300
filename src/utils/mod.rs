pub mod fs;
pub mod truncation;
