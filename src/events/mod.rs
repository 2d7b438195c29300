pub mod broadcaster;
pub mod types;

pub use broadcaster::Broadcaster;
pub use types::{ActivityEvent, Event};
