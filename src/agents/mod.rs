pub mod connection;
pub mod heartbeat;
pub mod pool;
pub mod protocol;

pub use connection::{AgentConnection, AgentStatus, Health};
pub use heartbeat::{next_health, HeartbeatMonitor};
pub use pool::{AgentPool, AgentSummary, HandoffReply};
pub use protocol::PromptResponse;
