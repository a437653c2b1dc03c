// Agents Module - registry of agent presence, status, and capabilities

pub mod registry;
pub mod types;

pub use registry::AgentRegistry;
pub use types::{AgentRecord, AgentStatus};
