//! Core of the AgentGate tool-orchestration substrate: configuration, the
//! tool-server registry, the resilience middleware pipeline, the
//! gateway-wrapped LLM coupling, the single-turn agent and its activity
//! log, and graceful shutdown.

pub mod activity_log;
pub mod agent;
pub mod cache;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod metrics;
pub mod rate_limit;
pub mod resilience;
pub mod shutdown;
mod truncate;

pub use activity_log::ActionKind;
pub use activity_log::AgentAction;
pub use activity_log::SessionLog;
pub use agent::Agent;
pub use agent::AgentConfig;
pub use agent::AgentTurn;
pub use agent::NoRetrieval;
pub use config::GatewayConfig;
pub use connection_manager::ConnectionManager;
pub use connection_manager::ServerStatus;
pub use connection_manager::ToolDescriptor;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use gateway::GatewayOptions;
pub use llm::ResilientGenerator;
pub use shutdown::CleanupRegistry;
