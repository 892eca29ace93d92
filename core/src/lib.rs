//! Tool orchestration core for an MCP agent host: subprocess supervision,
//! a security gate, and concurrency-bounded routing behind a single
//! [`Orchestrator`] facade.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{HealthReport, Orchestrator, ProviderKind, SecurityGate};
pub use config::{OrchestratorConfig, RouterConfig, ServerManagerConfig};
pub use domain::{
    OrchestratorError, OrchestratorResult, ParameterType, PermissionLevel, Provider, SecurityPolicy,
    ServerState, ServerStatus, Tool, ToolCall, ToolContent, ToolParameter, ToolResult, TrustLevel,
};
pub use infrastructure::{ExternalProvider, ExternalServerConfig, HandlerFn, InternalProvider, ServerManager};
