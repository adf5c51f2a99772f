// ABOUTME: Agent execution strategies for drydock
// ABOUTME: One runner per agent variant behind a shared execute contract

pub mod claude;
pub mod codex;
pub mod connector;
pub mod opencode;
pub mod runner;
pub mod variant;

#[cfg(test)]
pub(crate) mod testsupport;

pub use claude::ClaudeRunner;
pub use codex::CodexRunner;
pub use connector::{Connector, ConnectorError, ConnectorStorage, ConnectorTransport};
pub use opencode::OpencodeRunner;
pub use runner::{
    AgentError, AgentExecutionResult, AgentRunner, ExecutionRequest, LineAssembler, LogSink,
};
pub use variant::{runner_for, AgentVariant, VariantError};
