use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mcp error: {0}")]
    Mcp(#[from] crate::mcp::McpError),

    #[error("Generation error: {0}")]
    Generation(#[from] crate::codegen::GenerationError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Session store error: {0}")]
    Store(#[from] crate::session::SessionStoreError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::agent::OrchestratorError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::tool::ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
