/// Error types for the node, accounts and metrics
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Account error: {0}")]
    Account(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    /// A collector with this name is already registered in the registry.
    #[error("Metric already registered: {0}")]
    DuplicateRegistration(String),
}

impl From<prometheus::Error> for NodeError {
    fn from(err: prometheus::Error) -> Self {
        match err {
            prometheus::Error::AlreadyReg => {
                NodeError::DuplicateRegistration("collector already registered".to_string())
            }
            other => NodeError::Metrics(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
