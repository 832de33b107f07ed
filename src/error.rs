use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event stream error: {0}")]
    EventStream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// True for cluster-API failures where the target object no longer exists.
    /// Delete paths treat these as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            ExecutorError::Kubernetes(kube::Error::Api(response)) => response.code == 404,
            ExecutorError::Grpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
