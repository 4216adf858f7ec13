//! Job error types.

use thiserror::Error;

use crate::rpc::RpcError;
use crate::types::items::ItemType;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Job '{job_name}' failed: {message}")]
    JobFailed { job_name: String, message: String },

    /// Data the node should have returned is not there yet.
    #[error("Missing required data: {0}")]
    MissingData(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Job '{job_name}' depends on '{item_type}', which no registered job produces")]
    UnresolvedDependency { job_name: String, item_type: ItemType },

    #[error("No registered job produces required output '{0}'")]
    NoProducer(ItemType),

    #[error("Dependency cycle between jobs: {0}")]
    DependencyCycle(String),
}

impl JobError {
    pub fn failed(name: &str, message: impl Into<String>) -> Self {
        Self::JobFailed {
            job_name: name.to_string(),
            message: message.into(),
        }
    }

    /// Worth re-running the batch for.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Rpc(e) => e.is_retryable(),
            JobError::MissingData(_) => true,
            _ => false,
        }
    }
}
